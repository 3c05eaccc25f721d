//! Length-prefixed bincode frames over byte streams.
//!
//! Each frame is a big-endian `u32` payload length followed by the bincode
//! payload. Worker processes read [`Task`](super::message::Task) frames on
//! stdin and write [`Report`](super::message::Report) frames on stdout.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SolverError};

/// Largest accepted payload.
pub const MAX_FRAME_BYTES: u32 = 1 << 30;

/// Write one frame and flush.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| SolverError::Protocol(format!("frame of {} bytes is too large", payload.len())))?;
    writer.write_u32::<BE>(len)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let len = match reader.read_u32::<BE>() {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(SolverError::Protocol(format!("frame length {len} exceeds limit")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|err| SolverError::Protocol(format!("truncated frame: {err}")))?;
    Ok(Some(bincode::deserialize(&payload)?))
}
