//! Canonical, versioned information-set keys.
//!
//! A key is `(version, street, bucket, seat, history)`. The version takes
//! part in equality so keys from incompatible encodings never collide, and
//! decoding a key from another version fails loudly instead of misparsing.
//!
//! String form: `"{version}:{street}:{bucket}:{seat}:{history}"`, e.g.
//! `1:1:37:0:cb0c/c`. History tokens render as `f` (fold), `c` (check or
//! call), `b{k}` (bet/raise of size bucket `k`), `a` (all-in) and `/`
//! (street boundary).
//!
//! Byte form: `[version, street, bucket_lo, bucket_hi, seat, len, tokens..]`
//! with token bytes `0` fold, `1` passive, `2` all-in, `3` deal and
//! `0x10 + k` for bets.
//!
//! Only histories that both forms can carry are encodable: at most
//! [`MAX_HISTORY_LEN`] tokens, bet sizes below [`MAX_BET_SIZES`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SolverError};

/// Version of the key encoding produced by [`KeyCodec::current`].
pub const KEY_VERSION: u8 = 1;

/// Number of distinct bet-size buckets a token can carry.
pub const MAX_BET_SIZES: u8 = 10;

/// Longest history the byte form's length field can describe.
pub const MAX_HISTORY_LEN: usize = u8::MAX as usize;

/// Compact action-history token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionToken {
    /// Fold.
    Fold,
    /// Check or call.
    Passive,
    /// Bet or raise, bucketed to a size index.
    Bet(u8),
    /// All-in.
    AllIn,
    /// Street boundary.
    Deal,
}

impl ActionToken {
    fn to_byte(self) -> Option<u8> {
        match self {
            ActionToken::Fold => Some(0),
            ActionToken::Passive => Some(1),
            ActionToken::AllIn => Some(2),
            ActionToken::Deal => Some(3),
            ActionToken::Bet(k) => (k < MAX_BET_SIZES).then(|| 0x10 + k),
        }
    }

    /// Whether the token survives both encodings.
    pub fn is_encodable(self) -> bool {
        self.to_byte().is_some()
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ActionToken::Fold),
            1 => Some(ActionToken::Passive),
            2 => Some(ActionToken::AllIn),
            3 => Some(ActionToken::Deal),
            b if (0x10..0x10 + MAX_BET_SIZES).contains(&b) => Some(ActionToken::Bet(b - 0x10)),
            _ => None,
        }
    }

    /// Parse a single token from its text form.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "f" => Some(ActionToken::Fold),
            "c" => Some(ActionToken::Passive),
            "a" => Some(ActionToken::AllIn),
            "/" => Some(ActionToken::Deal),
            _ => {
                let k: u8 = text.strip_prefix('b')?.parse().ok()?;
                (k < MAX_BET_SIZES).then_some(ActionToken::Bet(k))
            }
        }
    }
}

impl fmt::Display for ActionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionToken::Fold => write!(f, "f"),
            ActionToken::Passive => write!(f, "c"),
            ActionToken::Bet(k) => write!(f, "b{}", k),
            ActionToken::AllIn => write!(f, "a"),
            ActionToken::Deal => write!(f, "/"),
        }
    }
}

/// Ordered token sequence of the public action history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct History(Vec<ActionToken>);

impl History {
    /// Empty history.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a token.
    pub fn push(&mut self, token: ActionToken) {
        self.0.push(token);
    }

    /// Tokens in order.
    pub fn tokens(&self) -> &[ActionToken] {
        &self.0
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no token has been recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every token is encodable and the length fits the byte form.
    pub fn is_encodable(&self) -> bool {
        self.0.len() <= MAX_HISTORY_LEN && self.0.iter().all(|t| t.is_encodable())
    }

    /// Tokens after the last street boundary.
    pub fn current_street(&self) -> &[ActionToken] {
        let start = self
            .0
            .iter()
            .rposition(|t| *t == ActionToken::Deal)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.0[start..]
    }

    /// Parse the text form.
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = Vec::new();
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let end = if bytes[i] == b'b' {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                j
            } else {
                i + 1
            };
            tokens.push(ActionToken::parse(text.get(i..end)?)?);
            i = end;
        }
        Some(Self(tokens))
    }
}

impl From<Vec<ActionToken>> for History {
    fn from(tokens: Vec<ActionToken>) -> Self {
        Self(tokens)
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.0 {
            write!(f, "{}", token)?;
        }
        Ok(())
    }
}

/// Immutable information-set identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InfosetKey {
    version: u8,
    street: u8,
    bucket: u16,
    seat: u8,
    history: History,
}

impl InfosetKey {
    /// Encoding version the key was built under.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Street index.
    pub fn street(&self) -> u8 {
        self.street
    }

    /// Abstraction bucket of the acting player.
    pub fn bucket(&self) -> u16 {
        self.bucket
    }

    /// Acting seat.
    pub fn seat(&self) -> u8 {
        self.seat
    }

    /// Public action history.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Byte form.
    ///
    /// Keys from [`KeyCodec::encode`] always convert; a key deserialized
    /// from elsewhere with an unencodable history fails with
    /// [`SolverError::MalformedKey`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let malformed = || SolverError::MalformedKey(self.to_string());
        let tokens = self.history.tokens();
        let len = u8::try_from(tokens.len()).map_err(|_| malformed())?;
        let mut out = Vec::with_capacity(6 + tokens.len());
        out.push(self.version);
        out.push(self.street);
        out.extend_from_slice(&self.bucket.to_le_bytes());
        out.push(self.seat);
        out.push(len);
        for token in tokens {
            out.push(token.to_byte().ok_or_else(malformed)?);
        }
        Ok(out)
    }
}

impl fmt::Display for InfosetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.version, self.street, self.bucket, self.seat, self.history
        )
    }
}

/// Builds and parses keys for one encoding version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCodec {
    version: u8,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::current()
    }
}

impl KeyCodec {
    /// Codec for the current encoding.
    pub fn current() -> Self {
        Self { version: KEY_VERSION }
    }

    /// Codec for an explicit version.
    pub fn with_version(version: u8) -> Self {
        Self { version }
    }

    /// Version tag of this codec.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Build a key. Histories that could not be decoded again are refused
    /// with [`SolverError::MalformedKey`].
    pub fn encode(&self, street: u8, bucket: u16, seat: u8, history: History) -> Result<InfosetKey> {
        if !history.is_encodable() {
            return Err(SolverError::MalformedKey(format!(
                "{}:{street}:{bucket}:{seat}: history of {} tokens is not encodable",
                self.version,
                history.len()
            )));
        }
        Ok(InfosetKey {
            version: self.version,
            street,
            bucket,
            seat,
            history,
        })
    }

    /// Check that a key was built under this codec's version.
    pub fn check(&self, key: &InfosetKey) -> Result<()> {
        if key.version != self.version {
            return Err(SolverError::VersionMismatch {
                expected: self.version,
                found: key.version,
            });
        }
        Ok(())
    }

    /// Parse the string form.
    pub fn decode(&self, text: &str) -> Result<InfosetKey> {
        let malformed = || SolverError::MalformedKey(text.to_string());
        let mut parts = text.splitn(5, ':');
        let version: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        if version != self.version {
            return Err(SolverError::VersionMismatch {
                expected: self.version,
                found: version,
            });
        }
        let street: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let bucket: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let seat: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let history = parts.next().and_then(History::parse).ok_or_else(malformed)?;
        self.encode(street, bucket, seat, history)
    }

    /// Parse the byte form.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<InfosetKey> {
        let malformed = || SolverError::MalformedKey(format!("{:02x?}", bytes));
        let version = *bytes.first().ok_or_else(malformed)?;
        if version != self.version {
            return Err(SolverError::VersionMismatch {
                expected: self.version,
                found: version,
            });
        }
        if bytes.len() < 6 {
            return Err(malformed());
        }
        let len = bytes[5] as usize;
        if bytes.len() != 6 + len {
            return Err(malformed());
        }
        let tokens = bytes[6..]
            .iter()
            .map(|&b| ActionToken::from_byte(b))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(malformed)?;
        self.encode(
            bytes[1],
            u16::from_le_bytes([bytes[2], bytes[3]]),
            bytes[4],
            History::from(tokens),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_history() -> History {
        History::from(vec![
            ActionToken::Passive,
            ActionToken::Bet(3),
            ActionToken::Passive,
            ActionToken::Deal,
            ActionToken::Bet(12 % MAX_BET_SIZES),
            ActionToken::AllIn,
            ActionToken::Fold,
        ])
    }

    #[test]
    fn string_form_is_reversible() {
        let codec = KeyCodec::current();
        let key = codec.encode(1, 437, 0, sample_history()).unwrap();
        let text = key.to_string();
        assert_eq!(text, "1:1:437:0:cb3c/b2af");
        assert_eq!(codec.decode(&text).unwrap(), key);
    }

    #[test]
    fn byte_form_is_reversible() {
        let codec = KeyCodec::current();
        let key = codec.encode(3, 65_000, 1, sample_history()).unwrap();
        assert_eq!(codec.decode_bytes(&key.to_bytes().unwrap()).unwrap(), key);
    }

    #[test]
    fn empty_history_round_trips() {
        let codec = KeyCodec::current();
        let key = codec.encode(0, 0, 0, History::new()).unwrap();
        assert_eq!(key.to_string(), "1:0:0:0:");
        assert_eq!(codec.decode("1:0:0:0:").unwrap(), key);
    }

    #[test]
    fn foreign_version_is_refused() {
        let old = KeyCodec::with_version(7);
        let current = KeyCodec::current();
        let key = old.encode(0, 5, 1, sample_history()).unwrap();

        let err = current.decode(&key.to_string()).unwrap_err();
        assert!(matches!(err, SolverError::VersionMismatch { expected: 1, found: 7 }));
        let err = current.decode_bytes(&key.to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, SolverError::VersionMismatch { expected: 1, found: 7 }));
        assert!(current.check(&key).is_err());
    }

    #[test]
    fn version_participates_in_equality() {
        let a = KeyCodec::with_version(1).encode(0, 5, 1, History::new()).unwrap();
        let b = KeyCodec::with_version(2).encode(0, 5, 1, History::new()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_text_is_refused() {
        let codec = KeyCodec::current();
        for text in ["", "1", "1:0:0", "1:x:0:0:", "1:0:0:0:z", "1:0:0:0:b"] {
            assert!(
                matches!(codec.decode(text), Err(SolverError::MalformedKey(_))),
                "{text:?} should be malformed"
            );
        }
        assert!(codec.decode_bytes(&[1, 0, 0, 0, 0, 2, 1]).is_err());
    }

    #[test]
    fn current_street_slices_after_last_deal() {
        let history = sample_history();
        assert_eq!(
            history.current_street(),
            &[ActionToken::Bet(2), ActionToken::AllIn, ActionToken::Fold]
        );
    }

    #[test]
    fn oversized_bet_size_is_refused() {
        let codec = KeyCodec::current();
        let history = History::from(vec![ActionToken::Passive, ActionToken::Bet(MAX_BET_SIZES)]);
        assert!(matches!(
            codec.encode(0, 1, 0, history),
            Err(SolverError::MalformedKey(_))
        ));
        assert!(!ActionToken::Bet(250).is_encodable());
        assert!(ActionToken::Bet(MAX_BET_SIZES - 1).is_encodable());
    }

    #[test]
    fn history_longer_than_length_field_is_refused() {
        let codec = KeyCodec::current();
        let longest = History::from(vec![ActionToken::Passive; MAX_HISTORY_LEN]);
        let key = codec.encode(0, 1, 0, longest).unwrap();
        assert_eq!(codec.decode_bytes(&key.to_bytes().unwrap()).unwrap(), key);

        let too_long = History::from(vec![ActionToken::Passive; MAX_HISTORY_LEN + 1]);
        assert!(matches!(
            codec.encode(0, 1, 0, too_long),
            Err(SolverError::MalformedKey(_))
        ));
    }

    #[test]
    fn deserialized_key_with_bad_history_has_no_byte_form() {
        let valid = KeyCodec::current().encode(0, 1, 0, History::new()).unwrap();
        let forged = InfosetKey {
            history: History::from(vec![ActionToken::Bet(240)]),
            ..valid
        };
        assert!(matches!(forged.to_bytes(), Err(SolverError::MalformedKey(_))));
    }
}
