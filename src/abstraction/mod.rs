//! Card abstraction consumed by the sampler and the resolver.
//!
//! The index maps a concrete situation (cards, board, pot context) to a
//! small bucket per street. It is produced offline and treated as a
//! read-only table here.

pub mod index;
pub mod street;

pub use index::{hex_digest, AbstractionIndex, AbstractionIndexBuilder, Situation, StreetTable};
pub use street::Street;
