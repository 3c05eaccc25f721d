//! Read-only bucket tables produced by offline clustering.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::street::Street;
use crate::error::{Result, SolverError};

/// A concrete situation as supplied by the perception boundary.
///
/// Cards are encoded `0..52`. Only the street, the cards and a coarse pot
/// class participate in bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Situation {
    /// Current street.
    pub street: Street,
    /// The acting player's private cards.
    pub hole: Vec<u8>,
    /// Visible board cards.
    pub board: Vec<u8>,
    /// Coarse pot-size class.
    pub pot_class: u8,
}

impl Situation {
    /// Canonical 64-bit id: sorted hole then sorted board, six bits per card
    /// (card + 1, so zero marks an empty slot), pot class in bits 48..56.
    pub fn canonical_id(&self) -> u64 {
        let mut hole = self.hole.clone();
        let mut board = self.board.clone();
        hole.sort_unstable();
        board.sort_unstable();

        let mut id = 0u64;
        for (slot, card) in hole.iter().take(2).enumerate() {
            id |= (u64::from(*card % 52) + 1) << (slot * 6);
        }
        for (slot, card) in board.iter().take(5).enumerate() {
            id |= (u64::from(*card % 52) + 1) << ((slot + 2) * 6);
        }
        id | (u64::from(self.pot_class) << 48)
    }
}

/// Bucket table for one street.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreetTable {
    /// Street the table covers.
    pub street: Street,
    /// Number of buckets on this street.
    pub buckets: u16,
    /// Canonical situation id to bucket.
    pub table: BTreeMap<u64, u16>,
}

/// Maps concrete situations to per-street buckets.
///
/// Built once and immutable for a training run. Its [`hash`](Self::hash) is
/// embedded in every checkpoint, blueprint and subgame so incompatible
/// artifacts are refused rather than silently mixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractionIndex {
    /// Human-readable name.
    pub name: String,
    /// One table per street, in street order.
    pub streets: Vec<StreetTable>,
}

impl AbstractionIndex {
    /// An index without lookup tables, for games whose chance nodes deal
    /// buckets directly.
    pub fn synthetic(name: &str, bucket_counts: &[u16]) -> Self {
        let streets = bucket_counts
            .iter()
            .zip(Street::ALL.iter())
            .map(|(&buckets, &street)| StreetTable {
                street,
                buckets,
                table: BTreeMap::new(),
            })
            .collect();
        Self {
            name: name.to_string(),
            streets,
        }
    }

    /// Start an empty builder.
    pub fn builder(name: &str) -> AbstractionIndexBuilder {
        AbstractionIndexBuilder {
            index: Self {
                name: name.to_string(),
                streets: Vec::new(),
            },
        }
    }

    /// Number of streets covered.
    pub fn num_streets(&self) -> usize {
        self.streets.len()
    }

    /// Number of buckets on a street (zero if the street is not covered).
    pub fn bucket_count(&self, street: Street) -> u16 {
        self.streets
            .get(street.index())
            .map(|t| t.buckets)
            .unwrap_or(0)
    }

    /// Bucket counts for every covered street.
    pub fn bucket_counts(&self) -> Vec<u16> {
        self.streets.iter().map(|t| t.buckets).collect()
    }

    /// Look up the bucket of a situation.
    pub fn bucket(&self, situation: &Situation) -> Result<u16> {
        let id = situation.canonical_id();
        self.streets
            .get(situation.street.index())
            .and_then(|t| t.table.get(&id).copied())
            .ok_or(SolverError::UnknownSituation {
                street: situation.street.to_string(),
                id,
            })
    }

    /// Canonical binary form used for hashing.
    ///
    /// Layout, all integers little-endian: name length (`u32`) and UTF-8
    /// bytes, street count (`u32`), then per street its index (`u8`),
    /// bucket count (`u16`), table length (`u64`) and the `(id: u64,
    /// bucket: u16)` pairs in ascending id order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.streets.len() as u32).to_le_bytes());
        for street in &self.streets {
            out.push(street.street.index() as u8);
            out.extend_from_slice(&street.buckets.to_le_bytes());
            out.extend_from_slice(&(street.table.len() as u64).to_le_bytes());
            for (id, bucket) in &street.table {
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(&bucket.to_le_bytes());
            }
        }
        out
    }

    /// Lowercase hex SHA-256 over [`canonical_bytes`](Self::canonical_bytes).
    pub fn hash(&self) -> String {
        hex_digest(&self.canonical_bytes())
    }

    /// Load an index from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the index as JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Incremental construction of an [`AbstractionIndex`].
#[derive(Debug, Clone)]
pub struct AbstractionIndexBuilder {
    index: AbstractionIndex,
}

impl AbstractionIndexBuilder {
    /// Declare the next street and its bucket count.
    pub fn street(mut self, buckets: u16) -> Self {
        let street = Street::from_index(self.index.streets.len()).unwrap_or(Street::River);
        self.index.streets.push(StreetTable {
            street,
            buckets,
            table: BTreeMap::new(),
        });
        self
    }

    /// Assign a situation to a bucket. Buckets beyond the street's count are clamped.
    pub fn assign(mut self, situation: &Situation, bucket: u16) -> Self {
        if let Some(table) = self.index.streets.get_mut(situation.street.index()) {
            let bucket = bucket.min(table.buckets.saturating_sub(1));
            table.table.insert(situation.canonical_id(), bucket);
        }
        self
    }

    /// Finish building.
    pub fn build(self) -> AbstractionIndex {
        self.index
    }
}

/// Lowercase hex SHA-256 of a byte string.
pub fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
