//! Read-only blueprint strategy used by the resolver.

use std::path::Path;

use crate::cfr::key::{InfosetKey, KEY_VERSION};
use crate::cfr::store::{RegretStore, StrategyTable};
use crate::checkpoint::{CheckpointManager, StrategyArtifact};
use crate::error::Result;

/// Average strategy of a finished training run, tagged with the
/// abstraction it was trained against.
#[derive(Debug, Clone, PartialEq)]
pub struct Blueprint {
    abstraction_hash: String,
    key_version: u8,
    iteration: u64,
    table: StrategyTable,
}

impl Blueprint {
    /// Wrap a strategy table.
    pub fn new(abstraction_hash: String, iteration: u64, table: StrategyTable) -> Self {
        Self {
            abstraction_hash,
            key_version: KEY_VERSION,
            iteration,
            table,
        }
    }

    /// Snapshot the average strategy of a live store.
    pub fn from_store(store: &dyn RegretStore, abstraction_hash: String, iteration: u64) -> Self {
        Self::new(abstraction_hash, iteration, store.export().strategy_table())
    }

    /// Load the strategy artifact of a checkpoint, refusing other abstractions.
    pub fn load(path: &Path, expected_hash: &str) -> Result<Self> {
        CheckpointManager::load_strategy(path, expected_hash).map(Self::from)
    }

    /// Blueprint probabilities for `key`, uniform when the key was never
    /// trained or its action count differs.
    pub fn policy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        self.table.policy(key, num_actions)
    }

    /// Whether `key` was trained.
    pub fn contains(&self, key: &InfosetKey) -> bool {
        self.table.get(key).is_some()
    }

    /// Hash of the abstraction.
    pub fn abstraction_hash(&self) -> &str {
        &self.abstraction_hash
    }

    /// Codec version of the keys.
    pub fn key_version(&self) -> u8 {
        self.key_version
    }

    /// Iteration the strategy was taken at.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Number of infosets.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the blueprint is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl From<StrategyArtifact> for Blueprint {
    fn from(artifact: StrategyArtifact) -> Self {
        Self {
            abstraction_hash: artifact.abstraction_hash,
            key_version: artifact.key_version,
            iteration: artifact.iteration,
            table: artifact.table,
        }
    }
}
