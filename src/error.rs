//! Error taxonomy for training, checkpointing and resolving.
//!
//! Abstraction and key-version mismatches are always fatal: continuing past
//! them corrupts the regret table without any visible symptom. Worker
//! failures are recovered by the pool coordinator up to a retry budget, and
//! resolver timeouts are not errors at all.

use std::path::PathBuf;

use thiserror::Error;

use crate::cfr::config::ConfigError;

/// Result alias used across the crate.
pub type Result<T, E = SolverError> = std::result::Result<T, E>;

/// Coded faults that abort a single sampler iteration.
///
/// These indicate abstraction or history-encoding bugs, never transient
/// conditions, so the iteration is abandoned rather than retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalFault {
    /// A decision node without legal actions, or an acting seat out of range.
    UnexpectedNode,
    /// The game produced a key under a different codec version.
    KeyVersion,
    /// A reach probability went negative or non-finite.
    NegativeReach,
}

impl TraversalFault {
    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            TraversalFault::UnexpectedNode => "E101",
            TraversalFault::KeyVersion => "E102",
            TraversalFault::NegativeReach => "E103",
        }
    }
}

impl std::fmt::Display for TraversalFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraversalFault::UnexpectedNode => "unexpected node",
            TraversalFault::KeyVersion => "key version mismatch",
            TraversalFault::NegativeReach => "negative reach probability",
        };
        write!(f, "{} {}", self.code(), name)
    }
}

/// Errors surfaced by the solver.
#[derive(Debug, Error)]
pub enum SolverError {
    /// A key was decoded under a codec of a different version.
    #[error("infoset key version mismatch: codec expects v{expected}, key is v{found}")]
    VersionMismatch {
        /// Version of the active codec.
        expected: u8,
        /// Version carried by the key.
        found: u8,
    },

    /// A key could not be parsed at all.
    #[error("malformed infoset key {0:?}")]
    MalformedKey(String),

    /// A checkpoint or blueprint was built against another abstraction.
    #[error("abstraction mismatch: active index {expected}, checkpoint {found}")]
    AbstractionMismatch {
        /// Hash of the active abstraction index.
        expected: String,
        /// Hash recorded in the artifact.
        found: String,
    },

    /// One or more checkpoint artifacts are missing.
    #[error("incomplete checkpoint at {path}: missing {missing:?}")]
    IncompleteCheckpoint {
        /// Checkpoint directory.
        path: PathBuf,
        /// Names of the missing artifacts.
        missing: Vec<String>,
    },

    /// A checkpoint for this iteration has already been written.
    #[error("checkpoint already exists at {0}")]
    CheckpointExists(PathBuf),

    /// A worker did not report within its adaptive timeout.
    #[error("worker {worker} timed out on batch {batch} after {waited_ms} ms")]
    WorkerTimeout {
        /// Worker index.
        worker: usize,
        /// Batch identifier.
        batch: u64,
        /// Time waited before giving up.
        waited_ms: u64,
    },

    /// A worker exited or reported a failure.
    #[error("worker {worker} crashed on batch {batch}: {reason}")]
    WorkerCrash {
        /// Worker index.
        worker: usize,
        /// Batch identifier.
        batch: u64,
        /// Reason reported by the worker or transport.
        reason: String,
    },

    /// The retry budget was exhausted.
    #[error("training run aborted after {failures} consecutive worker failures; last: {last}")]
    RunAborted {
        /// Number of consecutive failures observed.
        failures: usize,
        /// The failure that exhausted the budget.
        last: Box<SolverError>,
    },

    /// The resolver could not build a subgame; callers fall back to the blueprint.
    #[error("subgame construction failed: {0}")]
    SubgameConstructionFailed(String),

    /// A sampler iteration hit a coded fault.
    #[error("traversal fault {fault} at iteration {iteration}: {detail}")]
    Traversal {
        /// Coded fault.
        fault: TraversalFault,
        /// Global iteration number.
        iteration: u64,
        /// Context for diagnosis.
        detail: String,
    },

    /// The abstraction index has no bucket for a situation.
    #[error("no bucket for situation {id:#x} on {street}")]
    UnknownSituation {
        /// Street name.
        street: String,
        /// Canonical situation id.
        id: u64,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Filesystem or pipe failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a blob failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A worker frame violated the wire protocol.
    #[error("worker protocol error: {0}")]
    Protocol(String),
}

impl SolverError {
    /// Whether this error may be recovered by respawning a worker.
    pub fn is_worker_failure(&self) -> bool {
        matches!(self, SolverError::WorkerTimeout { .. } | SolverError::WorkerCrash { .. })
    }
}

impl From<bincode::Error> for SolverError {
    fn from(err: bincode::Error) -> Self {
        SolverError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SolverError {
    fn from(err: serde_json::Error) -> Self {
        SolverError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_messages_carry_both_sides() {
        let err = SolverError::AbstractionMismatch {
            expected: "aaaa".to_string(),
            found: "bbbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aaaa") && msg.contains("bbbb"), "{msg}");

        let err = SolverError::VersionMismatch { expected: 1, found: 7 };
        let msg = err.to_string();
        assert!(msg.contains("v1") && msg.contains("v7"), "{msg}");
    }

    #[test]
    fn traversal_faults_are_coded() {
        let err = SolverError::Traversal {
            fault: TraversalFault::NegativeReach,
            iteration: 12,
            detail: "reach -0.5".to_string(),
        };
        assert!(err.to_string().contains("E103"));
        assert!(!err.is_worker_failure());
    }

    #[test]
    fn worker_failures_are_recoverable() {
        let err = SolverError::WorkerTimeout { worker: 1, batch: 3, waited_ms: 100 };
        assert!(err.is_worker_failure());
    }
}
