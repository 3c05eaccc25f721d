//! Messages exchanged between the pool coordinator and its workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cfr::config::SamplerConfig;
use crate::cfr::sampler::IterationReport;
use crate::cfr::store::StoreSnapshot;
use crate::cfr::stream::StreamState;

/// Coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    /// Configure a fresh worker incarnation.
    Init {
        /// Worker index.
        worker: usize,
        /// Incarnation number, bumped on every respawn.
        incarnation: u64,
        /// Sampler settings.
        sampler: SamplerConfig,
        /// Stream to continue from.
        stream: StreamState,
    },
    /// Run a batch of iterations against `baseline`.
    Batch {
        /// Batch identifier, unique within a run.
        batch: u64,
        /// Global number of the batch's first iteration.
        first_iteration: u64,
        /// Iterations to run.
        iterations: u64,
        /// Master store at the start of the round.
        baseline: Arc<StoreSnapshot>,
    },
    /// Exit after acknowledging.
    Shutdown,
}

/// Result of a finished batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Batch identifier.
    pub batch: u64,
    /// Regret and strategy-sum changes made during the batch.
    pub delta: StoreSnapshot,
    /// Stream position after the batch.
    pub stream: StreamState,
    /// Batch counters.
    pub report: IterationReport,
    /// Wall-clock duration of the batch.
    pub elapsed_ms: u64,
}

/// Worker to coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Report {
    /// Init was accepted.
    Ready {
        /// Worker index.
        worker: usize,
        /// Incarnation.
        incarnation: u64,
    },
    /// A batch finished.
    Done {
        /// Worker index.
        worker: usize,
        /// Incarnation.
        incarnation: u64,
        /// The batch outcome.
        result: Box<BatchResult>,
    },
    /// A batch failed inside the worker.
    Failed {
        /// Worker index.
        worker: usize,
        /// Incarnation.
        incarnation: u64,
        /// Batch identifier.
        batch: u64,
        /// Failure description.
        reason: String,
    },
    /// The worker is gone, either on request or because its pipe closed.
    Exited {
        /// Worker index.
        worker: usize,
        /// Incarnation.
        incarnation: u64,
    },
}

impl Report {
    /// Worker index and incarnation the report came from.
    pub fn origin(&self) -> (usize, u64) {
        match self {
            Report::Ready { worker, incarnation }
            | Report::Done { worker, incarnation, .. }
            | Report::Failed { worker, incarnation, .. }
            | Report::Exited { worker, incarnation } => (*worker, *incarnation),
        }
    }
}
