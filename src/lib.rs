//! # Blueprint Solver
//!
//! Trains a blueprint strategy for abstracted poker with external-sampling
//! Monte Carlo CFR, and refines individual decisions in real time with a
//! depth-limited subgame resolver.
//!
//! ## Features
//!
//! - **Generic sampler**: works with any game implementing [`Game`]
//! - **Pluribus-style schedules**: linear weighting, early discounting,
//!   negative-regret pruning and decaying exploration
//! - **Two store backends**: exact `f64` tables or bit-packed fixed point
//! - **Fault-tolerant pool**: thread or process workers, adaptive timeouts,
//!   respawn with deterministic retry
//! - **Atomic checkpoints**: versioned, provenance-checked, resumable
//! - **Real-time resolver**: KL-regularized CFR over sampled worlds under a
//!   wall-clock budget
//!
//! ## Quick Start
//!
//! ```no_run
//! use blueprint_solver::cfr::{Trainer, TrainingConfig};
//! use blueprint_solver::checkpoint::CheckpointManager;
//! use blueprint_solver::games::kuhn::KuhnPoker;
//!
//! # fn main() -> blueprint_solver::Result<()> {
//! let manager = CheckpointManager::new("runs/kuhn");
//! let mut trainer = Trainer::resume_or_new(KuhnPoker::new(), TrainingConfig::default(), &manager)?;
//! trainer.train(100_000)?;
//! trainer.save_checkpoint(&manager)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`abstraction`]: read-only bucket tables and their provenance hash
//! - [`cfr`]: keys, stores, the sampler and the single-process trainer
//! - [`checkpoint`]: on-disk layout, atomic writes and resume
//! - [`coordinator`]: worker pool and multi-instance runs
//! - [`resolver`]: real-time subgame resolving against a blueprint
//! - [`games`]: toy, Kuhn poker and abstract hold'em
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        PoolCoordinator                          │
//! │  - batches over a baseline snapshot  - adaptive timeouts        │
//! │  - ordered delta merge               - respawn and retry        │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ Task / Report frames                 │ save / resume
//!          ▼                                      ▼
//!    ┌───────────┐   ┌───────────┐        ┌──────────────┐
//!    │  Worker   │ … │  Worker   │        │  Checkpoints │
//!    │  Sampler  │   │  Sampler  │        └──────────────┘
//!    └───────────┘   └───────────┘                │ strategy
//!          │ walks Game                           ▼
//!          ▼                               ┌──────────────┐
//!    ┌───────────────────────────┐         │   Resolver   │
//!    │ Kuhn / Toy / Abstract HE  │◀────────│  (subgames)  │
//!    └───────────────────────────┘         └──────────────┘
//! ```

#![warn(missing_docs)]

/// Card abstraction tables.
pub mod abstraction;

/// External-sampling MCCFR.
///
/// This is the core module containing the sampler and the regret stores.
pub mod cfr;

/// Checkpoint layout and persistence.
pub mod checkpoint;

/// Parallel training.
pub mod coordinator;

/// Error taxonomy.
pub mod error;

/// Game implementations module.
///
/// Contains the validation games and abstract hold'em.
pub mod games;

/// Real-time subgame resolving.
pub mod resolver;

// Re-export commonly used types at crate root for convenience
pub use cfr::{
    Action, Game, GameState, InfosetKey, KeyCodec, RandomStream, RegretStore, Trainer, TrainingConfig,
    TrainingMetrics,
};
pub use error::{Result, SolverError};
