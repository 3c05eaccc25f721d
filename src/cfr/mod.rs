//! Monte Carlo CFR blueprint training.
//!
//! This module holds the pieces a training run is made of: the infoset key
//! codec, the regret stores, the external-sampling tree walk and the
//! single-process [`Trainer`] that drives it.
//!
//! # Overview
//!
//! External-sampling MCCFR approximates an equilibrium by repeating:
//! 1. Pick the updating player round-robin
//! 2. Walk the tree, exploring every action of the updating player and one
//!    sampled action of everyone else
//! 3. Add each explored action's counterfactual regret to the store
//!
//! The average of the regret-matching strategies converges towards an
//! equilibrium of the abstracted game.
//!
//! # Usage
//!
//! 1. Implement the [`Game`] trait (keys come from [`KeyCodec::encode`])
//! 2. Create a [`Trainer`] with the game and a [`TrainingConfig`]
//! 3. Call `train()` to run iterations
//! 4. Read strategies with `get_average_strategy()`, or write a checkpoint
//!
//! # Example
//!
//! ```ignore
//! use blueprint_solver::cfr::{Trainer, TrainingConfig};
//! use blueprint_solver::games::kuhn::KuhnPoker;
//!
//! let game = KuhnPoker::new();
//! let key = game.key(1, 0, &[])?;
//! let mut trainer = Trainer::new(game, TrainingConfig::default())?;
//!
//! let metrics = trainer.train(10_000)?;
//! println!("Trained {} info sets in {:.2}s", metrics.info_sets, metrics.elapsed_seconds);
//! println!("Queen opening: {:?}", trainer.get_average_strategy(&key, 2));
//! ```
//!
//! # Theory
//!
//! **Regret**: how much better an action did than the current strategy.
//! ```text
//! Regret(a) = Value(a) - Value(current_strategy)
//! ```
//!
//! **Regret Matching**: play proportionally to positive regret.
//! ```text
//! Strategy(a) = max(0, Regret(a)) / sum(max(0, Regret(a')))
//! ```
//!
//! # References
//!
//! - Lanctot, M., et al. "Monte Carlo Sampling for Regret Minimization in Extensive Games" (2009)
//! - Brown, N., Sandholm, T. "Solving Imperfect-Information Games via Discounted Regret Minimization" (2019)
//! - Brown, N., Sandholm, T. "Superhuman AI for multiplayer poker" (2019)

pub mod config;
pub mod game;
pub mod key;
pub mod sampler;
pub mod store;
pub mod stream;
pub mod trainer;

pub use config::{
    ConfigError, DiscountMode, DiscountSchedule, EpsilonSchedule, ExploitabilityPoint, PoolConfig,
    PruningConfig, ResolverConfig, SamplerConfig, TrainingConfig, TrainingMetrics,
};
pub use game::{Action, Game, GameState, NodeKind};
pub use key::{ActionToken, History, InfosetKey, KeyCodec, KEY_VERSION};
pub use sampler::{IterationReport, NoopObserver, Sampler, SamplerObserver};
pub use store::{RegretStore, StoreBackend, StoreSnapshot, StrategyTable};
pub use stream::{RandomStream, StreamState};
pub use trainer::Trainer;
