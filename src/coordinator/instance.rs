//! Several independent training runs side by side.
//!
//! Each instance is a full [`PoolCoordinator`] with its own seed and its own
//! checkpoint directory. Instances never share a store; they only share
//! the machine.

use std::path::PathBuf;
use std::thread;

use log::{info, warn};

use crate::cfr::config::{TrainingConfig, TrainingMetrics};
use crate::cfr::game::Game;
use crate::checkpoint::CheckpointManager;
use crate::coordinator::pool::{ExecutionContext, PoolCoordinator, SpawnMode};
use crate::error::{Result, SolverError};

/// One training run.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    /// Name used in logs.
    pub name: String,
    /// Run seed.
    pub seed: u64,
    /// Checkpoint root of this instance.
    pub checkpoint_dir: PathBuf,
}

/// Outcome of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSummary {
    /// Instance name.
    pub name: String,
    /// Iteration the instance started from (non-zero when resumed).
    pub resumed_from: u64,
    /// Final metrics.
    pub metrics: TrainingMetrics,
    /// Last checkpoint written, if any.
    pub checkpoint: Option<PathBuf>,
}

/// Runs several pools concurrently.
#[derive(Debug, Clone)]
pub struct MultiInstanceCoordinator {
    config: TrainingConfig,
    spawn: SpawnMode,
    instances: Vec<InstanceSpec>,
}

impl MultiInstanceCoordinator {
    /// Coordinator for `instances`, all sharing `config` apart from the seed.
    pub fn new(config: TrainingConfig, spawn: SpawnMode, instances: Vec<InstanceSpec>) -> Self {
        Self {
            config,
            spawn,
            instances,
        }
    }

    /// `count` instances named `run-<i>` with seeds `base_seed + i`, each
    /// checkpointing under `root/run-<i>`.
    pub fn numbered(config: TrainingConfig, spawn: SpawnMode, root: PathBuf, count: usize) -> Self {
        let instances = (0..count)
            .map(|i| {
                let name = format!("run-{i}");
                InstanceSpec {
                    seed: config.seed.wrapping_add(i as u64),
                    checkpoint_dir: root.join(&name),
                    name,
                }
            })
            .collect();
        Self::new(config, spawn, instances)
    }

    /// Instances managed.
    pub fn instances(&self) -> &[InstanceSpec] {
        &self.instances
    }

    /// Train every instance for `iterations` more iterations on its own
    /// thread, resuming each from its newest complete checkpoint.
    ///
    /// Results are returned in instance order; one failing instance does
    /// not stop the others.
    pub fn run<G: Game + 'static>(&self, game: &G, iterations: u64) -> Vec<Result<InstanceSummary>> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .instances
                .iter()
                .map(|spec| {
                    let game = game.clone();
                    scope.spawn(move || self.run_instance(game, spec, iterations))
                })
                .collect();
            handles
                .into_iter()
                .zip(&self.instances)
                .map(|(handle, spec)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(SolverError::Protocol(format!("instance {} panicked", spec.name)))
                    })
                })
                .collect()
        })
    }

    fn run_instance<G: Game + 'static>(
        &self,
        game: G,
        spec: &InstanceSpec,
        iterations: u64,
    ) -> Result<InstanceSummary> {
        let config = self.config.clone().with_seed(spec.seed);
        let context = ExecutionContext {
            seed: spec.seed,
            workers: config.pool.workers,
            channel_capacity: config.pool.channel_capacity,
            spawn: self.spawn.clone(),
        };
        let manager = CheckpointManager::new(&spec.checkpoint_dir);
        let mut pool = PoolCoordinator::resume_or_new(game, config, context, manager)?;
        let resumed_from = pool.iteration();
        info!("instance {} starting at iteration {}", spec.name, resumed_from);

        let outcome = pool.run(iterations).map(|m| m.clone());
        let metrics = match outcome {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!("instance {} failed: {err}", spec.name);
                return Err(err);
            }
        };
        let checkpoint = pool.save_checkpoint().or_else(|err| match err {
            SolverError::CheckpointExists(path) => Ok(Some(path)),
            other => Err(other),
        })?;
        info!(
            "instance {} finished at iteration {} with {} infosets",
            spec.name, metrics.iterations, metrics.info_sets
        );
        Ok(InstanceSummary {
            name: spec.name.clone(),
            resumed_from,
            metrics,
            checkpoint,
        })
    }
}
