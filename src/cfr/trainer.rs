//! Single-process MCCFR driver.
//!
//! The [`Trainer`] owns the master regret store and one sampler, applies
//! the discount schedule between iterations and tracks metrics. The worker
//! pool reuses the same pieces across processes; this driver is what the
//! tests, the benchmarks and one-worker runs use.

use std::time::Instant;

use log::{debug, info};
use rand::Rng;

use crate::cfr::config::{TrainingConfig, TrainingMetrics};
use crate::cfr::game::{Game, NodeKind};
use crate::cfr::key::{InfosetKey, KeyCodec};
use crate::cfr::sampler::{sample_index, IterationReport, Sampler};
use crate::cfr::store::{self, RegretStore};
use crate::cfr::stream::{RandomStream, StreamState};
use crate::checkpoint::{CheckpointManager, CheckpointMeta, LoadedCheckpoint};
use crate::error::{Result, SolverError};

/// Drives the sampler over a master store.
///
/// # Example
/// ```ignore
/// use blueprint_solver::cfr::{Trainer, TrainingConfig};
/// use blueprint_solver::games::kuhn::KuhnPoker;
///
/// let mut trainer = Trainer::new(KuhnPoker::new(), TrainingConfig::default())?;
/// trainer.train(10_000)?;
/// ```
pub struct Trainer<G: Game> {
    sampler: Sampler<G>,
    store: Box<dyn RegretStore>,
    config: TrainingConfig,
    iteration: u64,
    metrics: TrainingMetrics,
    elapsed_before: f64,
    last_discount: Option<(f64, f64)>,
}

impl<G: Game> Trainer<G> {
    /// Create a trainer with an empty store.
    pub fn new(game: G, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let store = store::new_store(config.backend, config.sampler.regret_floor);
        let rng = RandomStream::from_seed(config.seed);
        let sampler = Sampler::new(game, config.sampler.clone(), rng);
        Ok(Self {
            sampler,
            store,
            config,
            iteration: 0,
            metrics: TrainingMetrics::new(),
            elapsed_before: 0.0,
            last_discount: None,
        })
    }

    /// Continue from a loaded checkpoint.
    pub fn from_checkpoint(game: G, config: TrainingConfig, loaded: LoadedCheckpoint) -> Result<Self> {
        config.validate()?;
        loaded.meta.warn_on_config_drift(&config);
        let state = loaded
            .meta
            .random_stream_state
            .first()
            .ok_or_else(|| SolverError::Serialization("checkpoint has no random stream".into()))?;
        let rng = RandomStream::from_state(state)?;
        let sampler = Sampler::new(game, config.sampler.clone(), rng);
        Ok(Self {
            sampler,
            store: loaded.store,
            config,
            iteration: loaded.meta.iteration,
            elapsed_before: loaded.meta.elapsed_seconds,
            metrics: loaded.meta.metrics,
            last_discount: loaded.meta.last_discount,
        })
    }

    /// Resume from the newest complete checkpoint under the manager's root,
    /// or start fresh when there is none.
    pub fn resume_or_new(game: G, config: TrainingConfig, manager: &CheckpointManager) -> Result<Self> {
        let hash = game.abstraction().hash();
        match manager.latest_complete()? {
            Some(path) => {
                let loaded = manager.load(&path, &hash)?;
                info!(
                    "resuming from {} at iteration {}",
                    path.display(),
                    loaded.meta.iteration
                );
                Self::from_checkpoint(game, config, loaded)
            }
            None => {
                info!("no complete checkpoint under {}, starting fresh", manager.root().display());
                Self::new(game, config)
            }
        }
    }

    /// Run one iteration and any discount that falls due after it.
    pub fn run_iteration(&mut self) -> Result<IterationReport> {
        let report = self.sampler.run_iteration(self.iteration, self.store.as_mut())?;
        self.iteration += 1;
        self.metrics.regret_updates += report.regret_updates;
        self.metrics.pruned_actions += report.pruned_actions;
        self.metrics.nodes_visited += report.nodes_visited;

        if let Some((alpha, beta)) = self.config.sampler.discount.factors(self.iteration) {
            debug!("discount at iteration {}: alpha={:.4} beta={:.4}", self.iteration, alpha, beta);
            self.store.discount(alpha, beta);
            self.last_discount = Some((alpha, beta));
            self.metrics.discounts_applied += 1;
        }
        Ok(report)
    }

    /// Train for a number of iterations.
    pub fn train(&mut self, iterations: u64) -> Result<&TrainingMetrics> {
        self.train_with_callback(iterations, 0, |_| {})
    }

    /// Train with a callback every `callback_interval` iterations
    /// (0 disables the callback).
    pub fn train_with_callback<F>(
        &mut self,
        iterations: u64,
        callback_interval: u64,
        mut callback: F,
    ) -> Result<&TrainingMetrics>
    where
        F: FnMut(&TrainingMetrics),
    {
        let start = Instant::now();
        let base = self.elapsed_before;

        for i in 0..iterations {
            self.run_iteration()?;

            if callback_interval > 0 && (i + 1) % callback_interval == 0 {
                self.refresh_metrics(base + start.elapsed().as_secs_f64());
                callback(&self.metrics);
            }
        }

        self.elapsed_before = base + start.elapsed().as_secs_f64();
        self.refresh_metrics(self.elapsed_before);
        Ok(&self.metrics)
    }

    fn refresh_metrics(&mut self, elapsed: f64) {
        self.metrics.iterations = self.iteration;
        self.metrics.info_sets = self.store.num_infosets();
        self.metrics.elapsed_seconds = elapsed;
        self.metrics.update_rate();
    }

    /// Current regret-matching strategy for an infoset.
    pub fn get_current_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        self.store.get_strategy(key, num_actions)
    }

    /// Average strategy for an infoset.
    pub fn get_average_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        self.store.average_strategy(key, num_actions)
    }

    /// Completed iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Number of infosets in the master store.
    pub fn num_info_sets(&self) -> usize {
        self.store.num_infosets()
    }

    /// Training metrics.
    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// The master store.
    pub fn store(&self) -> &dyn RegretStore {
        self.store.as_ref()
    }

    /// The game.
    pub fn game(&self) -> &G {
        self.sampler.game()
    }

    /// The configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Current random stream position.
    pub fn stream_state(&self) -> StreamState {
        self.sampler.stream_state()
    }

    /// Metadata describing the current state.
    pub fn checkpoint_meta(&self) -> Result<CheckpointMeta> {
        let mut metrics = self.metrics.clone();
        metrics.iterations = self.iteration;
        metrics.info_sets = self.store.num_infosets();
        CheckpointMeta::new(
            self.iteration,
            self.elapsed_before,
            metrics,
            vec![self.stream_state()],
            self.game().abstraction().hash(),
            &self.config,
            self.game().num_players(),
            self.last_discount,
        )
    }

    /// Write a checkpoint of the current state.
    pub fn save_checkpoint(&self, manager: &CheckpointManager) -> Result<std::path::PathBuf> {
        manager.save(&self.checkpoint_meta()?, self.store.as_ref())
    }

    /// Sampled exploitability estimate for two-player zero-sum games.
    ///
    /// The exploiter picks its best action at every node with full view of
    /// the sampled state, so the estimate is optimistic for the exploiter:
    /// it bounds the true exploitability from above and is only useful to
    /// compare runs on the same game.
    pub fn exploitability(&mut self, num_samples: usize) -> Result<f64> {
        let game = self.sampler.game().clone();
        let codec = KeyCodec::current();
        let mut rng = RandomStream::for_worker(self.config.seed, u64::MAX);
        let players = game.num_players();
        let mut total = 0.0;

        for _ in 0..num_samples {
            for exploiter in 0..players {
                let root = game.initial_state();
                let br = self.best_response_value(&game, &codec, &root, exploiter, &mut rng)?;
                let on_policy = self.policy_value(&game, &codec, &root, exploiter, &mut rng)?;
                total += br - on_policy;
            }
        }

        let value = total / (num_samples.max(1) * players.max(1)) as f64;
        self.metrics.record_exploitability(self.iteration, value);
        Ok(value)
    }

    fn best_response_value<R: Rng>(
        &self,
        game: &G,
        codec: &KeyCodec,
        state: &G::State,
        exploiter: usize,
        rng: &mut R,
    ) -> Result<f64> {
        match game.node_kind(state) {
            NodeKind::Terminal => Ok(game.payoff(state, exploiter)),
            NodeKind::Chance => {
                let next = game.sample_chance(state, rng);
                self.best_response_value(game, codec, &next, exploiter, rng)
            }
            NodeKind::Decision(seat) => {
                let actions = game.legal_actions(state);
                if actions.is_empty() {
                    return Ok(game.payoff(state, exploiter));
                }
                if seat == exploiter {
                    let mut best = f64::NEG_INFINITY;
                    for a in &actions {
                        let next = game.apply_action(state, a);
                        best = best.max(self.best_response_value(game, codec, &next, exploiter, rng)?);
                    }
                    Ok(best)
                } else {
                    let key = game.infoset_key(state, codec)?;
                    let strategy = self.store.average_strategy(&key, actions.len());
                    let mut value = 0.0;
                    for (a, p) in actions.iter().zip(&strategy) {
                        let next = game.apply_action(state, a);
                        value += p * self.best_response_value(game, codec, &next, exploiter, rng)?;
                    }
                    Ok(value)
                }
            }
        }
    }

    fn policy_value<R: Rng>(
        &self,
        game: &G,
        codec: &KeyCodec,
        state: &G::State,
        player: usize,
        rng: &mut R,
    ) -> Result<f64> {
        match game.node_kind(state) {
            NodeKind::Terminal => Ok(game.payoff(state, player)),
            NodeKind::Chance => {
                let next = game.sample_chance(state, rng);
                self.policy_value(game, codec, &next, player, rng)
            }
            NodeKind::Decision(_) => {
                let actions = game.legal_actions(state);
                if actions.is_empty() {
                    return Ok(game.payoff(state, player));
                }
                let key = game.infoset_key(state, codec)?;
                let strategy = self.store.average_strategy(&key, actions.len());
                let index = sample_index(&strategy, rng);
                let next = game.apply_action(state, &actions[index]);
                self.policy_value(game, codec, &next, player, rng)
            }
        }
    }
}
