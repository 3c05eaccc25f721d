//! Configuration options for training and resolving.
//!
//! [`TrainingConfig`] bundles everything that shapes a run: the store
//! backend, the sampler's schedules, the worker pool and the resolver.
//! It is serialized into JSON config files and hashed into every
//! checkpoint so a resumed run can tell when its settings drifted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abstraction::hex_digest;
use crate::cfr::store::StoreBackend;
use crate::error::Result;

/// Regret-based pruning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Whether pruning is active at all.
    pub enabled: bool,
    /// Actions whose cumulative regret is below this value are candidates.
    pub threshold: f64,
    /// Probability that a candidate is actually skipped at a visited node.
    pub probability: f64,
    /// Iterations before pruning starts.
    pub warmup: u64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: -300_000.0,
            probability: 0.95,
            warmup: 1_000,
        }
    }
}

impl PruningConfig {
    /// Pruning switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Whether pruning may apply at `iteration`.
    pub fn active(&self, iteration: u64) -> bool {
        self.enabled && iteration >= self.warmup
    }
}

/// One step of the exploration schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonStep {
    /// First iteration the value applies to.
    pub from_iteration: u64,
    /// Probability of sampling uniformly at other players' nodes.
    pub epsilon: f64,
}

/// Off-policy exploration as a step function of the iteration count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsilonSchedule {
    /// Steps in ascending `from_iteration` order.
    pub steps: Vec<EpsilonStep>,
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self {
            steps: vec![
                EpsilonStep { from_iteration: 0, epsilon: 0.1 },
                EpsilonStep { from_iteration: 50_000, epsilon: 0.02 },
            ],
        }
    }
}

impl EpsilonSchedule {
    /// No exploration.
    pub fn none() -> Self {
        Self { steps: Vec::new() }
    }

    /// A single value for every iteration.
    pub fn constant(epsilon: f64) -> Self {
        Self {
            steps: vec![EpsilonStep { from_iteration: 0, epsilon }],
        }
    }

    /// Exploration probability at `iteration`.
    pub fn epsilon(&self, iteration: u64) -> f64 {
        self.steps
            .iter()
            .take_while(|s| s.from_iteration <= iteration)
            .last()
            .map(|s| s.epsilon)
            .unwrap_or(0.0)
    }
}

/// How discount factors are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiscountMode {
    /// Never discount.
    None,
    /// `alpha = beta = t / (t + 1)` with `t = iteration / interval`.
    Linear,
    /// Constant factors.
    Fixed {
        /// Regret factor.
        alpha: f64,
        /// Strategy-sum factor.
        beta: f64,
    },
}

/// When to apply `discount(alpha, beta)` to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountSchedule {
    /// Apply every this many iterations.
    pub interval: u64,
    /// Stop discounting after this iteration.
    pub stop_after: u64,
    /// Factor selection.
    pub mode: DiscountMode,
}

impl Default for DiscountSchedule {
    fn default() -> Self {
        Self {
            interval: 1_000,
            stop_after: 40_000,
            mode: DiscountMode::Linear,
        }
    }
}

impl DiscountSchedule {
    /// No discounting.
    pub fn none() -> Self {
        Self {
            interval: 0,
            stop_after: 0,
            mode: DiscountMode::None,
        }
    }

    /// Factors to apply once `iteration` iterations have completed, if any.
    pub fn factors(&self, iteration: u64) -> Option<(f64, f64)> {
        if self.interval == 0 || iteration == 0 || iteration > self.stop_after {
            return None;
        }
        if iteration % self.interval != 0 {
            return None;
        }
        match self.mode {
            DiscountMode::None => None,
            DiscountMode::Linear => {
                let t = (iteration / self.interval) as f64;
                let d = t / (t + 1.0);
                Some((d, d))
            }
            DiscountMode::Fixed { alpha, beta } => Some((alpha, beta)),
        }
    }

    /// All factors due in `(from, to]`, in order.
    pub fn due_between(&self, from: u64, to: u64) -> Vec<(u64, f64, f64)> {
        if self.interval == 0 {
            return Vec::new();
        }
        let first = (from / self.interval + 1) * self.interval;
        (first..=to)
            .step_by(self.interval as usize)
            .filter_map(|it| self.factors(it).map(|(a, b)| (it, a, b)))
            .collect()
    }
}

/// Settings of the MCCFR tree walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Minimum cumulative regret. `Some(0.0)` gives CFR+ behaviour.
    pub regret_floor: Option<f64>,
    /// Weight strategy accumulation by the iteration number.
    pub linear_averaging: bool,
    /// Regret-based pruning.
    pub pruning: PruningConfig,
    /// Exploration at other players' nodes.
    pub epsilon: EpsilonSchedule,
    /// Periodic discounting.
    pub discount: DiscountSchedule,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            regret_floor: Some(-1_000_000.0),
            linear_averaging: true,
            pruning: PruningConfig::default(),
            epsilon: EpsilonSchedule::default(),
            discount: DiscountSchedule::default(),
        }
    }
}

impl SamplerConfig {
    /// Plain external sampling: no floor, pruning, exploration or discounting.
    pub fn vanilla() -> Self {
        Self {
            regret_floor: None,
            linear_averaging: false,
            pruning: PruningConfig::disabled(),
            epsilon: EpsilonSchedule::none(),
            discount: DiscountSchedule::none(),
        }
    }

    /// Regrets floored at zero with linear averaging.
    pub fn cfr_plus() -> Self {
        Self {
            regret_floor: Some(0.0),
            linear_averaging: true,
            pruning: PruningConfig::disabled(),
            epsilon: EpsilonSchedule::none(),
            discount: DiscountSchedule::none(),
        }
    }
}

/// Settings of the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of persistent workers.
    pub workers: usize,
    /// Iterations per worker batch.
    pub batch_iterations: u64,
    /// Capacity of each bounded channel.
    pub channel_capacity: usize,
    /// Timeout before any batch has been timed.
    pub initial_timeout_ms: u64,
    /// Lower bound of the adaptive timeout.
    pub timeout_floor_ms: u64,
    /// Multiplier over the expected batch duration.
    pub timeout_factor: f64,
    /// How long a worker gets to exit after a shutdown request.
    pub grace_ms: u64,
    /// Consecutive worker failures that abort the run.
    pub max_consecutive_failures: usize,
    /// Checkpoint every this many iterations (0 disables).
    pub checkpoint_interval: u64,
    /// Complete checkpoints to retain (0 keeps all).
    pub checkpoint_keep: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_iterations: 1_000,
            channel_capacity: 4,
            initial_timeout_ms: 60_000,
            timeout_floor_ms: 2_000,
            timeout_factor: 4.0,
            grace_ms: 500,
            max_consecutive_failures: 3,
            checkpoint_interval: 100_000,
            checkpoint_keep: 3,
        }
    }
}

/// Settings of the real-time resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Default number of sampled worlds (clamped to 16..=64).
    pub sample_count: usize,
    /// Iteration cap per decision.
    pub max_iterations: u64,
    /// Streets searched past the root street before leaf evaluation.
    pub lookahead_streets: usize,
    /// KL penalty weight per street index; the last entry covers later streets.
    pub kl_weights: Vec<f64>,
    /// Regret floor of the subgame store.
    pub regret_floor: Option<f64>,
    /// Blueprint rollouts per leaf evaluation.
    pub rollouts: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            sample_count: 32,
            max_iterations: 200,
            lookahead_streets: 1,
            kl_weights: vec![0.5, 0.3, 0.2, 0.1],
            regret_floor: Some(0.0),
            rollouts: 1,
        }
    }
}

impl ResolverConfig {
    /// Smallest accepted sample count.
    pub const MIN_SAMPLES: usize = 16;
    /// Largest accepted sample count.
    pub const MAX_SAMPLES: usize = 64;

    /// KL weight on a street.
    pub fn kl_weight(&self, street: usize) -> f64 {
        self.kl_weights
            .get(street)
            .or_else(|| self.kl_weights.last())
            .copied()
            .unwrap_or(0.0)
    }

    /// Clamp a requested sample count into the accepted range.
    pub fn clamp_samples(requested: usize) -> usize {
        requested.clamp(Self::MIN_SAMPLES, Self::MAX_SAMPLES)
    }
}

/// Configuration for a training run.
///
/// # Example
/// ```
/// use blueprint_solver::cfr::TrainingConfig;
///
/// let config = TrainingConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Run seed; worker `i` uses stream `i` of this seed.
    pub seed: u64,
    /// Store backend of the master table.
    pub backend: StoreBackend,
    /// Sampler settings.
    pub sampler: SamplerConfig,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Resolver settings.
    pub resolver: ResolverConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            backend: StoreBackend::Dense,
            sampler: SamplerConfig::default(),
            pool: PoolConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Small batches and compact storage for quick runs.
    pub fn fast() -> Self {
        Self {
            backend: StoreBackend::Compact,
            pool: PoolConfig {
                workers: 2,
                batch_iterations: 200,
                checkpoint_interval: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Vanilla external sampling, useful as a baseline.
    pub fn vanilla() -> Self {
        Self {
            sampler: SamplerConfig::vanilla(),
            ..Default::default()
        }
    }

    /// Builder method: set the run seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builder method: set the store backend.
    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Builder method: set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    /// Builder method: set the batch size.
    pub fn with_batch(mut self, iterations: u64) -> Self {
        self.pool.batch_iterations = iterations;
        self
    }

    /// Builder method: set a constant exploration probability.
    pub fn with_exploration(mut self, epsilon: f64) -> Self {
        self.sampler.epsilon = EpsilonSchedule::constant(epsilon.clamp(0.0, 1.0));
        self
    }

    /// Builder method: replace the sampler settings.
    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    /// Load a config from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config as JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Lowercase hex SHA-256 over the JSON serialization.
    pub fn config_hash(&self) -> Result<String> {
        Ok(hex_digest(&serde_json::to_vec(self)?))
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for step in &self.sampler.epsilon.steps {
            if !(0.0..=1.0).contains(&step.epsilon) {
                return Err(ConfigError::InvalidExploration(step.epsilon));
            }
        }
        if self
            .sampler
            .epsilon
            .steps
            .windows(2)
            .any(|w| w[0].from_iteration > w[1].from_iteration)
        {
            return Err(ConfigError::UnorderedSchedule);
        }

        let pruning = &self.sampler.pruning;
        if !(0.0..=1.0).contains(&pruning.probability) {
            return Err(ConfigError::InvalidProbability("pruning", pruning.probability));
        }

        if let DiscountMode::Fixed { alpha, beta } = self.sampler.discount.mode {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(ConfigError::InvalidDiscount("regret", alpha));
            }
            if !(0.0..=1.0).contains(&beta) {
                return Err(ConfigError::InvalidDiscount("strategy", beta));
            }
        }

        if self.pool.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.pool.batch_iterations == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.pool.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.pool.timeout_factor <= 0.0 || !self.pool.timeout_factor.is_finite() {
            return Err(ConfigError::InvalidTimeoutFactor(self.pool.timeout_factor));
        }

        if self.resolver.kl_weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ConfigError::InvalidKlWeight);
        }
        if self.resolver.rollouts == 0 {
            return Err(ConfigError::ZeroRollouts);
        }

        Ok(())
    }
}

/// Errors that can occur when validating configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Exploration probability is out of range [0, 1].
    #[error("exploration probability {0} is out of range [0, 1]")]
    InvalidExploration(f64),
    /// Epsilon steps are not in ascending order.
    #[error("exploration schedule steps must be in ascending iteration order")]
    UnorderedSchedule,
    /// A probability is out of range [0, 1].
    #[error("{0} probability {1} is out of range [0, 1]")]
    InvalidProbability(&'static str, f64),
    /// Discount factor is out of range [0, 1].
    #[error("{0} discount {1} is out of range [0, 1]")]
    InvalidDiscount(&'static str, f64),
    /// The pool has no workers.
    #[error("worker pool needs at least one worker")]
    ZeroWorkers,
    /// Batches would be empty.
    #[error("batch size must be positive")]
    ZeroBatch,
    /// Channels would be unbuffered.
    #[error("channel capacity must be positive")]
    ZeroCapacity,
    /// Timeout factor is not a positive number.
    #[error("timeout factor {0} must be positive")]
    InvalidTimeoutFactor(f64),
    /// A KL weight is negative or not finite.
    #[error("KL weights must be finite and non-negative")]
    InvalidKlWeight,
    /// The leaf evaluator would never run.
    #[error("resolver needs at least one rollout per leaf")]
    ZeroRollouts,
    /// Game parameters are inconsistent.
    #[error("invalid game: {0}")]
    InvalidGame(String),
}

/// Statistics tracked during training.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Total number of iterations completed.
    pub iterations: u64,

    /// Number of unique information sets discovered.
    pub info_sets: usize,

    /// Total time spent training (in seconds).
    pub elapsed_seconds: f64,

    /// Iterations per second.
    pub iterations_per_second: f64,

    /// Regret updates applied.
    pub regret_updates: u64,

    /// Actions skipped by pruning.
    pub pruned_actions: u64,

    /// Tree nodes visited.
    pub nodes_visited: u64,

    /// Discount passes applied to the store.
    pub discounts_applied: u64,

    /// Worker timeouts and crashes recovered from.
    pub worker_failures: u64,

    /// Estimated exploitability (if calculated).
    pub exploitability: Option<f64>,

    /// History of exploitability measurements.
    pub exploitability_history: Vec<ExploitabilityPoint>,
}

/// A single exploitability measurement at a specific iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExploitabilityPoint {
    /// Iteration number when this measurement was taken.
    pub iteration: u64,
    /// Exploitability value.
    pub exploitability: f64,
}

impl TrainingMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update iterations per second based on elapsed time.
    pub fn update_rate(&mut self) {
        if self.elapsed_seconds > 0.0 {
            self.iterations_per_second = self.iterations as f64 / self.elapsed_seconds;
        }
    }

    /// Record an exploitability measurement.
    pub fn record_exploitability(&mut self, iteration: u64, exploitability: f64) {
        self.exploitability = Some(exploitability);
        self.exploitability_history.push(ExploitabilityPoint {
            iteration,
            exploitability,
        });
    }
}
