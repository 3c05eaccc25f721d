//! Real-time subgame resolver.
//!
//! At decision time the resolver refines the blueprint strategy of one
//! infoset:
//!
//! 1. Rebuild `sample_count` worlds consistent with the live key
//! 2. Run KL-regularized CFR over them in an ephemeral store, searching
//!    `lookahead_streets` ahead and rolling out the blueprint beyond
//! 3. Stop at `max_iterations` or the deadline, whichever comes first
//!
//! The deadline is checked before every world walk, so an overrun is
//! bounded by one walk; an iteration cut short is not counted. Running out
//! of time is not an error: the average strategy so far is returned and
//! `deadline_hit` is set. When no iteration completes, or the
//! subgame cannot be built, the blueprint strategy is returned unchanged
//! with `fallback_used` set.
//!
//! # Example
//!
//! ```ignore
//! let resolver = Resolver::new(game, blueprint, ResolverConfig::default())?;
//! let resolution = resolver.resolve(&ResolveRequest::new(key, actions, 50));
//! println!("{:?} in {} iterations", resolution.policy, resolution.diagnostics.iterations_run);
//! ```

pub mod blueprint;
pub mod subgame;

use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cfr::config::ResolverConfig;
use crate::cfr::game::{Action, NodeKind};
use crate::cfr::key::{ActionToken, InfosetKey, KeyCodec};
use crate::cfr::sampler::sample_index;
use crate::cfr::store::{DenseStore, RegretStore};
use crate::cfr::stream::RandomStream;
use crate::error::{Result, SolverError};

pub use blueprint::Blueprint;
pub use subgame::{BlueprintRollout, LeafEvaluator, Resolvable, Subgame, World};

/// One decision to resolve.
#[derive(Debug, Clone)]
pub struct ResolveRequest<A> {
    /// Live infoset of the acting seat.
    pub key: InfosetKey,
    /// Legal actions, in the game's order.
    pub actions: Vec<A>,
    /// Wall-clock budget.
    pub time_budget_ms: u64,
    /// Requested number of worlds, clamped to the accepted range.
    pub sample_count: Option<usize>,
}

impl<A> ResolveRequest<A> {
    /// Request with the configured default sample count.
    pub fn new(key: InfosetKey, actions: Vec<A>, time_budget_ms: u64) -> Self {
        Self {
            key,
            actions,
            time_budget_ms,
            sample_count: None,
        }
    }

    /// Ask for a specific number of worlds.
    pub fn with_samples(mut self, sample_count: usize) -> Self {
        self.sample_count = Some(sample_count);
        self
    }
}

/// What happened while resolving.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Completed CFR iterations.
    pub iterations_run: u64,
    /// Wall-clock time spent.
    pub elapsed_ms: u64,
    /// The blueprint strategy was returned unchanged.
    pub fallback_used: bool,
    /// The deadline stopped the search.
    pub deadline_hit: bool,
    /// Worlds searched.
    pub worlds: usize,
    /// Why the resolver fell back, if it did.
    pub fallback_reason: Option<String>,
}

/// A resolved decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// History token of every legal action.
    pub actions: Vec<ActionToken>,
    /// Probability of each action, aligned with `actions`.
    pub policy: Vec<f64>,
    /// Search diagnostics.
    pub diagnostics: Diagnostics,
}

impl Resolution {
    /// Most likely action index.
    pub fn best_action(&self) -> Option<usize> {
        self.policy
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }
}

struct Search<'a> {
    store: DenseStore,
    config: &'a ResolverConfig,
    horizon: usize,
}

/// Refines blueprint decisions under a time budget.
pub struct Resolver<G: Resolvable, E: LeafEvaluator<G> = BlueprintRollout> {
    game: G,
    blueprint: Blueprint,
    evaluator: E,
    config: ResolverConfig,
    seed: u64,
}

impl<G: Resolvable> Resolver<G, BlueprintRollout> {
    /// Resolver with blueprint rollouts at the leaves.
    ///
    /// Fails with [`SolverError::AbstractionMismatch`] when the blueprint
    /// was trained against another abstraction.
    pub fn new(game: G, blueprint: Blueprint, config: ResolverConfig) -> Result<Self> {
        let evaluator = BlueprintRollout::new(blueprint.clone(), config.rollouts);
        Self::with_evaluator(game, blueprint, config, evaluator)
    }
}

impl<G: Resolvable, E: LeafEvaluator<G>> Resolver<G, E> {
    /// Resolver with a custom leaf evaluator.
    pub fn with_evaluator(game: G, blueprint: Blueprint, config: ResolverConfig, evaluator: E) -> Result<Self> {
        let expected = game.abstraction().hash();
        if blueprint.abstraction_hash() != expected {
            return Err(SolverError::AbstractionMismatch {
                expected,
                found: blueprint.abstraction_hash().to_string(),
            });
        }
        Ok(Self {
            game,
            blueprint,
            evaluator,
            config,
            seed: 0,
        })
    }

    /// Seed of the per-world chance streams.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The blueprint.
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    /// Resolve one decision. Never fails: problems fall back to the blueprint.
    pub fn resolve(&self, request: &ResolveRequest<G::Action>) -> Resolution {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(request.time_budget_ms);
        let n = request.actions.len();
        let tokens: Vec<ActionToken> = request.actions.iter().map(|a| a.token()).collect();
        let samples = ResolverConfig::clamp_samples(request.sample_count.unwrap_or(self.config.sample_count));

        let subgame = Subgame::build(
            &self.game,
            &self.blueprint,
            &request.key,
            &request.actions,
            samples,
            self.config.lookahead_streets,
            self.seed,
        );
        let subgame = match subgame {
            Ok(subgame) => subgame,
            Err(err) => {
                warn!("falling back to blueprint at {}: {err}", request.key);
                return self.fallback(request, tokens, start, Some(err.to_string()));
            }
        };

        let mut search = Search {
            store: DenseStore::new(self.config.regret_floor),
            config: &self.config,
            horizon: subgame.horizon,
        };
        let mut worlds = subgame.worlds;
        let players = self.game.num_players().max(1);
        let mut iterations = 0u64;
        let mut deadline_hit = false;

        'search: while iterations < self.config.max_iterations {
            let updater = (iterations % players as u64) as usize;
            for world in worlds.iter_mut() {
                if Instant::now() >= deadline {
                    deadline_hit = true;
                    break 'search;
                }
                let root = world.root.clone();
                if let Err(err) = self.walk(&mut search, &root, updater, 1.0, &mut world.rng) {
                    warn!("falling back to blueprint at {}: {err}", request.key);
                    return self.fallback(request, tokens, start, Some(err.to_string()));
                }
            }
            iterations += 1;
        }

        if iterations == 0 {
            let mut resolution = self.fallback(request, tokens, start, Some("no iteration completed".into()));
            resolution.diagnostics.deadline_hit = deadline_hit;
            resolution.diagnostics.worlds = worlds.len();
            return resolution;
        }

        let policy = search.store.average_strategy(&request.key, n);
        let diagnostics = Diagnostics {
            iterations_run: iterations,
            elapsed_ms: start.elapsed().as_millis() as u64,
            fallback_used: false,
            deadline_hit,
            worlds: worlds.len(),
            fallback_reason: None,
        };
        debug!(
            "resolved {} in {} iterations over {} worlds ({} ms)",
            request.key, diagnostics.iterations_run, diagnostics.worlds, diagnostics.elapsed_ms
        );
        Resolution {
            actions: tokens,
            policy,
            diagnostics,
        }
    }

    fn fallback(
        &self,
        request: &ResolveRequest<G::Action>,
        actions: Vec<ActionToken>,
        start: Instant,
        reason: Option<String>,
    ) -> Resolution {
        Resolution {
            policy: self.blueprint.policy(&request.key, request.actions.len()),
            actions,
            diagnostics: Diagnostics {
                iterations_run: 0,
                elapsed_ms: start.elapsed().as_millis() as u64,
                fallback_used: true,
                deadline_hit: Instant::now() >= start + Duration::from_millis(request.time_budget_ms),
                worlds: 0,
                fallback_reason: reason,
            },
        }
    }

    /// One external-sampling walk for `updater`, whose own reach
    /// probability so far is `reach`.
    fn walk(
        &self,
        search: &mut Search<'_>,
        state: &G::State,
        updater: usize,
        reach: f64,
        rng: &mut RandomStream,
    ) -> Result<f64> {
        let game = &self.game;
        match game.node_kind(state) {
            NodeKind::Terminal => Ok(game.payoff(state, updater)),
            NodeKind::Chance => {
                if game.street_of(state) > search.horizon {
                    return self.evaluator.evaluate(game, state, updater, rng);
                }
                let next = game.sample_chance(state, rng);
                self.walk(search, &next, updater, reach, rng)
            }
            NodeKind::Decision(seat) => {
                let actions = game.legal_actions(state);
                if actions.is_empty() {
                    return Ok(game.payoff(state, updater));
                }
                let key = game.infoset_key(state, &KeyCodec::current())?;
                let n = actions.len();
                let sigma = search.store.get_strategy(&key, n);

                if seat != updater {
                    let index = sample_index(&sigma, rng);
                    let next = game.apply_action(state, &actions[index]);
                    return self.walk(search, &next, updater, reach, rng);
                }

                let mut values = Vec::with_capacity(n);
                for (a, p) in actions.iter().zip(&sigma) {
                    let next = game.apply_action(state, a);
                    values.push(self.walk(search, &next, updater, reach * p, rng)?);
                }
                let node_value: f64 = values.iter().zip(&sigma).map(|(v, p)| v * p).sum();

                let pi = self.blueprint.policy(&key, n);
                let weight = search.config.kl_weight(game.street_of(state));
                let regrets = subgame::regularized_regrets(&values, node_value, &sigma, &pi, weight);
                for (a, r) in regrets.into_iter().enumerate() {
                    search.store.update_regret(&key, a, r);
                }
                search.store.accumulate_strategy(&key, reach, &sigma);
                Ok(node_value)
            }
        }
    }
}
