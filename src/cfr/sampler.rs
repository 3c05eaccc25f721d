//! External-sampling MCCFR tree walk.
//!
//! One iteration walks the tree once from the root for a single updating
//! player chosen round-robin (`iteration % num_players`):
//!
//! - **Terminal**: return the updating player's payoff.
//! - **Chance**: sample one outcome and recurse; never updated.
//! - **Updating player's decision**: evaluate every legal action (minus
//!   pruned ones), add `value[a] - node_value` to each explored action's
//!   regret and accumulate the current strategy weighted by reach.
//! - **Other players' decisions**: sample one action from the current
//!   strategy, or uniformly with probability `epsilon(iteration)`.
//!
//! Unexpected nodes, foreign key versions and invalid reach probabilities
//! abort the iteration with a coded [`TraversalFault`].

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cfr::config::SamplerConfig;
use crate::cfr::game::{Game, NodeKind};
use crate::cfr::key::{InfosetKey, KeyCodec};
use crate::cfr::store::RegretStore;
use crate::cfr::stream::{RandomStream, StreamState};
use crate::error::{Result, SolverError, TraversalFault};

/// Hooks invoked during a walk.
pub trait SamplerObserver {
    /// A regret update is about to be applied.
    fn on_regret_update(&mut self, _key: &InfosetKey, _action: usize, _delta: f64) {}

    /// An action was skipped by pruning.
    fn on_prune(&mut self, _key: &InfosetKey, _action: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SamplerObserver for NoopObserver {}

/// Counters of one or more iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    /// Iterations covered.
    pub iterations: u64,
    /// Tree nodes visited.
    pub nodes_visited: u64,
    /// Regret updates applied.
    pub regret_updates: u64,
    /// Actions skipped by pruning.
    pub pruned_actions: u64,
    /// Root value for the updating player (last iteration).
    pub root_value: f64,
}

impl IterationReport {
    /// Add another report's counters.
    pub fn merge(&mut self, other: &IterationReport) {
        self.iterations += other.iterations;
        self.nodes_visited += other.nodes_visited;
        self.regret_updates += other.regret_updates;
        self.pruned_actions += other.pruned_actions;
        self.root_value = other.root_value;
    }
}

struct Walk<'a, S: ?Sized, O: ?Sized> {
    store: &'a mut S,
    observer: &'a mut O,
    iteration: u64,
    updater: usize,
    epsilon: f64,
    prune: bool,
    weight: f64,
    report: IterationReport,
}

/// Walks a game for a sequence of iterations with its own random stream.
#[derive(Debug, Clone)]
pub struct Sampler<G: Game> {
    game: G,
    config: SamplerConfig,
    codec: KeyCodec,
    rng: RandomStream,
}

impl<G: Game> Sampler<G> {
    /// Create a sampler using the current key codec.
    pub fn new(game: G, config: SamplerConfig, rng: RandomStream) -> Self {
        Self {
            game,
            config,
            codec: KeyCodec::current(),
            rng,
        }
    }

    /// The game being walked.
    pub fn game(&self) -> &G {
        &self.game
    }

    /// Sampler settings.
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Codec keys are checked against.
    pub fn codec(&self) -> KeyCodec {
        self.codec
    }

    /// Current position of the random stream.
    pub fn stream_state(&self) -> StreamState {
        self.rng.state()
    }

    /// Replace the random stream.
    pub fn set_stream(&mut self, rng: RandomStream) {
        self.rng = rng;
    }

    /// Seat updated at `iteration`.
    pub fn updating_player(&self, iteration: u64) -> usize {
        (iteration % self.game.num_players().max(1) as u64) as usize
    }

    /// Run one iteration.
    pub fn run_iteration<S>(&mut self, iteration: u64, store: &mut S) -> Result<IterationReport>
    where
        S: RegretStore + ?Sized,
    {
        self.run_iteration_observed(iteration, store, &mut NoopObserver)
    }

    /// Run one iteration, reporting updates and prunes to `observer`.
    pub fn run_iteration_observed<S, O>(
        &mut self,
        iteration: u64,
        store: &mut S,
        observer: &mut O,
    ) -> Result<IterationReport>
    where
        S: RegretStore + ?Sized,
        O: SamplerObserver + ?Sized,
    {
        let weight = if self.config.linear_averaging {
            (iteration + 1) as f64
        } else {
            1.0
        };
        let mut walk = Walk {
            store,
            observer,
            iteration,
            updater: self.updating_player(iteration),
            epsilon: self.config.epsilon.epsilon(iteration),
            prune: self.config.pruning.active(iteration),
            weight,
            report: IterationReport {
                iterations: 1,
                ..Default::default()
            },
        };

        let root = self.game.initial_state();
        let reach = vec![1.0; self.game.num_players()];
        let value = self.traverse(&mut walk, &root, &reach)?;
        walk.report.root_value = value;
        Ok(walk.report)
    }

    /// Run `count` consecutive iterations starting at `first`.
    pub fn run_batch<S>(&mut self, first: u64, count: u64, store: &mut S) -> Result<IterationReport>
    where
        S: RegretStore + ?Sized,
    {
        let mut total = IterationReport::default();
        for iteration in first..first + count {
            let report = self.run_iteration(iteration, store)?;
            total.merge(&report);
        }
        Ok(total)
    }

    fn fault(iteration: u64, fault: TraversalFault, detail: String) -> SolverError {
        SolverError::Traversal {
            fault,
            iteration,
            detail,
        }
    }

    fn traverse<S, O>(&mut self, walk: &mut Walk<'_, S, O>, state: &G::State, reach: &[f64]) -> Result<f64>
    where
        S: RegretStore + ?Sized,
        O: SamplerObserver + ?Sized,
    {
        walk.report.nodes_visited += 1;

        if let Some((seat, r)) = reach
            .iter()
            .enumerate()
            .find(|(_, r)| !(r.is_finite() && **r >= 0.0))
        {
            return Err(Self::fault(
                walk.iteration,
                TraversalFault::NegativeReach,
                format!("seat {} reach {}", seat, r),
            ));
        }

        match self.game.node_kind(state) {
            NodeKind::Terminal => Ok(self.game.payoff(state, walk.updater)),
            NodeKind::Chance => {
                let next = self.game.sample_chance(state, &mut self.rng);
                self.traverse(walk, &next, reach)
            }
            NodeKind::Decision(seat) => {
                if seat >= reach.len() {
                    return Err(Self::fault(
                        walk.iteration,
                        TraversalFault::UnexpectedNode,
                        format!("acting seat {} of {}", seat, reach.len()),
                    ));
                }
                let actions = self.game.legal_actions(state);
                if actions.is_empty() {
                    return Err(Self::fault(
                        walk.iteration,
                        TraversalFault::UnexpectedNode,
                        format!("decision for seat {} without legal actions", seat),
                    ));
                }
                let key = self.game.infoset_key(state, &self.codec)?;
                if self.codec.check(&key).is_err() {
                    return Err(Self::fault(
                        walk.iteration,
                        TraversalFault::KeyVersion,
                        format!("key {} under codec v{}", key, self.codec.version()),
                    ));
                }

                if seat == walk.updater {
                    self.update_node(walk, state, reach, seat, &key, &actions)
                } else {
                    self.sample_node(walk, state, reach, seat, &key, &actions)
                }
            }
        }
    }

    fn update_node<S, O>(
        &mut self,
        walk: &mut Walk<'_, S, O>,
        state: &G::State,
        reach: &[f64],
        seat: usize,
        key: &InfosetKey,
        actions: &[G::Action],
    ) -> Result<f64>
    where
        S: RegretStore + ?Sized,
        O: SamplerObserver + ?Sized,
    {
        let n = actions.len();
        let strategy = walk.store.get_strategy(key, n);

        let mut explored = vec![true; n];
        if walk.prune {
            let pruning = &self.config.pruning;
            for (a, slot) in explored.iter_mut().enumerate() {
                if walk.store.regret(key, a) < pruning.threshold
                    && self.rng.gen::<f64>() < pruning.probability
                {
                    *slot = false;
                }
            }
            if explored.iter().all(|e| !e) {
                explored.fill(true);
            }
        }

        let mut values = vec![0.0; n];
        for (a, action) in actions.iter().enumerate() {
            if !explored[a] {
                walk.observer.on_prune(key, a);
                walk.report.pruned_actions += 1;
                continue;
            }
            let next = self.game.apply_action(state, action);
            let mut next_reach = reach.to_vec();
            next_reach[seat] *= strategy[a];
            values[a] = self.traverse(walk, &next, &next_reach)?;
        }

        let node_value: f64 = (0..n)
            .filter(|&a| explored[a])
            .map(|a| strategy[a] * values[a])
            .sum();

        for a in (0..n).filter(|&a| explored[a]) {
            let delta = values[a] - node_value;
            walk.observer.on_regret_update(key, a, delta);
            walk.store.update_regret(key, a, delta);
            walk.report.regret_updates += 1;
        }

        walk.store
            .accumulate_strategy(key, reach[seat] * walk.weight, &strategy);

        Ok(node_value)
    }

    fn sample_node<S, O>(
        &mut self,
        walk: &mut Walk<'_, S, O>,
        state: &G::State,
        reach: &[f64],
        seat: usize,
        key: &InfosetKey,
        actions: &[G::Action],
    ) -> Result<f64>
    where
        S: RegretStore + ?Sized,
        O: SamplerObserver + ?Sized,
    {
        let strategy = walk.store.get_strategy(key, actions.len());
        let index = if walk.epsilon > 0.0 && self.rng.gen::<f64>() < walk.epsilon {
            self.rng.gen_range(0..actions.len())
        } else {
            sample_index(&strategy, &mut self.rng)
        };

        let next = self.game.apply_action(state, &actions[index]);
        let mut next_reach = reach.to_vec();
        next_reach[seat] *= strategy[index];
        self.traverse(walk, &next, &next_reach)
    }
}

/// Sample an index according to a probability distribution.
pub fn sample_index<R: Rng + ?Sized>(distribution: &[f64], rng: &mut R) -> usize {
    let r: f64 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in distribution.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }
    // Floating point slack lands on the last action.
    distribution.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::config::PruningConfig;
    use crate::cfr::store::{DenseStore, StoreBackend, StoreSnapshot};
    use crate::games::toy::{DominatedChoice, FaultyGame, FaultKind};

    /// Store wrapper that logs every `update_regret` call.
    struct SpyStore {
        inner: DenseStore,
        updates: Vec<(InfosetKey, usize)>,
        corrupt: bool,
    }

    impl SpyStore {
        fn new(inner: DenseStore) -> Self {
            Self {
                inner,
                updates: Vec::new(),
                corrupt: false,
            }
        }
    }

    impl RegretStore for SpyStore {
        fn backend(&self) -> StoreBackend {
            self.inner.backend()
        }
        fn regret_floor(&self) -> Option<f64> {
            self.inner.regret_floor()
        }
        fn get_strategy(&self, key: &InfosetKey, n: usize) -> Vec<f64> {
            let mut strategy = self.inner.get_strategy(key, n);
            if self.corrupt {
                strategy[0] = -0.5;
            }
            strategy
        }
        fn average_strategy(&self, key: &InfosetKey, n: usize) -> Vec<f64> {
            self.inner.average_strategy(key, n)
        }
        fn regret(&self, key: &InfosetKey, action: usize) -> f64 {
            self.inner.regret(key, action)
        }
        fn update_regret(&mut self, key: &InfosetKey, action: usize, delta: f64) {
            self.updates.push((key.clone(), action));
            self.inner.update_regret(key, action, delta)
        }
        fn accumulate_strategy(&mut self, key: &InfosetKey, reach: f64, strategy: &[f64]) {
            self.inner.accumulate_strategy(key, reach, strategy)
        }
        fn discount(&mut self, alpha: f64, beta: f64) {
            self.inner.discount(alpha, beta)
        }
        fn num_infosets(&self) -> usize {
            self.inner.num_infosets()
        }
        fn contains(&self, key: &InfosetKey) -> bool {
            self.inner.contains(key)
        }
        fn export(&self) -> StoreSnapshot {
            self.inner.export()
        }
        fn absorb(&mut self, snapshot: &StoreSnapshot) {
            self.inner.absorb(snapshot)
        }
        fn clear(&mut self) {
            self.inner.clear()
        }
    }

    #[derive(Default)]
    struct Recorder {
        updates: Vec<(InfosetKey, usize)>,
        prunes: Vec<(InfosetKey, usize)>,
    }

    impl SamplerObserver for Recorder {
        fn on_regret_update(&mut self, key: &InfosetKey, action: usize, _delta: f64) {
            self.updates.push((key.clone(), action));
        }
        fn on_prune(&mut self, key: &InfosetKey, action: usize) {
            self.prunes.push((key.clone(), action));
        }
    }

    fn sampler(config: SamplerConfig) -> Sampler<DominatedChoice> {
        Sampler::new(DominatedChoice::new(), config, RandomStream::from_seed(7))
    }

    #[test]
    fn updating_player_is_round_robin() {
        let s = sampler(SamplerConfig::vanilla());
        let seats: Vec<usize> = (0..6).map(|t| s.updating_player(t)).collect();
        assert_eq!(seats, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn dominated_action_loses_regret() {
        let mut s = sampler(SamplerConfig::vanilla());
        let mut store = DenseStore::new(None);
        s.run_batch(0, 2, &mut store).unwrap();

        let key = DominatedChoice::new().root_key().unwrap();
        assert!(store.regret(&key, DominatedChoice::A) > 0.0);
        assert!(store.regret(&key, DominatedChoice::B) < 0.0);
    }

    #[test]
    fn pruned_action_gets_no_regret_update() {
        let config = SamplerConfig {
            pruning: PruningConfig {
                enabled: true,
                threshold: -10.0,
                probability: 1.0,
                warmup: 0,
            },
            ..SamplerConfig::vanilla()
        };
        let mut s = sampler(config);
        let key = DominatedChoice::new().root_key().unwrap();

        let mut inner = DenseStore::new(None);
        inner.update_regret(&key, DominatedChoice::B, -50.0);
        let mut store = SpyStore::new(inner);
        let mut recorder = Recorder::default();

        let report = s.run_iteration_observed(0, &mut store, &mut recorder).unwrap();
        assert_eq!(report.pruned_actions, 1);
        assert_eq!(recorder.prunes, vec![(key.clone(), DominatedChoice::B)]);
        assert!(!store.updates.contains(&(key.clone(), DominatedChoice::B)));
        assert!(!recorder.updates.contains(&(key.clone(), DominatedChoice::B)));
        assert!(store.updates.contains(&(key, DominatedChoice::A)));
    }

    #[test]
    fn pruning_waits_for_warmup() {
        let config = SamplerConfig {
            pruning: PruningConfig {
                enabled: true,
                threshold: -10.0,
                probability: 1.0,
                warmup: 5,
            },
            ..SamplerConfig::vanilla()
        };
        let mut s = sampler(config);
        let key = DominatedChoice::new().root_key().unwrap();
        let mut store = DenseStore::new(None);
        store.update_regret(&key, DominatedChoice::B, -50.0);

        let report = s.run_iteration(0, &mut store).unwrap();
        assert_eq!(report.pruned_actions, 0);
        let report = s.run_iteration(6, &mut store).unwrap();
        assert_eq!(report.pruned_actions, 1);
    }

    #[test]
    fn faults_are_coded() {
        let cases = [
            (FaultKind::NoActions, TraversalFault::UnexpectedNode),
            (FaultKind::SeatOutOfRange, TraversalFault::UnexpectedNode),
            (FaultKind::ForeignKey, TraversalFault::KeyVersion),
        ];
        for (kind, expected) in cases {
            let mut s = Sampler::new(
                FaultyGame::new(kind),
                SamplerConfig::vanilla(),
                RandomStream::from_seed(1),
            );
            let mut store = DenseStore::new(None);
            match s.run_iteration(3, &mut store) {
                Err(SolverError::Traversal { fault, iteration, .. }) => {
                    assert_eq!(fault, expected);
                    assert_eq!(iteration, 3);
                }
                other => panic!("{kind:?}: expected traversal fault, got {other:?}"),
            }
        }
    }

    #[test]
    fn unencodable_key_aborts_iteration() {
        let mut s = Sampler::new(
            FaultyGame::new(FaultKind::UnencodableHistory),
            SamplerConfig::vanilla(),
            RandomStream::from_seed(1),
        );
        let mut store = DenseStore::new(None);
        assert!(matches!(
            s.run_iteration(0, &mut store),
            Err(SolverError::MalformedKey(_))
        ));
        assert_eq!(store.num_infosets(), 0);
    }

    #[test]
    fn negative_reach_aborts_iteration() {
        let mut s = sampler(SamplerConfig::vanilla());
        let mut store = SpyStore::new(DenseStore::new(None));
        store.corrupt = true;
        let err = s.run_iteration(0, &mut store).unwrap_err();
        assert!(
            matches!(err, SolverError::Traversal { fault: TraversalFault::NegativeReach, .. }),
            "{err}"
        );
        assert!(store.updates.is_empty());
    }

    #[test]
    fn same_stream_gives_same_result() {
        let run = || {
            let mut s = sampler(SamplerConfig::default());
            let mut store = DenseStore::new(None);
            s.run_batch(0, 50, &mut store).unwrap();
            (store.export(), s.stream_state())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn sample_index_follows_distribution() {
        let mut rng = RandomStream::from_seed(3);
        let mut counts = [0usize; 3];
        for _ in 0..3_000 {
            counts[sample_index(&[0.0, 0.25, 0.75], &mut rng)] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[2] > counts[1] * 2);
    }
}
