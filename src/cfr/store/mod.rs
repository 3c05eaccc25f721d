//! Storage for cumulative regrets and strategy sums.
//!
//! Two interchangeable backends sit behind [`RegretStore`]:
//!
//! - [`DenseStore`]: `f64` vectors in an `FxHashMap`, exact.
//! - [`CompactStore`]: one packed `u64` word per action, fixed-point.
//!
//! The backend is chosen once at construction ([`new_store`]); the sampler
//! and resolver only see the trait.

pub mod compact;
pub mod dense;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cfr::key::InfosetKey;

pub use compact::{accumulation_tolerance, quantization_tolerance, CompactStore, REGRET_SCALE, STRATEGY_SCALE};
pub use dense::DenseStore;

/// Which backend a store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Exact floating point.
    #[default]
    Dense,
    /// Bit-packed fixed point.
    Compact,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Dense => write!(f, "dense"),
            StoreBackend::Compact => write!(f, "compact"),
        }
    }
}

/// Per-infoset cumulative regret and strategy weight.
///
/// Entries grow on demand: an update to action `a` of an unseen key creates
/// a zeroed entry with at least `a + 1` actions.
pub trait RegretStore: Send + Sync {
    /// Backend kind.
    fn backend(&self) -> StoreBackend;

    /// Minimum cumulative regret, if any.
    fn regret_floor(&self) -> Option<f64>;

    /// Current strategy by regret matching; uniform for unseen keys or when
    /// no action has positive regret.
    fn get_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64>;

    /// Average strategy from the strategy sums; uniform when nothing was
    /// accumulated.
    fn average_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64>;

    /// Cumulative regret of one action (zero when unseen).
    fn regret(&self, key: &InfosetKey, action: usize) -> f64;

    /// Add `delta` to the regret of `action`, then apply the floor.
    fn update_regret(&mut self, key: &InfosetKey, action: usize, delta: f64);

    /// Add `reach * strategy[a]` to every strategy sum of `key`.
    fn accumulate_strategy(&mut self, key: &InfosetKey, reach: f64, strategy: &[f64]);

    /// Multiply every regret by `alpha` and every strategy sum by `beta`.
    fn discount(&mut self, alpha: f64, beta: f64);

    /// Number of stored infosets.
    fn num_infosets(&self) -> usize;

    /// Whether `key` has an entry.
    fn contains(&self, key: &InfosetKey) -> bool;

    /// Full contents in key order.
    fn export(&self) -> StoreSnapshot;

    /// Add every entry of `snapshot` to this store (regrets floored after
    /// the sum).
    fn absorb(&mut self, snapshot: &StoreSnapshot);

    /// Drop all entries.
    fn clear(&mut self);
}

/// Serializable contents of a store, sorted by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Backend the snapshot was taken from.
    pub backend: StoreBackend,
    /// Regret floor of the source store.
    pub regret_floor: Option<f64>,
    /// Entries in ascending key order.
    pub entries: Vec<SnapshotEntry>,
}

/// One exported infoset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Infoset key.
    pub key: InfosetKey,
    /// Cumulative regret per action.
    pub regrets: Vec<f64>,
    /// Cumulative strategy weight per action.
    pub strategy_sums: Vec<f64>,
}

impl StoreSnapshot {
    /// A snapshot with no entries.
    pub fn empty(backend: StoreBackend, regret_floor: Option<f64>) -> Self {
        Self {
            backend,
            regret_floor,
            entries: Vec::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Average strategies of every entry.
    pub fn strategy_table(&self) -> StrategyTable {
        let strategies = self
            .entries
            .iter()
            .map(|e| {
                let n = e.strategy_sums.len().max(e.regrets.len());
                (e.key.clone(), normalize(&e.strategy_sums, n))
            })
            .collect();
        StrategyTable { strategies }
    }
}

/// Average strategy per infoset, the artifact the resolver reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyTable {
    /// Probabilities per action, by key.
    pub strategies: BTreeMap<InfosetKey, Vec<f64>>,
}

impl StrategyTable {
    /// Strategy of one infoset.
    pub fn get(&self, key: &InfosetKey) -> Option<&[f64]> {
        self.strategies.get(key).map(Vec::as_slice)
    }

    /// Strategy of one infoset resized to `num_actions`; uniform when unseen
    /// or when the stored action count differs.
    pub fn policy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        match self.strategies.get(key) {
            Some(p) if p.len() == num_actions => p.clone(),
            _ => uniform(num_actions),
        }
    }

    /// Number of infosets.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Build an empty store of the given backend.
pub fn new_store(backend: StoreBackend, regret_floor: Option<f64>) -> Box<dyn RegretStore> {
    match backend {
        StoreBackend::Dense => Box::new(DenseStore::new(regret_floor)),
        StoreBackend::Compact => Box::new(CompactStore::new(regret_floor)),
    }
}

/// Rebuild a store from a snapshot, keeping the snapshot's backend and floor.
pub fn from_snapshot(snapshot: &StoreSnapshot) -> Box<dyn RegretStore> {
    let mut store = new_store(snapshot.backend, snapshot.regret_floor);
    store.absorb(snapshot);
    store
}

/// Uniform distribution over `n` actions.
pub fn uniform(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Regret matching over the first `n` regrets (missing ones count as zero).
pub fn regret_matching(regrets: &[f64], n: usize) -> Vec<f64> {
    let positive: Vec<f64> = (0..n)
        .map(|a| regrets.get(a).copied().unwrap_or(0.0).max(0.0))
        .collect();
    let sum: f64 = positive.iter().sum();
    if sum > 0.0 {
        positive.iter().map(|&x| x / sum).collect()
    } else {
        uniform(n)
    }
}

/// Normalize the first `n` sums into a distribution, uniform if they are all zero.
pub fn normalize(sums: &[f64], n: usize) -> Vec<f64> {
    let values: Vec<f64> = (0..n)
        .map(|a| sums.get(a).copied().unwrap_or(0.0).max(0.0))
        .collect();
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter().map(|&x| x / total).collect()
    } else {
        uniform(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::key::{ActionToken, History, KeyCodec};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key(bucket: u16) -> InfosetKey {
        KeyCodec::current()
            .encode(0, bucket, 0, History::from(vec![ActionToken::Passive]))
            .unwrap()
    }

    fn both() -> Vec<Box<dyn RegretStore>> {
        vec![
            new_store(StoreBackend::Dense, None),
            new_store(StoreBackend::Compact, None),
        ]
    }

    #[test]
    fn strategies_are_distributions() {
        let mut rng = StdRng::seed_from_u64(11);
        for mut store in both() {
            for bucket in 0..50 {
                let k = key(bucket);
                let n = rng.gen_range(1..6);
                for a in 0..n {
                    store.update_regret(&k, a, rng.gen_range(-20.0..20.0));
                }
                store.accumulate_strategy(&k, rng.gen_range(0.0..2.0), &uniform(n));
                for strategy in [store.get_strategy(&k, n), store.average_strategy(&k, n)] {
                    let sum: f64 = strategy.iter().sum();
                    assert!((sum - 1.0).abs() < 1e-9, "{} sums to {sum}", store.backend());
                    assert!(strategy.iter().all(|&p| p >= 0.0));
                }
            }
            // unseen key
            assert_eq!(store.get_strategy(&key(999), 4), vec![0.25; 4]);
        }
    }

    #[test]
    fn compact_agrees_with_dense_within_tolerance() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut dense = DenseStore::new(None);
        let mut compact = CompactStore::new(None);
        for bucket in 0..200 {
            let k = key(bucket);
            let n = rng.gen_range(2..7);
            let mut regrets = Vec::with_capacity(n);
            for a in 0..n {
                // Entries are either non-positive or at least one, so the
                // positive mass is never tiny.
                let r = if rng.gen_bool(0.5) {
                    -rng.gen_range(0.0..500.0)
                } else {
                    rng.gen_range(1.0..500.0)
                };
                regrets.push(r);
                dense.update_regret(&k, a, r);
                compact.update_regret(&k, a, r);
            }
            let positive: f64 = regrets.iter().map(|r| r.max(0.0)).sum();
            let d = dense.get_strategy(&k, n);
            let c = compact.get_strategy(&k, n);
            if positive == 0.0 {
                assert_eq!(d, c);
                continue;
            }
            let tol = quantization_tolerance(n, positive);
            for (x, y) in d.iter().zip(&c) {
                assert!((x - y).abs() <= tol, "{x} vs {y} exceeds {tol}");
            }
        }
    }

    #[test]
    fn discount_halves_and_identity() {
        for mut store in both() {
            let k = key(1);
            store.update_regret(&k, 0, 8.0);
            store.update_regret(&k, 1, -4.0);
            store.accumulate_strategy(&k, 2.0, &[0.5, 0.5]);

            store.discount(1.0, 1.0);
            assert_eq!(store.regret(&k, 0), 8.0);
            assert_eq!(store.regret(&k, 1), -4.0);

            store.discount(0.5, 0.5);
            assert_eq!(store.regret(&k, 0), 4.0);
            assert_eq!(store.regret(&k, 1), -2.0);
            let snap = store.export();
            assert_eq!(snap.entries[0].strategy_sums, vec![0.5, 0.5]);
        }
    }

    #[test]
    fn floor_bounds_regret() {
        for backend in [StoreBackend::Dense, StoreBackend::Compact] {
            let mut store = new_store(backend, Some(0.0));
            let k = key(2);
            store.update_regret(&k, 0, -3.0);
            assert_eq!(store.regret(&k, 0), 0.0);
            store.update_regret(&k, 0, 2.5);
            assert_eq!(store.regret(&k, 0), 2.5);
        }
    }

    #[test]
    fn snapshot_round_trip_is_exact() {
        let mut rng = StdRng::seed_from_u64(3);
        for mut store in both() {
            for bucket in 0..20 {
                let k = key(bucket);
                store.update_regret(&k, 0, rng.gen_range(-5.0..5.0));
                store.update_regret(&k, 2, rng.gen_range(-5.0..5.0));
                store.accumulate_strategy(&k, 1.0, &[0.2, 0.3, 0.5]);
            }
            let snap = store.export();
            let bytes = bincode::serialize(&snap).unwrap();
            let back: StoreSnapshot = bincode::deserialize(&bytes).unwrap();
            let rebuilt = from_snapshot(&back);
            assert_eq!(rebuilt.backend(), store.backend());
            assert_eq!(rebuilt.export(), snap);
        }
    }

    #[test]
    fn export_is_sorted_and_absorb_adds() {
        let mut a = DenseStore::new(None);
        let mut b = DenseStore::new(None);
        a.update_regret(&key(9), 0, 1.0);
        a.update_regret(&key(3), 1, 2.0);
        b.update_regret(&key(3), 1, 0.5);

        let snap = a.export();
        assert!(snap.entries.windows(2).all(|w| w[0].key < w[1].key));

        b.absorb(&snap);
        assert_eq!(b.regret(&key(3), 1), 2.5);
        assert_eq!(b.regret(&key(9), 0), 1.0);
        assert_eq!(b.num_infosets(), 2);
    }

    #[test]
    fn strategy_table_normalizes_sums() {
        let mut store = DenseStore::new(None);
        store.accumulate_strategy(&key(1), 1.0, &[0.75, 0.25]);
        store.accumulate_strategy(&key(1), 3.0, &[0.25, 0.75]);
        let table = store.export().strategy_table();
        let p = table.get(&key(1)).unwrap();
        assert!((p[0] - 0.375).abs() < 1e-12);
        assert_eq!(table.policy(&key(1), 3), uniform(3));
    }
}
