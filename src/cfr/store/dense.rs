//! Exact floating-point regret storage.

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::{normalize, regret_matching, RegretStore, SnapshotEntry, StoreBackend, StoreSnapshot};
use crate::cfr::key::InfosetKey;

#[derive(Debug, Clone, Default, PartialEq)]
struct Entry {
    regrets: Vec<f64>,
    strategy_sums: Vec<f64>,
}

impl Entry {
    fn grow(&mut self, n: usize) {
        if self.regrets.len() < n {
            self.regrets.resize(n, 0.0);
        }
        if self.strategy_sums.len() < n {
            self.strategy_sums.resize(n, 0.0);
        }
    }
}

/// Regrets and strategy sums as `f64` vectors keyed by infoset.
///
/// This is the reference backend: the resolver's ephemeral subgame store and
/// the workers' delta shards are always dense.
#[derive(Debug, Clone, Default)]
pub struct DenseStore {
    entries: FxHashMap<InfosetKey, Entry>,
    floor: Option<f64>,
}

impl DenseStore {
    /// Create an empty store; `floor` bounds cumulative regret from below.
    pub fn new(floor: Option<f64>) -> Self {
        Self {
            entries: FxHashMap::default(),
            floor,
        }
    }

    /// Create an empty store with pre-allocated capacity.
    pub fn with_capacity(capacity: usize, floor: Option<f64>) -> Self {
        Self {
            entries: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            floor,
        }
    }

    /// Rough heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, e)| {
                k.history().len()
                    + (e.regrets.len() + e.strategy_sums.len()) * std::mem::size_of::<f64>()
            })
            .sum()
    }

    fn entry(&mut self, key: &InfosetKey, n: usize) -> &mut Entry {
        let entry = self.entries.entry(key.clone()).or_default();
        entry.grow(n);
        entry
    }
}

impl RegretStore for DenseStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Dense
    }

    fn regret_floor(&self) -> Option<f64> {
        self.floor
    }

    fn get_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        match self.entries.get(key) {
            Some(e) => regret_matching(&e.regrets, num_actions),
            None => regret_matching(&[], num_actions),
        }
    }

    fn average_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        match self.entries.get(key) {
            Some(e) => normalize(&e.strategy_sums, num_actions),
            None => normalize(&[], num_actions),
        }
    }

    fn regret(&self, key: &InfosetKey, action: usize) -> f64 {
        self.entries
            .get(key)
            .and_then(|e| e.regrets.get(action).copied())
            .unwrap_or(0.0)
    }

    fn update_regret(&mut self, key: &InfosetKey, action: usize, delta: f64) {
        let floor = self.floor;
        let entry = self.entry(key, action + 1);
        entry.regrets[action] = floored(entry.regrets[action] + delta, floor);
    }

    fn accumulate_strategy(&mut self, key: &InfosetKey, reach: f64, strategy: &[f64]) {
        let entry = self.entry(key, strategy.len());
        for (sum, &p) in entry.strategy_sums.iter_mut().zip(strategy) {
            *sum += reach * p;
        }
    }

    fn discount(&mut self, alpha: f64, beta: f64) {
        self.entries.par_iter_mut().for_each(|(_, e)| {
            e.regrets.iter_mut().for_each(|r| *r *= alpha);
            e.strategy_sums.iter_mut().for_each(|s| *s *= beta);
        });
    }

    fn num_infosets(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, key: &InfosetKey) -> bool {
        self.entries.contains_key(key)
    }

    fn export(&self) -> StoreSnapshot {
        let mut entries: Vec<SnapshotEntry> = self
            .entries
            .iter()
            .map(|(k, e)| SnapshotEntry {
                key: k.clone(),
                regrets: e.regrets.clone(),
                strategy_sums: e.strategy_sums.clone(),
            })
            .collect();
        entries.par_sort_unstable_by(|a, b| a.key.cmp(&b.key));
        StoreSnapshot {
            backend: StoreBackend::Dense,
            regret_floor: self.floor,
            entries,
        }
    }

    fn absorb(&mut self, snapshot: &StoreSnapshot) {
        let floor = self.floor;
        for incoming in &snapshot.entries {
            let n = incoming.regrets.len().max(incoming.strategy_sums.len());
            let entry = self.entry(&incoming.key, n);
            for (s, d) in entry.strategy_sums.iter_mut().zip(&incoming.strategy_sums) {
                *s += d;
            }
            for (r, d) in entry.regrets.iter_mut().zip(&incoming.regrets) {
                *r = floored(*r + d, floor);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

fn floored(value: f64, floor: Option<f64>) -> f64 {
    match floor {
        Some(f) => value.max(f),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::key::{History, KeyCodec};

    #[test]
    fn entries_grow_on_demand() {
        let mut store = DenseStore::with_capacity(4, None);
        let k = KeyCodec::current().encode(0, 1, 0, History::new()).unwrap();
        store.update_regret(&k, 2, 3.0);
        assert_eq!(store.regret(&k, 0), 0.0);
        assert_eq!(store.regret(&k, 2), 3.0);
        assert_eq!(store.get_strategy(&k, 3), vec![0.0, 0.0, 1.0]);
        assert!(store.memory_usage() > 0);
    }

    #[test]
    fn absorb_applies_floor_after_sum() {
        let k = KeyCodec::current().encode(0, 1, 0, History::new()).unwrap();
        let mut master = DenseStore::new(Some(-1.0));
        master.update_regret(&k, 0, 0.5);

        let mut delta = DenseStore::new(None);
        delta.update_regret(&k, 0, -4.0);
        master.absorb(&delta.export());
        assert_eq!(master.regret(&k, 0), -1.0);
    }
}
