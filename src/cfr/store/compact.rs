//! Bit-packed fixed-point regret storage.
//!
//! Each action occupies one `u64` word:
//!
//! ```text
//!  63                32 31                 0
//! +--------------------+--------------------+
//! |  regret (i32)      |  strategy sum (u32)|
//! +--------------------+--------------------+
//! ```
//!
//! Regret is stored as `round(regret * REGRET_SCALE)`, saturating at the
//! `i32` range; with no configured floor the floor is `i32::MIN`. Strategy
//! sums are stored as `round(sum * STRATEGY_SCALE)`; when an addition would
//! overflow `u32`, every sum of that entry is halved until it fits, which
//! keeps the average-strategy ratios.
//!
//! Every `reach * p` contribution is rounded on its own, so one below
//! `0.5 / STRATEGY_SCALE` (about 0.002) adds nothing. Low-reach infosets
//! therefore drift from the dense backend by up to
//! [`accumulation_tolerance`], which is separate from and usually much
//! looser than the regret bound [`quantization_tolerance`].

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::{normalize, regret_matching, RegretStore, SnapshotEntry, StoreBackend, StoreSnapshot};
use crate::cfr::key::InfosetKey;

/// Fixed-point units per unit of regret.
pub const REGRET_SCALE: f64 = 1024.0;

/// Fixed-point units per unit of strategy weight.
pub const STRATEGY_SCALE: f64 = 256.0;

/// Largest error of one quantized regret.
const REGRET_STEP: f64 = 0.5 / REGRET_SCALE;

/// Largest error of one quantized strategy-sum contribution.
const SUM_STEP: f64 = 0.5 / STRATEGY_SCALE;

/// Bound on the per-action difference between compact and dense strategies.
///
/// For `num_actions` regrets each quantized once, with positive mass
/// `positive_mass` in the dense store, every regret-matching probability
/// differs by at most `(n + 1) * e / (P - n * e)` where `e = 0.5 / 1024`.
pub fn quantization_tolerance(num_actions: usize, positive_mass: f64) -> f64 {
    let n = num_actions as f64;
    let denominator = (positive_mass - n * REGRET_STEP).max(REGRET_STEP);
    (n + 1.0) * REGRET_STEP / denominator
}

/// Bound on the per-action difference between compact and dense average
/// strategies.
///
/// After `contributions` calls to `accumulate_strategy` adding a dense total
/// weight of `total_weight` over `num_actions` actions, each sum is off by at
/// most `k * s` with `s = 0.5 / 256`, so every average probability differs
/// by at most `(n + 1) * k * s / (T - n * k * s)`, capped at 1. Overflow
/// halving adds one more step per halving and is not included.
pub fn accumulation_tolerance(num_actions: usize, contributions: u64, total_weight: f64) -> f64 {
    let n = num_actions as f64;
    let drift = contributions as f64 * SUM_STEP;
    let denominator = total_weight - n * drift;
    if denominator <= 0.0 {
        return 1.0;
    }
    ((n + 1.0) * drift / denominator).min(1.0)
}

fn pack(regret: i32, sum: u32) -> u64 {
    (u64::from(regret as u32) << 32) | u64::from(sum)
}

fn regret_bits(word: u64) -> i32 {
    (word >> 32) as u32 as i32
}

fn sum_bits(word: u64) -> u32 {
    word as u32
}

fn quantize_regret(value: f64) -> i64 {
    // `as` saturates on overflow and maps NaN to zero.
    (value * REGRET_SCALE).round() as i64
}

fn quantize_sum(value: f64) -> u64 {
    (value * STRATEGY_SCALE).round().max(0.0) as u64
}

/// Fixed-point store packing regret and strategy sum into one word per action.
#[derive(Debug, Clone)]
pub struct CompactStore {
    entries: FxHashMap<InfosetKey, Vec<u64>>,
    floor: Option<f64>,
    floor_bits: i32,
}

impl Default for CompactStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CompactStore {
    /// Create an empty store; without a floor regrets saturate at `i32::MIN`.
    pub fn new(floor: Option<f64>) -> Self {
        let floor_bits = floor
            .map(|f| quantize_regret(f).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
            .unwrap_or(i32::MIN);
        Self {
            entries: FxHashMap::default(),
            floor,
            floor_bits,
        }
    }

    /// Heap footprint in bytes of the packed words.
    pub fn memory_usage(&self) -> usize {
        self.entries
            .iter()
            .map(|(k, w)| k.history().len() + w.len() * std::mem::size_of::<u64>())
            .sum()
    }

    fn words(&mut self, key: &InfosetKey, n: usize) -> &mut Vec<u64> {
        let words = self.entries.entry(key.clone()).or_default();
        if words.len() < n {
            words.resize(n, pack(0, 0));
        }
        words
    }

    fn clamp_regret(floor_bits: i32, value: i64) -> i32 {
        value.clamp(i64::from(floor_bits), i64::from(i32::MAX)) as i32
    }

    fn add_sums(words: &mut [u64], additions: &[u64]) {
        let mut sums: Vec<u64> = words.iter().map(|&w| u64::from(sum_bits(w))).collect();
        for (s, add) in sums.iter_mut().zip(additions) {
            *s = s.saturating_add(*add);
        }
        while sums.iter().any(|&s| s > u64::from(u32::MAX)) {
            sums.iter_mut().for_each(|s| *s >>= 1);
        }
        for (w, s) in words.iter_mut().zip(sums) {
            *w = pack(regret_bits(*w), s as u32);
        }
    }

    fn regrets_f64(words: &[u64]) -> Vec<f64> {
        words
            .iter()
            .map(|&w| f64::from(regret_bits(w)) / REGRET_SCALE)
            .collect()
    }

    fn sums_f64(words: &[u64]) -> Vec<f64> {
        words
            .iter()
            .map(|&w| f64::from(sum_bits(w)) / STRATEGY_SCALE)
            .collect()
    }
}

impl RegretStore for CompactStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Compact
    }

    fn regret_floor(&self) -> Option<f64> {
        self.floor
    }

    fn get_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        match self.entries.get(key) {
            Some(words) => regret_matching(&Self::regrets_f64(words), num_actions),
            None => regret_matching(&[], num_actions),
        }
    }

    fn average_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        match self.entries.get(key) {
            Some(words) => normalize(&Self::sums_f64(words), num_actions),
            None => normalize(&[], num_actions),
        }
    }

    fn regret(&self, key: &InfosetKey, action: usize) -> f64 {
        self.entries
            .get(key)
            .and_then(|w| w.get(action))
            .map(|&w| f64::from(regret_bits(w)) / REGRET_SCALE)
            .unwrap_or(0.0)
    }

    fn update_regret(&mut self, key: &InfosetKey, action: usize, delta: f64) {
        let floor_bits = self.floor_bits;
        let words = self.words(key, action + 1);
        let word = words[action];
        let value = i64::from(regret_bits(word)).saturating_add(quantize_regret(delta));
        words[action] = pack(Self::clamp_regret(floor_bits, value), sum_bits(word));
    }

    fn accumulate_strategy(&mut self, key: &InfosetKey, reach: f64, strategy: &[f64]) {
        let additions: Vec<u64> = strategy.iter().map(|&p| quantize_sum(reach * p)).collect();
        let words = self.words(key, strategy.len());
        Self::add_sums(words, &additions);
    }

    fn discount(&mut self, alpha: f64, beta: f64) {
        let floor_bits = self.floor_bits;
        self.entries.par_iter_mut().for_each(|(_, words)| {
            for w in words.iter_mut() {
                let regret = (f64::from(regret_bits(*w)) * alpha).round() as i64;
                let sum = (f64::from(sum_bits(*w)) * beta).round().max(0.0);
                *w = pack(
                    Self::clamp_regret(floor_bits, regret),
                    sum.min(f64::from(u32::MAX)) as u32,
                );
            }
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
            .map(|(k, words)| SnapshotEntry {
                key: k.clone(),
                regrets: Self::regrets_f64(words),
                strategy_sums: Self::sums_f64(words),
            })
            .collect();
        entries.par_sort_unstable_by(|a, b| a.key.cmp(&b.key));
        StoreSnapshot {
            backend: StoreBackend::Compact,
            regret_floor: self.floor,
            entries,
        }
    }

    fn absorb(&mut self, snapshot: &StoreSnapshot) {
        let floor_bits = self.floor_bits;
        for incoming in &snapshot.entries {
            let n = incoming.regrets.len().max(incoming.strategy_sums.len());
            let words = self.words(&incoming.key, n);
            for (w, d) in words.iter_mut().zip(&incoming.regrets) {
                let value = i64::from(regret_bits(*w)).saturating_add(quantize_regret(*d));
                *w = pack(Self::clamp_regret(floor_bits, value), sum_bits(*w));
            }
            let additions: Vec<u64> = incoming.strategy_sums.iter().map(|&s| quantize_sum(s)).collect();
            Self::add_sums(words, &additions);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::key::{History, KeyCodec};

    fn key() -> InfosetKey {
        KeyCodec::current().encode(1, 4, 1, History::new()).unwrap()
    }

    #[test]
    fn packing_keeps_sign() {
        let w = pack(-5, 77);
        assert_eq!(regret_bits(w), -5);
        assert_eq!(sum_bits(w), 77);
        let w = pack(i32::MIN, u32::MAX);
        assert_eq!(regret_bits(w), i32::MIN);
        assert_eq!(sum_bits(w), u32::MAX);
    }

    #[test]
    fn regret_saturates_at_i32_min_without_floor() {
        let mut store = CompactStore::new(None);
        let k = key();
        store.update_regret(&k, 0, -1e12);
        assert_eq!(store.regret(&k, 0), f64::from(i32::MIN) / REGRET_SCALE);
        store.update_regret(&k, 0, -1.0);
        assert_eq!(store.regret(&k, 0), f64::from(i32::MIN) / REGRET_SCALE);
    }

    #[test]
    fn overflowing_sums_are_halved_together() {
        let mut store = CompactStore::new(None);
        let k = key();
        let big = f64::from(u32::MAX) / STRATEGY_SCALE;
        store.accumulate_strategy(&k, big * 0.9, &[0.75, 0.25]);
        let before = store.average_strategy(&k, 2);
        store.accumulate_strategy(&k, big * 0.9, &[0.75, 0.25]);
        let after = store.average_strategy(&k, 2);
        assert!((before[0] - 0.75).abs() < 1e-6);
        assert!((after[0] - 0.75).abs() < 1e-6, "{after:?}");
        let sums = store.export().entries[0].strategy_sums.clone();
        assert!(sums.iter().all(|&s| s <= big));
    }

    #[test]
    fn small_contributions_round_away_within_bound() {
        use crate::cfr::store::DenseStore;

        let k = key();
        let mut compact = CompactStore::new(None);
        let mut dense = DenseStore::new(None);
        for _ in 0..1000 {
            compact.accumulate_strategy(&k, 0.01, &[0.9, 0.1]);
            dense.accumulate_strategy(&k, 0.01, &[0.9, 0.1]);
        }
        compact.accumulate_strategy(&k, 1.0, &[0.2, 0.8]);
        dense.accumulate_strategy(&k, 1.0, &[0.2, 0.8]);

        // 0.001 per visit is below half a fixed-point unit.
        assert_eq!(compact.export().entries[0].strategy_sums[1], 205.0 / STRATEGY_SCALE);

        let c = compact.average_strategy(&k, 2);
        let d = dense.average_strategy(&k, 2);
        let drift = (c[0] - d[0]).abs();
        assert!(drift > 0.05, "rounding drift {drift}");
        assert!(drift <= accumulation_tolerance(2, 1001, 11.0));
    }

    #[test]
    fn accumulation_tolerance_is_capped() {
        assert_eq!(accumulation_tolerance(2, 10_000, 1.0), 1.0);
        assert!(accumulation_tolerance(2, 10, 1_000.0) < 1e-4);
    }

    #[test]
    fn tolerance_shrinks_with_mass() {
        assert!(quantization_tolerance(3, 100.0) < quantization_tolerance(3, 1.0));
        assert!(quantization_tolerance(2, 1.0) < 0.002);
    }
}
