//! Subgame construction and leaf evaluation.
//!
//! A subgame is rooted at a live infoset. Because the key only fixes the
//! acting seat's own bucket, the resolver rebuilds a set of concrete
//! *worlds* consistent with it: hidden opponent buckets are drawn in
//! proportion to how likely the blueprint was to take the observed
//! actions with them, and every world gets its own chance seed.

use rand::Rng;

use crate::cfr::game::{Action, Game, NodeKind};
use crate::cfr::key::{InfosetKey, KeyCodec};
use crate::cfr::sampler::sample_index;
use crate::cfr::stream::RandomStream;
use crate::error::{Result, SolverError};
use crate::resolver::blueprint::Blueprint;

/// Games the resolver can rebuild from an infoset key.
pub trait Resolvable: Game {
    /// Betting round of a state (0 for single-street games).
    fn street_of(&self, state: &Self::State) -> usize;

    /// A state in which the key's seat faces exactly `key`, with hidden
    /// information sampled consistently with the blueprint.
    fn reconstruct<R: Rng + ?Sized>(
        &self,
        key: &InfosetKey,
        blueprint: &Blueprint,
        rng: &mut R,
    ) -> Result<Self::State>;
}

/// Estimates the value of a state at the lookahead horizon.
pub trait LeafEvaluator<G: Game>: Send + Sync {
    /// Value of `state` for `player`.
    fn evaluate(&self, game: &G, state: &G::State, player: usize, rng: &mut RandomStream) -> Result<f64>;
}

/// Plays the blueprint to the end of the hand, averaged over `rollouts`.
#[derive(Debug, Clone)]
pub struct BlueprintRollout {
    blueprint: Blueprint,
    rollouts: usize,
}

impl BlueprintRollout {
    /// Rollout evaluator over `blueprint`.
    pub fn new(blueprint: Blueprint, rollouts: usize) -> Self {
        Self {
            blueprint,
            rollouts: rollouts.max(1),
        }
    }

    fn play<G: Game>(&self, game: &G, state: &G::State, player: usize, rng: &mut RandomStream) -> Result<f64> {
        let codec = KeyCodec::current();
        let mut state = state.clone();
        loop {
            match game.node_kind(&state) {
                NodeKind::Terminal => return Ok(game.payoff(&state, player)),
                NodeKind::Chance => state = game.sample_chance(&state, rng),
                NodeKind::Decision(_) => {
                    let actions = game.legal_actions(&state);
                    if actions.is_empty() {
                        return Ok(game.payoff(&state, player));
                    }
                    let key = game.infoset_key(&state, &codec)?;
                    let policy = self.blueprint.policy(&key, actions.len());
                    let index = sample_index(&policy, rng);
                    state = game.apply_action(&state, &actions[index]);
                }
            }
        }
    }
}

impl<G: Game> LeafEvaluator<G> for BlueprintRollout {
    fn evaluate(&self, game: &G, state: &G::State, player: usize, rng: &mut RandomStream) -> Result<f64> {
        let mut total = 0.0;
        for _ in 0..self.rollouts {
            total += self.play(game, state, player, rng)?;
        }
        Ok(total / self.rollouts as f64)
    }
}

/// One reconstructed root state and the chance seed it owns.
#[derive(Debug, Clone)]
pub struct World<S> {
    /// Root state.
    pub root: S,
    /// Chance stream of this world.
    pub rng: RandomStream,
}

/// The set of worlds a decision is resolved over.
#[derive(Debug, Clone)]
pub struct Subgame<S> {
    /// Root infoset.
    pub key: InfosetKey,
    /// Street of the root.
    pub root_street: usize,
    /// Last street searched before leaf evaluation.
    pub horizon: usize,
    /// Reconstructed worlds.
    pub worlds: Vec<World<S>>,
}

impl<S> Subgame<S> {
    /// Build `samples` worlds for `key` whose legal actions are `actions`.
    pub fn build<G>(
        game: &G,
        blueprint: &Blueprint,
        key: &InfosetKey,
        actions: &[G::Action],
        samples: usize,
        lookahead_streets: usize,
        seed: u64,
    ) -> Result<Self>
    where
        G: Resolvable<State = S>,
    {
        let expected = game.abstraction().hash();
        if blueprint.abstraction_hash() != expected {
            return Err(SolverError::AbstractionMismatch {
                expected,
                found: blueprint.abstraction_hash().to_string(),
            });
        }
        KeyCodec::current().check(key)?;

        let codec = KeyCodec::current();
        let mut worlds = Vec::with_capacity(samples);
        for index in 0..samples {
            let mut rng = RandomStream::for_worker(seed, index as u64);
            let root = game.reconstruct(key, blueprint, &mut rng)?;

            if game.node_kind(&root) != NodeKind::Decision(usize::from(key.seat())) {
                return Err(SolverError::SubgameConstructionFailed(format!(
                    "replayed state for {key} is not a decision of seat {}",
                    key.seat()
                )));
            }
            if game.infoset_key(&root, &codec)? != *key {
                return Err(SolverError::SubgameConstructionFailed(format!(
                    "replayed state does not reproduce {key}"
                )));
            }
            let legal = game.legal_actions(&root);
            if legal != actions {
                let names: Vec<String> = legal.iter().map(|a| a.label()).collect();
                return Err(SolverError::SubgameConstructionFailed(format!(
                    "legal actions at {key} are {names:?}, request has {}",
                    actions.len()
                )));
            }
            worlds.push(World { root, rng });
        }

        let root_street = usize::from(key.street());
        Ok(Subgame {
            key: key.clone(),
            root_street,
            horizon: root_street + lookahead_streets,
            worlds,
        })
    }
}

/// Draw one hidden bucket in proportion to `likelihood`, or uniformly when
/// every candidate has zero likelihood.
pub fn sample_hidden<R: Rng + ?Sized>(likelihood: &[f64], rng: &mut R) -> usize {
    let total: f64 = likelihood.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return rng.gen_range(0..likelihood.len().max(1));
    }
    let distribution: Vec<f64> = likelihood.iter().map(|w| w / total).collect();
    sample_index(&distribution, rng)
}

/// `KL(sigma || pi)`, with `pi` smoothed away from zero.
pub fn kl_divergence(sigma: &[f64], pi: &[f64]) -> f64 {
    const SMOOTHING: f64 = 1e-9;
    sigma
        .iter()
        .zip(pi)
        .filter(|(s, _)| **s > 0.0)
        .map(|(s, p)| s * (s / p.max(SMOOTHING)).ln())
        .sum()
}

/// Instantaneous regrets pulled towards the blueprint:
/// `r[a] - weight * KL(sigma || pi) * (sigma[a] - pi[a])`.
pub fn regularized_regrets(values: &[f64], node_value: f64, sigma: &[f64], pi: &[f64], weight: f64) -> Vec<f64> {
    let penalty = weight * kl_divergence(sigma, pi);
    values
        .iter()
        .zip(sigma.iter().zip(pi))
        .map(|(v, (s, p))| (v - node_value) - penalty * (s - p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn kl_is_zero_on_identical_policies() {
        let p = [0.2, 0.3, 0.5];
        assert!(kl_divergence(&p, &p).abs() < 1e-12);
        assert!(kl_divergence(&[1.0, 0.0, 0.0], &p) > 0.0);
    }

    #[test]
    fn regularization_vanishes_at_blueprint() {
        let values = [1.0, -1.0];
        let sigma = [0.5, 0.5];
        let plain = regularized_regrets(&values, 0.0, &sigma, &sigma, 10.0);
        assert_eq!(plain, vec![1.0, -1.0]);
    }

    #[test]
    fn regularization_pulls_towards_blueprint() {
        let values = [1.0, -1.0];
        let sigma = [0.9, 0.1];
        let pi = [0.2, 0.8];
        let plain = regularized_regrets(&values, 0.0, &sigma, &pi, 0.0);
        let pulled = regularized_regrets(&values, 0.0, &sigma, &pi, 1.0);
        assert!(pulled[0] < plain[0]);
        assert!(pulled[1] > plain[1]);
    }

    #[test]
    fn hidden_sampling_follows_likelihood() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..200 {
            assert_eq!(sample_hidden(&[0.0, 3.0, 0.0], &mut rng), 1);
        }
        let uniform: Vec<usize> = (0..300).map(|_| sample_hidden(&[0.0, 0.0, 0.0], &mut rng)).collect();
        assert!((0..3).all(|b| uniform.contains(&b)));
    }
}
