//! Game implementations for the blueprint trainer.
//!
//! These serve as:
//!
//! 1. **Validation**: games with known equilibria (Kuhn poker, the
//!    dominated-choice toy) check that the sampler converges.
//!
//! 2. **Production shape**: [`holdem`] is a multi-street abstract hold'em
//!    played over abstraction buckets, the game blueprints are trained on.
//!
//! 3. **Benchmarks**: standard games for performance testing.
//!
//! ## Available Games
//!
//! - [`toy`]: one dominated decision
//! - [`kuhn`]: Kuhn poker, three cards and a known Nash equilibrium
//! - [`holdem`]: heads-up abstract hold'em
//!
//! ## Adding New Games
//!
//! 1. Create a new module under `src/games/`
//! 2. Define state and action types
//! 3. Implement [`Game`], and [`Resolvable`] if the game should be resolved
//!    in real time
//! 4. Add a [`GameSpec`] variant so worker processes can rebuild it

pub mod holdem;
pub mod kuhn;
pub mod toy;

use serde::{Deserialize, Serialize};

use crate::cfr::game::Game;
use crate::error::{Result, SolverError};
use crate::resolver::subgame::Resolvable;

use holdem::{AbstractHoldem, HoldemConfig};
use kuhn::KuhnPoker;
use toy::DominatedChoice;

/// Serializable description of a game.
///
/// Worker processes receive it on their command line as JSON and rebuild
/// the same game the coordinator trains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "game", rename_all = "snake_case")]
pub enum GameSpec {
    /// [`DominatedChoice`].
    Dominated,
    /// [`KuhnPoker`].
    Kuhn,
    /// [`AbstractHoldem`] with the given parameters.
    Holdem(HoldemConfig),
}

/// Code that runs against any concrete game.
pub trait GameVisitor {
    /// Result of the visit.
    type Output;

    /// Run against `game`.
    fn visit<G: Game + 'static>(self, game: G) -> Self::Output;
}

/// Code that runs against any game the resolver supports.
pub trait ResolvableVisitor {
    /// Result of the visit.
    type Output;

    /// Run against `game`.
    fn visit<G: Resolvable + 'static>(self, game: G) -> Self::Output;
}

impl GameSpec {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            GameSpec::Dominated => "dominated",
            GameSpec::Kuhn => "kuhn",
            GameSpec::Holdem(_) => "holdem",
        }
    }

    /// Build the game and hand it to `visitor`.
    pub fn visit<V: GameVisitor>(&self, visitor: V) -> Result<V::Output> {
        Ok(match self {
            GameSpec::Dominated => visitor.visit(DominatedChoice::new()),
            GameSpec::Kuhn => visitor.visit(KuhnPoker::new()),
            GameSpec::Holdem(config) => visitor.visit(AbstractHoldem::new(config.clone())?),
        })
    }

    /// Build a resolvable game and hand it to `visitor`.
    pub fn visit_resolvable<V: ResolvableVisitor>(&self, visitor: V) -> Result<V::Output> {
        match self {
            GameSpec::Dominated => Err(SolverError::SubgameConstructionFailed(
                "the dominated-choice game cannot be resolved".into(),
            )),
            GameSpec::Kuhn => Ok(visitor.visit(KuhnPoker::new())),
            GameSpec::Holdem(config) => Ok(visitor.visit(AbstractHoldem::new(config.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Players;

    impl GameVisitor for Players {
        type Output = (usize, String);

        fn visit<G: Game + 'static>(self, game: G) -> Self::Output {
            (game.num_players(), game.abstraction().hash())
        }
    }

    #[test]
    fn spec_json_round_trips() {
        let spec = GameSpec::Holdem(HoldemConfig::small());
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"game\":\"holdem\""));
        assert_eq!(serde_json::from_str::<GameSpec>(&json).unwrap(), spec);
        assert_eq!(serde_json::from_str::<GameSpec>(r#"{"game":"kuhn"}"#).unwrap(), GameSpec::Kuhn);
    }

    #[test]
    fn visit_builds_the_described_game() {
        let (players, hash) = GameSpec::Kuhn.visit(Players).unwrap();
        assert_eq!(players, 2);
        assert_eq!(hash, KuhnPoker::new().abstraction().hash());

        let mut config = HoldemConfig::small();
        config.stack = 1;
        assert!(GameSpec::Holdem(config).visit(Players).is_err());
    }
}
