//! Game trait definition for the MCCFR sampler.
//!
//! Any game that implements [`Game`] can be trained by the sampler and
//! driven by the worker pool. Games resolvable in real time additionally
//! implement [`crate::resolver::Resolvable`].

use std::fmt::Debug;
use std::hash::Hash;

use rand::Rng;

use crate::abstraction::AbstractionIndex;
use crate::cfr::key::{ActionToken, InfosetKey, KeyCodec};
use crate::error::Result;

/// Trait for actions that can be taken in a game.
pub trait Action: Clone + Eq + Hash + Debug + Send + Sync {
    /// History token recorded in infoset keys.
    fn token(&self) -> ActionToken;

    /// Human-readable label.
    fn label(&self) -> String {
        format!("{:?}", self)
    }
}

/// Trait for game states.
///
/// A game state contains all information about the current position,
/// including private information that players may not see.
pub trait GameState: Clone + Debug + Send + Sync {}

/// What kind of node a state is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Game over; payoffs are defined.
    Terminal,
    /// Nature acts.
    Chance,
    /// The given seat acts.
    Decision(usize),
}

/// The interface the sampler walks.
///
/// # Example
/// ```ignore
/// impl Game for MyGame {
///     type State = MyState;
///     type Action = MyAction;
///     // ... implement required methods
/// }
/// ```
pub trait Game: Clone + Send + Sync {
    /// The type representing a complete game state.
    type State: GameState;

    /// The type representing an action a player can take.
    type Action: Action;

    /// Number of seats.
    fn num_players(&self) -> usize;

    /// Fresh root state.
    fn initial_state(&self) -> Self::State;

    /// Classify a state.
    fn node_kind(&self, state: &Self::State) -> NodeKind;

    /// Payoff of `player` at a terminal state.
    fn payoff(&self, state: &Self::State, player: usize) -> f64;

    /// Legal actions of the acting seat, in a fixed order.
    fn legal_actions(&self, state: &Self::State) -> Vec<Self::Action>;

    /// State after the acting seat plays `action`.
    fn apply_action(&self, state: &Self::State, action: &Self::Action) -> Self::State;

    /// Key of the acting seat's information set, built with `codec`.
    fn infoset_key(&self, state: &Self::State, codec: &KeyCodec) -> Result<InfosetKey>;

    /// Sample one chance outcome.
    fn sample_chance<R: Rng + ?Sized>(&self, state: &Self::State, rng: &mut R) -> Self::State;

    /// Abstraction the game's buckets come from.
    fn abstraction(&self) -> &AbstractionIndex;

    /// Human-readable name for an action.
    fn action_name(&self, action: &Self::Action) -> String {
        action.label()
    }
}

/// Macro to simplify implementing the GameState trait.
#[macro_export]
macro_rules! impl_game_state {
    ($type:ty) => {
        impl $crate::cfr::game::GameState for $type {}
    };
}
