//! Dominated-choice toy game.
//!
//! One street, two seats. Seat 0 picks `A` (payoff +1) or `B` (payoff -1);
//! seat 1 then makes a choice that does not affect the payoff. Any sound
//! regret minimizer must drive seat 0 to `A`.

use rand::Rng;

use crate::abstraction::AbstractionIndex;
use crate::cfr::game::{Action, Game, NodeKind};
use crate::cfr::key::{ActionToken, History, InfosetKey, KeyCodec};
use crate::error::Result;
use crate::impl_game_state;

/// Moves of the toy game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Choice {
    /// Seat 0's dominant move.
    A,
    /// Seat 0's dominated move.
    B,
    /// Seat 1's first move.
    X,
    /// Seat 1's second move.
    Y,
}

impl Action for Choice {
    fn token(&self) -> ActionToken {
        match self {
            Choice::A | Choice::Y => ActionToken::Bet(0),
            Choice::B | Choice::X => ActionToken::Passive,
        }
    }
}

/// Moves played so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoiceState {
    /// Played moves in order.
    pub moves: Vec<Choice>,
}

impl_game_state!(ChoiceState);

/// The dominated-choice game.
#[derive(Debug, Clone)]
pub struct DominatedChoice {
    abstraction: AbstractionIndex,
}

impl Default for DominatedChoice {
    fn default() -> Self {
        Self::new()
    }
}

impl DominatedChoice {
    /// Index of `A` in seat 0's action list.
    pub const A: usize = 0;
    /// Index of `B` in seat 0's action list.
    pub const B: usize = 1;

    /// Create the game.
    pub fn new() -> Self {
        Self {
            abstraction: AbstractionIndex::synthetic("dominated-choice", &[1]),
        }
    }

    /// Key of seat 0's only information set.
    pub fn root_key(&self) -> Result<InfosetKey> {
        KeyCodec::current().encode(0, 0, 0, History::new())
    }
}

impl Game for DominatedChoice {
    type State = ChoiceState;
    type Action = Choice;

    fn num_players(&self) -> usize {
        2
    }

    fn initial_state(&self) -> Self::State {
        ChoiceState::default()
    }

    fn node_kind(&self, state: &Self::State) -> NodeKind {
        match state.moves.len() {
            0 => NodeKind::Decision(0),
            1 => NodeKind::Decision(1),
            _ => NodeKind::Terminal,
        }
    }

    fn payoff(&self, state: &Self::State, player: usize) -> f64 {
        let p0 = match state.moves.first() {
            Some(Choice::A) => 1.0,
            _ => -1.0,
        };
        if player == 0 {
            p0
        } else {
            -p0
        }
    }

    fn legal_actions(&self, state: &Self::State) -> Vec<Self::Action> {
        match state.moves.len() {
            0 => vec![Choice::A, Choice::B],
            1 => vec![Choice::X, Choice::Y],
            _ => Vec::new(),
        }
    }

    fn apply_action(&self, state: &Self::State, action: &Self::Action) -> Self::State {
        let mut next = state.clone();
        next.moves.push(*action);
        next
    }

    fn infoset_key(&self, state: &Self::State, codec: &KeyCodec) -> Result<InfosetKey> {
        let history = History::from(state.moves.iter().map(|m| m.token()).collect::<Vec<_>>());
        codec.encode(0, 0, state.moves.len().min(1) as u8, history)
    }

    fn sample_chance<R: Rng + ?Sized>(&self, state: &Self::State, _rng: &mut R) -> Self::State {
        state.clone()
    }

    fn abstraction(&self) -> &AbstractionIndex {
        &self.abstraction
    }
}


#[cfg(test)]
pub(crate) use faulty::{FaultKind, FaultyGame};
