//! Kuhn Poker implementation for sampler validation.
//!
//! Kuhn Poker is a simplified poker game with a known Nash equilibrium,
//! which makes it the standard sanity check for regret minimizers.
//!
//! ## Game Rules
//!
//! - 3 cards: Jack (0), Queen (1), King (2)
//! - 2 players, each antes 1 chip
//! - Player 1 acts first: Pass or Bet (1 chip)
//! - Higher card wins at showdown
//!
//! ## Game Tree
//!
//! ```text
//! P1
//! ├── Pass
//! │   └── P2
//! │       ├── Pass → Showdown (pot = 2)
//! │       └── Bet
//! │           └── P1
//! │               ├── Pass → P2 wins (pot = 3)
//! │               └── Bet → Showdown (pot = 4)
//! └── Bet
//!     └── P2
//!         ├── Pass → P1 wins (pot = 3)
//!         └── Bet → Showdown (pot = 4)
//! ```
//!
//! The card is the bucket of the infoset key, so the abstraction is the
//! identity over three buckets.
//!
//! ## Known Nash Equilibrium (P2 side, unique)
//!
//! - Facing a bet with Jack: always fold
//! - Facing a bet with Queen: call with probability 1/3
//! - Facing a bet with King: always call

use rand::Rng;
use std::fmt;

use crate::abstraction::AbstractionIndex;
use crate::cfr::game::{Action, Game, NodeKind};
use crate::cfr::key::{ActionToken, History, InfosetKey, KeyCodec};
use crate::error::{Result, SolverError};
use crate::impl_game_state;
use crate::resolver::blueprint::Blueprint;
use crate::resolver::subgame::{sample_hidden, Resolvable};

/// Actions in Kuhn Poker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KuhnAction {
    /// Pass (check if no bet, fold if facing bet)
    Pass,
    /// Bet (or call if facing bet)
    Bet,
}

impl Action for KuhnAction {
    fn token(&self) -> ActionToken {
        match self {
            KuhnAction::Pass => ActionToken::Passive,
            KuhnAction::Bet => ActionToken::Bet(0),
        }
    }

    fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for KuhnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KuhnAction::Pass => write!(f, "Pass"),
            KuhnAction::Bet => write!(f, "Bet"),
        }
    }
}

/// Complete game state in Kuhn Poker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KuhnState {
    /// cards[0] is Player 1's card, cards[1] is Player 2's card
    pub cards: [u8; 2],
    /// Actions so far
    pub history: Vec<KuhnAction>,
    /// Amount each player has invested in the pot
    pub pot: [i32; 2],
    /// Whether cards have been dealt
    pub dealt: bool,
}

impl_game_state!(KuhnState);

impl Default for KuhnState {
    fn default() -> Self {
        Self {
            cards: [0, 0],
            history: Vec::new(),
            pot: [1, 1],
            dealt: false,
        }
    }
}

impl KuhnState {
    fn pattern(&self) -> String {
        self.history
            .iter()
            .map(|a| match a {
                KuhnAction::Pass => 'p',
                KuhnAction::Bet => 'b',
            })
            .collect()
    }
}

/// Kuhn Poker game.
#[derive(Debug, Clone)]
pub struct KuhnPoker {
    abstraction: AbstractionIndex,
}

impl Default for KuhnPoker {
    fn default() -> Self {
        Self::new()
    }
}

impl KuhnPoker {
    /// Create a new Kuhn Poker game.
    pub fn new() -> Self {
        Self {
            abstraction: AbstractionIndex::synthetic("kuhn", &[3]),
        }
    }

    /// Get card name for display.
    pub fn card_name(card: u8) -> &'static str {
        match card {
            0 => "Jack",
            1 => "Queen",
            2 => "King",
            _ => "Unknown",
        }
    }

    /// Key of `seat` holding `card` after `history`.
    pub fn key(&self, card: u8, seat: u8, history: &[KuhnAction]) -> Result<InfosetKey> {
        let tokens = history.iter().map(|a| a.token()).collect::<Vec<_>>();
        KeyCodec::current().encode(0, u16::from(card), seat, History::from(tokens))
    }

    fn acting_seat(pattern: &str) -> Option<usize> {
        match pattern {
            "" | "pb" => Some(0),
            "p" | "b" => Some(1),
            _ => None,
        }
    }
}

impl Game for KuhnPoker {
    type State = KuhnState;
    type Action = KuhnAction;

    fn num_players(&self) -> usize {
        2
    }

    fn initial_state(&self) -> Self::State {
        KuhnState::default()
    }

    fn node_kind(&self, state: &Self::State) -> NodeKind {
        if !state.dealt {
            return NodeKind::Chance;
        }
        match Self::acting_seat(&state.pattern()) {
            Some(seat) => NodeKind::Decision(seat),
            None => NodeKind::Terminal,
        }
    }

    fn payoff(&self, state: &Self::State, player: usize) -> f64 {
        let p0_wins_showdown = state.cards[0] > state.cards[1];
        let p0_payoff: f64 = match state.pattern().as_str() {
            "pp" if p0_wins_showdown => 1.0,
            "pp" => -1.0,
            "bp" => 1.0,
            "pbp" => -1.0,
            "bb" | "pbb" if p0_wins_showdown => 2.0,
            "bb" | "pbb" => -2.0,
            _ => 0.0,
        };
        if player == 0 {
            p0_payoff
        } else {
            -p0_payoff
        }
    }

    fn legal_actions(&self, state: &Self::State) -> Vec<Self::Action> {
        match self.node_kind(state) {
            NodeKind::Decision(_) => vec![KuhnAction::Pass, KuhnAction::Bet],
            _ => Vec::new(),
        }
    }

    fn apply_action(&self, state: &Self::State, action: &Self::Action) -> Self::State {
        let mut next = state.clone();
        if let (KuhnAction::Bet, NodeKind::Decision(seat)) = (action, self.node_kind(state)) {
            next.pot[seat] += 1;
        }
        next.history.push(*action);
        next
    }

    fn infoset_key(&self, state: &Self::State, codec: &KeyCodec) -> Result<InfosetKey> {
        let seat = Self::acting_seat(&state.pattern()).unwrap_or(0);
        let tokens = state.history.iter().map(|a| a.token()).collect::<Vec<_>>();
        codec.encode(0, u16::from(state.cards[seat]), seat as u8, History::from(tokens))
    }

    fn sample_chance<R: Rng + ?Sized>(&self, _state: &Self::State, rng: &mut R) -> Self::State {
        let mut cards = [0u8, 1, 2];
        // Fisher-Yates
        for i in (1..3).rev() {
            let j = rng.gen_range(0..=i);
            cards.swap(i, j);
        }
        KuhnState {
            cards: [cards[0], cards[1]],
            history: Vec::new(),
            pot: [1, 1],
            dealt: true,
        }
    }

    fn abstraction(&self) -> &AbstractionIndex {
        &self.abstraction
    }
}

impl Resolvable for KuhnPoker {
    fn street_of(&self, _state: &Self::State) -> usize {
        0
    }

    /// The hidden card is one of the two the hero does not hold, weighted
    /// by how often the blueprint plays the observed line with it.
    fn reconstruct<R: Rng + ?Sized>(&self, key: &InfosetKey, blueprint: &Blueprint, rng: &mut R) -> Result<Self::State> {
        let fail = |msg: &str| SolverError::SubgameConstructionFailed(format!("{key}: {msg}"));
        let hero_card = u8::try_from(key.bucket()).ok().filter(|c| *c < 3).ok_or_else(|| fail("no such card"))?;
        let hero = usize::from(key.seat());

        let history = key
            .history()
            .tokens()
            .iter()
            .map(|t| match t {
                ActionToken::Passive => Ok(KuhnAction::Pass),
                ActionToken::Bet(0) => Ok(KuhnAction::Bet),
                _ => Err(fail("token outside Kuhn poker")),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut state = KuhnState {
            cards: [0, 0],
            history: Vec::new(),
            pot: [1, 1],
            dealt: true,
        };
        for action in &history {
            state = self.apply_action(&state, action);
        }
        if self.node_kind(&state) != NodeKind::Decision(hero) {
            return Err(fail("history does not reach a decision of this seat"));
        }

        let candidates: Vec<u8> = (0..3).filter(|c| *c != hero_card).collect();
        let mut likelihood = Vec::with_capacity(candidates.len());
        for &card in &candidates {
            let mut weight = 1.0;
            for (i, action) in history.iter().enumerate().filter(|(i, _)| i % 2 != hero) {
                let policy = blueprint.policy(&self.key(card, (i % 2) as u8, &history[..i])?, 2);
                weight *= match action {
                    KuhnAction::Pass => policy[0],
                    KuhnAction::Bet => policy[1],
                };
            }
            likelihood.push(weight);
        }

        state.cards[hero] = hero_card;
        state.cards[1 - hero] = candidates[sample_hidden(&likelihood, rng)];
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::config::{SamplerConfig, TrainingConfig};
    use crate::cfr::Trainer;
    use KuhnAction::{Bet, Pass};

    fn dealt(cards: [u8; 2], history: Vec<KuhnAction>) -> KuhnState {
        KuhnState {
            cards,
            history,
            pot: [1, 1],
            dealt: true,
        }
    }

    #[test]
    fn test_kuhn_game_tree() {
        let game = KuhnPoker::new();
        let state = game.initial_state();
        assert_eq!(game.node_kind(&state), NodeKind::Chance);

        let state = dealt([2, 0], vec![]);
        assert_eq!(game.node_kind(&state), NodeKind::Decision(0));
        assert_eq!(game.legal_actions(&state), vec![Pass, Bet]);

        let state = game.apply_action(&state, &Pass);
        let state = game.apply_action(&state, &Bet);
        assert_eq!(game.node_kind(&state), NodeKind::Decision(0));
        assert_eq!(state.pot, [1, 2]);
    }

    #[test]
    fn test_kuhn_terminal_payoffs() {
        let game = KuhnPoker::new();

        let pp = dealt([2, 0], vec![Pass, Pass]);
        assert_eq!(game.node_kind(&pp), NodeKind::Terminal);
        assert_eq!(game.payoff(&pp, 0), 1.0);
        assert_eq!(game.payoff(&pp, 1), -1.0);

        let bp = dealt([0, 2], vec![Bet, Pass]);
        assert_eq!(game.payoff(&bp, 0), 1.0);

        let bb = dealt([0, 2], vec![Bet, Bet]);
        assert_eq!(game.payoff(&bb, 0), -2.0);
        assert_eq!(game.payoff(&bb, 1), 2.0);
    }

    #[test]
    fn test_kuhn_infoset_keys() {
        let game = KuhnPoker::new();
        let state = dealt([1, 2], vec![Pass]);
        let key = game.infoset_key(&state, &KeyCodec::current()).unwrap();
        assert_eq!(key.bucket(), 2);
        assert_eq!(key.seat(), 1);
        assert_eq!(key.to_string(), "1:0:2:1:c");
        assert_eq!(key, game.key(2, 1, &[Pass]).unwrap());
    }

    #[test]
    fn test_kuhn_reconstruction_follows_blueprint() {
        use crate::cfr::store::StrategyTable;
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;

        let game = KuhnPoker::new();
        let mut table = StrategyTable::default();
        // Opponent bets with the King only.
        table.strategies.insert(game.key(0, 0, &[]).unwrap(), vec![1.0, 0.0]);
        table.strategies.insert(game.key(1, 0, &[]).unwrap(), vec![1.0, 0.0]);
        table.strategies.insert(game.key(2, 0, &[]).unwrap(), vec![0.0, 1.0]);
        let blueprint = Blueprint::new(game.abstraction().hash(), 0, table);

        let key = game.key(1, 1, &[Bet]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let world = game.reconstruct(&key, &blueprint, &mut rng).unwrap();
            assert_eq!(world.cards, [2, 1]);
            assert_eq!(game.infoset_key(&world, &KeyCodec::current()).unwrap(), key);
        }

        let wrong_seat = game.key(1, 0, &[Bet]).unwrap();
        assert!(game.reconstruct(&wrong_seat, &blueprint, &mut rng).is_err());
    }

    #[test]
    fn test_kuhn_convergence() {
        let config = TrainingConfig::default()
            .with_seed(42)
            .with_sampler(SamplerConfig::cfr_plus());
        let game = KuhnPoker::new();
        let mut trainer = Trainer::new(game.clone(), config).unwrap();
        trainer.train(100_000).unwrap();

        // 3 cards x 4 decision histories
        assert_eq!(trainer.num_info_sets(), 12);

        let queen_root = trainer.get_average_strategy(&game.key(1, 0, &[]).unwrap(), 2);
        assert!(queen_root[0] > 0.9, "Queen should pass at the root: {queen_root:?}");

        let jack_vs_bet = trainer.get_average_strategy(&game.key(0, 1, &[Bet]).unwrap(), 2);
        let queen_vs_bet = trainer.get_average_strategy(&game.key(1, 1, &[Bet]).unwrap(), 2);
        let king_vs_bet = trainer.get_average_strategy(&game.key(2, 1, &[Bet]).unwrap(), 2);

        assert!(jack_vs_bet[0] > 0.9, "P2 Jack should fold to bet: {jack_vs_bet:?}");
        assert!(king_vs_bet[1] > 0.9, "P2 King should call bet: {king_vs_bet:?}");
        assert!(
            queen_vs_bet[1] > 0.15 && queen_vs_bet[1] < 0.55,
            "P2 Queen call probability {} should be near 1/3",
            queen_vs_bet[1]
        );
    }
}
