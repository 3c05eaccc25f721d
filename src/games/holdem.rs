//! Heads-up abstract hold'em.
//!
//! Cards never appear here: every street, chance deals each seat a bucket
//! of the abstraction directly, and showdowns compare the buckets of the
//! last street. Betting follows no-limit rules with a discrete set of
//! pot-fraction sizes.
//!
//! ## Betting
//!
//! - Seat 0 posts the small blind and acts first preflop
//! - Seat 1 posts the big blind and acts first on later streets
//! - Bets and raises are `to_call + fraction * (pot + to_call)`, at least
//!   one big blind, capped at `max_raises` per street
//! - All-in is always offered while raising is allowed
//!
//! A round closes once both seats have acted and either the street
//! commitments match or someone is all-in. All-in rounds run out the
//! remaining streets straight to showdown.
//!
//! ## Example
//!
//! ```
//! use blueprint_solver::cfr::{Game, NodeKind};
//! use blueprint_solver::games::holdem::{AbstractHoldem, HoldemConfig};
//!
//! let game = AbstractHoldem::new(HoldemConfig::small()).unwrap();
//! let root = game.deal_root(&[1, 2]);
//! assert_eq!(game.node_kind(&root), NodeKind::Decision(0));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::abstraction::AbstractionIndex;
use crate::cfr::config::ConfigError;
use crate::cfr::game::{Action, Game, NodeKind};
use crate::cfr::key::{ActionToken, History, InfosetKey, KeyCodec, MAX_BET_SIZES, MAX_HISTORY_LEN};
use crate::error::{Result, SolverError};
use crate::impl_game_state;
use crate::resolver::blueprint::Blueprint;
use crate::resolver::subgame::{sample_hidden, Resolvable};

/// Shape of the abstract game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldemConfig {
    /// Bucket count per street; its length is the number of streets.
    pub buckets: Vec<u16>,
    /// Starting stack of each seat, in chips.
    pub stack: u32,
    /// Small blind in chips.
    pub small_blind: u32,
    /// Big blind in chips.
    pub big_blind: u32,
    /// Bet sizes as fractions of the pot after calling.
    pub bet_fractions: Vec<f64>,
    /// Bets and raises allowed per street.
    pub max_raises: u8,
}

impl Default for HoldemConfig {
    fn default() -> Self {
        Self {
            buckets: vec![8, 8, 8, 8],
            stack: 200,
            small_blind: 1,
            big_blind: 2,
            bet_fractions: vec![0.5, 1.0],
            max_raises: 3,
        }
    }
}

impl HoldemConfig {
    /// Two streets with four buckets and shallow stacks, for tests.
    pub fn small() -> Self {
        Self {
            buckets: vec![4, 4],
            stack: 20,
            small_blind: 1,
            big_blind: 2,
            bet_fractions: vec![1.0],
            max_raises: 2,
        }
    }

    /// Check that the parameters describe a playable game.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidGame(msg));
        if self.buckets.is_empty() || self.buckets.len() > 4 {
            return invalid(format!("{} streets, expected 1 to 4", self.buckets.len()));
        }
        if self.buckets.contains(&0) {
            return invalid("every street needs at least one bucket".into());
        }
        if self.bet_fractions.len() > MAX_BET_SIZES as usize {
            return invalid(format!("at most {MAX_BET_SIZES} bet sizes"));
        }
        // Opening bet, raises, all-in, call and the street boundary.
        let longest_history = self.buckets.len() * (usize::from(self.max_raises) + 4);
        if longest_history > MAX_HISTORY_LEN {
            return invalid(format!(
                "{} raises per street over {} streets do not fit an infoset key",
                self.max_raises,
                self.buckets.len()
            ));
        }
        if self.bet_fractions.iter().any(|f| *f <= 0.0 || !f.is_finite()) {
            return invalid("bet fractions must be positive".into());
        }
        if self.small_blind > self.big_blind || self.stack <= self.big_blind {
            return invalid(format!(
                "blinds {}/{} do not fit a stack of {}",
                self.small_blind, self.big_blind, self.stack
            ));
        }
        Ok(())
    }
}

/// Actions in abstract hold'em.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldemAction {
    /// Give up the pot.
    Fold,
    /// Pass without a bet to face.
    Check,
    /// Match the outstanding bet.
    Call,
    /// Bet or raise with the given size index.
    Bet(u8),
    /// Push the whole stack.
    AllIn,
}

impl Action for HoldemAction {
    fn token(&self) -> ActionToken {
        match self {
            HoldemAction::Fold => ActionToken::Fold,
            HoldemAction::Check | HoldemAction::Call => ActionToken::Passive,
            HoldemAction::Bet(k) => ActionToken::Bet(*k),
            HoldemAction::AllIn => ActionToken::AllIn,
        }
    }

    fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HoldemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldemAction::Fold => write!(f, "Fold"),
            HoldemAction::Check => write!(f, "Check"),
            HoldemAction::Call => write!(f, "Call"),
            HoldemAction::Bet(k) => write!(f, "Bet#{}", k),
            HoldemAction::AllIn => write!(f, "AllIn"),
        }
    }
}

/// Complete state of a hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldemState {
    /// Current street.
    pub street: usize,
    /// Buckets dealt to each seat so far, one per street.
    pub buckets: [Vec<u16>; 2],
    /// Chips each seat has put in over the hand.
    pub committed: [u32; 2],
    /// Chips each seat has put in on this street.
    pub street_commit: [u32; 2],
    /// Seat to act.
    pub to_act: usize,
    /// Bets and raises made on this street.
    pub raises: u8,
    /// Who has acted since the last bet.
    pub acted: [bool; 2],
    /// Public action history.
    pub history: History,
    /// Seat that folded, if any.
    pub folded: Option<usize>,
    /// Betting is over and buckets are compared.
    pub showdown: bool,
    /// Remaining streets are dealt without betting.
    pub runout: bool,
}

impl_game_state!(HoldemState);

impl HoldemState {
    /// Total chips in the pot.
    pub fn pot(&self) -> u32 {
        self.committed[0] + self.committed[1]
    }

    fn to_call(&self) -> u32 {
        let me = self.to_act;
        self.street_commit[1 - me].saturating_sub(self.street_commit[me])
    }
}

/// The abstract hold'em game.
#[derive(Debug, Clone)]
pub struct AbstractHoldem {
    config: HoldemConfig,
    abstraction: AbstractionIndex,
}

impl AbstractHoldem {
    /// Build the game, refusing inconsistent parameters.
    pub fn new(config: HoldemConfig) -> Result<Self> {
        config.validate()?;
        let name = format!(
            "abstract-holdem/stack{}/{}-{}/{:?}/{}",
            config.stack, config.small_blind, config.big_blind, config.bet_fractions, config.max_raises
        );
        let abstraction = AbstractionIndex::synthetic(&name, &config.buckets);
        Ok(Self { config, abstraction })
    }

    /// Game parameters.
    pub fn config(&self) -> &HoldemConfig {
        &self.config
    }

    /// Number of streets.
    pub fn num_streets(&self) -> usize {
        self.config.buckets.len()
    }

    /// Root decision with the given preflop buckets for seats 0 and 1.
    pub fn deal_root(&self, buckets: &[u16]) -> HoldemState {
        let mut state = self.initial_state();
        self.deal(&mut state, [buckets.first().copied().unwrap_or(0), buckets.get(1).copied().unwrap_or(0)]);
        state
    }

    fn deal(&self, state: &mut HoldemState, buckets: [u16; 2]) {
        state.buckets[0].push(buckets[0]);
        state.buckets[1].push(buckets[1]);
    }

    fn needs_deal(&self, state: &HoldemState) -> bool {
        state.buckets[0].len() <= state.street
    }

    fn stack_left(&self, state: &HoldemState, seat: usize) -> u32 {
        self.config.stack.saturating_sub(state.committed[seat])
    }

    fn bet_amount(&self, state: &HoldemState, index: u8) -> u32 {
        let to_call = state.to_call();
        let fraction = self.config.bet_fractions.get(index as usize).copied().unwrap_or(1.0);
        let sized = (fraction * f64::from(state.pot() + to_call)).round() as u32;
        to_call + sized.max(self.config.big_blind)
    }

    fn pay(&self, state: &mut HoldemState, chips: u32) {
        let me = state.to_act;
        let chips = chips.min(self.stack_left(state, me));
        state.committed[me] += chips;
        state.street_commit[me] += chips;
    }

    fn round_closed(&self, state: &HoldemState) -> bool {
        let all_in = (0..2).any(|seat| self.stack_left(state, seat) == 0);
        state.acted[0] && state.acted[1] && (state.street_commit[0] == state.street_commit[1] || all_in)
    }

    fn close_round(&self, state: &mut HoldemState) {
        let last = self.num_streets() - 1;
        if state.street >= last {
            state.showdown = true;
            return;
        }
        if (0..2).any(|seat| self.stack_left(state, seat) == 0) {
            state.street = last;
            state.runout = true;
            return;
        }
        state.street += 1;
        state.street_commit = [0, 0];
        state.acted = [false, false];
        state.raises = 0;
        state.to_act = 1;
        state.history.push(ActionToken::Deal);
    }
}

impl Game for AbstractHoldem {
    type State = HoldemState;
    type Action = HoldemAction;

    fn num_players(&self) -> usize {
        2
    }

    fn initial_state(&self) -> Self::State {
        let blinds = [self.config.small_blind, self.config.big_blind];
        HoldemState {
            street: 0,
            buckets: [Vec::new(), Vec::new()],
            committed: blinds,
            street_commit: blinds,
            to_act: 0,
            raises: 0,
            acted: [false, false],
            history: History::new(),
            folded: None,
            showdown: false,
            runout: false,
        }
    }

    fn node_kind(&self, state: &Self::State) -> NodeKind {
        if state.folded.is_some() || state.showdown {
            NodeKind::Terminal
        } else if self.needs_deal(state) {
            NodeKind::Chance
        } else {
            NodeKind::Decision(state.to_act)
        }
    }

    fn payoff(&self, state: &Self::State, player: usize) -> f64 {
        let opponent = 1 - player;
        if let Some(folder) = state.folded {
            let lost = f64::from(state.committed[folder]);
            return if folder == player { -lost } else { lost };
        }
        let contested = f64::from(state.committed[0].min(state.committed[1]));
        let mine = state.buckets[player].last();
        let theirs = state.buckets[opponent].last();
        match mine.cmp(&theirs) {
            std::cmp::Ordering::Greater => contested,
            std::cmp::Ordering::Less => -contested,
            std::cmp::Ordering::Equal => 0.0,
        }
    }

    fn legal_actions(&self, state: &Self::State) -> Vec<Self::Action> {
        if self.node_kind(state) != NodeKind::Decision(state.to_act) {
            return Vec::new();
        }
        let me = state.to_act;
        let to_call = state.to_call();
        let left = self.stack_left(state, me);

        let mut actions = Vec::new();
        if to_call > 0 {
            actions.push(HoldemAction::Fold);
            actions.push(HoldemAction::Call);
        } else {
            actions.push(HoldemAction::Check);
        }

        let can_raise = state.raises < self.config.max_raises
            && left > to_call
            && self.stack_left(state, 1 - me) > 0;
        if can_raise {
            let mut amounts = Vec::new();
            for index in 0..self.config.bet_fractions.len() as u8 {
                let amount = self.bet_amount(state, index);
                if amount < left && !amounts.contains(&amount) {
                    amounts.push(amount);
                    actions.push(HoldemAction::Bet(index));
                }
            }
            actions.push(HoldemAction::AllIn);
        }
        actions
    }

    fn apply_action(&self, state: &Self::State, action: &Self::Action) -> Self::State {
        let mut next = state.clone();
        let me = state.to_act;
        match action {
            HoldemAction::Fold => {
                next.folded = Some(me);
                next.history.push(action.token());
                return next;
            }
            HoldemAction::Check => {}
            HoldemAction::Call => self.pay(&mut next, state.to_call()),
            HoldemAction::Bet(index) => {
                self.pay(&mut next, self.bet_amount(state, *index));
                next.raises += 1;
                next.acted = [false, false];
            }
            HoldemAction::AllIn => {
                self.pay(&mut next, self.stack_left(state, me));
                next.raises += 1;
                next.acted = [false, false];
            }
        }
        next.acted[me] = true;
        next.history.push(action.token());

        if self.round_closed(&next) {
            self.close_round(&mut next);
        } else {
            next.to_act = 1 - me;
        }
        next
    }

    fn infoset_key(&self, state: &Self::State, codec: &KeyCodec) -> Result<InfosetKey> {
        let seat = state.to_act;
        let bucket = state.buckets[seat].get(state.street).copied().unwrap_or(0);
        codec.encode(state.street as u8, bucket, seat as u8, state.history.clone())
    }

    fn sample_chance<R: Rng + ?Sized>(&self, state: &Self::State, rng: &mut R) -> Self::State {
        let mut next = state.clone();
        while self.needs_deal(&next) {
            let count = self.config.buckets.get(next.buckets[0].len()).copied().unwrap_or(1);
            let dealt = [rng.gen_range(0..count), rng.gen_range(0..count)];
            self.deal(&mut next, dealt);
        }
        if next.runout {
            next.showdown = true;
        }
        next
    }

    fn abstraction(&self) -> &AbstractionIndex {
        &self.abstraction
    }
}

/// An opponent decision observed in a key's history.
struct Observed {
    street: usize,
    prefix: History,
    action: usize,
    num_actions: usize,
}

impl Resolvable for AbstractHoldem {
    fn street_of(&self, state: &Self::State) -> usize {
        state.street
    }

    fn reconstruct<R: Rng + ?Sized>(&self, key: &InfosetKey, blueprint: &Blueprint, rng: &mut R) -> Result<Self::State> {
        let fail = |msg: String| SolverError::SubgameConstructionFailed(format!("{key}: {msg}"));
        let hero = usize::from(key.seat());
        let street = usize::from(key.street());
        if hero > 1 {
            return Err(fail(format!("seat {hero} in a heads-up game")));
        }
        let hero_count = self.config.buckets.get(street).copied().unwrap_or(0);
        if key.bucket() >= hero_count {
            return Err(fail(format!("bucket {} out of range on street {street}", key.bucket())));
        }

        // Betting does not depend on buckets, so replay with placeholders
        // and fill in the hidden information afterwards.
        let mut state = self.initial_state();
        let mut observed = Vec::new();
        for token in key.history().tokens() {
            if *token == ActionToken::Deal {
                continue;
            }
            if self.needs_deal(&state) {
                self.deal(&mut state, [0, 0]);
            }
            let seat = match self.node_kind(&state) {
                NodeKind::Decision(seat) => seat,
                _ => return Err(fail(format!("history continues past the end of the hand at {token}"))),
            };
            let actions = self.legal_actions(&state);
            let index = actions
                .iter()
                .position(|a| a.token() == *token)
                .ok_or_else(|| fail(format!("{token} is not legal at {}", state.history)))?;
            if seat != hero {
                observed.push(Observed {
                    street: state.street,
                    prefix: state.history.clone(),
                    action: index,
                    num_actions: actions.len(),
                });
            }
            state = self.apply_action(&state, &actions[index]);
        }
        if self.needs_deal(&state) {
            self.deal(&mut state, [0, 0]);
        }
        if state.history != *key.history() || state.street != street {
            return Err(fail("history does not replay to the key".into()));
        }

        let codec = KeyCodec::current();
        for s in 0..=street {
            let count = self.config.buckets[s];
            let mut likelihood = Vec::with_capacity(usize::from(count));
            for bucket in 0..count {
                let mut weight = 1.0;
                for o in observed.iter().filter(|o| o.street == s) {
                    let opp_key = codec.encode(s as u8, bucket, (1 - hero) as u8, o.prefix.clone())?;
                    weight *= blueprint.policy(&opp_key, o.num_actions)[o.action];
                }
                likelihood.push(weight);
            }
            state.buckets[1 - hero][s] = sample_hidden(&likelihood, rng) as u16;
            state.buckets[hero][s] = if s == street { key.bucket() } else { rng.gen_range(0..count) };
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::config::{SamplerConfig, TrainingConfig};
    use crate::cfr::store::StrategyTable;
    use crate::cfr::Trainer;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use HoldemAction::*;

    fn game() -> AbstractHoldem {
        AbstractHoldem::new(HoldemConfig::small()).unwrap()
    }

    fn play(game: &AbstractHoldem, root: &HoldemState, actions: &[HoldemAction]) -> HoldemState {
        actions.iter().fold(root.clone(), |state, a| {
            assert!(game.legal_actions(&state).contains(a), "{a} not legal at {}", state.history);
            game.apply_action(&state, a)
        })
    }

    #[test]
    fn invalid_configs_are_refused() {
        let mut config = HoldemConfig::small();
        config.buckets.clear();
        assert!(AbstractHoldem::new(config).is_err());

        let mut config = HoldemConfig::small();
        config.stack = 2;
        assert!(AbstractHoldem::new(config).is_err());

        let mut config = HoldemConfig::small();
        config.bet_fractions = vec![0.5; 11];
        assert!(AbstractHoldem::new(config).is_err());

        let mut config = HoldemConfig::default();
        config.max_raises = 100;
        assert!(AbstractHoldem::new(config).is_err());
    }

    #[test]
    fn preflop_root_offers_fold_call_raise() {
        let game = game();
        assert_eq!(game.node_kind(&game.initial_state()), NodeKind::Chance);
        let root = game.deal_root(&[1, 2]);
        assert_eq!(game.legal_actions(&root), vec![Fold, Call, Bet(0), AllIn]);
    }

    #[test]
    fn limp_check_moves_to_next_street() {
        let game = game();
        let root = game.deal_root(&[1, 2]);
        let limped = play(&game, &root, &[Call]);
        assert_eq!(game.node_kind(&limped), NodeKind::Decision(1));
        assert_eq!(game.legal_actions(&limped), vec![Check, Bet(0), AllIn]);

        let flop = play(&game, &limped, &[Check]);
        assert_eq!(flop.street, 1);
        assert_eq!(game.node_kind(&flop), NodeKind::Chance);
        assert_eq!(flop.history.to_string(), "cc/");

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dealt = game.sample_chance(&flop, &mut rng);
        assert_eq!(game.node_kind(&dealt), NodeKind::Decision(1));
        let key = game.infoset_key(&dealt, &KeyCodec::current()).unwrap();
        assert_eq!(key.street(), 1);
        assert_eq!(key.bucket(), dealt.buckets[1][1]);
    }

    #[test]
    fn fold_pays_committed_chips() {
        let game = game();
        let root = game.deal_root(&[0, 3]);
        let state = play(&game, &root, &[Bet(0), Fold]);
        assert_eq!(game.node_kind(&state), NodeKind::Terminal);
        // Seat 1 folds its big blind.
        assert_eq!(game.payoff(&state, 0), 2.0);
        assert_eq!(game.payoff(&state, 1), -2.0);
    }

    #[test]
    fn all_in_runs_out_to_showdown() {
        let game = game();
        let root = game.deal_root(&[3, 0]);
        let state = play(&game, &root, &[AllIn, Call]);
        assert!(state.runout);
        assert_eq!(game.node_kind(&state), NodeKind::Chance);

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let done = game.sample_chance(&state, &mut rng);
        assert_eq!(game.node_kind(&done), NodeKind::Terminal);
        assert_eq!(done.buckets[0].len(), 2);
        let expected = match done.buckets[0][1].cmp(&done.buckets[1][1]) {
            std::cmp::Ordering::Greater => 20.0,
            std::cmp::Ordering::Less => -20.0,
            std::cmp::Ordering::Equal => 0.0,
        };
        assert_eq!(game.payoff(&done, 0), expected);
        assert_eq!(game.payoff(&done, 0), -game.payoff(&done, 1));
    }

    #[test]
    fn raises_are_capped_per_street() {
        let game = game();
        let root = game.deal_root(&[0, 0]);
        let state = play(&game, &root, &[Bet(0)]);
        // One to call plus the pot after calling.
        assert_eq!(state.committed, [6, 2]);
        let state = play(&game, &state, &[Bet(0)]);
        assert_eq!(state.raises, 2);
        assert_eq!(game.legal_actions(&state), vec![Fold, Call]);
    }

    #[test]
    fn trains_and_stays_zero_sum() {
        let game = game();
        let config = TrainingConfig::default()
            .with_seed(5)
            .with_sampler(SamplerConfig::default());
        let mut trainer = Trainer::new(game.clone(), config).unwrap();
        trainer.train(2_000).unwrap();
        assert!(trainer.num_info_sets() > 50);

        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..200 {
            let mut state = game.sample_chance(&game.initial_state(), &mut rng);
            loop {
                match game.node_kind(&state) {
                    NodeKind::Terminal => break,
                    NodeKind::Chance => state = game.sample_chance(&state, &mut rng),
                    NodeKind::Decision(_) => {
                        let actions = game.legal_actions(&state);
                        state = game.apply_action(&state, &actions[rng.gen_range(0..actions.len())]);
                    }
                }
            }
            assert_eq!(game.payoff(&state, 0), -game.payoff(&state, 1));
        }
    }

    #[test]
    fn reconstruction_reproduces_key() {
        let game = game();
        let blueprint = Blueprint::new(game.abstraction().hash(), 0, StrategyTable::default());
        let root = game.deal_root(&[2, 1]);
        let limped = play(&game, &root, &[Call, Bet(0), Call]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let live = game.sample_chance(&limped, &mut rng);
        let key = game.infoset_key(&live, &KeyCodec::current()).unwrap();

        for _ in 0..20 {
            let world = game.reconstruct(&key, &blueprint, &mut rng).unwrap();
            assert_eq!(game.infoset_key(&world, &KeyCodec::current()).unwrap(), key);
            assert_eq!(game.legal_actions(&world), game.legal_actions(&live));
            assert_eq!(world.committed, live.committed);
        }
    }

    #[test]
    fn reconstruction_rejects_impossible_history() {
        let game = game();
        let blueprint = Blueprint::new(game.abstraction().hash(), 0, StrategyTable::default());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let codec = KeyCodec::current();

        let checked_preflop = codec.encode(0, 1, 1, History::parse("c").unwrap_or_default()).unwrap();
        assert!(game.reconstruct(&checked_preflop, &blueprint, &mut rng).is_ok());

        let bad = codec.encode(0, 1, 0, History::parse("ff").unwrap_or_default()).unwrap();
        assert!(matches!(
            game.reconstruct(&bad, &blueprint, &mut rng),
            Err(SolverError::SubgameConstructionFailed(_))
        ));
        let out_of_range = codec.encode(0, 9, 0, History::new()).unwrap();
        assert!(game.reconstruct(&out_of_range, &blueprint, &mut rng).is_err());
    }
}
