//! Train, checkpoint, reload and resolve, end to end.

use blueprint_solver::cfr::{Game, KeyCodec, ResolverConfig, Trainer, TrainingConfig};
use blueprint_solver::checkpoint::CheckpointManager;
use blueprint_solver::games::holdem::{AbstractHoldem, HoldemAction, HoldemConfig};
use blueprint_solver::games::kuhn::{KuhnAction, KuhnPoker};
use blueprint_solver::resolver::{Blueprint, ResolveRequest, Resolver};
use blueprint_solver::SolverError;

#[test]
fn checkpointed_blueprint_drives_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path());
    let game = KuhnPoker::new();

    let mut trainer = Trainer::new(game.clone(), TrainingConfig::default().with_seed(4)).unwrap();
    trainer.train(20_000).unwrap();
    let path = trainer.save_checkpoint(&manager).unwrap();

    let blueprint = Blueprint::load(&path, &game.abstraction().hash()).unwrap();
    assert_eq!(blueprint.iteration(), 20_000);
    assert_eq!(blueprint.len(), 12);

    let key = game.key(0, 1, &[KuhnAction::Bet]).unwrap();
    let resolver = Resolver::new(game, blueprint, ResolverConfig::default()).unwrap();
    let resolution = resolver.resolve(&ResolveRequest::new(key, vec![KuhnAction::Pass, KuhnAction::Bet], 5_000));

    assert!(!resolution.diagnostics.fallback_used);
    // A jack facing a bet folds.
    assert!(resolution.policy[0] > 0.9, "{:?}", resolution.policy);
}

#[test]
fn foreign_checkpoint_is_refused_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path());

    let mut trainer = Trainer::new(KuhnPoker::new(), TrainingConfig::default()).unwrap();
    trainer.train(100).unwrap();
    let path = trainer.save_checkpoint(&manager).unwrap();

    let holdem = AbstractHoldem::new(HoldemConfig::small()).unwrap();
    let resumed = Trainer::resume_or_new(holdem.clone(), TrainingConfig::default(), &manager);
    assert!(matches!(resumed, Err(SolverError::AbstractionMismatch { .. })));

    let loaded = Blueprint::load(&path, &holdem.abstraction().hash());
    assert!(matches!(loaded, Err(SolverError::AbstractionMismatch { .. })));
}

#[test]
fn holdem_resolution_respects_budget() {
    let game = AbstractHoldem::new(HoldemConfig::small()).unwrap();
    let mut trainer = Trainer::new(game.clone(), TrainingConfig::default().with_seed(12)).unwrap();
    trainer.train(3_000).unwrap();
    let blueprint = Blueprint::from_store(trainer.store(), game.abstraction().hash(), 3_000);

    let root = game.deal_root(&[0, 3]);
    let facing_raise = game.apply_action(&root, &HoldemAction::Bet(0));
    let key = game.infoset_key(&facing_raise, &KeyCodec::current()).unwrap();
    let actions = game.legal_actions(&facing_raise);

    let resolver = Resolver::new(game, blueprint, ResolverConfig::default()).unwrap();
    let start = std::time::Instant::now();
    let resolution = resolver.resolve(&ResolveRequest::new(key, actions.clone(), 50).with_samples(16));

    assert!(start.elapsed().as_millis() < 2_000);
    assert_eq!(resolution.policy.len(), actions.len());
    assert!((resolution.policy.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    let d = &resolution.diagnostics;
    assert!(d.fallback_used || d.iterations_run > 0);
}
