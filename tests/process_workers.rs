//! Process workers driven through the `blueprint worker` subcommand.

use std::path::PathBuf;

use blueprint_solver::cfr::{SamplerConfig, TrainingConfig};
use blueprint_solver::checkpoint::CheckpointManager;
use blueprint_solver::coordinator::{ExecutionContext, PoolCoordinator};
use blueprint_solver::games::holdem::{AbstractHoldem, HoldemConfig};
use blueprint_solver::games::kuhn::KuhnPoker;
use blueprint_solver::games::GameSpec;

fn config() -> TrainingConfig {
    let mut config = TrainingConfig::default()
        .with_seed(21)
        .with_workers(2)
        .with_batch(50)
        .with_sampler(SamplerConfig::default());
    config.pool.checkpoint_interval = 0;
    config.pool.initial_timeout_ms = 30_000;
    config
}

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_blueprint"))
}

#[test]
fn processes_match_threads() {
    let config = config();

    let mut threads = PoolCoordinator::new(KuhnPoker::new(), config.clone(), ExecutionContext::threads(&config)).unwrap();
    threads.run(300).unwrap();

    let context = ExecutionContext::processes(&config, worker_binary(), GameSpec::Kuhn);
    let mut processes = PoolCoordinator::new(KuhnPoker::new(), config, context).unwrap();
    processes.run(300).unwrap();
    processes.shutdown();

    assert_eq!(processes.iteration(), 300);
    assert_eq!(processes.metrics().worker_failures, 0);
    assert_eq!(processes.store().export(), threads.store().export());
}

#[test]
fn process_pool_trains_holdem_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let holdem = HoldemConfig::small();
    let game = AbstractHoldem::new(holdem.clone()).unwrap();
    let config = config();
    let context = ExecutionContext::processes(&config, worker_binary(), GameSpec::Holdem(holdem));

    let manager = CheckpointManager::new(dir.path());
    let mut pool = PoolCoordinator::resume_or_new(game, config, context, manager).unwrap();
    pool.run(200).unwrap();
    let path = pool.save_checkpoint().unwrap().unwrap();
    pool.shutdown();

    assert!(CheckpointManager::is_complete(&path));
    let meta = CheckpointManager::read_meta(&path).unwrap();
    assert_eq!(meta.iteration, 200);
    assert_eq!(meta.random_stream_state.len(), 2);
    assert!(meta.metrics.info_sets > 0);
}
