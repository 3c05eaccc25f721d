//! Benchmarks for the sampler, the stores and the resolver.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use blueprint_solver::cfr::store::{new_store, StoreBackend};
use blueprint_solver::cfr::{Game, KeyCodec, RandomStream, Sampler, SamplerConfig, Trainer, TrainingConfig};
use blueprint_solver::games::holdem::{AbstractHoldem, HoldemConfig};
use blueprint_solver::games::kuhn::KuhnPoker;
use blueprint_solver::resolver::{Blueprint, ResolveRequest, Resolver};

fn kuhn_iteration_benchmark(c: &mut Criterion) {
    let game = KuhnPoker::new();
    let config = TrainingConfig::default().with_seed(42);
    let mut trainer = Trainer::new(game, config).expect("valid config");

    c.bench_function("kuhn_single_iteration", |b| {
        b.iter(|| {
            trainer.run_iteration().expect("iteration");
            black_box(trainer.iteration())
        })
    });
}

fn kuhn_1000_iterations_benchmark(c: &mut Criterion) {
    c.bench_function("kuhn_1000_iterations", |b| {
        b.iter(|| {
            let game = KuhnPoker::new();
            let config = TrainingConfig::default().with_seed(42);
            let mut trainer = Trainer::new(game, config).expect("valid config");
            trainer.train(black_box(1000)).map(|m| m.info_sets).expect("training")
        })
    });
}

fn store_backend_benchmark(c: &mut Criterion) {
    let game = AbstractHoldem::new(HoldemConfig::small()).expect("valid game");
    for backend in [StoreBackend::Dense, StoreBackend::Compact] {
        let mut sampler = Sampler::new(game.clone(), SamplerConfig::default(), RandomStream::from_seed(7));
        let mut store = new_store(backend, Some(-300_000.0));
        let mut iteration = 0u64;
        c.bench_function(&format!("holdem_batch_100_{backend}"), |b| {
            b.iter(|| {
                let report = sampler
                    .run_batch(iteration, 100, store.as_mut())
                    .expect("batch");
                iteration += 100;
                black_box(report.nodes_visited)
            })
        });
    }
}

fn resolve_benchmark(c: &mut Criterion) {
    let game = AbstractHoldem::new(HoldemConfig::small()).expect("valid game");
    let mut trainer = Trainer::new(game.clone(), TrainingConfig::default().with_seed(3)).expect("valid config");
    trainer.train(5_000).expect("training");
    let blueprint = Blueprint::from_store(trainer.store(), game.abstraction().hash(), 5_000);

    let root = game.deal_root(&[2, 1]);
    let key = game.infoset_key(&root, &KeyCodec::current()).expect("encodable key");
    let actions = game.legal_actions(&root);
    let resolver = Resolver::new(game, blueprint, Default::default()).expect("same abstraction");

    c.bench_function("holdem_resolve_20ms", |b| {
        b.iter(|| {
            let request = ResolveRequest::new(key.clone(), actions.clone(), 20).with_samples(16);
            black_box(resolver.resolve(&request).diagnostics.iterations_run)
        })
    });
}

criterion_group!(
    benches,
    kuhn_iteration_benchmark,
    kuhn_1000_iterations_benchmark,
    store_backend_benchmark,
    resolve_benchmark
);
criterion_main!(benches);
