//! Blueprint trainer and resolver command line.
//!
//! Usage:
//!   blueprint train --game kuhn --iterations 100000 --checkpoint-dir runs/kuhn
//!   blueprint train --game holdem --processes --workers 8 --checkpoint-dir runs/hu
//!   blueprint resolve --game kuhn --checkpoint runs/kuhn/ckpt_000000100000 --key 1:0:2:1:b0
//!   blueprint inspect --checkpoint runs/kuhn/ckpt_000000100000
//!
//! `--game` takes a name (`kuhn`, `dominated`, `holdem`) or a JSON game
//! description such as `{"game":"holdem","buckets":[4,4],...}`.
//!
//! The `worker` subcommand is what process workers run; it speaks frames on
//! stdin/stdout, so logs always go to stderr.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, LevelFilter};
use serde::Serialize;

use blueprint_solver::cfr::{Game, KeyCodec, StoreBackend, TrainingConfig, TrainingMetrics};
use blueprint_solver::checkpoint::CheckpointManager;
use blueprint_solver::coordinator::{
    serve_stdio, ExecutionContext, MultiInstanceCoordinator, PoolCoordinator, SpawnMode,
};
use blueprint_solver::games::holdem::HoldemConfig;
use blueprint_solver::games::{GameSpec, GameVisitor, ResolvableVisitor};
use blueprint_solver::resolver::{Blueprint, Resolvable, ResolveRequest, Resolver};
use blueprint_solver::RandomStream;

#[derive(Parser)]
#[command(name = "blueprint")]
#[command(about = "External-sampling MCCFR blueprint trainer and real-time resolver")]
struct Cli {
    /// More log output (repeat for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a blueprint with a worker pool.
    Train {
        /// Game name or JSON description.
        #[arg(short, long, value_parser = parse_game, default_value = "kuhn")]
        game: GameSpec,
        /// Training configuration JSON (defaults otherwise).
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Iterations to run in this invocation.
        #[arg(short, long, default_value_t = 100_000)]
        iterations: u64,
        /// Number of workers (overrides config).
        #[arg(short, long)]
        workers: Option<usize>,
        /// Iterations per worker batch (overrides config).
        #[arg(long)]
        batch: Option<u64>,
        /// Run seed (overrides config).
        #[arg(short, long)]
        seed: Option<u64>,
        /// Store backend (overrides config).
        #[arg(long, value_parser = parse_backend)]
        backend: Option<StoreBackend>,
        /// Run workers as child processes instead of threads.
        #[arg(long)]
        processes: bool,
        /// Checkpoint root; training resumes from its newest complete checkpoint.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Independent runs side by side, each under `<checkpoint-dir>/run-<i>`.
        #[arg(long, default_value_t = 1)]
        instances: usize,
    },
    /// Serve tasks on stdin/stdout (started by the pool).
    Worker {
        /// Game description, as JSON.
        #[arg(long, value_parser = parse_game)]
        game: GameSpec,
    },
    /// Refine one decision of a trained blueprint.
    Resolve {
        /// Game name or JSON description.
        #[arg(short, long, value_parser = parse_game, default_value = "kuhn")]
        game: GameSpec,
        /// Checkpoint directory holding the blueprint.
        #[arg(long)]
        checkpoint: PathBuf,
        /// Infoset key in string form, e.g. `1:0:2:1:b0`.
        #[arg(short, long)]
        key: String,
        /// Time budget in milliseconds.
        #[arg(short, long, default_value_t = 100)]
        time_ms: u64,
        /// Worlds to sample (clamped to 16..=64).
        #[arg(long)]
        samples: Option<usize>,
        /// Seed of the world sampler.
        #[arg(short, long, default_value_t = 0)]
        seed: u64,
        /// Configuration JSON whose resolver settings apply.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the metadata of a checkpoint.
    Inspect {
        /// Checkpoint directory.
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn parse_game(text: &str) -> Result<GameSpec, String> {
    match text {
        "kuhn" => Ok(GameSpec::Kuhn),
        "dominated" => Ok(GameSpec::Dominated),
        "holdem" => Ok(GameSpec::Holdem(HoldemConfig::default())),
        "holdem-small" => Ok(GameSpec::Holdem(HoldemConfig::small())),
        json => serde_json::from_str(json).map_err(|e| format!("not a game name or description: {e}")),
    }
}

fn parse_backend(text: &str) -> Result<StoreBackend, String> {
    match text {
        "dense" => Ok(StoreBackend::Dense),
        "compact" => Ok(StoreBackend::Compact),
        other => Err(format!("unknown backend {other:?}, expected dense or compact")),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    // Ignore double initialization.
    let _ = simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
}

struct TrainJob {
    spec: GameSpec,
    config: TrainingConfig,
    iterations: u64,
    processes: bool,
    checkpoint_dir: Option<PathBuf>,
    instances: usize,
}

impl TrainJob {
    fn spawn_mode(&self) -> Result<SpawnMode, Box<dyn Error>> {
        if !self.processes {
            return Ok(SpawnMode::Threads);
        }
        Ok(SpawnMode::Processes {
            program: std::env::current_exe()?,
            args: vec!["worker".to_string()],
            game: self.spec.clone(),
        })
    }

    fn progress(&self) -> ProgressBar {
        let bar = ProgressBar::new(self.iterations);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{elapsed_precise} [{bar:40}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar
    }

    fn train<G: Game + 'static>(self, game: G) -> Result<(), Box<dyn Error>> {
        let spawn = self.spawn_mode()?;

        if self.instances > 1 {
            let root = self
                .checkpoint_dir
                .clone()
                .ok_or("--instances needs --checkpoint-dir")?;
            let multi = MultiInstanceCoordinator::numbered(self.config.clone(), spawn, root, self.instances);
            for outcome in multi.run(&game, self.iterations) {
                match outcome {
                    Ok(summary) => print_summary(&summary.name, &summary.metrics, summary.checkpoint.as_ref()),
                    Err(err) => error!("instance failed: {err}"),
                }
            }
            return Ok(());
        }

        let context = ExecutionContext {
            seed: self.config.seed,
            workers: self.config.pool.workers,
            channel_capacity: self.config.pool.channel_capacity,
            spawn,
        };
        let mut pool = match &self.checkpoint_dir {
            Some(dir) => PoolCoordinator::resume_or_new(game, self.config.clone(), context, CheckpointManager::new(dir))?,
            None => PoolCoordinator::new(game, self.config.clone(), context)?,
        };

        let start = pool.iteration();
        let bar = self.progress();
        let metrics = pool
            .run_with_callback(self.iterations, |m| {
                bar.set_position(m.iterations - start);
                bar.set_message(format!("{} infosets, {:.0} it/s", m.info_sets, m.iterations_per_second));
            })?
            .clone();
        bar.finish_and_clear();

        let checkpoint = match pool.save_checkpoint() {
            Ok(path) => path,
            Err(blueprint_solver::SolverError::CheckpointExists(path)) => Some(path),
            Err(err) => return Err(err.into()),
        };
        pool.shutdown();
        print_summary("run", &metrics, checkpoint.as_ref());
        Ok(())
    }
}

impl GameVisitor for TrainJob {
    type Output = Result<(), Box<dyn Error>>;

    fn visit<G: Game + 'static>(self, game: G) -> Self::Output {
        self.train(game)
    }
}

fn print_summary(name: &str, metrics: &TrainingMetrics, checkpoint: Option<&PathBuf>) {
    info!(
        "{name}: {} iterations, {} infosets, {:.1}s",
        metrics.iterations, metrics.info_sets, metrics.elapsed_seconds
    );
    if let Some(path) = checkpoint {
        println!("{name}: checkpoint {}", path.display());
    }
}

struct ResolveJob {
    checkpoint: PathBuf,
    key: String,
    time_ms: u64,
    samples: Option<usize>,
    seed: u64,
    config: TrainingConfig,
}

#[derive(Serialize)]
struct ResolveOutput {
    key: String,
    actions: Vec<String>,
    policy: Vec<f64>,
    blueprint: Vec<f64>,
    diagnostics: blueprint_solver::resolver::Diagnostics,
}

impl ResolvableVisitor for ResolveJob {
    type Output = Result<(), Box<dyn Error>>;

    fn visit<G: Resolvable + 'static>(self, game: G) -> Self::Output {
        let blueprint = Blueprint::load(&self.checkpoint, &game.abstraction().hash())?;
        info!(
            "loaded blueprint with {} infosets from iteration {}",
            blueprint.len(),
            blueprint.iteration()
        );
        let key = KeyCodec::current().decode(&self.key)?;

        // The key alone does not carry the legal actions; any consistent
        // world has the same ones.
        let mut rng = RandomStream::for_worker(self.seed, u64::MAX);
        let world = game.reconstruct(&key, &blueprint, &mut rng)?;
        let actions = game.legal_actions(&world);
        let labels = actions.iter().map(|a| game.action_name(a)).collect();
        let prior = blueprint.policy(&key, actions.len());

        let resolver = Resolver::new(game, blueprint, self.config.resolver.clone())?.with_seed(self.seed);
        let mut request = ResolveRequest::new(key.clone(), actions, self.time_ms);
        if let Some(samples) = self.samples {
            request = request.with_samples(samples);
        }
        let resolution = resolver.resolve(&request);

        let output = ResolveOutput {
            key: key.to_string(),
            actions: labels,
            policy: resolution.policy,
            blueprint: prior,
            diagnostics: resolution.diagnostics,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TrainingConfig, Box<dyn Error>> {
    let config = match path {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => TrainingConfig::default(),
    };
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Train {
            game,
            config,
            iterations,
            workers,
            batch,
            seed,
            backend,
            processes,
            checkpoint_dir,
            instances,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(batch) = batch {
                config = config.with_batch(batch);
            }
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            if let Some(backend) = backend {
                config = config.with_backend(backend);
            }
            config.validate()?;
            info!(
                "training {} for {iterations} iterations on {} {} workers",
                game.name(),
                config.pool.workers,
                if processes { "process" } else { "thread" }
            );
            let job = TrainJob {
                spec: game.clone(),
                config,
                iterations,
                processes,
                checkpoint_dir,
                instances: instances.max(1),
            };
            game.visit(job)??;
        }
        Commands::Worker { game } => {
            serve_stdio(&game)?;
        }
        Commands::Resolve {
            game,
            checkpoint,
            key,
            time_ms,
            samples,
            seed,
            config,
        } => {
            let config = load_config(config.as_ref())?;
            config.validate()?;
            let job = ResolveJob {
                checkpoint,
                key,
                time_ms,
                samples,
                seed,
                config,
            };
            game.visit_resolvable(job)??;
        }
        Commands::Inspect { checkpoint } => {
            let meta = CheckpointManager::read_meta(&checkpoint)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            let missing = CheckpointManager::missing_artifacts(&checkpoint);
            if !missing.is_empty() {
                println!("missing artifacts: {}", missing.join(", "));
            }
        }
    }
    Ok(())
}
