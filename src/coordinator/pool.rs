//! Persistent worker pool over one master store.
//!
//! Training proceeds in rounds. At the start of a round the coordinator
//! exports the master store as the baseline, hands every worker a batch of
//! consecutive iterations, and waits for the deltas. Deltas are merged in
//! worker order, so a run is reproducible for a fixed seed and worker
//! count. Discounting and checkpoints happen between rounds only.
//!
//! Failure handling:
//!
//! ```text
//! timeout / crash ──► graceful shutdown ──► forced kill ──► respawn (incarnation + 1)
//!                                                              │
//!                          same batch, last known stream ◄─────┘
//! ```
//!
//! A batch gets one retry. A second failure of the same batch, or
//! `max_consecutive_failures` failures in a row, aborts the run.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cfr::config::{TrainingConfig, TrainingMetrics};
use crate::cfr::game::Game;
use crate::cfr::sampler::IterationReport;
use crate::cfr::store::{self, RegretStore, StoreSnapshot};
use crate::cfr::stream::{RandomStream, StreamState};
use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::coordinator::message::{BatchResult, Report, Task};
use crate::coordinator::transport::{read_frame, write_frame};
use crate::coordinator::worker::{serve, ReportSink};
use crate::error::{Result, SolverError};
use crate::games::GameSpec;

/// Smoothing factor of the seconds-per-iteration average.
const EWMA_WEIGHT: f64 = 0.2;

/// How workers are started.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnMode {
    /// In-process threads talking over bounded channels.
    Threads,
    /// Child processes talking frames over stdin/stdout.
    ///
    /// The command line is `program args... --game <json>`.
    Processes {
        /// Executable to run.
        program: PathBuf,
        /// Leading arguments, typically the `worker` subcommand.
        args: Vec<String>,
        /// Game the workers build.
        game: GameSpec,
    },
}

/// Explicit execution settings of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    /// Run seed; worker `i` uses stream `i` of it.
    pub seed: u64,
    /// Number of workers.
    pub workers: usize,
    /// Capacity of each bounded channel.
    pub channel_capacity: usize,
    /// How workers are started.
    pub spawn: SpawnMode,
}

impl ExecutionContext {
    /// Thread workers sized from `config`.
    pub fn threads(config: &TrainingConfig) -> Self {
        Self {
            seed: config.seed,
            workers: config.pool.workers,
            channel_capacity: config.pool.channel_capacity,
            spawn: SpawnMode::Threads,
        }
    }

    /// Process workers sized from `config`, running `program worker`.
    pub fn processes(config: &TrainingConfig, program: PathBuf, game: GameSpec) -> Self {
        Self {
            seed: config.seed,
            workers: config.pool.workers,
            channel_capacity: config.pool.channel_capacity,
            spawn: SpawnMode::Processes {
                program,
                args: vec!["worker".to_string()],
                game,
            },
        }
    }
}

trait WorkerLink: Send {
    fn send(&mut self, task: Task) -> Result<()>;

    /// Ask the worker to stop, and force it after `grace`.
    fn terminate(&mut self, grace: Duration);
}

struct ThreadLink {
    worker: usize,
    tasks: Option<SyncSender<Task>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerLink for ThreadLink {
    fn send(&mut self, task: Task) -> Result<()> {
        let tasks = self
            .tasks
            .as_ref()
            .ok_or_else(|| SolverError::Protocol("worker already terminated".into()))?;
        tasks
            .send(task)
            .map_err(|_| SolverError::Protocol(format!("worker {} channel closed", self.worker)))
    }

    fn terminate(&mut self, grace: Duration) {
        if let Some(tasks) = self.tasks.take() {
            let _ = tasks.try_send(Task::Shutdown);
        }
        let Some(handle) = self.handle.take() else { return };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            // Threads cannot be killed; the stale incarnation is ignored.
            warn!("worker {} thread did not stop in time, detaching it", self.worker);
        }
    }
}

struct ProcessLink {
    worker: usize,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl WorkerLink for ProcessLink {
    fn send(&mut self, task: Task) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SolverError::Protocol("worker already terminated".into()))?;
        write_frame(stdin, &task)
    }

    fn terminate(&mut self, grace: Duration) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = write_frame(&mut stdin, &Task::Shutdown);
        }
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                _ => break,
            }
        }
        warn!("worker {} process did not exit in time, killing it", self.worker);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug, Clone)]
struct Pending {
    batch: u64,
    first_iteration: u64,
    iterations: u64,
    attempts: u32,
    deadline: Instant,
}

struct Slot {
    incarnation: u64,
    link: Option<Box<dyn WorkerLink>>,
}

/// Coordinates persistent workers training one master store.
pub struct PoolCoordinator<G: Game + 'static> {
    game: G,
    config: TrainingConfig,
    context: ExecutionContext,
    store: Box<dyn RegretStore>,
    iteration: u64,
    next_batch: u64,
    streams: Vec<StreamState>,
    metrics: TrainingMetrics,
    elapsed_before: f64,
    last_discount: Option<(f64, f64)>,
    seconds_per_iteration: Option<f64>,
    consecutive_failures: usize,
    checkpoints: Option<CheckpointManager>,
    reports_tx: SyncSender<Report>,
    reports_rx: Receiver<Report>,
    slots: Vec<Slot>,
}

impl<G: Game + 'static> PoolCoordinator<G> {
    /// Create a pool with an empty master store. Workers start on the
    /// first call to [`run`](Self::run).
    pub fn new(game: G, config: TrainingConfig, context: ExecutionContext) -> Result<Self> {
        config.validate()?;
        if context.workers == 0 {
            return Err(crate::cfr::config::ConfigError::ZeroWorkers.into());
        }
        if context.channel_capacity == 0 {
            return Err(crate::cfr::config::ConfigError::ZeroCapacity.into());
        }
        let streams = (0..context.workers)
            .map(|i| RandomStream::for_worker(context.seed, i as u64).state())
            .collect();
        // Room for every worker's in-flight reports plus stale ones.
        let (reports_tx, reports_rx) = sync_channel(context.channel_capacity * context.workers * 2);
        Ok(Self {
            store: store::new_store(config.backend, config.sampler.regret_floor),
            game,
            config,
            context,
            iteration: 0,
            next_batch: 0,
            streams,
            metrics: TrainingMetrics::new(),
            elapsed_before: 0.0,
            last_discount: None,
            seconds_per_iteration: None,
            consecutive_failures: 0,
            checkpoints: None,
            reports_tx,
            reports_rx,
            slots: Vec::new(),
        })
    }

    /// Write checkpoints through `manager` every `checkpoint_interval`
    /// iterations.
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager.with_retention(self.config.pool.checkpoint_keep));
        self
    }

    /// Resume from the newest complete checkpoint under `manager`, or start
    /// fresh. Either way, checkpoints are written through `manager`.
    pub fn resume_or_new(
        game: G,
        config: TrainingConfig,
        context: ExecutionContext,
        manager: CheckpointManager,
    ) -> Result<Self> {
        let hash = game.abstraction().hash();
        let mut pool = Self::new(game, config, context)?;
        if let Some(path) = manager.latest_complete()? {
            let loaded = manager.load(&path, &hash)?;
            loaded.meta.warn_on_config_drift(&pool.config);
            if loaded.meta.random_stream_state.len() != pool.context.workers {
                warn!(
                    "checkpoint has {} worker streams, pool has {} workers; missing streams start fresh",
                    loaded.meta.random_stream_state.len(),
                    pool.context.workers
                );
            }
            for (slot, state) in pool.streams.iter_mut().zip(&loaded.meta.random_stream_state) {
                RandomStream::from_state(state)?;
                *slot = state.clone();
            }
            info!("resuming pool from {} at iteration {}", path.display(), loaded.meta.iteration);
            pool.iteration = loaded.meta.iteration;
            pool.elapsed_before = loaded.meta.elapsed_seconds;
            pool.metrics = loaded.meta.metrics;
            pool.last_discount = loaded.meta.last_discount;
            pool.store = loaded.store;
        } else {
            info!("no complete checkpoint under {}, starting fresh", manager.root().display());
        }
        Ok(pool.with_checkpoints(manager))
    }

    /// Completed iterations.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// The master store.
    pub fn store(&self) -> &dyn RegretStore {
        self.store.as_ref()
    }

    /// Training metrics.
    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// Last known stream state of every worker.
    pub fn streams(&self) -> &[StreamState] {
        &self.streams
    }

    /// Current adaptive timeout for a batch of `iterations`.
    pub fn batch_timeout(&self, iterations: u64) -> Duration {
        let pool = &self.config.pool;
        match self.seconds_per_iteration {
            None => Duration::from_millis(pool.initial_timeout_ms),
            Some(secs) => {
                let expected = pool.timeout_factor * secs * iterations as f64;
                Duration::from_secs_f64(expected).max(Duration::from_millis(pool.timeout_floor_ms))
            }
        }
    }

    /// Run `iterations` more iterations.
    pub fn run(&mut self, iterations: u64) -> Result<&TrainingMetrics> {
        self.run_with_callback(iterations, |_| {})
    }

    /// Run `iterations` more iterations, calling `callback` after every round.
    pub fn run_with_callback<F>(&mut self, iterations: u64, mut callback: F) -> Result<&TrainingMetrics>
    where
        F: FnMut(&TrainingMetrics),
    {
        self.ensure_started()?;
        let start = Instant::now();
        let base = self.elapsed_before;
        let target = self.iteration + iterations;

        while self.iteration < target {
            let before = self.iteration;
            self.run_round(target - self.iteration)?;
            self.refresh_metrics(base + start.elapsed().as_secs_f64());
            callback(&self.metrics);

            let interval = self.config.pool.checkpoint_interval;
            if interval > 0 && self.iteration / interval > before / interval {
                self.elapsed_before = base + start.elapsed().as_secs_f64();
                self.save_checkpoint()?;
            }
        }

        self.elapsed_before = base + start.elapsed().as_secs_f64();
        self.refresh_metrics(self.elapsed_before);
        Ok(&self.metrics)
    }

    /// Write a checkpoint now, if a manager is attached.
    pub fn save_checkpoint(&self) -> Result<Option<PathBuf>> {
        let Some(manager) = &self.checkpoints else { return Ok(None) };
        let mut metrics = self.metrics.clone();
        metrics.iterations = self.iteration;
        metrics.info_sets = self.store.num_infosets();
        let meta = CheckpointMeta::new(
            self.iteration,
            self.elapsed_before,
            metrics,
            self.streams.clone(),
            self.game.abstraction().hash(),
            &self.config,
            self.game.num_players(),
            self.last_discount,
        )?;
        manager.save(&meta, self.store.as_ref()).map(Some)
    }

    /// Stop every worker.
    pub fn shutdown(&mut self) {
        let grace = Duration::from_millis(self.config.pool.grace_ms);
        for (worker, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mut link) = slot.link.take() {
                debug!("stopping worker {worker}");
                link.terminate(grace);
            }
        }
    }

    fn refresh_metrics(&mut self, elapsed: f64) {
        self.metrics.iterations = self.iteration;
        self.metrics.info_sets = self.store.num_infosets();
        self.metrics.elapsed_seconds = elapsed;
        self.metrics.update_rate();
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.slots.is_empty() {
            return Ok(());
        }
        info!(
            "starting {} {} workers",
            self.context.workers,
            match self.context.spawn {
                SpawnMode::Threads => "thread",
                SpawnMode::Processes { .. } => "process",
            }
        );
        for worker in 0..self.context.workers {
            self.slots.push(Slot {
                incarnation: 0,
                link: None,
            });
            self.start_worker(worker)?;
        }
        Ok(())
    }

    fn start_worker(&mut self, worker: usize) -> Result<()> {
        let incarnation = self.slots[worker].incarnation;
        let mut link = self.spawn_link(worker, incarnation)?;
        let init = Task::Init {
            worker,
            incarnation,
            sampler: self.config.sampler.clone(),
            stream: self.streams[worker].clone(),
        };
        if let Err(err) = link.send(init) {
            warn!("could not initialize worker {worker}: {err}");
        }
        self.slots[worker].link = Some(link);
        Ok(())
    }

    fn spawn_link(&self, worker: usize, incarnation: u64) -> Result<Box<dyn WorkerLink>> {
        let capacity = self.context.channel_capacity.max(2);
        match &self.context.spawn {
            SpawnMode::Threads => {
                let (task_tx, mut task_rx) = sync_channel::<Task>(capacity);
                let mut reports = self.reports_tx.clone();
                let game = self.game.clone();
                let handle = thread::Builder::new()
                    .name(format!("cfr-worker-{worker}"))
                    .spawn(move || {
                        if let Err(err) = serve(game, &mut task_rx, &mut reports) {
                            warn!("worker {worker} stopped: {err}");
                            let _ = reports.send_report(Report::Exited { worker, incarnation });
                        }
                    })?;
                Ok(Box::new(ThreadLink {
                    worker,
                    tasks: Some(task_tx),
                    handle: Some(handle),
                }))
            }
            SpawnMode::Processes { program, args, game } => {
                let spec = serde_json::to_string(game)?;
                let mut child = Command::new(program)
                    .args(args)
                    .arg("--game")
                    .arg(spec)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| SolverError::Protocol("worker stdin unavailable".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| SolverError::Protocol("worker stdout unavailable".into()))?;
                let reports = self.reports_tx.clone();
                thread::Builder::new()
                    .name(format!("cfr-worker-{worker}-reader"))
                    .spawn(move || {
                        let mut reader = BufReader::new(stdout);
                        loop {
                            match read_frame::<_, Report>(&mut reader) {
                                Ok(Some(report)) => {
                                    if reports.send(report).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    warn!("worker {worker} sent a bad frame: {err}");
                                    break;
                                }
                            }
                        }
                        let _ = reports.send(Report::Exited { worker, incarnation });
                    })?;
                debug!("spawned worker {worker} as pid {}", child.id());
                Ok(Box::new(ProcessLink {
                    worker,
                    child,
                    stdin: Some(BufWriter::new(stdin)),
                }))
            }
        }
    }

    fn send_batch(&mut self, worker: usize, pending: &Pending, baseline: &Arc<StoreSnapshot>) {
        let task = Task::Batch {
            batch: pending.batch,
            first_iteration: pending.first_iteration,
            iterations: pending.iterations,
            baseline: Arc::clone(baseline),
        };
        let sent = match self.slots[worker].link.as_mut() {
            Some(link) => link.send(task),
            None => Err(SolverError::Protocol("worker has no link".into())),
        };
        // A dead worker surfaces as an exit report or a timeout.
        if let Err(err) = sent {
            warn!("could not send batch {} to worker {worker}: {err}", pending.batch);
        }
    }

    fn run_round(&mut self, remaining: u64) -> Result<()> {
        let baseline = Arc::new(self.store.export());
        let batch_size = self.config.pool.batch_iterations;
        let workers = self.context.workers;

        let mut plan: Vec<Option<Pending>> = Vec::with_capacity(workers);
        let mut assigned = 0;
        for worker in 0..workers {
            let iterations = batch_size.min(remaining - assigned);
            if iterations == 0 {
                plan.push(None);
                continue;
            }
            let pending = Pending {
                batch: self.next_batch,
                first_iteration: self.iteration + assigned,
                iterations,
                attempts: 0,
                deadline: Instant::now() + self.batch_timeout(iterations),
            };
            self.next_batch += 1;
            assigned += iterations;
            self.send_batch(worker, &pending, &baseline);
            plan.push(Some(pending));
        }

        let mut results: Vec<Option<BatchResult>> = vec![None; workers];
        loop {
            let outstanding: Vec<usize> = (0..workers)
                .filter(|&w| plan[w].is_some() && results[w].is_none())
                .collect();
            let Some(deadline) = outstanding
                .iter()
                .filter_map(|&w| plan[w].as_ref().map(|p| p.deadline))
                .min()
            else {
                break;
            };

            match self
                .reports_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok(report) => self.handle_report(report, &mut plan, &mut results, &baseline)?,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    for worker in outstanding {
                        let Some(pending) = plan[worker].as_ref() else { continue };
                        if pending.deadline <= now {
                            let err = SolverError::WorkerTimeout {
                                worker,
                                batch: pending.batch,
                                waited_ms: self.batch_timeout(pending.iterations).as_millis() as u64,
                            };
                            self.recover(worker, err, &mut plan, &baseline)?;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SolverError::Protocol("report channel closed".into()));
                }
            }
        }

        self.merge(results);
        Ok(())
    }

    fn handle_report(
        &mut self,
        report: Report,
        plan: &mut [Option<Pending>],
        results: &mut [Option<BatchResult>],
        baseline: &Arc<StoreSnapshot>,
    ) -> Result<()> {
        let (worker, incarnation) = report.origin();
        if self.slots.get(worker).map(|s| s.incarnation) != Some(incarnation) {
            debug!("ignoring report from retired worker {worker} incarnation {incarnation}");
            return Ok(());
        }
        let awaiting = plan[worker].as_ref().filter(|_| results[worker].is_none()).map(|p| p.batch);

        match report {
            Report::Ready { .. } => debug!("worker {worker} ready"),
            Report::Done { result, .. } => {
                if awaiting != Some(result.batch) {
                    debug!("ignoring unexpected result for batch {} from worker {worker}", result.batch);
                    return Ok(());
                }
                if let Some(pending) = &plan[worker] {
                    self.observe(result.elapsed_ms, pending.iterations);
                }
                self.consecutive_failures = 0;
                results[worker] = Some(*result);
            }
            Report::Failed { batch, reason, .. } => {
                if awaiting == Some(batch) {
                    let err = SolverError::WorkerCrash { worker, batch, reason };
                    self.recover(worker, err, plan, baseline)?;
                }
            }
            Report::Exited { .. } => {
                if let Some(batch) = awaiting {
                    let err = SolverError::WorkerCrash {
                        worker,
                        batch,
                        reason: "worker exited".into(),
                    };
                    self.recover(worker, err, plan, baseline)?;
                }
            }
        }
        Ok(())
    }

    fn observe(&mut self, elapsed_ms: u64, iterations: u64) {
        let sample = elapsed_ms as f64 / 1000.0 / iterations.max(1) as f64;
        self.seconds_per_iteration = Some(match self.seconds_per_iteration {
            Some(avg) => EWMA_WEIGHT * sample + (1.0 - EWMA_WEIGHT) * avg,
            None => sample,
        });
    }

    fn recover(
        &mut self,
        worker: usize,
        err: SolverError,
        plan: &mut [Option<Pending>],
        baseline: &Arc<StoreSnapshot>,
    ) -> Result<()> {
        warn!("{err}");
        self.metrics.worker_failures += 1;
        self.consecutive_failures += 1;

        let Some(pending) = plan[worker].as_mut() else { return Ok(()) };
        pending.attempts += 1;
        if pending.attempts > 1 || self.consecutive_failures >= self.config.pool.max_consecutive_failures {
            self.shutdown();
            return Err(SolverError::RunAborted {
                failures: self.consecutive_failures,
                last: Box::new(err),
            });
        }

        if let Some(mut link) = self.slots[worker].link.take() {
            link.terminate(Duration::from_millis(self.config.pool.grace_ms));
        }
        self.slots[worker].incarnation += 1;
        info!(
            "respawning worker {worker} as incarnation {} to retry batch {}",
            self.slots[worker].incarnation, pending.batch
        );
        self.start_worker(worker)?;

        pending.deadline = Instant::now() + self.batch_timeout(pending.iterations);
        let pending = pending.clone();
        self.send_batch(worker, &pending, baseline);
        plan[worker] = Some(pending);
        Ok(())
    }

    fn merge(&mut self, results: Vec<Option<BatchResult>>) {
        let mut round = IterationReport::default();
        for (worker, result) in results.into_iter().enumerate() {
            let Some(result) = result else { continue };
            self.store.absorb(&result.delta);
            self.streams[worker] = result.stream;
            round.merge(&result.report);
        }

        let from = self.iteration;
        self.iteration += round.iterations;
        self.metrics.regret_updates += round.regret_updates;
        self.metrics.pruned_actions += round.pruned_actions;
        self.metrics.nodes_visited += round.nodes_visited;

        for (at, alpha, beta) in self.config.sampler.discount.due_between(from, self.iteration) {
            debug!("discount at iteration {at}: alpha={alpha:.4} beta={beta:.4}");
            self.store.discount(alpha, beta);
            self.last_discount = Some((alpha, beta));
            self.metrics.discounts_applied += 1;
        }
        debug!(
            "round {}..{} merged, {} infosets",
            from,
            self.iteration,
            self.store.num_infosets()
        );
    }
}

impl<G: Game + 'static> Drop for PoolCoordinator<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
