//! Worker side of the pool.
//!
//! A worker is created once and then blocks on its task source. `Init`
//! (re)configures its sampler and stream, each `Batch` resets the local
//! replica from the round's baseline, runs the sampler and answers with the
//! recorded delta, and `Shutdown` ends the loop. The same loop runs on a
//! thread (channels) or in a child process (frames on stdin/stdout).

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, SyncSender};
use std::time::Instant;

use log::debug;

use crate::cfr::game::Game;
use crate::cfr::key::InfosetKey;
use crate::cfr::sampler::{IterationReport, Sampler};
use crate::cfr::store::{self, DenseStore, RegretStore, StoreBackend, StoreSnapshot};
use crate::cfr::stream::RandomStream;
use crate::coordinator::message::{BatchResult, Report, Task};
use crate::coordinator::transport::{read_frame, write_frame};
use crate::error::{Result, SolverError};
use crate::games::{GameSpec, GameVisitor};

/// Where a worker gets its tasks from.
pub trait TaskSource {
    /// Next task, or `None` once the coordinator is gone.
    fn next_task(&mut self) -> Result<Option<Task>>;
}

/// Where a worker sends its reports.
pub trait ReportSink {
    /// Deliver one report.
    fn send_report(&mut self, report: Report) -> Result<()>;
}

impl TaskSource for Receiver<Task> {
    fn next_task(&mut self) -> Result<Option<Task>> {
        Ok(self.recv().ok())
    }
}

impl ReportSink for SyncSender<Report> {
    fn send_report(&mut self, report: Report) -> Result<()> {
        self.send(report)
            .map_err(|_| SolverError::Protocol("coordinator hung up".into()))
    }
}

/// Task frames read from a byte stream.
#[derive(Debug)]
pub struct FrameSource<R>(pub R);

impl<R: Read> TaskSource for FrameSource<R> {
    fn next_task(&mut self) -> Result<Option<Task>> {
        read_frame(&mut self.0)
    }
}

/// Report frames written to a byte stream.
#[derive(Debug)]
pub struct FrameSink<W>(pub W);

impl<W: Write> ReportSink for FrameSink<W> {
    fn send_report(&mut self, report: Report) -> Result<()> {
        write_frame(&mut self.0, &report)
    }
}

/// Store view that writes through to a replica and records every change.
///
/// Reads see the replica, so the sampler behaves as if it owned the full
/// store; the recorded delta is what the coordinator merges.
pub struct DeltaRecorder<'a> {
    replica: &'a mut dyn RegretStore,
    delta: DenseStore,
}

impl<'a> DeltaRecorder<'a> {
    /// Record changes made on top of `replica`.
    pub fn new(replica: &'a mut dyn RegretStore) -> Self {
        Self {
            replica,
            delta: DenseStore::new(None),
        }
    }

    /// Changes recorded so far.
    pub fn into_delta(self) -> StoreSnapshot {
        self.delta.export()
    }
}

impl RegretStore for DeltaRecorder<'_> {
    fn backend(&self) -> StoreBackend {
        self.replica.backend()
    }

    fn regret_floor(&self) -> Option<f64> {
        self.replica.regret_floor()
    }

    fn get_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        self.replica.get_strategy(key, num_actions)
    }

    fn average_strategy(&self, key: &InfosetKey, num_actions: usize) -> Vec<f64> {
        self.replica.average_strategy(key, num_actions)
    }

    fn regret(&self, key: &InfosetKey, action: usize) -> f64 {
        self.replica.regret(key, action)
    }

    fn update_regret(&mut self, key: &InfosetKey, action: usize, delta: f64) {
        self.replica.update_regret(key, action, delta);
        self.delta.update_regret(key, action, delta);
    }

    fn accumulate_strategy(&mut self, key: &InfosetKey, reach: f64, strategy: &[f64]) {
        self.replica.accumulate_strategy(key, reach, strategy);
        self.delta.accumulate_strategy(key, reach, strategy);
    }

    fn discount(&mut self, alpha: f64, beta: f64) {
        self.replica.discount(alpha, beta);
    }

    fn num_infosets(&self) -> usize {
        self.replica.num_infosets()
    }

    fn contains(&self, key: &InfosetKey) -> bool {
        self.replica.contains(key)
    }

    fn export(&self) -> StoreSnapshot {
        self.replica.export()
    }

    fn absorb(&mut self, snapshot: &StoreSnapshot) {
        self.replica.absorb(snapshot);
        self.delta.absorb(snapshot);
    }

    fn clear(&mut self) {
        self.replica.clear();
        self.delta.clear();
    }
}

struct Assignment<G: Game> {
    worker: usize,
    incarnation: u64,
    sampler: Sampler<G>,
}

/// Run the worker loop until shutdown or until the task source closes.
pub fn serve<G, T, R>(game: G, tasks: &mut T, reports: &mut R) -> Result<()>
where
    G: Game,
    T: TaskSource + ?Sized,
    R: ReportSink + ?Sized,
{
    let mut current: Option<Assignment<G>> = None;

    while let Some(task) = tasks.next_task()? {
        match task {
            Task::Init {
                worker,
                incarnation,
                sampler,
                stream,
            } => {
                let rng = RandomStream::from_state(&stream)?;
                debug!("worker {worker} incarnation {incarnation} initialized");
                current = Some(Assignment {
                    worker,
                    incarnation,
                    sampler: Sampler::new(game.clone(), sampler, rng),
                });
                reports.send_report(Report::Ready { worker, incarnation })?;
            }
            Task::Batch {
                batch,
                first_iteration,
                iterations,
                baseline,
            } => {
                let assignment = current
                    .as_mut()
                    .ok_or_else(|| SolverError::Protocol("batch received before init".into()))?;
                let report = match run_batch(assignment, batch, first_iteration, iterations, &baseline) {
                    Ok(result) => Report::Done {
                        worker: assignment.worker,
                        incarnation: assignment.incarnation,
                        result: Box::new(result),
                    },
                    Err(err) => Report::Failed {
                        worker: assignment.worker,
                        incarnation: assignment.incarnation,
                        batch,
                        reason: err.to_string(),
                    },
                };
                reports.send_report(report)?;
            }
            Task::Shutdown => {
                if let Some(assignment) = &current {
                    reports.send_report(Report::Exited {
                        worker: assignment.worker,
                        incarnation: assignment.incarnation,
                    })?;
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

fn run_batch<G: Game>(
    assignment: &mut Assignment<G>,
    batch: u64,
    first_iteration: u64,
    iterations: u64,
    baseline: &StoreSnapshot,
) -> Result<BatchResult> {
    let start = Instant::now();
    let mut replica = store::from_snapshot(baseline);
    let mut recorder = DeltaRecorder::new(replica.as_mut());

    let sampler = &mut assignment.sampler;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        sampler.run_batch(first_iteration, iterations, &mut recorder)
    }));
    let report: IterationReport = match outcome {
        Ok(result) => result?,
        Err(payload) => {
            return Err(SolverError::WorkerCrash {
                worker: assignment.worker,
                batch,
                reason: panic_message(payload.as_ref()),
            })
        }
    };

    Ok(BatchResult {
        batch,
        delta: recorder.into_delta(),
        stream: assignment.sampler.stream_state(),
        report,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("panic: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("panic: {text}")
    } else {
        "panic".to_string()
    }
}

struct StdioWorker<'a> {
    tasks: &'a mut dyn TaskSource,
    reports: &'a mut dyn ReportSink,
}

impl GameVisitor for StdioWorker<'_> {
    type Output = Result<()>;

    fn visit<G: Game + 'static>(self, game: G) -> Self::Output {
        serve(game, self.tasks, self.reports)
    }
}

/// Worker process entry point: the game comes from the command line, tasks
/// arrive on stdin and reports leave on stdout.
pub fn serve_stdio(spec: &GameSpec) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut tasks = FrameSource(stdin.lock());
    let mut reports = FrameSink(std::io::BufWriter::new(stdout.lock()));
    spec.visit(StdioWorker {
        tasks: &mut tasks,
        reports: &mut reports,
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfr::config::SamplerConfig;
    use crate::games::toy::DominatedChoice;
    use std::sync::mpsc::sync_channel;
    use std::sync::Arc;

    fn init(worker: usize) -> Task {
        Task::Init {
            worker,
            incarnation: 0,
            sampler: SamplerConfig::vanilla(),
            stream: RandomStream::for_worker(7, worker as u64).state(),
        }
    }

    fn batch(baseline: StoreSnapshot) -> Task {
        Task::Batch {
            batch: 1,
            first_iteration: 0,
            iterations: 20,
            baseline: Arc::new(baseline),
        }
    }

    #[test]
    fn recorder_captures_changes_only() {
        let key = DominatedChoice::new().root_key().unwrap();
        let mut replica = store::new_store(StoreBackend::Dense, None);
        replica.update_regret(&key, 0, 5.0);

        let mut recorder = DeltaRecorder::new(replica.as_mut());
        recorder.update_regret(&key, 0, 1.0);
        assert_eq!(recorder.regret(&key, 0), 6.0);
        let delta = recorder.into_delta();
        assert_eq!(delta.entries[0].regrets[0], 1.0);
        assert_eq!(replica.regret(&key, 0), 6.0);
    }

    #[test]
    fn serve_answers_batches_over_channels() {
        let (task_tx, mut task_rx) = sync_channel(4);
        let (mut report_tx, report_rx) = sync_channel(4);
        task_tx.send(init(3)).unwrap();
        task_tx
            .send(batch(StoreSnapshot::empty(StoreBackend::Dense, None)))
            .unwrap();
        task_tx.send(Task::Shutdown).unwrap();

        serve(DominatedChoice::new(), &mut task_rx, &mut report_tx).unwrap();

        let reports: Vec<Report> = report_rx.try_iter().collect();
        assert!(matches!(reports[0], Report::Ready { worker: 3, .. }));
        match &reports[1] {
            Report::Done { worker, result, .. } => {
                assert_eq!(*worker, 3);
                assert_eq!(result.report.iterations, 20);
                assert!(!result.delta.is_empty());
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(matches!(reports[2], Report::Exited { worker: 3, .. }));
    }

    #[test]
    fn batch_before_init_is_a_protocol_error() {
        let (task_tx, mut task_rx) = sync_channel(1);
        let (mut report_tx, _report_rx) = sync_channel(1);
        task_tx
            .send(batch(StoreSnapshot::empty(StoreBackend::Dense, None)))
            .unwrap();
        let result = serve(DominatedChoice::new(), &mut task_rx, &mut report_tx);
        assert!(matches!(result, Err(SolverError::Protocol(_))));
    }

    #[test]
    fn serve_speaks_frames() {
        let mut input = Vec::new();
        write_frame(&mut input, &init(0)).unwrap();
        write_frame(&mut input, &batch(StoreSnapshot::empty(StoreBackend::Dense, None))).unwrap();
        write_frame(&mut input, &Task::Shutdown).unwrap();

        let mut tasks = FrameSource(std::io::Cursor::new(input));
        let mut reports = FrameSink(Vec::new());
        serve(DominatedChoice::new(), &mut tasks, &mut reports).unwrap();

        let mut output = std::io::Cursor::new(reports.0);
        let mut kinds = Vec::new();
        while let Some(report) = read_frame::<_, Report>(&mut output).unwrap() {
            kinds.push(match report {
                Report::Ready { .. } => "ready",
                Report::Done { .. } => "done",
                Report::Failed { .. } => "failed",
                Report::Exited { .. } => "exited",
            });
        }
        assert_eq!(kinds, vec!["ready", "done", "exited"]);
    }
}
