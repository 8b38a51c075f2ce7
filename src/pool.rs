//! Pool manager for the isolated OCR workers.
//!
//! One bounded MPMC task channel feeds every worker; a shared result channel
//! funnels envelopes back to a single collector thread that routes each one
//! to the caller registered under its correlation id. Workers are separate
//! OS processes (re-exec of this binary) so a native inference fault takes
//! down only its own slot.

use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, SendTimeoutError};
use dashmap::DashMap;
use std::io::BufReader;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::metrics;
use crate::protocol::{
    read_frame, write_frame, FailureKind, OcrRequest, ResultEnvelope, TaskEnvelope, TaskOutcome,
    WorkerRequest,
};
use crate::worker::WORKER_SUBCOMMAND;

/// How often the collector wakes to check the shutdown flag.
const COLLECTOR_POLL: Duration = Duration::from_millis(200);

/// Pool-level submission errors. Task-level failures travel inside
/// `TaskOutcome` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded task channel stayed full for the whole timeout budget.
    /// Retryable backpressure, distinct from a timeout.
    #[error("task queue full")]
    QueueFull,

    /// No result arrived within the timeout. The task may still be running;
    /// its eventual result is dropped by the collector.
    #[error("timed out waiting for OCR result")]
    Timeout,

    #[error("pool is closed")]
    Closed,
}

/// One worker slot as seen by its bridge thread. `ProcessRunner` is the
/// production implementation; `worker::LocalRunner` runs in-process.
pub trait WorkerRunner: Send {
    /// Execute one task to completion. An `Err` means the worker itself is
    /// gone (crashed process, broken pipe) — no result exists for the task
    /// and the slot is abandoned.
    fn run_task(&mut self, task: TaskEnvelope) -> Result<ResultEnvelope>;

    /// Deliver the stop sentinel and reap the worker, waiting up to
    /// `join_timeout` before forcing it.
    fn shutdown(&mut self, join_timeout: Duration);
}

enum PoolMessage {
    Task(TaskEnvelope),
    Stop(Duration),
}

pub struct OcrPool {
    task_tx: Sender<PoolMessage>,
    pending: Arc<DashMap<Uuid, Sender<ResultEnvelope>>>,
    closed: Arc<AtomicBool>,
    worker_count: usize,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl OcrPool {
    /// Spawn the pool with subprocess workers (re-exec of the current
    /// executable). Fails fast if any worker cannot be spawned.
    pub fn spawn(config: &PoolConfig) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate current executable")?;
        Self::spawn_with(config, move |index| {
            let runner = ProcessRunner::launch(&exe, index)?;
            Ok(Box::new(runner) as Box<dyn WorkerRunner>)
        })
    }

    /// Spawn the pool with caller-supplied workers. Used for in-process
    /// workers and test doubles; the channel/collector/registry plumbing is
    /// identical to the subprocess path.
    pub fn spawn_with<F>(config: &PoolConfig, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Box<dyn WorkerRunner>>,
    {
        let (task_tx, task_rx) = bounded::<PoolMessage>(config.queue_capacity());
        let (result_tx, result_rx) = unbounded::<ResultEnvelope>();
        let pending: Arc<DashMap<Uuid, Sender<ResultEnvelope>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let mut worker_threads = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let runner = factory(index)?;
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ocr-worker-{index}"))
                .spawn(move || bridge_loop(index, runner, task_rx, result_tx))
                .context("failed to spawn worker bridge thread")?;
            metrics::WORKERS_ALIVE.inc();
            worker_threads.push(handle);
        }
        drop(result_tx);

        let collector = {
            let pending = pending.clone();
            let closed = closed.clone();
            thread::Builder::new()
                .name("ocr-collector".to_string())
                .spawn(move || collector_loop(result_rx, pending, closed))
                .context("failed to spawn collector thread")?
        };

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity(),
            "OCR pool started"
        );

        Ok(Self {
            task_tx,
            pending,
            closed,
            worker_count: config.worker_count,
            worker_threads: Mutex::new(worker_threads),
            collector: Mutex::new(Some(collector)),
        })
    }

    /// Submit one request and block until its result, a backpressure
    /// rejection, or the timeout. The registry entry for the correlation id
    /// is removed on every exit path.
    pub fn submit(&self, request: OcrRequest, timeout: Duration) -> Result<TaskOutcome, SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }
        metrics::OCR_REQUESTS.inc();
        let started = Instant::now();
        let deadline = started + timeout;

        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = bounded::<ResultEnvelope>(1);
        self.pending.insert(id, reply_tx);

        let envelope = TaskEnvelope { id, request };
        if let Err(e) = self
            .task_tx
            .send_timeout(PoolMessage::Task(envelope), timeout)
        {
            self.pending.remove(&id);
            return Err(match e {
                SendTimeoutError::Timeout(_) => {
                    metrics::OCR_QUEUE_FULL.inc();
                    debug!(%id, "task queue full, rejecting submission");
                    SubmitError::QueueFull
                }
                SendTimeoutError::Disconnected(_) => SubmitError::Closed,
            });
        }

        let outcome = match reply_rx.recv_deadline(deadline) {
            Ok(result) => {
                if let TaskOutcome::Failure(failure) = &result.outcome {
                    metrics::OCR_TASK_FAILURES
                        .with_label_values(&[failure_label(failure.kind)])
                        .inc();
                }
                Ok(result.outcome)
            }
            Err(_) => {
                metrics::OCR_TIMEOUTS.inc();
                debug!(%id, elapsed_ms = started.elapsed().as_millis() as u64, "request timed out");
                Err(SubmitError::Timeout)
            }
        };

        self.pending.remove(&id);
        metrics::SUBMIT_LATENCY.observe(started.elapsed().as_secs_f64());
        outcome
    }

    /// Shut the pool down: stop accepting submissions, push one stop sentinel
    /// per worker, reap workers up to `join_timeout`, then stop the
    /// collector. Idempotent.
    pub fn close(&self, join_timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing OCR pool");

        for _ in 0..self.worker_count {
            if self.task_tx.try_send(PoolMessage::Stop(join_timeout)).is_err() {
                break;
            }
        }

        let mut threads = self
            .worker_threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut remaining: Vec<JoinHandle<()>> = threads.drain(..).collect();
        drop(threads);

        // Sentinels queue behind in-flight tasks, so give bridges the join
        // budget plus a little slack before detaching stragglers.
        let deadline = Instant::now() + join_timeout + Duration::from_secs(1);
        while !remaining.is_empty() && Instant::now() < deadline {
            remaining.retain(|handle| !handle.is_finished());
            if remaining.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        if !remaining.is_empty() {
            warn!(
                stuck = remaining.len(),
                "worker bridges still busy at close deadline, detaching"
            );
        }

        let collector = self
            .collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = collector {
            let _ = handle.join();
        }
        self.pending.clear();
        info!("OCR pool closed");
    }

    /// Number of callers currently waiting on a result. Stays bounded over
    /// any sequence of submit/timeout cycles.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl Drop for OcrPool {
    fn drop(&mut self) {
        self.close(Duration::from_secs(5));
    }
}

fn failure_label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Decode => "decode",
        FailureKind::NotFound => "not_found",
        FailureKind::Init => "init",
        FailureKind::Internal => "internal",
    }
}

/// One bridge thread per worker slot: pull from the shared task channel,
/// run the task on the worker, push the result. A dead worker ends the
/// thread without producing a result — the waiting caller times out and the
/// slot is not respawned.
fn bridge_loop(
    index: usize,
    mut runner: Box<dyn WorkerRunner>,
    task_rx: Receiver<PoolMessage>,
    result_tx: Sender<ResultEnvelope>,
) {
    loop {
        match task_rx.recv() {
            Ok(PoolMessage::Task(task)) => {
                let id = task.id;
                match runner.run_task(task) {
                    Ok(result) => {
                        let _ = result_tx.send(result);
                    }
                    Err(e) => {
                        error!(worker = index, %id, error = %e, "worker lost mid-task, abandoning slot");
                        metrics::WORKERS_ALIVE.dec();
                        return;
                    }
                }
            }
            Ok(PoolMessage::Stop(join_timeout)) => {
                runner.shutdown(join_timeout);
                break;
            }
            Err(_) => {
                // Pool dropped without close(); stop the worker anyway.
                runner.shutdown(Duration::from_secs(1));
                break;
            }
        }
    }
    metrics::WORKERS_ALIVE.dec();
    debug!(worker = index, "worker bridge exited");
}

/// Single collector thread: drain the shared result channel and route each
/// envelope to its registered caller. A short poll keeps shutdown
/// cooperative; a result with no registry entry belongs to a caller that
/// already gave up and is dropped on purpose.
fn collector_loop(
    result_rx: Receiver<ResultEnvelope>,
    pending: Arc<DashMap<Uuid, Sender<ResultEnvelope>>>,
    closed: Arc<AtomicBool>,
) {
    while !closed.load(Ordering::SeqCst) {
        let envelope = match result_rx.recv_timeout(COLLECTOR_POLL) {
            Ok(envelope) => envelope,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match pending.get(&envelope.id) {
            Some(slot) => {
                // Capacity-1 slot; never block the collector even if the
                // caller raced away between lookup and delivery.
                let _ = slot.try_send(envelope);
            }
            None => {
                metrics::RESULTS_DROPPED.inc();
                debug!(id = %envelope.id, "dropping result for departed caller");
            }
        }
    }
    debug!("collector exited");
}

/// Subprocess worker handle: framed requests down stdin, framed results up
/// stdout, stderr inherited for logs.
pub struct ProcessRunner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    index: usize,
}

impl ProcessRunner {
    pub fn launch(exe: &Path, index: usize) -> Result<Self> {
        let mut child = Command::new(exe)
            .arg(WORKER_SUBCOMMAND)
            .env("OCR_WORKER_INDEX", index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn worker process {index}"))?;
        let stdin = child
            .stdin
            .take()
            .context("worker stdin pipe unavailable")?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .context("worker stdout pipe unavailable")?;
        info!(worker = index, pid = child.id(), "spawned worker process");
        Ok(Self {
            child,
            stdin,
            stdout,
            index,
        })
    }
}

impl WorkerRunner for ProcessRunner {
    fn run_task(&mut self, task: TaskEnvelope) -> Result<ResultEnvelope> {
        write_frame(&mut self.stdin, &WorkerRequest::Task(task))?;
        let result = read_frame(&mut self.stdout)?;
        Ok(result)
    }

    fn shutdown(&mut self, join_timeout: Duration) {
        let _ = write_frame(&mut self.stdin, &WorkerRequest::Stop);
        let deadline = Instant::now() + join_timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker = self.index, %status, "worker process exited");
                    return;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(worker = self.index, error = %e, "failed to reap worker");
                    break;
                }
            }
        }
        warn!(worker = self.index, "worker did not exit in time, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
