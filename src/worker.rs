//! Worker side of the pool: Initializing → Ready → Busy loop over framed
//! stdin/stdout, with the per-worker response cache.
//!
//! Init-failure policy: a worker whose engine fails to load stays alive in a
//! degraded Ready state and answers every task with an `Init` failure. The
//! pool keeps its full slot count; the slot just cannot serve until the node
//! is restarted with a working model setup.

use std::io::{self, BufReader, BufWriter};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::cache::{fingerprint, FifoCache};
use crate::config::{Config, PoolConfig};
use crate::engine::{build_engine, EngineError, OcrEngine, RecognizeOptions};
use crate::pool::WorkerRunner;
use crate::preprocess;
use crate::protocol::{
    read_frame, write_frame, FailureKind, OcrRequest, ResultEnvelope, TaskEnvelope, TaskFailure,
    TaskOutcome, TextLine, WorkerRequest,
};

/// Argument the pool passes when re-executing the binary as a worker.
pub const WORKER_SUBCOMMAND: &str = "ocr-worker";

/// Model state plus cache for one worker. Used strictly sequentially.
pub struct WorkerState {
    engine: Option<Box<dyn OcrEngine>>,
    init_error: Option<String>,
    cache: FifoCache,
    default_limit_side_len: u32,
}

impl WorkerState {
    pub fn new(engine: Result<Box<dyn OcrEngine>, EngineError>, config: &PoolConfig) -> Self {
        let (engine, init_error) = match engine {
            Ok(engine) => (Some(engine), None),
            Err(e) => {
                error!(error = %e, "worker engine init failed, entering degraded state");
                (None, Some(e.to_string()))
            }
        };
        Self {
            engine,
            init_error,
            cache: FifoCache::new(config.cache_capacity),
            default_limit_side_len: config.limit_side_len,
        }
    }

    /// One throwaway recognition pass so the first real request does not pay
    /// model warmup cost. A failing warmup degrades the worker, same as a
    /// failed load.
    pub fn warmup(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let started = Instant::now();
        let dummy = image::RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]));
        let opts = RecognizeOptions {
            use_angle_cls: false,
            limit_side_len: self.default_limit_side_len,
        };
        match engine.recognize(&dummy, &opts) {
            Ok(_) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "warmup done"),
            Err(e) => {
                error!(error = %e, "warmup failed, entering degraded state");
                self.init_error = Some(format!("warmup failed: {e}"));
                self.engine = None;
            }
        }
    }

    /// Handle one task, always producing exactly one result envelope. A panic
    /// while processing is caught and reported as an `Internal` failure so a
    /// bad input never terminates the loop.
    pub fn handle(&mut self, task: TaskEnvelope) -> ResultEnvelope {
        let id = task.id;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.process(&task.request))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                warn!(%id, message, "task handler panicked");
                TaskOutcome::Failure(TaskFailure::new(FailureKind::Internal, message))
            }
        };
        ResultEnvelope { id, outcome }
    }

    fn process(&mut self, request: &OcrRequest) -> TaskOutcome {
        if let Some(init_error) = &self.init_error {
            return TaskOutcome::Failure(TaskFailure::new(
                FailureKind::Init,
                format!("worker init error: {init_error}"),
            ));
        }

        let img = match preprocess::decode_payload(request)
            .and_then(|img| preprocess::crop_and_resize(img, request))
        {
            Ok(img) => img.to_rgb8(),
            Err(failure) => return TaskOutcome::Failure(failure),
        };

        let target = request.target_text.as_deref().filter(|t| !t.is_empty());
        let key = fingerprint(&img, target, request.use_angle_cls);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %hex::encode(&key[..8]), "response cache hit");
            return TaskOutcome::Success(hit.clone());
        }

        let opts = RecognizeOptions {
            use_angle_cls: request.use_angle_cls,
            limit_side_len: request.limit_side_len.unwrap_or(self.default_limit_side_len),
        };
        let engine = self
            .engine
            .as_mut()
            .expect("engine present when init_error is None");
        let lines = match engine.recognize(&img, &opts) {
            Ok(lines) => lines,
            Err(e) => {
                return TaskOutcome::Failure(TaskFailure::new(
                    FailureKind::Internal,
                    e.to_string(),
                ))
            }
        };

        let filtered = filter_lines(lines, target);
        self.cache.insert(key, filtered.clone());
        TaskOutcome::Success(filtered)
    }
}

/// Keep only lines containing the caller-supplied substring, if any.
fn filter_lines(lines: Vec<TextLine>, target: Option<&str>) -> Vec<TextLine> {
    match target {
        Some(target) => lines
            .into_iter()
            .filter(|line| line.text.contains(target))
            .collect(),
        None => lines,
    }
}

/// Subprocess entry point: framed requests on stdin, framed results on
/// stdout. All logging goes to stderr since stdout is the protocol channel.
pub fn worker_entry() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let pid = std::process::id();
    info!(pid, workers = config.pool.worker_count, "OCR worker starting");

    let mut state = WorkerState::new(build_engine(&config.pool), &config.pool);
    state.warmup();

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());

    loop {
        let message: WorkerRequest = match read_frame(&mut reader) {
            Ok(message) => message,
            // Pool side closed the pipe; treat like a stop sentinel.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                error!(error = %e, "failed to read task frame");
                return Err(e.into());
            }
        };
        match message {
            WorkerRequest::Stop => break,
            WorkerRequest::Task(task) => {
                let result = state.handle(task);
                write_frame(&mut writer, &result)?;
            }
        }
    }

    info!(pid, "OCR worker exiting");
    Ok(())
}

/// In-process worker: same loop state as a subprocess worker, minus the
/// process boundary. Used when isolation is not wanted (embedding, tests).
pub struct LocalRunner {
    state: WorkerState,
}

impl LocalRunner {
    pub fn new(engine: Result<Box<dyn OcrEngine>, EngineError>, config: &PoolConfig) -> Self {
        Self {
            state: WorkerState::new(engine, config),
        }
    }
}

impl WorkerRunner for LocalRunner {
    fn run_task(&mut self, task: TaskEnvelope) -> Result<ResultEnvelope> {
        Ok(self.state.handle(task))
    }

    fn shutdown(&mut self, _join_timeout: std::time::Duration) {}
}
