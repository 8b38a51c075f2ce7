pub mod cache;
pub mod config;
pub mod engine;
pub mod metrics;
#[cfg(feature = "onnx")]
pub mod onnx_engine;
pub mod pool;
pub mod preprocess;
pub mod protocol;
pub mod server;
pub mod worker;

// Re-export commonly used types for easier testing
pub use crate::config::{Config, PoolConfig};
pub use crate::engine::{EngineError, OcrEngine, RecognizeOptions};
pub use crate::pool::{OcrPool, ProcessRunner, SubmitError, WorkerRunner};
pub use crate::protocol::{
    FailureKind, OcrRequest, ResultEnvelope, TaskEnvelope, TaskFailure, TaskOutcome, TextLine,
};
pub use crate::worker::{worker_entry, LocalRunner, WorkerState, WORKER_SUBCOMMAND};
