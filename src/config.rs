use std::env;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub pool: PoolConfig,
}

/// Knobs consumed by the pool manager and by worker subprocesses (workers
/// re-read these from the environment they inherit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of isolated worker processes.
    pub worker_count: usize,
    /// Per-call submit budget (covers both enqueue and wait-for-result).
    pub task_timeout: Duration,
    /// Intra-engine CPU thread budget per worker.
    pub cpu_threads: usize,
    /// Directory holding the ONNX models and dictionary.
    pub model_dir: String,
    /// Default detection-side resize limit when a request does not set one.
    pub limit_side_len: u32,
    /// Per-worker response cache entries (FIFO eviction).
    pub cache_capacity: usize,
}

impl PoolConfig {
    /// Bounded task channel capacity. Small multiple of the worker count so
    /// backpressure kicks in before the queue hides real latency.
    pub fn queue_capacity(&self) -> usize {
        (self.worker_count * 4).max(4)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            task_timeout: Duration::from_secs(120),
            cpu_threads: 10,
            model_dir: "models".to_string(),
            limit_side_len: 960,
            cache_capacity: 32,
        }
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2);
    (cpus / 2).max(1)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("OCR_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = env_parse("OCR_SERVER_PORT", 8000u16);

        let defaults = PoolConfig::default();
        let timeout_secs = env_parse("OCR_SERVER_TASK_TIMEOUT", 120.0f64);

        let pool = PoolConfig {
            worker_count: env_parse("OCR_WORKERS", defaults.worker_count).max(1),
            task_timeout: Duration::from_secs_f64(timeout_secs.max(0.0)),
            cpu_threads: env_parse("OCR_CPU_THREADS", defaults.cpu_threads).max(1),
            model_dir: env::var("OCR_MODEL_DIR").unwrap_or(defaults.model_dir),
            limit_side_len: env_parse("OCR_LIMIT_SIDE_LEN", defaults.limit_side_len),
            cache_capacity: env_parse("OCR_CACHE_CAPACITY", defaults.cache_capacity).max(1),
        };

        Ok(Self {
            api_host,
            api_port,
            pool,
        })
    }
}
