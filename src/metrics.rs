use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Submission metrics
    pub static ref OCR_REQUESTS: IntCounter = IntCounter::new(
        "ocr_requests_total",
        "Total number of tasks submitted to the pool"
    ).unwrap();

    pub static ref OCR_TASK_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_task_failures_total", "Task-level failures by kind"),
        &["kind"]
    ).unwrap();

    pub static ref OCR_QUEUE_FULL: IntCounter = IntCounter::new(
        "ocr_queue_full_total",
        "Submissions rejected because the task queue stayed full"
    ).unwrap();

    pub static ref OCR_TIMEOUTS: IntCounter = IntCounter::new(
        "ocr_timeouts_total",
        "Submissions that gave up waiting for a result"
    ).unwrap();

    // Collector metrics
    pub static ref RESULTS_DROPPED: IntCounter = IntCounter::new(
        "ocr_results_dropped_total",
        "Results that arrived after their caller stopped waiting"
    ).unwrap();

    // Worker metrics
    pub static ref WORKERS_ALIVE: IntGauge = IntGauge::new(
        "ocr_workers_alive",
        "Worker processes currently serving tasks"
    ).unwrap();

    pub static ref SUBMIT_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ocr_submit_duration_seconds",
            "End-to-end submit latency in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(OCR_REQUESTS.clone())).unwrap();
    REGISTRY
        .register(Box::new(OCR_TASK_FAILURES.clone()))
        .unwrap();
    REGISTRY.register(Box::new(OCR_QUEUE_FULL.clone())).unwrap();
    REGISTRY.register(Box::new(OCR_TIMEOUTS.clone())).unwrap();
    REGISTRY
        .register(Box::new(RESULTS_DROPPED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(WORKERS_ALIVE.clone())).unwrap();
    REGISTRY
        .register(Box::new(SUBMIT_LATENCY.clone()))
        .unwrap();

    tracing::info!(
        "Metrics registry initialized with {} collectors",
        REGISTRY.gather().len()
    );
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
