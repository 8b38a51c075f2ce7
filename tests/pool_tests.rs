//! End-to-end pool tests using in-process workers: channel plumbing,
//! correlation-id routing, backpressure, timeouts, crash isolation and
//! shutdown, without subprocess overhead.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, Rgb, RgbImage};

use ocr_server::pool::{OcrPool, SubmitError, WorkerRunner};
use ocr_server::worker::LocalRunner;
use ocr_server::{
    EngineError, OcrEngine, OcrRequest, PoolConfig, RecognizeOptions, ResultEnvelope,
    TaskEnvelope, TaskOutcome, TextLine,
};

fn test_config(workers: usize) -> PoolConfig {
    PoolConfig {
        worker_count: workers,
        task_timeout: Duration::from_secs(5),
        cpu_threads: 1,
        model_dir: "models".to_string(),
        limit_side_len: 960,
        cache_capacity: 32,
    }
}

/// Tiny solid-color PNG request. Different colors or sizes hash to
/// different cache fingerprints.
fn png_request(color: [u8; 3], width: u32, height: u32) -> OcrRequest {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    OcrRequest {
        image_base64: Some(BASE64.encode(&bytes)),
        ..Default::default()
    }
}

fn line(text: &str) -> TextLine {
    TextLine {
        text: text.to_string(),
        confidence: 0.97,
        points: [[0.0, 0.0], [10.0, 0.0], [10.0, 5.0], [0.0, 5.0]],
    }
}

/// Reports the top-left pixel of whatever it is given, so each caller can
/// verify it got the answer to its own image.
struct EchoEngine;

impl OcrEngine for EchoEngine {
    fn recognize(
        &mut self,
        image: &RgbImage,
        _opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError> {
        let p = image.get_pixel(0, 0);
        Ok(vec![line(&format!("{},{},{}", p[0], p[1], p[2]))])
    }
}

struct FixedEngine(Vec<TextLine>);

impl OcrEngine for FixedEngine {
    fn recognize(
        &mut self,
        _image: &RgbImage,
        _opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError> {
        Ok(self.0.clone())
    }
}

/// Sleeps only for wide images, so slow and fast requests can share a pool.
struct SleepyEngine {
    wide_delay: Duration,
}

impl OcrEngine for SleepyEngine {
    fn recognize(
        &mut self,
        image: &RgbImage,
        _opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError> {
        if image.width() >= 50 {
            thread::sleep(self.wide_delay);
        }
        Ok(vec![line("done")])
    }
}

struct CountingEngine {
    calls: Arc<AtomicUsize>,
}

impl OcrEngine for CountingEngine {
    fn recognize(
        &mut self,
        _image: &RgbImage,
        _opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![line("counted")])
    }
}

fn local_pool(config: &PoolConfig, make_engine: impl Fn() -> Box<dyn OcrEngine>) -> OcrPool {
    OcrPool::spawn_with(config, |_index| {
        Ok(Box::new(LocalRunner::new(Ok(make_engine()), config)) as Box<dyn WorkerRunner>)
    })
    .unwrap()
}

#[test]
fn concurrent_callers_each_get_their_own_result() {
    let config = test_config(3);
    let pool = Arc::new(local_pool(&config, || Box::new(EchoEngine)));

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            let color = [i, i.wrapping_add(40), i.wrapping_add(80)];
            let outcome = pool
                .submit(png_request(color, 4, 4), Duration::from_secs(5))
                .unwrap();
            match outcome {
                TaskOutcome::Success(lines) => {
                    assert_eq!(lines.len(), 1);
                    assert_eq!(lines[0].text, format!("{},{},{}", color[0], color[1], color[2]));
                }
                other => panic!("expected success, got {other:?}"),
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.pending_requests(), 0);
    pool.close(Duration::from_secs(2));
}

#[test]
fn recognized_lines_survive_the_round_trip_unchanged() {
    let expected = vec![
        TextLine {
            text: "gold: 钱 1234".to_string(),
            confidence: 0.875,
            points: [[1.5, 2.0], [90.0, 2.0], [90.0, 20.5], [1.5, 20.5]],
        },
        line("second line"),
    ];
    let config = test_config(1);
    let lines = expected.clone();
    let pool = local_pool(&config, move || Box::new(FixedEngine(lines.clone())));

    match pool
        .submit(png_request([1, 2, 3], 4, 4), Duration::from_secs(5))
        .unwrap()
    {
        TaskOutcome::Success(lines) => assert_eq!(lines, expected),
        other => panic!("expected success, got {other:?}"),
    }
    pool.close(Duration::from_secs(2));
}

#[test]
fn full_queue_rejects_quickly_and_leaves_no_registry_entries() {
    // One worker, so queue capacity is the floor of 4. The engine holds
    // every task long enough that the queue fills.
    let config = test_config(1);
    let pool = Arc::new(local_pool(&config, || {
        Box::new(SleepyEngine {
            wide_delay: Duration::from_millis(400),
        })
    }));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || {
            pool.submit(png_request([200, 0, 0], 64, 8), Duration::from_millis(80))
        }));
    }

    let mut queue_full = 0;
    let mut timeouts = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Err(SubmitError::QueueFull) => queue_full += 1,
            Err(SubmitError::Timeout) => timeouts += 1,
            Ok(outcome) => panic!("80ms budget should never finish a 400ms task: {outcome:?}"),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    // At most 1 in flight + 4 queued fit inside the budget; the rest bounce.
    assert!(queue_full >= 4, "expected >=4 QueueFull, got {queue_full}");
    assert!(timeouts >= 1, "expected >=1 Timeout, got {timeouts}");
    assert_eq!(pool.pending_requests(), 0);

    pool.close(Duration::from_secs(5));
}

#[test]
fn one_slow_task_does_not_delay_fast_ones() {
    let config = test_config(2);
    let pool = Arc::new(local_pool(&config, || {
        Box::new(SleepyEngine {
            wide_delay: Duration::from_millis(600),
        })
    }));

    let slow_pool = pool.clone();
    let slow = thread::spawn(move || {
        slow_pool.submit(png_request([0, 0, 200], 64, 8), Duration::from_millis(150))
    });
    // Let the slow task reach a worker before the fast one arrives.
    thread::sleep(Duration::from_millis(50));

    let fast = pool
        .submit(png_request([0, 200, 0], 8, 8), Duration::from_secs(3))
        .unwrap();
    assert!(matches!(fast, TaskOutcome::Success(_)));

    assert_eq!(slow.join().unwrap(), Err(SubmitError::Timeout));

    // The abandoned slow result is dropped by the collector; the pool stays
    // usable and the registry stays clean.
    thread::sleep(Duration::from_millis(700));
    assert_eq!(pool.pending_requests(), 0);
    let again = pool
        .submit(png_request([10, 200, 10], 8, 8), Duration::from_secs(3))
        .unwrap();
    assert!(matches!(again, TaskOutcome::Success(_)));

    pool.close(Duration::from_secs(2));
}

/// Runner that dies (like a crashed subprocess) when asked for "crash".
struct FaultyRunner {
    inner: LocalRunner,
}

impl WorkerRunner for FaultyRunner {
    fn run_task(&mut self, task: TaskEnvelope) -> anyhow::Result<ResultEnvelope> {
        if task.request.target_text.as_deref() == Some("crash") {
            bail!("worker process exited unexpectedly");
        }
        self.inner.run_task(task)
    }

    fn shutdown(&mut self, join_timeout: Duration) {
        self.inner.shutdown(join_timeout);
    }
}

#[test]
fn a_crashed_worker_takes_down_only_its_own_slot() {
    let config = test_config(2);
    let pool = OcrPool::spawn_with(&config, |_index| {
        let inner = LocalRunner::new(
            Ok(Box::new(FixedEngine(vec![line("crash survivor")])) as Box<dyn OcrEngine>),
            &config,
        );
        Ok(Box::new(FaultyRunner { inner }) as Box<dyn WorkerRunner>)
    })
    .unwrap();

    // The crashing task produces no result, so the caller times out.
    let mut crash = png_request([99, 0, 0], 4, 4);
    crash.target_text = Some("crash".to_string());
    assert_eq!(
        pool.submit(crash, Duration::from_millis(300)),
        Err(SubmitError::Timeout)
    );

    // The surviving slot keeps serving.
    for i in 0..4u8 {
        let outcome = pool
            .submit(png_request([i, 50, 50], 4, 4), Duration::from_secs(3))
            .unwrap();
        match outcome {
            TaskOutcome::Success(lines) => assert_eq!(lines[0].text, "crash survivor"),
            other => panic!("expected success, got {other:?}"),
        }
    }
    assert_eq!(pool.pending_requests(), 0);

    pool.close(Duration::from_secs(2));
}

#[test]
fn worker_cache_serves_repeats_and_evicts_fifo() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = test_config(1);
    config.cache_capacity = 4;
    let calls_for_pool = calls.clone();
    let pool = local_pool(&config, move || {
        Box::new(CountingEngine {
            calls: calls_for_pool.clone(),
        })
    });

    let timeout = Duration::from_secs(3);
    // First submission runs the engine, the repeat is served from cache.
    pool.submit(png_request([0, 0, 0], 4, 4), timeout).unwrap();
    pool.submit(png_request([0, 0, 0], 4, 4), timeout).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Four more distinct images push the oldest entry out.
    for i in 1..=4u8 {
        pool.submit(png_request([i, 0, 0], 4, 4), timeout).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // The first image was evicted, so it runs the engine again; the newest
    // entries are still cached.
    pool.submit(png_request([0, 0, 0], 4, 4), timeout).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    pool.submit(png_request([4, 0, 0], 4, 4), timeout).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    pool.close(Duration::from_secs(2));
}

#[test]
fn close_is_idempotent_and_rejects_later_submissions() {
    let config = test_config(2);
    let pool = local_pool(&config, || Box::new(EchoEngine));

    let outcome = pool
        .submit(png_request([7, 7, 7], 4, 4), Duration::from_secs(3))
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Success(_)));

    pool.close(Duration::from_secs(2));
    pool.close(Duration::from_secs(2));

    assert_eq!(
        pool.submit(png_request([8, 8, 8], 4, 4), Duration::from_secs(1)),
        Err(SubmitError::Closed)
    );
    assert_eq!(pool.pending_requests(), 0);
}
