use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use ocr_server::config::Config;
use ocr_server::pool::OcrPool;
use ocr_server::server::{self, AppContext};
use ocr_server::worker::{worker_entry, WORKER_SUBCOMMAND};
use ocr_server::metrics;

fn main() -> Result<()> {
    // The pool re-executes this binary with the worker subcommand; worker
    // processes speak the framed protocol on stdin/stdout and never touch
    // the HTTP stack.
    if std::env::args().nth(1).as_deref() == Some(WORKER_SUBCOMMAND) {
        return worker_entry();
    }
    run_server()
}

#[tokio::main]
async fn run_server() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting OCR server...");
    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!(
        host = %config.api_host,
        port = config.api_port,
        workers = config.pool.worker_count,
        "configuration loaded"
    );

    let pool = Arc::new(OcrPool::spawn(&config.pool)?);
    tracing::info!(workers = pool.worker_count(), "worker pool ready");

    let ctx = Arc::new(AppContext {
        pool: pool.clone(),
        task_timeout: config.pool.task_timeout,
    });
    let app = server::router(ctx);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, closing worker pool");
    let pool_for_close = pool.clone();
    tokio::task::spawn_blocking(move || pool_for_close.close(Duration::from_secs(5))).await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
