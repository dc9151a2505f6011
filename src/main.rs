//! # S2S Stream Client - Main Application Entry Point
//!
//! Streams audio to a speech-to-speech translation service over many concurrent
//! bidirectional streams and reports transcripts, synthesized speech and latency statistics.
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **error**: Custom error types shared by every layer
//! - **audio**: Audio sources (WAV files, raw PCM on stdin) and WAV writing
//! - **transport**: The duplex streaming RPC layer (WebSocket)
//! - **session**: The session engine (pool, runner, producer, consumer)
//! - **state**: Process-wide aggregates behind a single lock
//! - **stats**: Latency percentiles computed from aggregate snapshots
//! - **results**: Printing and persisting finished sessions
//! - **monitor**: Optional HTTP endpoint with live statistics
//! - **driver**: File and stdin run modes
//!
//! ## Worker Pool:
//! The tokio multi-thread runtime is built here with `engine.worker_threads` threads
//! (default 4 × `max_concurrent_sessions`) and hosts every session task. Failing to build it
//! is the only fatal pool-level error.

// Module declarations
mod audio;      // Audio input sources and WAV I/O (audio/ directory)
mod config;     // Configuration management (config.rs)
mod driver;     // Run modes (driver.rs)
mod error;      // Error handling types (error.rs)
mod monitor;    // Statistics HTTP endpoint (monitor.rs)
mod results;    // Results consumer (results.rs)
mod session;    // Session engine (session/ directory)
mod state;      // Shared aggregates (state.rs)
mod stats;      // Latency statistics (stats.rs)
mod transport;  // Streaming transport (transport/ directory)

use anyhow::{Context, Result};
use config::AppConfig;
use monitor::MonitorState;
use session::{SessionPool, StreamSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{SpeechTransport, WebSocketTransport};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the worker runtime** sized from the configuration
/// 4. **Runs the selected mode** until all streams finish or a signal cancels them
fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let worker_threads = config.engine.effective_worker_threads();
    info!("Starting s2s-stream-client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        uri = %config.transport.uri,
        max_concurrent_sessions = config.engine.max_concurrent_sessions,
        worker_threads,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("s2s-worker")
        .enable_all()
        .build()
        .context("Unable to start the session worker pool")?;

    runtime.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    let settings = StreamSettings::from_config(&config)?;
    let transport: Arc<dyn SpeechTransport> = Arc::new(WebSocketTransport::new(
        config.transport.uri.clone(),
        Duration::from_millis(config.transport.connect_timeout_ms),
    ));

    let pool = Arc::new(SessionPool::new(
        transport,
        settings,
        config.engine.max_concurrent_sessions,
    )?);

    setup_signal_handlers(pool.cancellation_token());

    let monitor = if config.monitor.enabled {
        let state = MonitorState {
            engine: pool.state().clone(),
            max_concurrent_sessions: config.engine.max_concurrent_sessions,
            server_uri: config.transport.uri.clone(),
            shutdown: pool.cancellation_token(),
        };
        Some(monitor::spawn_monitor(&config.monitor, state, pool.cancellation_token())?)
    } else {
        None
    };

    let outcome = if driver::reads_stdin(&config) {
        driver::run_stdin_streaming(&config, pool.clone()).await
    } else {
        driver::run_file_streaming(&config, pool.clone()).await
    };

    // Also stops the monitor, which follows the pool's cancellation token
    pool.shutdown().await;

    if let Some(monitor) = monitor {
        if let Err(e) = monitor.await {
            error!("Monitor task error: {}", e);
        }
    }

    info!("Client stopped");
    outcome
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "s2s_stream_client=debug")
/// - If not set, defaults to "s2s_stream_client=info,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s2s_stream_client=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancel every session when SIGTERM or SIGINT (Ctrl+C) arrives.
///
/// Cancellation reaches each running session within one pending I/O operation; sessions
/// finish with a CANCELLED status and their partial results are still reported.
fn setup_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            // The run finished on its own
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}
