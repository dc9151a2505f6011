//! # Run Driver
//!
//! Feeds audio into the session pool and reports the outcome of a whole run.
//!
//! ## Modes:
//! - **Files**: every input file is streamed `num_iterations` times; admission keeps at most
//!   N sessions running and results are reported in submission order
//! - **Stdin**: a single unbounded session over raw PCM piped into the process, stopped by
//!   EOF or Ctrl-C

use crate::audio::{load_wav_files, AudioEncoding, AudioFormat, AudioSource, PcmReaderSource, WavSource};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::results::ResultWriter;
use crate::session::{SessionHandle, SessionPool};
use crate::stats::StatsReporter;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Pause between non-blocking admission attempts while the pool is full.
const ADMISSION_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Whether the input setting selects stdin instead of files.
pub fn reads_stdin(config: &AppConfig) -> bool {
    let input = config.input.audio_file.trim();
    input.is_empty() || input == "-"
}

pub async fn run_file_streaming(config: &AppConfig, pool: Arc<SessionPool>) -> Result<()> {
    let all_wav = load_wav_files(Path::new(&config.input.audio_file))
        .context("Unable to load audio file(s)")?;

    let iterations = config.engine.num_iterations as usize;
    let all_wav: Vec<_> = all_wav.into_iter().map(Arc::new).collect();
    let total_streams = all_wav.len() * iterations;
    info!(files = all_wav.len(), iterations, total_streams, "Starting file streaming");

    let mut writer = ResultWriter::new(config, total_streams)?;
    let (handles_tx, mut handles_rx) = mpsc::unbounded_channel::<SessionHandle>();

    // Reports each session as soon as it and every earlier one have finished
    let reporter = tokio::spawn(async move {
        while let Some(handle) = handles_rx.recv().await {
            match handle.wait().await {
                Ok(session) => {
                    if let Err(e) = writer.write(&session) {
                        error!(correlation_id = %session.correlation_id(), "Failed to write results: {}", e);
                    }
                }
                Err(e) => error!("{}", e),
            }
        }
    });

    let start_time = Instant::now();
    'submit: for wav in &all_wav {
        for _ in 0..iterations {
            let make_source = || -> Box<dyn AudioSource> {
                Box::new(WavSource::new(wav.clone(), config.engine.chunk_duration_ms))
            };
            match admit(&pool, make_source, config.engine.blocking_admission).await {
                Ok(handle) => {
                    let _ = handles_tx.send(handle);
                }
                Err(AppError::Cancelled(_)) => {
                    warn!("Run interrupted, no further streams are started");
                    break 'submit;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    drop(handles_tx);

    reporter.await.context("Result reporter task failed")?;
    pool.shutdown().await;
    let run_time = start_time.elapsed().as_secs_f64();

    StatsReporter::new(pool.state().clone()).print(config.engine.simulate_realtime);
    let total_audio = pool.total_audio_processed();
    println!("Run time: {} sec.", run_time);
    println!("Total audio processed: {} sec.", total_audio);
    println!(
        "Throughput: {} RTFX",
        if run_time > 0.0 { total_audio / run_time } else { 0.0 }
    );

    let counters = pool.state().counters();
    if counters.failed_requests > 0 {
        warn!(failed = counters.failed_requests, "Some streams failed");
    }
    Ok(())
}

/// Submit one stream, waiting for a slot (blocking admission) or retrying on `AtCapacity`.
///
/// `make_source` is called once per attempt, since a refused attempt consumes its source.
async fn admit<F>(pool: &SessionPool, make_source: F, blocking: bool) -> Result<SessionHandle, AppError>
where
    F: Fn() -> Box<dyn AudioSource>,
{
    if blocking {
        return pool.start_new_stream(make_source()).await;
    }

    let cancel = pool.cancellation_token();
    loop {
        match pool.try_start_new_stream(make_source()) {
            Err(AppError::AtCapacity(reason)) => debug!("{}, retrying", reason),
            other => return other,
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled("run interrupted".to_string()));
            }
            _ = tokio::time::sleep(ADMISSION_RETRY_DELAY) => {}
        }
    }
}

pub async fn run_stdin_streaming(config: &AppConfig, pool: Arc<SessionPool>) -> Result<()> {
    let format = AudioFormat {
        sample_rate: config.input.stdin_sample_rate,
        channels: config.input.stdin_channels,
        encoding: AudioEncoding::LinearPcm,
    };
    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        "Streaming raw PCM from stdin... press Ctrl-C to stop"
    );

    let source = PcmReaderSource::new(
        tokio::io::stdin(),
        format,
        config.engine.chunk_duration_ms,
        "stdin",
    );
    let mut writer = ResultWriter::new(config, 1)?;
    let handle = pool.start_new_stream(Box::new(source)).await?;
    let session = handle.wait().await?;
    writer.write(&session)?;

    pool.shutdown().await;
    Ok(())
}
