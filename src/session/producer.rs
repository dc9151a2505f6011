//! # Request Producer
//!
//! Drains an `AudioSource` into outbound requests for one session.
//!
//! ## Message Construction:
//! - one chunk becomes one request; the first request also carries the `StreamingConfig`
//! - an empty final chunk is not sent (unless it is the only one, so the server still gets
//!   the config); the stream is simply half-closed
//!
//! ## Pacing:
//! With real-time simulation, chunk `k` is released at `start + audio sent before k`. The
//! deadline is absolute, so time lost to transport backpressure is recovered by sending the
//! following chunks without sleeping: pacing sets the earliest send time, backpressure may
//! only delay it. Without simulation, chunks go out as fast as the transport accepts them.
//!
//! ## Cancellation:
//! Observed while waiting for audio, while pacing and while a send is pending. A send that
//! makes no progress within `io_timeout` fails the session.

use crate::audio::{AudioFormat, AudioSource};
use crate::error::{AppError, AppResult};
use crate::session::{Session, SessionPhase, StreamSettings};
use crate::transport::{RequestSink, StreamingRequest};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the producer hands back to its runner.
#[derive(Debug)]
pub struct ProducerOutcome {
    /// Playback duration of every chunk actually transmitted
    pub audio_sent_secs: f64,
    pub result: AppResult<()>,
}

pub struct RequestProducer {
    session: Arc<Session>,
    source: Box<dyn AudioSource>,
    sink: Box<dyn RequestSink>,
    settings: Arc<StreamSettings>,
    cancel: CancellationToken,

    /// Requests built but not yet transmitted, oldest first
    pending: VecDeque<StreamingRequest>,
    audio_sent_secs: f64,
}

impl RequestProducer {
    pub fn new(
        session: Arc<Session>,
        source: Box<dyn AudioSource>,
        sink: Box<dyn RequestSink>,
        settings: Arc<StreamSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            source,
            sink,
            settings,
            cancel,
            pending: VecDeque::new(),
            audio_sent_secs: 0.0,
        }
    }

    pub async fn run(mut self) -> ProducerOutcome {
        let result = self.stream_audio().await;
        self.session.set_audio_sent(self.audio_sent_secs);
        ProducerOutcome {
            audio_sent_secs: self.audio_sent_secs,
            result,
        }
    }

    async fn stream_audio(&mut self) -> AppResult<()> {
        let format = self.source.format();
        let start = Instant::now();
        let mut first = true;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(cancelled()),
                chunk = self.source.next_chunk() => chunk?,
            };

            if first || !chunk.data.is_empty() {
                let config = first.then(|| self.settings.streaming_config(format));
                self.pending.push_back(StreamingRequest {
                    config,
                    audio: chunk.data,
                });
                first = false;
            }

            self.flush(format, start).await?;

            if chunk.is_last {
                break;
            }
        }

        // End of input: everything is sent, only the half-close remains
        self.session.advance(SessionPhase::Draining);
        bounded(&self.cancel, self.settings.io_timeout, "half-close", self.sink.close()).await?;
        info!(
            audio_sent_secs = self.audio_sent_secs,
            "Audio input exhausted, stream half-closed"
        );
        Ok(())
    }

    async fn flush(&mut self, format: AudioFormat, start: Instant) -> AppResult<()> {
        while let Some(request) = self.pending.pop_front() {
            if self.settings.simulate_realtime {
                let deadline = start + Duration::from_secs_f64(self.audio_sent_secs);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let audio_secs = format.duration_secs(request.audio.len());
            self.session.record_send(std::time::Instant::now());
            bounded(&self.cancel, self.settings.io_timeout, "send", self.sink.send(request)).await?;
            self.audio_sent_secs += audio_secs;
            debug!(audio_secs, total_secs = self.audio_sent_secs, "Request sent");
        }
        Ok(())
    }
}

/// Run one sink operation, bounded by the I/O timeout and the cancellation token.
async fn bounded<F>(
    cancel: &CancellationToken,
    io_timeout: Duration,
    operation: &str,
    pending: F,
) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled()),
        outcome = tokio::time::timeout(io_timeout, pending) => outcome.unwrap_or_else(|_| {
            Err(AppError::Transport(format!(
                "{} made no progress within {}ms",
                operation,
                io_timeout.as_millis()
            )))
        }),
    }
}

fn cancelled() -> AppError {
    AppError::Cancelled("producer stopped by cancellation".to_string())
}
