//! # Session Runner
//!
//! Drives exactly one session to completion:
//!
//! ```text
//! Created ──open ok──▶ Streaming ──input exhausted──▶ Draining ──stream end──▶ Finished
//!    └──open failed──────────────────────────────────────────────────────────▶ Finished
//! ```
//!
//! ## Terminal Status:
//! - **OK**: both directions completed without error
//! - **CANCELLED**: pool-wide or per-session cancellation interrupted the stream
//! - **ABORTED**: the server ended the stream while audio was still being sent
//! - **UNAVAILABLE / INTERNAL**: the first real failure on either direction wins
//!
//! The status is recorded exactly once, together with the aggregate counters, before the
//! runner returns. Results merged before a failure are kept.

use crate::audio::AudioSource;
use crate::error::AppError;
use crate::session::consumer::ResponseConsumer;
use crate::session::producer::{ProducerOutcome, RequestProducer};
use crate::session::{FinalStatus, Session, SessionPhase, StatusCode, StreamSettings};
use crate::state::EngineState;
use crate::transport::SpeechTransport;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

pub struct SessionRunner {
    session: Arc<Session>,
    source: Box<dyn AudioSource>,
    transport: Arc<dyn SpeechTransport>,
    settings: Arc<StreamSettings>,
    state: EngineState,
    pool_cancel: CancellationToken,
    /// Child of `pool_cancel`; fires for this session only
    session_cancel: CancellationToken,
}

/// Failures observed while the session streams, in the order they happened.
#[derive(Default)]
struct Outcome {
    first_failure: Option<AppError>,
    saw_cancel: bool,
    aborted: bool,
}

impl Outcome {
    fn observe(&mut self, error: AppError) {
        if error.is_cancelled() {
            self.saw_cancel = true;
        } else if self.first_failure.is_none() {
            self.first_failure = Some(error);
        }
    }

    fn into_status(self, pool_cancelled: bool) -> FinalStatus {
        let interrupted = self.saw_cancel || self.first_failure.is_some() || self.aborted;
        if pool_cancelled && interrupted {
            return FinalStatus::cancelled("session pool is shutting down");
        }

        if let Some(error) = self.first_failure {
            FinalStatus::from_error(&error)
        } else if self.aborted {
            FinalStatus::new(
                StatusCode::Aborted,
                "server ended the stream before all audio was sent",
            )
        } else if self.saw_cancel {
            FinalStatus::cancelled("session cancelled")
        } else {
            FinalStatus::ok()
        }
    }
}

impl SessionRunner {
    pub fn new(
        session: Arc<Session>,
        source: Box<dyn AudioSource>,
        transport: Arc<dyn SpeechTransport>,
        settings: Arc<StreamSettings>,
        state: EngineState,
        pool_cancel: CancellationToken,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            source,
            transport,
            settings,
            state,
            pool_cancel,
            session_cancel,
        }
    }

    /// Run the session and hand it back once its terminal status is recorded.
    pub async fn run(self) -> Arc<Session> {
        let SessionRunner {
            session,
            source,
            transport,
            settings,
            state,
            pool_cancel,
            session_cancel,
        } = self;

        let correlation_id = session.correlation_id();
        let connect_timeout = settings.connect_timeout;

        let opened = tokio::select! {
            biased;
            _ = session_cancel.cancelled() => {
                Err(AppError::Cancelled("cancelled before the stream opened".to_string()))
            }
            opened = tokio::time::timeout(connect_timeout, transport.open_stream(correlation_id)) => {
                opened.unwrap_or_else(|_| {
                    Err(AppError::StreamEstablishment(format!(
                        "no stream within {}ms",
                        connect_timeout.as_millis()
                    )))
                })
            }
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Could not open stream");
                state.finish(&session, FinalStatus::from_error(&e), 0.0);
                return session;
            }
        };

        session.advance(SessionPhase::Streaming);
        info!(source = %session.label(), "Session streaming");

        let producer = RequestProducer::new(
            session.clone(),
            source,
            stream.sink,
            settings.clone(),
            session_cancel.clone(),
        );
        let mut producer_task = tokio::spawn(producer.run().instrument(Span::current()));

        let consumer = ResponseConsumer::new(
            session.clone(),
            stream.responses,
            state.clone(),
            session_cancel.clone(),
        );
        let consumer_run = consumer.run();
        tokio::pin!(consumer_run);

        let mut outcome = Outcome::default();
        let mut produced: Option<ProducerOutcome> = None;

        let consumed = loop {
            tokio::select! {
                consumed = &mut consumer_run => break consumed,
                joined = &mut producer_task, if produced.is_none() => {
                    let finished = joined_outcome(joined);
                    if let Err(e) = &finished.result {
                        // Either side failing ends the whole session
                        session.advance(SessionPhase::Draining);
                        session_cancel.cancel();
                        outcome.observe(e.clone());
                    }
                    produced = Some(finished);
                }
            }
        };

        let stream_ended_cleanly = consumed.is_ok();
        if let Err(e) = consumed {
            if !e.is_cancelled() {
                session.advance(SessionPhase::Draining);
            }
            outcome.observe(e);
        }

        let produced = match produced {
            Some(produced) => produced,
            None => {
                // A producer that already reached Draining only has its half-close left
                let still_sending = session.phase() < SessionPhase::Draining;
                if !stream_ended_cleanly || still_sending {
                    session_cancel.cancel();
                }
                if stream_ended_cleanly && still_sending {
                    warn!("Server ended the stream while audio was still being sent");
                    outcome.aborted = true;
                }

                let finished = joined_outcome(producer_task.await);
                if let Err(e) = &finished.result {
                    if !outcome.aborted {
                        outcome.observe(e.clone());
                    }
                }
                finished
            }
        };

        let status = outcome.into_status(pool_cancel.is_cancelled());
        let audio_secs = produced.audio_sent_secs;
        if status.is_ok() {
            info!(audio_secs, "Session finished");
        } else {
            warn!(code = status.code.as_str(), message = %status.message, "Session finished with failure");
        }

        state.finish(&session, status, audio_secs);
        session
    }
}

fn joined_outcome(
    joined: Result<ProducerOutcome, tokio::task::JoinError>,
) -> ProducerOutcome {
    joined.unwrap_or_else(|e| ProducerOutcome {
        audio_sent_secs: 0.0,
        result: Err(AppError::Internal(format!("producer task failed: {}", e))),
    })
}
