//! # Response Consumer
//!
//! Reads inbound messages for one session until the server ends the stream, merging each
//! into the session result and recording one latency sample per attributable response.
//!
//! ## Message Handling:
//! - **interim result**: replaces the partial segment, sampled as interim latency
//! - **final result / speech only**: appended, sampled as final latency
//! - **empty response**: a completed sentence marker, skipped without a sample
//! - **malformed frame**: logged and skipped; the stream stays open
//! - **transport error**: stops reading and becomes the session's failure
//!
//! There is no read timeout: a live stream may legitimately stay silent for a long time.
//! Cancellation interrupts a pending read immediately.

use crate::error::{AppError, AppResult};
use crate::session::Session;
use crate::state::{EngineState, LatencyKind};
use crate::transport::{Inbound, ResponseSource, StreamingResponse};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct ResponseConsumer {
    session: Arc<Session>,
    responses: Box<dyn ResponseSource>,
    state: EngineState,
    cancel: CancellationToken,
}

impl ResponseConsumer {
    pub fn new(
        session: Arc<Session>,
        responses: Box<dyn ResponseSource>,
        state: EngineState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            responses,
            state,
            cancel,
        }
    }

    /// `Ok` when the server ended the stream cleanly.
    pub async fn run(mut self) -> AppResult<()> {
        loop {
            let inbound = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(AppError::Cancelled("consumer stopped by cancellation".to_string()));
                }
                inbound = self.responses.next() => inbound,
            };

            match inbound {
                None => {
                    debug!("Server ended the stream");
                    return Ok(());
                }
                Some(Err(e)) => {
                    error!(error = %e, "Response stream failed");
                    return Err(e);
                }
                Some(Ok(Inbound::Malformed(reason))) => {
                    warn!(reason = %reason, "Skipping malformed inbound message");
                }
                Some(Ok(Inbound::Response(response))) => self.handle(response),
            }
        }
    }

    fn handle(&self, response: StreamingResponse) {
        if response.is_empty() {
            debug!("Sentence completed");
            return;
        }

        let kind = match &response.result {
            Some(result) if !result.is_final => LatencyKind::Interim,
            _ => LatencyKind::Final,
        };

        match self.session.record_receive(Instant::now()) {
            Some(latency) => {
                let latency_ms = latency.as_secs_f64() * 1000.0;
                self.state.record_latency(kind, latency_ms);
                debug!(?kind, latency_ms, "Response received");
            }
            None => warn!("Response arrived before any request was sent"),
        }

        self.session.merge(&response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CorrelationId;
    use crate::transport::{Alternative, TranslationResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedResponses {
        script: VecDeque<AppResult<Inbound>>,
    }

    #[async_trait]
    impl ResponseSource for ScriptedResponses {
        async fn next(&mut self) -> Option<AppResult<Inbound>> {
            self.script.pop_front()
        }
    }

    fn result(is_final: bool, transcript: &str) -> AppResult<Inbound> {
        Ok(Inbound::Response(StreamingResponse {
            result: Some(TranslationResult {
                is_final,
                alternatives: vec![Alternative {
                    transcript: transcript.to_string(),
                    confidence: 0.8,
                    words: Vec::new(),
                }],
            }),
            speech: Vec::new(),
        }))
    }

    fn consumer(
        session: &Arc<Session>,
        state: &EngineState,
        script: Vec<AppResult<Inbound>>,
    ) -> ResponseConsumer {
        ResponseConsumer::new(
            session.clone(),
            Box::new(ScriptedResponses {
                script: script.into(),
            }),
            state.clone(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_merges_and_samples_latency() {
        let session = Arc::new(Session::new(CorrelationId::new(1), "a.wav"));
        let state = EngineState::new();
        session.record_send(Instant::now());
        session.record_send(Instant::now());

        let script = vec![
            result(false, "hal"),
            Ok(Inbound::Response(StreamingResponse::default())),
            Ok(Inbound::Malformed("expected value".to_string())),
            result(true, "hallo"),
        ];
        assert!(consumer(&session, &state, script).run().await.is_ok());

        let samples = state.latency_snapshot();
        assert_eq!(samples.all.len(), 2);
        assert_eq!(samples.interim.len(), 1);
        assert_eq!(samples.finals.len(), 1);

        let merged = session.result();
        assert_eq!(merged.finals.len(), 1);
        assert!(merged.partial.is_none());
        // Empty and malformed messages leave no receive timestamp
        assert_eq!(session.timestamps().1.len(), 2);
    }

    #[tokio::test]
    async fn test_error_keeps_earlier_results() {
        let session = Arc::new(Session::new(CorrelationId::new(1), "a.wav"));
        let state = EngineState::new();
        session.record_send(Instant::now());

        let script = vec![
            result(true, "erster satz"),
            Err(AppError::Transport("connection reset".to_string())),
            result(true, "never read"),
        ];
        let outcome = consumer(&session, &state, script).run().await;

        assert!(matches!(outcome, Err(AppError::Transport(_))));
        assert_eq!(session.result().finals.len(), 1);
    }

    #[tokio::test]
    async fn test_response_before_send_is_not_sampled() {
        let session = Arc::new(Session::new(CorrelationId::new(1), "a.wav"));
        let state = EngineState::new();

        let outcome = consumer(&session, &state, vec![result(false, "früh")]).run().await;

        assert!(outcome.is_ok());
        assert!(state.latency_snapshot().all.is_empty());
        assert!(session.timestamps().1.is_empty());
    }
}
