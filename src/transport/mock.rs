//! In-memory scripted transport for engine tests.
//!
//! Every opened stream gets its own server task connected through unbounded channels. The
//! server answers each request with one result (interim and final alternate, starting with
//! interim) and answers the half-close with a closing final result before ending the stream.

use crate::error::{AppError, AppResult};
use crate::session::CorrelationId;
use crate::transport::{
    Alternative, DuplexStream, Inbound, RequestSink, ResponseSource, SpeechTransport,
    StreamingRequest, StreamingResponse, TranslationResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the scripted server behaves for a stream.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Refuse to open the stream
    pub fail_open: bool,
    pub open_delay: Duration,
    /// Delay before answering each request
    pub response_delay: Duration,
    /// Emit a transport error right after answering this many requests
    pub fail_after_requests: Option<usize>,
    /// End the stream cleanly right after answering this many requests
    pub end_after_requests: Option<usize>,
    /// Synthesized speech bytes attached to every result
    pub speech_bytes: usize,
    /// Panic inside the client's response source on the first read
    pub panic_on_read: bool,
}

#[derive(Debug, Default)]
pub struct MockStats {
    opened: AtomicUsize,
    current_open: AtomicUsize,
    max_open: AtomicUsize,
    requests: AtomicUsize,
    requests_with_config: AtomicUsize,
    half_closes: AtomicUsize,
}

impl MockStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requests_with_config(&self) -> usize {
        self.requests_with_config.load(Ordering::SeqCst)
    }

    pub fn half_closes(&self) -> usize {
        self.half_closes.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    default: MockBehavior,
    overrides: Mutex<HashMap<CorrelationId, MockBehavior>>,
    stats: Arc<MockStats>,
}

impl MockTransport {
    pub fn new(default: MockBehavior) -> Self {
        Self {
            default,
            overrides: Mutex::new(HashMap::new()),
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Use a different behavior for one correlation id.
    pub fn with_override(self, correlation_id: CorrelationId, behavior: MockBehavior) -> Self {
        self.overrides.lock().unwrap().insert(correlation_id, behavior);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl SpeechTransport for MockTransport {
    async fn open_stream(&self, correlation_id: CorrelationId) -> AppResult<DuplexStream> {
        let behavior = self
            .overrides
            .lock()
            .unwrap()
            .get(&correlation_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        if !behavior.open_delay.is_zero() {
            tokio::time::sleep(behavior.open_delay).await;
        }
        if behavior.fail_open {
            return Err(AppError::StreamEstablishment("mock server refused".to_string()));
        }

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let open = self.stats.current_open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_open.fetch_max(open, Ordering::SeqCst);

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(behavior.clone(), self.stats.clone(), request_rx, response_tx));

        Ok(DuplexStream {
            sink: Box::new(MockSink {
                requests: request_tx,
                closed: false,
            }),
            responses: Box::new(MockResponses {
                responses: response_rx,
                panic_on_read: behavior.panic_on_read,
            }),
        })
    }
}

enum ClientEvent {
    Request(StreamingRequest),
    HalfClose,
}

struct MockSink {
    requests: mpsc::UnboundedSender<ClientEvent>,
    closed: bool,
}

#[async_trait]
impl RequestSink for MockSink {
    async fn send(&mut self, request: StreamingRequest) -> AppResult<()> {
        if self.closed {
            return Err(AppError::Transport("send after half-close".to_string()));
        }
        self.requests
            .send(ClientEvent::Request(request))
            .map_err(|_| AppError::Transport("mock server gone".to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        self.requests
            .send(ClientEvent::HalfClose)
            .map_err(|_| AppError::Transport("mock server gone".to_string()))
    }
}

struct MockResponses {
    responses: mpsc::UnboundedReceiver<AppResult<Inbound>>,
    panic_on_read: bool,
}

#[async_trait]
impl ResponseSource for MockResponses {
    async fn next(&mut self) -> Option<AppResult<Inbound>> {
        if self.panic_on_read {
            panic!("response source failed");
        }
        self.responses.recv().await
    }
}

async fn serve(
    behavior: MockBehavior,
    stats: Arc<MockStats>,
    mut requests: mpsc::UnboundedReceiver<ClientEvent>,
    responses: mpsc::UnboundedSender<AppResult<Inbound>>,
) {
    let mut responses = Some(responses);
    let mut answered = 0;

    // Keeps draining requests after the response side ends, like a server that has already
    // sent its status while the client is still writing
    while let Some(event) = requests.recv().await {
        match event {
            ClientEvent::Request(request) => {
                stats.requests.fetch_add(1, Ordering::SeqCst);
                if request.config.is_some() {
                    stats.requests_with_config.fetch_add(1, Ordering::SeqCst);
                }

                let Some(tx) = responses.as_ref() else {
                    continue;
                };
                if !behavior.response_delay.is_zero() {
                    tokio::time::sleep(behavior.response_delay).await;
                }

                answered += 1;
                let is_final = answered % 2 == 0;
                let _ = tx.send(Ok(Inbound::Response(result(answered, is_final, &behavior))));

                if behavior.fail_after_requests == Some(answered) {
                    let _ = tx.send(Err(AppError::Transport("injected stream failure".to_string())));
                    end_stream(&stats, &mut responses);
                } else if behavior.end_after_requests == Some(answered) {
                    end_stream(&stats, &mut responses);
                }
            }
            ClientEvent::HalfClose => {
                stats.half_closes.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = responses.as_ref() {
                    let _ = tx.send(Ok(Inbound::Response(result(answered + 1, true, &behavior))));
                }
                end_stream(&stats, &mut responses);
            }
        }
    }

    end_stream(&stats, &mut responses);
}

/// Drop the response sender so the client reads a clean end after any buffered messages.
fn end_stream(stats: &MockStats, responses: &mut Option<mpsc::UnboundedSender<AppResult<Inbound>>>) {
    if let Some(tx) = responses.take() {
        stats.current_open.fetch_sub(1, Ordering::SeqCst);
        drop(tx);
    }
}

fn result(index: usize, is_final: bool, behavior: &MockBehavior) -> StreamingResponse {
    StreamingResponse {
        result: Some(TranslationResult {
            is_final,
            alternatives: vec![Alternative {
                transcript: format!("segment {}", index),
                confidence: 0.9,
                words: Vec::new(),
            }],
        }),
        speech: vec![0u8; behavior.speech_bytes],
    }
}
