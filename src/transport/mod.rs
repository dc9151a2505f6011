//! # Streaming Transport
//!
//! The bidirectional-streaming RPC layer the session engine talks through. The engine only
//! sees the traits in this module; the wire format lives in the implementations.
//!
//! ## Key Components:
//! - **SpeechTransport**: opens one duplex stream per session; shared by every session
//! - **RequestSink**: outbound half (send, half-close)
//! - **ResponseSource**: inbound half (next message, clean end, or error)
//! - **websocket**: tokio-tungstenite implementation
//!
//! ## Message Flow:
//! - **Client → Server**: first request carries `StreamingConfig` plus audio, later requests
//!   carry audio only, then a half-close
//! - **Server → Client**: interim/final translation results and synthesized speech

pub mod websocket;

#[cfg(test)]
pub mod mock;

use crate::audio::AudioEncoding;
use crate::error::AppResult;
use crate::session::CorrelationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use websocket::WebSocketTransport;

/// Opens duplex streams against the speech service.
///
/// ## Thread Safety:
/// One transport is shared read-only by every session (`Arc<dyn SpeechTransport>`), so
/// `open_stream` must be safe to call concurrently.
#[async_trait]
pub trait SpeechTransport: Send + Sync {
    async fn open_stream(&self, correlation_id: CorrelationId) -> AppResult<DuplexStream>;
}

/// Outbound half of a duplex stream.
#[async_trait]
pub trait RequestSink: Send {
    async fn send(&mut self, request: StreamingRequest) -> AppResult<()>;

    /// Half-close: no more requests follow, responses keep flowing.
    async fn close(&mut self) -> AppResult<()>;
}

/// Inbound half of a duplex stream.
#[async_trait]
pub trait ResponseSource: Send {
    /// `None` once the server ends the stream cleanly.
    async fn next(&mut self) -> Option<AppResult<Inbound>>;
}

/// Both halves of one open stream, owned by a single session.
pub struct DuplexStream {
    pub sink: Box<dyn RequestSink>,
    pub responses: Box<dyn ResponseSource>,
}

/// What the inbound half can yield besides errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(StreamingResponse),
    /// A frame arrived that could not be decoded; the stream itself is still healthy
    Malformed(String),
}

/// One outbound protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingRequest {
    /// Present on the first message of a stream only
    pub config: Option<StreamingConfig>,
    pub audio: Vec<u8>,
}

/// Session configuration sent with the first request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub recognition: RecognitionConfig,
    pub translation: TranslationSettings,
    pub synthesis: SynthesisSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub sample_rate_hz: u32,
    pub audio_channel_count: u16,
    pub encoding: AudioEncoding,
    pub language_code: String,
    /// Empty lets the server pick its default model
    pub model: String,
    pub max_alternatives: u32,
    pub profanity_filter: bool,
    pub enable_word_time_offsets: bool,
    pub enable_automatic_punctuation: bool,
    pub verbatim_transcripts: bool,
    pub interim_results: bool,
    pub speech_context: SpeechContext,
}

/// Vocabulary boosting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechContext {
    pub phrases: Vec<String>,
    pub boost: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationSettings {
    pub source_language_code: String,
    pub target_language_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub encoding: crate::config::SynthesisEncoding,
    pub sample_rate_hz: u32,
    pub voice_name: String,
    pub language_code: String,
}

/// One inbound protocol message. Either part may be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingResponse {
    pub result: Option<TranslationResult>,
    /// Synthesized speech in the requested encoding
    pub speech: Vec<u8>,
}

impl StreamingResponse {
    /// A response with neither text nor audio marks a completed sentence and carries no data.
    pub fn is_empty(&self) -> bool {
        self.result.is_none() && self.speech.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub is_final: bool,
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<WordInfo>,
}

/// Per-word timing in milliseconds from the start of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordInfo {
    pub word: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub confidence: f32,
}
