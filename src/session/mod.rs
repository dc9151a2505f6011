//! # Session Engine
//!
//! Runs many concurrent speech-translation streams against one shared transport.
//!
//! ## Key Components:
//! - **SessionPool**: admission control (at most N running sessions, FIFO), dispatch onto the
//!   worker runtime, aggregate counters and shutdown
//! - **SessionRunner**: drives one session through `Created → Streaming → Draining → Finished`
//! - **RequestProducer**: audio chunks to outbound requests, with optional real-time pacing
//! - **ResponseConsumer**: inbound responses merged into the session result, latency samples
//! - **Session**: per-stream state shared by exactly one producer and one consumer
//!
//! ## Concurrency Model:
//! Every session is one tokio task on the multi-thread runtime. Inside it the producer runs
//! as a second task so sending and receiving progress independently. The only state shared
//! across sessions is `EngineState`.

pub mod consumer;
pub mod pool;
pub mod producer;
pub mod runner;
pub mod state;

use crate::audio::AudioFormat;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::transport::{
    RecognitionConfig, SpeechContext, StreamingConfig, SynthesisSettings, TranslationSettings,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub use pool::{SessionHandle, SessionPool};
pub use state::{FinalStatus, Segment, Session, SessionPhase, SessionResult, StatusCode};

/// Identifier tagging every message, log line and result of one session.
///
/// Assigned sequentially by the pool, so an id is never handed out twice in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stream options resolved once at pool construction.
///
/// Everything here shapes request construction, pacing or timeouts. Chunking is a property
/// of the `AudioSource` and is decided where sources are built.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub simulate_realtime: bool,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    translation: TranslationSettings,
    synthesis: SynthesisSettings,
    language_code: String,
    model: String,
    max_alternatives: u32,
    profanity_filter: bool,
    word_time_offsets: bool,
    automatic_punctuation: bool,
    verbatim_transcripts: bool,
    interim_results: bool,
    speech_context: SpeechContext,
}

impl StreamSettings {
    /// Resolve settings, reading the boosted-phrases file if one is configured.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let phrases = config
            .translation
            .load_boosted_phrases()
            .map_err(|e| AppError::ConfigError(format!("{:#}", e)))?;

        let translation = &config.translation;
        Ok(Self {
            simulate_realtime: config.engine.simulate_realtime,
            connect_timeout: Duration::from_millis(config.transport.connect_timeout_ms),
            io_timeout: Duration::from_millis(config.transport.io_timeout_ms),
            translation: TranslationSettings {
                source_language_code: translation.source_language.clone(),
                target_language_code: translation.target_language.clone(),
            },
            synthesis: SynthesisSettings {
                encoding: config.synthesis.encoding(),
                sample_rate_hz: config.synthesis.effective_sample_rate(),
                voice_name: config.synthesis.voice_name.clone(),
                language_code: translation.target_language.clone(),
            },
            language_code: translation.source_language.clone(),
            model: translation.model_name.clone(),
            max_alternatives: translation.max_alternatives,
            profanity_filter: translation.profanity_filter,
            word_time_offsets: translation.word_time_offsets,
            automatic_punctuation: translation.automatic_punctuation,
            verbatim_transcripts: translation.verbatim_transcripts,
            interim_results: translation.interim_results,
            speech_context: SpeechContext {
                phrases,
                boost: translation.boosted_phrases_score,
            },
        })
    }

    /// Configuration carried by the first request of a stream with the given input format.
    pub fn streaming_config(&self, format: AudioFormat) -> StreamingConfig {
        StreamingConfig {
            recognition: RecognitionConfig {
                sample_rate_hz: format.sample_rate,
                audio_channel_count: format.channels,
                encoding: format.encoding,
                language_code: self.language_code.clone(),
                model: self.model.clone(),
                max_alternatives: self.max_alternatives,
                profanity_filter: self.profanity_filter,
                enable_word_time_offsets: self.word_time_offsets,
                enable_automatic_punctuation: self.automatic_punctuation,
                verbatim_transcripts: self.verbatim_transcripts,
                interim_results: self.interim_results,
                speech_context: self.speech_context.clone(),
            },
            translation: self.translation.clone(),
            synthesis: self.synthesis.clone(),
        }
    }
}
