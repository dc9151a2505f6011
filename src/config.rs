//! # Configuration Management
//!
//! Loads the client configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `RIVA_URI` environment variable (server address only)
//! 2. Environment variables (APP_TRANSPORT__URI, APP_ENGINE__MAX_CONCURRENT_SESSIONS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Every option here affects request construction or pacing, never the engine structure.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: `Deserialize` lets the `config` crate fill these structs from TOML and env
//! - **Default impl**: the built-in values are also the lowest-priority config source
//! - **anyhow::Context**: attaches the failing file or key to configuration errors

use anyhow::{Context, Result};        // Configuration errors with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML and JSON
use std::env;                         // RIVA_URI override
use std::path::Path;                  // Boosted-phrases file

/// Main client configuration, grouped by concern.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Debug` for logging, `Clone` so tests can tweak a copy,
///   `Serialize`/`Deserialize` for the layered sources
/// - **pub fields**: read directly by the driver, the pool and the results writer
///
/// ## Sections:
/// - `transport`: server address and I/O timeouts
/// - `engine`: pool size, pacing and admission behavior
/// - `translation` / `synthesis`: the options sent on the first request
/// - `input` / `output`: where audio comes from and where results go
/// - `monitor`: the optional statistics endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub engine: EngineConfig,
    pub translation: TranslationConfig,
    pub synthesis: SynthesisConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    pub monitor: MonitorConfig,
}

/// Where the speech service lives and how long a single I/O operation may take.
///
/// ## Fields:
/// - `uri`: WebSocket address of the speech service (e.g. "ws://localhost:50051/s2s")
/// - `connect_timeout_ms`: limit on opening one stream; expiry fails that session only
/// - `io_timeout_ms`: limit on one pending send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub uri: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on one pending send; cancellation is always observed sooner
    pub io_timeout_ms: u64,
}

/// Session pool sizing and pacing.
///
/// ## Tuning guidelines:
/// - `max_concurrent_sessions` is the admission limit N; extra streams wait in FIFO order
/// - `worker_threads = 0` derives the pool size as 4 × N
/// - `simulate_realtime` paces chunks at their playback rate instead of sending back-to-back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_sessions: usize,
    pub worker_threads: usize,
    pub chunk_duration_ms: u32,
    pub simulate_realtime: bool,
    pub num_iterations: u32,
    pub blocking_admission: bool,
}

/// Recognition and translation options sent on the first message of every stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    pub source_language: String,
    pub target_language: String,
    pub model_name: String,
    pub max_alternatives: u32,
    pub profanity_filter: bool,
    pub word_time_offsets: bool,
    pub automatic_punctuation: bool,
    pub verbatim_transcripts: bool,
    pub interim_results: bool,
    /// One phrase per line; empty means no vocabulary boosting
    pub boosted_phrases_file: String,
    pub boosted_phrases_score: f32,
}

/// Output modality: synthesized speech parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// "pcm" or "opus"
    pub encoding: String,
    pub sample_rate_hz: u32,
    pub voice_name: String,
    pub audio_file: String,
}

/// Audio input selection.
///
/// `audio_file` may be a single .wav file or a directory of them. Empty or "-" reads raw
/// interleaved 16-bit PCM from stdin (e.g. piped from a capture device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub audio_file: String,
    pub stdin_sample_rate: u32,
    pub stdin_channels: u16,
}

/// Transcript printing and the JSON-lines transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub print_transcripts: bool,
    pub transcript_file: String,
}

/// Optional HTTP endpoint exposing live pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig {
                uri: "ws://localhost:50051/s2s".to_string(),
                connect_timeout_ms: 10_000,
                io_timeout_ms: 5_000,
            },
            engine: EngineConfig {
                max_concurrent_sessions: 1,
                worker_threads: 0,       // derived from max_concurrent_sessions
                chunk_duration_ms: 100,  // 0.1s of audio per message
                simulate_realtime: false,
                num_iterations: 1,
                blocking_admission: true,
            },
            translation: TranslationConfig {
                source_language: "en-US".to_string(),
                target_language: "de-DE".to_string(),
                model_name: String::new(),
                max_alternatives: 1,
                profanity_filter: false,
                word_time_offsets: false,
                automatic_punctuation: true,
                verbatim_transcripts: true,
                interim_results: true,
                boosted_phrases_file: String::new(),
                boosted_phrases_score: 10.0,
            },
            synthesis: SynthesisConfig {
                encoding: "pcm".to_string(),
                sample_rate_hz: 44_100,
                voice_name: String::new(),
                audio_file: "s2s_output.wav".to_string(),
            },
            input: InputConfig {
                audio_file: String::new(),
                stdin_sample_rate: 16_000,
                stdin_channels: 1,
            },
            output: OutputConfig {
                print_transcripts: true,
                transcript_file: "final_transcripts.json".to_string(),
            },
            monitor: MonitorConfig {
                enabled: false,
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, `APP_*` variables and `RIVA_URI`.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_ENGINE__MAX_CONCURRENT_SESSIONS=8`
    /// - `APP_ENGINE__SIMULATE_REALTIME=true`
    /// - `APP_TRANSLATION__TARGET_LANGUAGE=es-US`
    /// - `RIVA_URI=ws://speech.internal:50051/s2s`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(uri) = env::var("RIVA_URI") {
            settings = settings.set_override("transport.uri", uri)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.engine.chunk_duration_ms == 0 {
            return Err(anyhow::anyhow!("Chunk duration must be greater than 0"));
        }

        if self.engine.num_iterations == 0 {
            return Err(anyhow::anyhow!("Number of iterations must be greater than 0"));
        }

        if self.translation.source_language.is_empty() || self.translation.target_language.is_empty() {
            return Err(anyhow::anyhow!("Source and target language codes are required"));
        }

        if self.translation.boosted_phrases_score < 0.0 {
            return Err(anyhow::anyhow!("Boosted phrases score cannot be negative"));
        }

        if SynthesisEncoding::parse(&self.synthesis.encoding).is_none() {
            return Err(anyhow::anyhow!(
                "Unsupported synthesis encoding '{}' (expected pcm or opus)",
                self.synthesis.encoding
            ));
        }

        if self.input.stdin_sample_rate == 0 || self.input.stdin_channels == 0 {
            return Err(anyhow::anyhow!("Stdin audio format must have a sample rate and channels"));
        }

        if self.monitor.enabled && self.monitor.port == 0 {
            return Err(anyhow::anyhow!("Monitor port cannot be 0"));
        }

        Ok(())
    }
}

impl EngineConfig {
    /// Worker pool size: explicit value, or four threads per admitted session.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            4 * self.max_concurrent_sessions.max(1)
        }
    }
}

impl TranslationConfig {
    /// Read the vocabulary-boosting list, one phrase per line.
    pub fn load_boosted_phrases(&self) -> Result<Vec<String>> {
        if self.boosted_phrases_file.is_empty() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(Path::new(&self.boosted_phrases_file))
            .with_context(|| format!("Unable to read boosted phrases file {}", self.boosted_phrases_file))?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Encoding requested for synthesized speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisEncoding {
    LinearPcm,
    OggOpus,
}

impl SynthesisEncoding {
    /// An empty encoding falls back to PCM.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "" | "pcm" => Some(SynthesisEncoding::LinearPcm),
            "opus" => Some(SynthesisEncoding::OggOpus),
            _ => None,
        }
    }
}

impl SynthesisConfig {
    pub fn encoding(&self) -> SynthesisEncoding {
        SynthesisEncoding::parse(&self.encoding).unwrap_or(SynthesisEncoding::LinearPcm)
    }

    /// Sample rate actually requested from the server.
    ///
    /// Opus only supports 8/16/24/48 kHz, so other rates snap to a supported one.
    pub fn effective_sample_rate(&self) -> u32 {
        match self.encoding() {
            SynthesisEncoding::LinearPcm => self.sample_rate_hz,
            SynthesisEncoding::OggOpus => adjust_opus_rate(self.sample_rate_hz),
        }
    }
}

fn adjust_opus_rate(rate: u32) -> u32 {
    match rate {
        r if r > 48_000 => 48_000,
        r if r > 24_000 && r < 48_000 => 24_000,
        r if r > 16_000 && r < 24_000 => 16_000,
        r if r > 8_000 && r < 16_000 => 8_000,
        r if r < 8_000 => 8_000,
        r => r,
    }
}
