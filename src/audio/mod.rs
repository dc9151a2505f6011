//! # Audio Input Module
//!
//! Turns audio into the fixed-duration chunks a session streams to the server.
//!
//! ## Key Components:
//! - **AudioSource**: lazy sequence of chunks for one stream, with format metadata
//! - **WavSource**: finite source over a pre-loaded WAV file
//! - **PcmReaderSource**: unbounded source over raw PCM from any async reader (stdin, pipes)
//! - **wav**: loading input files and writing synthesized speech
//!
//! ## Chunk Size:
//! One chunk holds `sample_rate × chunk_duration_ms / 1000` frames; only the last chunk of a
//! finite source may be shorter.

pub mod source;
pub mod wav;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use source::{PcmReaderSource, WavSource};
pub use wav::{load_wav_files, write_wav, WavData};

/// Sample encoding of the input audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// 16-bit signed little-endian PCM
    LinearPcm,
    /// 8-bit G.711 A-law
    Alaw,
    /// 8-bit G.711 mu-law
    Mulaw,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::LinearPcm => 2,
            AudioEncoding::Alaw | AudioEncoding::Mulaw => 1,
        }
    }
}

/// Metadata known before the first chunk is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: AudioEncoding,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    /// Bytes in one chunk of `chunk_duration_ms`, never less than one frame.
    pub fn chunk_bytes(&self, chunk_duration_ms: u32) -> usize {
        let frames = (self.sample_rate as u64 * chunk_duration_ms as u64 / 1000).max(1) as usize;
        frames * self.bytes_per_frame()
    }

    /// Playback duration of `bytes` of audio in this format.
    pub fn duration_secs(&self, bytes: usize) -> f64 {
        let bytes_per_second = self.bytes_per_frame() as f64 * self.sample_rate as f64;
        if bytes_per_second > 0.0 {
            bytes as f64 / bytes_per_second
        } else {
            0.0
        }
    }
}

/// One slice of audio. `is_last` marks the end of a finite source.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub is_last: bool,
}

/// Produces the audio for one stream.
#[async_trait]
pub trait AudioSource: Send {
    fn format(&self) -> AudioFormat;

    /// Human-readable origin, used when reporting results.
    fn label(&self) -> String;

    /// Next chunk. After a chunk with `is_last` the source must not be polled again.
    async fn next_chunk(&mut self) -> AppResult<AudioChunk>;
}
