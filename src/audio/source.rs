//! Concrete audio sources.

use crate::audio::{AudioChunk, AudioFormat, AudioSource, WavData};
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Finite source replaying a pre-loaded WAV file.
///
/// The file data is shared, so many concurrent streams can replay the same file.
pub struct WavSource {
    wav: Arc<WavData>,
    offset: usize,
    chunk_bytes: usize,
}

impl WavSource {
    pub fn new(wav: Arc<WavData>, chunk_duration_ms: u32) -> Self {
        let chunk_bytes = wav.format.chunk_bytes(chunk_duration_ms);
        Self {
            wav,
            offset: 0,
            chunk_bytes,
        }
    }
}

#[async_trait]
impl AudioSource for WavSource {
    fn format(&self) -> AudioFormat {
        self.wav.format
    }

    fn label(&self) -> String {
        self.wav.filename.clone()
    }

    async fn next_chunk(&mut self) -> AppResult<AudioChunk> {
        let total = self.wav.data.len();
        let end = (self.offset + self.chunk_bytes).min(total);
        let data = self.wav.data[self.offset..end].to_vec();
        self.offset = end;

        Ok(AudioChunk {
            data,
            is_last: self.offset == total,
        })
    }
}

/// Unbounded source reading raw interleaved audio from an async reader.
///
/// ## Usage:
/// Pipe a capture device into stdin, e.g. `arecord -f S16_LE -r 16000 -c 1 | s2s-stream-client`.
/// The stream ends at EOF or when the session is cancelled.
pub struct PcmReaderSource<R> {
    reader: R,
    format: AudioFormat,
    chunk_bytes: usize,
    label: String,
}

impl<R> PcmReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, format: AudioFormat, chunk_duration_ms: u32, label: impl Into<String>) -> Self {
        Self {
            reader,
            format,
            chunk_bytes: format.chunk_bytes(chunk_duration_ms),
            label: label.into(),
        }
    }
}

#[async_trait]
impl<R> AudioSource for PcmReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    async fn next_chunk(&mut self) -> AppResult<AudioChunk> {
        let mut data = vec![0u8; self.chunk_bytes];
        let mut filled = 0;

        while filled < data.len() {
            let read = self.reader.read(&mut data[filled..]).await?;
            if read == 0 {
                // EOF: keep whole frames only
                let frame = self.format.bytes_per_frame().max(1);
                data.truncate(filled - filled % frame);
                return Ok(AudioChunk { data, is_last: true });
            }
            filled += read;
        }

        Ok(AudioChunk { data, is_last: false })
    }
}
