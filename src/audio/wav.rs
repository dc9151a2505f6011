//! WAV container I/O: decoding input files into raw audio and writing synthesized speech.

use crate::audio::{AudioEncoding, AudioFormat};
use crate::error::{AppError, AppResult};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_ALAW: u16 = 0x0006;
const WAVE_FORMAT_MULAW: u16 = 0x0007;

/// A decoded input file, shared read-only by every stream that replays it.
#[derive(Debug, Clone)]
pub struct WavData {
    pub filename: String,
    pub format: AudioFormat,
    /// Raw interleaved samples in `format.encoding`, header stripped
    pub data: Vec<u8>,
}

impl WavData {
    pub fn duration_secs(&self) -> f64 {
        self.format.duration_secs(self.data.len())
    }
}

/// Load a single WAV file.
pub fn load_wav_file(path: &Path) -> AppResult<WavData> {
    let mut file = File::open(path)
        .map_err(|e| AppError::Audio(format!("cannot open {}: {}", path.display(), e)))?;
    let (header, track) = wav::read(&mut file)
        .map_err(|e| AppError::Audio(format!("cannot parse {}: {}", path.display(), e)))?;

    let (encoding, data) = match (header.audio_format, track) {
        (WAVE_FORMAT_PCM, wav::BitDepth::Sixteen(samples)) => {
            let mut data = vec![0u8; samples.len() * 2];
            LittleEndian::write_i16_into(&samples, &mut data);
            (AudioEncoding::LinearPcm, data)
        }
        (WAVE_FORMAT_ALAW, wav::BitDepth::Eight(data)) => (AudioEncoding::Alaw, data),
        (WAVE_FORMAT_MULAW, wav::BitDepth::Eight(data)) => (AudioEncoding::Mulaw, data),
        (format, _) => {
            return Err(AppError::Audio(format!(
                "{}: unsupported format {:#06x} with {} bits per sample",
                path.display(),
                format,
                header.bits_per_sample
            )))
        }
    };

    Ok(WavData {
        filename: path.to_string_lossy().to_string(),
        format: AudioFormat {
            sample_rate: header.sampling_rate,
            channels: header.channel_count,
            encoding,
        },
        data,
    })
}

/// Load a WAV file, or every `.wav` file in a directory.
///
/// Files are sorted largest first so the longest streams start early and do not dominate
/// the tail of a run.
pub fn load_wav_files(path: &Path) -> AppResult<Vec<WavData>> {
    let paths: Vec<PathBuf> = if path.is_dir() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry_path = entry?.path();
            let is_wav = entry_path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("wav"))
                .unwrap_or(false);
            if entry_path.is_file() && is_wav {
                paths.push(entry_path);
            }
        }
        paths
    } else {
        vec![path.to_path_buf()]
    };

    let mut all_wav = paths
        .iter()
        .map(|p| load_wav_file(p))
        .collect::<AppResult<Vec<_>>>()?;

    if all_wav.is_empty() {
        return Err(AppError::Audio(format!("no audio files found at {}", path.display())));
    }

    all_wav.sort_by(|a, b| b.data.len().cmp(&a.data.len()));
    debug!(count = all_wav.len(), "Loaded audio files");
    Ok(all_wav)
}

/// Write mono 16-bit PCM samples to a WAV file.
pub fn write_wav(path: &Path, sample_rate: u32, samples: &[i16]) -> AppResult<()> {
    let header = wav::Header::new(WAVE_FORMAT_PCM, 1, sample_rate, 16);
    let mut file = File::create(path)?;
    wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut file)?;
    Ok(())
}

/// Reinterpret little-endian PCM bytes as samples. A trailing odd byte is dropped.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    let even = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; even / 2];
    LittleEndian::read_i16_into(&bytes[..even], &mut samples);
    samples
}
