//! # Session Results
//!
//! Consumes finished sessions: prints their transcripts, appends one JSON line per session
//! to the transcript file and stores the synthesized speech.
//!
//! ## Transcript File Format:
//! One JSON object per line, with the best alternative only:
//! ```json
//! {"audio_filepath": "samples/de.wav", "text": "hallo welt"}
//! ```

use crate::audio::wav::{pcm_bytes_to_samples, write_wav};
use crate::config::{AppConfig, SynthesisEncoding};
use crate::error::AppResult;
use crate::session::{Session, SessionResult};
use serde_json::json;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const RULE: &str = "-----------------------------------------------------------";

pub struct ResultWriter {
    print_transcripts: bool,
    word_time_offsets: bool,
    transcript_file: Option<BufWriter<File>>,
    speech_encoding: SynthesisEncoding,
    speech_sample_rate: u32,
    speech_file: PathBuf,
    /// Suffix speech files with the correlation id so sessions don't overwrite each other
    per_session_speech_files: bool,
}

impl ResultWriter {
    pub fn new(config: &AppConfig, session_count: usize) -> AppResult<Self> {
        let transcript_file = if config.output.print_transcripts
            && !config.output.transcript_file.is_empty()
        {
            Some(BufWriter::new(File::create(&config.output.transcript_file)?))
        } else {
            None
        };

        Ok(Self {
            print_transcripts: config.output.print_transcripts,
            word_time_offsets: config.translation.word_time_offsets,
            transcript_file,
            speech_encoding: config.synthesis.encoding(),
            speech_sample_rate: config.synthesis.effective_sample_rate(),
            speech_file: PathBuf::from(&config.synthesis.audio_file),
            per_session_speech_files: session_count > 1,
        })
    }

    /// Report one finished session.
    pub fn write(&mut self, session: &Session) -> AppResult<()> {
        let result = session.result();

        if self.print_transcripts {
            print!("{}", self.render(session, &result));

            if let Some(file) = self.transcript_file.as_mut() {
                let line = transcript_line(session.label(), &result);
                writeln!(file, "{}", line)?;
                file.flush()?;
            }
        }

        self.write_speech(session, &result)
    }

    /// Human-readable block for one session.
    pub fn render(&self, session: &Session, result: &SessionResult) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "File: {}", session.label());
        if let Some(status) = session.final_status() {
            if !status.is_ok() {
                let _ = writeln!(out, "Status: {} {}", status.code.as_str(), status.message);
            }
        }

        let _ = writeln!(out, "\nFinal transcripts: ");
        let partials = partial_transcripts(result);
        for (index, transcript) in final_transcripts(result).iter().enumerate() {
            let partial = partials.get(index).map(String::as_str).unwrap_or("");
            let _ = writeln!(out, "{} : {}{}\n", index, transcript, partial);

            if self.word_time_offsets {
                self.render_word_table(&mut out, result, index);
            }
        }

        let _ = writeln!(out, "\nAudio processed: {} sec.", result.audio_sent_secs);
        let _ = writeln!(out, "{}\n", RULE);
        out
    }

    fn render_word_table(&self, out: &mut String, result: &SessionResult, alternative: usize) {
        let _ = writeln!(out, "Timestamps: ");
        let _ = writeln!(out, "{:<40}{:<16}{:<16}{:<16}\n", "Word", "Start (ms)", "End (ms)", "Confidence");

        let segments = result.finals.iter().chain(result.partial.iter());
        for segment in segments {
            let Some(alt) = segment.alternatives.get(alternative) else {
                continue;
            };
            for word in &alt.words {
                let _ = writeln!(
                    out,
                    "{:<40}{:<16}{:<16}{:<16.4e}",
                    word.word, word.start_time_ms, word.end_time_ms, word.confidence
                );
            }
        }
        let _ = writeln!(out);
    }

    fn write_speech(&self, session: &Session, result: &SessionResult) -> AppResult<()> {
        if result.speech.is_empty() {
            return Ok(());
        }

        let base = if self.per_session_speech_files {
            suffixed(&self.speech_file, &session.correlation_id().to_string())
        } else {
            self.speech_file.clone()
        };

        match self.speech_encoding {
            SynthesisEncoding::LinearPcm => {
                let samples = pcm_bytes_to_samples(&result.speech);
                write_wav(&base, self.speech_sample_rate, &samples)?;
                info!(path = %base.display(), samples = samples.len(), "Synthesized speech written");
            }
            SynthesisEncoding::OggOpus => {
                // Stored as received; decoding Opus is left to external tools
                let path = base.with_extension("opus");
                std::fs::write(&path, &result.speech)?;
                warn!(path = %path.display(), "Opus speech stored undecoded");
            }
        }
        Ok(())
    }
}

/// Final transcripts per alternative index, each the concatenation of every final segment.
fn final_transcripts(result: &SessionResult) -> Vec<String> {
    let alternatives = result
        .finals
        .iter()
        .map(|segment| segment.alternatives.len())
        .max()
        .unwrap_or(0);

    (0..alternatives)
        .map(|a| {
            result
                .finals
                .iter()
                .filter_map(|segment| segment.alternatives.get(a))
                .map(|alt| alt.transcript.as_str())
                .collect::<String>()
        })
        .collect()
}

fn partial_transcripts(result: &SessionResult) -> Vec<String> {
    result
        .partial
        .iter()
        .flat_map(|segment| segment.alternatives.iter())
        .map(|alt| alt.transcript.clone())
        .collect()
}

/// JSON line for the transcript file (best alternative only).
pub fn transcript_line(audio_filepath: &str, result: &SessionResult) -> serde_json::Value {
    let text = final_transcripts(result).into_iter().next().unwrap_or_default();
    json!({
        "audio_filepath": audio_filepath,
        "text": text,
    })
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "s2s_output".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}-{}", stem, suffix),
    };
    path.with_file_name(name)
}
