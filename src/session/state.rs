//! Per-session state.
//!
//! A `Session` is written by exactly one producer (send timestamps) and one consumer
//! (receive timestamps, merged results). Each group of fields has its own small lock, so
//! the two sides never contend with each other or with other sessions.

use crate::error::AppError;
use crate::session::CorrelationId;
use crate::transport::{Alternative, StreamingResponse};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Admitted; the stream is being opened
    Created,
    /// Producer and consumer running concurrently
    Streaming,
    /// Outbound half closed (or failed); still reading responses
    Draining,
    /// Terminal status recorded
    Finished,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Draining => "draining",
            SessionPhase::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    /// Stream could not be opened or the connection failed
    Unavailable,
    /// Server ended the stream before the client finished sending
    Aborted,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Internal => "INTERNAL",
        }
    }
}

/// Terminal outcome of a session, set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalStatus {
    pub code: StatusCode,
    pub message: String,
}

impl FinalStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn from_error(error: &AppError) -> Self {
        let code = match error {
            AppError::Cancelled(_) => StatusCode::Cancelled,
            AppError::StreamEstablishment(_) | AppError::Transport(_) | AppError::AtCapacity(_) => {
                StatusCode::Unavailable
            }
            _ => StatusCode::Internal,
        };
        Self::new(code, error.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// One output segment: every alternative the server returned for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Segment {
    pub alternatives: Vec<Alternative>,
}

impl Segment {
    /// The highest-ranked alternative's transcript.
    pub fn best_transcript(&self) -> &str {
        self.alternatives
            .first()
            .map(|alt| alt.transcript.as_str())
            .unwrap_or("")
    }
}

/// Accumulated decoded output of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionResult {
    /// Final segments in arrival order; never modified once appended
    pub finals: Vec<Segment>,
    /// Latest interim segment, replaced by every interim and cleared by every final
    pub partial: Option<Segment>,
    /// Synthesized speech, concatenated in arrival order
    #[serde(skip)]
    pub speech: Vec<u8>,
    /// Playback duration of the audio actually sent
    pub audio_sent_secs: f64,
}

#[derive(Debug, Default)]
struct Timing {
    sends: Vec<Instant>,
    receives: Vec<Instant>,
}

/// One bidirectional stream instance.
#[derive(Debug)]
pub struct Session {
    correlation_id: CorrelationId,
    label: String,
    phase: Mutex<SessionPhase>,
    timing: Mutex<Timing>,
    result: Mutex<SessionResult>,
    final_status: OnceLock<FinalStatus>,
    streaming_started_at: OnceLock<Instant>,
    draining_started_at: OnceLock<Instant>,
    finished_at: OnceLock<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(correlation_id: CorrelationId, label: impl Into<String>) -> Self {
        Self {
            correlation_id,
            label: label.into(),
            phase: Mutex::new(SessionPhase::Created),
            timing: Mutex::new(Timing::default()),
            result: Mutex::new(SessionResult::default()),
            final_status: OnceLock::new(),
            streaming_started_at: OnceLock::new(),
            draining_started_at: OnceLock::new(),
            finished_at: OnceLock::new(),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Where the audio came from (file name or "stdin").
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    /// Move to `next` if it is later than the current phase. Returns whether it moved.
    pub fn advance(&self, next: SessionPhase) -> bool {
        let mut phase = lock(&self.phase);
        if next <= *phase {
            return false;
        }
        *phase = next;

        let now = Instant::now();
        match next {
            SessionPhase::Streaming => {
                let _ = self.streaming_started_at.set(now);
            }
            SessionPhase::Draining => {
                let _ = self.draining_started_at.set(now);
            }
            SessionPhase::Finished => {
                let _ = self.finished_at.set(now);
            }
            SessionPhase::Created => {}
        }
        true
    }

    pub(crate) fn mark_finished(&self) {
        self.advance(SessionPhase::Finished);
    }

    /// Returns `false` if a status was already set.
    pub(crate) fn set_final_status(&self, status: FinalStatus) -> bool {
        self.final_status.set(status).is_ok()
    }

    pub fn final_status(&self) -> Option<FinalStatus> {
        self.final_status.get().cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.final_status.get().is_some()
    }

    pub fn streaming_started_at(&self) -> Option<Instant> {
        self.streaming_started_at.get().copied()
    }

    /// Set when the input ran out or either direction failed; absent if the session went
    /// straight to `Finished`.
    pub fn draining_started_at(&self) -> Option<Instant> {
        self.draining_started_at.get().copied()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    /// Record the transmission time of the next outbound message.
    pub fn record_send(&self, at: Instant) {
        lock(&self.timing).sends.push(at);
    }

    /// Record the arrival time of the next inbound message.
    ///
    /// The k-th response is paired with the k-th send (the last send once responses
    /// outnumber sends) and the round-trip latency is returned. Nothing is recorded before
    /// the first send, so `None` means the response cannot be attributed to a request.
    pub fn record_receive(&self, at: Instant) -> Option<Duration> {
        let mut timing = lock(&self.timing);
        let last = timing.sends.len().checked_sub(1)?;
        let sent_at = timing.sends[timing.receives.len().min(last)];
        timing.receives.push(at);
        Some(at.saturating_duration_since(sent_at))
    }

    /// Copy of the send and receive timestamps, in recording order.
    pub fn timestamps(&self) -> (Vec<Instant>, Vec<Instant>) {
        let timing = lock(&self.timing);
        (timing.sends.clone(), timing.receives.clone())
    }

    /// Merge one inbound response into the result.
    ///
    /// ## Merge rules:
    /// - interim result: replaces the partial segment (an interim without alternatives is
    ///   ignored)
    /// - final result: appended to the final segments, partial cleared
    /// - speech: appended to the synthesized audio
    ///
    /// Ignored once the session has a terminal status.
    pub fn merge(&self, response: &StreamingResponse) {
        if self.is_finished() {
            return;
        }

        let mut result = lock(&self.result);
        if let Some(translation) = &response.result {
            if translation.is_final {
                result.partial = None;
                if !translation.alternatives.is_empty() {
                    result.finals.push(Segment {
                        alternatives: translation.alternatives.clone(),
                    });
                }
            } else if !translation.alternatives.is_empty() {
                result.partial = Some(Segment {
                    alternatives: translation.alternatives.clone(),
                });
            }
        }
        result.speech.extend_from_slice(&response.speech);
    }

    pub(crate) fn set_audio_sent(&self, secs: f64) {
        if !self.is_finished() {
            lock(&self.result).audio_sent_secs = secs;
        }
    }

    /// Read-only copy of the accumulated output.
    pub fn result(&self) -> SessionResult {
        lock(&self.result).clone()
    }
}
