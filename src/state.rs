//! # Engine State Management
//!
//! Process-wide aggregates shared by every session: lifecycle counters, audio processed and
//! the latency sample sequences.
//!
//! ## Guarded Aggregate Pattern:
//! - One small structure behind one `Mutex`, never per-field locks, so a reader always sees
//!   counters that agree with each other (`active + finished == started`)
//! - Critical sections are a handful of additions or one `Vec::push`; the lock is never held
//!   across I/O or an `.await`
//! - Readers take a snapshot copy under the lock and do any heavy work (sorting, percentiles)
//!   after releasing it
//!
//! ## Lifecycle:
//! Created at pool construction and shared (`Clone` is an `Arc` bump) with every runner and
//! the monitor. It outlives the worker tasks, so statistics stay readable during shutdown.
//!
//! ## Key Rust Concepts Used:
//! - **Arc<Mutex<T>>**: shared ownership across worker threads with exclusive access for
//!   each update
//! - **PoisonError::into_inner**: a panicking session must not make statistics unreadable,
//!   so a poisoned lock is still used
//! - **Clone on read**: `counters()` and `latency_snapshot()` return owned copies

use crate::session::{CorrelationId, FinalStatus, Session, SessionPhase, StatusCode};
use serde::Serialize;                                  // Counters served as JSON
use std::collections::{BTreeMap, HashMap};             // Live sessions, phase census
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};  // The single aggregate lock
use std::time::Instant;                                // Uptime

/// Shared handle to the aggregates.
///
/// ## Thread Safety:
/// Every method takes `&self` and locks internally, so one `EngineState` can be cloned
/// into any number of tasks.
#[derive(Debug, Clone)]
pub struct EngineState {
    inner: Arc<Mutex<Aggregates>>,

    /// When the pool was created (never changes, so no lock needed)
    pub start_time: Instant,
}

#[derive(Debug, Default)]
struct Aggregates {
    counters: EngineCounters,
    latencies: LatencySamples,

    /// Sessions admitted and not yet finished. Read-only references used for counting;
    /// dropped as soon as a session finishes so its correlation id can be retired.
    live: BTreeMap<CorrelationId, Arc<Session>>,
}

/// Lifecycle counters.
///
/// ## Invariant:
/// `active + finished == started` whenever the lock is released.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EngineCounters {
    /// Sessions admitted since the pool was created
    pub started: u64,

    /// Sessions admitted and not yet finished
    pub active: u64,

    /// Sessions that reached a terminal status (any outcome)
    pub finished: u64,

    /// Finished with a failure status (establishment or mid-stream)
    pub failed_requests: u64,

    /// Finished because cancellation was observed
    pub cancelled: u64,

    /// Audio seconds of streams the server completed successfully
    pub audio_processed_secs: f64,
}

/// Latency samples in milliseconds, appended in arrival order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LatencySamples {
    pub all: Vec<f64>,
    pub interim: Vec<f64>,
    pub finals: Vec<f64>,
}

/// Whether a response carried an interim or a final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyKind {
    Interim,
    Final,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Aggregates::default())),
            start_time: Instant::now(),
        }
    }

    /// A panicking holder cannot leave the counters half-updated (every critical section is
    /// a few plain assignments), so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Aggregates> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a newly admitted session as started and active.
    pub fn admit(&self, session: Arc<Session>) {
        let mut aggregates = self.lock();
        aggregates.counters.started += 1;
        aggregates.counters.active += 1;
        aggregates.live.insert(session.correlation_id(), session);
    }

    /// Record a session's terminal status exactly once.
    ///
    /// Sets the status and the `Finished` phase inside the same critical section that moves
    /// the session from active to finished, so counters and phases never disagree.
    /// Returns `false` if the session had already finished.
    pub fn finish(&self, session: &Session, status: FinalStatus, audio_secs: f64) -> bool {
        let mut aggregates = self.lock();

        let code = status.code;
        if !session.set_final_status(status) {
            return false;
        }
        session.mark_finished();

        if aggregates.live.remove(&session.correlation_id()).is_some() {
            aggregates.counters.active = aggregates.counters.active.saturating_sub(1);
        }
        aggregates.counters.finished += 1;

        match code {
            StatusCode::Ok => aggregates.counters.audio_processed_secs += audio_secs,
            StatusCode::Cancelled => aggregates.counters.cancelled += 1,
            _ => aggregates.counters.failed_requests += 1,
        }
        true
    }

    /// Append one latency sample.
    pub fn record_latency(&self, kind: LatencyKind, latency_ms: f64) {
        let mut aggregates = self.lock();
        aggregates.latencies.all.push(latency_ms);
        match kind {
            LatencyKind::Interim => aggregates.latencies.interim.push(latency_ms),
            LatencyKind::Final => aggregates.latencies.finals.push(latency_ms),
        }
    }

    pub fn counters(&self) -> EngineCounters {
        self.lock().counters.clone()
    }

    /// Copy of every latency sample, for lock-free statistics.
    pub fn latency_snapshot(&self) -> LatencySamples {
        self.lock().latencies.clone()
    }

    /// Active counter and the phase of every live session, read atomically.
    pub fn phase_census(&self) -> (u64, HashMap<SessionPhase, usize>) {
        let aggregates = self.lock();
        let mut census = HashMap::new();
        for session in aggregates.live.values() {
            *census.entry(session.phase()).or_insert(0) += 1;
        }
        (aggregates.counters.active, census)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
