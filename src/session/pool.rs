//! # Session Pool
//!
//! Admission control and lifecycle orchestration for many concurrent sessions sharing one
//! transport.
//!
//! ## Admission:
//! A fair semaphore with N permits bounds the number of running sessions. Waiting callers
//! are admitted in submission order. A permit is held from admission until the session's
//! terminal status and counters are recorded, so a queued session can only start streaming
//! after a running one has finished.
//!
//! ## Dispatch:
//! Each admitted session runs as one task on the worker runtime captured at construction.
//! An outer task watches it: if the runner panics, the session is still finished with an
//! INTERNAL status so the counters and the permit are never leaked.
//!
//! ## Cancellation:
//! Every session gets a child of the pool token. `SessionHandle::cancel` stops one
//! session; `shutdown` (or a signal) stops all of them.
//!
//! ## Shutdown:
//! `shutdown()` cancels every in-flight session, refuses new admissions and waits for all
//! session tasks to return. The aggregates stay readable afterwards.

use crate::audio::AudioSource;
use crate::error::{AppError, AppResult};
use crate::session::runner::SessionRunner;
use crate::session::{CorrelationId, FinalStatus, Session, StatusCode, StreamSettings};
use crate::state::EngineState;
use crate::transport::SpeechTransport;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Handle to a dispatched session.
#[derive(Debug)]
pub struct SessionHandle {
    pub correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Arc<Session>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Cancel this session only. It finishes as CANCELLED unless it already completed;
    /// sibling sessions and the pool are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session is finished and take its read-only result.
    pub async fn wait(self) -> AppResult<Arc<Session>> {
        self.receiver.await.map_err(|_| {
            AppError::Internal(format!(
                "session {} ended without reporting a result",
                self.correlation_id
            ))
        })
    }
}

pub struct SessionPool {
    transport: Arc<dyn SpeechTransport>,
    settings: Arc<StreamSettings>,
    state: EngineState,
    permits: Arc<Semaphore>,
    max_concurrent_sessions: usize,
    next_id: AtomicU64,
    cancel: CancellationToken,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create a pool dispatching onto the current tokio runtime.
    ///
    /// Fails if called outside a runtime or with a zero concurrency limit.
    pub fn new(
        transport: Arc<dyn SpeechTransport>,
        settings: StreamSettings,
        max_concurrent_sessions: usize,
    ) -> AppResult<Self> {
        if max_concurrent_sessions == 0 {
            return Err(AppError::ConfigError(
                "max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }

        let runtime = Handle::try_current()
            .map_err(|e| AppError::Internal(format!("no worker runtime available: {}", e)))?;

        info!(max_concurrent_sessions, "Session pool ready");

        Ok(Self {
            transport,
            settings: Arc::new(settings),
            state: EngineState::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_sessions)),
            max_concurrent_sessions,
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            runtime,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Admit a new stream, waiting for a free slot if N sessions are running.
    pub async fn start_new_stream(&self, source: Box<dyn AudioSource>) -> AppResult<SessionHandle> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(shutting_down()),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| shutting_down())?,
        };
        Ok(self.dispatch(source, permit))
    }

    /// Admit a new stream only if a slot is free right now.
    pub fn try_start_new_stream(&self, source: Box<dyn AudioSource>) -> AppResult<SessionHandle> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(AppError::AtCapacity(format!(
                    "{} sessions already running",
                    self.max_concurrent_sessions
                )))
            }
            Err(TryAcquireError::Closed) => return Err(shutting_down()),
        };
        Ok(self.dispatch(source, permit))
    }

    fn dispatch(&self, source: Box<dyn AudioSource>, permit: OwnedSemaphorePermit) -> SessionHandle {
        let correlation_id = CorrelationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(correlation_id, source.label()));
        self.state.admit(session.clone());

        let session_cancel = self.cancel.child_token();
        let runner = SessionRunner::new(
            session.clone(),
            source,
            self.transport.clone(),
            self.settings.clone(),
            self.state.clone(),
            self.cancel.clone(),
            session_cancel.clone(),
        );

        let (sender, receiver) = oneshot::channel();
        let span = info_span!("session", correlation_id = %correlation_id);
        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let watched_cancel = session_cancel.clone();
        let task = self.runtime.spawn(
            async move {
                let session = match runtime.spawn(runner.run().in_current_span()).await {
                    Ok(session) => session,
                    Err(e) => {
                        error!(error = %e, "Session task failed");
                        // Stops a producer that outlived its runner
                        watched_cancel.cancel();
                        let status = FinalStatus::new(
                            StatusCode::Internal,
                            format!("session task failed: {}", e),
                        );
                        state.finish(&session, status, 0.0);
                        session
                    }
                };
                // Counters are already updated, the slot can go to the next stream
                drop(permit);
                let _ = sender.send(session);
            }
            .instrument(span),
        );

        let mut tasks = self.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        debug!(correlation_id = %correlation_id, "Session dispatched");
        SessionHandle {
            correlation_id,
            receiver,
            cancel: session_cancel,
        }
    }

    pub fn num_active_streams(&self) -> u64 {
        self.state.counters().active
    }

    pub fn num_streams_finished(&self) -> u64 {
        self.state.counters().finished
    }

    /// Audio seconds of all successfully completed streams.
    pub fn total_audio_processed(&self) -> f64 {
        self.state.counters().audio_processed_secs
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Token that cancels every session of this pool, for signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every dispatched session to finish without cancelling anything.
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.lock_tasks());
            if tasks.is_empty() {
                return;
            }
            for joined in join_all(tasks).await {
                if let Err(e) = joined {
                    error!(error = %e, "Session task failed");
                }
            }
        }
    }

    /// Cancel all sessions, refuse new ones and wait for every session task to return.
    pub async fn shutdown(&self) {
        info!(active = self.num_active_streams(), "Shutting down session pool");
        self.cancel.cancel();
        self.permits.close();
        self.wait_idle().await;

        let counters = self.state.counters();
        info!(
            finished = counters.finished,
            failed = counters.failed_requests,
            cancelled = counters.cancelled,
            "Session pool stopped"
        );
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutting_down() -> AppError {
    AppError::Cancelled("session pool is shutting down".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioEncoding, AudioFormat, PcmReaderSource, WavData, WavSource};
    use crate::config::AppConfig;
    use crate::session::SessionPhase;
    use crate::transport::mock::{MockBehavior, MockTransport};
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    const CHUNK_BYTES: usize = 3_200; // 100ms of 16kHz mono PCM

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 16_000,
            channels: 1,
            encoding: AudioEncoding::LinearPcm,
        }
    }

    fn wav_source(label: &str, chunks: usize) -> Box<dyn AudioSource> {
        Box::new(WavSource::new(
            Arc::new(WavData {
                filename: label.to_string(),
                format: format(),
                data: vec![0u8; CHUNK_BYTES * chunks],
            }),
            100,
        ))
    }

    /// Silence that never ends, sent at playback speed.
    fn endless_source(label: &str) -> Box<dyn AudioSource> {
        Box::new(PcmReaderSource::new(tokio::io::repeat(0), format(), 100, label))
    }

    fn settings(simulate_realtime: bool) -> StreamSettings {
        let mut config = AppConfig::default();
        config.engine.simulate_realtime = simulate_realtime;
        config.transport.connect_timeout_ms = 2_000;
        StreamSettings::from_config(&config).unwrap()
    }

    fn pool(transport: &Arc<MockTransport>, simulate_realtime: bool, n: usize) -> SessionPool {
        SessionPool::new(transport.clone(), settings(simulate_realtime), n).unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_session_end_to_end() {
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let pool = pool(&transport, false, 1);

        let handle = pool.start_new_stream(wav_source("a.wav", 3)).await.unwrap();
        let session = handle.wait().await.unwrap();

        assert_eq!(session.final_status().map(|s| s.code), Some(StatusCode::Ok));
        assert_eq!(session.phase(), SessionPhase::Finished);
        assert_eq!(transport.stats().half_closes(), 1);
        assert_eq!(transport.stats().requests(), 3);
        assert_eq!(transport.stats().requests_with_config(), 1);
        // Responses 2 and 4 (after the half-close) are finals
        assert_eq!(session.result().finals.len(), 2);
        assert!((pool.total_audio_processed() - 0.3).abs() < 1e-9);
        assert_eq!(pool.num_active_streams(), 0);
        assert_eq!(pool.num_streams_finished(), 1);

        let (sends, receives) = session.timestamps();
        assert_eq!(sends.len(), 3);
        assert!(!receives.is_empty());
        assert!(receives.iter().all(|r| *r >= sends[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limit_one_serializes_sessions() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            response_delay: Duration::from_millis(10),
            ..MockBehavior::default()
        }));
        let pool = pool(&transport, false, 1);

        let first = pool.start_new_stream(wav_source("first.wav", 3)).await.unwrap();
        let second = pool.start_new_stream(wav_source("second.wav", 3)).await.unwrap();
        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();

        let first_finished = first.finished_at().unwrap();
        let second_started = second.streaming_started_at().unwrap();
        assert!(second_started >= first_finished);
        assert_eq!(transport.stats().max_concurrent_open(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_limit_respected() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            response_delay: Duration::from_millis(5),
            ..MockBehavior::default()
        }));
        let pool = Arc::new(pool(&transport, true, 2));

        let sampler_pool = pool.clone();
        let sampling = CancellationToken::new();
        let stop = sampling.clone();
        let sampler = tokio::spawn(async move {
            let mut max_streaming = 0;
            while !stop.is_cancelled() {
                let (active, census) = sampler_pool.state().phase_census();
                let streaming = census.get(&SessionPhase::Streaming).copied().unwrap_or(0)
                    + census.get(&SessionPhase::Draining).copied().unwrap_or(0);
                assert_eq!(active as usize, census.values().sum::<usize>());
                assert!(!census.contains_key(&SessionPhase::Finished));
                max_streaming = max_streaming.max(streaming);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            max_streaming
        });

        let mut handles = Vec::new();
        for i in 0..5 {
            let label = format!("file-{}.wav", i);
            handles.push(pool.start_new_stream(wav_source(&label, 3)).await.unwrap());
            assert!(pool.num_active_streams() <= 2);
        }
        for handle in handles {
            let session = handle.wait().await.unwrap();
            assert!(session.final_status().unwrap().is_ok());
        }

        sampling.cancel();
        let max_streaming = sampler.await.unwrap();
        assert!(max_streaming <= 2);
        assert!(transport.stats().max_concurrent_open() <= 2);

        let counters = pool.state().counters();
        assert_eq!(counters.started, 5);
        assert_eq!(counters.finished, 5);
        assert_eq!(counters.active, 0);
        assert!((counters.audio_processed_secs - 1.5).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_try_start_reports_capacity() {
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let pool = pool(&transport, true, 1);

        let running = pool.try_start_new_stream(endless_source("mic")).unwrap();
        let refused = pool.try_start_new_stream(wav_source("b.wav", 1));
        assert!(matches!(refused, Err(AppError::AtCapacity(_))));

        pool.shutdown().await;
        let session = running.wait().await.unwrap();
        assert_eq!(session.final_status().map(|s| s.code), Some(StatusCode::Cancelled));

        let after = pool.try_start_new_stream(wav_source("c.wav", 1));
        assert!(matches!(after, Err(AppError::Cancelled(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_cancels_every_session() {
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let pool = pool(&transport, true, 3);

        let mut handles = Vec::new();
        for i in 0..3 {
            let label = format!("mic-{}", i);
            handles.push(pool.start_new_stream(endless_source(&label)).await.unwrap());
        }
        wait_until(|| {
            pool.state()
                .phase_census()
                .1
                .get(&SessionPhase::Streaming)
                .copied()
                .unwrap_or(0)
                == 3
        })
        .await;

        let cancelled_at = Instant::now();
        pool.shutdown().await;
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));

        for handle in handles {
            let session = handle.wait().await.unwrap();
            assert_eq!(session.phase(), SessionPhase::Finished);
            assert_eq!(session.final_status().map(|s| s.code), Some(StatusCode::Cancelled));
        }

        let (active, census) = pool.state().phase_census();
        assert_eq!(active, 0);
        assert!(census.is_empty());
        let counters = pool.state().counters();
        assert_eq!(counters.cancelled, 3);
        assert_eq!(counters.audio_processed_secs, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mid_stream_failure_is_isolated() {
        let transport = Arc::new(
            MockTransport::new(MockBehavior {
                response_delay: Duration::from_millis(5),
                ..MockBehavior::default()
            })
            .with_override(
                CorrelationId::new(1),
                MockBehavior {
                    fail_after_requests: Some(2),
                    ..MockBehavior::default()
                },
            ),
        );
        let pool = pool(&transport, true, 2);

        let failing = pool.start_new_stream(wav_source("x.wav", 5)).await.unwrap();
        let healthy = pool.start_new_stream(wav_source("y.wav", 5)).await.unwrap();
        assert_eq!(failing.correlation_id, CorrelationId::new(1));

        let failing = failing.wait().await.unwrap();
        let healthy = healthy.wait().await.unwrap();

        let status = failing.final_status().unwrap();
        assert_eq!(status.code, StatusCode::Unavailable);
        // The failure moved the session to Draining before its audio ran out
        let draining = failing.draining_started_at().unwrap();
        assert!(draining <= failing.finished_at().unwrap());
        assert!(failing.timestamps().0.len() < 5);
        // The final answering request 2 arrived before the failure
        assert!(!failing.result().finals.is_empty());

        assert!(healthy.final_status().unwrap().is_ok());
        let counters = pool.state().counters();
        assert_eq!(counters.failed_requests, 1);
        assert!((counters.audio_processed_secs - 0.5).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_establishment_failure_counts_as_started_and_finished() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            fail_open: true,
            ..MockBehavior::default()
        }));
        let pool = pool(&transport, false, 2);

        let session = pool
            .start_new_stream(wav_source("a.wav", 2))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(session.final_status().map(|s| s.code), Some(StatusCode::Unavailable));
        assert!(session.streaming_started_at().is_none());
        assert!(session.timestamps().0.is_empty());
        assert_eq!(transport.stats().opened(), 0);

        let counters = pool.state().counters();
        assert_eq!(counters.started, 1);
        assert_eq!(counters.finished, 1);
        assert_eq!(counters.failed_requests, 1);
        assert_eq!(counters.active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_ending_early_aborts_session() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            end_after_requests: Some(1),
            ..MockBehavior::default()
        }));
        let pool = pool(&transport, true, 1);

        let session = pool
            .start_new_stream(endless_source("mic"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(session.final_status().map(|s| s.code), Some(StatusCode::Aborted));
        assert_eq!(pool.total_audio_processed(), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiting_submissions_admitted_in_order() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            response_delay: Duration::from_millis(5),
            ..MockBehavior::default()
        }));
        let pool = Arc::new(pool(&transport, false, 1));

        let mut submitters = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            submitters.push(tokio::spawn(async move {
                let handle = pool
                    .start_new_stream(wav_source(&format!("queued-{}", i), 2))
                    .await
                    .unwrap();
                handle.wait().await.unwrap()
            }));
            // Let each submitter reach the admission queue before the next one
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut started: HashMap<String, Instant> = HashMap::new();
        for submitter in submitters {
            let session = submitter.await.unwrap();
            started.insert(session.label().to_string(), session.streaming_started_at().unwrap());
        }
        for i in 1..4 {
            let previous = started[&format!("queued-{}", i - 1)];
            let current = started[&format!("queued-{}", i)];
            assert!(current >= previous);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelling_one_session_spares_its_sibling() {
        let transport = Arc::new(MockTransport::new(MockBehavior {
            response_delay: Duration::from_millis(5),
            ..MockBehavior::default()
        }));
        let pool = pool(&transport, true, 2);

        let target = pool.start_new_stream(endless_source("mic")).await.unwrap();
        let sibling = pool.start_new_stream(wav_source("y.wav", 5)).await.unwrap();
        wait_until(|| transport.stats().opened() == 2).await;

        target.cancel();
        let target = target.wait().await.unwrap();
        let sibling = sibling.wait().await.unwrap();

        assert_eq!(target.final_status().map(|s| s.code), Some(StatusCode::Cancelled));
        assert!(sibling.final_status().unwrap().is_ok());
        assert!(!pool.cancellation_token().is_cancelled());

        let counters = pool.state().counters();
        assert_eq!(counters.cancelled, 1);
        assert_eq!(counters.failed_requests, 0);
        assert!((counters.audio_processed_secs - 0.5).abs() < 1e-6);

        // The pool keeps admitting after a single session was cancelled
        let next = pool.start_new_stream(wav_source("z.wav", 1)).await.unwrap();
        assert!(next.wait().await.unwrap().final_status().unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_session_is_still_finished() {
        let transport = Arc::new(
            MockTransport::new(MockBehavior::default()).with_override(
                CorrelationId::new(1),
                MockBehavior {
                    panic_on_read: true,
                    ..MockBehavior::default()
                },
            ),
        );
        let pool = pool(&transport, false, 1);

        let broken = pool
            .start_new_stream(wav_source("broken.wav", 3))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(broken.final_status().map(|s| s.code), Some(StatusCode::Internal));
        assert_eq!(broken.phase(), SessionPhase::Finished);

        let counters = pool.state().counters();
        assert_eq!(counters.active, 0);
        assert_eq!(counters.finished, 1);
        assert_eq!(counters.failed_requests, 1);
        assert!(pool.state().phase_census().1.is_empty());

        // The permit came back, so a limit of one still admits the next stream
        let next = pool.start_new_stream(wav_source("ok.wav", 1)).await.unwrap();
        assert!(next.wait().await.unwrap().final_status().unwrap().is_ok());
    }

    #[test]
    fn test_pool_requires_a_runtime() {
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let created = SessionPool::new(transport, settings(false), 1);
        assert!(matches!(created, Err(AppError::Internal(_))));
    }
}
