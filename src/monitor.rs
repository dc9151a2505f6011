//! # Monitor Endpoint
//!
//! Optional HTTP server exposing live pool statistics while sessions run.
//!
//! ## Routes:
//! - `GET /health`: liveness plus the session counters (503 once the pool shuts down)
//! - `GET /api/v1/stats`: counters, live sessions per phase and the current latency summary
//!
//! Handlers only read snapshot copies of the aggregates, so polling the monitor never
//! stalls a session.

use crate::config::MonitorConfig;
use crate::error::{AppError, AppResult};
use crate::state::EngineState;
use crate::stats::StatsReporter;
use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;

/// Shared with every request handler.
#[derive(Clone)]
pub struct MonitorState {
    pub engine: EngineState,
    pub max_concurrent_sessions: usize,
    pub server_uri: String,
    pub shutdown: CancellationToken,
}

pub async fn health_check(state: web::Data<MonitorState>) -> AppResult<HttpResponse> {
    if state.shutdown.is_cancelled() {
        return Err(AppError::Cancelled("session pool is shutting down".to_string()));
    }
    let counters = state.engine.counters();

    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.engine.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "server_uri": state.server_uri,
        },
        "sessions": {
            "active": counters.active,
            "finished": counters.finished,
            "failed": counters.failed_requests,
            "limit": state.max_concurrent_sessions,
        }
    })))
}

pub async fn pool_stats(state: web::Data<MonitorState>) -> HttpResponse {
    let counters = state.engine.counters();
    let (_, census) = state.engine.phase_census();
    let phases: serde_json::Map<String, serde_json::Value> = census
        .into_iter()
        .map(|(phase, count)| (phase.as_str().to_string(), json!(count)))
        .collect();
    let report = StatsReporter::new(state.engine.clone()).report();
    let uptime_seconds = state.engine.uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "counters": counters,
        "phases": phases,
        "throughput_rtfx": if uptime_seconds > 0 {
            counters.audio_processed_secs / uptime_seconds as f64
        } else {
            0.0
        },
        "latency_ms": report,
    }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(web::scope("/api/v1").route("/stats", web::get().to(pool_stats)));
}

/// Start the monitor server; it stops when `cancel` fires.
pub fn spawn_monitor(
    config: &MonitorConfig,
    state: MonitorState,
    cancel: CancellationToken,
) -> AppResult<JoinHandle<()>> {
    let bind_addr = format!("{}:{}", config.host, config.port);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET"])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(configure_routes)
    })
    .workers(1)
    .disable_signals() // shutdown follows the pool's cancellation token
    .bind(&bind_addr)
    .map_err(|e| AppError::Io(format!("cannot bind monitor to {}: {}", bind_addr, e)))?
    .run();

    info!("Monitor listening on http://{}", bind_addr);

    let handle = server.handle();
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("Monitor server error: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                handle.stop(true).await;
                info!("Monitor stopped");
            }
        }
    }))
}
