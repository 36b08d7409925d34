//! Relay Scheduler - HTTP control API

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use relay_engine::{
    persistence::JsonRuleStore, ActuatorId, EngineConfig, EngineError, SchedulerService,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod rules;
mod simulator;
mod websocket;

use relay_engine::memory::MemoryActuators;
use simulator::SimulatedSensor;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SchedulerService<JsonRuleStore>>,
    pub store: Arc<JsonRuleStore>,
}

/// API response wrapper using serde_json::Value for flexibility
#[derive(Serialize)]
pub struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// HTTP status for an engine error
pub fn error_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Configuration(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning | EngineError::NotRunning => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn an engine result into a status code and envelope
pub fn respond<T: Serialize>(result: Result<T, EngineError>) -> (StatusCode, Json<ApiResponse>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Log query parameters
#[derive(Deserialize)]
struct LogQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Engine status snapshot
async fn engine_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.get_status()))
}

/// Start the engine
async fn engine_start(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.start().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(state.engine.get_status())),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Stop the engine; actuators keep their last level
async fn engine_stop(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.stop().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(state.engine.get_status())),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Stop and re-init the engine
async fn engine_restart(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.restart().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(state.engine.get_status())),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Confirmed state of every driven actuator
async fn list_actuators(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.actuator_states()))
}

/// Armed deactivations
async fn pending_deactivations(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.pending_deactivations()))
}

/// Turn actuator on
async fn actuator_on(
    State(state): State<AppState>,
    Path(actuator_id): Path<ActuatorId>,
) -> impl IntoResponse {
    set_actuator(&state, actuator_id, true).await
}

/// Turn actuator off
async fn actuator_off(
    State(state): State<AppState>,
    Path(actuator_id): Path<ActuatorId>,
) -> impl IntoResponse {
    set_actuator(&state, actuator_id, false).await
}

async fn set_actuator(
    state: &AppState,
    actuator_id: ActuatorId,
    level: bool,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        state
            .engine
            .set_actuator(actuator_id, level)
            .await
            .map(|()| {
                serde_json::json!({
                    "action": if level { "on" } else { "off" },
                    "actuator_id": actuator_id
                })
            }),
    )
}

/// Recent audit records, newest last
async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    Json(ApiResponse::success(state.store.recent_logs(query.limit)))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_api=debug,relay_engine=debug,info".into()),
        )
        .init();

    tracing::info!("Starting Relay Scheduler API server");

    let config = EngineConfig::from_env();
    let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let bind = std::env::var("RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let addr: SocketAddr = bind.parse()?;

    tracing::info!(
        "{} actuators, polling sensors every {:?}",
        config.actuator_count,
        config.poll_interval()
    );

    let store = Arc::new(JsonRuleStore::new(&PathBuf::from(&data_dir)));
    tracing::info!("Rules stored in {:?}", store.path());

    let actuators = Arc::new(MemoryActuators::new(config.actuator_count));
    let sensor = Arc::new(SimulatedSensor::new());
    let engine = Arc::new(SchedulerService::new(
        config,
        actuators,
        sensor,
        Arc::clone(&store),
    ));

    // Rules that cannot be loaded are fatal
    engine.init().await?;

    let state = AppState {
        engine: Arc::clone(&engine),
        store,
    };

    // Build the router
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(engine_status))
        .route("/api/v1/engine/start", post(engine_start))
        .route("/api/v1/engine/stop", post(engine_stop))
        .route("/api/v1/engine/restart", post(engine_restart))
        .route(
            "/api/v1/schedules",
            get(rules::list_schedules).post(rules::create_schedule),
        )
        .route(
            "/api/v1/schedules/:id",
            put(rules::update_schedule).delete(rules::delete_schedule),
        )
        .route("/api/v1/schedules/:id/enable", post(rules::enable_schedule))
        .route("/api/v1/schedules/:id/disable", post(rules::disable_schedule))
        .route(
            "/api/v1/conditions",
            get(rules::list_conditions).post(rules::create_condition),
        )
        .route(
            "/api/v1/conditions/:id",
            put(rules::update_condition).delete(rules::delete_condition),
        )
        .route("/api/v1/conditions/:id/enable", post(rules::enable_condition))
        .route(
            "/api/v1/conditions/:id/disable",
            post(rules::disable_condition),
        )
        .route("/api/v1/actuators", get(list_actuators))
        .route("/api/v1/actuators/pending", get(pending_deactivations))
        .route("/api/v1/actuators/:id/on", post(actuator_on))
        .route("/api/v1/actuators/:id/off", post(actuator_off))
        .route("/api/v1/logs", get(recent_logs))
        // WebSocket
        .route("/ws", get(ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.stop().await?;
    tracing::info!("Relay Scheduler stopped");
    Ok(())
}
