//! Schedule and condition management endpoints
//!
//! Every successful change is persisted first; a running engine then restarts
//! so the new rule set takes effect.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use relay_engine::{ConditionRequest, ScheduleRequest};

use crate::{respond, AppState};

/// List all schedules
pub async fn list_schedules(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.engine.list_schedules().await)
}

/// Create a schedule
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    respond(state.engine.create_schedule(req).await)
}

/// Replace a schedule
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    respond(state.engine.update_schedule(&id, req).await)
}

/// Delete a schedule
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(
        state
            .engine
            .delete_schedule(&id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}

pub async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.engine.set_schedule_enabled(&id, true).await)
}

pub async fn disable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.engine.set_schedule_enabled(&id, false).await)
}

/// List all conditions
pub async fn list_conditions(State(state): State<AppState>) -> impl IntoResponse {
    respond(state.engine.list_conditions().await)
}

/// Create a condition
pub async fn create_condition(
    State(state): State<AppState>,
    Json(req): Json<ConditionRequest>,
) -> impl IntoResponse {
    respond(state.engine.create_condition(req).await)
}

/// Replace a condition
pub async fn update_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConditionRequest>,
) -> impl IntoResponse {
    respond(state.engine.update_condition(&id, req).await)
}

/// Delete a condition
pub async fn delete_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(
        state
            .engine
            .delete_condition(&id)
            .await
            .map(|()| serde_json::json!({ "deleted": id })),
    )
}

pub async fn enable_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.engine.set_condition_enabled(&id, true).await)
}

pub async fn disable_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.engine.set_condition_enabled(&id, false).await)
}
