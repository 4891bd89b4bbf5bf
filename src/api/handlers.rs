//! Request handlers for the tracking API.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::actor::{Command, CommandError};
use crate::config;
use crate::gateway::{IngestError, IngestPoint, IngestionGateway};
use crate::hub::SubscriptionHub;
use crate::repo::{RepoError, Repository};
use crate::types::EntityId;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<IngestionGateway>,
    pub hub: Arc<SubscriptionHub>,
    pub repo: Arc<dyn Repository>,
    pub started: Instant,
}

// ============================================================================
// Position ingest
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub vehicle_id: String,
    pub points: Vec<IngestPoint>,
}

/// POST /api/v1/positions
pub async fn ingest_positions(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let admission = std::time::Duration::from_millis(config::get().queue.admission_timeout_ms);
    let deadline = Instant::now() + admission;

    match state
        .gateway
        .ingest(&request.vehicle_id, request.points, Some(deadline))
        .await
    {
        Ok(report) => ApiResponse::ok(report),
        Err(e) => ingest_error_response(e),
    }
}

fn ingest_error_response(error: IngestError) -> Response {
    match error {
        IngestError::InvalidPayload(msg) => {
            ApiErrorResponse::bad_request("INVALID_PAYLOAD", msg)
        }
        IngestError::VehicleUnknown(vehicle) => {
            ApiErrorResponse::not_found("VEHICLE_UNKNOWN", format!("vehicle {vehicle}"))
        }
        IngestError::ShipmentNotActive(vehicle) => ApiErrorResponse::conflict(
            "SHIPMENT_NOT_ACTIVE",
            format!("no active shipment for {vehicle}"),
        ),
        IngestError::NotFound(key) => ApiErrorResponse::not_found("NOT_FOUND", key),
        IngestError::DeadlineExceeded => {
            ApiErrorResponse::deadline_exceeded("admission deadline elapsed")
        }
        IngestError::Storage(msg) => {
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", msg)
        }
    }
}

// ============================================================================
// Shipment query
// ============================================================================

/// GET /api/v1/shipments/:reference
pub async fn get_shipment(
    State(state): State<ApiState>,
    Path(reference): Path<String>,
) -> Response {
    match state.gateway.snapshot_by_reference(&reference).await {
        Ok(snapshot) => ApiResponse::ok(snapshot),
        Err(e) => ingest_error_response(e),
    }
}

// ============================================================================
// Reroute commands
// ============================================================================

fn command_error_response(error: CommandError) -> Response {
    match error {
        CommandError::NotFound => ApiErrorResponse::not_found("NOT_FOUND", "no such entity"),
        CommandError::StateConflict(msg) => ApiErrorResponse::conflict("STATE_CONFLICT", msg),
        CommandError::RoutingUnavailable(msg) => {
            ApiErrorResponse::service_unavailable("ROUTING_UNAVAILABLE", msg)
        }
        CommandError::Storage(msg) => {
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", msg)
        }
    }
}

#[derive(Debug, Serialize)]
struct ProposeResponse {
    proposed: bool,
    reroute_id: Option<EntityId>,
    time_saved_min: Option<f64>,
}

/// POST /api/v1/shipments/:id/reroute — explicit evaluation trigger.
pub async fn propose_reroute(
    State(state): State<ApiState>,
    Path(shipment_id): Path<EntityId>,
) -> Response {
    let handle = match state.gateway.ensure_actor(shipment_id).await {
        Ok(handle) => handle,
        Err(e) => return ingest_error_response(e),
    };

    let (reply, rx) = oneshot::channel();
    handle.send_command(Command::ProposeReroute { reply });
    match rx.await {
        Ok(Ok(Some(reroute))) => ApiResponse::ok(ProposeResponse {
            proposed: true,
            reroute_id: Some(reroute.id),
            time_saved_min: Some(reroute.projected_saving_min),
        }),
        Ok(Ok(None)) => ApiResponse::ok(ProposeResponse {
            proposed: false,
            reroute_id: None,
            time_saved_min: None,
        }),
        Ok(Err(e)) => command_error_response(e),
        Err(_) => {
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", "actor unavailable")
        }
    }
}

async fn reroute_command(
    state: &ApiState,
    reroute_id: EntityId,
    accept: bool,
) -> Response {
    // The reroute record names its shipment; the command is serialized
    // through that shipment's actor.
    let reroute = match state.repo.get_reroute(reroute_id).await {
        Ok(reroute) => reroute,
        Err(RepoError::NotFound { .. }) => {
            return ApiErrorResponse::not_found("NOT_FOUND", format!("reroute {reroute_id}"));
        }
        Err(e) => {
            return ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", e.to_string());
        }
    };

    let handle = match state.gateway.ensure_actor(reroute.shipment_id).await {
        Ok(handle) => handle,
        Err(e) => return ingest_error_response(e),
    };

    let (reply, rx) = oneshot::channel();
    let command = if accept {
        Command::AcceptReroute { reroute_id, reply }
    } else {
        Command::RejectReroute { reroute_id, reply }
    };
    handle.send_command(command);

    match rx.await {
        Ok(Ok(())) => ApiResponse::ok(serde_json::json!({
            "reroute_id": reroute_id,
            "status": if accept { "accepted" } else { "rejected" },
        })),
        Ok(Err(e)) => command_error_response(e),
        Err(_) => {
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", "actor unavailable")
        }
    }
}

/// POST /api/v1/reroutes/:id/accept
pub async fn accept_reroute(
    State(state): State<ApiState>,
    Path(reroute_id): Path<EntityId>,
) -> Response {
    reroute_command(&state, reroute_id, true).await
}

/// POST /api/v1/reroutes/:id/reject
pub async fn reject_reroute(
    State(state): State<ApiState>,
    Path(reroute_id): Path<EntityId>,
) -> Response {
    reroute_command(&state, reroute_id, false).await
}

// ============================================================================
// Manual operational events
// ============================================================================

/// Operational inputs reported by dispatch or the driver app.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationalEvent {
    /// Feeds the VEHICLE_ISSUE delay cause.
    VehicleIssue { description: String },
    /// Feeds the DRIVER_HOS_RISK delay cause.
    ShiftStart { at: DateTime<Utc> },
}

/// POST /api/v1/shipments/:id/events
pub async fn report_event(
    State(state): State<ApiState>,
    Path(shipment_id): Path<EntityId>,
    Json(event): Json<OperationalEvent>,
) -> Response {
    let handle = match state.gateway.ensure_actor(shipment_id).await {
        Ok(handle) => handle,
        Err(e) => return ingest_error_response(e),
    };

    match event {
        OperationalEvent::VehicleIssue { description } => {
            if description.trim().is_empty() {
                return ApiErrorResponse::bad_request(
                    "INVALID_PAYLOAD",
                    "description must be non-empty",
                );
            }
            handle.send_command(Command::ReportVehicleEvent {
                description,
                at: Utc::now(),
            });
        }
        OperationalEvent::ShiftStart { at } => {
            handle.send_command(Command::SetShiftStart { at });
        }
    }
    ApiResponse::ok(serde_json::json!({"accepted": true}))
}

/// POST /api/v1/shipments/:id/cancel
pub async fn cancel_shipment(
    State(state): State<ApiState>,
    Path(shipment_id): Path<EntityId>,
) -> Response {
    let handle = match state.gateway.ensure_actor(shipment_id).await {
        Ok(handle) => handle,
        Err(e) => return ingest_error_response(e),
    };
    let (reply, rx) = oneshot::channel();
    handle.send_command(Command::Cancel { reply });
    match rx.await {
        Ok(Ok(())) => ApiResponse::ok(serde_json::json!({"status": "cancelled"})),
        Ok(Err(e)) => command_error_response(e),
        Err(_) => {
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", "actor unavailable")
        }
    }
}

// ============================================================================
// Health & stats
// ============================================================================

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
    }))
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> Response {
    let gateway = state.gateway.stats().await;
    ApiResponse::ok(serde_json::json!({
        "gateway": gateway,
        "hub": {
            "topics": state.hub.topic_count(),
            "published": state.hub.published_total(),
        },
    }))
}

/// GET /api/v1/shipments/:id/events — recent audit trail.
pub async fn recent_events(
    State(state): State<ApiState>,
    Path(shipment_id): Path<EntityId>,
) -> Response {
    match state.repo.recent_events(shipment_id, 100).await {
        Ok(events) => ApiResponse::ok(events),
        Err(e) => {
            warn!(shipment_id, error = %e, "Event query failed");
            ApiErrorResponse::service_unavailable("SERVICE_UNAVAILABLE", e.to_string())
        }
    }
}
