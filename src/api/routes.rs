//! API route definitions.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{self, ApiState};
use super::ws;

/// Build the application router.
pub fn create_app(state: ApiState) -> Router {
    let api = Router::new()
        .route("/positions", post(handlers::ingest_positions))
        .route("/shipments/:shipment", get(handlers::get_shipment))
        .route("/shipments/:shipment/reroute", post(handlers::propose_reroute))
        .route(
            "/shipments/:shipment/events",
            get(handlers::recent_events).post(handlers::report_event),
        )
        .route("/shipments/:shipment/cancel", post(handlers::cancel_shipment))
        .route("/reroutes/:reroute/accept", post(handlers::accept_reroute))
        .route("/reroutes/:reroute/reject", post(handlers::reject_reroute))
        .route("/stats", get(handlers::stats));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(handlers::health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
