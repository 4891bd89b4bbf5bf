//! HTTP + WebSocket surface of the tracking engine.
//!
//! Endpoints:
//! - `POST /api/v1/positions` — position batch ingest
//! - `GET  /api/v1/shipments/:reference` — shipment snapshot
//! - `POST /api/v1/shipments/:id/reroute` — explicit reroute trigger
//! - `POST /api/v1/shipments/:id/events` — manual operational inputs
//! - `POST /api/v1/reroutes/:id/accept|reject` — proposal commands
//! - `GET  /ws` — subscription push channel
//! - `GET  /health`, `GET /api/v1/stats` — liveness and counters

pub mod envelope;
mod handlers;
mod routes;
mod ws;

pub use handlers::ApiState;
pub use routes::create_app;
