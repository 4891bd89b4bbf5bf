//! RoutePulse: Real-Time Shipment Tracking
//!
//! Stateful tracking engine for commercial last-mile and long-haul fleets.
//!
//! ## Architecture
//!
//! - **Ingestion Gateway**: admits position batches and routes them to actors
//! - **Shipment Actor**: per-shipment serialized state machine (snap, ETA,
//!   classification, reroute) — independent shipments run in parallel
//! - **Road Snapper**: projects fixes onto the active route, rejects outliers
//! - **ETA Estimator**: per-stop residuals with EWMA smoothing and confidence
//! - **Delay Classifier**: one advisory per pass from traffic/weather/ops signals
//! - **Reroute Evaluator**: scores alternatives, manages proposal lifecycle
//! - **Subscription Hub**: bounded per-topic fan-out to WebSocket sessions

pub mod actor;
pub mod api;
pub mod classify;
pub mod clock;
pub mod config;
pub mod eta;
pub mod gateway;
pub mod geo;
pub mod hub;
pub mod repo;
pub mod reroute;
pub mod routing;
pub mod signals;
pub mod snap;
pub mod types;

// Re-export configuration
pub use config::ServiceConfig;

// Re-export commonly used types
pub use types::{
    Advisory, ConfidenceBucket, Coordinate, EtaSample, Position, ReasonCode, Reroute,
    RerouteStatus, Route, Severity, Shipment, ShipmentEvent, ShipmentSnapshot, ShipmentStatus,
    SnappedPoint, Stop, TruckProfile,
};

// Re-export the engine seams
pub use actor::{ActorContext, ActorHandle, ShipmentActor};
pub use gateway::IngestionGateway;
pub use hub::SubscriptionHub;
pub use repo::{RepoError, Repository, SledRepository};
pub use routing::{RoutingClient, RoutingError};
