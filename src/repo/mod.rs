//! Persistence contract for shipments, stops, positions, routes, reroutes,
//! advisories, ETA samples, and the audit event log.
//!
//! The repository is the only durable state in the engine. Mutations within
//! one shipment are already serialized by its actor; cross-shipment
//! contention is handled here with per-entity atomicity and optimistic
//! concurrency (`RepoError::Conflict` means re-read and retry).

mod sled_repo;

pub use sled_repo::SledRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    Advisory, EntityId, EtaSample, Reroute, RerouteStatus, Route, Shipment, SnappedPoint, Stop,
};

/// Error classes the callers distinguish.
#[derive(Debug, Error)]
pub enum RepoError {
    /// Temporary failure; retry with backoff.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    /// Optimistic-concurrency violation; re-read and retry.
    #[error("Conflict on {entity}: {detail}")]
    Conflict { entity: &'static str, detail: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl RepoError {
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        RepoError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Transient(_))
    }
}

impl From<sled::Error> for RepoError {
    fn from(err: sled::Error) -> Self {
        RepoError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Transient(format!("serialization: {err}"))
    }
}

/// Audit log entry, append-only.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub shipment_id: EntityId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Narrow persistence contract consumed by the tracking engine.
///
/// All operations are atomic at the single-entity level; the two
/// multi-entity operations (`insert_reroute` superseding an old proposal,
/// `replace_active_route_with_reroute`) are atomic as a whole.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Shipments ---
    async fn get_shipment_by_id(&self, id: EntityId) -> Result<Shipment, RepoError>;
    async fn get_shipment_by_reference(&self, reference: &str) -> Result<Shipment, RepoError>;
    async fn list_active_shipments(&self) -> Result<Vec<Shipment>, RepoError>;
    /// The single active (pending or in-transit) shipment for a vehicle.
    async fn active_shipment_for_vehicle(&self, vehicle_id: &str) -> Result<Shipment, RepoError>;
    /// Seed a shipment with its stops (demo/launcher/test inlet).
    async fn insert_shipment(&self, shipment: &Shipment, stops: &[Stop]) -> Result<(), RepoError>;
    /// CAS update keyed on `shipment.version - 1`; bumps version on success.
    async fn update_shipment(&self, shipment: &Shipment) -> Result<(), RepoError>;

    // --- Positions ---
    /// Append snapped positions, idempotent per `(vehicle_id, ts)`.
    /// Returns the count of newly persisted points.
    async fn append_positions(
        &self,
        vehicle_id: &str,
        points: &[SnappedPoint],
    ) -> Result<usize, RepoError>;

    // --- Stops ---
    async fn get_stops(&self, shipment_id: EntityId) -> Result<Vec<Stop>, RepoError>;
    async fn update_stop_actual(
        &self,
        stop_id: EntityId,
        arrival: Option<DateTime<Utc>>,
        departure: Option<DateTime<Utc>>,
        completed: bool,
    ) -> Result<(), RepoError>;

    // --- Routes ---
    async fn insert_route(&self, route: &Route) -> Result<(), RepoError>;
    async fn get_route(&self, route_id: EntityId) -> Result<Route, RepoError>;
    async fn get_active_route(&self, shipment_id: EntityId) -> Result<Route, RepoError>;
    /// Atomically: mark the reroute accepted, expire any other proposals for
    /// the shipment, and swap the shipment's active route to the reroute's
    /// new route. Returns the new active route.
    async fn replace_active_route_with_reroute(
        &self,
        shipment_id: EntityId,
        reroute_id: EntityId,
    ) -> Result<Route, RepoError>;

    // --- Reroutes ---
    /// Insert a proposal; any prior still-proposed reroute for the shipment
    /// transitions to `Expired` in the same operation.
    async fn insert_reroute(&self, reroute: &Reroute) -> Result<(), RepoError>;
    async fn get_reroute(&self, id: EntityId) -> Result<Reroute, RepoError>;
    async fn proposed_reroute(&self, shipment_id: EntityId)
        -> Result<Option<Reroute>, RepoError>;
    async fn update_reroute_status(
        &self,
        id: EntityId,
        status: RerouteStatus,
    ) -> Result<(), RepoError>;

    // --- Advisories ---
    /// Replace the active advisory; the previous one is superseded.
    async fn upsert_advisory(
        &self,
        shipment_id: EntityId,
        advisory: &Advisory,
    ) -> Result<(), RepoError>;
    async fn get_advisory(&self, shipment_id: EntityId) -> Result<Option<Advisory>, RepoError>;

    // --- ETA samples ---
    /// Persist samples and update the per-stop latest view (EWMA restart
    /// continuity reads the latest view back on actor boot).
    async fn append_eta_samples(&self, samples: &[EtaSample]) -> Result<(), RepoError>;
    async fn latest_eta_samples(
        &self,
        shipment_id: EntityId,
    ) -> Result<Vec<EtaSample>, RepoError>;

    // --- Audit events ---
    async fn insert_event(
        &self,
        shipment_id: EntityId,
        kind: &str,
        payload: serde_json::Value,
        ts: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn recent_events(
        &self,
        shipment_id: EntityId,
        limit: usize,
    ) -> Result<Vec<EventRecord>, RepoError>;

    // --- Id seeding ---
    /// Highest entity id ever allocated, for seeding the id generator.
    async fn max_allocated_id(&self) -> Result<EntityId, RepoError>;
}
