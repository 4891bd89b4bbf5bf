//! Ingestion gateway: admits position batches and routes them to the
//! owning shipment actor.
//!
//! The gateway validates payloads, resolves the vehicle's active shipment,
//! spawns actors on demand, and forwards batches through each actor's
//! bounded drop-oldest queue. It never blocks inbound traffic: enqueueing
//! is lock-and-push, and a caller whose deadline already elapsed is
//! rejected before any work happens.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actor::{ActorContext, ActorHandle, ShipmentActor};
use crate::config;
use crate::repo::RepoError;
use crate::types::{Coordinate, EntityId, Position, ShipmentSnapshot, StopView};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("vehicle unknown: {0}")]
    VehicleUnknown(String),

    #[error("no active shipment for vehicle {0}")]
    ShipmentNotActive(String),

    #[error("deadline exceeded before admission")]
    DeadlineExceeded,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    Storage(String),
}

/// One point of an ingest batch, as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestPoint {
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    pub accuracy: f64,
}

/// Admission outcome returned to the caller.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IngestReport {
    pub admitted: usize,
    pub dropped: usize,
    /// Reason -> count for everything not admitted.
    pub drop_reasons: BTreeMap<String, usize>,
}

impl IngestReport {
    fn note_drop(&mut self, reason: &str) {
        self.dropped += 1;
        *self.drop_reasons.entry(reason.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Default)]
struct GatewayCounters {
    batches: AtomicU64,
    admitted: AtomicU64,
    dropped: AtomicU64,
    displaced: AtomicU64,
}

/// Gateway stats for the observability endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub batches: u64,
    pub admitted: u64,
    pub dropped: u64,
    pub displaced: u64,
    pub live_actors: usize,
}

pub struct IngestionGateway {
    ctx: ActorContext,
    actors: RwLock<HashMap<EntityId, ActorHandle>>,
    cancel: CancellationToken,
    counters: GatewayCounters,
}

impl IngestionGateway {
    pub fn new(ctx: ActorContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            actors: RwLock::new(HashMap::new()),
            cancel,
            counters: GatewayCounters::default(),
        }
    }

    /// Validate, resolve, and forward one position batch.
    pub async fn ingest(
        &self,
        vehicle_id: &str,
        points: Vec<IngestPoint>,
        deadline: Option<Instant>,
    ) -> Result<IngestReport, IngestError> {
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            return Err(IngestError::DeadlineExceeded);
        }
        if vehicle_id.is_empty() || !vehicle_id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(IngestError::InvalidPayload(
                "vehicle_id must be non-empty printable ASCII".to_string(),
            ));
        }
        if points.is_empty() {
            return Err(IngestError::InvalidPayload("points must be non-empty".to_string()));
        }

        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        let now = self.ctx.clock.now();
        let mut report = IngestReport::default();
        let mut valid = Vec::with_capacity(points.len());
        for point in points {
            match validate_point(&point, now) {
                Ok(()) => valid.push(Position {
                    vehicle_id: vehicle_id.to_string(),
                    ts: point.ts,
                    coordinate: Coordinate::new(point.lat, point.lon),
                    speed_mps: point.speed,
                    accuracy_m: point.accuracy,
                    source: "ingest".to_string(),
                }),
                Err(reason) => report.note_drop(reason),
            }
        }
        if valid.is_empty() {
            self.counters
                .dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            return Ok(report);
        }

        let shipment = match self.ctx.repo.active_shipment_for_vehicle(vehicle_id).await {
            Ok(shipment) => shipment,
            Err(RepoError::NotFound { entity, .. }) if entity == "vehicle" => {
                return Err(IngestError::VehicleUnknown(vehicle_id.to_string()));
            }
            Err(RepoError::NotFound { .. }) => {
                return Err(IngestError::ShipmentNotActive(vehicle_id.to_string()));
            }
            Err(e) => return Err(IngestError::Storage(e.to_string())),
        };

        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            return Err(IngestError::DeadlineExceeded);
        }

        let handle = self.ensure_actor(shipment.id).await?;
        let outcome = handle.enqueue_positions(valid);
        report.admitted = outcome.queued;
        if outcome.displaced > 0 {
            // Freshness beats completeness: the queue keeps the newest fixes.
            report.drop_reasons
                .entry("queue_overflow_displaced".to_string())
                .and_modify(|c| *c += outcome.displaced as usize)
                .or_insert(outcome.displaced as usize);
            self.counters
                .displaced
                .fetch_add(outcome.displaced, Ordering::Relaxed);
            warn!(
                vehicle_id,
                shipment_id = shipment.id,
                displaced = outcome.displaced,
                "Inbound queue overflow, oldest fixes displaced"
            );
        }

        self.counters
            .admitted
            .fetch_add(report.admitted as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        debug!(
            vehicle_id,
            shipment_id = shipment.id,
            admitted = report.admitted,
            dropped = report.dropped,
            "Batch admitted"
        );
        Ok(report)
    }

    /// Get the live actor for a shipment, spawning one when needed.
    pub async fn ensure_actor(&self, shipment_id: EntityId) -> Result<ActorHandle, IngestError> {
        {
            let actors = self.actors.read().await;
            if let Some(handle) = actors.get(&shipment_id) {
                if !handle.is_done() {
                    return Ok(handle.clone());
                }
            }
        }

        let mut actors = self.actors.write().await;
        // Re-check under the write lock; reap finished handles while here.
        actors.retain(|_, handle| !handle.is_done());
        if let Some(handle) = actors.get(&shipment_id) {
            return Ok(handle.clone());
        }

        let handle = ShipmentActor::spawn(
            self.ctx.clone(),
            shipment_id,
            self.cancel.child_token(),
        )
        .await
        .map_err(|e| match e {
            RepoError::NotFound { .. } => IngestError::ShipmentNotActive(shipment_id.to_string()),
            other => IngestError::Storage(other.to_string()),
        })?;
        info!(shipment_id, "Actor spawned on demand");
        actors.insert(shipment_id, handle.clone());
        Ok(handle)
    }

    /// Live actor handle, if one exists and is still running.
    pub async fn live_actor(&self, shipment_id: EntityId) -> Option<ActorHandle> {
        let actors = self.actors.read().await;
        actors
            .get(&shipment_id)
            .filter(|handle| !handle.is_done())
            .cloned()
    }

    /// Shipment snapshot: from the live actor when one is running, else
    /// reconstructed from the store (completed/cancelled shipments).
    pub async fn snapshot_by_reference(
        &self,
        reference: &str,
    ) -> Result<ShipmentSnapshot, IngestError> {
        let shipment = match self.ctx.repo.get_shipment_by_reference(reference).await {
            Ok(shipment) => shipment,
            Err(RepoError::NotFound { .. }) => {
                return Err(IngestError::NotFound(reference.to_string()));
            }
            Err(e) => return Err(IngestError::Storage(e.to_string())),
        };

        if !shipment.status.is_terminal() {
            if let Some(handle) = self.live_actor(shipment.id).await {
                if let Ok(snapshot) = handle.snapshot().await {
                    return Ok(snapshot);
                }
            }
        }

        // Cold path: assemble from persisted state.
        let stops = self
            .ctx
            .repo
            .get_stops(shipment.id)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;
        let etas = self
            .ctx
            .repo
            .latest_eta_samples(shipment.id)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;
        let advisory = self
            .ctx
            .repo
            .get_advisory(shipment.id)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        let stops = stops
            .into_iter()
            .map(|stop| {
                let eta = etas.iter().find(|e| e.stop_id == stop.id).cloned();
                StopView { stop, eta }
            })
            .collect();
        Ok(ShipmentSnapshot {
            shipment,
            stops,
            advisory,
            last_snapped: None,
            residual_percent: 0.0,
        })
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            displaced: self.counters.displaced.load(Ordering::Relaxed),
            live_actors: self.actors.read().await.len(),
        }
    }
}

/// Per-point admission checks: coordinate ranges, timestamp window,
/// accuracy bound presence.
fn validate_point(point: &IngestPoint, now: DateTime<Utc>) -> Result<(), &'static str> {
    let cfg = config::get();
    let coordinate = Coordinate::new(point.lat, point.lon);
    if !coordinate.in_range() {
        return Err("coordinate_out_of_range");
    }
    if !point.accuracy.is_finite() || point.accuracy <= 0.0 {
        return Err("accuracy_missing");
    }
    if point.ts < now - Duration::seconds(cfg.position.max_age_secs) {
        return Err("timestamp_too_old");
    }
    if point.ts > now + Duration::seconds(cfg.position.max_skew_secs) {
        return Err("timestamp_in_future");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: DateTime<Utc>, lat: f64, lon: f64, accuracy: f64) -> IngestPoint {
        IngestPoint {
            ts,
            lat,
            lon,
            speed: Some(16.0),
            accuracy,
        }
    }

    #[test]
    fn test_validate_point_ranges() {
        let now = Utc::now();
        assert!(validate_point(&point(now, 30.0, -94.0, 10.0), now).is_ok());
        assert_eq!(
            validate_point(&point(now, 91.0, -94.0, 10.0), now).unwrap_err(),
            "coordinate_out_of_range"
        );
        assert_eq!(
            validate_point(&point(now, 30.0, -94.0, 0.0), now).unwrap_err(),
            "accuracy_missing"
        );
        assert_eq!(
            validate_point(&point(now, 30.0, -94.0, f64::NAN), now).unwrap_err(),
            "accuracy_missing"
        );
    }

    #[test]
    fn test_validate_point_time_window() {
        let now = Utc::now();
        // Within one day back and five minutes forward.
        assert!(validate_point(&point(now - Duration::hours(23), 30.0, -94.0, 10.0), now).is_ok());
        assert!(validate_point(&point(now + Duration::minutes(4), 30.0, -94.0, 10.0), now).is_ok());
        assert_eq!(
            validate_point(&point(now - Duration::hours(25), 30.0, -94.0, 10.0), now).unwrap_err(),
            "timestamp_too_old"
        );
        assert_eq!(
            validate_point(&point(now + Duration::minutes(6), 30.0, -94.0, 10.0), now).unwrap_err(),
            "timestamp_in_future"
        );
    }

    #[test]
    fn test_report_aggregates_reasons() {
        let mut report = IngestReport::default();
        report.note_drop("timestamp_too_old");
        report.note_drop("timestamp_too_old");
        report.note_drop("accuracy_missing");
        assert_eq!(report.dropped, 3);
        assert_eq!(report.drop_reasons["timestamp_too_old"], 2);
        assert_eq!(report.drop_reasons["accuracy_missing"], 1);
    }
}
