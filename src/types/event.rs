//! Typed event union pushed to subscribers.
//!
//! Event names are part of the wire contract; within one shipment, events
//! reach each subscriber in publish order. There is no cross-shipment
//! ordering guarantee.

use serde::{Deserialize, Serialize};

use super::{Advisory, Coordinate, EntityId, EtaSample, ReasonCode, Severity};

/// Compact route summary embedded in `reroute_accepted` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub route_id: EntityId,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub source: String,
}

/// Server-to-client event for one shipment topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ShipmentEvent {
    /// Composite update after each accepted position.
    PositionUpdate {
        shipment_id: EntityId,
        snapped: Coordinate,
        progress: f64,
        residual_percent: f64,
        per_stop_etas: Vec<EtaSample>,
        advisory: Option<Advisory>,
    },
    /// A reroute proposal awaits acceptance.
    RerouteSuggested {
        shipment_id: EntityId,
        reroute_id: EntityId,
        time_saved_min: f64,
        reason: String,
    },
    /// A proposal was accepted and the active route replaced.
    RerouteAccepted {
        shipment_id: EntityId,
        reroute_id: EntityId,
        new_route_summary: RouteSummary,
        stops_with_new_etas: Vec<EtaSample>,
    },
    /// The active advisory changed (reason or severity).
    AdvisoryChanged {
        shipment_id: EntityId,
        reason_code: ReasonCode,
        confidence: f64,
        explanation: String,
        severity: Severity,
    },
    /// Subscriber overflow marker; `dropped` events were discarded.
    /// Clients should refetch the shipment snapshot.
    Lagged { shipment_id: EntityId, dropped: u64 },
    /// Position persistence is degraded; updates continue from memory.
    StorageDegraded { shipment_id: EntityId, buffered: usize },
}

impl ShipmentEvent {
    pub fn shipment_id(&self) -> EntityId {
        match self {
            ShipmentEvent::PositionUpdate { shipment_id, .. }
            | ShipmentEvent::RerouteSuggested { shipment_id, .. }
            | ShipmentEvent::RerouteAccepted { shipment_id, .. }
            | ShipmentEvent::AdvisoryChanged { shipment_id, .. }
            | ShipmentEvent::Lagged { shipment_id, .. }
            | ShipmentEvent::StorageDegraded { shipment_id, .. } => *shipment_id,
        }
    }

    /// Wire name of the event, for audit logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ShipmentEvent::PositionUpdate { .. } => "position_update",
            ShipmentEvent::RerouteSuggested { .. } => "reroute_suggested",
            ShipmentEvent::RerouteAccepted { .. } => "reroute_accepted",
            ShipmentEvent::AdvisoryChanged { .. } => "advisory_changed",
            ShipmentEvent::Lagged { .. } => "lagged",
            ShipmentEvent::StorageDegraded { .. } => "storage_degraded",
        }
    }
}
