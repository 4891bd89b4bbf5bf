//! Shared data structures for the shipment tracking engine
//!
//! This module defines the core types flowing through the tracking pipeline:
//! - Ingest: Position (raw vehicle fix)
//! - Snapping: SnappedPoint (fix projected onto the active route)
//! - Estimation: EtaSample (per-stop arrival estimate with confidence)
//! - Classification: Advisory (delay cause with confidence + explanation)
//! - Rerouting: Reroute (proposed/accepted alternative routes)

use serde::{Deserialize, Serialize};

pub mod event;

pub use event::ShipmentEvent;

use chrono::{DateTime, Utc};

/// Internal identifier for shipments, stops, routes, reroutes, samples.
pub type EntityId = u64;

// ============================================================================
// Geography
// ============================================================================

/// WGS84 coordinate pair (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are inside valid WGS84 ranges.
    pub fn in_range(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

// ============================================================================
// Shipment & Stops
// ============================================================================

/// Lifecycle status of a shipment. Progresses monotonically in the order
/// declared here; `Cancelled` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    #[default]
    Pending,
    InTransit,
    Completed,
    Cancelled,
}

impl ShipmentStatus {
    /// Ordering rank for the monotonic-progression invariant.
    pub fn rank(&self) -> u8 {
        match self {
            ShipmentStatus::Pending => 0,
            ShipmentStatus::InTransit => 1,
            ShipmentStatus::Completed => 2,
            ShipmentStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShipmentStatus::Completed | ShipmentStatus::Cancelled)
    }
}

impl std::fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShipmentStatus::Pending => write!(f, "pending"),
            ShipmentStatus::InTransit => write!(f, "in_transit"),
            ShipmentStatus::Completed => write!(f, "completed"),
            ShipmentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A multi-stop shipment assigned to one vehicle.
///
/// Owns its stops, position history, active route, advisories, and reroute
/// history. Only the shipment actor mutates this record; everything else
/// reads snapshots. `version` backs optimistic concurrency in the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub id: EntityId,
    /// Customer-visible reference (e.g. "SHP-2024-00871").
    pub reference: String,
    pub vehicle_id: String,
    /// Promised completion time for the terminal stop.
    pub promised_by: DateTime<Utc>,
    pub status: ShipmentStatus,
    /// Active route reference; exactly one while in transit.
    pub active_route_id: Option<EntityId>,
    pub truck_profile: TruckProfile,
    /// Optimistic-concurrency version, bumped on every mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stop of a shipment. Sequences are dense 1..N within a shipment;
/// sequence 1 is the origin, N the terminal stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub id: EntityId,
    pub shipment_id: EntityId,
    pub sequence: u32,
    pub name: String,
    pub coordinate: Coordinate,
    pub planned_arrival: DateTime<Utc>,
    pub planned_departure: DateTime<Utc>,
    /// Planned service (dwell) time at the stop.
    pub service_minutes: u32,
    pub actual_arrival: Option<DateTime<Utc>>,
    pub actual_departure: Option<DateTime<Utc>>,
    pub completed: bool,
}

// ============================================================================
// Routes
// ============================================================================

/// Costing model requested from the routing backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Costing {
    #[default]
    Truck,
    Auto,
}

impl Costing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Costing::Truck => "truck",
            Costing::Auto => "auto",
        }
    }
}

/// Vehicle constraints passed to the routing backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TruckProfile {
    pub height_m: f64,
    pub width_m: f64,
    pub weight_tons: f64,
    pub hazmat_allowed: bool,
    pub avoid_tolls: bool,
    pub costing: Costing,
}

impl Default for TruckProfile {
    fn default() -> Self {
        Self {
            height_m: 4.1,
            width_m: 2.6,
            weight_tons: 36.0,
            hazmat_allowed: false,
            avoid_tolls: false,
            costing: Costing::Truck,
        }
    }
}

impl TruckProfile {
    /// Stable cache-key fragment: the profile fields that change routing results.
    pub fn cache_key(&self) -> String {
        format!(
            "{}|{:.1}|{:.1}|{:.1}|{}|{}",
            self.costing.as_str(),
            self.height_m,
            self.width_m,
            self.weight_tons,
            self.hazmat_allowed,
            self.avoid_tolls
        )
    }
}

/// A segment of the route polyline with its free-flow speed.
///
/// `start_fraction`/`end_fraction` are positions along the full polyline
/// in [0, 1], measured by distance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouteSegment {
    pub start_fraction: f64,
    pub end_fraction: f64,
    /// Free-flow speed on this segment (m/s).
    pub freeflow_speed_mps: f64,
}

/// A routed path: polyline geometry plus distance/duration summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: EntityId,
    pub polyline: Vec<Coordinate>,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub segments: Vec<RouteSegment>,
    pub profile: TruckProfile,
    /// Which backend produced this route ("valhalla", "fallback", ...).
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Route {
    /// Free-flow speed (m/s) at a fractional position along the polyline.
    /// Falls back to the overall average when no segment covers the fraction.
    pub fn freeflow_speed_at(&self, fraction: f64) -> f64 {
        for seg in &self.segments {
            if fraction >= seg.start_fraction && fraction <= seg.end_fraction {
                return seg.freeflow_speed_mps;
            }
        }
        if self.total_duration_s > 0.0 {
            self.total_distance_m / self.total_duration_s
        } else {
            0.0
        }
    }
}

// ============================================================================
// Positions & Snapping
// ============================================================================

/// Raw vehicle fix as reported by the telematics unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub vehicle_id: String,
    /// Wall clock at the sensor.
    pub ts: DateTime<Utc>,
    pub coordinate: Coordinate,
    /// Reported speed (m/s), if the unit provides one.
    pub speed_mps: Option<f64>,
    /// Horizontal accuracy radius (m).
    pub accuracy_m: f64,
    /// Provenance tag ("obd", "phone", "sim", ...).
    #[serde(default)]
    pub source: String,
}

/// A position projected onto the active route polyline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnappedPoint {
    pub position: Position,
    pub route_id: EntityId,
    /// Snapped coordinate on the polyline.
    pub snapped: Coordinate,
    /// Fractional progress along the polyline, 0..1.
    pub progress: f64,
    /// Perpendicular distance from the raw fix to the polyline (m).
    pub cross_track_m: f64,
    /// Low-pass filtered speed inferred from consecutive snaps (m/s).
    pub edge_speed_mps: f64,
}

// ============================================================================
// ETA Samples
// ============================================================================

/// Confidence bucket attached to each ETA sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    High,
    Medium,
    Low,
}

impl ConfidenceBucket {
    /// Numeric rank; higher is more confident.
    pub fn rank(&self) -> u8 {
        match self {
            ConfidenceBucket::High => 2,
            ConfidenceBucket::Medium => 1,
            ConfidenceBucket::Low => 0,
        }
    }

    /// Cap at `other` (used when routing data is stale).
    pub fn capped_at(self, other: ConfidenceBucket) -> ConfidenceBucket {
        if self.rank() > other.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ConfidenceBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceBucket::High => write!(f, "high"),
            ConfidenceBucket::Medium => write!(f, "medium"),
            ConfidenceBucket::Low => write!(f, "low"),
        }
    }
}

/// One per-stop arrival estimate, produced on every accepted position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaSample {
    pub id: EntityId,
    pub shipment_id: EntityId,
    pub stop_id: EntityId,
    pub observed_at: DateTime<Utc>,
    pub estimated_arrival: DateTime<Utc>,
    /// Residual distance along the route to this stop (m).
    pub residual_distance_m: f64,
    /// Raw residual duration before smoothing (s).
    pub residual_duration_s: f64,
    /// EWMA-smoothed residual duration (s). Persisted so a restarted
    /// actor resumes smoothing where it left off.
    pub smoothed_duration_s: f64,
    pub bucket: ConfidenceBucket,
    /// Numeric confidence in [0, 1].
    pub confidence: f64,
}

// ============================================================================
// Advisories (delay classification)
// ============================================================================

/// Closed set of delay cause codes emitted by the classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    OnTime,
    TrafficCongestion,
    WeatherDelay,
    DriverHosRisk,
    RoadIncident,
    VehicleIssue,
    OffRoute,
    UnknownDelay,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::OnTime => "ON_TIME",
            ReasonCode::TrafficCongestion => "TRAFFIC_CONGESTION",
            ReasonCode::WeatherDelay => "WEATHER_DELAY",
            ReasonCode::DriverHosRisk => "DRIVER_HOS_RISK",
            ReasonCode::RoadIncident => "ROAD_INCIDENT",
            ReasonCode::VehicleIssue => "VEHICLE_ISSUE",
            ReasonCode::OffRoute => "OFF_ROUTE",
            ReasonCode::UnknownDelay => "UNKNOWN_DELAY",
        }
    }

    /// Fixed tie-break priority; lower wins when scores are equal.
    pub fn priority(&self) -> u8 {
        match self {
            ReasonCode::RoadIncident => 0,
            ReasonCode::VehicleIssue => 1,
            ReasonCode::DriverHosRisk => 2,
            ReasonCode::WeatherDelay => 3,
            ReasonCode::TrafficCongestion => 4,
            ReasonCode::OffRoute => 5,
            ReasonCode::UnknownDelay => 6,
            ReasonCode::OnTime => 7,
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Advisory severity shown to planners and customers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// The single currently effective delay classification for a shipment.
/// A new advisory supersedes the previous one; at most one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advisory {
    pub id: EntityId,
    pub shipment_id: EntityId,
    pub observed_at: DateTime<Utc>,
    pub reason: ReasonCode,
    pub confidence: f64,
    pub explanation: String,
    pub severity: Severity,
}

impl Advisory {
    /// True when `other` would be a meaningful change worth publishing.
    pub fn differs_from(&self, other: &Advisory) -> bool {
        self.reason != other.reason || self.severity != other.severity
    }
}

// ============================================================================
// Reroutes
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerouteStatus {
    Proposed,
    Accepted,
    Rejected,
    Expired,
}

impl std::fmt::Display for RerouteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerouteStatus::Proposed => write!(f, "proposed"),
            RerouteStatus::Accepted => write!(f, "accepted"),
            RerouteStatus::Rejected => write!(f, "rejected"),
            RerouteStatus::Expired => write!(f, "expired"),
        }
    }
}

/// An alternative route offered for human acceptance. At most one
/// `Proposed` reroute exists per shipment; a new proposal expires the old.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reroute {
    pub id: EntityId,
    pub shipment_id: EntityId,
    pub created_at: DateTime<Utc>,
    pub old_route_id: EntityId,
    pub new_route_id: EntityId,
    pub projected_saving_min: f64,
    pub reason: String,
    pub status: RerouteStatus,
}

// ============================================================================
// Signal Samples
// ============================================================================

/// Normalized traffic observation near a coordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSample {
    pub coordinate: Coordinate,
    pub ts: DateTime<Utc>,
    /// Observed speed (m/s).
    pub speed_mps: f64,
    /// Free-flow speed for the same road class (m/s).
    pub freeflow_speed_mps: f64,
    /// speed / freeflow, clamped to [0, 1]. 1.0 = free flow.
    pub congestion_ratio: f64,
    /// Reported incident description, if any, on the sampled corridor.
    pub incident: Option<String>,
    pub source: String,
}

impl TrafficSample {
    /// Multiplier applied to free-flow segment speeds.
    pub fn speed_factor(&self) -> f64 {
        self.congestion_ratio.clamp(0.05, 1.0)
    }
}

/// Normalized weather observation near a coordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSample {
    pub coordinate: Coordinate,
    pub ts: DateTime<Utc>,
    /// Precipitation rate (mm/h).
    pub precipitation_mm_h: f64,
    pub wind_speed_mps: f64,
    pub temperature_c: f64,
    /// Named severe advisory in the corridor ("ice storm warning", ...).
    pub severe_advisory: Option<String>,
    pub source: String,
}

impl WeatherSample {
    /// Multiplier applied to free-flow segment speeds. Heavy rain and
    /// severe advisories slow traffic; mild weather leaves it unchanged.
    pub fn speed_factor(&self) -> f64 {
        if self.severe_advisory.is_some() {
            0.6
        } else if self.precipitation_mm_h >= 7.5 {
            0.75
        } else if self.precipitation_mm_h >= 2.5 {
            0.9
        } else {
            1.0
        }
    }
}

// ============================================================================
// Read-only snapshot (shipment query response)
// ============================================================================

/// A stop with its planned/actual times and the latest ETA sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopView {
    pub stop: Stop,
    pub eta: Option<EtaSample>,
}

/// Read-only view of a shipment, safe to hand to API handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentSnapshot {
    pub shipment: Shipment,
    pub stops: Vec<StopView>,
    pub advisory: Option<Advisory>,
    pub last_snapped: Option<SnappedPoint>,
    /// Percent of route distance remaining, 0..100.
    pub residual_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_range() {
        assert!(Coordinate::new(30.0, -94.0).in_range());
        assert!(!Coordinate::new(91.0, 0.0).in_range());
        assert!(!Coordinate::new(0.0, 181.0).in_range());
        assert!(!Coordinate::new(f64::NAN, 0.0).in_range());
    }

    #[test]
    fn test_status_rank_monotonic() {
        assert!(ShipmentStatus::Pending.rank() < ShipmentStatus::InTransit.rank());
        assert!(ShipmentStatus::InTransit.rank() < ShipmentStatus::Completed.rank());
        assert!(ShipmentStatus::Completed.is_terminal());
        assert!(ShipmentStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_reason_priority_order() {
        // ROAD_INCIDENT beats everything else on score ties.
        assert!(ReasonCode::RoadIncident.priority() < ReasonCode::VehicleIssue.priority());
        assert!(ReasonCode::VehicleIssue.priority() < ReasonCode::DriverHosRisk.priority());
        assert!(ReasonCode::DriverHosRisk.priority() < ReasonCode::WeatherDelay.priority());
        assert!(ReasonCode::WeatherDelay.priority() < ReasonCode::TrafficCongestion.priority());
        assert!(ReasonCode::TrafficCongestion.priority() < ReasonCode::OffRoute.priority());
        assert!(ReasonCode::OffRoute.priority() < ReasonCode::UnknownDelay.priority());
    }

    #[test]
    fn test_confidence_cap() {
        assert_eq!(
            ConfidenceBucket::High.capped_at(ConfidenceBucket::Medium),
            ConfidenceBucket::Medium
        );
        assert_eq!(
            ConfidenceBucket::Low.capped_at(ConfidenceBucket::Medium),
            ConfidenceBucket::Low
        );
    }

    #[test]
    fn test_weather_speed_factor_bands() {
        let mut sample = WeatherSample {
            coordinate: Coordinate::new(30.0, -94.0),
            ts: Utc::now(),
            precipitation_mm_h: 0.0,
            wind_speed_mps: 3.0,
            temperature_c: 18.0,
            severe_advisory: None,
            source: "test".to_string(),
        };
        assert_eq!(sample.speed_factor(), 1.0);
        sample.precipitation_mm_h = 3.0;
        assert_eq!(sample.speed_factor(), 0.9);
        sample.severe_advisory = Some("blizzard warning".to_string());
        assert_eq!(sample.speed_factor(), 0.6);
    }

    #[test]
    fn test_reason_code_wire_format() {
        let json = serde_json::to_string(&ReasonCode::TrafficCongestion).unwrap();
        assert_eq!(json, "\"TRAFFIC_CONGESTION\"");
    }
}
