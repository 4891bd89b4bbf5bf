//! System-wide default constants.
//!
//! Centralises tuning values referenced from more than one subsystem.
//! Grouped by subsystem for easy discovery. Operator-tunable values live in
//! `service_config.rs`; these are the built-in defaults behind them.

// ============================================================================
// Position admission
// ============================================================================

/// Positions with accuracy beyond this radius (m) are rejected.
pub const MAX_ACCURACY_M: f64 = 50.0;

/// Oldest acceptable position timestamp relative to now (seconds).
pub const MAX_POSITION_AGE_SECS: i64 = 86_400;

/// Furthest-future acceptable position timestamp relative to now (seconds).
pub const MAX_POSITION_SKEW_SECS: i64 = 300;

// ============================================================================
// Road snapping
// ============================================================================

/// Base cross-track reject threshold (m); the effective threshold is
/// `max(this, 2 x accuracy)`.
pub const MAX_CROSS_TRACK_M: f64 = 60.0;

/// Allowed backward jitter along the polyline before rejection (m).
pub const MIN_PROGRESS_TOLERANCE_M: f64 = 20.0;

/// Edge speed clamp ceiling (km/h).
pub const MAX_EDGE_SPEED_KPH: f64 = 140.0;

/// One-pole low-pass coefficient for edge speed (weight of the new sample).
pub const EDGE_SPEED_LOWPASS: f64 = 0.4;

// ============================================================================
// ETA estimation
// ============================================================================

/// EWMA smoothing factor for residual duration. Lower = more smoothing.
pub const ETA_ALPHA: f64 = 0.3;

/// Deviation band (minutes) for `high` confidence.
pub const CONFIDENCE_HIGH_DEV_MIN: f64 = 5.0;

/// Deviation band (minutes) for `medium` confidence.
pub const CONFIDENCE_MEDIUM_DEV_MIN: f64 = 15.0;

/// Floor for effective segment speed (m/s) so degraded factors never
/// produce absurd durations. ~7 km/h.
pub const MIN_EFFECTIVE_SPEED_MPS: f64 = 2.0;

/// A stop further than this from the polyline is treated as off-route (m).
pub const STOP_OFF_ROUTE_M: f64 = 500.0;

// ============================================================================
// Dwell detection
// ============================================================================

/// Arrival/departure detection radius around a stop (m).
pub const DWELL_RADIUS_M: f64 = 80.0;

/// Below this speed (km/h) the vehicle counts as stopped.
pub const STOPPED_SPEED_KPH: f64 = 5.0;

/// The vehicle must stay outside the dwell radius at speed for at least
/// this long (seconds) before departure is marked.
pub const DEPARTURE_MIN_SECS: i64 = 60;

// ============================================================================
// Delay classification
// ============================================================================

/// Minimum cause score to win classification.
pub const CLASSIFY_MIN_SCORE: f64 = 0.4;

/// Traffic speed factor below this reads as congestion.
pub const TRAFFIC_CONGESTION_FACTOR: f64 = 0.6;

/// Precipitation rate (mm/h) above which weather scores as a delay cause.
pub const WEATHER_PRECIP_MM_H: f64 = 2.5;

/// Lateness (minutes) at which an otherwise unexplained shipment becomes
/// `UNKNOWN_DELAY` instead of `ON_TIME`.
pub const LATE_THRESHOLD_MIN: f64 = 5.0;

/// Regulatory driving ceiling used by the HOS risk scorer (hours).
pub const HOS_DRIVE_CEILING_HOURS: f64 = 11.0;

/// Remaining drive time (hours) below which HOS risk starts scoring.
pub const HOS_WARNING_HOURS: f64 = 1.5;

/// Look-ahead window (minutes of travel) for traffic/incident scoring.
pub const CLASSIFY_LOOKAHEAD_MIN: f64 = 30.0;

/// Manual vehicle events older than this (minutes) stop scoring.
pub const VEHICLE_EVENT_WINDOW_MIN: i64 = 60;

/// Consecutive snap rejections before OFF_ROUTE starts scoring.
pub const OFF_ROUTE_REJECTIONS: u32 = 3;

// ============================================================================
// Rerouting
// ============================================================================

/// Minimum projected saving (minutes) to propose; equality does not propose.
pub const REROUTE_MIN_SAVING_MIN: f64 = 10.0;

/// Proposal expiry when neither accepted nor rejected (minutes).
pub const REROUTE_PROPOSAL_TTL_MIN: i64 = 15;

/// Alternatives requested from the routing backend per evaluation.
pub const REROUTE_ALTERNATIVES: u32 = 3;

/// Detour length penalty: alternatives longer than the current residual
/// distance by more than this fraction are penalized.
pub const REROUTE_DETOUR_FRACTION: f64 = 0.2;

/// Penalty (minutes) subtracted from the saving of long detours.
pub const REROUTE_DETOUR_PENALTY_MIN: f64 = 5.0;

/// Projected lateness (minutes) that triggers an automatic evaluation.
pub const REROUTE_LATENESS_TRIGGER_MIN: f64 = 10.0;

// ============================================================================
// Queues & buffers
// ============================================================================

/// Bounded inbound position queue per shipment actor.
pub const PER_SHIPMENT_QUEUE: usize = 64;

/// Outbound event buffer per subscriber session.
pub const SUBSCRIBER_BUFFER: usize = 32;

/// Degraded-storage position buffer inside an actor.
pub const DEGRADED_BUFFER: usize = 200;

/// Admission timeout for forwarding a batch into an actor queue (ms).
pub const ADMISSION_TIMEOUT_MS: u64 = 250;

// ============================================================================
// External call budgets
// ============================================================================

/// Repository operation timeout (ms).
pub const REPO_TIMEOUT_MS: u64 = 1_000;

/// Routing request timeout (ms).
pub const ROUTING_TIMEOUT_MS: u64 = 10_000;

/// Signal provider request timeout (ms).
pub const SIGNAL_TIMEOUT_MS: u64 = 2_000;

/// Repository retry attempts before buffering.
pub const REPO_RETRY_ATTEMPTS: u32 = 3;

/// Base backoff between repository retries (ms), doubled per attempt.
pub const REPO_RETRY_BACKOFF_MS: u64 = 50;

// ============================================================================
// Caches
// ============================================================================

/// Weather sample freshness window (minutes).
pub const WEATHER_TTL_MIN: i64 = 10;

/// Traffic sample freshness window (minutes).
pub const TRAFFIC_TTL_MIN: i64 = 2;

/// Routing response cache TTL (minutes).
pub const ROUTE_CACHE_TTL_MIN: i64 = 5;

/// Spatial bucket edge for weather caching (degrees, ~11 km).
pub const WEATHER_BUCKET_DEG: f64 = 0.1;

/// Spatial bucket edge for traffic caching (degrees, ~2 km).
pub const TRAFFIC_BUCKET_DEG: f64 = 0.02;
