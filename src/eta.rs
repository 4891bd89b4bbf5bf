//! Per-stop ETA estimation and stop arrival/departure detection.
//!
//! For every accepted snap the estimator walks the route's segment list from
//! the current progress to each remaining stop, divides segment lengths by
//! an effective speed (free-flow scaled by traffic and weather factors),
//! adds planned service time for intermediate stops, then smooths the
//! residual duration with an EWMA so dashboards don't jitter.
//!
//! The dwell tracker turns snapped fixes into arrival/departure transitions
//! using the configured radius and stopped-speed thresholds.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::IdGen;
use crate::config;
use crate::geo;
use crate::types::{
    ConfidenceBucket, EntityId, EtaSample, Route, SnappedPoint, Stop, TrafficSample,
    WeatherSample,
};

// ============================================================================
// Estimator
// ============================================================================

/// Inputs for one estimation pass.
pub struct EtaInputs<'a> {
    pub snapped: &'a SnappedPoint,
    pub route: &'a Route,
    /// All stops of the shipment, sequence order.
    pub stops: &'a [Stop],
    pub traffic: Option<&'a TrafficSample>,
    pub weather: Option<&'a WeatherSample>,
    /// Routing data could not be refreshed; confidence is capped at medium.
    pub routing_degraded: bool,
}

/// Where a stop sits on the route polyline.
#[derive(Debug, Clone, Copy)]
struct StopAnchor {
    fraction: f64,
    off_route: bool,
}

/// Produces one [`EtaSample`] per remaining stop, holding EWMA state
/// per stop across calls.
pub struct EtaEstimator {
    /// stop_id -> last smoothed residual duration (s).
    smoothed: HashMap<EntityId, f64>,
    /// (route_id, stop_id) -> projected anchor, cached per route.
    anchors: HashMap<(EntityId, EntityId), StopAnchor>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self {
            smoothed: HashMap::new(),
            anchors: HashMap::new(),
        }
    }

    /// Restore EWMA state from persisted samples so a restarted actor
    /// continues smoothing instead of starting cold.
    pub fn seed(&mut self, samples: &[EtaSample]) {
        for sample in samples {
            self.smoothed
                .insert(sample.stop_id, sample.smoothed_duration_s);
        }
    }

    /// Drop smoothing state after a route swap; the residual durations on
    /// the new geometry restart the EWMA.
    pub fn reset_for_route_change(&mut self) {
        self.smoothed.clear();
    }

    fn anchor(&mut self, route: &Route, stop: &Stop) -> StopAnchor {
        let key = (route.id, stop.id);
        if let Some(anchor) = self.anchors.get(&key) {
            return *anchor;
        }
        let cfg = config::get();
        let anchor = match geo::project_onto_polyline(&route.polyline, stop.coordinate) {
            Some(projection) => StopAnchor {
                fraction: projection.fraction,
                off_route: projection.cross_track_m >= cfg.eta.stop_off_route_m,
            },
            None => StopAnchor {
                fraction: 1.0,
                off_route: true,
            },
        };
        self.anchors.insert(key, anchor);
        anchor
    }

    /// Travel seconds from `from_fraction` to `to_fraction` along the route.
    fn travel_seconds(
        &self,
        route: &Route,
        from_fraction: f64,
        to_fraction: f64,
        traffic_factor: f64,
        weather_factor: f64,
    ) -> f64 {
        let cfg = config::get();
        if to_fraction <= from_fraction {
            return 0.0;
        }

        let mut seconds = 0.0;
        let mut covered = from_fraction;
        for seg in &route.segments {
            if seg.end_fraction <= covered || seg.start_fraction >= to_fraction {
                continue;
            }
            let span_start = covered.max(seg.start_fraction);
            let span_end = to_fraction.min(seg.end_fraction);
            let len_m = (span_end - span_start) * route.total_distance_m;
            let effective = (seg.freeflow_speed_mps * traffic_factor * weather_factor)
                .max(cfg.eta.min_effective_speed_mps);
            seconds += len_m / effective;
            covered = span_end;
        }

        // Gap not covered by any segment: fall back to the route average.
        if covered < to_fraction {
            let len_m = (to_fraction - covered) * route.total_distance_m;
            let avg = if route.total_duration_s > 0.0 {
                route.total_distance_m / route.total_duration_s
            } else {
                cfg.eta.min_effective_speed_mps
            };
            let effective = (avg * traffic_factor * weather_factor)
                .max(cfg.eta.min_effective_speed_mps);
            seconds += len_m / effective;
        }
        seconds
    }

    /// Run one estimation pass. Returns a sample per remaining stop in
    /// sequence order.
    pub fn estimate(
        &mut self,
        now: DateTime<Utc>,
        ids: &IdGen,
        inputs: &EtaInputs<'_>,
    ) -> Vec<EtaSample> {
        let cfg = config::get();
        let traffic_factor = inputs.traffic.map(|t| t.speed_factor()).unwrap_or(1.0);
        let weather_factor = inputs.weather.map(|w| w.speed_factor()).unwrap_or(1.0);
        let missing_signals = usize::from(inputs.traffic.is_none())
            + usize::from(inputs.weather.is_none());

        let progress = inputs.snapped.progress;
        let mut samples = Vec::new();
        let mut service_ahead_s = 0.0;

        for stop in inputs.stops.iter().filter(|s| !s.completed) {
            let anchor = self.anchor(inputs.route, stop);
            let ahead = anchor.fraction > progress;
            let target_fraction = anchor.fraction.max(progress);

            let travel_s = self.travel_seconds(
                inputs.route,
                progress,
                target_fraction,
                traffic_factor,
                weather_factor,
            );
            let raw_s = travel_s + service_ahead_s;
            let residual_m = (target_fraction - progress) * inputs.route.total_distance_m;

            // EWMA: first observation for a stop is taken raw.
            let smoothed_s = match self.smoothed.get(&stop.id) {
                Some(prev) => cfg.eta.alpha * raw_s + (1.0 - cfg.eta.alpha) * prev,
                None => raw_s,
            };
            self.smoothed.insert(stop.id, smoothed_s);

            let deviation_min = (raw_s - smoothed_s).abs() / 60.0;
            let (mut bucket, confidence) = confidence_for(
                deviation_min,
                missing_signals,
                cfg.eta.confidence_high_dev_min,
                cfg.eta.confidence_medium_dev_min,
            );
            if anchor.off_route {
                bucket = ConfidenceBucket::Low;
            }
            if inputs.routing_degraded {
                bucket = bucket.capped_at(ConfidenceBucket::Medium);
            }

            samples.push(EtaSample {
                id: ids.next(),
                shipment_id: stop.shipment_id,
                stop_id: stop.id,
                observed_at: now,
                estimated_arrival: now
                    + Duration::milliseconds((smoothed_s * 1000.0) as i64),
                residual_distance_m: residual_m,
                residual_duration_s: raw_s,
                smoothed_duration_s: smoothed_s,
                bucket,
                confidence,
            });

            // A stop still ahead puts its dwell in front of every later
            // stop; a stop already passed (or being serviced now) does not.
            if ahead {
                service_ahead_s += f64::from(stop.service_minutes) * 60.0;
            }
        }

        debug!(
            stops = samples.len(),
            progress = progress,
            traffic_factor = traffic_factor,
            weather_factor = weather_factor,
            "ETA pass complete"
        );
        samples
    }
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket + numeric confidence from smoothing deviation and signal coverage.
///
/// The numeric value decreases monotonically with deviation and with each
/// missing signal, and always agrees in direction with the bucket.
fn confidence_for(
    deviation_min: f64,
    missing_signals: usize,
    high_dev_min: f64,
    medium_dev_min: f64,
) -> (ConfidenceBucket, f64) {
    let bucket = if deviation_min <= high_dev_min && missing_signals == 0 {
        ConfidenceBucket::High
    } else if deviation_min <= medium_dev_min || missing_signals == 1 {
        ConfidenceBucket::Medium
    } else {
        ConfidenceBucket::Low
    };

    let deviation_term = (1.0 - deviation_min / (2.0 * medium_dev_min)).clamp(0.0, 1.0);
    let signal_term = 1.0 - 0.15 * missing_signals as f64;
    (bucket, (deviation_term * signal_term).clamp(0.0, 1.0))
}

// ============================================================================
// Dwell detection
// ============================================================================

/// Arrival or departure transition detected from a snapped fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTransition {
    Arrived {
        stop_id: EntityId,
        at: DateTime<Utc>,
    },
    /// Departure also completes the stop.
    Departed {
        stop_id: EntityId,
        at: DateTime<Utc>,
    },
}

/// Tracks dwell state for the shipment's current stop.
#[derive(Debug, Default)]
pub struct DwellTracker {
    /// First moment the vehicle was seen outside the radius at speed,
    /// after having arrived.
    outside_since: Option<DateTime<Utc>>,
}

impl DwellTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the dwell predicate. Returns at most one transition per fix.
    ///
    /// Departure tracking takes priority: while a stop is arrived-but-open,
    /// the vehicle is dwelling there and cannot be arriving anywhere else.
    /// Arrival fires for the lowest-sequence open stop whose radius the
    /// stopped vehicle is inside — a stop driven past without dwelling
    /// (skipped origin, missed delivery) never blocks later arrivals.
    pub fn observe(&mut self, snapped: &SnappedPoint, stops: &[Stop]) -> Option<StopTransition> {
        let cfg = config::get();
        let speed_kph = snapped.edge_speed_mps * 3.6;
        let stopped = speed_kph < cfg.dwell.stopped_speed_kph;

        if let Some(dwelling) = stops
            .iter()
            .find(|s| s.actual_arrival.is_some() && !s.completed)
        {
            let distance_m = geo::haversine_m(snapped.snapped, dwelling.coordinate);
            let inside = distance_m <= cfg.dwell.radius_m;
            if !inside && !stopped {
                let since = *self.outside_since.get_or_insert(snapped.position.ts);
                if (snapped.position.ts - since).num_seconds() >= cfg.dwell.departure_min_secs {
                    self.outside_since = None;
                    return Some(StopTransition::Departed {
                        stop_id: dwelling.id,
                        at: since,
                    });
                }
            } else {
                self.outside_since = None;
            }
            return None;
        }

        if !stopped {
            return None;
        }
        for stop in stops
            .iter()
            .filter(|s| !s.completed && s.actual_arrival.is_none())
        {
            if geo::haversine_m(snapped.snapped, stop.coordinate) <= cfg.dwell.radius_m {
                self.outside_since = None;
                return Some(StopTransition::Arrived {
                    stop_id: stop.id,
                    at: snapped.position.ts,
                });
            }
        }
        None
    }

    /// Forget departure tracking when the current stop changes.
    pub fn reset(&mut self) {
        self.outside_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinate, Position, RouteSegment, TruckProfile};

    fn route() -> Route {
        Route {
            id: 1,
            polyline: vec![
                Coordinate::new(30.00, -94.0),
                Coordinate::new(30.01, -94.0),
                Coordinate::new(30.02, -94.0),
            ],
            total_distance_m: 2224.0,
            total_duration_s: 134.0,
            segments: vec![RouteSegment {
                start_fraction: 0.0,
                end_fraction: 1.0,
                freeflow_speed_mps: 16.6,
            }],
            profile: TruckProfile::default(),
            source: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn stop(id: EntityId, seq: u32, lat: f64, service_minutes: u32) -> Stop {
        Stop {
            id,
            shipment_id: 1,
            sequence: seq,
            name: format!("Stop {seq}"),
            coordinate: Coordinate::new(lat, -94.0),
            planned_arrival: Utc::now(),
            planned_departure: Utc::now(),
            service_minutes,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        }
    }

    fn snapped_at(progress: f64, speed_mps: f64) -> SnappedPoint {
        let coord = geo::point_at_fraction(&route().polyline, progress)
            .unwrap_or(Coordinate::new(30.0, -94.0));
        SnappedPoint {
            position: Position {
                vehicle_id: "TRK-1".to_string(),
                ts: Utc::now(),
                coordinate: coord,
                speed_mps: Some(speed_mps),
                accuracy_m: 10.0,
                source: "test".to_string(),
            },
            route_id: 1,
            snapped: coord,
            progress,
            cross_track_m: 1.0,
            edge_speed_mps: speed_mps,
        }
    }

    #[test]
    fn test_estimate_residual_decreases_with_progress() {
        let mut estimator = EtaEstimator::new();
        let ids = IdGen::default();
        let route = route();
        let stops = [stop(10, 1, 30.00, 0), stop(11, 2, 30.02, 0)];
        let now = Utc::now();

        let early = estimator.estimate(
            now,
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.1, 16.0),
                route: &route,
                stops: &stops,
                traffic: None,
                weather: None,
                routing_degraded: false,
            },
        );
        let later = estimator.estimate(
            now,
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.5, 16.0),
                route: &route,
                stops: &stops,
                traffic: None,
                weather: None,
                routing_degraded: false,
            },
        );

        let terminal_early = early.iter().find(|s| s.stop_id == 11).unwrap();
        let terminal_later = later.iter().find(|s| s.stop_id == 11).unwrap();
        assert!(terminal_later.residual_distance_m < terminal_early.residual_distance_m);
        assert!(terminal_later.smoothed_duration_s < terminal_early.smoothed_duration_s);
    }

    #[test]
    fn test_service_minutes_added_before_target() {
        let mut estimator = EtaEstimator::new();
        let ids = IdGen::default();
        let route = route();
        // Intermediate stop with 30 min dwell before the terminal stop.
        let stops = [stop(10, 1, 30.01, 30), stop(11, 2, 30.02, 60)];

        let samples = estimator.estimate(
            Utc::now(),
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.0, 16.0),
                route: &route,
                stops: &stops,
                traffic: None,
                weather: None,
                routing_degraded: false,
            },
        );
        let intermediate = samples.iter().find(|s| s.stop_id == 10).unwrap();
        let terminal = samples.iter().find(|s| s.stop_id == 11).unwrap();
        // Terminal includes the intermediate stop's 30 min of service.
        assert!(terminal.residual_duration_s >= intermediate.residual_duration_s + 1800.0);
    }

    #[test]
    fn test_ewma_smooths_spikes() {
        let mut estimator = EtaEstimator::new();
        let ids = IdGen::default();
        let route = route();
        let stops = [stop(11, 1, 30.02, 0)];
        let now = Utc::now();

        // Establish a baseline.
        let first = estimator.estimate(
            now,
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.2, 16.0),
                route: &route,
                stops: &stops,
                traffic: None,
                weather: None,
                routing_degraded: false,
            },
        );
        // Heavy congestion spikes the raw duration.
        let congested = TrafficSample {
            coordinate: Coordinate::new(30.0, -94.0),
            ts: now,
            speed_mps: 3.3,
            freeflow_speed_mps: 16.6,
            congestion_ratio: 0.2,
            incident: None,
            source: "test".to_string(),
        };
        let second = estimator.estimate(
            now,
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.2, 16.0),
                route: &route,
                stops: &stops,
                traffic: Some(&congested),
                weather: None,
                routing_degraded: false,
            },
        );

        let raw = second[0].residual_duration_s;
        let smoothed = second[0].smoothed_duration_s;
        let baseline = first[0].smoothed_duration_s;
        assert!(raw > baseline * 3.0, "congestion must spike raw duration");
        // alpha = 0.3: the smoothed value moves less than a third of the way.
        assert!(smoothed < baseline + 0.5 * (raw - baseline));
        assert!(smoothed > baseline);
    }

    #[test]
    fn test_confidence_buckets() {
        // Small deviation, both signals: high.
        let (bucket, numeric) = confidence_for(2.0, 0, 5.0, 15.0);
        assert_eq!(bucket, ConfidenceBucket::High);
        assert!(numeric > 0.8);

        // Small deviation, one signal missing: medium.
        let (bucket, _) = confidence_for(2.0, 1, 5.0, 15.0);
        assert_eq!(bucket, ConfidenceBucket::Medium);

        // Large deviation, both signals missing: low.
        let (bucket, numeric) = confidence_for(20.0, 2, 5.0, 15.0);
        assert_eq!(bucket, ConfidenceBucket::Low);
        assert!(numeric < 0.5);
    }

    #[test]
    fn test_routing_degraded_caps_bucket() {
        let mut estimator = EtaEstimator::new();
        let ids = IdGen::default();
        let route = route();
        let stops = [stop(11, 1, 30.02, 0)];
        let traffic = TrafficSample {
            coordinate: Coordinate::new(30.0, -94.0),
            ts: Utc::now(),
            speed_mps: 16.0,
            freeflow_speed_mps: 16.6,
            congestion_ratio: 0.96,
            incident: None,
            source: "test".to_string(),
        };
        let weather = WeatherSample {
            coordinate: Coordinate::new(30.0, -94.0),
            ts: Utc::now(),
            precipitation_mm_h: 0.0,
            wind_speed_mps: 3.0,
            temperature_c: 20.0,
            severe_advisory: None,
            source: "test".to_string(),
        };

        let samples = estimator.estimate(
            Utc::now(),
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.2, 16.0),
                route: &route,
                stops: &stops,
                traffic: Some(&traffic),
                weather: Some(&weather),
                routing_degraded: true,
            },
        );
        assert_eq!(samples[0].bucket, ConfidenceBucket::Medium);
    }

    #[test]
    fn test_seed_restores_smoothing() {
        let mut estimator = EtaEstimator::new();
        estimator.seed(&[EtaSample {
            id: 1,
            shipment_id: 1,
            stop_id: 11,
            observed_at: Utc::now(),
            estimated_arrival: Utc::now(),
            residual_distance_m: 1000.0,
            residual_duration_s: 600.0,
            smoothed_duration_s: 600.0,
            bucket: ConfidenceBucket::High,
            confidence: 0.9,
        }]);

        let ids = IdGen::default();
        let route = route();
        let stops = [stop(11, 1, 30.02, 0)];
        let samples = estimator.estimate(
            Utc::now(),
            &ids,
            &EtaInputs {
                snapped: &snapped_at(0.5, 16.0),
                route: &route,
                stops: &stops,
                traffic: None,
                weather: None,
                routing_degraded: false,
            },
        );
        // Smoothed value blends the seeded 600 s, not the raw-only value.
        let sample = &samples[0];
        assert!(sample.smoothed_duration_s > sample.residual_duration_s);
    }

    #[test]
    fn test_dwell_arrival_and_departure() {
        let mut tracker = DwellTracker::new();
        let mut stops = vec![stop(11, 1, 30.02, 30)];
        let t0 = Utc::now();

        // Moving fix far from the stop: nothing.
        let mut moving = snapped_at(0.5, 16.0);
        moving.position.ts = t0;
        assert!(tracker.observe(&moving, &stops).is_none());

        // Slow fix inside the radius: arrival.
        let mut at_stop = snapped_at(1.0, 0.5);
        at_stop.position.ts = t0 + Duration::seconds(30);
        let transition = tracker.observe(&at_stop, &stops).unwrap();
        assert_eq!(
            transition,
            StopTransition::Arrived {
                stop_id: 11,
                at: at_stop.position.ts
            }
        );
        stops[0].actual_arrival = Some(at_stop.position.ts);

        // Departs: outside the radius at speed, sustained for 60 s.
        let mut leaving = snapped_at(0.9, 12.0);
        leaving.snapped = Coordinate::new(30.015, -94.0);
        leaving.position.ts = t0 + Duration::seconds(120);
        assert!(tracker.observe(&leaving, &stops).is_none());

        let mut gone = leaving.clone();
        gone.position.ts = t0 + Duration::seconds(200);
        let transition = tracker.observe(&gone, &stops).unwrap();
        assert!(matches!(transition, StopTransition::Departed { stop_id: 11, .. }));
    }

    #[test]
    fn test_dwell_return_inside_clears_departure() {
        let mut tracker = DwellTracker::new();
        let mut stops = vec![stop(11, 1, 30.02, 30)];
        let t0 = Utc::now();
        stops[0].actual_arrival = Some(t0);

        let mut leaving = snapped_at(0.9, 12.0);
        leaving.snapped = Coordinate::new(30.015, -94.0);
        leaving.position.ts = t0 + Duration::seconds(30);
        assert!(tracker.observe(&leaving, &stops).is_none());

        // Comes back inside: the departure timer resets.
        let mut back = snapped_at(1.0, 0.5);
        back.position.ts = t0 + Duration::seconds(60);
        assert!(tracker.observe(&back, &stops).is_none());

        let mut out_again = leaving.clone();
        out_again.position.ts = t0 + Duration::seconds(90);
        assert!(tracker.observe(&out_again, &stops).is_none());
    }
}
