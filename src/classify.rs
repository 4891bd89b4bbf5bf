//! Delay classification: scores candidate causes against traffic, weather,
//! and operational signals, and emits exactly one advisory per pass.
//!
//! Each cause scores independently in [0, 1]. The highest score above the
//! configured minimum wins; ties break on a fixed priority order. When no
//! cause qualifies the shipment is `ON_TIME` if on schedule and
//! `UNKNOWN_DELAY` otherwise. Explanations are template-rendered from the
//! winning inputs.

use chrono::{DateTime, Utc};

use crate::config;
use crate::types::{
    EtaSample, ReasonCode, Severity, TrafficSample, WeatherSample,
};

/// Hours-of-service state tracked per vehicle, fed by the ingest payload.
#[derive(Debug, Clone)]
pub struct HosState {
    pub shift_start: DateTime<Utc>,
}

impl HosState {
    /// Remaining drive time (hours) under the regulatory ceiling.
    pub fn remaining_hours(&self, now: DateTime<Utc>) -> f64 {
        let driven = (now - self.shift_start).num_seconds() as f64 / 3600.0;
        config::get().classify.hos_drive_ceiling_hours - driven
    }
}

/// Manually reported operational event ("flat tire", "DEF warning", ...).
#[derive(Debug, Clone)]
pub struct ManualEvent {
    pub at: DateTime<Utc>,
    pub description: String,
}

/// Everything the classifier looks at for one pass.
pub struct ClassifierInputs<'a> {
    pub now: DateTime<Utc>,
    pub promised_by: DateTime<Utc>,
    /// ETA sample for the terminal stop, when one exists.
    pub terminal_eta: Option<&'a EtaSample>,
    pub traffic: Option<&'a TrafficSample>,
    pub weather: Option<&'a WeatherSample>,
    pub hos: Option<&'a HosState>,
    pub vehicle_event: Option<&'a ManualEvent>,
    /// Consecutive snap rejections since the last accepted fix.
    pub snap_rejections: u32,
}

impl ClassifierInputs<'_> {
    /// Projected lateness against the promise (minutes, negative = early).
    pub fn lateness_min(&self) -> f64 {
        match self.terminal_eta {
            Some(eta) => {
                (eta.estimated_arrival - self.promised_by).num_seconds() as f64 / 60.0
            }
            None => 0.0,
        }
    }
}

/// Classifier verdict; the actor wraps it into an [`crate::types::Advisory`].
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub reason: ReasonCode,
    pub confidence: f64,
    pub explanation: String,
    pub severity: Severity,
}

/// Scores candidate causes and picks the advisory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayClassifier;

impl DelayClassifier {
    pub fn classify(&self, inputs: &ClassifierInputs<'_>) -> Classification {
        let cfg = &config::get().classify;
        let lateness = inputs.lateness_min();

        let mut candidates: Vec<(ReasonCode, f64)> = Vec::new();

        if let Some(score) = score_road_incident(inputs) {
            candidates.push((ReasonCode::RoadIncident, score));
        }
        if let Some(score) = score_vehicle_issue(inputs) {
            candidates.push((ReasonCode::VehicleIssue, score));
        }
        if let Some(score) = score_hos_risk(inputs) {
            candidates.push((ReasonCode::DriverHosRisk, score));
        }
        if let Some(score) = score_weather(inputs) {
            candidates.push((ReasonCode::WeatherDelay, score));
        }
        if let Some(score) = score_traffic(inputs) {
            candidates.push((ReasonCode::TrafficCongestion, score));
        }
        if let Some(score) = score_off_route(inputs) {
            candidates.push((ReasonCode::OffRoute, score));
        }

        // Highest score wins; equal scores fall back to the fixed priority.
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.priority().cmp(&b.0.priority()))
        });

        if let Some(&(reason, score)) = candidates.first() {
            if score >= cfg.min_score {
                return Classification {
                    reason,
                    confidence: score,
                    explanation: render_explanation(reason, inputs, lateness),
                    severity: severity_for(reason, lateness),
                };
            }
        }

        if lateness >= cfg.late_threshold_min {
            Classification {
                reason: ReasonCode::UnknownDelay,
                confidence: 0.5,
                explanation: format!(
                    "Running {:.0} min behind the promised window with no identified cause.",
                    lateness
                ),
                severity: severity_for(ReasonCode::UnknownDelay, lateness),
            }
        } else {
            let confidence = (1.0 - lateness.max(0.0) / cfg.late_threshold_min)
                .clamp(0.5, 0.95);
            Classification {
                reason: ReasonCode::OnTime,
                confidence,
                explanation: on_time_explanation(lateness),
                severity: Severity::Low,
            }
        }
    }
}

// ============================================================================
// Cause scorers — each independent, each in [0, 1]
// ============================================================================

fn score_traffic(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    let cfg = &config::get().classify;
    let factor = inputs.traffic?.speed_factor();
    if factor >= cfg.traffic_congestion_factor {
        return None;
    }
    // Factor at the threshold scores 0; total standstill approaches 1.
    Some(((cfg.traffic_congestion_factor - factor) / cfg.traffic_congestion_factor * 1.5).clamp(0.0, 1.0))
}

fn score_weather(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    let cfg = &config::get().classify;
    let sample = inputs.weather?;
    if sample.severe_advisory.is_some() {
        return Some(0.9);
    }
    if sample.precipitation_mm_h < cfg.weather_precip_mm_h {
        return None;
    }
    Some((0.5 + (sample.precipitation_mm_h - cfg.weather_precip_mm_h) / 20.0).clamp(0.0, 0.85))
}

fn score_hos_risk(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    let cfg = &config::get().classify;
    let remaining = inputs.hos?.remaining_hours(inputs.now);
    if remaining <= 0.0 {
        return Some(1.0);
    }
    if remaining >= cfg.hos_warning_hours {
        return None;
    }
    Some(((cfg.hos_warning_hours - remaining) / cfg.hos_warning_hours * 0.9).clamp(0.0, 0.9))
}

fn score_road_incident(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    inputs.traffic?.incident.as_ref()?;
    Some(0.85)
}

fn score_vehicle_issue(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    let cfg = &config::get().classify;
    let event = inputs.vehicle_event?;
    let age_min = (inputs.now - event.at).num_seconds() as f64 / 60.0;
    if age_min < 0.0 || age_min > cfg.vehicle_event_window_min as f64 {
        return None;
    }
    // Fresh reports score highest, decaying over the window.
    Some((0.9 - 0.4 * age_min / cfg.vehicle_event_window_min as f64).clamp(0.45, 0.9))
}

fn score_off_route(inputs: &ClassifierInputs<'_>) -> Option<f64> {
    let cfg = &config::get().classify;
    if inputs.snap_rejections < cfg.off_route_rejections {
        return None;
    }
    let extra = inputs.snap_rejections - cfg.off_route_rejections;
    Some((0.5 + 0.1 * f64::from(extra)).min(0.9))
}

// ============================================================================
// Severity & templates
// ============================================================================

fn severity_for(reason: ReasonCode, lateness_min: f64) -> Severity {
    let cfg = &config::get().classify;
    match reason {
        ReasonCode::OnTime => Severity::Low,
        ReasonCode::RoadIncident => Severity::High,
        _ if lateness_min >= 2.0 * cfg.late_threshold_min => Severity::High,
        _ if lateness_min >= cfg.late_threshold_min => Severity::Medium,
        _ => Severity::Low,
    }
}

fn on_time_explanation(lateness_min: f64) -> String {
    if lateness_min <= -5.0 {
        format!("Tracking {:.0} min ahead of the promised window.", -lateness_min)
    } else {
        "Tracking within the promised window.".to_string()
    }
}

fn render_explanation(
    reason: ReasonCode,
    inputs: &ClassifierInputs<'_>,
    lateness_min: f64,
) -> String {
    let late_clause = if lateness_min >= 1.0 {
        format!(" Projected {:.0} min behind the promised window.", lateness_min)
    } else {
        String::new()
    };

    match reason {
        ReasonCode::TrafficCongestion => {
            let factor = inputs.traffic.map(|t| t.speed_factor()).unwrap_or(1.0);
            format!(
                "Traffic on the upcoming corridor is moving at {:.0}% of free flow.{}",
                factor * 100.0,
                late_clause
            )
        }
        ReasonCode::WeatherDelay => match inputs.weather {
            Some(w) => match &w.severe_advisory {
                Some(advisory) => format!(
                    "Severe weather in the corridor: {advisory}.{late_clause}"
                ),
                None => format!(
                    "Precipitation at {:.1} mm/h is slowing the corridor.{}",
                    w.precipitation_mm_h, late_clause
                ),
            },
            None => format!("Weather conditions are slowing the corridor.{late_clause}"),
        },
        ReasonCode::DriverHosRisk => {
            let remaining = inputs
                .hos
                .map(|h| h.remaining_hours(inputs.now).max(0.0))
                .unwrap_or(0.0);
            format!(
                "Driver has {:.1} h of drive time left before the regulatory ceiling.{}",
                remaining, late_clause
            )
        }
        ReasonCode::RoadIncident => {
            let detail = inputs
                .traffic
                .and_then(|t| t.incident.as_deref())
                .unwrap_or("incident reported on route");
            format!("Road incident ahead: {detail}.{late_clause}")
        }
        ReasonCode::VehicleIssue => {
            let detail = inputs
                .vehicle_event
                .map(|e| e.description.as_str())
                .unwrap_or("reported vehicle issue");
            format!("Vehicle issue reported: {detail}.{late_clause}")
        }
        ReasonCode::OffRoute => format!(
            "Vehicle has diverged from the planned route ({} consecutive off-route fixes).{}",
            inputs.snap_rejections, late_clause
        ),
        ReasonCode::UnknownDelay | ReasonCode::OnTime => on_time_explanation(lateness_min),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceBucket, Coordinate};
    use chrono::Duration;

    fn eta_late_by(minutes: i64, promised: DateTime<Utc>) -> EtaSample {
        EtaSample {
            id: 1,
            shipment_id: 1,
            stop_id: 9,
            observed_at: Utc::now(),
            estimated_arrival: promised + Duration::minutes(minutes),
            residual_distance_m: 10_000.0,
            residual_duration_s: 1800.0,
            smoothed_duration_s: 1800.0,
            bucket: ConfidenceBucket::High,
            confidence: 0.9,
        }
    }

    fn traffic(ratio: f64, incident: Option<&str>) -> TrafficSample {
        TrafficSample {
            coordinate: Coordinate::new(30.0, -94.0),
            ts: Utc::now(),
            speed_mps: 27.0 * ratio,
            freeflow_speed_mps: 27.0,
            congestion_ratio: ratio,
            incident: incident.map(str::to_string),
            source: "test".to_string(),
        }
    }

    fn base_inputs<'a>(eta: &'a EtaSample, promised: DateTime<Utc>) -> ClassifierInputs<'a> {
        ClassifierInputs {
            now: Utc::now(),
            promised_by: promised,
            terminal_eta: Some(eta),
            traffic: None,
            weather: None,
            hos: None,
            vehicle_event: None,
            snap_rejections: 0,
        }
    }

    #[test]
    fn test_on_time_when_no_cause_and_on_schedule() {
        let promised = Utc::now() + Duration::hours(2);
        let eta = eta_late_by(-30, promised);
        let verdict = DelayClassifier.classify(&base_inputs(&eta, promised));
        assert_eq!(verdict.reason, ReasonCode::OnTime);
        assert_eq!(verdict.severity, Severity::Low);
        assert!(verdict.confidence >= 0.5);
    }

    #[test]
    fn test_unknown_delay_when_late_with_no_signals() {
        let promised = Utc::now() + Duration::hours(1);
        let eta = eta_late_by(20, promised);
        let verdict = DelayClassifier.classify(&base_inputs(&eta, promised));
        assert_eq!(verdict.reason, ReasonCode::UnknownDelay);
        assert_eq!(verdict.severity, Severity::High); // 20 min >= 2 x 5 min
    }

    #[test]
    fn test_congestion_wins_when_factor_low() {
        let promised = Utc::now() + Duration::hours(1);
        let eta = eta_late_by(8, promised);
        let sample = traffic(0.3, None);
        let mut inputs = base_inputs(&eta, promised);
        inputs.traffic = Some(&sample);

        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::TrafficCongestion);
        assert!(verdict.confidence >= 0.4);
        assert!(verdict.explanation.contains("free flow"));
        assert_eq!(verdict.severity, Severity::Medium);
    }

    #[test]
    fn test_factor_at_threshold_not_congestion() {
        let promised = Utc::now() + Duration::hours(1);
        let eta = eta_late_by(0, promised);
        let sample = traffic(0.6, None);
        let mut inputs = base_inputs(&eta, promised);
        inputs.traffic = Some(&sample);

        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::OnTime);
    }

    #[test]
    fn test_incident_outranks_congestion() {
        let promised = Utc::now() + Duration::hours(1);
        let eta = eta_late_by(12, promised);
        // Heavy congestion AND an incident: the incident report wins the tie
        // region because both score high and incident has priority.
        let sample = traffic(0.1, Some("jackknifed trailer at mile 42"));
        let mut inputs = base_inputs(&eta, promised);
        inputs.traffic = Some(&sample);

        let verdict = DelayClassifier.classify(&inputs);
        // Congestion at factor 0.1 scores 1.0 > incident 0.85, so congestion
        // wins on score alone; with moderate congestion the incident wins.
        assert_eq!(verdict.reason, ReasonCode::TrafficCongestion);

        let moderate = traffic(0.45, Some("jackknifed trailer at mile 42"));
        inputs.traffic = Some(&moderate);
        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::RoadIncident);
        assert_eq!(verdict.severity, Severity::High);
        assert!(verdict.explanation.contains("jackknifed trailer"));
    }

    #[test]
    fn test_hos_risk_scores_near_ceiling() {
        let promised = Utc::now() + Duration::hours(2);
        let eta = eta_late_by(0, promised);
        // 10.5 h into an 11 h window: 0.5 h remaining.
        let hos = HosState {
            shift_start: Utc::now() - Duration::minutes(630),
        };
        let mut inputs = base_inputs(&eta, promised);
        inputs.hos = Some(&hos);

        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::DriverHosRisk);
        assert!(verdict.explanation.contains("drive time"));
    }

    #[test]
    fn test_vehicle_issue_within_window() {
        let promised = Utc::now() + Duration::hours(2);
        let eta = eta_late_by(6, promised);
        let event = ManualEvent {
            at: Utc::now() - Duration::minutes(10),
            description: "trailer brake fault".to_string(),
        };
        let mut inputs = base_inputs(&eta, promised);
        inputs.vehicle_event = Some(&event);

        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::VehicleIssue);
        assert!(verdict.explanation.contains("trailer brake fault"));
    }

    #[test]
    fn test_off_route_after_repeated_rejections() {
        let promised = Utc::now() + Duration::hours(2);
        let eta = eta_late_by(0, promised);
        let mut inputs = base_inputs(&eta, promised);
        inputs.snap_rejections = 4;

        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::OffRoute);

        inputs.snap_rejections = 2; // below the configured minimum of 3
        let verdict = DelayClassifier.classify(&inputs);
        assert_eq!(verdict.reason, ReasonCode::OnTime);
    }
}
