//! Valhalla-compatible HTTP routing backend.
//!
//! Consumes `trip.legs[].shape` (encoded polyline, 1e-6 precision),
//! `trip.legs[].maneuvers[]` (length km / time s, used to derive segment
//! free-flow speeds), and `trip.summary.{length,time}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{RoutePlan, RoutingBackend, RoutingError};
use crate::types::{Coordinate, RouteSegment, TruckProfile};

pub struct ValhallaClient {
    http: reqwest::Client,
    endpoint: String,
    tag: &'static str,
}

impl ValhallaClient {
    /// Create a client for the given endpoint (e.g. `http://localhost:8002`).
    /// The `tag` becomes the route source label ("valhalla", "fallback").
    pub fn new(endpoint: &str, tag: &'static str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tag,
        }
    }

    fn request_body(waypoints: &[Coordinate], profile: &TruckProfile, alternates: u32) -> serde_json::Value {
        let locations: Vec<serde_json::Value> = waypoints
            .iter()
            .map(|wp| json!({"lat": wp.lat, "lon": wp.lon}))
            .collect();
        json!({
            "locations": locations,
            "costing": profile.costing.as_str(),
            "costing_options": {
                "truck": {
                    "height": profile.height_m,
                    "width": profile.width_m,
                    "weight": profile.weight_tons,
                    "hazmat": profile.hazmat_allowed,
                    "use_tolls": if profile.avoid_tolls { 0.0 } else { 0.5 },
                }
            },
            "alternates": alternates.saturating_sub(1),
            "units": "kilometers",
        })
    }
}

// ============================================================================
// Response payloads (only the fields we consume)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RouteResponse {
    trip: Trip,
    #[serde(default)]
    alternates: Vec<Alternate>,
}

#[derive(Debug, Deserialize)]
struct Alternate {
    trip: Trip,
}

#[derive(Debug, Deserialize)]
struct Trip {
    legs: Vec<Leg>,
    summary: Summary,
}

#[derive(Debug, Deserialize)]
struct Leg {
    shape: String,
    #[serde(default)]
    maneuvers: Vec<Maneuver>,
}

#[derive(Debug, Deserialize)]
struct Maneuver {
    /// Maneuver length (km).
    #[serde(default)]
    length: f64,
    /// Maneuver duration (s).
    #[serde(default)]
    time: f64,
}

#[derive(Debug, Deserialize)]
struct Summary {
    /// Total length (km).
    length: f64,
    /// Total duration (s).
    time: f64,
}

#[derive(Debug, Deserialize)]
struct LocateResponse {
    #[serde(default)]
    edges: Vec<LocateEdge>,
}

#[derive(Debug, Deserialize)]
struct LocateEdge {
    correlated_lat: f64,
    correlated_lon: f64,
}

// ============================================================================
// Shape decoding
// ============================================================================

/// Decode a Valhalla encoded polyline (1e-6 precision).
fn decode_polyline6(encoded: &str) -> Result<Vec<Coordinate>, RoutingError> {
    let bytes = encoded.as_bytes();
    let mut coords = Vec::new();
    let mut index = 0usize;
    let mut lat = 0i64;
    let mut lon = 0i64;

    let mut next_delta = |index: &mut usize| -> Result<i64, RoutingError> {
        let mut shift = 0u32;
        let mut result = 0i64;
        loop {
            let Some(&b) = bytes.get(*index) else {
                return Err(RoutingError::InvalidResponse(
                    "truncated polyline shape".to_string(),
                ));
            };
            *index += 1;
            let b = i64::from(b) - 63;
            if !(0..=0x3f).contains(&b) {
                return Err(RoutingError::InvalidResponse(
                    "polyline byte out of range".to_string(),
                ));
            }
            result |= (b & 0x1f) << shift;
            shift += 5;
            if b < 0x20 {
                break;
            }
        }
        Ok(if result & 1 != 0 {
            !(result >> 1)
        } else {
            result >> 1
        })
    };

    while index < bytes.len() {
        lat += next_delta(&mut index)?;
        lon += next_delta(&mut index)?;
        coords.push(Coordinate::new(lat as f64 * 1e-6, lon as f64 * 1e-6));
    }
    Ok(coords)
}

fn plan_from_trip(trip: &Trip, tag: &str) -> Result<RoutePlan, RoutingError> {
    let mut polyline = Vec::new();
    for leg in &trip.legs {
        let mut decoded = decode_polyline6(&leg.shape)?;
        if !polyline.is_empty() && !decoded.is_empty() {
            // Legs share their boundary vertex.
            decoded.remove(0);
        }
        polyline.append(&mut decoded);
    }
    if polyline.len() < 2 {
        return Err(RoutingError::InvalidResponse(
            "route shape has fewer than two points".to_string(),
        ));
    }

    let total_distance_m = trip.summary.length * 1000.0;
    let total_duration_s = trip.summary.time;
    if total_distance_m <= 0.0 || total_duration_s <= 0.0 {
        return Err(RoutingError::InvalidResponse(format!(
            "degenerate summary: {} km / {} s",
            trip.summary.length, trip.summary.time
        )));
    }

    // Segment free-flow speeds from maneuver length/time pairs; fractions
    // are cumulative-length positions along the full route.
    let mut segments = Vec::new();
    let mut covered_m = 0.0;
    for leg in &trip.legs {
        for maneuver in &leg.maneuvers {
            let len_m = maneuver.length * 1000.0;
            if len_m <= 0.0 {
                continue;
            }
            let speed = if maneuver.time > 0.0 {
                len_m / maneuver.time
            } else {
                total_distance_m / total_duration_s
            };
            segments.push(RouteSegment {
                start_fraction: (covered_m / total_distance_m).clamp(0.0, 1.0),
                end_fraction: ((covered_m + len_m) / total_distance_m).clamp(0.0, 1.0),
                freeflow_speed_mps: speed,
            });
            covered_m += len_m;
        }
    }
    if segments.is_empty() {
        segments.push(RouteSegment {
            start_fraction: 0.0,
            end_fraction: 1.0,
            freeflow_speed_mps: total_distance_m / total_duration_s,
        });
    }

    Ok(RoutePlan {
        polyline,
        total_distance_m,
        total_duration_s,
        segments,
        source: tag.to_string(),
    })
}

#[async_trait]
impl RoutingBackend for ValhallaClient {
    async fn route(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
    ) -> Result<RoutePlan, RoutingError> {
        self.alternatives(waypoints, profile, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(RoutingError::NoRoute)
    }

    async fn alternatives(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
        k: u32,
    ) -> Result<Vec<RoutePlan>, RoutingError> {
        if waypoints.len() < 2 {
            return Err(RoutingError::InvalidResponse(
                "at least two waypoints required".to_string(),
            ));
        }

        let body = Self::request_body(waypoints, profile, k);
        let response = self
            .http
            .post(format!("{}/route", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| RoutingError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RoutingError::Unavailable(format!(
                "routing returned HTTP {}",
                response.status()
            )));
        }

        let parsed: RouteResponse = response
            .json()
            .await
            .map_err(|e| RoutingError::InvalidResponse(e.to_string()))?;

        let mut plans = vec![plan_from_trip(&parsed.trip, self.tag)?];
        for alt in parsed.alternates.iter().take(k.saturating_sub(1) as usize) {
            match plan_from_trip(&alt.trip, self.tag) {
                Ok(plan) => plans.push(plan),
                Err(e) => debug!(error = %e, "Skipping unusable alternate"),
            }
        }
        Ok(plans)
    }

    async fn snap(&self, coordinate: Coordinate) -> Result<Coordinate, RoutingError> {
        let body = json!({
            "locations": [{"lat": coordinate.lat, "lon": coordinate.lon}],
            "costing": "auto",
            "verbose": false,
        });
        let response = self
            .http
            .post(format!("{}/locate", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| RoutingError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RoutingError::Unavailable(format!(
                "locate returned HTTP {}",
                response.status()
            )));
        }

        let parsed: Vec<LocateResponse> = response
            .json()
            .await
            .map_err(|e| RoutingError::InvalidResponse(e.to_string()))?;

        parsed
            .first()
            .and_then(|loc| loc.edges.first())
            .map(|edge| Coordinate::new(edge.correlated_lat, edge.correlated_lon))
            .ok_or(RoutingError::NoRoute)
    }

    fn name(&self) -> &'static str {
        self.tag
    }
}
