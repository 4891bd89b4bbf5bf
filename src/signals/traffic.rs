//! Traffic signal provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{SampleCache, SignalError};
use crate::config::defaults::TRAFFIC_BUCKET_DEG;
use crate::types::{Coordinate, TrafficSample};

/// Contract the engine consumes. `sample` returns the freshest observation
/// near the point, or a typed miss the caller treats as degraded input.
#[async_trait]
pub trait TrafficProvider: Send + Sync {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<TrafficSample, SignalError>;
}

// ============================================================================
// HTTP provider
// ============================================================================

/// Fields consumed from the upstream traffic feed.
#[derive(Debug, Deserialize)]
struct TrafficPayload {
    speed_kph: f64,
    freeflow_speed_kph: f64,
    #[serde(default)]
    incident: Option<String>,
}

/// Thin HTTP client over a normalized traffic feed, with a bucketed TTL
/// cache in front of it.
pub struct HttpTrafficProvider {
    http: reqwest::Client,
    endpoint: String,
    cache: SampleCache<TrafficSample>,
}

impl HttpTrafficProvider {
    pub fn new(endpoint: &str, timeout_ms: u64, ttl_min: i64) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            cache: SampleCache::new(Duration::minutes(ttl_min), TRAFFIC_BUCKET_DEG),
        }
    }
}

#[async_trait]
impl TrafficProvider for HttpTrafficProvider {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<TrafficSample, SignalError> {
        if self.endpoint.is_empty() {
            return Err(SignalError::Unavailable("not configured".to_string()));
        }
        if let Some(sample) = self.cache.get(point, at) {
            debug!("Traffic cache hit");
            return Ok(sample);
        }

        let url = format!(
            "{}/flow?lat={:.5}&lon={:.5}",
            self.endpoint, point.lat, point.lon
        );
        // A failed refetch over an expired bucket is Stale, not Unavailable;
        // the caller may choose to degrade differently.
        let miss = |detail: String| {
            if self.cache.has_expired(point, at) {
                SignalError::Stale
            } else {
                SignalError::Unavailable(detail)
            }
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| miss(e.to_string()))?;
        if !response.status().is_success() {
            return Err(miss(format!("HTTP {}", response.status())));
        }
        let payload: TrafficPayload = response
            .json()
            .await
            .map_err(|e| miss(e.to_string()))?;

        let freeflow = payload.freeflow_speed_kph.max(1.0);
        let sample = TrafficSample {
            coordinate: point,
            ts: at,
            speed_mps: payload.speed_kph / 3.6,
            freeflow_speed_mps: freeflow / 3.6,
            congestion_ratio: (payload.speed_kph / freeflow).clamp(0.0, 1.0),
            incident: payload.incident,
            source: "traffic-feed".to_string(),
        };
        self.cache.put(point, at, sample.clone());
        Ok(sample)
    }
}

// ============================================================================
// Static provider (tests, demos)
// ============================================================================

/// Fixed-response provider for tests and offline demos.
pub struct StaticTraffic {
    pub congestion_ratio: f64,
    pub incident: Option<String>,
}

impl StaticTraffic {
    pub fn free_flow() -> Self {
        Self {
            congestion_ratio: 1.0,
            incident: None,
        }
    }

    pub fn congested(ratio: f64) -> Self {
        Self {
            congestion_ratio: ratio,
            incident: None,
        }
    }
}

#[async_trait]
impl TrafficProvider for StaticTraffic {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<TrafficSample, SignalError> {
        let freeflow = 27.0;
        Ok(TrafficSample {
            coordinate: point,
            ts: at,
            speed_mps: freeflow * self.congestion_ratio,
            freeflow_speed_mps: freeflow,
            congestion_ratio: self.congestion_ratio,
            incident: self.incident.clone(),
            source: "static".to_string(),
        })
    }
}
