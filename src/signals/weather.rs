//! Weather signal provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{SampleCache, SignalError};
use crate::config::defaults::WEATHER_BUCKET_DEG;
use crate::types::{Coordinate, WeatherSample};

/// Contract the engine consumes.
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<WeatherSample, SignalError>;
}

// ============================================================================
// HTTP provider
// ============================================================================

/// Fields consumed from the upstream weather feed.
#[derive(Debug, Deserialize)]
struct WeatherPayload {
    precipitation_mm_h: f64,
    wind_speed_mps: f64,
    temperature_c: f64,
    #[serde(default)]
    severe_advisory: Option<String>,
}

/// Thin HTTP client over a normalized weather feed, with a bucketed TTL
/// cache in front of it. Weather buckets are coarser than traffic buckets;
/// conditions vary over tens of kilometers, not city blocks.
pub struct HttpWeatherProvider {
    http: reqwest::Client,
    endpoint: String,
    cache: SampleCache<WeatherSample>,
}

impl HttpWeatherProvider {
    pub fn new(endpoint: &str, timeout_ms: u64, ttl_min: i64) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            cache: SampleCache::new(Duration::minutes(ttl_min), WEATHER_BUCKET_DEG),
        }
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<WeatherSample, SignalError> {
        if self.endpoint.is_empty() {
            return Err(SignalError::Unavailable("not configured".to_string()));
        }
        if let Some(sample) = self.cache.get(point, at) {
            debug!("Weather cache hit");
            return Ok(sample);
        }

        let url = format!(
            "{}/current?lat={:.4}&lon={:.4}",
            self.endpoint, point.lat, point.lon
        );
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
        let payload: WeatherPayload = response
            .json()
            .await
            .map_err(|e| miss(e.to_string()))?;

        let sample = WeatherSample {
            coordinate: point,
            ts: at,
            precipitation_mm_h: payload.precipitation_mm_h,
            wind_speed_mps: payload.wind_speed_mps,
            temperature_c: payload.temperature_c,
            severe_advisory: payload.severe_advisory,
            source: "weather-feed".to_string(),
        };
        self.cache.put(point, at, sample.clone());
        Ok(sample)
    }
}

// ============================================================================
// Static provider (tests, demos)
// ============================================================================

/// Fixed-response provider for tests and offline demos.
pub struct StaticWeather {
    pub precipitation_mm_h: f64,
    pub severe_advisory: Option<String>,
}

impl StaticWeather {
    pub fn clear() -> Self {
        Self {
            precipitation_mm_h: 0.0,
            severe_advisory: None,
        }
    }

    pub fn raining(mm_h: f64) -> Self {
        Self {
            precipitation_mm_h: mm_h,
            severe_advisory: None,
        }
    }
}

#[async_trait]
impl WeatherProvider for StaticWeather {
    async fn sample(
        &self,
        point: Coordinate,
        at: DateTime<Utc>,
    ) -> Result<WeatherSample, SignalError> {
        Ok(WeatherSample {
            coordinate: point,
            ts: at,
            precipitation_mm_h: self.precipitation_mm_h,
            wind_speed_mps: 4.0,
            temperature_c: 17.0,
            severe_advisory: self.severe_advisory.clone(),
            source: "static".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_weather_no_slowdown() {
        let provider = StaticWeather::clear();
        let sample = provider
            .sample(Coordinate::new(30.0, -94.0), Utc::now())
            .await
            .unwrap();
        assert_eq!(sample.speed_factor(), 1.0);
    }

    #[tokio::test]
    async fn test_heavy_rain_slows() {
        let provider = StaticWeather::raining(9.0);
        let sample = provider
            .sample(Coordinate::new(30.0, -94.0), Utc::now())
            .await
            .unwrap();
        assert!(sample.speed_factor() < 1.0);
    }
}
