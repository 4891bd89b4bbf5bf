//! Routing backend contract and the resilient client wrapper.
//!
//! The engine talks to a Valhalla-compatible routing service for geometry,
//! distance, duration, road snapping, and truck-aware alternatives. The
//! wrapper adds the reliability policy: a per-attempt timeout, one fallback
//! provider when the primary fails, and a TTL-bounded response cache keyed
//! by `(waypoints, profile)`.

mod valhalla;

pub use valhalla::ValhallaClient;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Coordinate, RouteSegment, TruckProfile};

#[derive(Debug, Error)]
pub enum RoutingError {
    /// Primary (and fallback, when configured) both failed.
    #[error("Routing unavailable: {0}")]
    Unavailable(String),

    #[error("Routing request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Routing backend returned no route")]
    NoRoute,

    #[error("Unusable routing response: {0}")]
    InvalidResponse(String),
}

/// A routed path as returned by a backend, before it is assigned an
/// entity id and persisted as a [`crate::types::Route`].
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub polyline: Vec<Coordinate>,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
    pub segments: Vec<RouteSegment>,
    pub source: String,
}

/// One concrete routing provider.
#[async_trait]
pub trait RoutingBackend: Send + Sync {
    /// Single best route through the waypoints.
    async fn route(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
    ) -> Result<RoutePlan, RoutingError>;

    /// Up to `k` routes, fastest baseline first.
    async fn alternatives(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
        k: u32,
    ) -> Result<Vec<RoutePlan>, RoutingError>;

    /// Project a coordinate onto the nearest routable road.
    async fn snap(&self, coordinate: Coordinate) -> Result<Coordinate, RoutingError>;

    /// Tag recorded as the route source.
    fn name(&self) -> &'static str;
}

struct CacheEntry {
    at: DateTime<Utc>,
    plans: Vec<RoutePlan>,
}

/// Resilient routing client used by the engine.
pub struct RoutingClient {
    primary: Box<dyn RoutingBackend>,
    fallback: Option<Box<dyn RoutingBackend>>,
    timeout: Duration,
    cache_ttl: chrono::Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl RoutingClient {
    pub fn new(
        primary: Box<dyn RoutingBackend>,
        fallback: Option<Box<dyn RoutingBackend>>,
        timeout: Duration,
        cache_ttl: chrono::Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build from the `[routing]` config section.
    pub fn from_config(cfg: &crate::config::RoutingConfig, cache_ttl_min: i64) -> Self {
        let primary: Box<dyn RoutingBackend> =
            Box::new(ValhallaClient::new(&cfg.endpoint, "valhalla"));
        let fallback: Option<Box<dyn RoutingBackend>> = cfg
            .fallback_endpoint
            .as_deref()
            .map(|ep| Box::new(ValhallaClient::new(ep, "fallback")) as Box<dyn RoutingBackend>);
        Self::new(
            primary,
            fallback,
            Duration::from_millis(cfg.timeout_ms),
            chrono::Duration::minutes(cache_ttl_min),
        )
    }

    fn cache_key(waypoints: &[Coordinate], profile: &TruckProfile, k: u32) -> String {
        let mut key = String::with_capacity(waypoints.len() * 20 + 32);
        for wp in waypoints {
            key.push_str(&format!("{:.5},{:.5};", wp.lat, wp.lon));
        }
        key.push_str(&profile.cache_key());
        key.push_str(&format!("|k={k}"));
        key
    }

    fn cache_get(&self, key: &str) -> Option<Vec<RoutePlan>> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(key)?;
        if Utc::now() - entry.at > self.cache_ttl {
            return None;
        }
        Some(entry.plans.clone())
    }

    fn cache_put(&self, key: String, plans: &[RoutePlan]) {
        if let Ok(mut cache) = self.cache.lock() {
            // Drop expired entries opportunistically so the map stays bounded.
            let now = Utc::now();
            cache.retain(|_, e| now - e.at <= self.cache_ttl);
            cache.insert(
                key,
                CacheEntry {
                    at: now,
                    plans: plans.to_vec(),
                },
            );
        }
    }

    async fn alternatives_with_fallback(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
        k: u32,
    ) -> Result<Vec<RoutePlan>, RoutingError> {
        match tokio::time::timeout(
            self.timeout,
            self.primary.alternatives(waypoints, profile, k),
        )
        .await
        {
            Ok(Ok(plans)) => return Ok(plans),
            Ok(Err(e)) => warn!(backend = self.primary.name(), error = %e, "Primary routing failed"),
            Err(_) => warn!(
                backend = self.primary.name(),
                timeout_ms = self.timeout.as_millis() as u64,
                "Primary routing timed out"
            ),
        }

        let Some(fallback) = self.fallback.as_ref() else {
            return Err(RoutingError::Unavailable(
                "primary failed, no fallback configured".to_string(),
            ));
        };

        match tokio::time::timeout(self.timeout, fallback.alternatives(waypoints, profile, k)).await
        {
            Ok(Ok(plans)) => Ok(plans),
            Ok(Err(e)) => Err(RoutingError::Unavailable(format!(
                "primary and fallback failed: {e}"
            ))),
            Err(_) => Err(RoutingError::Unavailable(
                "primary and fallback timed out".to_string(),
            )),
        }
    }

    /// Single best route, cached.
    pub async fn route(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
    ) -> Result<RoutePlan, RoutingError> {
        let plans = self.alternatives(waypoints, profile, 1).await?;
        plans.into_iter().next().ok_or(RoutingError::NoRoute)
    }

    /// Up to `k` alternatives, fastest first, cached.
    pub async fn alternatives(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
        k: u32,
    ) -> Result<Vec<RoutePlan>, RoutingError> {
        let key = Self::cache_key(waypoints, profile, k);
        if let Some(plans) = self.cache_get(&key) {
            debug!(waypoints = waypoints.len(), k, "Routing cache hit");
            return Ok(plans);
        }

        let plans = self.alternatives_with_fallback(waypoints, profile, k).await?;
        if plans.is_empty() {
            return Err(RoutingError::NoRoute);
        }
        self.cache_put(key, &plans);
        Ok(plans)
    }

    /// Snap a coordinate to the nearest routable road. Not cached; callers
    /// use this only when no active route polyline is available locally.
    pub async fn snap(&self, coordinate: Coordinate) -> Result<Coordinate, RoutingError> {
        match tokio::time::timeout(self.timeout, self.primary.snap(coordinate)).await {
            Ok(Ok(snapped)) => return Ok(snapped),
            Ok(Err(e)) => warn!(error = %e, "Primary snap failed"),
            Err(_) => warn!("Primary snap timed out"),
        }
        let Some(fallback) = self.fallback.as_ref() else {
            return Err(RoutingError::Unavailable("snap failed".to_string()));
        };
        match tokio::time::timeout(self.timeout, fallback.snap(coordinate)).await {
            Ok(result) => result,
            Err(_) => Err(RoutingError::Unavailable("snap timed out".to_string())),
        }
    }
}
