//! Weather and traffic signal providers.
//!
//! Providers return cacheable samples keyed by coarse spatial buckets and
//! time windows. Unavailability is non-fatal: the classifier and estimator
//! treat a missing sample as a missing input and degrade confidence.

pub mod traffic;
pub mod weather;

pub use traffic::{StaticTraffic, TrafficProvider};
pub use weather::{StaticWeather, WeatherProvider};

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::Coordinate;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    /// A sample exists but is older than its freshness window.
    #[error("Signal sample is stale")]
    Stale,

    /// Provider unreachable or not configured.
    #[error("Signal provider unavailable: {0}")]
    Unavailable(String),
}

/// Spatial cache bucket: coordinates quantized to a grid edge in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    lat_q: i32,
    lon_q: i32,
}

impl BucketKey {
    pub fn for_coordinate(coordinate: Coordinate, bucket_deg: f64) -> Self {
        Self {
            lat_q: (coordinate.lat / bucket_deg).floor() as i32,
            lon_q: (coordinate.lon / bucket_deg).floor() as i32,
        }
    }
}

/// TTL cache shared by both providers. Read-mostly; writes are idempotent
/// within a bucket+window, so a plain mutex is enough.
pub(crate) struct SampleCache<T> {
    entries: Mutex<HashMap<BucketKey, (DateTime<Utc>, T)>>,
    ttl: Duration,
    bucket_deg: f64,
}

impl<T: Clone> SampleCache<T> {
    pub fn new(ttl: Duration, bucket_deg: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            bucket_deg,
        }
    }

    pub fn get(&self, coordinate: Coordinate, now: DateTime<Utc>) -> Option<T> {
        let key = BucketKey::for_coordinate(coordinate, self.bucket_deg);
        let entries = self.entries.lock().ok()?;
        let (at, sample) = entries.get(&key)?;
        if now - *at > self.ttl {
            return None;
        }
        Some(sample.clone())
    }

    /// Whether the bucket holds an entry older than its freshness window.
    /// Used to report `Stale` (rather than `Unavailable`) when a refetch
    /// fails but an expired observation exists.
    pub fn has_expired(&self, coordinate: Coordinate, now: DateTime<Utc>) -> bool {
        let key = BucketKey::for_coordinate(coordinate, self.bucket_deg);
        match self.entries.lock() {
            Ok(entries) => entries
                .get(&key)
                .map(|(at, _)| now - *at > self.ttl)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn put(&self, coordinate: Coordinate, now: DateTime<Utc>, sample: T) {
        let key = BucketKey::for_coordinate(coordinate, self.bucket_deg);
        if let Ok(mut entries) = self.entries.lock() {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| now - *at <= ttl);
            entries.insert(key, (now, sample));
        }
    }
}
