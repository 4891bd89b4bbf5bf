//! Service configuration loaded from TOML.
//!
//! Every operator-tunable threshold in the tracking engine lives here, with
//! built-in defaults matching `defaults.rs`. Unknown keys are rejected so a
//! typo in the file fails loudly at startup instead of silently using a
//! default.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Sled database directory.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/routepulse".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PositionConfig {
    pub max_accuracy_m: f64,
    pub max_age_secs: i64,
    pub max_skew_secs: i64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: defaults::MAX_ACCURACY_M,
            max_age_secs: defaults::MAX_POSITION_AGE_SECS,
            max_skew_secs: defaults::MAX_POSITION_SKEW_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnapConfig {
    pub max_cross_track_m: f64,
    pub min_progress_tolerance_m: f64,
    pub max_edge_speed_kph: f64,
    pub edge_speed_lowpass: f64,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            max_cross_track_m: defaults::MAX_CROSS_TRACK_M,
            min_progress_tolerance_m: defaults::MIN_PROGRESS_TOLERANCE_M,
            max_edge_speed_kph: defaults::MAX_EDGE_SPEED_KPH,
            edge_speed_lowpass: defaults::EDGE_SPEED_LOWPASS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EtaConfig {
    pub alpha: f64,
    pub confidence_high_dev_min: f64,
    pub confidence_medium_dev_min: f64,
    pub min_effective_speed_mps: f64,
    pub stop_off_route_m: f64,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            alpha: defaults::ETA_ALPHA,
            confidence_high_dev_min: defaults::CONFIDENCE_HIGH_DEV_MIN,
            confidence_medium_dev_min: defaults::CONFIDENCE_MEDIUM_DEV_MIN,
            min_effective_speed_mps: defaults::MIN_EFFECTIVE_SPEED_MPS,
            stop_off_route_m: defaults::STOP_OFF_ROUTE_M,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DwellConfig {
    pub radius_m: f64,
    pub stopped_speed_kph: f64,
    pub departure_min_secs: i64,
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self {
            radius_m: defaults::DWELL_RADIUS_M,
            stopped_speed_kph: defaults::STOPPED_SPEED_KPH,
            departure_min_secs: defaults::DEPARTURE_MIN_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClassifyConfig {
    pub min_score: f64,
    pub traffic_congestion_factor: f64,
    pub weather_precip_mm_h: f64,
    pub late_threshold_min: f64,
    pub hos_drive_ceiling_hours: f64,
    pub hos_warning_hours: f64,
    pub lookahead_min: f64,
    pub vehicle_event_window_min: i64,
    pub off_route_rejections: u32,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            min_score: defaults::CLASSIFY_MIN_SCORE,
            traffic_congestion_factor: defaults::TRAFFIC_CONGESTION_FACTOR,
            weather_precip_mm_h: defaults::WEATHER_PRECIP_MM_H,
            late_threshold_min: defaults::LATE_THRESHOLD_MIN,
            hos_drive_ceiling_hours: defaults::HOS_DRIVE_CEILING_HOURS,
            hos_warning_hours: defaults::HOS_WARNING_HOURS,
            lookahead_min: defaults::CLASSIFY_LOOKAHEAD_MIN,
            vehicle_event_window_min: defaults::VEHICLE_EVENT_WINDOW_MIN,
            off_route_rejections: defaults::OFF_ROUTE_REJECTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RerouteConfig {
    pub min_saving_min: f64,
    pub proposal_ttl_min: i64,
    pub alternatives: u32,
    pub detour_fraction: f64,
    pub detour_penalty_min: f64,
    pub lateness_trigger_min: f64,
}

impl Default for RerouteConfig {
    fn default() -> Self {
        Self {
            min_saving_min: defaults::REROUTE_MIN_SAVING_MIN,
            proposal_ttl_min: defaults::REROUTE_PROPOSAL_TTL_MIN,
            alternatives: defaults::REROUTE_ALTERNATIVES,
            detour_fraction: defaults::REROUTE_DETOUR_FRACTION,
            detour_penalty_min: defaults::REROUTE_DETOUR_PENALTY_MIN,
            lateness_trigger_min: defaults::REROUTE_LATENESS_TRIGGER_MIN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub per_shipment_capacity: usize,
    pub admission_timeout_ms: u64,
    pub degraded_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            per_shipment_capacity: defaults::PER_SHIPMENT_QUEUE,
            admission_timeout_ms: defaults::ADMISSION_TIMEOUT_MS,
            degraded_buffer: defaults::DEGRADED_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SubscriberConfig {
    pub buffer: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            buffer: defaults::SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub weather_ttl_min: i64,
    pub traffic_ttl_min: i64,
    pub route_ttl_min: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            weather_ttl_min: defaults::WEATHER_TTL_MIN,
            traffic_ttl_min: defaults::TRAFFIC_TTL_MIN,
            route_ttl_min: defaults::ROUTE_CACHE_TTL_MIN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
    /// Primary routing endpoint (Valhalla-compatible).
    pub endpoint: String,
    /// Optional fallback endpoint tried once when the primary fails.
    pub fallback_endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8002".to_string(),
            fallback_endpoint: None,
            timeout_ms: defaults::ROUTING_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SignalsConfig {
    /// Weather provider endpoint; empty disables the provider.
    pub weather_endpoint: String,
    /// Traffic provider endpoint; empty disables the provider.
    pub traffic_endpoint: String,
    pub timeout_ms: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            weather_endpoint: String::new(),
            traffic_endpoint: String::new(),
            timeout_ms: defaults::SIGNAL_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Top-level config
// ============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub position: PositionConfig,
    pub snap: SnapConfig,
    pub eta: EtaConfig,
    pub dwell: DwellConfig,
    pub classify: ClassifyConfig,
    pub reroute: RerouteConfig,
    pub queue: QueueConfig,
    pub subscriber: SubscriberConfig,
    pub cache: CacheConfig,
    pub routing: RoutingConfig,
    pub signals: SignalsConfig,
}

impl ServiceConfig {
    /// Load configuration with the standard precedence:
    ///
    /// 1. `ROUTEPULSE_CONFIG` environment variable (path to TOML file)
    /// 2. `routepulse.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("ROUTEPULSE_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    info!(path = %path, "Loaded config from ROUTEPULSE_CONFIG");
                    return cfg;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Config from env var failed, trying defaults");
                }
            }
        }

        const LOCAL: &str = "routepulse.toml";
        if std::path::Path::new(LOCAL).exists() {
            match Self::from_file(LOCAL) {
                Ok(cfg) => {
                    info!(path = LOCAL, "Loaded config from working directory");
                    return cfg;
                }
                Err(e) => {
                    warn!(error = %e, "routepulse.toml unreadable, using built-in defaults");
                }
            }
        }

        info!("Using built-in default configuration");
        Self::default()
    }

    /// Parse a TOML file into a config.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Check values for obvious operator mistakes.
    ///
    /// Fatal problems (a zero queue, alpha outside (0,1]) return an error;
    /// suspicious-but-workable values come back as warnings for the log.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        if self.queue.per_shipment_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue.per_shipment_capacity must be at least 1".to_string(),
            ));
        }
        if self.subscriber.buffer == 0 {
            return Err(ConfigError::Invalid(
                "subscriber.buffer must be at least 1".to_string(),
            ));
        }
        if !(self.eta.alpha > 0.0 && self.eta.alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "eta.alpha must be in (0, 1], got {}",
                self.eta.alpha
            )));
        }
        if self.position.max_accuracy_m <= 0.0 {
            return Err(ConfigError::Invalid(
                "position.max_accuracy_m must be positive".to_string(),
            ));
        }

        if self.position.max_accuracy_m > 200.0 {
            warnings.push(format!(
                "position.max_accuracy_m = {} admits very poor fixes",
                self.position.max_accuracy_m
            ));
        }
        if self.snap.max_cross_track_m < 20.0 {
            warnings.push(format!(
                "snap.max_cross_track_m = {} will reject most urban fixes",
                self.snap.max_cross_track_m
            ));
        }
        if self.reroute.min_saving_min < 2.0 {
            warnings.push(format!(
                "reroute.min_saving_min = {} will spam proposals",
                self.reroute.min_saving_min
            ));
        }
        if self.cache.traffic_ttl_min > self.cache.weather_ttl_min {
            warnings.push("cache.traffic_ttl_min exceeds weather TTL; traffic normally ages faster".to_string());
        }

        Ok(warnings)
    }
}
