//! Service Configuration Module
//!
//! Provides tracker configuration loaded from TOML files, replacing all
//! hardcoded thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `ROUTEPULSE_CONFIG` environment variable (path to TOML file)
//! 2. `routepulse.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(ServiceConfig::load());
//!
//! // Anywhere in the codebase:
//! let radius = config::get().dwell.radius_m;
//! ```

mod service_config;
pub mod defaults;

pub use service_config::*;

use std::sync::OnceLock;

/// Global service configuration, initialized once at startup.
static SERVICE_CONFIG: OnceLock<ServiceConfig> = OnceLock::new();

/// Initialize the global service configuration.
///
/// Must be called exactly once before any calls to `get()`. A second call
/// logs a warning and keeps the first value.
pub fn init(config: ServiceConfig) {
    if SERVICE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global service configuration.
///
/// Falls back to built-in defaults when `init()` was never called, which
/// keeps unit tests free of init boilerplate.
pub fn get() -> &'static ServiceConfig {
    SERVICE_CONFIG.get_or_init(ServiceConfig::default)
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    SERVICE_CONFIG.get().is_some()
}
