//! Configuration for the preference synchronization engine.
//!
//! Loading priority:
//! 1. Default values (hardcoded)
//! 2. Optional config file
//! 3. Environment variables, `PREFSYNC_` prefixed (highest priority)

mod retry;
pub use retry::*;

#[cfg(test)]
mod config_test;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::constants::DEFAULT_CONVERGENCE_POLL_MS;
use crate::constants::DEFAULT_CONVERGENCE_TIMEOUT_MS;
use crate::constants::DEFAULT_NAMESPACE;
use crate::constants::ENV_PREFIX;
use crate::Result;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Coordination-service namespace and convergence windows
    #[serde(default)]
    pub backend: BackendConfig,
    /// Retry policies for backend round trips
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl Settings {
    /// Load configuration from defaults, an optional file, and the
    /// environment, later sources overriding earlier ones.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Prefix under which every mirrored tree lives: `<namespace>/<root name>/...`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Total budget for `await_convergence` polling (unit: milliseconds).
    /// Watch delivery lags a sibling replica's flush by a short, bounded
    /// interval; consumers needing tight synchronization poll within this
    /// window instead of assuming instant convergence.
    #[serde(default = "default_convergence_timeout_ms")]
    pub convergence_timeout_ms: u64,

    /// Poll step within the convergence window (unit: milliseconds)
    #[serde(default = "default_convergence_poll_ms")]
    pub convergence_poll_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            convergence_timeout_ms: default_convergence_timeout_ms(),
            convergence_poll_ms: default_convergence_poll_ms(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
fn default_convergence_timeout_ms() -> u64 {
    DEFAULT_CONVERGENCE_TIMEOUT_MS
}
fn default_convergence_poll_ms() -> u64 {
    DEFAULT_CONVERGENCE_POLL_MS
}
