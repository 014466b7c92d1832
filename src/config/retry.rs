use serde::Deserialize;

/// Basic retry policy template
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single backend round-trip timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_op_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Divide strategies by engine operation
#[derive(Debug, Deserialize, Clone)]
pub struct RetryPolicies {
    // First-touch priming (read-with-watch against the backend)
    #[serde(default)]
    pub activation: BackoffPolicy,

    // Pushing dirty state (dirty state must survive every failure)
    #[serde(default)]
    pub flush: BackoffPolicy,

    // Watch-fired and explicit refreshes (high frequency, cheap reads)
    #[serde(default)]
    pub sync: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            activation: BackoffPolicy {
                max_retries: 3,
                timeout_ms: 1000,
                base_delay_ms: 50,
                max_delay_ms: 1000,
            },
            flush: BackoffPolicy {
                max_retries: 5,
                timeout_ms: 1000,
                base_delay_ms: 50,
                max_delay_ms: 2000,
            },
            sync: BackoffPolicy {
                max_retries: 3,
                timeout_ms: 500,
                base_delay_ms: 50,
                max_delay_ms: 1000,
            },
        }
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    1000
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
