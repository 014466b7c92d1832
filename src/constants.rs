/// Namespace prefix under which every mirrored tree lives in the
/// coordination-service namespace: `<prefix>/<root name>/<logical path>`.
pub(crate) const DEFAULT_NAMESPACE: &str = "/prefsync";

/// Environment variable prefix for configuration overlays.
pub(crate) const ENV_PREFIX: &str = "PREFSYNC";

/// Bounded eventual-consistency window: total budget and poll step used by
/// `await_convergence` when a caller needs to observe a sibling replica's
/// flush. Watch delivery may lag the writer's flush by a short interval.
pub(crate) const DEFAULT_CONVERGENCE_TIMEOUT_MS: u64 = 500;
pub(crate) const DEFAULT_CONVERGENCE_POLL_MS: u64 = 50;
