use std::time::Duration;

use crate::control::Role;

/// Pacing interval between outbound connectivity checks.
pub(crate) const DEFAULT_TA: Duration = Duration::from_millis(20);

/// Interval between keep-alive indications once a check list completed.
/// Configured values below this floor are clamped up to it.
pub(crate) const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Cap on the size of a check list.
pub(crate) const DEFAULT_MAX_CONNECTIVITY_CHECKS: usize = 100;

/// Collects the arguments to [`Agent`](crate::agent::Agent) construction.
#[derive(Default)]
pub struct AgentConfig {
    pub role: Role,

    /// Local username fragment, 8 hex chars generated when empty.
    pub local_ufrag: String,
    /// Local password, 24 hex chars generated when empty.
    pub local_pwd: String,

    /// Upper bound on the number of pairs kept per check list.
    /// Defaults to 100 when zero.
    pub max_connectivity_checks: usize,

    /// Keep-alive interval after completion, clamped to at least 15 s.
    /// Defaults to 15 s when zero.
    pub keepalive_timeout: Duration,
}
