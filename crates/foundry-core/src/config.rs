use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution mode of a build. Scales timeouts, agent count, and budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    /// Smaller agent team, tighter budgets, shorter overall timeout.
    Fast,
    /// Full agent team and budgets.
    #[default]
    Full,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::Fast => write!(f, "fast"),
            BuildMode::Full => write!(f, "full"),
        }
    }
}

/// Power tier of a build. Raises the per-task token ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerTier {
    /// No boost; the mode's default token ceiling applies.
    #[default]
    None,
    /// 12k token ceiling.
    Standard,
    /// 18k token ceiling.
    Boost,
    /// 24k token ceiling.
    Max,
}

impl PowerTier {
    /// Token ceiling override for this tier, if any.
    pub fn token_ceiling(self) -> Option<u32> {
        match self {
            PowerTier::None => None,
            PowerTier::Standard => Some(12_000),
            PowerTier::Boost => Some(18_000),
            PowerTier::Max => Some(24_000),
        }
    }
}

/// Guardrail counters attached to every build.
///
/// Exceeding `max_requests` fails the build; `max_retries` is inherited by
/// every task as its retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLimits {
    /// Maximum agents spawned for one build, recovery agents included.
    pub max_agents: u32,
    /// Per-task retry ceiling.
    pub max_retries: u32,
    /// Total provider requests allowed for the build.
    pub max_requests: u32,
    /// Per-task token budget.
    pub max_tokens: u32,
}

impl BuildLimits {
    /// Default guardrails for a mode and power tier.
    pub fn for_mode(mode: BuildMode, tier: PowerTier) -> Self {
        let mut limits = match mode {
            BuildMode::Full => Self {
                max_agents: 8,
                max_retries: 3,
                max_requests: 72,
                max_tokens: 4_000,
            },
            BuildMode::Fast => Self {
                max_agents: 7,
                max_retries: 2,
                max_requests: 30,
                max_tokens: 2_000,
            },
        };
        if let Some(tokens) = tier.token_ceiling() {
            limits.max_tokens = tokens;
        }
        limits
    }

    /// Validate that the guardrails are usable.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_agents == 0 || self.max_requests == 0 || self.max_tokens == 0 {
            return Err(EngineError::Config(
                "build limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tunable parameters of the engine. All fields have serde defaults so a
/// partial TOML file (or none at all) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall build timeout in fast mode, seconds.
    #[serde(default = "default_fast_timeout_secs")]
    pub fast_build_timeout_secs: u64,
    /// Overall build timeout in full mode, seconds.
    #[serde(default = "default_full_timeout_secs")]
    pub full_build_timeout_secs: u64,
    /// Per-task provider call timeout, seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Number of concurrent task executors.
    #[serde(default = "default_executor_workers")]
    pub executor_workers: usize,

    /// Interval between phase-barrier status polls, milliseconds.
    #[serde(default = "default_phase_poll_ms")]
    pub phase_poll_ms: u64,
    /// Phase-level timeout, seconds.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Per-vote timeout during failure consensus, seconds.
    #[serde(default = "default_vote_timeout_secs")]
    pub consensus_vote_timeout_secs: u64,
    /// Votes needed for an alternative to beat the default strategy.
    #[serde(default = "default_consensus_majority")]
    pub consensus_majority: usize,
    /// Maximum providers polled for a consensus vote.
    #[serde(default = "default_consensus_voters")]
    pub consensus_voters: usize,

    /// Capacity of each subscriber event queue.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Maximum subscribers per build.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_build: usize,
    /// Seconds of silence before a subscriber counts as stale.
    #[serde(default = "default_stale_subscriber_secs")]
    pub stale_subscriber_secs: u64,

    /// TTL for finished builds, seconds.
    #[serde(default = "default_build_ttl_secs")]
    pub build_ttl_secs: u64,
    /// TTL for inactive builds (no subscribers, no updates), seconds.
    #[serde(default = "default_inactive_ttl_secs")]
    pub inactive_build_ttl_secs: u64,
    /// Grace period for terminal builds with no in-flight work, seconds.
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,
    /// Interval between eviction sweeps, seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Interval between inactivity checks, seconds.
    #[serde(default = "default_inactivity_check_secs")]
    pub inactivity_check_secs: u64,
    /// Seconds without updates before an inactivity warning.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    /// Inactivity warnings emitted before the monitor goes quiet.
    #[serde(default = "default_max_inactivity_warnings")]
    pub max_inactivity_warnings: u32,

    /// Automatic recovery passes allowed on final-readiness failure.
    #[serde(default = "default_readiness_recovery_limit")]
    pub readiness_recovery_limit: u32,

    /// Error-history characters carried into a retry prompt.
    #[serde(default = "default_error_context_chars")]
    pub error_context_chars: usize,
    /// Upstream code-context characters carried into a prompt.
    #[serde(default = "default_code_context_chars")]
    pub code_context_chars: usize,
}

fn default_fast_timeout_secs() -> u64 {
    240
}
fn default_full_timeout_secs() -> u64 {
    600
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_executor_workers() -> usize {
    4
}
fn default_phase_poll_ms() -> u64 {
    500
}
fn default_phase_timeout_secs() -> u64 {
    300
}
fn default_vote_timeout_secs() -> u64 {
    45
}
fn default_consensus_majority() -> usize {
    2
}
fn default_consensus_voters() -> usize {
    3
}
fn default_subscriber_buffer() -> usize {
    100
}
fn default_max_subscribers() -> usize {
    50
}
fn default_stale_subscriber_secs() -> u64 {
    600
}
fn default_build_ttl_secs() -> u64 {
    1_800
}
fn default_inactive_ttl_secs() -> u64 {
    900
}
fn default_terminal_grace_secs() -> u64 {
    300
}
fn default_cleanup_interval_secs() -> u64 {
    300
}
fn default_inactivity_check_secs() -> u64 {
    15
}
fn default_inactivity_threshold_secs() -> u64 {
    120
}
fn default_max_inactivity_warnings() -> u32 {
    5
}
fn default_readiness_recovery_limit() -> u32 {
    1
}
fn default_error_context_chars() -> usize {
    3_000
}
fn default_code_context_chars() -> usize {
    15_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        toml::from_str("").expect("empty config deserializes via serde defaults")
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML string. Missing fields fall back
    /// to defaults.
    pub fn from_toml(input: &str) -> EngineResult<Self> {
        toml::from_str(input).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Overall timeout for a build in the given mode. Clamped to a floor of
    /// 30 seconds so misconfiguration never produces instant failures.
    pub fn build_timeout(&self, mode: BuildMode) -> Duration {
        let secs = match mode {
            BuildMode::Fast => self.fast_build_timeout_secs,
            BuildMode::Full => self.full_build_timeout_secs,
        };
        Duration::from_secs(secs.max(30))
    }

    /// Per-task provider call timeout.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn limits_full_mode() {
        let limits = BuildLimits::for_mode(BuildMode::Full, PowerTier::None);
        assert_eq!(limits.max_agents, 8);
        assert_eq!(limits.max_retries, 3);
        assert_eq!(limits.max_requests, 72);
        assert_eq!(limits.max_tokens, 4_000);
    }

    #[test]
    fn limits_fast_mode() {
        let limits = BuildLimits::for_mode(BuildMode::Fast, PowerTier::None);
        assert_eq!(limits.max_agents, 7);
        assert_eq!(limits.max_retries, 2);
        assert_eq!(limits.max_requests, 30);
        assert_eq!(limits.max_tokens, 2_000);
    }

    #[test]
    fn power_tier_overrides_tokens() {
        let limits = BuildLimits::for_mode(BuildMode::Fast, PowerTier::Max);
        assert_eq!(limits.max_tokens, 24_000);
        let limits = BuildLimits::for_mode(BuildMode::Full, PowerTier::Boost);
        assert_eq!(limits.max_tokens, 18_000);
        let limits = BuildLimits::for_mode(BuildMode::Full, PowerTier::Standard);
        assert_eq!(limits.max_tokens, 12_000);
    }

    #[test]
    fn limits_validate_rejects_zero() {
        let mut limits = BuildLimits::for_mode(BuildMode::Full, PowerTier::None);
        limits.max_requests = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.build_timeout(BuildMode::Fast), Duration::from_secs(240));
        assert_eq!(config.build_timeout(BuildMode::Full), Duration::from_secs(600));
        assert_eq!(config.consensus_majority, 2);
        assert_eq!(config.readiness_recovery_limit, 1);
        assert_eq!(config.subscriber_buffer, 100);
    }

    #[test]
    fn config_from_partial_toml() {
        let config = EngineConfig::from_toml("full_build_timeout_secs = 120\n").unwrap();
        assert_eq!(config.full_build_timeout_secs, 120);
        // Untouched fields keep defaults
        assert_eq!(config.task_timeout_secs, 300);
    }

    #[test]
    fn build_timeout_floor() {
        let config = EngineConfig::from_toml("fast_build_timeout_secs = 1\n").unwrap();
        assert_eq!(config.build_timeout(BuildMode::Fast), Duration::from_secs(30));
    }

    #[test]
    fn config_rejects_bad_toml() {
        assert!(EngineConfig::from_toml("task_timeout_secs = \"soon\"").is_err());
    }
}
