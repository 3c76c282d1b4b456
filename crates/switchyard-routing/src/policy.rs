//! Scheduler timing knobs and failure policy
//!
//! Decides how long a failing credential cools down and whether a failure
//! is channel-wide enough to ban the channel on the spot.

use std::time::Duration;
use switchyard_core::{AttemptResult, ErrorClass};

/// Ban streaks stop growing here so `base * streak` stays bounded
pub const MAX_BAN_STREAK: u32 = 20;

/// Configuration for the scheduler and its runtime state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long a user keeps preferring the channel of their last fresh selection
    pub affinity_ttl: Duration,
    /// Lifetime of a (user, route key) session binding, refreshed on reuse
    pub binding_ttl: Duration,
    /// Sliding window for per-credential request counts
    pub rpm_window: Duration,
    /// Sliding window for per-credential token counts
    pub tpm_window: Duration,
    /// Base cooldown after a retriable failure (doubled for HTTP 429)
    pub cooldown_base: Duration,
    /// How long a probe claim on a freshly unbanned channel stays valid
    pub probe_claim_ttl: Duration,
    /// Upper bound on any single channel ban
    pub max_ban: Duration,
    /// Minimum spacing between opportunistic sweeps of expired bindings
    pub binding_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            affinity_ttl: Duration::from_secs(30 * 60),
            binding_ttl: Duration::from_secs(60 * 60),
            rpm_window: Duration::from_secs(60),
            tpm_window: Duration::from_secs(60),
            cooldown_base: Duration::from_secs(30),
            probe_claim_ttl: Duration::from_secs(30),
            max_ban: Duration::from_secs(10 * 60),
            binding_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values
    ///
    /// Returns an error if the configuration is invalid
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("affinity_ttl", self.affinity_ttl),
            ("binding_ttl", self.binding_ttl),
            ("rpm_window", self.rpm_window),
            ("tpm_window", self.tpm_window),
            ("cooldown_base", self.cooldown_base),
            ("probe_claim_ttl", self.probe_claim_ttl),
            ("max_ban", self.max_ban),
        ];
        for (name, value) in required {
            if value.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }
        if self.max_ban < self.cooldown_base {
            return Err("max_ban must be at least cooldown_base".to_string());
        }
        Ok(())
    }
}

/// Cooldown for the credential of a failed retriable attempt
pub fn credential_cooldown(result: &AttemptResult, base: Duration) -> Duration {
    if result.status_code == Some(429) {
        base.saturating_mul(2)
    } else {
        base
    }
}

/// Ban length for the given streak, before clamping
pub fn ban_increment(base: Duration, streak: u32) -> Duration {
    base.saturating_mul(streak.min(MAX_BAN_STREAK))
}

/// Whether a failure indicates the whole channel is unreachable.
///
/// Credential-scoped statuses (401/402/403/429) never qualify: another
/// credential on the same channel should get a chance first. Transport
/// failures do, and so do 404/405 from the upstream since those usually
/// mean a wrong base URL or unsupported path. The 404/405 rule is a policy
/// choice; upstreams that return 404 for missing objects will get banned.
pub fn should_ban_channel_immediately(result: &AttemptResult) -> bool {
    if matches!(result.status_code, Some(401 | 402 | 403 | 429)) {
        return false;
    }

    match result.error_class {
        Some(
            ErrorClass::Network
            | ErrorClass::ReadUpstream
            | ErrorClass::StreamIdleTimeout
            | ErrorClass::StreamReadError
            | ErrorClass::StreamFirstByteTimeout,
        ) => true,
        Some(ErrorClass::UpstreamStatus) => matches!(result.status_code, Some(404 | 405)),
        _ => false,
    }
}
