//! Runtime statistics snapshots

use serde::Serialize;
use std::time::Duration;

/// Why a binding was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingSetSource {
    /// Fresh selection with a route key
    Select,
    /// Reuse of an existing binding, or an explicit touch from a handler
    Touch,
}

/// Why a binding was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingClearReason {
    Expired,
    Manual,
    /// Constraint mismatch, ban, cooldown or failures on the bound channel
    Ineligible,
    /// Bound channel awaits a probe someone else already claimed
    ProbePending,
}

/// Counters describing session binding behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BindingStats {
    pub hits: u64,
    pub misses: u64,

    pub sets: u64,
    pub set_by_select: u64,
    pub set_by_touch: u64,
    pub refreshes: u64,

    pub clears: u64,
    pub clear_expired: u64,
    pub clear_manual: u64,
    pub clear_ineligible: u64,
    pub clear_probe_pending: u64,
}

impl BindingStats {
    pub(crate) fn record_set(&mut self, source: BindingSetSource, refreshed: bool) {
        self.sets += 1;
        match source {
            BindingSetSource::Select => self.set_by_select += 1,
            BindingSetSource::Touch => self.set_by_touch += 1,
        }
        if refreshed {
            self.refreshes += 1;
        }
    }

    pub(crate) fn record_clear(&mut self, reason: BindingClearReason) {
        self.clears += 1;
        match reason {
            BindingClearReason::Expired => self.clear_expired += 1,
            BindingClearReason::Manual => self.clear_manual += 1,
            BindingClearReason::Ineligible => self.clear_ineligible += 1,
            BindingClearReason::ProbePending => self.clear_probe_pending += 1,
        }
    }
}

/// Point-in-time view of one channel's routing state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeChannelStats {
    pub channel_id: i64,
    pub fail_score: u32,
    /// Remaining ban time, if banned
    pub ban_remaining: Option<Duration>,
    pub ban_streak: u32,
    /// Ban expired and nobody has probed the channel yet
    pub probe_due: bool,
    /// A request currently holds the probe claim
    pub probe_claimed: bool,
    /// The scheduler pointer points here
    pub pointer: bool,
    /// Operator forced this channel
    pub forced: bool,
}

impl RuntimeChannelStats {
    pub fn is_banned(&self) -> bool {
        self.ban_remaining.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_stats_counters() {
        let mut stats = BindingStats::default();
        stats.record_set(BindingSetSource::Select, false);
        stats.record_set(BindingSetSource::Touch, true);
        stats.record_clear(BindingClearReason::Ineligible);
        stats.record_clear(BindingClearReason::Expired);

        assert_eq!(stats.sets, 2);
        assert_eq!(stats.set_by_select, 1);
        assert_eq!(stats.set_by_touch, 1);
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.clears, 2);
        assert_eq!(stats.clear_ineligible, 1);
        assert_eq!(stats.clear_expired, 1);
        assert_eq!(stats.clear_probe_pending, 0);
    }
}
