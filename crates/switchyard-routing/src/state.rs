//! Runtime scheduling state
//!
//! Every adaptive, time-bounded piece of routing state lives behind one
//! mutex: session bindings, user affinity, per-credential rate windows,
//! cooldowns, fail scores, channel bans and probe claims, the channel
//! pointer and its ring, the forced-channel override and the last success.
//!
//! Each critical section is O(1) or O(window size). Entries expire lazily
//! when read; the only sweep is an opportunistic pass over expired bindings,
//! run at most once per `binding_sweep_interval`, which keeps per-credential
//! session counts from drifting.
//!
//! Methods take the current time explicitly so callers (and tests) control
//! the clock.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use switchyard_core::{PointerReason, Selection};
use tracing::{debug, info, warn};

use crate::policy::{MAX_BAN_STREAK, ban_increment};
use crate::stats::{BindingClearReason, BindingSetSource, BindingStats, RuntimeChannelStats};

/// Observable value of the scheduler channel pointer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPointerSnapshot {
    /// 0 when no pointer is set
    pub channel_id: i64,
    pub pinned: bool,
    pub moved_at: Option<DateTime<Utc>>,
    pub reason: Option<PointerReason>,
}

/// Callback fired (outside the state lock) when the pointer's channel or
/// pinned flag changes
pub type PointerChangeHook = Arc<dyn Fn(&ChannelPointerSnapshot) + Send + Sync>;

/// Most recent successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSuccess {
    pub selection: Selection,
    pub at: DateTime<Utc>,
}

type PendingNotify = Option<(PointerChangeHook, ChannelPointerSnapshot)>;

#[derive(Debug)]
struct BindingEntry {
    selection: Selection,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct AffinityEntry {
    channel_id: i64,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct ForcedChannel {
    channel_id: i64,
    until: Instant,
}

#[derive(Debug, Default)]
struct ChannelPointer {
    channel_id: i64,
    pinned: bool,
    moved_at: Option<DateTime<Utc>>,
    reason: Option<PointerReason>,
    ring: Vec<i64>,
    index: HashMap<i64, usize>,
}

impl ChannelPointer {
    fn snapshot(&self) -> ChannelPointerSnapshot {
        ChannelPointerSnapshot {
            channel_id: self.channel_id,
            pinned: self.pinned,
            moved_at: self.moved_at,
            reason: self.reason,
        }
    }

    fn mark_moved(&mut self, reason: PointerReason) {
        self.moved_at = Some(Utc::now());
        self.reason = Some(reason);
    }

    /// Keep the pointed channel addressable when a ring exists
    fn ensure_in_ring(&mut self) {
        if self.channel_id <= 0 || self.ring.is_empty() {
            return;
        }
        if !self.index.contains_key(&self.channel_id) {
            self.index.insert(self.channel_id, self.ring.len());
            self.ring.push(self.channel_id);
        }
    }
}

#[derive(Default)]
struct StateInner {
    bindings: HashMap<(i64, String), BindingEntry>,
    affinity: HashMap<i64, AffinityEntry>,
    binding_stats: BindingStats,

    rpm: HashMap<String, VecDeque<Instant>>,
    tokens: HashMap<String, VecDeque<(Instant, u64)>>,

    credential_sessions: HashMap<String, usize>,
    last_binding_sweep: Option<Instant>,

    credential_cooldown: HashMap<String, Instant>,

    channel_fails: HashMap<i64, u32>,
    credential_fails: HashMap<String, u32>,

    channel_ban_until: HashMap<i64, Instant>,
    channel_ban_streak: HashMap<i64, u32>,

    probe_due_at: HashMap<i64, Instant>,
    probe_claim_until: HashMap<i64, Instant>,

    pointer: ChannelPointer,
    pointer_hook: Option<PointerChangeHook>,

    forced: Option<ForcedChannel>,
    last_success: Option<LastSuccess>,
}

impl StateInner {
    fn inc_sessions(&mut self, credential_key: &str) {
        *self
            .credential_sessions
            .entry(credential_key.to_string())
            .or_insert(0) += 1;
    }

    fn dec_sessions(&mut self, credential_key: &str) {
        if let Some(count) = self.credential_sessions.get_mut(credential_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.credential_sessions.remove(credential_key);
            }
        }
    }

    fn sweep_expired_bindings(&mut self, now: Instant) {
        let expired: Vec<(i64, String)> = self
            .bindings
            .iter()
            .filter(|(_, entry)| now > entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.bindings.remove(&key) {
                self.dec_sessions(&entry.selection.credential_key());
                self.binding_stats.record_clear(BindingClearReason::Expired);
            }
        }
    }

    fn maybe_sweep_bindings(&mut self, now: Instant, interval: Duration) {
        if let Some(last) = self.last_binding_sweep
            && now.saturating_duration_since(last) < interval
        {
            return;
        }
        self.last_binding_sweep = Some(now);
        self.sweep_expired_bindings(now);
    }

    /// Expire a passed ban into the probe-due set
    fn expire_ban(&mut self, channel_id: i64, now: Instant) {
        self.channel_ban_until.remove(&channel_id);
        self.probe_due_at.entry(channel_id).or_insert(now);
        self.probe_claim_until.remove(&channel_id);
    }

    fn is_banned(&mut self, channel_id: i64, now: Instant) -> bool {
        let Some(&until) = self.channel_ban_until.get(&channel_id) else {
            return false;
        };
        if now > until {
            self.expire_ban(channel_id, now);
            debug!(channel_id, "Channel ban expired, probe due");
            return false;
        }
        true
    }

    fn ban_active(&self, channel_id: i64, now: Instant) -> bool {
        self.channel_ban_until
            .get(&channel_id)
            .is_some_and(|until| now <= *until)
    }

    /// Move the pointer to the next non-banned ring entry
    fn advance_pointer(&mut self, now: Instant, reason: PointerReason) -> bool {
        if self.pointer.channel_id <= 0 || self.pointer.ring.is_empty() {
            return false;
        }
        let Some(&start) = self.pointer.index.get(&self.pointer.channel_id) else {
            self.pointer.channel_id = self.pointer.ring[0];
            self.pointer.mark_moved(PointerReason::Invalid);
            return true;
        };
        let len = self.pointer.ring.len();
        for step in 1..=len {
            let next = self.pointer.ring[(start + step) % len];
            if next <= 0 || self.ban_active(next, now) {
                continue;
            }
            self.pointer.channel_id = next;
            self.pointer.mark_moved(reason);
            return true;
        }
        false
    }

    /// Repair the pointer against the ring and current bans
    fn resolve_pointer(&mut self, now: Instant) {
        if self.pointer.ring.is_empty() {
            return;
        }
        if !self.pointer.index.contains_key(&self.pointer.channel_id) {
            self.pointer.channel_id = self.pointer.ring[0];
            self.pointer.mark_moved(PointerReason::Invalid);
        }
        for _ in 0..self.pointer.ring.len() {
            if self.pointer.channel_id <= 0 || !self.ban_active(self.pointer.channel_id, now) {
                break;
            }
            if !self.advance_pointer(now, PointerReason::Ban) {
                break;
            }
        }
    }

    fn pointer_notify(&self, old_id: i64, old_pinned: bool) -> PendingNotify {
        if self.pointer.channel_id == old_id && self.pointer.pinned == old_pinned {
            return None;
        }
        info!(
            from = old_id,
            to = self.pointer.channel_id,
            pinned = self.pointer.pinned,
            reason = self.pointer.reason.map(|r| r.as_str()).unwrap_or(""),
            "Channel pointer moved"
        );
        self.pointer_hook
            .clone()
            .map(|hook| (hook, self.pointer.snapshot()))
    }

    fn apply_ban(
        &mut self,
        channel_id: i64,
        now: Instant,
        base: Duration,
        max_ban: Duration,
        immediate: bool,
    ) -> Option<Instant> {
        let previous = self.channel_ban_streak.get(&channel_id).copied().unwrap_or(0);
        let streak = (previous + 1).min(MAX_BAN_STREAK);
        self.channel_ban_streak.insert(channel_id, streak);

        if !immediate && streak < 2 {
            // First failure is absorbed so another credential on the channel can take over
            self.channel_ban_until.remove(&channel_id);
            return None;
        }

        let start = match self.channel_ban_until.get(&channel_id) {
            Some(&until) if until > now => until,
            _ => now,
        };
        let max_until = now.checked_add(max_ban).unwrap_or(now);
        let until = start
            .checked_add(ban_increment(base, streak))
            .map_or(max_until, |u| u.min(max_until));
        self.channel_ban_until.insert(channel_id, until);

        warn!(
            channel_id,
            streak,
            immediate,
            ban_secs = until.saturating_duration_since(now).as_secs_f64(),
            "Channel banned"
        );

        if self.pointer.channel_id == channel_id {
            self.advance_pointer(now, PointerReason::Ban);
        }
        Some(until)
    }
}

fn notify(pending: PendingNotify) {
    if let Some((hook, snapshot)) = pending {
        hook(&snapshot);
    }
}

fn prune_window(events: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else {
        return;
    };
    while events.front().is_some_and(|t| *t <= cutoff) {
        events.pop_front();
    }
}

/// Shared runtime scheduling state
pub struct RuntimeState {
    inner: Mutex<StateInner>,
    max_ban: Duration,
    binding_sweep_interval: Duration,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("max_ban", &self.max_ban)
            .field("binding_sweep_interval", &self.binding_sweep_interval)
            .finish_non_exhaustive()
    }
}

impl RuntimeState {
    /// Create state with a 10 minute ban ceiling and a 10 second binding sweep interval
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(600), Duration::from_secs(10))
    }

    pub fn with_limits(max_ban: Duration, binding_sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            max_ban,
            binding_sweep_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- session bindings -------------------------------------------------

    /// Look up a live binding, counting the hit or miss
    pub fn get_binding(
        &self,
        user_id: i64,
        route_key_hash: &str,
        now: Instant,
    ) -> Option<Selection> {
        let mut inner = self.lock();
        let key = (user_id, route_key_hash.to_string());
        let expired = match inner.bindings.get(&key) {
            None => {
                inner.binding_stats.misses += 1;
                return None;
            }
            Some(entry) => now > entry.expires_at,
        };
        if expired {
            if let Some(entry) = inner.bindings.remove(&key) {
                inner.dec_sessions(&entry.selection.credential_key());
            }
            inner.binding_stats.record_clear(BindingClearReason::Expired);
            inner.binding_stats.misses += 1;
            return None;
        }
        inner.binding_stats.hits += 1;
        inner.bindings.get(&key).map(|entry| entry.selection.clone())
    }

    pub fn has_binding(&self, user_id: i64, route_key_hash: &str, now: Instant) -> bool {
        let inner = self.lock();
        inner
            .bindings
            .get(&(user_id, route_key_hash.to_string()))
            .is_some_and(|entry| now <= entry.expires_at)
    }

    /// Create or refresh a binding; returns whether a live binding was refreshed
    pub fn set_binding(
        &self,
        user_id: i64,
        route_key_hash: &str,
        selection: Selection,
        expires_at: Instant,
        now: Instant,
        source: BindingSetSource,
    ) -> bool {
        let mut inner = self.lock();
        let key = (user_id, route_key_hash.to_string());
        let next_key = selection.credential_key();

        let previous = inner.bindings.remove(&key);
        let refreshed = match previous {
            Some(prev) if now <= prev.expires_at => {
                let prev_key = prev.selection.credential_key();
                if prev_key != next_key {
                    inner.dec_sessions(&prev_key);
                    inner.inc_sessions(&next_key);
                }
                true
            }
            Some(prev) => {
                inner.dec_sessions(&prev.selection.credential_key());
                inner.binding_stats.record_clear(BindingClearReason::Expired);
                inner.inc_sessions(&next_key);
                false
            }
            None => {
                inner.inc_sessions(&next_key);
                false
            }
        };
        inner.bindings.insert(
            key,
            BindingEntry {
                selection,
                expires_at,
            },
        );
        inner.binding_stats.record_set(source, refreshed);
        refreshed
    }

    pub fn clear_binding(
        &self,
        user_id: i64,
        route_key_hash: &str,
        now: Instant,
        reason: BindingClearReason,
    ) {
        let mut inner = self.lock();
        if let Some(entry) = inner.bindings.remove(&(user_id, route_key_hash.to_string())) {
            // Expired entries were already excluded from the live count by the sweep
            // or will never be counted again, so only live ones decrement.
            if now <= entry.expires_at {
                inner.dec_sessions(&entry.selection.credential_key());
            }
        }
        inner.binding_stats.record_clear(reason);
    }

    pub fn binding_stats(&self) -> BindingStats {
        self.lock().binding_stats
    }

    // ---- affinity -----------------------------------------------------------

    pub fn set_affinity(&self, user_id: i64, channel_id: i64, expires_at: Instant) {
        self.lock().affinity.insert(
            user_id,
            AffinityEntry {
                channel_id,
                expires_at,
            },
        );
    }

    pub fn affinity(&self, user_id: i64, now: Instant) -> Option<i64> {
        let mut inner = self.lock();
        let entry = *inner.affinity.get(&user_id)?;
        if now > entry.expires_at {
            inner.affinity.remove(&user_id);
            return None;
        }
        Some(entry.channel_id)
    }

    // ---- rate windows -------------------------------------------------------

    pub fn record_rpm(&self, credential_key: &str, at: Instant) {
        self.lock()
            .rpm
            .entry(credential_key.to_string())
            .or_default()
            .push_back(at);
    }

    /// Requests recorded for the credential within `window` before `now`
    pub fn rpm(&self, credential_key: &str, now: Instant, window: Duration) -> usize {
        let mut inner = self.lock();
        let Some(events) = inner.rpm.get_mut(credential_key) else {
            return 0;
        };
        prune_window(events, now.checked_sub(window));
        let count = events.len();
        if count == 0 {
            inner.rpm.remove(credential_key);
        }
        count
    }

    pub fn record_tokens(&self, credential_key: &str, at: Instant, tokens: u64) {
        if credential_key.is_empty() || tokens == 0 {
            return;
        }
        self.lock()
            .tokens
            .entry(credential_key.to_string())
            .or_default()
            .push_back((at, tokens));
    }

    /// Tokens recorded for the credential within `window` before `now`
    pub fn tpm(&self, credential_key: &str, now: Instant, window: Duration) -> u64 {
        let mut inner = self.lock();
        let Some(events) = inner.tokens.get_mut(credential_key) else {
            return 0;
        };
        if let Some(cutoff) = now.checked_sub(window) {
            while events.front().is_some_and(|(t, _)| *t <= cutoff) {
                events.pop_front();
            }
        }
        let total = events.iter().map(|(_, tokens)| *tokens).sum();
        if events.is_empty() {
            inner.tokens.remove(credential_key);
        }
        total
    }

    /// Live bindings currently pointing at the credential
    pub fn credential_sessions(&self, credential_key: &str, now: Instant) -> usize {
        if credential_key.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        inner.maybe_sweep_bindings(now, self.binding_sweep_interval);
        inner
            .credential_sessions
            .get(credential_key)
            .copied()
            .unwrap_or(0)
    }

    // ---- credential cooldowns and fail scores ------------------------------

    pub fn set_credential_cooling(&self, credential_key: &str, until: Instant) {
        debug!(credential_key = %credential_key, "Credential cooling down");
        self.lock()
            .credential_cooldown
            .insert(credential_key.to_string(), until);
    }

    pub fn is_credential_cooling(&self, credential_key: &str, now: Instant) -> bool {
        self.credential_cooling_until(credential_key, now).is_some()
    }

    pub fn credential_cooling_until(&self, credential_key: &str, now: Instant) -> Option<Instant> {
        let mut inner = self.lock();
        let until = *inner.credential_cooldown.get(credential_key)?;
        if now > until {
            inner.credential_cooldown.remove(credential_key);
            return None;
        }
        Some(until)
    }

    pub fn record_channel_failure(&self, channel_id: i64) {
        *self.lock().channel_fails.entry(channel_id).or_insert(0) += 1;
    }

    pub fn record_credential_failure(&self, credential_key: &str) {
        *self
            .lock()
            .credential_fails
            .entry(credential_key.to_string())
            .or_insert(0) += 1;
    }

    pub fn channel_fail_score(&self, channel_id: i64) -> u32 {
        self.lock()
            .channel_fails
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn credential_fail_score(&self, credential_key: &str) -> u32 {
        self.lock()
            .credential_fails
            .get(credential_key)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_channel_fail_score(&self, channel_id: i64) {
        self.lock().channel_fails.remove(&channel_id);
    }

    pub fn reset_credential_fail_score(&self, credential_key: &str) {
        self.lock().credential_fails.remove(credential_key);
    }

    // ---- channel bans -------------------------------------------------------

    /// Whether the channel is banned; an expired ban becomes probe-due
    pub fn is_channel_banned(&self, channel_id: i64, now: Instant) -> bool {
        if channel_id == 0 {
            return false;
        }
        self.lock().is_banned(channel_id, now)
    }

    pub fn channel_ban_until(&self, channel_id: i64, now: Instant) -> Option<Instant> {
        let mut inner = self.lock();
        if !inner.is_banned(channel_id, now) {
            return None;
        }
        inner.channel_ban_until.get(&channel_id).copied()
    }

    pub fn channel_ban_streak(&self, channel_id: i64) -> u32 {
        self.lock()
            .channel_ban_streak
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drop ban, streak and probe state for the channel
    pub fn clear_channel_ban(&self, channel_id: i64) {
        if channel_id == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.channel_ban_until.remove(&channel_id);
        inner.channel_ban_streak.remove(&channel_id);
        inner.probe_due_at.remove(&channel_id);
        inner.probe_claim_until.remove(&channel_id);
    }

    /// Streak-gated ban.
    ///
    /// The first failure only bumps the streak; from the second on the
    /// channel is banned for `base * streak`, stacked on any ban still
    /// running and clamped to the ban ceiling. Returns the ban end, or
    /// `None` while the streak is below the threshold.
    pub fn ban_channel(&self, channel_id: i64, now: Instant, base: Duration) -> Option<Instant> {
        self.ban(channel_id, now, base, false)
    }

    /// Ban without the streak gate, for channel-wide failures
    pub fn ban_channel_immediate(
        &self,
        channel_id: i64,
        now: Instant,
        base: Duration,
    ) -> Option<Instant> {
        self.ban(channel_id, now, base, true)
    }

    fn ban(
        &self,
        channel_id: i64,
        now: Instant,
        base: Duration,
        immediate: bool,
    ) -> Option<Instant> {
        if channel_id == 0 || base.is_zero() {
            return None;
        }
        let (until, pending) = {
            let mut inner = self.lock();
            let old_id = inner.pointer.channel_id;
            let old_pinned = inner.pointer.pinned;
            let until = inner.apply_ban(channel_id, now, base, self.max_ban, immediate);
            (until, inner.pointer_notify(old_id, old_pinned))
        };
        notify(pending);
        until
    }

    /// Convert every passed ban into a probe-due entry
    pub fn sweep_expired_channel_bans(&self, now: Instant) {
        let mut inner = self.lock();
        let expired: Vec<i64> = inner
            .channel_ban_until
            .iter()
            .filter(|(_, until)| now > **until)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in expired {
            inner.expire_ban(channel_id, now);
        }
    }

    // ---- probes -------------------------------------------------------------

    /// Probe due and nobody holds a live claim
    pub fn is_channel_probe_pending(&self, channel_id: i64, now: Instant) -> bool {
        if channel_id == 0 {
            return false;
        }
        let mut inner = self.lock();
        if !inner.probe_due_at.contains_key(&channel_id) {
            return false;
        }
        match inner.probe_claim_until.get(&channel_id).copied() {
            Some(until) if now > until => {
                inner.probe_claim_until.remove(&channel_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn is_channel_probe_due(&self, channel_id: i64) -> bool {
        channel_id != 0 && self.lock().probe_due_at.contains_key(&channel_id)
    }

    /// Single-flight claim on probing a freshly unbanned channel
    pub fn try_claim_channel_probe(&self, channel_id: i64, now: Instant, ttl: Duration) -> bool {
        if channel_id == 0 {
            return false;
        }
        let ttl = if ttl.is_zero() { Duration::from_secs(30) } else { ttl };
        let mut inner = self.lock();
        if !inner.probe_due_at.contains_key(&channel_id) {
            return false;
        }
        if let Some(&until) = inner.probe_claim_until.get(&channel_id)
            && now <= until
        {
            return false;
        }
        let until = now.checked_add(ttl).unwrap_or(now);
        inner.probe_claim_until.insert(channel_id, until);
        debug!(channel_id, "Probe claimed");
        true
    }

    pub fn release_channel_probe_claim(&self, channel_id: i64) {
        if channel_id == 0 {
            return;
        }
        if self.lock().probe_claim_until.remove(&channel_id).is_some() {
            debug!(channel_id, "Probe claim released");
        }
    }

    pub fn clear_channel_probe(&self, channel_id: i64) {
        if channel_id == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.probe_due_at.remove(&channel_id);
        inner.probe_claim_until.remove(&channel_id);
    }

    /// Unclaimed probe-due channels, oldest first (ties by id); limit 0 means 20
    pub fn list_probe_due_channels(&self, now: Instant, limit: usize) -> Vec<i64> {
        let limit = if limit == 0 { 20 } else { limit };
        let mut inner = self.lock();
        let due: Vec<(i64, Instant)> = inner
            .probe_due_at
            .iter()
            .map(|(id, at)| (*id, *at))
            .collect();
        let mut ready = Vec::with_capacity(due.len());
        for (channel_id, due_at) in due {
            match inner.probe_claim_until.get(&channel_id).copied() {
                Some(until) if now <= until => continue,
                Some(_) => {
                    inner.probe_claim_until.remove(&channel_id);
                }
                None => {}
            }
            ready.push((channel_id, due_at));
        }
        ready.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        ready.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    // ---- channel pointer ----------------------------------------------------

    pub fn set_pointer_hook(&self, hook: PointerChangeHook) {
        self.lock().pointer_hook = Some(hook);
    }

    pub fn channel_pointer_snapshot(&self) -> ChannelPointerSnapshot {
        self.lock().pointer.snapshot()
    }

    /// Pin the pointer to a channel; a non-positive id clears it
    pub fn pin_channel_pointer(&self, channel_id: i64) {
        let pending = {
            let mut inner = self.lock();
            let old_id = inner.pointer.channel_id;
            let old_pinned = inner.pointer.pinned;
            if channel_id <= 0 {
                if old_id != 0 || old_pinned {
                    inner.pointer.mark_moved(PointerReason::Clear);
                }
                inner.pointer.channel_id = 0;
                inner.pointer.pinned = false;
            } else {
                inner.pointer.channel_id = channel_id;
                inner.pointer.pinned = true;
                inner.pointer.ensure_in_ring();
                inner.pointer.mark_moved(PointerReason::Manual);
            }
            inner.pointer_notify(old_id, old_pinned)
        };
        notify(pending);
    }

    /// Move the pointer without touching the pinned flag
    pub fn touch_channel_pointer(&self, channel_id: i64, reason: PointerReason) {
        if channel_id <= 0 {
            return;
        }
        let pending = {
            let mut inner = self.lock();
            let old_id = inner.pointer.channel_id;
            let old_pinned = inner.pointer.pinned;
            inner.pointer.channel_id = channel_id;
            inner.pointer.ensure_in_ring();
            inner.pointer.mark_moved(reason);
            inner.pointer_notify(old_id, old_pinned)
        };
        notify(pending);
    }

    pub fn clear_channel_pointer(&self) {
        self.pin_channel_pointer(0);
    }

    pub fn is_channel_pointer_pinned(&self) -> bool {
        self.lock().pointer.pinned
    }

    /// Current pointer after repairing it against the ring and bans
    pub fn channel_pointer(&self, now: Instant) -> Option<i64> {
        self.channel_pointer_info(now).map(|snap| snap.channel_id)
    }

    pub fn channel_pointer_info(&self, now: Instant) -> Option<ChannelPointerSnapshot> {
        let (snapshot, pending) = {
            let mut inner = self.lock();
            let old_id = inner.pointer.channel_id;
            let old_pinned = inner.pointer.pinned;
            inner.resolve_pointer(now);
            (inner.pointer.snapshot(), inner.pointer_notify(old_id, old_pinned))
        };
        notify(pending);
        (snapshot.channel_id > 0).then_some(snapshot)
    }

    /// Pointer channel, only when the pointer is pinned
    pub fn pinned_channel(&self, now: Instant) -> Option<i64> {
        self.channel_pointer_info(now)
            .filter(|snap| snap.pinned)
            .map(|snap| snap.channel_id)
    }

    /// Restore a persisted pointer without firing the change hook
    pub fn apply_channel_pointer_snapshot(&self, snapshot: ChannelPointerSnapshot) {
        let mut inner = self.lock();
        inner.pointer.channel_id = snapshot.channel_id;
        inner.pointer.pinned = snapshot.pinned;
        inner.pointer.moved_at = snapshot.moved_at;
        inner.pointer.reason = snapshot.reason;
        inner.pointer.ensure_in_ring();
    }

    /// Replace the ring the pointer rotates over
    pub fn set_channel_pointer_ring(&self, ring: &[i64]) {
        let mut inner = self.lock();
        inner.pointer.ring.clear();
        inner.pointer.index.clear();
        for &id in ring {
            if id <= 0 || inner.pointer.index.contains_key(&id) {
                continue;
            }
            let idx = inner.pointer.ring.len();
            inner.pointer.index.insert(id, idx);
            inner.pointer.ring.push(id);
        }
        inner.pointer.ensure_in_ring();
    }

    pub fn channel_pointer_ring(&self) -> Vec<i64> {
        self.lock().pointer.ring.clone()
    }

    // ---- forced channel -----------------------------------------------------

    pub fn set_forced_channel(&self, channel_id: i64, until: Instant) {
        info!(channel_id, "Channel forced");
        self.lock().forced = Some(ForcedChannel { channel_id, until });
    }

    pub fn clear_forced_channel(&self) {
        self.lock().forced = None;
    }

    pub fn forced_channel(&self, now: Instant) -> Option<i64> {
        let mut inner = self.lock();
        let forced = inner.forced?;
        if now > forced.until {
            inner.forced = None;
            return None;
        }
        Some(forced.channel_id)
    }

    // ---- last success -------------------------------------------------------

    pub fn record_last_success(&self, selection: &Selection, at: DateTime<Utc>) {
        self.lock().last_success = Some(LastSuccess {
            selection: selection.clone(),
            at,
        });
    }

    pub fn last_success(&self) -> Option<LastSuccess> {
        self.lock().last_success.clone()
    }

    // ---- maintenance --------------------------------------------------------

    /// Prune every rate window and drop expired bindings, affinities,
    /// cooldowns and probe claims
    pub fn sweep(&self, now: Instant, rpm_window: Duration, tpm_window: Duration) {
        let mut inner = self.lock();
        let rpm_cutoff = now.checked_sub(rpm_window);
        inner.rpm.retain(|_, events| {
            prune_window(events, rpm_cutoff);
            !events.is_empty()
        });
        let tpm_cutoff = now.checked_sub(tpm_window);
        inner.tokens.retain(|_, events| {
            if let Some(cutoff) = tpm_cutoff {
                while events.front().is_some_and(|(t, _)| *t <= cutoff) {
                    events.pop_front();
                }
            }
            !events.is_empty()
        });
        inner.affinity.retain(|_, entry| now <= entry.expires_at);
        inner.credential_cooldown.retain(|_, until| now <= *until);
        inner.probe_claim_until.retain(|_, until| now <= *until);
        inner.last_binding_sweep = Some(now);
        inner.sweep_expired_bindings(now);
    }

    /// Snapshot of one channel's routing state
    pub fn channel_stats(&self, channel_id: i64, now: Instant) -> RuntimeChannelStats {
        if channel_id == 0 {
            return RuntimeChannelStats::default();
        }
        let mut inner = self.lock();
        let banned = inner.is_banned(channel_id, now);
        let ban_remaining = if banned {
            inner
                .channel_ban_until
                .get(&channel_id)
                .map(|until| until.saturating_duration_since(now))
        } else {
            None
        };
        RuntimeChannelStats {
            channel_id,
            fail_score: inner.channel_fails.get(&channel_id).copied().unwrap_or(0),
            ban_remaining,
            ban_streak: inner
                .channel_ban_streak
                .get(&channel_id)
                .copied()
                .unwrap_or(0),
            probe_due: inner.probe_due_at.contains_key(&channel_id),
            probe_claimed: inner
                .probe_claim_until
                .get(&channel_id)
                .is_some_and(|until| now <= *until),
            pointer: inner.pointer.channel_id == channel_id,
            forced: inner
                .forced
                .is_some_and(|f| f.channel_id == channel_id && now <= f.until),
        }
    }
}
