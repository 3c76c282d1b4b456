//! Three-layer upstream scheduler
//!
//! Picks a channel, then an endpoint of that channel, then a credential of
//! that endpoint. Session bindings, user affinity, the pinned pointer ring
//! and single-flight probing steer the channel order; RPM/TPM windows and
//! cooldowns steer the credential order. Attempt outcomes flow back through
//! [`Scheduler::report`].

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_core::{
    ApiCredential, AttemptResult, ChannelType, CodexOAuthAccount, Constraints, CredentialType,
    Error, ErrorClass, GroupPointerRecord, PointerReason, Result, Selection, UpstreamChannel,
    UpstreamEndpoint, UpstreamStore,
};
use switchyard_observability::Metrics;
use switchyard_observability::metrics::{BanMode, SelectionSource};
use tracing::{debug, warn};

use crate::pointer::PointerPersistence;
use crate::policy::{SchedulerConfig, credential_cooldown, should_ban_channel_immediately};
use crate::state::{ChannelPointerSnapshot, LastSuccess, RuntimeState};
use crate::stats::{BindingClearReason, BindingSetSource, BindingStats, RuntimeChannelStats};

/// Channel plus the routing state used to order it
#[derive(Debug, Clone)]
pub(crate) struct ChannelCandidate {
    pub channel: UpstreamChannel,
    pub fail_score: u32,
    pub probe_pending: bool,
}

/// Upstream scheduler
pub struct Scheduler {
    store: Arc<dyn UpstreamStore>,
    state: Arc<RuntimeState>,
    config: SchedulerConfig,
    pointers: Option<Arc<PointerPersistence>>,
    metrics: Option<Arc<Metrics>>,
    /// Group pointers, loaded lazily from the pointer store once per group
    group_pointers: DashMap<i64, Option<GroupPointerRecord>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn UpstreamStore>, config: SchedulerConfig) -> Self {
        let state = Arc::new(RuntimeState::with_limits(
            config.max_ban,
            config.binding_sweep_interval,
        ));
        Self {
            store,
            state,
            config,
            pointers: None,
            metrics: None,
            group_pointers: DashMap::new(),
        }
    }

    /// Create a scheduler with default timing
    pub fn with_defaults(store: Arc<dyn UpstreamStore>) -> Self {
        Self::new(store, SchedulerConfig::default())
    }

    /// Persist pointer changes through `pointers`
    pub fn with_pointer_persistence(mut self, pointers: Arc<PointerPersistence>) -> Self {
        self.state.set_pointer_hook(pointers.hook());
        self.pointers = Some(pointers);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn UpstreamStore> {
        &self.store
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Restore the persisted scheduler pointer, if persistence is configured
    pub async fn restore_pointer(&self) -> Result<bool> {
        match &self.pointers {
            Some(pointers) => pointers.restore(&self.state).await,
            None => Ok(false),
        }
    }

    /// Select without constraints
    pub async fn select(&self, user_id: i64, route_key_hash: &str) -> Result<Selection> {
        self.select_with_constraints(user_id, route_key_hash, &Constraints::default())
            .await
    }

    /// Produce a concrete selection satisfying `cons`.
    ///
    /// An empty `route_key_hash` disables session binding for this call.
    pub async fn select_with_constraints(
        &self,
        user_id: i64,
        route_key_hash: &str,
        cons: &Constraints,
    ) -> Result<Selection> {
        let now = Instant::now();

        let pointer = if cons.require_channel_id.is_none() {
            self.relevant_pointer(now)
        } else {
            None
        };

        if !route_key_hash.is_empty()
            && pointer.is_none()
            && let Some(sel) = self.reuse_binding(user_id, route_key_hash, cons, now)
        {
            if let Some(metrics) = &self.metrics {
                metrics.record_selection(sel.channel_type.as_str(), SelectionSource::Binding);
            }
            debug!(
                user_id,
                channel_id = sel.channel_id,
                credential_key = %sel.credential_key(),
                "Reused session binding"
            );
            return Ok(sel);
        }

        let channels = self.store.list_upstream_channels().await?;
        let candidates: Vec<ChannelCandidate> = channels
            .into_iter()
            .filter(|ch| {
                ch.status.is_enabled()
                    && cons.allows_channel(ch.channel_type, &ch.groups, ch.id)
                    && !self.state.is_channel_banned(ch.id, now)
            })
            .map(|channel| ChannelCandidate {
                fail_score: self.state.channel_fail_score(channel.id),
                probe_pending: self.state.is_channel_probe_pending(channel.id, now),
                channel,
            })
            .collect();

        if candidates.is_empty() {
            return Err(self.no_usable_upstream("no_candidates", cons));
        }

        let ordered = match pointer {
            Some(pointer) => order_by_ring(candidates, &self.state.channel_pointer_ring(), pointer),
            None => order_channels(candidates, self.state.affinity(user_id, now)),
        };

        for channel in ordered {
            let claimed = if self.state.is_channel_probe_due(channel.id) {
                if !self
                    .state
                    .try_claim_channel_probe(channel.id, now, self.config.probe_claim_ttl)
                {
                    continue;
                }
                true
            } else {
                false
            };

            match self.select_from_channel(&channel, now).await {
                Ok(Some(sel)) => {
                    self.commit_fresh(user_id, route_key_hash, &sel, now);
                    return Ok(sel);
                }
                Ok(None) => {
                    if claimed {
                        self.state.release_channel_probe_claim(channel.id);
                    }
                }
                Err(e) => {
                    if claimed {
                        self.state.release_channel_probe_claim(channel.id);
                    }
                    return Err(e);
                }
            }
        }

        Err(self.no_usable_upstream("exhausted", cons))
    }

    /// Feed an attempt outcome back into the runtime state
    pub fn report(&self, sel: &Selection, result: &AttemptResult) {
        let now = Instant::now();
        let channel_id = sel.channel_id;
        let credential_key = sel.credential_key();

        self.state.clear_channel_probe(channel_id);

        if let Some(metrics) = &self.metrics {
            metrics.record_report(result.success, result.error_class.map(|c| c.as_str()));
        }

        if result.success {
            self.state.clear_channel_ban(channel_id);
            self.state.reset_channel_fail_score(channel_id);
            self.state.reset_credential_fail_score(&credential_key);
            self.state.record_last_success(sel, Utc::now());
            self.state
                .touch_channel_pointer(channel_id, PointerReason::Route);
            if sel.credential_type == CredentialType::CodexOAuth {
                self.touch_codex_account(sel.credential_id);
            }
            return;
        }

        self.state.record_channel_failure(channel_id);
        self.state.record_credential_failure(&credential_key);

        if !result.retriable {
            debug!(
                channel_id,
                credential_key = %credential_key,
                status = ?result.status_code,
                "Non-retriable failure recorded"
            );
            return;
        }

        let cooldown = credential_cooldown(result, self.config.cooldown_base);
        let mut until = now + cooldown;
        if let Some(declared) = result.cooldown_until
            && let Ok(remaining) = (declared - Utc::now()).to_std()
            && let Some(declared_until) = now.checked_add(remaining)
            && declared_until > until
        {
            until = declared_until;
        }
        self.state.set_credential_cooling(&credential_key, until);
        if let Some(metrics) = &self.metrics {
            metrics.record_credential_cooldown(result.status_code);
        }

        if !sel.policy.auto_ban || result.error_class == Some(ErrorClass::UpstreamExhausted) {
            return;
        }

        // Bans use the credential cooldown, doubled for 429
        if should_ban_channel_immediately(result) {
            if self.state.ban_channel_immediate(channel_id, now, cooldown).is_some()
                && let Some(metrics) = &self.metrics
            {
                metrics.record_channel_ban(BanMode::Immediate);
            }
        } else if self.state.ban_channel(channel_id, now, cooldown).is_some()
            && let Some(metrics) = &self.metrics
        {
            metrics.record_channel_ban(BanMode::Streak);
        }
    }

    /// Create or refresh the session binding for an already chosen selection
    pub fn touch_binding(&self, user_id: i64, route_key_hash: &str, sel: &Selection) {
        if route_key_hash.is_empty() {
            return;
        }
        let now = Instant::now();
        self.state.set_binding(
            user_id,
            route_key_hash,
            sel.clone(),
            now + self.config.binding_ttl,
            now,
            BindingSetSource::Touch,
        );
    }

    /// Remove a session binding
    pub fn clear_binding(&self, user_id: i64, route_key_hash: &str) {
        self.state
            .clear_binding(user_id, route_key_hash, Instant::now(), BindingClearReason::Manual);
    }

    /// Record token usage against the selection's credential
    pub fn record_tokens(&self, sel: &Selection, tokens: u64) {
        self.state
            .record_tokens(&sel.credential_key(), Instant::now(), tokens);
    }

    pub fn credential_rpm(&self, credential_key: &str) -> usize {
        self.state
            .rpm(credential_key, Instant::now(), self.config.rpm_window)
    }

    pub fn credential_tpm(&self, credential_key: &str) -> u64 {
        self.state
            .tpm(credential_key, Instant::now(), self.config.tpm_window)
    }

    pub fn credential_sessions(&self, credential_key: &str) -> usize {
        self.state
            .credential_sessions(credential_key, Instant::now())
    }

    /// Prune rate windows, expired bindings and cooldowns, and turn passed
    /// bans into probe-due entries
    pub fn sweep(&self) {
        let now = Instant::now();
        self.state
            .sweep(now, self.config.rpm_window, self.config.tpm_window);
        self.state.sweep_expired_channel_bans(now);
    }

    // ---- operator controls --------------------------------------------------

    /// Pin the scheduler pointer to `channel_id`
    pub fn pin_channel(&self, channel_id: i64) {
        self.state.pin_channel_pointer(channel_id);
    }

    pub fn clear_pinned_channel(&self) {
        self.state.clear_channel_pointer();
    }

    /// Pinned channel after skipping banned ring entries
    pub fn pinned_channel(&self) -> Option<i64> {
        self.state.pinned_channel(Instant::now())
    }

    pub fn channel_pointer(&self) -> ChannelPointerSnapshot {
        self.state.channel_pointer_snapshot()
    }

    /// Replace the ring the pinned pointer rotates over
    pub fn set_channel_ring(&self, ring: &[i64]) {
        self.state.set_channel_pointer_ring(ring);
    }

    pub fn channel_ring(&self) -> Vec<i64> {
        self.state.channel_pointer_ring()
    }

    pub fn clear_channel_ban(&self, channel_id: i64) {
        self.state.clear_channel_ban(channel_id);
    }

    /// Route group traffic to `channel_id` first for `ttl`
    pub fn force_channel(&self, channel_id: i64, ttl: Duration) {
        let now = Instant::now();
        self.state
            .set_forced_channel(channel_id, now.checked_add(ttl).unwrap_or(now));
    }

    pub fn clear_forced_channel(&self) {
        self.state.clear_forced_channel();
    }

    pub fn forced_channel(&self) -> Option<i64> {
        self.state.forced_channel(Instant::now())
    }

    pub fn list_probe_due_channels(&self, limit: usize) -> Vec<i64> {
        let now = Instant::now();
        self.state.sweep_expired_channel_bans(now);
        self.state.list_probe_due_channels(now, limit)
    }

    pub fn invalidate_upstream_snapshot(&self) {
        self.store.invalidate_all();
    }

    pub fn runtime_channel_stats(&self, channel_id: i64) -> RuntimeChannelStats {
        self.state.channel_stats(channel_id, Instant::now())
    }

    pub fn runtime_binding_stats(&self) -> BindingStats {
        self.state.binding_stats()
    }

    pub fn last_success(&self) -> Option<LastSuccess> {
        self.state.last_success()
    }

    // ---- group pointers -----------------------------------------------------

    /// Current pointer of a group, loading it from the pointer store on first use
    pub async fn group_pointer(&self, group_id: i64) -> Option<GroupPointerRecord> {
        if let Some(entry) = self.group_pointers.get(&group_id) {
            return entry.value().clone();
        }
        let loaded = match &self.pointers {
            Some(pointers) => match pointers.load_group_pointer(group_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(group_id, error = %e, "Failed to load group pointer");
                    None
                }
            },
            None => None,
        };
        self.group_pointers
            .entry(group_id)
            .or_insert(loaded)
            .value()
            .clone()
    }

    /// Point a group at a channel (operator action)
    pub fn set_group_pointer(&self, group_id: i64, channel_id: i64, pinned: bool) {
        let record = GroupPointerRecord {
            group_id,
            channel_id,
            pinned,
            moved_at_unix_ms: Utc::now().timestamp_millis(),
            reason: PointerReason::Manual,
        };
        self.group_pointers.insert(group_id, Some(record.clone()));
        if let Some(pointers) = &self.pointers {
            pointers.persist_group_pointer(record);
        }
    }

    /// Move a group pointer, keeping its pinned flag; a no-op when unchanged
    pub async fn touch_group_pointer(&self, group_id: i64, channel_id: i64, reason: PointerReason) {
        let current = self.group_pointer(group_id).await;
        if current.as_ref().is_some_and(|p| p.channel_id == channel_id) {
            return;
        }
        let record = GroupPointerRecord {
            group_id,
            channel_id,
            pinned: current.is_some_and(|p| p.pinned),
            moved_at_unix_ms: Utc::now().timestamp_millis(),
            reason,
        };
        debug!(group_id, channel_id, reason = %reason, "Group pointer moved");
        self.group_pointers.insert(group_id, Some(record.clone()));
        if let Some(pointers) = &self.pointers {
            pointers.persist_group_pointer(record);
        }
    }

    // ---- internals ----------------------------------------------------------

    /// Pinned pointer, only when a ring is configured
    fn relevant_pointer(&self, now: Instant) -> Option<i64> {
        let pinned = self.state.pinned_channel(now)?;
        if self.state.channel_pointer_ring().is_empty() {
            return None;
        }
        Some(pinned)
    }

    fn reuse_binding(
        &self,
        user_id: i64,
        route_key_hash: &str,
        cons: &Constraints,
        now: Instant,
    ) -> Option<Selection> {
        let sel = self.state.get_binding(user_id, route_key_hash, now)?;
        let credential_key = sel.credential_key();

        let eligible = cons.matches_selection(&sel)
            && !self.state.is_channel_banned(sel.channel_id, now)
            && !self.state.is_credential_cooling(&credential_key, now)
            && self.state.channel_fail_score(sel.channel_id) == 0;
        if !eligible {
            self.state
                .clear_binding(user_id, route_key_hash, now, BindingClearReason::Ineligible);
            return None;
        }

        if self.state.is_channel_probe_due(sel.channel_id)
            && !self
                .state
                .try_claim_channel_probe(sel.channel_id, now, self.config.probe_claim_ttl)
        {
            self.state
                .clear_binding(user_id, route_key_hash, now, BindingClearReason::ProbePending);
            return None;
        }

        self.state.set_binding(
            user_id,
            route_key_hash,
            sel.clone(),
            now + self.config.binding_ttl,
            now,
            BindingSetSource::Touch,
        );
        self.state.record_rpm(&credential_key, now);
        Some(sel)
    }

    async fn select_from_channel(
        &self,
        channel: &UpstreamChannel,
        now: Instant,
    ) -> Result<Option<Selection>> {
        let mut endpoints: Vec<UpstreamEndpoint> = self
            .store
            .list_upstream_endpoints_by_channel(channel.id)
            .await?
            .into_iter()
            .filter(|ep| ep.status.is_enabled())
            .collect();
        endpoints.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.id.cmp(&a.id)));

        let credential_type = channel.channel_type.credential_type();
        for endpoint in endpoints {
            let credential_id = match channel.channel_type {
                ChannelType::OpenAICompatible => {
                    let creds = self
                        .store
                        .list_openai_compatible_credentials_by_endpoint(endpoint.id)
                        .await?;
                    self.pick_api_credential(creds, credential_type, now)
                }
                ChannelType::Anthropic => {
                    let creds = self
                        .store
                        .list_anthropic_credentials_by_endpoint(endpoint.id)
                        .await?;
                    self.pick_api_credential(creds, credential_type, now)
                }
                ChannelType::CodexOAuth => {
                    let accounts = self
                        .store
                        .list_codex_oauth_accounts_by_endpoint(endpoint.id)
                        .await?;
                    self.pick_codex_account(accounts, now)
                }
            };

            if let Some(credential_id) = credential_id {
                return Ok(Some(Selection {
                    channel_id: channel.id,
                    channel_type: channel.channel_type,
                    channel_groups: channel.groups.clone(),
                    route_group: String::new(),
                    policy: channel.policy.clone(),
                    endpoint_id: endpoint.id,
                    base_url: endpoint.base_url.clone(),
                    credential_type,
                    credential_id,
                }));
            }
        }
        Ok(None)
    }

    /// Least loaded usable credential: RPM asc, TPM asc, id desc
    fn pick_api_credential(
        &self,
        creds: Vec<ApiCredential>,
        credential_type: CredentialType,
        now: Instant,
    ) -> Option<i64> {
        creds
            .into_iter()
            .filter(|c| c.status.is_enabled())
            .filter_map(|c| {
                let key = switchyard_core::credential_key(credential_type, c.id);
                if self.state.is_credential_cooling(&key, now) {
                    return None;
                }
                Some((self.load(&key, now), c.id))
            })
            .min_by(|(load_a, id_a), (load_b, id_b)| load_a.cmp(load_b).then(id_b.cmp(id_a)))
            .map(|(_, id)| id)
    }

    /// Least recently used codex account, then RPM asc, then id desc
    fn pick_codex_account(&self, accounts: Vec<CodexOAuthAccount>, now: Instant) -> Option<i64> {
        let wall_now = Utc::now();
        accounts
            .into_iter()
            .filter(|a| a.status.is_enabled() && !a.in_provider_cooldown(wall_now))
            .filter_map(|a| {
                let key = switchyard_core::credential_key(CredentialType::CodexOAuth, a.id);
                if self.state.is_credential_cooling(&key, now) {
                    return None;
                }
                Some((a.last_used_at, self.load(&key, now), a.id))
            })
            .min_by(|(used_a, load_a, id_a), (used_b, load_b, id_b)| {
                used_a
                    .cmp(used_b)
                    .then(load_a.cmp(load_b))
                    .then(id_b.cmp(id_a))
            })
            .map(|(_, _, id)| id)
    }

    fn load(&self, credential_key: &str, now: Instant) -> (usize, u64) {
        (
            self.state
                .rpm(credential_key, now, self.config.rpm_window),
            self.state
                .tpm(credential_key, now, self.config.tpm_window),
        )
    }

    fn commit_fresh(&self, user_id: i64, route_key_hash: &str, sel: &Selection, now: Instant) {
        self.state.record_rpm(&sel.credential_key(), now);
        if !route_key_hash.is_empty() {
            self.state.set_binding(
                user_id,
                route_key_hash,
                sel.clone(),
                now + self.config.binding_ttl,
                now,
                BindingSetSource::Select,
            );
        }
        self.state
            .set_affinity(user_id, sel.channel_id, now + self.config.affinity_ttl);

        if let Some(metrics) = &self.metrics {
            metrics.record_selection(sel.channel_type.as_str(), SelectionSource::Fresh);
        }
        debug!(
            user_id,
            channel_id = sel.channel_id,
            endpoint_id = sel.endpoint_id,
            credential_key = %sel.credential_key(),
            "Selected upstream"
        );
    }

    fn touch_codex_account(&self, account_id: i64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        handle.spawn(async move {
            if let Err(e) = store.touch_codex_oauth_account(account_id, Utc::now()).await {
                warn!(account_id, error = %e, "Failed to touch codex account");
            }
        });
    }

    fn no_usable_upstream(&self, reason: &str, cons: &Constraints) -> Error {
        if let Some(metrics) = &self.metrics {
            metrics.record_selection_failure(reason);
        }
        let detail = match (cons.require_channel_id, cons.require_channel_type) {
            (Some(id), _) => format!("channel {} unavailable", id),
            (None, Some(channel_type)) => format!("no {} channel available", channel_type),
            (None, None) => "no channel available".to_string(),
        };
        debug!(reason, detail = %detail, "No usable upstream");
        Error::NoUsableUpstream(detail)
    }
}

/// Probe-pending channels first, then promoted ones, then the affinity
/// channel (when it has no recent failures), then the rest. Each bucket is
/// ordered by priority desc, then fail score asc; catalog order breaks ties.
pub(crate) fn order_channels(
    candidates: Vec<ChannelCandidate>,
    affinity: Option<i64>,
) -> Vec<UpstreamChannel> {
    let mut probing = Vec::new();
    let mut promoted = Vec::new();
    let mut normal = Vec::new();
    for candidate in candidates {
        if candidate.probe_pending {
            probing.push(candidate);
        } else if candidate.channel.promotion {
            promoted.push(candidate);
        } else {
            normal.push(candidate);
        }
    }

    let by_priority = |a: &ChannelCandidate, b: &ChannelCandidate| {
        b.channel
            .priority
            .cmp(&a.channel.priority)
            .then(a.fail_score.cmp(&b.fail_score))
    };
    probing.sort_by(by_priority);
    promoted.sort_by(by_priority);
    normal.sort_by(by_priority);

    if let Some(affinity) = affinity
        && let Some(pos) = normal
            .iter()
            .position(|c| c.channel.id == affinity && c.fail_score == 0)
    {
        let sticky = normal.remove(pos);
        normal.insert(0, sticky);
    }

    probing
        .into_iter()
        .chain(promoted)
        .chain(normal)
        .map(|c| c.channel)
        .collect()
}

/// Ring order starting at `pointer`; eligible channels missing from the
/// ring follow by (promotion desc, priority desc)
pub(crate) fn order_by_ring(
    candidates: Vec<ChannelCandidate>,
    ring: &[i64],
    pointer: i64,
) -> Vec<UpstreamChannel> {
    let mut by_id: HashMap<i64, UpstreamChannel> = candidates
        .into_iter()
        .map(|c| (c.channel.id, c.channel))
        .collect();

    let start = ring.iter().position(|id| *id == pointer).unwrap_or(0);
    let mut ordered = Vec::with_capacity(by_id.len());
    for offset in 0..ring.len() {
        let id = ring[(start + offset) % ring.len()];
        if let Some(channel) = by_id.remove(&id) {
            ordered.push(channel);
        }
    }

    let mut rest: Vec<UpstreamChannel> = by_id.into_values().collect();
    rest.sort_by(|a, b| {
        b.promotion
            .cmp(&a.promotion)
            .then(b.priority.cmp(&a.priority))
            .then(b.id.cmp(&a.id))
    });
    ordered.extend(rest);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::{ChannelPolicy, Status};

    fn candidate(
        id: i64,
        priority: i32,
        promotion: bool,
        fail_score: u32,
        probe_pending: bool,
    ) -> ChannelCandidate {
        ChannelCandidate {
            channel: UpstreamChannel {
                id,
                channel_type: ChannelType::OpenAICompatible,
                name: format!("ch-{}", id),
                groups: String::new(),
                status: Status::Enabled,
                priority,
                promotion,
                policy: ChannelPolicy::default(),
            },
            fail_score,
            probe_pending,
        }
    }

    fn ids(channels: Vec<UpstreamChannel>) -> Vec<i64> {
        channels.into_iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_promoted_channels_beat_priority() {
        let ordered = order_channels(
            vec![
                candidate(1, 100, false, 0, false),
                candidate(2, 1, true, 0, false),
                candidate(3, 50, false, 0, false),
            ],
            None,
        );
        assert_eq!(ids(ordered), vec![2, 1, 3]);
    }

    #[test]
    fn test_probe_pending_channels_come_first() {
        let ordered = order_channels(
            vec![
                candidate(1, 100, true, 0, false),
                candidate(2, 1, false, 3, true),
            ],
            None,
        );
        assert_eq!(ids(ordered), vec![2, 1]);
    }

    #[test]
    fn test_fail_score_breaks_priority_ties() {
        let ordered = order_channels(
            vec![
                candidate(1, 10, false, 2, false),
                candidate(2, 10, false, 0, false),
                candidate(3, 5, false, 0, false),
            ],
            None,
        );
        assert_eq!(ids(ordered), vec![2, 1, 3]);
    }

    #[test]
    fn test_affinity_requires_clean_fail_score() {
        let channels = || {
            vec![
                candidate(1, 10, false, 0, false),
                candidate(2, 5, false, 0, false),
                candidate(3, 1, false, 1, false),
            ]
        };
        assert_eq!(ids(order_channels(channels(), Some(2))), vec![2, 1, 3]);
        assert_eq!(ids(order_channels(channels(), Some(3))), vec![1, 2, 3]);
    }

    #[test]
    fn test_ring_order_starts_at_pointer() {
        let ordered = order_by_ring(
            vec![
                candidate(1, 0, false, 0, false),
                candidate(2, 0, false, 0, false),
                candidate(3, 0, false, 0, false),
                candidate(9, 50, true, 0, false),
                candidate(8, 99, false, 0, false),
            ],
            &[1, 2, 3, 4],
            3,
        );
        assert_eq!(ids(ordered), vec![3, 1, 2, 9, 8]);
    }
}
