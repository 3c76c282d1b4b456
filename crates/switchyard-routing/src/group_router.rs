//! Authorization-scoped group router
//!
//! A caller is authorized for a tree of channel groups rooted at the default
//! group. For each attempt the router flattens that tree into an ordered,
//! de-duplicated list of channel candidates and asks the scheduler for a
//! concrete selection on each candidate in turn. Every group carries an
//! attempt budget that only scheduler-approved selections consume.
//!
//! A router lives for one caller request; `next` is called once per attempt.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{
    ChannelGroup, ChannelGroupMember, ChannelGroupStore, Constraints, Error, MemberRef,
    PointerReason, Result, Selection,
};
use switchyard_observability::metrics::SelectionSource;
use tracing::{debug, warn};

use crate::channel_ring::build_default_channel_ring;
use crate::scheduler::Scheduler;

/// Group router configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRouterConfig {
    /// Root of every caller's group tree
    #[serde(default = "default_group_name")]
    pub default_group_name: String,

    /// Attempt budget for groups whose `max_attempts` is 0
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Selections of one channel in a row before it yields to the next candidate
    #[serde(default = "default_max_consecutive_same_channel")]
    pub max_consecutive_same_channel: u32,
}

impl Default for GroupRouterConfig {
    fn default() -> Self {
        Self {
            default_group_name: default_group_name(),
            default_max_attempts: default_max_attempts(),
            max_consecutive_same_channel: default_max_consecutive_same_channel(),
        }
    }
}

impl GroupRouterConfig {
    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.default_group_name.trim().is_empty() {
            return Err("default_group_name must not be empty".to_string());
        }
        if self.default_max_attempts == 0 {
            return Err("default_max_attempts must be greater than 0".to_string());
        }
        if self.max_consecutive_same_channel == 0 {
            return Err("max_consecutive_same_channel must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn default_group_name() -> String {
    "default".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_consecutive_same_channel() -> u32 {
    2
}

struct GroupCursor {
    group: ChannelGroup,
    members: Vec<ChannelGroupMember>,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupCandidate {
    channel_id: i64,
    source_group_id: i64,
    priority: i32,
    promotion: bool,
}

impl GroupCandidate {
    /// Merge preference when one channel is reachable through several groups
    fn outranks(&self, other: &GroupCandidate) -> bool {
        (self.promotion, self.priority) > (other.promotion, other.priority)
    }
}

/// Per-request router over the caller's group tree
pub struct GroupRouter {
    groups: Arc<dyn ChannelGroupStore>,
    scheduler: Arc<Scheduler>,
    user_id: i64,
    route_key_hash: String,
    cons: Constraints,
    config: GroupRouterConfig,

    cursors: HashMap<i64, GroupCursor>,
    excluded: HashSet<i64>,
    root_id: Option<i64>,
    /// (channel id, consecutive selections)
    last_selected: Option<(i64, u32)>,
    ring: Option<Vec<i64>>,
}

impl GroupRouter {
    pub fn new(
        groups: Arc<dyn ChannelGroupStore>,
        scheduler: Arc<Scheduler>,
        user_id: i64,
        route_key_hash: impl Into<String>,
        cons: Constraints,
    ) -> Self {
        Self {
            groups,
            scheduler,
            user_id,
            route_key_hash: route_key_hash.into(),
            cons,
            config: GroupRouterConfig::default(),
            cursors: HashMap::new(),
            excluded: HashSet::new(),
            root_id: None,
            last_selected: None,
            ring: None,
        }
    }

    pub fn with_config(mut self, config: GroupRouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Channels that failed to produce a selection during this request
    pub fn excluded_channels(&self) -> &HashSet<i64> {
        &self.excluded
    }

    /// Attempts consumed so far from a group's budget
    pub fn attempts_used(&self, group_id: i64) -> u32 {
        self.cursors.get(&group_id).map_or(0, |c| c.attempts)
    }

    /// Selection for the next attempt of this request.
    ///
    /// Budget or candidate exhaustion surfaces as
    /// [`Error::UpstreamUnavailable`]; store errors propagate unchanged.
    pub async fn next(&mut self) -> Result<Selection> {
        let root_id = self.resolve_root().await?;

        let result = if self.scheduler.pinned_channel().is_some() {
            self.next_from_pinned_ring(root_id).await
        } else {
            self.next_from_group(root_id).await
        };

        match result {
            Err(Error::GroupExhausted(group_id)) => {
                debug!(
                    user_id = self.user_id,
                    group_id,
                    excluded = self.excluded.len(),
                    "Channel group exhausted"
                );
                if let Some(metrics) = self.scheduler.metrics() {
                    metrics.record_group_exhausted();
                }
                Err(Error::UpstreamUnavailable(format!(
                    "channel group {} exhausted",
                    group_id
                )))
            }
            other => other,
        }
    }

    async fn resolve_root(&mut self) -> Result<i64> {
        if let Some(root_id) = self.root_id {
            return Ok(root_id);
        }
        let name = self.config.default_group_name.clone();
        let root = self
            .groups
            .get_channel_group_by_name(&name)
            .await?
            .ok_or_else(|| Error::GroupNotFound(name.clone()))?;
        if !root.status.is_enabled() {
            return Err(Error::GroupDisabled(name));
        }
        let members = self.groups.list_channel_group_members(root.id).await?;
        let root_id = root.id;
        self.cursors.insert(
            root_id,
            GroupCursor {
                group: root,
                members,
                attempts: 0,
            },
        );
        self.root_id = Some(root_id);
        Ok(root_id)
    }

    /// Load a group and its members once per request
    async fn load_cursor(&mut self, group_id: i64) -> Result<()> {
        if self.cursors.contains_key(&group_id) {
            return Ok(());
        }
        let group = self
            .groups
            .get_channel_group_by_id(group_id)
            .await?
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
        let members = self.groups.list_channel_group_members(group_id).await?;
        self.cursors.insert(
            group_id,
            GroupCursor {
                group,
                members,
                attempts: 0,
            },
        );
        Ok(())
    }

    fn budget(&self, group: &ChannelGroup) -> u32 {
        if group.max_attempts == 0 {
            self.config.default_max_attempts
        } else {
            group.max_attempts
        }
    }

    fn has_budget(&self, group_id: i64) -> bool {
        self.cursors
            .get(&group_id)
            .is_some_and(|c| c.group.status.is_enabled() && c.attempts < self.budget(&c.group))
    }

    fn group_name(&self, group_id: i64) -> String {
        self.cursors
            .get(&group_id)
            .map(|c| c.group.name.clone())
            .unwrap_or_default()
    }

    async fn next_from_group(&mut self, group_id: i64) -> Result<Selection> {
        self.load_cursor(group_id).await?;
        if !self.has_budget(group_id) {
            return Err(Error::GroupExhausted(group_id));
        }

        let candidates = self.collect_candidates(group_id).await?;
        if candidates.is_empty() {
            return Err(Error::GroupExhausted(group_id));
        }
        let ordered = self.order_candidates(group_id, candidates).await;

        for candidate in ordered {
            let cons = self.cons.clone().with_channel_id(candidate.channel_id);
            match self
                .scheduler
                .select_with_constraints(self.user_id, &self.route_key_hash, &cons)
                .await
            {
                Ok(mut sel) => {
                    self.charge(group_id, candidate.source_group_id);
                    self.note_selected(candidate.channel_id);
                    sel.route_group = self.group_name(candidate.source_group_id);
                    self.scheduler
                        .touch_group_pointer(group_id, candidate.channel_id, PointerReason::Route)
                        .await;
                    if let Some(metrics) = self.scheduler.metrics() {
                        metrics.record_selection(sel.channel_type.as_str(), SelectionSource::Group);
                    }
                    return Ok(sel);
                }
                Err(Error::NoUsableUpstream(reason)) => {
                    debug!(
                        channel_id = candidate.channel_id,
                        reason = %reason,
                        "Excluding channel for this request"
                    );
                    self.excluded.insert(candidate.channel_id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::GroupExhausted(group_id))
    }

    /// Walk the ring of the default group starting at the pinned pointer
    async fn next_from_pinned_ring(&mut self, root_id: i64) -> Result<Selection> {
        if self.ring.is_none() {
            let ring =
                build_default_channel_ring(self.groups.as_ref(), &self.config.default_group_name)
                    .await?;
            self.scheduler.set_channel_ring(&ring);
            self.ring = Some(self.scheduler.channel_ring());
        }
        let ring = self.ring.clone().unwrap_or_default();
        if ring.is_empty() {
            return Err(Error::GroupExhausted(root_id));
        }
        let Some(pointer) = self.scheduler.pinned_channel() else {
            return Err(Error::GroupExhausted(root_id));
        };

        // Authorization still applies: only channels reachable for this caller
        let allowed: HashMap<i64, GroupCandidate> = self
            .collect_candidates(root_id)
            .await?
            .into_iter()
            .map(|c| (c.channel_id, c))
            .collect();

        let start = ring.iter().position(|id| *id == pointer).unwrap_or(0);
        let state = Arc::clone(self.scheduler.state());
        for step in 0..ring.len() {
            let channel_id = ring[(start + step) % ring.len()];
            let Some(candidate) = allowed.get(&channel_id).copied() else {
                continue;
            };
            if self.excluded.contains(&channel_id)
                || state.is_channel_banned(channel_id, Instant::now())
            {
                continue;
            }

            let cons = self.cons.clone().with_channel_id(channel_id);
            match self
                .scheduler
                .select_with_constraints(self.user_id, &self.route_key_hash, &cons)
                .await
            {
                Ok(mut sel) => {
                    self.note_selected(channel_id);
                    sel.route_group = self.group_name(candidate.source_group_id);
                    if let Some(metrics) = self.scheduler.metrics() {
                        metrics.record_selection(sel.channel_type.as_str(), SelectionSource::Group);
                    }
                    return Ok(sel);
                }
                Err(Error::NoUsableUpstream(_)) => {
                    self.excluded.insert(channel_id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::GroupExhausted(root_id))
    }

    /// Depth-first walk of the members under `group_id`
    async fn collect_candidates(&mut self, group_id: i64) -> Result<Vec<GroupCandidate>> {
        let mut merged: HashMap<i64, GroupCandidate> = HashMap::new();
        let mut active_path: HashSet<i64> = HashSet::from([group_id]);
        let mut stack: Vec<(i64, usize)> = vec![(group_id, 0)];

        while let Some((current, idx)) = stack.pop() {
            let member = self
                .cursors
                .get(&current)
                .and_then(|c| c.members.get(idx))
                .cloned();
            let Some(member) = member else {
                active_path.remove(&current);
                continue;
            };
            stack.push((current, idx + 1));

            match member.member {
                MemberRef::Channel {
                    id,
                    channel_type,
                    groups,
                    status,
                    ..
                } => {
                    if !status.is_enabled()
                        || self.excluded.contains(&id)
                        || !self.cons.allows_channel(channel_type, &groups, id)
                    {
                        continue;
                    }
                    let candidate = GroupCandidate {
                        channel_id: id,
                        source_group_id: current,
                        priority: member.priority,
                        promotion: member.promotion,
                    };
                    match merged.get(&id) {
                        Some(prev) if !candidate.outranks(prev) => {}
                        _ => {
                            merged.insert(id, candidate);
                        }
                    }
                }
                MemberRef::Group { id, name, status, .. } => {
                    if active_path.contains(&id) {
                        debug!(group_id = id, "Skipping group already on the active path");
                        continue;
                    }
                    if !status.is_enabled() || !self.cons.allows_group(&name) {
                        continue;
                    }
                    match self.load_cursor(id).await {
                        Ok(()) => {}
                        Err(Error::GroupNotFound(_)) => {
                            warn!(
                                parent_group_id = current,
                                group_id = id,
                                "Member references a missing group"
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    if !self.has_budget(id) {
                        continue;
                    }
                    active_path.insert(id);
                    stack.push((id, 0));
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    /// Order candidates for one attempt.
    ///
    /// Probe-pending channels lead, then (promotion desc, priority desc,
    /// fail score asc, id desc). A pinned group pointer rotates the order to
    /// start at its channel, a channel picked too often in a row yields to
    /// the others, and a forced channel goes first regardless.
    async fn order_candidates(
        &self,
        group_id: i64,
        candidates: Vec<GroupCandidate>,
    ) -> Vec<GroupCandidate> {
        let state = self.scheduler.state();
        let now = Instant::now();
        state.sweep_expired_channel_bans(now);

        let mut keyed: Vec<(bool, u32, GroupCandidate)> = candidates
            .into_iter()
            .map(|c| {
                (
                    state.is_channel_probe_pending(c.channel_id, now),
                    state.channel_fail_score(c.channel_id),
                    c,
                )
            })
            .collect();
        keyed.sort_by(|(probe_a, fail_a, a), (probe_b, fail_b, b)| {
            compare_candidates(*probe_a, *fail_a, a, *probe_b, *fail_b, b)
        });
        let mut ordered: Vec<GroupCandidate> = keyed.into_iter().map(|(_, _, c)| c).collect();

        if let Some(pointer) = self.scheduler.group_pointer(group_id).await
            && pointer.pinned
            && let Some(pos) = ordered.iter().position(|c| c.channel_id == pointer.channel_id)
        {
            let len = ordered.len();
            let mut start = pos;
            if state.is_channel_banned(pointer.channel_id, now)
                && let Some(next) = (1..len)
                    .map(|step| (pos + step) % len)
                    .find(|&i| !state.is_channel_banned(ordered[i].channel_id, now))
            {
                start = next;
                self.scheduler
                    .touch_group_pointer(group_id, ordered[next].channel_id, PointerReason::Ban)
                    .await;
            }
            ordered.rotate_left(start);
        }

        if let Some((last, streak)) = self.last_selected
            && streak >= self.config.max_consecutive_same_channel
            && ordered.len() > 1
            && let Some(pos) = ordered.iter().position(|c| c.channel_id == last)
        {
            let deferred = ordered.remove(pos);
            ordered.push(deferred);
        }

        if let Some(forced) = state.forced_channel(now)
            && let Some(pos) = ordered.iter().position(|c| c.channel_id == forced)
        {
            let first = ordered.remove(pos);
            ordered.insert(0, first);
        }

        ordered
    }

    fn charge(&mut self, walked_group_id: i64, source_group_id: i64) {
        if let Some(cursor) = self.cursors.get_mut(&walked_group_id) {
            cursor.attempts += 1;
        }
        if source_group_id != walked_group_id
            && let Some(cursor) = self.cursors.get_mut(&source_group_id)
        {
            cursor.attempts += 1;
        }
    }

    fn note_selected(&mut self, channel_id: i64) {
        self.last_selected = match self.last_selected {
            Some((last, streak)) if last == channel_id => Some((last, streak + 1)),
            _ => Some((channel_id, 1)),
        };
    }
}

fn compare_candidates(
    probe_a: bool,
    fail_a: u32,
    a: &GroupCandidate,
    probe_b: bool,
    fail_b: u32,
    b: &GroupCandidate,
) -> Ordering {
    probe_b
        .cmp(&probe_a)
        .then(b.promotion.cmp(&a.promotion))
        .then(b.priority.cmp(&a.priority))
        .then(fail_a.cmp(&fail_b))
        .then(b.channel_id.cmp(&a.channel_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(channel_id: i64, priority: i32, promotion: bool) -> GroupCandidate {
        GroupCandidate {
            channel_id,
            source_group_id: 1,
            priority,
            promotion,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = GroupRouterConfig::default();
        assert_eq!(config.default_group_name, "default");
        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.max_consecutive_same_channel, 2);
        assert!(config.validate().is_ok());

        let config = GroupRouterConfig {
            default_max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_preference() {
        assert!(cand(1, 0, true).outranks(&cand(1, 100, false)));
        assert!(cand(1, 10, false).outranks(&cand(1, 5, false)));
        assert!(!cand(1, 5, false).outranks(&cand(1, 5, false)));
    }

    #[test]
    fn test_candidate_ordering() {
        let mut keyed = vec![
            (false, 0, cand(1, 10, false)),
            (false, 0, cand(2, 1, true)),
            (false, 3, cand(3, 10, false)),
            (true, 9, cand(4, 0, false)),
            (false, 0, cand(5, 10, false)),
        ];
        keyed.sort_by(|(pa, fa, a), (pb, fb, b)| compare_candidates(*pa, *fa, a, *pb, *fb, b));
        let ids: Vec<i64> = keyed.into_iter().map(|(_, _, c)| c.channel_id).collect();
        assert_eq!(ids, vec![4, 2, 5, 1, 3]);
    }
}
