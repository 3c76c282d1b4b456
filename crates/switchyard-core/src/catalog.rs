//! Catalog rows and store traits
//!
//! The durable catalog (channels, endpoints, credentials, groups) lives
//! outside this workspace. The router only reads it through the traits
//! defined here, so any backend (database, file, in-memory fake) can be
//! plugged in behind an `Arc<dyn ...>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::selection::{ChannelPolicy, ChannelType};

/// Row status shared by every catalog entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Enabled,
    Disabled,
}

impl Status {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Status::Enabled)
    }
}

/// Upstream channel: one provider account family with its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamChannel {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    /// Comma separated group tags
    #[serde(default)]
    pub groups: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub promotion: bool,
    #[serde(default)]
    pub policy: ChannelPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEndpoint {
    pub id: i64,
    pub channel_id: i64,
    pub base_url: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: i32,
}

/// API-key credential (OpenAI compatible and Anthropic endpoints)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: i64,
    pub endpoint_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Status,
}

/// Codex OAuth account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodexOAuthAccount {
    pub id: i64,
    pub endpoint_id: i64,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: Status,
    /// Provider-side cooldown (usage limit reached until this time)
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl CodexOAuthAccount {
    /// Whether the provider still reports this account as cooling down
    pub fn in_provider_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Named routing / authorization scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Attempt budget per request; 0 falls back to the router default
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub status: Status,
}

/// What a group membership edge points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRef {
    Group {
        id: i64,
        name: String,
        status: Status,
        max_attempts: u32,
    },
    Channel {
        id: i64,
        name: String,
        channel_type: ChannelType,
        groups: String,
        status: Status,
    },
}

/// Membership edge of a channel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroupMember {
    pub parent_group_id: i64,
    pub member: MemberRef,
    pub priority: i32,
    pub promotion: bool,
}

/// Why a pointer moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerReason {
    /// Traffic succeeded on the channel
    Route,
    /// Operator pinned or moved it
    Manual,
    /// Pointed channel was banned and the pointer advanced
    Ban,
    /// Pointed channel left the ring
    Invalid,
    /// Pointer cleared
    Clear,
}

impl PointerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerReason::Route => "route",
            PointerReason::Manual => "manual",
            PointerReason::Ban => "ban",
            PointerReason::Invalid => "invalid",
            PointerReason::Clear => "clear",
        }
    }
}

impl fmt::Display for PointerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current persisted record format version
pub const POINTER_RECORD_VERSION: u32 = 1;

/// Persisted scheduler channel pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPointerRecord {
    pub v: u32,
    pub channel_id: i64,
    pub pinned: bool,
    pub moved_at_unix_ms: i64,
    pub reason: PointerReason,
}

/// Persisted per-group channel pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPointerRecord {
    pub group_id: i64,
    pub channel_id: i64,
    pub pinned: bool,
    pub moved_at_unix_ms: i64,
    pub reason: PointerReason,
}

/// Catalog read interface consumed by the scheduler
#[async_trait]
pub trait UpstreamStore: Send + Sync {
    async fn list_upstream_channels(&self) -> Result<Vec<UpstreamChannel>>;

    async fn list_upstream_endpoints_by_channel(
        &self,
        channel_id: i64,
    ) -> Result<Vec<UpstreamEndpoint>>;

    async fn list_openai_compatible_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>>;

    async fn list_anthropic_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>>;

    async fn list_codex_oauth_accounts_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<CodexOAuthAccount>>;

    /// Record that a Codex account served a request
    async fn touch_codex_oauth_account(&self, _account_id: i64, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    /// Drop any cached catalog data
    fn invalidate_all(&self) {}
}

/// Group catalog consumed by the group router
#[async_trait]
pub trait ChannelGroupStore: Send + Sync {
    async fn get_channel_group_by_name(&self, name: &str) -> Result<Option<ChannelGroup>>;

    async fn get_channel_group_by_id(&self, id: i64) -> Result<Option<ChannelGroup>>;

    async fn list_channel_group_members(
        &self,
        parent_group_id: i64,
    ) -> Result<Vec<ChannelGroupMember>>;
}

/// Best-effort persistence of pointer values for restart continuity
#[async_trait]
pub trait PointerStore: Send + Sync {
    async fn get_channel_pointer(&self) -> Result<Option<ChannelPointerRecord>>;

    async fn upsert_channel_pointer(&self, record: &ChannelPointerRecord) -> Result<()>;

    async fn get_group_pointer(&self, group_id: i64) -> Result<Option<GroupPointerRecord>>;

    async fn upsert_group_pointer(&self, record: &GroupPointerRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_record_json_shape() {
        let record = ChannelPointerRecord {
            v: POINTER_RECORD_VERSION,
            channel_id: 4,
            pinned: true,
            moved_at_unix_ms: 1_700_000_000_000,
            reason: PointerReason::Ban,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["channel_id"], 4);
        assert_eq!(value["pinned"], true);
        assert_eq!(value["reason"], "ban");
        assert_eq!(value["moved_at_unix_ms"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_codex_provider_cooldown() {
        let now = Utc::now();
        let mut account = CodexOAuthAccount {
            id: 1,
            endpoint_id: 1,
            account_id: "acct".into(),
            email: None,
            status: Status::Enabled,
            cooldown_until: None,
            last_used_at: None,
        };
        assert!(!account.in_provider_cooldown(now));
        account.cooldown_until = Some(now + chrono::Duration::minutes(5));
        assert!(account.in_provider_cooldown(now));
        account.cooldown_until = Some(now - chrono::Duration::minutes(5));
        assert!(!account.in_provider_cooldown(now));
    }

    #[test]
    fn test_channel_row_deserialize_defaults() {
        let json = r#"{"id": 3, "type": "anthropic", "name": "claude"}"#;
        let channel: UpstreamChannel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Anthropic);
        assert!(channel.status.is_enabled());
        assert_eq!(channel.priority, 0);
        assert!(channel.policy.auto_ban);
    }
}
