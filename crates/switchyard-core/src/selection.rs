//! Selection, constraints and attempt results
//!
//! These are the value contracts exchanged between the scheduler, the group
//! router and the request handlers. A [`Selection`] is the concrete
//! (channel, endpoint, credential) triple chosen for one upstream attempt;
//! [`Constraints`] narrow what may be chosen; [`AttemptResult`] feeds the
//! outcome of an attempt back into routing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upstream protocol family of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "openai_compatible")]
    OpenAICompatible,
    #[serde(rename = "codex_oauth")]
    CodexOAuth,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAICompatible => "openai_compatible",
            ChannelType::CodexOAuth => "codex_oauth",
            ChannelType::Anthropic => "anthropic",
        }
    }

    /// Credential family used by channels of this type
    pub fn credential_type(&self) -> CredentialType {
        match self {
            ChannelType::OpenAICompatible => CredentialType::OpenAICompatible,
            ChannelType::CodexOAuth => CredentialType::CodexOAuth,
            ChannelType::Anthropic => CredentialType::Anthropic,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "openai_compatible" => Ok(ChannelType::OpenAICompatible),
            "codex_oauth" => Ok(ChannelType::CodexOAuth),
            "anthropic" => Ok(ChannelType::Anthropic),
            other => Err(format!("unknown channel type: {}", other)),
        }
    }
}

/// Credential family of a selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    #[serde(rename = "openai_compatible")]
    OpenAICompatible,
    #[serde(rename = "codex_oauth")]
    CodexOAuth,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::OpenAICompatible => "openai_compatible",
            CredentialType::CodexOAuth => "codex_oauth",
            CredentialType::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Per-channel request policy
///
/// Only `auto_ban` is interpreted by the router. The remaining flags and
/// opaque configs travel with the selection for the request-rewriting layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelPolicy {
    #[serde(default)]
    pub allow_service_tier: bool,
    #[serde(default)]
    pub disable_store: bool,
    #[serde(default)]
    pub allow_safety_identifier: bool,
    #[serde(default, rename = "OpenAIOrganization")]
    pub openai_organization: Option<String>,
    /// Whether retriable failures may ban the whole channel
    #[serde(default = "default_true")]
    pub auto_ban: bool,
    #[serde(default)]
    pub force_format: bool,
    #[serde(default)]
    pub thinking_to_content: bool,
    #[serde(default)]
    pub pass_through_body_enabled: bool,
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub system_prompt_override: bool,
    #[serde(default, rename = "CacheTTLPreference")]
    pub cache_ttl_preference: String,
    #[serde(default)]
    pub param_override: String,
    #[serde(default)]
    pub header_override: String,
    #[serde(default)]
    pub status_code_mapping: String,
    #[serde(default)]
    pub model_suffix_preserve: String,
    #[serde(default)]
    pub request_body_blacklist: String,
    #[serde(default)]
    pub request_body_whitelist: String,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            allow_service_tier: false,
            disable_store: false,
            allow_safety_identifier: false,
            openai_organization: None,
            auto_ban: true,
            force_format: false,
            thinking_to_content: false,
            pass_through_body_enabled: false,
            proxy: String::new(),
            system_prompt: String::new(),
            system_prompt_override: false,
            cache_ttl_preference: String::new(),
            param_override: String::new(),
            header_override: String::new(),
            status_code_mapping: String::new(),
            model_suffix_preserve: String::new(),
            request_body_blacklist: String::new(),
            request_body_whitelist: String::new(),
        }
    }
}

/// Concrete upstream chosen for one attempt
///
/// Serialized as flat JSON so ownership-tracking collaborators can persist it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(rename = "ChannelID")]
    pub channel_id: i64,
    #[serde(rename = "ChannelType")]
    pub channel_type: ChannelType,
    /// Comma separated group tags of the channel
    #[serde(rename = "ChannelGroups", default)]
    pub channel_groups: String,
    /// Name of the channel group the router picked this channel from
    #[serde(rename = "RouteGroup", default)]
    pub route_group: String,

    #[serde(flatten)]
    pub policy: ChannelPolicy,

    #[serde(rename = "EndpointID")]
    pub endpoint_id: i64,
    #[serde(rename = "BaseURL")]
    pub base_url: String,

    #[serde(rename = "CredentialType")]
    pub credential_type: CredentialType,
    #[serde(rename = "CredentialID")]
    pub credential_id: i64,
}

impl Selection {
    /// Canonical key for credential-scoped routing state: `"{type}:{id}"`
    pub fn credential_key(&self) -> String {
        credential_key(self.credential_type, self.credential_id)
    }

    /// Request timeout to apply to the upstream HTTP call.
    ///
    /// Streaming requests and Codex OAuth credentials run without a request
    /// timeout and rely on the stream idle timeout instead.
    pub fn upstream_request_timeout(&self, streaming: bool, default: Duration) -> Option<Duration> {
        if streaming || self.credential_type == CredentialType::CodexOAuth {
            return None;
        }
        Some(default)
    }
}

/// Build a credential key without a full selection
pub fn credential_key(credential_type: CredentialType, credential_id: i64) -> String {
    format!("{}:{}", credential_type, credential_id)
}

/// Hash a route key for use as a binding key.
///
/// An empty key means "no stickiness requested" and hashes to an empty string.
pub fn route_key_hash(route_key: &str) -> String {
    if route_key.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(route_key.as_bytes()))
}

/// True if the comma separated `groups` contains any name in `allowed`.
///
/// `None` means unrestricted; an empty set admits nothing.
pub fn channel_in_any_group(groups: &str, allowed: Option<&HashSet<String>>) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    if allowed.is_empty() {
        return false;
    }
    groups
        .split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .any(|g| allowed.contains(g))
}

/// Filter applied to fresh candidates and to previously bound selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub require_channel_type: Option<ChannelType>,
    pub require_channel_id: Option<i64>,
    /// Group names the caller may use; `None` = unrestricted
    pub allow_groups: Option<HashSet<String>>,
    /// Channel ids the caller may use; `None` = unrestricted
    pub allow_channel_ids: Option<HashSet<i64>>,
}

impl Constraints {
    pub fn with_channel_type(mut self, channel_type: ChannelType) -> Self {
        self.require_channel_type = Some(channel_type);
        self
    }

    pub fn with_channel_id(mut self, channel_id: i64) -> Self {
        self.require_channel_id = Some(channel_id);
        self
    }

    pub fn with_allow_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_allow_channel_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        self.allow_channel_ids = Some(ids.into_iter().collect());
        self
    }

    /// Whether a channel with these attributes passes the filter
    pub fn allows_channel(&self, channel_type: ChannelType, groups: &str, channel_id: i64) -> bool {
        if self
            .require_channel_type
            .is_some_and(|required| required != channel_type)
        {
            return false;
        }
        if self
            .require_channel_id
            .is_some_and(|required| required != channel_id)
        {
            return false;
        }
        if let Some(ids) = &self.allow_channel_ids
            && !ids.contains(&channel_id)
        {
            return false;
        }
        channel_in_any_group(groups, self.allow_groups.as_ref())
    }

    /// Whether a previously bound selection still passes the filter
    pub fn matches_selection(&self, sel: &Selection) -> bool {
        self.allows_channel(sel.channel_type, &sel.channel_groups, sel.channel_id)
    }

    /// Whether a named sub-group may be entered
    pub fn allows_group(&self, name: &str) -> bool {
        let Some(allowed) = &self.allow_groups else {
            return true;
        };
        let name = name.trim();
        !name.is_empty() && allowed.contains(name)
    }
}

/// Classified cause of a failed (or cut short) upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    ReadUpstream,
    UpstreamStatus,
    UpstreamExhausted,
    StreamIdleTimeout,
    StreamReadError,
    StreamEventTooLarge,
    StreamFirstByteTimeout,
    ClientDisconnect,
    StreamMaxDuration,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::ReadUpstream => "read_upstream",
            ErrorClass::UpstreamStatus => "upstream_status",
            ErrorClass::UpstreamExhausted => "upstream_exhausted",
            ErrorClass::StreamIdleTimeout => "stream_idle_timeout",
            ErrorClass::StreamReadError => "stream_read_error",
            ErrorClass::StreamEventTooLarge => "stream_event_too_large",
            ErrorClass::StreamFirstByteTimeout => "stream_first_byte_timeout",
            ErrorClass::ClientDisconnect => "client_disconnect",
            ErrorClass::StreamMaxDuration => "stream_max_duration",
        }
    }

    /// Classes caused by the caller rather than by upstream health
    pub fn is_benign(&self) -> bool {
        matches!(self, ErrorClass::ClientDisconnect | ErrorClass::StreamMaxDuration)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "network" => ErrorClass::Network,
            "read_upstream" => ErrorClass::ReadUpstream,
            "upstream_status" => ErrorClass::UpstreamStatus,
            "upstream_exhausted" => ErrorClass::UpstreamExhausted,
            "stream_idle_timeout" => ErrorClass::StreamIdleTimeout,
            "stream_read_error" => ErrorClass::StreamReadError,
            "stream_event_too_large" => ErrorClass::StreamEventTooLarge,
            "stream_first_byte_timeout" => ErrorClass::StreamFirstByteTimeout,
            "client_disconnect" => ErrorClass::ClientDisconnect,
            "stream_max_duration" => ErrorClass::StreamMaxDuration,
            other => return Err(format!("unknown error class: {}", other)),
        })
    }
}

/// Outcome of one upstream attempt, reported back to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptResult {
    pub success: bool,
    pub retriable: bool,
    pub status_code: Option<u16>,
    pub error_class: Option<ErrorClass>,
    /// Provider-declared reset time; extends the computed cooldown when later
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AttemptResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(
        retriable: bool,
        status_code: Option<u16>,
        error_class: Option<ErrorClass>,
    ) -> Self {
        Self {
            success: false,
            retriable,
            status_code,
            error_class,
            cooldown_until: None,
        }
    }

    pub fn with_cooldown_until(mut self, until: DateTime<Utc>) -> Self {
        self.cooldown_until = Some(until);
        self
    }

    /// Result for an attempt whose body was relayed as a stream.
    ///
    /// Caller-side terminations after a 2xx status still count as success
    /// for routing purposes.
    pub fn for_stream(status_code: u16, error_class: Option<ErrorClass>) -> Self {
        let ok_status = (200..300).contains(&status_code);
        match error_class {
            None if ok_status => Self::success(),
            Some(class) if class.is_benign() && ok_status => Self::success(),
            Some(class) if class.is_benign() => {
                Self::failure(false, Some(status_code), Some(class))
            }
            class => Self::failure(true, Some(status_code), class),
        }
    }
}

#[cfg(test)]
mod tests;
