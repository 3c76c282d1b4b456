//! File-backed upstream and group catalog

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, error, info};

use switchyard_core::{
    ApiCredential, ChannelGroup, ChannelGroupMember, ChannelGroupStore, ChannelPolicy, ChannelType,
    CodexOAuthAccount, Error, MemberRef, Result, Status, UpstreamChannel, UpstreamEndpoint,
    UpstreamStore,
};

/// On-disk catalog layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
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
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEntry {
    pub id: i64,
    pub base_url: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: i32,
    /// API keys; OpenAI-compatible and Anthropic channels only
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    /// OAuth accounts; Codex channels only
    #[serde(default)]
    pub codex_accounts: Vec<CodexAccountEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodexAccountEntry {
    pub id: i64,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub members: Vec<MemberEntry>,
}

/// Group member; exactly one of `channel` and `group` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEntry {
    #[serde(default)]
    pub channel: Option<i64>,
    #[serde(default)]
    pub group: Option<i64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub promotion: bool,
}

impl CatalogDocument {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| {
            error!("Failed to parse YAML catalog: {}", e);
            Error::Config(format!("Invalid YAML: {}", e))
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            error!("Failed to parse TOML catalog: {}", e);
            Error::Config(format!("Invalid TOML: {}", e))
        })
    }
}

/// Entity counts of a loaded catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub channels: usize,
    pub endpoints: usize,
    pub credentials: usize,
    pub codex_accounts: usize,
    pub groups: usize,
}

/// Read-only catalog held in memory.
///
/// Only Codex `last_used_at` changes after loading, and only in memory.
#[derive(Debug)]
pub struct FileCatalog {
    path: Option<PathBuf>,
    channels: Vec<UpstreamChannel>,
    /// Endpoints by channel id
    endpoints: HashMap<i64, Vec<UpstreamEndpoint>>,
    /// Channel type of each endpoint
    endpoint_types: HashMap<i64, ChannelType>,
    /// API credentials by endpoint id
    credentials: HashMap<i64, Vec<ApiCredential>>,
    /// Codex accounts by endpoint id
    codex_accounts: RwLock<HashMap<i64, Vec<CodexOAuthAccount>>>,
    groups: Vec<ChannelGroup>,
    /// Members by parent group id
    members: HashMap<i64, Vec<ChannelGroupMember>>,
}

impl FileCatalog {
    /// Load a catalog file; `.toml` files are read as TOML, anything else as YAML
    ///
    /// # Errors
    /// - `Error::Io` if the file can't be read
    /// - `Error::Config` if the document doesn't parse
    /// - `Error::ConfigValidation` if ids collide or references don't resolve
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            error!("Failed to read catalog file {:?}: {}", path, e);
            Error::Io(e)
        })?;

        let document = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            CatalogDocument::from_toml_str(&contents)?
        } else {
            CatalogDocument::from_yaml_str(&contents)?
        };

        let mut catalog = Self::from_document(document)?;
        catalog.path = Some(path.to_path_buf());
        info!(
            path = ?path,
            channels = catalog.channels.len(),
            groups = catalog.groups.len(),
            "Loaded catalog"
        );
        Ok(catalog)
    }

    /// Validate a parsed document and index it
    pub fn from_document(document: CatalogDocument) -> Result<Self> {
        validate(&document)?;

        let mut channels = Vec::with_capacity(document.channels.len());
        let mut endpoints: HashMap<i64, Vec<UpstreamEndpoint>> = HashMap::new();
        let mut endpoint_types = HashMap::new();
        let mut credentials: HashMap<i64, Vec<ApiCredential>> = HashMap::new();
        let mut codex_accounts: HashMap<i64, Vec<CodexOAuthAccount>> = HashMap::new();

        for entry in &document.channels {
            channels.push(UpstreamChannel {
                id: entry.id,
                channel_type: entry.channel_type,
                name: entry.name.clone(),
                groups: entry.groups.clone(),
                status: entry.status,
                priority: entry.priority,
                promotion: entry.promotion,
                policy: entry.policy.clone(),
            });

            for ep in &entry.endpoints {
                endpoint_types.insert(ep.id, entry.channel_type);
                endpoints.entry(entry.id).or_default().push(UpstreamEndpoint {
                    id: ep.id,
                    channel_id: entry.id,
                    base_url: ep.base_url.clone(),
                    status: ep.status,
                    priority: ep.priority,
                });
                credentials.insert(
                    ep.id,
                    ep.credentials
                        .iter()
                        .map(|c| ApiCredential {
                            id: c.id,
                            endpoint_id: ep.id,
                            name: c.name.clone(),
                            status: c.status,
                        })
                        .collect(),
                );
                codex_accounts.insert(
                    ep.id,
                    ep.codex_accounts
                        .iter()
                        .map(|a| CodexOAuthAccount {
                            id: a.id,
                            endpoint_id: ep.id,
                            account_id: a.account_id.clone(),
                            email: a.email.clone(),
                            status: a.status,
                            cooldown_until: a.cooldown_until,
                            last_used_at: a.last_used_at,
                        })
                        .collect(),
                );
            }
        }

        let channel_index: HashMap<i64, &ChannelEntry> =
            document.channels.iter().map(|c| (c.id, c)).collect();
        let group_index: HashMap<i64, &GroupEntry> =
            document.groups.iter().map(|g| (g.id, g)).collect();

        let mut groups = Vec::with_capacity(document.groups.len());
        let mut members: HashMap<i64, Vec<ChannelGroupMember>> = HashMap::new();
        for group in &document.groups {
            groups.push(ChannelGroup {
                id: group.id,
                name: group.name.clone(),
                description: group.description.clone(),
                max_attempts: group.max_attempts,
                status: group.status,
            });

            let edges = members.entry(group.id).or_default();
            for member in &group.members {
                let member_ref = match (member.channel, member.group) {
                    (Some(id), None) => channel_index.get(&id).map(|ch| MemberRef::Channel {
                        id,
                        name: ch.name.clone(),
                        channel_type: ch.channel_type,
                        groups: ch.groups.clone(),
                        status: ch.status,
                    }),
                    (None, Some(id)) => group_index.get(&id).map(|g| MemberRef::Group {
                        id,
                        name: g.name.clone(),
                        status: g.status,
                        max_attempts: g.max_attempts,
                    }),
                    _ => None,
                };
                // Validated above
                if let Some(member_ref) = member_ref {
                    edges.push(ChannelGroupMember {
                        parent_group_id: group.id,
                        member: member_ref,
                        priority: member.priority,
                        promotion: member.promotion,
                    });
                }
            }
        }

        Ok(Self {
            path: None,
            channels,
            endpoints,
            endpoint_types,
            credentials,
            codex_accounts: RwLock::new(codex_accounts),
            groups,
            members,
        })
    }

    /// Source file, when loaded from disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn channels(&self) -> &[UpstreamChannel] {
        &self.channels
    }

    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }

    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            channels: self.channels.len(),
            endpoints: self.endpoints.values().map(Vec::len).sum(),
            credentials: self.credentials.values().map(Vec::len).sum(),
            codex_accounts: self
                .codex_accounts
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .values()
                .map(Vec::len)
                .sum(),
            groups: self.groups.len(),
        }
    }

    fn api_credentials(&self, endpoint_id: i64, channel_type: ChannelType) -> Vec<ApiCredential> {
        if self.endpoint_types.get(&endpoint_id) != Some(&channel_type) {
            return Vec::new();
        }
        self.credentials
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn invalid(message: String) -> Error {
    error!("Invalid catalog: {}", message);
    Error::ConfigValidation(message)
}

/// Check ids, names and cross references of a catalog document
fn validate(document: &CatalogDocument) -> Result<()> {
    let mut channel_ids = HashSet::new();
    let mut endpoint_ids = HashSet::new();
    let mut credential_ids = HashSet::new();
    let mut account_ids = HashSet::new();

    for channel in &document.channels {
        if channel.id <= 0 {
            return Err(invalid(format!("channel id must be positive, got {}", channel.id)));
        }
        if !channel_ids.insert(channel.id) {
            return Err(invalid(format!("duplicate channel id {}", channel.id)));
        }
        if channel.name.trim().is_empty() {
            return Err(invalid(format!("channel {} has an empty name", channel.id)));
        }

        let is_codex = channel.channel_type == ChannelType::CodexOAuth;
        for endpoint in &channel.endpoints {
            if !endpoint_ids.insert(endpoint.id) {
                return Err(invalid(format!("duplicate endpoint id {}", endpoint.id)));
            }
            if endpoint.base_url.trim().is_empty() {
                return Err(invalid(format!("endpoint {} has an empty base_url", endpoint.id)));
            }
            if is_codex && !endpoint.credentials.is_empty() {
                return Err(invalid(format!(
                    "endpoint {} of codex_oauth channel {} lists API credentials",
                    endpoint.id, channel.id
                )));
            }
            if !is_codex && !endpoint.codex_accounts.is_empty() {
                return Err(invalid(format!(
                    "endpoint {} lists codex accounts but channel {} is {}",
                    endpoint.id,
                    channel.id,
                    channel.channel_type.as_str()
                )));
            }
            for credential in &endpoint.credentials {
                if !credential_ids.insert(credential.id) {
                    return Err(invalid(format!("duplicate credential id {}", credential.id)));
                }
            }
            for account in &endpoint.codex_accounts {
                if !account_ids.insert(account.id) {
                    return Err(invalid(format!("duplicate codex account id {}", account.id)));
                }
            }
        }
    }

    let mut group_ids = HashSet::new();
    let mut group_names = HashSet::new();
    for group in &document.groups {
        if !group_ids.insert(group.id) {
            return Err(invalid(format!("duplicate group id {}", group.id)));
        }
        let name = group.name.trim();
        if name.is_empty() {
            return Err(invalid(format!("group {} has an empty name", group.id)));
        }
        if !group_names.insert(name.to_string()) {
            return Err(invalid(format!("duplicate group name {:?}", name)));
        }
    }

    for group in &document.groups {
        for member in &group.members {
            match (member.channel, member.group) {
                (Some(id), None) if !channel_ids.contains(&id) => {
                    return Err(invalid(format!(
                        "group {} references unknown channel {}",
                        group.name, id
                    )));
                }
                (None, Some(id)) if !group_ids.contains(&id) => {
                    return Err(invalid(format!(
                        "group {} references unknown group {}",
                        group.name, id
                    )));
                }
                (None, Some(id)) if id == group.id => {
                    return Err(invalid(format!("group {} lists itself as a member", group.name)));
                }
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "member of group {} must reference exactly one of channel or group",
                        group.name
                    )));
                }
            }
        }
    }

    Ok(())
}

#[async_trait]
impl UpstreamStore for FileCatalog {
    async fn list_upstream_channels(&self) -> Result<Vec<UpstreamChannel>> {
        Ok(self.channels.clone())
    }

    async fn list_upstream_endpoints_by_channel(
        &self,
        channel_id: i64,
    ) -> Result<Vec<UpstreamEndpoint>> {
        Ok(self.endpoints.get(&channel_id).cloned().unwrap_or_default())
    }

    async fn list_openai_compatible_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        Ok(self.api_credentials(endpoint_id, ChannelType::OpenAICompatible))
    }

    async fn list_anthropic_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        Ok(self.api_credentials(endpoint_id, ChannelType::Anthropic))
    }

    async fn list_codex_oauth_accounts_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<CodexOAuthAccount>> {
        Ok(self
            .codex_accounts
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn touch_codex_oauth_account(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut accounts = self.codex_accounts.write().unwrap_or_else(|p| p.into_inner());
        for account in accounts.values_mut().flatten().filter(|a| a.id == account_id) {
            account.last_used_at = Some(at);
            debug!(account_id, "Touched codex account");
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelGroupStore for FileCatalog {
    async fn get_channel_group_by_name(&self, name: &str) -> Result<Option<ChannelGroup>> {
        Ok(self.groups.iter().find(|g| g.name == name).cloned())
    }

    async fn get_channel_group_by_id(&self, id: i64) -> Result<Option<ChannelGroup>> {
        Ok(self.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn list_channel_group_members(
        &self,
        parent_group_id: i64,
    ) -> Result<Vec<ChannelGroupMember>> {
        Ok(self.members.get(&parent_group_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
channels:
  - id: 1
    type: openai_compatible
    name: primary
    groups: "team-a,team-b"
    priority: 10
    endpoints:
      - id: 10
        base_url: https://api.example.com/v1
        credentials:
          - id: 100
            name: key-a
          - id: 101
            status: disabled
  - id: 2
    type: codex_oauth
    name: codex
    endpoints:
      - id: 20
        base_url: https://chatgpt.example.com/backend-api/codex
        codex_accounts:
          - id: 200
            account_id: acct-1
            last_used_at: "2024-01-01T00:00:00Z"
  - id: 3
    type: anthropic
    name: claude
    policy:
      AutoBan: false
    endpoints:
      - id: 30
        base_url: https://anthropic.example.com
        credentials:
          - id: 300
groups:
  - id: 1
    name: default
    max_attempts: 4
    members:
      - channel: 1
        priority: 10
      - group: 2
  - id: 2
    name: codex-pool
    members:
      - channel: 2
        promotion: true
"#;

    fn catalog() -> FileCatalog {
        FileCatalog::from_document(CatalogDocument::from_yaml_str(CATALOG).unwrap()).unwrap()
    }

    fn expect_invalid(yaml: &str) -> String {
        let document = CatalogDocument::from_yaml_str(yaml).unwrap();
        match FileCatalog::from_document(document) {
            Err(Error::ConfigValidation(msg)) => msg,
            other => panic!("expected validation error, got {:?}", other.map(|c| c.summary())),
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = catalog().summary();
        assert_eq!(
            summary,
            CatalogSummary {
                channels: 3,
                endpoints: 3,
                credentials: 3,
                codex_accounts: 1,
                groups: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_upstream_listing() {
        let catalog = catalog();

        let channels = catalog.list_upstream_channels().await.unwrap();
        assert_eq!(channels.len(), 3);
        assert!(!channels[2].policy.auto_ban);

        let endpoints = catalog.list_upstream_endpoints_by_channel(1).await.unwrap();
        assert_eq!(endpoints[0].channel_id, 1);

        let creds = catalog
            .list_openai_compatible_credentials_by_endpoint(10)
            .await
            .unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[1].status, Status::Disabled);

        // Credentials are only listed under their channel's family
        assert!(
            catalog
                .list_anthropic_credentials_by_endpoint(10)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            catalog
                .list_anthropic_credentials_by_endpoint(30)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_group_members_resolve() {
        let catalog = catalog();
        let root = catalog.get_channel_group_by_name("default").await.unwrap().unwrap();
        assert_eq!(root.max_attempts, 4);

        let members = catalog.list_channel_group_members(root.id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(matches!(
            &members[0].member,
            MemberRef::Channel { id: 1, groups, .. } if groups == "team-a,team-b"
        ));
        assert!(matches!(
            &members[1].member,
            MemberRef::Group { id: 2, name, .. } if name == "codex-pool"
        ));
        assert!(catalog.get_channel_group_by_id(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_codex_touch_updates_last_used() {
        let catalog = catalog();
        let at = Utc::now();
        catalog.touch_codex_oauth_account(200, at).await.unwrap();

        let accounts = catalog.list_codex_oauth_accounts_by_endpoint(20).await.unwrap();
        assert_eq!(accounts[0].last_used_at, Some(at));
    }

    #[test]
    fn test_rejects_duplicate_channel_id() {
        let msg = expect_invalid(
            r#"
channels:
  - { id: 1, type: openai_compatible, name: a }
  - { id: 1, type: anthropic, name: b }
"#,
        );
        assert!(msg.contains("duplicate channel id 1"));
    }

    #[test]
    fn test_rejects_codex_accounts_under_api_channel() {
        let msg = expect_invalid(
            r#"
channels:
  - id: 1
    type: openai_compatible
    name: a
    endpoints:
      - id: 10
        base_url: https://x
        codex_accounts:
          - { id: 5 }
"#,
        );
        assert!(msg.contains("codex accounts"));
    }

    #[test]
    fn test_rejects_dangling_member() {
        let msg = expect_invalid(
            r#"
groups:
  - id: 1
    name: default
    members:
      - channel: 42
"#,
        );
        assert!(msg.contains("unknown channel 42"));
    }

    #[test]
    fn test_rejects_ambiguous_member() {
        let msg = expect_invalid(
            r#"
channels:
  - { id: 1, type: openai_compatible, name: a }
groups:
  - id: 1
    name: default
    members:
      - { channel: 1, group: 1 }
"#,
        );
        assert!(msg.contains("exactly one"));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = CatalogDocument::from_yaml_str("channels: [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
