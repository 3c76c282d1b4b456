//! In-memory catalog fakes for routing integration tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use switchyard_core::{
    ApiCredential, ChannelGroup, ChannelGroupMember, ChannelGroupStore, ChannelPolicy, ChannelType,
    CodexOAuthAccount, Error, MemberRef, Result, Status, UpstreamChannel, UpstreamEndpoint,
    UpstreamStore,
};

/// Endpoint id used for the single endpoint of a fake channel
#[allow(dead_code)]
pub fn endpoint_id(channel_id: i64) -> i64 {
    channel_id * 10
}

/// Upstream catalog held in memory, counting reads
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeUpstreamStore {
    channels: Mutex<Vec<UpstreamChannel>>,
    endpoints: Mutex<HashMap<i64, Vec<UpstreamEndpoint>>>,
    credentials: Mutex<HashMap<i64, Vec<ApiCredential>>>,
    codex_accounts: Mutex<HashMap<i64, Vec<CodexOAuthAccount>>>,
    fail_reads: AtomicBool,
    pub channel_reads: Arc<AtomicUsize>,
    pub codex_touches: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeUpstreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel with one endpoint holding the given credential ids
    pub fn add_channel(
        &self,
        id: i64,
        channel_type: ChannelType,
        priority: i32,
        promotion: bool,
        credential_ids: &[i64],
    ) {
        self.channels.lock().unwrap().push(UpstreamChannel {
            id,
            channel_type,
            name: format!("channel-{}", id),
            groups: String::new(),
            status: Status::Enabled,
            priority,
            promotion,
            policy: ChannelPolicy::default(),
        });
        let endpoint = endpoint_id(id);
        self.endpoints.lock().unwrap().insert(
            id,
            vec![UpstreamEndpoint {
                id: endpoint,
                channel_id: id,
                base_url: format!("https://upstream-{}.example.com/v1", id),
                status: Status::Enabled,
                priority: 0,
            }],
        );

        if channel_type == ChannelType::CodexOAuth {
            let accounts = credential_ids
                .iter()
                .map(|cid| CodexOAuthAccount {
                    id: *cid,
                    endpoint_id: endpoint,
                    account_id: format!("acct-{}", cid),
                    email: None,
                    status: Status::Enabled,
                    cooldown_until: None,
                    last_used_at: None,
                })
                .collect();
            self.codex_accounts.lock().unwrap().insert(endpoint, accounts);
        } else {
            let creds = credential_ids
                .iter()
                .map(|cid| ApiCredential {
                    id: *cid,
                    endpoint_id: endpoint,
                    name: None,
                    status: Status::Enabled,
                })
                .collect();
            self.credentials.lock().unwrap().insert(endpoint, creds);
        }
    }

    pub fn add_openai_channel(
        &self,
        id: i64,
        priority: i32,
        promotion: bool,
        credential_ids: &[i64],
    ) {
        self.add_channel(id, ChannelType::OpenAICompatible, priority, promotion, credential_ids);
    }

    pub fn update_channel(&self, id: i64, update: impl FnOnce(&mut UpstreamChannel)) {
        if let Some(ch) = self.channels.lock().unwrap().iter_mut().find(|c| c.id == id) {
            update(ch);
        }
    }

    pub fn update_codex_account(
        &self,
        channel_id: i64,
        account_id: i64,
        update: impl FnOnce(&mut CodexOAuthAccount),
    ) {
        let mut accounts = self.codex_accounts.lock().unwrap();
        if let Some(account) = accounts
            .get_mut(&endpoint_id(channel_id))
            .and_then(|list| list.iter_mut().find(|a| a.id == account_id))
        {
            update(account);
        }
    }

    pub fn codex_account(&self, channel_id: i64, account_id: i64) -> Option<CodexOAuthAccount> {
        self.codex_accounts
            .lock()
            .unwrap()
            .get(&endpoint_id(channel_id))
            .and_then(|list| list.iter().find(|a| a.id == account_id).cloned())
    }

    /// Make every read fail with a store error
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Store("catalog offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamStore for FakeUpstreamStore {
    async fn list_upstream_channels(&self) -> Result<Vec<UpstreamChannel>> {
        self.check()?;
        self.channel_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.channels.lock().unwrap().clone())
    }

    async fn list_upstream_endpoints_by_channel(
        &self,
        channel_id: i64,
    ) -> Result<Vec<UpstreamEndpoint>> {
        self.check()?;
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_openai_compatible_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        self.check()?;
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_anthropic_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        self.list_openai_compatible_credentials_by_endpoint(endpoint_id)
            .await
    }

    async fn list_codex_oauth_accounts_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<CodexOAuthAccount>> {
        self.check()?;
        Ok(self
            .codex_accounts
            .lock()
            .unwrap()
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn touch_codex_oauth_account(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.codex_touches.fetch_add(1, Ordering::SeqCst);
        for list in self.codex_accounts.lock().unwrap().values_mut() {
            for account in list.iter_mut().filter(|a| a.id == account_id) {
                account.last_used_at = Some(at);
            }
        }
        Ok(())
    }
}

/// Channel group tree held in memory
#[derive(Default)]
#[allow(dead_code)]
pub struct FakeGroupStore {
    groups: Mutex<Vec<ChannelGroup>>,
    members: Mutex<HashMap<i64, Vec<ChannelGroupMember>>>,
    pub member_reads: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, id: i64, name: &str, max_attempts: u32) {
        self.groups.lock().unwrap().push(ChannelGroup {
            id,
            name: name.to_string(),
            description: None,
            max_attempts,
            status: Status::Enabled,
        });
    }

    pub fn disable_group(&self, id: i64) {
        if let Some(g) = self.groups.lock().unwrap().iter_mut().find(|g| g.id == id) {
            g.status = Status::Disabled;
        }
    }

    pub fn add_channel_member(
        &self,
        parent: i64,
        channel_id: i64,
        channel_type: ChannelType,
        priority: i32,
        promotion: bool,
    ) {
        self.add_channel_member_with_groups(
            parent,
            channel_id,
            channel_type,
            "",
            priority,
            promotion,
        );
    }

    pub fn add_channel_member_with_groups(
        &self,
        parent: i64,
        channel_id: i64,
        channel_type: ChannelType,
        groups: &str,
        priority: i32,
        promotion: bool,
    ) {
        self.push_member(ChannelGroupMember {
            parent_group_id: parent,
            member: MemberRef::Channel {
                id: channel_id,
                name: format!("channel-{}", channel_id),
                channel_type,
                groups: groups.to_string(),
                status: Status::Enabled,
            },
            priority,
            promotion,
        });
    }

    /// Reference a sub-group; the group row itself may be missing
    pub fn add_group_member(&self, parent: i64, group_id: i64, name: &str, priority: i32) {
        self.push_member(ChannelGroupMember {
            parent_group_id: parent,
            member: MemberRef::Group {
                id: group_id,
                name: name.to_string(),
                status: Status::Enabled,
                max_attempts: 0,
            },
            priority,
            promotion: false,
        });
    }

    fn push_member(&self, member: ChannelGroupMember) {
        self.members
            .lock()
            .unwrap()
            .entry(member.parent_group_id)
            .or_default()
            .push(member);
    }
}

#[async_trait]
impl ChannelGroupStore for FakeGroupStore {
    async fn get_channel_group_by_name(&self, name: &str) -> Result<Option<ChannelGroup>> {
        Ok(self
            .groups
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn get_channel_group_by_id(&self, id: i64) -> Result<Option<ChannelGroup>> {
        Ok(self.groups.lock().unwrap().iter().find(|g| g.id == id).cloned())
    }

    async fn list_channel_group_members(
        &self,
        parent_group_id: i64,
    ) -> Result<Vec<ChannelGroupMember>> {
        self.member_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&parent_group_id)
            .cloned()
            .unwrap_or_default())
    }
}
