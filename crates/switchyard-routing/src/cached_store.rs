//! TTL read-through cache over an [`UpstreamStore`]
//!
//! Each catalog list is cached per key (channels globally, endpoints per
//! channel, credentials per endpoint) until its TTL passes. Invalidation is
//! whole-cache only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use switchyard_core::{
    ApiCredential, CodexOAuthAccount, Result, UpstreamChannel, UpstreamEndpoint, UpstreamStore,
};
use tracing::debug;

struct CacheEntry<T> {
    expires_at: Instant,
    value: T,
}

impl<T: Clone> CacheEntry<T> {
    fn live(&self, now: Instant) -> Option<T> {
        (now < self.expires_at).then(|| self.value.clone())
    }
}

#[derive(Default)]
struct CacheMaps {
    channels: Option<CacheEntry<Vec<UpstreamChannel>>>,
    endpoints: HashMap<i64, CacheEntry<Vec<UpstreamEndpoint>>>,
    openai_credentials: HashMap<i64, CacheEntry<Vec<ApiCredential>>>,
    anthropic_credentials: HashMap<i64, CacheEntry<Vec<ApiCredential>>>,
    codex_accounts: HashMap<i64, CacheEntry<Vec<CodexOAuthAccount>>>,
}

/// Caching decorator for the catalog read interface
pub struct CachedUpstreamStore {
    inner: Arc<dyn UpstreamStore>,
    ttl: Duration,
    cache: Mutex<CacheMaps>,
}

impl CachedUpstreamStore {
    pub fn new(inner: Arc<dyn UpstreamStore>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(CacheMaps::default()),
        }
    }

    /// Wrap `inner` with a cache, or return it unchanged when `ttl` is zero
    pub fn wrap(inner: Arc<dyn UpstreamStore>, ttl: Duration) -> Arc<dyn UpstreamStore> {
        if ttl.is_zero() {
            return inner;
        }
        Arc::new(Self::new(inner, ttl))
    }

    fn lock(&self) -> MutexGuard<'_, CacheMaps> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry<T>(&self, value: T) -> CacheEntry<T> {
        let now = Instant::now();
        CacheEntry {
            expires_at: now.checked_add(self.ttl).unwrap_or(now),
            value,
        }
    }
}

#[async_trait]
impl UpstreamStore for CachedUpstreamStore {
    async fn list_upstream_channels(&self) -> Result<Vec<UpstreamChannel>> {
        if let Some(hit) = self
            .lock()
            .channels
            .as_ref()
            .and_then(|e| e.live(Instant::now()))
        {
            return Ok(hit);
        }
        let channels = self.inner.list_upstream_channels().await?;
        self.lock().channels = Some(self.entry(channels.clone()));
        Ok(channels)
    }

    async fn list_upstream_endpoints_by_channel(
        &self,
        channel_id: i64,
    ) -> Result<Vec<UpstreamEndpoint>> {
        if let Some(hit) = self
            .lock()
            .endpoints
            .get(&channel_id)
            .and_then(|e| e.live(Instant::now()))
        {
            return Ok(hit);
        }
        let endpoints = self
            .inner
            .list_upstream_endpoints_by_channel(channel_id)
            .await?;
        let entry = self.entry(endpoints.clone());
        self.lock().endpoints.insert(channel_id, entry);
        Ok(endpoints)
    }

    async fn list_openai_compatible_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        if let Some(hit) = self
            .lock()
            .openai_credentials
            .get(&endpoint_id)
            .and_then(|e| e.live(Instant::now()))
        {
            return Ok(hit);
        }
        let creds = self
            .inner
            .list_openai_compatible_credentials_by_endpoint(endpoint_id)
            .await?;
        let entry = self.entry(creds.clone());
        self.lock().openai_credentials.insert(endpoint_id, entry);
        Ok(creds)
    }

    async fn list_anthropic_credentials_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<ApiCredential>> {
        if let Some(hit) = self
            .lock()
            .anthropic_credentials
            .get(&endpoint_id)
            .and_then(|e| e.live(Instant::now()))
        {
            return Ok(hit);
        }
        let creds = self
            .inner
            .list_anthropic_credentials_by_endpoint(endpoint_id)
            .await?;
        let entry = self.entry(creds.clone());
        self.lock().anthropic_credentials.insert(endpoint_id, entry);
        Ok(creds)
    }

    async fn list_codex_oauth_accounts_by_endpoint(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<CodexOAuthAccount>> {
        if let Some(hit) = self
            .lock()
            .codex_accounts
            .get(&endpoint_id)
            .and_then(|e| e.live(Instant::now()))
        {
            return Ok(hit);
        }
        let accounts = self
            .inner
            .list_codex_oauth_accounts_by_endpoint(endpoint_id)
            .await?;
        let entry = self.entry(accounts.clone());
        self.lock().codex_accounts.insert(endpoint_id, entry);
        Ok(accounts)
    }

    async fn touch_codex_oauth_account(&self, account_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_codex_oauth_account(account_id, at).await?;
        // last_used_at drives codex ordering, so cached lists are stale now
        self.lock().codex_accounts.clear();
        Ok(())
    }

    fn invalidate_all(&self) {
        *self.lock() = CacheMaps::default();
        self.inner.invalidate_all();
        debug!("Catalog cache invalidated");
    }
}
