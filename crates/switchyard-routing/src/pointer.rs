//! Best-effort pointer persistence
//!
//! Writes the scheduler channel pointer and per-group pointers back to a
//! [`PointerStore`] so a restart resumes on the same channel. Writes are
//! deduplicated against the last value persisted and never block routing:
//! the hook path spawns the write with a short timeout and only logs
//! failures.
//!
//! Store writes run one at a time. Spawned writes always persist the newest
//! pending value, so the store never ends on an older pointer than memory.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_core::{
    ChannelPointerRecord, GroupPointerRecord, POINTER_RECORD_VERSION, PointerReason, PointerStore,
    Result,
};
use tracing::{debug, warn};

use crate::state::{ChannelPointerSnapshot, PointerChangeHook, RuntimeState};

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Persists pointer changes to a [`PointerStore`]
pub struct PointerPersistence {
    store: Arc<dyn PointerStore>,
    write_timeout: Duration,
    /// Held across dedup check and upsert
    write_lock: tokio::sync::Mutex<()>,
    last_channel: Mutex<Option<(i64, bool)>>,
    pending_channel: Mutex<Option<ChannelPointerSnapshot>>,
    last_group: DashMap<i64, (i64, bool)>,
    pending_group: DashMap<i64, GroupPointerRecord>,
}

impl PointerPersistence {
    pub fn new(store: Arc<dyn PointerStore>) -> Self {
        Self {
            store,
            write_timeout: WRITE_TIMEOUT,
            write_lock: tokio::sync::Mutex::new(()),
            last_channel: Mutex::new(None),
            pending_channel: Mutex::new(None),
            last_group: DashMap::new(),
            pending_group: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PointerStore> {
        &self.store
    }

    /// Load the persisted scheduler pointer into `state`.
    ///
    /// Returns whether a record was applied. Records with an unknown
    /// version are ignored.
    pub async fn restore(&self, state: &RuntimeState) -> Result<bool> {
        let Some(record) = self.store.get_channel_pointer().await? else {
            return Ok(false);
        };
        if record.v != POINTER_RECORD_VERSION {
            warn!(version = record.v, "Ignoring channel pointer record with unknown version");
            return Ok(false);
        }

        state.apply_channel_pointer_snapshot(snapshot_from_record(&record));
        *lock(&self.last_channel) = Some((record.channel_id, record.pinned));
        debug!(
            channel_id = record.channel_id,
            pinned = record.pinned,
            "Restored channel pointer"
        );
        Ok(true)
    }

    /// Hook suitable for [`RuntimeState::set_pointer_hook`]
    pub fn hook(self: &Arc<Self>) -> PointerChangeHook {
        let this = Arc::clone(self);
        Arc::new(move |snapshot: &ChannelPointerSnapshot| {
            this.persist_channel_pointer(snapshot);
        })
    }

    /// Schedule a write of the scheduler pointer on the current runtime.
    ///
    /// A newer snapshot replaces one still waiting to be written.
    pub fn persist_channel_pointer(self: &Arc<Self>, snapshot: &ChannelPointerSnapshot) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping channel pointer write");
            return;
        };
        *lock(&self.pending_channel) = Some(snapshot.clone());
        let this = Arc::clone(self);
        handle.spawn(async move {
            this.flush_channel_pointer().await;
        });
    }

    async fn flush_channel_pointer(&self) {
        let _guard = self.write_lock.lock().await;
        let pending = lock(&self.pending_channel).take();
        let Some(snapshot) = pending else {
            return;
        };
        if let Err(e) = self.upsert_channel_pointer(&snapshot).await {
            warn!(
                channel_id = snapshot.channel_id,
                error = %e,
                "Failed to persist channel pointer"
            );
        }
    }

    /// Write the scheduler pointer unless it matches the last persisted value.
    ///
    /// Returns whether a write happened.
    pub async fn write_channel_pointer(&self, snapshot: &ChannelPointerSnapshot) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.upsert_channel_pointer(snapshot).await
    }

    /// Caller holds `write_lock`
    async fn upsert_channel_pointer(&self, snapshot: &ChannelPointerSnapshot) -> Result<bool> {
        let key = (snapshot.channel_id, snapshot.pinned);
        let unchanged = *lock(&self.last_channel) == Some(key);
        if unchanged {
            return Ok(false);
        }

        let record = ChannelPointerRecord {
            v: POINTER_RECORD_VERSION,
            channel_id: snapshot.channel_id,
            pinned: snapshot.pinned,
            moved_at_unix_ms: unix_ms(snapshot.moved_at),
            reason: snapshot.reason.unwrap_or(PointerReason::Manual),
        };
        self.with_timeout(self.store.upsert_channel_pointer(&record)).await?;
        *lock(&self.last_channel) = Some(key);
        Ok(true)
    }

    /// Load a group pointer and remember it as the last persisted value
    pub async fn load_group_pointer(&self, group_id: i64) -> Result<Option<GroupPointerRecord>> {
        let record = self.store.get_group_pointer(group_id).await?;
        if let Some(record) = &record {
            self.last_group.insert(group_id, (record.channel_id, record.pinned));
        }
        Ok(record)
    }

    /// Schedule a write of a group pointer on the current runtime.
    ///
    /// A newer record for the same group replaces one still waiting.
    pub fn persist_group_pointer(self: &Arc<Self>, record: GroupPointerRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                group_id = record.group_id,
                "No runtime available, skipping group pointer write"
            );
            return;
        };
        let group_id = record.group_id;
        self.pending_group.insert(group_id, record);
        let this = Arc::clone(self);
        handle.spawn(async move {
            this.flush_group_pointer(group_id).await;
        });
    }

    async fn flush_group_pointer(&self, group_id: i64) {
        let _guard = self.write_lock.lock().await;
        let Some((_, record)) = self.pending_group.remove(&group_id) else {
            return;
        };
        if let Err(e) = self.upsert_group_pointer(&record).await {
            warn!(group_id, error = %e, "Failed to persist group pointer");
        }
    }

    /// Write a group pointer unless it matches the last persisted value
    pub async fn write_group_pointer(&self, record: &GroupPointerRecord) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.upsert_group_pointer(record).await
    }

    /// Caller holds `write_lock`
    async fn upsert_group_pointer(&self, record: &GroupPointerRecord) -> Result<bool> {
        let key = (record.channel_id, record.pinned);
        let unchanged = self
            .last_group
            .get(&record.group_id)
            .is_some_and(|prev| *prev == key);
        if unchanged {
            return Ok(false);
        }

        self.with_timeout(self.store.upsert_group_pointer(record)).await?;
        self.last_group.insert(record.group_id, key);
        Ok(true)
    }

    async fn with_timeout<F>(&self, write: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(switchyard_core::Error::Store(format!(
                "pointer write timed out after {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unix_ms(at: Option<DateTime<Utc>>) -> i64 {
    at.unwrap_or_else(Utc::now).timestamp_millis()
}

fn snapshot_from_record(record: &ChannelPointerRecord) -> ChannelPointerSnapshot {
    ChannelPointerSnapshot {
        channel_id: record.channel_id,
        pinned: record.pinned,
        moved_at: DateTime::from_timestamp_millis(record.moved_at_unix_ms),
        reason: Some(record.reason),
    }
}
