//! Switchyard Routing Engine
//!
//! This crate provides the upstream selection logic for Switchyard:
//! - Runtime scheduling state (bindings, rate windows, cooldowns, bans, probes)
//! - Three-layer channel / endpoint / credential scheduler
//! - Authorization-scoped group router with per-group attempt budgets
//! - TTL read-through catalog cache
//! - Best-effort pointer persistence

pub mod cached_store;
pub mod channel_ring;
pub mod group_router;
pub mod pointer;
pub mod policy;
pub mod scheduler;
pub mod state;
pub mod stats;

// Re-export commonly used types
pub use cached_store::CachedUpstreamStore;
pub use channel_ring::build_default_channel_ring;
pub use group_router::{GroupRouter, GroupRouterConfig};
pub use pointer::PointerPersistence;
pub use policy::{SchedulerConfig, should_ban_channel_immediately};
pub use scheduler::Scheduler;
pub use state::{ChannelPointerSnapshot, LastSuccess, PointerChangeHook, RuntimeState};
pub use stats::{BindingClearReason, BindingSetSource, BindingStats, RuntimeChannelStats};
