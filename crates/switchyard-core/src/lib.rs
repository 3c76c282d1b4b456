//! Switchyard Core Types and Traits
//!
//! This crate provides the value contracts shared by every Switchyard crate:
//! - Selection, constraints and attempt results
//! - Catalog row types and the store traits the router consumes
//! - Core error types

pub mod catalog;
pub mod error;
pub mod selection;

pub use catalog::{
    ApiCredential, ChannelGroup, ChannelGroupMember, ChannelGroupStore, ChannelPointerRecord,
    CodexOAuthAccount, GroupPointerRecord, MemberRef, POINTER_RECORD_VERSION, PointerReason,
    PointerStore, Status, UpstreamChannel, UpstreamEndpoint, UpstreamStore,
};
pub use error::{Error, Result};
pub use selection::{
    AttemptResult, ChannelPolicy, ChannelType, Constraints, CredentialType, ErrorClass,
    Selection, channel_in_any_group, credential_key, route_key_hash,
};
