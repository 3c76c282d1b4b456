//! Default channel ring
//!
//! Flattens the group tree under a root group into the ordered list of
//! channels the pinned pointer rotates over.

use std::collections::HashSet;
use switchyard_core::{ChannelGroupStore, Error, MemberRef, Result};
use tracing::debug;

/// Depth-first walk of the group tree rooted at `root_name`.
///
/// Members are visited in store order. Disabled groups and channels are
/// skipped, every group is expanded at most once and each channel appears
/// once, at its first position.
pub async fn build_default_channel_ring(
    store: &dyn ChannelGroupStore,
    root_name: &str,
) -> Result<Vec<i64>> {
    let root = store
        .get_channel_group_by_name(root_name)
        .await?
        .ok_or_else(|| Error::GroupNotFound(root_name.to_string()))?;
    if !root.status.is_enabled() {
        return Ok(Vec::new());
    }

    let mut ring = Vec::new();
    let mut seen_channels = HashSet::new();
    let mut visited_groups = HashSet::from([root.id]);

    // Explicit stack of (group id, members, next member index)
    let mut stack = vec![(root.id, store.list_channel_group_members(root.id).await?, 0usize)];
    while let Some((group_id, members, idx)) = stack.pop() {
        let Some(member) = members.get(idx).cloned() else {
            continue;
        };
        stack.push((group_id, members, idx + 1));

        match member.member {
            MemberRef::Channel { id, status, .. } => {
                if status.is_enabled() && id > 0 && seen_channels.insert(id) {
                    ring.push(id);
                }
            }
            MemberRef::Group { id, status, .. } => {
                if !status.is_enabled() || !visited_groups.insert(id) {
                    continue;
                }
                let children = store.list_channel_group_members(id).await?;
                stack.push((id, children, 0));
            }
        }
    }

    debug!(root = root_name, channels = ring.len(), "Built default channel ring");
    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use switchyard_core::{ChannelGroup, ChannelGroupMember, ChannelType, Status};

    struct TreeStore {
        groups: Vec<ChannelGroup>,
        members: HashMap<i64, Vec<ChannelGroupMember>>,
    }

    #[async_trait]
    impl ChannelGroupStore for TreeStore {
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

    fn group(id: i64, name: &str) -> ChannelGroup {
        ChannelGroup {
            id,
            name: name.to_string(),
            description: None,
            max_attempts: 0,
            status: Status::Enabled,
        }
    }

    fn channel(parent: i64, id: i64, status: Status) -> ChannelGroupMember {
        ChannelGroupMember {
            parent_group_id: parent,
            member: MemberRef::Channel {
                id,
                name: format!("ch-{}", id),
                channel_type: ChannelType::OpenAICompatible,
                groups: String::new(),
                status,
            },
            priority: 0,
            promotion: false,
        }
    }

    fn sub_group(parent: i64, id: i64) -> ChannelGroupMember {
        ChannelGroupMember {
            parent_group_id: parent,
            member: MemberRef::Group {
                id,
                name: format!("g-{}", id),
                status: Status::Enabled,
                max_attempts: 0,
            },
            priority: 0,
            promotion: false,
        }
    }

    #[tokio::test]
    async fn test_ring_is_depth_first_and_deduplicated() {
        let store = TreeStore {
            groups: vec![group(1, "default"), group(2, "g-2"), group(3, "g-3")],
            members: HashMap::from([
                (
                    1,
                    vec![
                        channel(1, 10, Status::Enabled),
                        sub_group(1, 2),
                        channel(1, 40, Status::Enabled),
                    ],
                ),
                (
                    2,
                    vec![
                        channel(2, 20, Status::Enabled),
                        channel(2, 10, Status::Enabled),
                        sub_group(2, 3),
                        channel(2, 25, Status::Disabled),
                    ],
                ),
                // Cycle back to the root
                (3, vec![channel(3, 30, Status::Enabled), sub_group(3, 1)]),
            ]),
        };

        let ring = build_default_channel_ring(&store, "default").await.unwrap();
        assert_eq!(ring, vec![10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let store = TreeStore {
            groups: vec![],
            members: HashMap::new(),
        };
        let err = build_default_channel_ring(&store, "default").await.unwrap_err();
        assert!(matches!(err, Error::GroupNotFound(_)));
    }
}
