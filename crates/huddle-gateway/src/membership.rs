//! Live voice-channel membership: who is "in voice" where.
//!
//! Membership changes only through explicit join/leave (or a user's full
//! disconnect); presence never implies membership. This set is a cache of who
//! is present right now, not the permanent member list held by storage.

use huddle_common::{ChannelId, UserId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

/// Outcome of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// Members already in the channel, excluding the joiner.
    pub existing: Vec<UserId>,
    /// `false` when the user was already a member (a re-announce).
    pub newly_joined: bool,
}

/// A channel a user was removed from, with whoever is still in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub channel_id: ChannelId,
    pub remaining: Vec<UserId>,
}

#[derive(Default)]
struct MembershipIndex {
    by_channel: HashMap<ChannelId, BTreeSet<UserId>>,
    by_user: HashMap<UserId, BTreeSet<ChannelId>>,
}

/// Manages membership across all voice channels.
///
/// Two indexes for fast lookups:
/// - `by_channel`: channel_id → members (quick "who's in this channel?")
/// - `by_user`: user_id → channels (quick "where is this user?")
///
/// One lock covers both, so every read and write of a channel's member set
/// is mutually exclusive with every other.
#[derive(Default)]
pub struct ChannelMembership {
    inner: RwLock<MembershipIndex>,
}

impl ChannelMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, user_id: &UserId, channel_id: &ChannelId) -> Joined {
        let mut index = self.inner.write().await;

        let members = index.by_channel.entry(channel_id.clone()).or_default();
        let existing = members.iter().filter(|m| *m != user_id).cloned().collect();
        let newly_joined = members.insert(user_id.clone());

        index
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(channel_id.clone());

        if newly_joined {
            tracing::info!(user = %user_id, channel = %channel_id, "User joined voice channel");
        }

        Joined {
            existing,
            newly_joined,
        }
    }

    /// Remove a user from one channel. `None` if they were not in it.
    pub async fn leave(&self, user_id: &UserId, channel_id: &ChannelId) -> Option<Departed> {
        let mut index = self.inner.write().await;
        let departed = Self::remove(&mut index, user_id, channel_id)?;

        if let Some(channels) = index.by_user.get_mut(user_id) {
            channels.remove(channel_id);
            if channels.is_empty() {
                index.by_user.remove(user_id);
            }
        }

        tracing::info!(user = %user_id, channel = %channel_id, "User left voice channel");
        Some(departed)
    }

    /// Remove a user from every channel they were in.
    pub async fn leave_all(&self, user_id: &UserId) -> Vec<Departed> {
        let mut index = self.inner.write().await;
        let channels = index.by_user.remove(user_id).unwrap_or_default();

        let departed: Vec<Departed> = channels
            .iter()
            .filter_map(|channel_id| Self::remove(&mut index, user_id, channel_id))
            .collect();

        if !departed.is_empty() {
            tracing::info!(
                user = %user_id,
                count = departed.len(),
                "Removed user from all voice channels"
            );
        }
        departed
    }

    fn remove(
        index: &mut MembershipIndex,
        user_id: &UserId,
        channel_id: &ChannelId,
    ) -> Option<Departed> {
        let members = index.by_channel.get_mut(channel_id)?;
        if !members.remove(user_id) {
            return None;
        }
        let remaining: Vec<UserId> = members.iter().cloned().collect();
        if remaining.is_empty() {
            index.by_channel.remove(channel_id);
        }
        Some(Departed {
            channel_id: channel_id.clone(),
            remaining,
        })
    }

    pub async fn members(&self, channel_id: &ChannelId) -> Vec<UserId> {
        self.inner
            .read()
            .await
            .by_channel
            .get(channel_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, user_id: &UserId, channel_id: &ChannelId) -> bool {
        self.inner
            .read()
            .await
            .by_channel
            .get(channel_id)
            .is_some_and(|m| m.contains(user_id))
    }

    pub async fn channels_of(&self, user_id: &UserId) -> Vec<ChannelId> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> MembershipStats {
        let index = self.inner.read().await;
        MembershipStats {
            active_channels: index.by_channel.len(),
            users_in_voice: index.by_user.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MembershipStats {
    pub active_channels: usize,
    pub users_in_voice: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_returns_existing_members() {
        let membership = ChannelMembership::new();
        let lobby = ChannelId::from("lobby");

        let first = membership.join(&"alice".into(), &lobby).await;
        assert!(first.existing.is_empty());
        assert!(first.newly_joined);

        let second = membership.join(&"bob".into(), &lobby).await;
        assert_eq!(second.existing, vec![UserId::from("alice")]);

        let again = membership.join(&"bob".into(), &lobby).await;
        assert!(!again.newly_joined);
        assert_eq!(again.existing, vec![UserId::from("alice")]);
    }

    #[tokio::test]
    async fn test_leave_removes_empty_channel() {
        let membership = ChannelMembership::new();
        let lobby = ChannelId::from("lobby");
        membership.join(&"alice".into(), &lobby).await;

        let departed = membership.leave(&"alice".into(), &lobby).await.unwrap();
        assert!(departed.remaining.is_empty());
        assert_eq!(membership.stats().await.active_channels, 0);
        assert!(membership.leave(&"alice".into(), &lobby).await.is_none());
    }

    #[tokio::test]
    async fn test_leave_all_covers_every_channel() {
        let membership = ChannelMembership::new();
        let alice = UserId::from("alice");
        for channel in ["lobby", "raid", "music"] {
            membership.join(&alice, &channel.into()).await;
        }
        membership.join(&"bob".into(), &"raid".into()).await;

        let mut departed = membership.leave_all(&alice).await;
        departed.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        assert_eq!(departed.len(), 3);
        let raid = departed.iter().find(|d| d.channel_id.as_str() == "raid").unwrap();
        assert_eq!(raid.remaining, vec![UserId::from("bob")]);
        assert!(membership.channels_of(&alice).await.is_empty());
        assert!(!membership.is_member(&alice, &"raid".into()).await);
    }
}
