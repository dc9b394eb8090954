//! Signaling relay core: presence, live membership, and routing.
//!
//! The relay never inspects negotiation payloads. It resolves recipients from
//! the addressing fields of a [`Signal`] and hands the frame, unchanged, to the
//! outbound queue of every live connection of every recipient. Nothing is
//! queued for offline users; the sender gets `delivery:failed` instead.
//!
//! All state is in memory. After a relay restart clients re-register and
//! re-announce their channel membership.

use crate::error::RelayError;
use crate::membership::{ChannelMembership, MembershipStats};
use crate::presence::PresenceRegistry;
use huddle_common::signal::Recipient;
use huddle_common::{ChannelId, ConnectionId, Signal, UserId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct Relay {
    presence: Arc<PresenceRegistry>,
    membership: Arc<ChannelMembership>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn membership(&self) -> &ChannelMembership {
        &self.membership
    }

    /// Bind a connection. The user's first connection announces them online.
    pub async fn register(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        outbound: mpsc::Sender<Signal>,
    ) {
        let first = self
            .presence
            .register(user_id.clone(), connection_id, outbound)
            .await;

        tracing::info!(
            user = %user_id,
            connection = %connection_id,
            first,
            "Connection registered"
        );

        if first {
            let online = Signal::PresenceOnline {
                user_id: user_id.clone(),
            };
            for tx in self.presence.senders_except(user_id).await {
                deliver(&tx, online.clone());
            }
        }
    }

    /// Unbind a connection. When it was the user's last one, announce them
    /// offline and pull them out of every voice channel.
    pub async fn unregister(&self, connection_id: ConnectionId) {
        let Some(departure) = self.presence.unregister(connection_id).await else {
            return;
        };
        tracing::info!(
            user = %departure.user_id,
            connection = %connection_id,
            last = departure.last_connection,
            "Connection unregistered"
        );
        if !departure.last_connection {
            return;
        }

        let user_id = departure.user_id;
        for departed in self.membership.leave_all(&user_id).await {
            self.notify_left(&departed.channel_id, &user_id, &departed.remaining)
                .await;
        }

        let offline = Signal::PresenceOffline {
            user_id: user_id.clone(),
        };
        for tx in self.presence.senders_except(&user_id).await {
            deliver(&tx, offline.clone());
        }
    }

    /// Handle one frame from an identified connection.
    pub async fn handle(
        &self,
        connection_id: ConnectionId,
        user_id: &UserId,
        signal: Signal,
    ) -> Result<(), RelayError> {
        if let Some(claimed) = signal.sender() {
            if claimed != user_id {
                return Err(RelayError::SenderMismatch {
                    claimed: claimed.clone(),
                    actual: user_id.clone(),
                });
            }
        }

        match signal {
            Signal::Identify { .. } => Err(RelayError::AlreadyIdentified),
            Signal::Heartbeat { .. } => {
                if !self.presence.touch(connection_id).await {
                    return Err(RelayError::UnknownConnection(connection_id));
                }
                self.reply(
                    connection_id,
                    Signal::HeartbeatAck {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                )
                .await
            }
            Signal::ChannelJoin { channel_id, .. } => {
                let members = self.join_channel(user_id, &channel_id).await;
                self.reply(
                    connection_id,
                    Signal::ChannelMembers {
                        channel_id,
                        members,
                    },
                )
                .await
            }
            Signal::ChannelLeave { channel_id, .. } => {
                self.leave_channel(user_id, &channel_id).await;
                Ok(())
            }
            other => self.route(connection_id, other).await.map(|_| ()),
        }
    }

    /// Forward a signal to its recipients. Returns how many connections
    /// received it.
    pub async fn route(
        &self,
        from_connection: ConnectionId,
        signal: Signal,
    ) -> Result<usize, RelayError> {
        match signal.recipient() {
            Recipient::User(to_id) => {
                let targets = self.presence.senders(to_id).await;
                if targets.is_empty() {
                    let to_id = to_id.clone();
                    tracing::debug!(to = %to_id, kind = %signal.kind(), "Recipient offline");
                    let failed = Signal::DeliveryFailed {
                        to_id: to_id.clone(),
                        call_id: signal.call_id(),
                        kind: signal.kind(),
                    };
                    self.reply(from_connection, failed).await?;
                    return Err(RelayError::DeliveryFailed { to: to_id });
                }

                tracing::debug!(to = %to_id, kind = %signal.kind(), "Routing signal");
                Ok(targets
                    .iter()
                    .filter(|tx| deliver(tx, signal.clone()))
                    .count())
            }
            Recipient::Channel(channel_id) => {
                let Some(sender) = signal.sender() else {
                    return Err(RelayError::InvalidSignal(signal.kind()));
                };
                if !self.membership.is_member(sender, channel_id).await {
                    return Err(RelayError::NotInChannel(channel_id.clone()));
                }

                let mut delivered = 0;
                for member in self.membership.members(channel_id).await {
                    if member == *sender {
                        continue;
                    }
                    for tx in self.presence.senders(&member).await {
                        if deliver(&tx, signal.clone()) {
                            delivered += 1;
                        }
                    }
                }
                Ok(delivered)
            }
            Recipient::Relay | Recipient::None => Err(RelayError::InvalidSignal(signal.kind())),
        }
    }

    /// Add a user to a channel's live set. Existing members hear
    /// `member:joined` before the joiner receives the member list, so their
    /// queues already hold the join when the joiner's offers arrive.
    ///
    /// A repeat join is announced too: the joiner has thrown away its links
    /// (a reconnect, or a second device) and the members must rebuild theirs.
    pub async fn join_channel(&self, user_id: &UserId, channel_id: &ChannelId) -> Vec<UserId> {
        let joined = self.membership.join(user_id, channel_id).await;
        if !joined.newly_joined {
            tracing::debug!(user = %user_id, channel = %channel_id, "Repeat channel join");
        }
        let notice = Signal::MemberJoined {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        };
        for member in &joined.existing {
            for tx in self.presence.senders(member).await {
                deliver(&tx, notice.clone());
            }
        }
        joined.existing
    }

    pub async fn leave_channel(&self, user_id: &UserId, channel_id: &ChannelId) {
        if let Some(departed) = self.membership.leave(user_id, channel_id).await {
            self.notify_left(channel_id, user_id, &departed.remaining)
                .await;
        }
    }

    async fn notify_left(&self, channel_id: &ChannelId, user_id: &UserId, remaining: &[UserId]) {
        let notice = Signal::MemberLeft {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        };
        for member in remaining {
            for tx in self.presence.senders(member).await {
                deliver(&tx, notice.clone());
            }
        }
    }

    /// Unregister connections that stopped heartbeating.
    pub async fn sweep(&self, timeout: Duration) -> usize {
        let stale = self.presence.stale(timeout).await;
        for connection_id in &stale {
            tracing::warn!(connection = %connection_id, "Heartbeat timeout, dropping connection");
            self.unregister(*connection_id).await;
        }
        stale.len()
    }

    pub async fn stats(&self) -> RelayStats {
        let (connections, online_users) = self.presence.counts().await;
        RelayStats {
            connections,
            online_users,
            voice: self.membership.stats().await,
        }
    }

    async fn reply(&self, connection_id: ConnectionId, signal: Signal) -> Result<(), RelayError> {
        let tx = self
            .presence
            .sender(connection_id)
            .await
            .ok_or(RelayError::UnknownConnection(connection_id))?;
        deliver(&tx, signal);
        Ok(())
    }
}

/// Queue a frame without waiting; a full or closed queue only affects that
/// one connection.
fn deliver(tx: &mpsc::Sender<Signal>, signal: Signal) -> bool {
    match tx.try_send(signal) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(signal)) => {
            tracing::warn!(kind = %signal.kind(), "Outbound queue full, dropping signal");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RelayStats {
    pub connections: usize,
    pub online_users: usize,
    pub voice: MembershipStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::{CallId, CallType, Scope, SignalKind, VoiceFlags};

    struct Client {
        user: UserId,
        conn: ConnectionId,
        rx: mpsc::Receiver<Signal>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Signal> {
            let mut out = Vec::new();
            while let Ok(signal) = self.rx.try_recv() {
                out.push(signal);
            }
            out
        }
    }

    async fn connect(relay: &Relay, user: &str) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let conn = ConnectionId::new();
        let user = UserId::from(user);
        relay.register(&user, conn, tx).await;
        Client { user, conn, rx }
    }

    fn invite(from: &UserId, to: &str) -> Signal {
        Signal::CallInvite {
            from_id: from.clone(),
            to_id: to.into(),
            call_id: CallId::new(),
            call_type: CallType::Voice,
        }
    }

    #[tokio::test]
    async fn test_online_broadcast_only_for_first_connection() {
        let relay = Relay::new();
        let mut bob = connect(&relay, "bob").await;
        let _alice_phone = connect(&relay, "alice").await;
        let _alice_laptop = connect(&relay, "alice").await;

        let seen = bob.drain();
        assert_eq!(
            seen,
            vec![Signal::PresenceOnline {
                user_id: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_route_fans_out_to_every_device() {
        let relay = Relay::new();
        let alice = connect(&relay, "alice").await;
        let mut bob_phone = connect(&relay, "bob").await;
        let mut bob_laptop = connect(&relay, "bob").await;
        bob_phone.drain();

        let signal = invite(&alice.user, "bob");
        let delivered = relay.route(alice.conn, signal.clone()).await.unwrap();

        assert_eq!(delivered, 2);
        assert_eq!(bob_phone.drain(), vec![signal.clone()]);
        assert_eq!(bob_laptop.drain(), vec![signal]);
    }

    #[tokio::test]
    async fn test_offline_recipient_reports_delivery_failure() {
        let relay = Relay::new();
        let mut alice = connect(&relay, "alice").await;

        let signal = invite(&alice.user, "nobody");
        let call_id = signal.call_id();
        let err = relay.route(alice.conn, signal).await.unwrap_err();

        assert!(matches!(err, RelayError::DeliveryFailed { .. }));
        assert_eq!(
            alice.drain(),
            vec![Signal::DeliveryFailed {
                to_id: "nobody".into(),
                call_id,
                kind: SignalKind::CallInvite,
            }]
        );
    }

    #[tokio::test]
    async fn test_sender_mismatch_is_rejected() {
        let relay = Relay::new();
        let alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;
        bob.drain();

        let forged = invite(&"mallory".into(), "bob");
        let err = relay.handle(alice.conn, &alice.user, forged).await.unwrap_err();

        assert_eq!(err.code(), 4005);
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn test_join_notifies_members_and_returns_list() {
        let relay = Relay::new();
        let mut alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;
        let lobby = ChannelId::from("lobby");
        alice.drain();
        bob.drain();

        let join = |user: &UserId| Signal::ChannelJoin {
            user_id: user.clone(),
            channel_id: lobby.clone(),
        };
        relay.handle(alice.conn, &alice.user, join(&alice.user)).await.unwrap();
        relay.handle(bob.conn, &bob.user, join(&bob.user)).await.unwrap();

        assert_eq!(
            alice.drain(),
            vec![
                Signal::ChannelMembers {
                    channel_id: lobby.clone(),
                    members: vec![],
                },
                Signal::MemberJoined {
                    channel_id: lobby.clone(),
                    user_id: "bob".into(),
                },
            ]
        );
        assert_eq!(
            bob.drain(),
            vec![Signal::ChannelMembers {
                channel_id: lobby.clone(),
                members: vec!["alice".into()],
            }]
        );
    }

    #[tokio::test]
    async fn test_repeat_join_is_announced_again() {
        let relay = Relay::new();
        let lobby = ChannelId::from("lobby");
        let mut alice = connect(&relay, "alice").await;
        let bob_old = connect(&relay, "bob").await;
        let mut bob_new = connect(&relay, "bob").await;
        relay.join_channel(&alice.user, &lobby).await;
        relay.join_channel(&bob_old.user, &lobby).await;
        alice.drain();
        bob_new.drain();

        let join = Signal::ChannelJoin {
            user_id: "bob".into(),
            channel_id: lobby.clone(),
        };
        relay.handle(bob_new.conn, &bob_new.user, join).await.unwrap();

        assert_eq!(
            alice.drain(),
            vec![Signal::MemberJoined {
                channel_id: lobby.clone(),
                user_id: "bob".into(),
            }]
        );
        assert_eq!(
            bob_new.drain(),
            vec![Signal::ChannelMembers {
                channel_id: lobby.clone(),
                members: vec!["alice".into()],
            }]
        );
        assert_eq!(relay.membership().members(&lobby).await.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_state_skips_sender() {
        let relay = Relay::new();
        let lobby = ChannelId::from("lobby");
        let mut clients = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let client = connect(&relay, name).await;
            relay.join_channel(&client.user, &lobby).await;
            clients.push(client);
        }
        for client in &mut clients {
            client.drain();
        }

        let state = Signal::VoiceState {
            from_id: "alice".into(),
            scope: Scope::Channel(lobby.clone()),
            to_id: None,
            flags: VoiceFlags {
                self_mute: true,
                ..Default::default()
            },
        };
        let delivered = relay.route(clients[0].conn, state.clone()).await.unwrap();

        assert_eq!(delivered, 2);
        assert!(clients[0].drain().is_empty());
        assert_eq!(clients[1].drain(), vec![state.clone()]);
        assert_eq!(clients[2].drain(), vec![state]);
    }

    #[tokio::test]
    async fn test_channel_state_requires_membership() {
        let relay = Relay::new();
        let outsider = connect(&relay, "eve").await;
        let state = Signal::VoiceState {
            from_id: "eve".into(),
            scope: Scope::Channel("lobby".into()),
            to_id: None,
            flags: VoiceFlags::default(),
        };
        let err = relay.route(outsider.conn, state).await.unwrap_err();
        assert!(matches!(err, RelayError::NotInChannel(_)));
    }

    #[tokio::test]
    async fn test_last_disconnect_leaves_every_channel() {
        let relay = Relay::new();
        let alice = connect(&relay, "alice").await;
        let mut bob = connect(&relay, "bob").await;
        for channel in ["lobby", "raid"] {
            relay.join_channel(&alice.user, &channel.into()).await;
            relay.join_channel(&bob.user, &channel.into()).await;
        }
        bob.drain();

        relay.unregister(alice.conn).await;

        let seen = bob.drain();
        let left: Vec<&Signal> = seen
            .iter()
            .filter(|s| matches!(s, Signal::MemberLeft { .. }))
            .collect();
        assert_eq!(left.len(), 2);
        assert_eq!(
            seen.last(),
            Some(&Signal::PresenceOffline {
                user_id: "alice".into()
            })
        );
        assert!(relay.membership().channels_of(&alice.user).await.is_empty());
    }

    #[tokio::test]
    async fn test_secondary_device_disconnect_keeps_membership() {
        let relay = Relay::new();
        let alice_phone = connect(&relay, "alice").await;
        let _alice_laptop = connect(&relay, "alice").await;
        let lobby = ChannelId::from("lobby");
        relay.join_channel(&alice_phone.user, &lobby).await;

        relay.unregister(alice_phone.conn).await;

        assert!(relay.membership().is_member(&"alice".into(), &lobby).await);
        assert!(relay.presence().is_online(&"alice".into()).await);
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let relay = Relay::new();
        let mut alice = connect(&relay, "alice").await;

        relay
            .handle(alice.conn, &alice.user, Signal::Heartbeat { timestamp: 1 })
            .await
            .unwrap();

        assert!(matches!(alice.drain().as_slice(), [Signal::HeartbeatAck { .. }]));
    }

    #[tokio::test]
    async fn test_relay_originated_signal_from_client_is_rejected() {
        let relay = Relay::new();
        let alice = connect(&relay, "alice").await;
        let err = relay
            .handle(
                alice.conn,
                &alice.user,
                Signal::MemberLeft {
                    channel_id: "lobby".into(),
                    user_id: "bob".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidSignal(SignalKind::MemberLeft)));
    }
}
