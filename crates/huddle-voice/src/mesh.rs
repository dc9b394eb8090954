//! Full-mesh voice channels.
//!
//! Every member keeps one [`PeerLink`] to every other member, so N members
//! means N−1 links per client. Which side of a pair offers is decided by
//! [`Role::for_pair`] on both ends independently; join order does not matter.
//!
//! Mute, deafen and speaking changes are announced once to the whole channel
//! through the relay's channel fan-out and never renegotiate a link.

use crate::engine::EngineFactory;
use crate::error::VoiceResult;
use crate::media::{Constraints, MediaKind, MediaSourceManager, TrackHandle};
use crate::negotiation::NegotiationQueue;
use crate::peer::{LinkEvent, LinkState, LinkTimers, PeerLink, Role};
use crate::relay_client::RelayHandle;
use huddle_common::config::VoiceConfig;
use huddle_common::{ChannelId, Scope, Signal, TrackId, UserId, VoiceFlags};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub user_id: UserId,
    pub flags: VoiceFlags,
    /// Media is flowing on the link to this member
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Joined {
        channel_id: ChannelId,
        members: Vec<UserId>,
    },
    ParticipantJoined(UserId),
    ParticipantLeft(UserId),
    LinkState {
        user_id: UserId,
        state: LinkState,
    },
    /// The link to this member failed for good; they stay in the channel.
    ParticipantDisconnected(UserId),
    RemoteTrack {
        user_id: UserId,
        mid: String,
        kind: MediaKind,
    },
    PeerState {
        user_id: UserId,
        flags: VoiceFlags,
    },
    RenegotiationFailed {
        user_id: UserId,
        reason: String,
    },
    Left(ChannelId),
}

pub struct ChannelMesh {
    channel_id: ChannelId,
    relay: RelayHandle,
    engines: Arc<dyn EngineFactory>,
    timers: LinkTimers,
    links: BTreeMap<UserId, PeerLink>,
    participants: BTreeMap<UserId, Participant>,
    /// Tracks sent on every link
    tracks: Vec<TrackHandle>,
    /// Subset of `tracks` acquired by the mesh and released on leave
    owned: Vec<TrackId>,
    flags: VoiceFlags,
    joined: bool,
    /// Offers and candidates that beat the member list here
    early: NegotiationQueue<Signal>,
    events: broadcast::Sender<MeshEvent>,
    links_created: usize,
    links_closed: usize,
}

impl ChannelMesh {
    /// Acquire the microphone and announce the join. Nothing is sent when no
    /// microphone is available.
    pub fn join(
        channel_id: ChannelId,
        relay: RelayHandle,
        engines: Arc<dyn EngineFactory>,
        config: &VoiceConfig,
        media: &mut MediaSourceManager,
    ) -> VoiceResult<Self> {
        let mic = media.acquire(
            MediaKind::Audio,
            &Constraints {
                noise_suppression: true,
                ..Default::default()
            },
        )?;

        let (events, _) = broadcast::channel(256);
        let mesh = Self {
            channel_id,
            relay,
            engines,
            timers: LinkTimers::from(config),
            links: BTreeMap::new(),
            participants: BTreeMap::new(),
            owned: vec![mic.id],
            tracks: vec![mic],
            flags: VoiceFlags::default(),
            joined: false,
            early: NegotiationQueue::new(),
            events,
            links_created: 0,
            links_closed: 0,
        };
        tracing::info!(channel = %mesh.channel_id, "Joining voice channel");
        mesh.send(Signal::ChannelJoin {
            user_id: mesh.relay.local_id().clone(),
            channel_id: mesh.channel_id.clone(),
        });
        Ok(mesh)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Feed a relay signal. Returns `false` for signals about other channels
    /// or about calls.
    pub fn handle_signal(&mut self, signal: Signal, now: Instant) -> bool {
        let signal = if self.is_channel_negotiation(&signal) {
            match self.early.enqueue(signal) {
                Some(signal) => signal,
                None => {
                    tracing::debug!(channel = %self.channel_id, held = self.early.pending(), "Holding negotiation until the member list arrives");
                    return true;
                }
            }
        } else {
            signal
        };

        match signal {
            Signal::ChannelMembers {
                channel_id,
                members,
            } if channel_id == self.channel_id => {
                self.reconcile(members, now);
                true
            }

            Signal::MemberJoined {
                channel_id,
                user_id,
            } if channel_id == self.channel_id => {
                if user_id != *self.relay.local_id() {
                    tracing::info!(channel = %self.channel_id, user = %user_id, "Member joined");
                    self.drop_link(&user_id);
                    self.open_link(user_id.clone(), now);
                    let _ = self.events.send(MeshEvent::ParticipantJoined(user_id));
                }
                true
            }

            Signal::MemberLeft {
                channel_id,
                user_id,
            } if channel_id == self.channel_id => {
                tracing::info!(channel = %self.channel_id, user = %user_id, "Member left");
                self.drop_link(&user_id);
                if self.participants.remove(&user_id).is_some() {
                    let _ = self.events.send(MeshEvent::ParticipantLeft(user_id));
                }
                true
            }

            Signal::NegoOffer {
                from_id,
                scope: Scope::Channel(channel_id),
                revision,
                sdp,
                ..
            } if channel_id == self.channel_id => {
                if let Some(link) = self.link_for(&from_id, now) {
                    link.handle_offer(revision, &sdp, now);
                }
                self.drain(&from_id);
                true
            }

            Signal::NegoAnswer {
                from_id,
                scope: Scope::Channel(channel_id),
                revision,
                sdp,
                ..
            } if channel_id == self.channel_id => {
                if let Some(link) = self.links.get_mut(&from_id) {
                    link.handle_answer(revision, &sdp, now);
                }
                self.drain(&from_id);
                true
            }

            Signal::NegoCandidate {
                from_id,
                scope: Scope::Channel(channel_id),
                candidate,
                ..
            } if channel_id == self.channel_id => {
                if let Some(link) = self.link_for(&from_id, now) {
                    link.handle_candidate(candidate);
                }
                true
            }

            Signal::VoiceState {
                from_id,
                scope: Scope::Channel(channel_id),
                flags,
                ..
            } if channel_id == self.channel_id => {
                if let Some(participant) = self.participants.get_mut(&from_id) {
                    participant.flags = flags;
                    let _ = self.events.send(MeshEvent::PeerState {
                        user_id: from_id,
                        flags,
                    });
                }
                true
            }

            _ => false,
        }
    }

    /// Drive every link and surface what changed.
    pub fn poll(&mut self, now: Instant) {
        let remotes: Vec<UserId> = self.links.keys().cloned().collect();
        for remote in remotes {
            if let Some(link) = self.links.get_mut(&remote) {
                link.poll(now);
            }
            self.drain(&remote);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.links.values().filter_map(|l| l.next_deadline()).min()
    }

    /// Broadcast local flags to the channel once. Returns `false` when nothing
    /// changed.
    pub fn set_flags(&mut self, flags: VoiceFlags) -> bool {
        if self.flags == flags {
            return false;
        }
        self.flags = flags;
        self.announce();
        true
    }

    /// Send a track on every link, now and to members joining later.
    pub fn add_track(&mut self, track: TrackHandle, now: Instant) {
        for link in self.links.values_mut() {
            if let Err(e) = link.add_track(track.clone(), now) {
                tracing::warn!(channel = %self.channel_id, remote = %link.remote(), error = %e, "Failed to add track");
            }
        }
        self.tracks.push(track);
    }

    /// Flags to announce once the member list arrives.
    pub fn preset_flags(&mut self, flags: VoiceFlags) {
        self.flags = flags;
    }

    /// Record that `old` was swapped for `new` on the links. If the mesh
    /// owned `old` it now owns `new`.
    pub fn retarget(&mut self, old: TrackId, new: &TrackHandle) {
        for track in self.tracks.iter_mut().filter(|t| t.id == old) {
            *track = new.clone();
        }
        for id in self.owned.iter_mut().filter(|id| **id == old) {
            *id = new.id;
        }
    }

    /// Stop sending `id` to members joining later.
    pub fn forget_track(&mut self, id: TrackId) {
        self.tracks.retain(|t| t.id != id);
        self.owned.retain(|t| *t != id);
    }

    /// After a relay reconnect start over and ask for the current member
    /// list. The relay announces the join again, so every member rebuilds its
    /// side of the link whether or not it saw us leave.
    pub fn reannounce(&mut self) {
        let remotes: Vec<UserId> = self.links.keys().cloned().collect();
        for remote in &remotes {
            self.drop_link(remote);
        }
        self.participants.clear();
        self.joined = false;
        self.early.reset();
        self.early.clear();
        tracing::info!(channel = %self.channel_id, closed = remotes.len(), "Re-announcing channel membership");
        self.send(Signal::ChannelJoin {
            user_id: self.relay.local_id().clone(),
            channel_id: self.channel_id.clone(),
        });
    }

    /// Close every link, release the mesh's tracks, and tell the relay.
    pub fn leave(&mut self, media: &mut MediaSourceManager, now: Instant) {
        let remotes: Vec<UserId> = self.links.keys().cloned().collect();
        for remote in &remotes {
            self.drop_link(remote);
        }
        self.participants.clear();
        for id in self.owned.drain(..) {
            media.release(id, &mut [], now);
        }
        self.tracks.clear();
        self.joined = false;
        self.early.reset();
        self.early.clear();

        self.send(Signal::ChannelLeave {
            user_id: self.relay.local_id().clone(),
            channel_id: self.channel_id.clone(),
        });
        tracing::info!(channel = %self.channel_id, "Left voice channel");
        let _ = self.events.send(MeshEvent::Left(self.channel_id.clone()));
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn flags(&self) -> VoiceFlags {
        self.flags
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn link(&self, remote: &UserId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut PeerLink> {
        self.links.values_mut()
    }

    pub fn tracks(&self) -> &[TrackHandle] {
        &self.tracks
    }

    pub fn links_created(&self) -> usize {
        self.links_created
    }

    pub fn links_closed(&self) -> usize {
        self.links_closed
    }

    /// Bring links in line with the relay's member list: one link per present
    /// member, none for anyone else.
    fn reconcile(&mut self, members: Vec<UserId>, now: Instant) {
        let local = self.relay.local_id().clone();
        let present: BTreeSet<UserId> = members.into_iter().filter(|m| *m != local).collect();

        let stale: Vec<UserId> = self
            .links
            .keys()
            .filter(|remote| !present.contains(*remote))
            .cloned()
            .collect();
        for remote in &stale {
            self.drop_link(remote);
            self.participants.remove(remote);
        }

        for member in &present {
            if !self.links.contains_key(member) {
                self.open_link(member.clone(), now);
            }
        }

        self.joined = true;
        tracing::info!(channel = %self.channel_id, members = present.len(), "Joined voice channel");
        let _ = self.events.send(MeshEvent::Joined {
            channel_id: self.channel_id.clone(),
            members: present.into_iter().collect(),
        });
        if self.flags != VoiceFlags::default() {
            self.announce();
        }

        let held: Vec<Signal> = self.early.mark_ready().collect();
        if !held.is_empty() {
            tracing::debug!(channel = %self.channel_id, count = held.len(), "Replaying early negotiation");
        }
        for signal in held {
            self.handle_signal(signal, now);
        }
    }

    fn is_channel_negotiation(&self, signal: &Signal) -> bool {
        match signal {
            Signal::NegoOffer {
                scope: Scope::Channel(channel_id),
                ..
            }
            | Signal::NegoCandidate {
                scope: Scope::Channel(channel_id),
                ..
            } => *channel_id == self.channel_id,
            _ => false,
        }
    }

    /// Link for an incoming negotiation message, created on demand if the
    /// member's join notice has not been seen yet.
    fn link_for(&mut self, remote: &UserId, now: Instant) -> Option<&mut PeerLink> {
        if !self.links.contains_key(remote) {
            if !self.joined || remote == self.relay.local_id() {
                return None;
            }
            self.open_link(remote.clone(), now);
        }
        self.links.get_mut(remote)
    }

    fn open_link(&mut self, remote: UserId, now: Instant) {
        let engine = match self.engines.create(&remote) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!(channel = %self.channel_id, remote = %remote, error = %e, "Could not create engine");
                return;
            }
        };
        let role = Role::for_pair(self.relay.local_id(), &remote);
        let mut link = PeerLink::new(
            remote.clone(),
            Scope::Channel(self.channel_id.clone()),
            role,
            engine,
            self.relay.clone(),
            self.timers,
        );
        link.connect(self.tracks.clone(), now);
        tracing::debug!(channel = %self.channel_id, remote = %remote, role = ?role, "Mesh link opened");

        self.links_created += 1;
        self.links.insert(remote.clone(), link);
        self.participants
            .entry(remote.clone())
            .or_insert_with(|| Participant {
                user_id: remote.clone(),
                flags: VoiceFlags::default(),
                connected: false,
            })
            .connected = false;
        self.drain(&remote);
    }

    fn drop_link(&mut self, remote: &UserId) {
        if let Some(mut link) = self.links.remove(remote) {
            link.close();
            self.links_closed += 1;
        }
    }

    fn drain(&mut self, remote: &UserId) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        for event in link.take_events() {
            match event {
                LinkEvent::StateChanged(state) => {
                    if let Some(p) = self.participants.get_mut(remote) {
                        p.connected = state == LinkState::Connected;
                    }
                    let _ = self.events.send(MeshEvent::LinkState {
                        user_id: remote.clone(),
                        state,
                    });
                }
                LinkEvent::RemoteTrack(track) => {
                    let _ = self.events.send(MeshEvent::RemoteTrack {
                        user_id: remote.clone(),
                        mid: track.mid,
                        kind: track.kind,
                    });
                }
                LinkEvent::RenegotiationFailed(reason) => {
                    let _ = self.events.send(MeshEvent::RenegotiationFailed {
                        user_id: remote.clone(),
                        reason,
                    });
                }
                LinkEvent::Failed(failure) => {
                    tracing::warn!(channel = %self.channel_id, remote = %remote, failure = ?failure, "Mesh link failed");
                    let _ = self
                        .events
                        .send(MeshEvent::ParticipantDisconnected(remote.clone()));
                }
            }
        }
    }

    fn announce(&self) {
        self.send(Signal::VoiceState {
            from_id: self.relay.local_id().clone(),
            scope: Scope::Channel(self.channel_id.clone()),
            to_id: None,
            flags: self.flags,
        });
    }

    fn send(&self, signal: Signal) {
        if let Err(e) = self.relay.send(signal) {
            tracing::warn!(channel = %self.channel_id, error = %e, "Failed to queue signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackFactory;
    use crate::media::VirtualDevices;
    use tokio::sync::mpsc;

    fn mesh(user: &str) -> (ChannelMesh, MediaSourceManager, mpsc::UnboundedReceiver<Signal>) {
        let (relay, out) = RelayHandle::channel(user.into());
        let mut media = MediaSourceManager::new(Box::new(VirtualDevices::new()));
        let mesh = ChannelMesh::join(
            "lobby".into(),
            relay,
            Arc::new(LoopbackFactory::new(user)),
            &VoiceConfig::default(),
            &mut media,
        )
        .unwrap();
        (mesh, media, out)
    }

    fn drain(out: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(s) = out.try_recv() {
            signals.push(s);
        }
        signals
    }

    fn members(list: &[&str]) -> Signal {
        Signal::ChannelMembers {
            channel_id: "lobby".into(),
            members: list.iter().map(|m| UserId::from(*m)).collect(),
        }
    }

    #[test]
    fn test_join_announces_and_needs_a_microphone() {
        let (_mesh, media, mut out) = mesh("alice");
        assert!(matches!(drain(&mut out).as_slice(), [Signal::ChannelJoin { .. }]));
        assert_eq!(media.tracks().len(), 1);

        let (relay, mut out) = RelayHandle::channel("bob".into());
        let mut media = MediaSourceManager::new(Box::new(VirtualDevices::new().without(MediaKind::Audio)));
        let result = ChannelMesh::join(
            "lobby".into(),
            relay,
            Arc::new(LoopbackFactory::new("bob")),
            &VoiceConfig::default(),
            &mut media,
        );
        assert!(result.is_err());
        assert!(drain(&mut out).is_empty());
    }

    #[test]
    fn test_roles_follow_id_order() {
        let now = Instant::now();
        let (mut bob, _media, mut out) = mesh("bob");
        drain(&mut out);

        bob.handle_signal(members(&["alice", "carol"]), now);

        assert_eq!(bob.link_count(), 2);
        assert_eq!(bob.link(&"alice".into()).unwrap().role(), Role::Responder);
        assert_eq!(bob.link(&"carol".into()).unwrap().role(), Role::Initiator);
        // Only the initiator side offers
        let offers: Vec<UserId> = drain(&mut out)
            .into_iter()
            .filter_map(|s| match s {
                Signal::NegoOffer { to_id, .. } => Some(to_id),
                _ => None,
            })
            .collect();
        assert_eq!(offers, vec![UserId::from("carol")]);
    }

    #[test]
    fn test_reconcile_drops_absent_members() {
        let now = Instant::now();
        let (mut alice, _media, _out) = mesh("alice");
        alice.handle_signal(members(&["bob", "carol"]), now);

        alice.handle_signal(members(&["carol", "alice"]), now);

        assert_eq!(alice.link_count(), 1);
        assert!(alice.link(&"carol".into()).is_some());
        assert_eq!(alice.links_created(), 2);
        assert_eq!(alice.links_closed(), 1);
    }

    #[test]
    fn test_flags_broadcast_once_without_renegotiation() {
        let now = Instant::now();
        let (mut alice, _media, mut out) = mesh("alice");
        alice.handle_signal(members(&["bob"]), now);
        drain(&mut out);

        let muted = VoiceFlags {
            self_mute: true,
            ..Default::default()
        };
        assert!(alice.set_flags(muted));
        assert!(!alice.set_flags(muted));

        let sent = drain(&mut out);
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Signal::VoiceState { to_id: None, scope: Scope::Channel(_), flags, .. } if flags.self_mute
        ));
    }

    #[test]
    fn test_peer_state_updates_participant() {
        let now = Instant::now();
        let (mut alice, _media, _out) = mesh("alice");
        alice.handle_signal(members(&["bob"]), now);
        let mut events = alice.subscribe();

        alice.handle_signal(
            Signal::VoiceState {
                from_id: "bob".into(),
                scope: Scope::Channel("lobby".into()),
                to_id: None,
                flags: VoiceFlags {
                    speaking: true,
                    ..Default::default()
                },
            },
            now,
        );

        assert!(alice.participants()[0].flags.speaking);
        assert!(matches!(events.try_recv(), Ok(MeshEvent::PeerState { .. })));
    }

    #[test]
    fn test_other_channels_are_ignored() {
        let now = Instant::now();
        let (mut alice, _media, _out) = mesh("alice");
        let handled = alice.handle_signal(
            Signal::MemberJoined {
                channel_id: "elsewhere".into(),
                user_id: "bob".into(),
            },
            now,
        );
        assert!(!handled);
        assert_eq!(alice.link_count(), 0);
    }

    #[test]
    fn test_leave_closes_links_and_releases_microphone() {
        let now = Instant::now();
        let (mut alice, mut media, mut out) = mesh("alice");
        alice.handle_signal(members(&["bob", "carol"]), now);
        drain(&mut out);

        alice.leave(&mut media, now);

        assert_eq!(alice.link_count(), 0);
        assert_eq!(alice.links_closed(), 2);
        assert!(media.tracks().is_empty());
        assert!(matches!(drain(&mut out).as_slice(), [Signal::ChannelLeave { .. }]));
    }

    #[test]
    fn test_reannounce_rebuilds_links() {
        let now = Instant::now();
        let (mut alice, _media, mut out) = mesh("alice");
        alice.handle_signal(members(&["bob"]), now);
        drain(&mut out);

        alice.reannounce();
        assert_eq!(alice.link_count(), 0);
        assert!(matches!(drain(&mut out).as_slice(), [Signal::ChannelJoin { .. }]));

        alice.handle_signal(members(&["bob"]), now);
        assert_eq!(alice.link_count(), 1);
        assert_eq!(alice.links_created(), 2);
    }

    #[test]
    fn test_offer_before_member_list_is_held_then_answered() {
        let now = Instant::now();
        let (mut alice, _alice_media, mut alice_out) = mesh("alice");
        let (mut bob, _bob_media, mut bob_out) = mesh("bob");
        drain(&mut bob_out);
        alice.handle_signal(members(&["bob"]), now);
        let early: Vec<Signal> = drain(&mut alice_out)
            .into_iter()
            .filter(|s| matches!(s, Signal::NegoOffer { .. } | Signal::NegoCandidate { .. }))
            .collect();
        assert!(early.iter().any(|s| matches!(s, Signal::NegoOffer { .. })));

        for signal in early {
            assert!(bob.handle_signal(signal, now));
        }
        assert_eq!(bob.link_count(), 0);
        assert!(drain(&mut bob_out).is_empty());

        bob.handle_signal(members(&["alice"]), now);

        assert_eq!(bob.link_count(), 1);
        assert_eq!(bob.links_created(), 1);
        let answers: Vec<UserId> = drain(&mut bob_out)
            .into_iter()
            .filter_map(|s| match s {
                Signal::NegoAnswer { to_id, .. } => Some(to_id),
                _ => None,
            })
            .collect();
        assert_eq!(answers, vec![UserId::from("alice")]);
    }
}
