//! One-to-one call lifecycle.
//!
//! ```text
//!   caller:  idle ──▶ inviting ──▶ accepted ──▶ connected ──▶ ended
//!   callee:  idle ──▶ ringing  ──▶ accepted ──▶ connected ──▶ ended
//!                        │
//!                        └──▶ rejected | timed_out | failed
//! ```
//!
//! The caller becomes the initiator of the call's peer link once the callee
//! accepts; the callee creates its link as responder at accept time and waits
//! for the offer. At most one non-terminal session exists per counterpart.

use crate::engine::EngineFactory;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{Constraints, MediaKind, MediaSourceManager, TrackHandle};
use crate::peer::{LinkEvent, LinkState, LinkTimers, PeerLink, Role};
use crate::relay_client::RelayHandle;
use chrono::{DateTime, Utc};
use huddle_common::config::VoiceConfig;
use huddle_common::{CallId, CallType, Scope, Signal, SignalKind, TrackId, UserId, VoiceFlags};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Finished calls kept for inspection.
const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Inviting,
    Ringing,
    Accepted,
    Connected,
    Ended,
    Rejected,
    TimedOut,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended | CallState::Rejected | CallState::TimedOut | CallState::Failed
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallState::Idle => "idle",
            CallState::Inviting => "inviting",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Rejected => "rejected",
            CallState::TimedOut => "timed_out",
            CallState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call reached its terminal state, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    HungUp,
    RemoteHungUp,
    /// Caller gave up before an answer
    Cancelled,
    /// We declined
    Declined,
    /// The remote side declined
    Rejected,
    TimedOut,
    /// The callee had no live connection
    Unreachable,
    NoDevice,
    ConnectionFailed,
    /// Lost an invite collision; the remote side's call replaces ours
    Superseded,
    /// Another device of the same user took the call
    AnsweredElsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub peer_id: UserId,
    pub role: CallRole,
    pub call_type: CallType,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming(CallInfo),
    StateChanged {
        call_id: CallId,
        state: CallState,
        reason: Option<EndReason>,
    },
    RemoteTrack {
        call_id: CallId,
        mid: String,
        kind: MediaKind,
    },
    PeerState {
        call_id: CallId,
        peer_id: UserId,
        flags: VoiceFlags,
    },
    RenegotiationFailed {
        call_id: CallId,
        reason: String,
    },
}

struct CallSession {
    info: CallInfo,
    link: Option<PeerLink>,
    ring_deadline: Option<Instant>,
    /// Tracks acquired for this call and released with it
    tracks: Vec<TrackHandle>,
}

impl CallSession {
    fn new(call_id: CallId, peer_id: UserId, role: CallRole, call_type: CallType) -> Self {
        Self {
            info: CallInfo {
                call_id,
                peer_id,
                role,
                call_type,
                state: CallState::Idle,
                created_at: Utc::now(),
                end_reason: None,
            },
            link: None,
            ring_deadline: None,
            tracks: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        !self.info.state.is_terminal()
    }
}

/// Owns every call of the local user.
pub struct CallManager {
    relay: RelayHandle,
    engines: Arc<dyn EngineFactory>,
    timers: LinkTimers,
    ring_timeout: Duration,
    sessions: HashMap<CallId, CallSession>,
    finished: VecDeque<CallInfo>,
    events: broadcast::Sender<CallEvent>,
    links_created: usize,
    links_closed: usize,
}

impl CallManager {
    pub fn new(relay: RelayHandle, engines: Arc<dyn EngineFactory>, config: &VoiceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            relay,
            engines,
            timers: LinkTimers::from(config),
            ring_timeout: config.ring_timeout(),
            sessions: HashMap::new(),
            finished: VecDeque::new(),
            events,
            links_created: 0,
            links_closed: 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Start a call. Refused locally, with nothing sent, while a call with
    /// `to` is still active or when a required device is missing.
    pub fn invite(
        &mut self,
        to: &UserId,
        call_type: CallType,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> VoiceResult<CallId> {
        if to == self.relay.local_id() {
            return Err(VoiceError::InvalidState("cannot call yourself".into()));
        }
        if let Some(existing) = self.active_with(to) {
            return Err(VoiceError::InvalidState(format!(
                "call {existing} with {to} is still active"
            )));
        }

        let tracks = acquire_for(call_type, media, now)?;
        let call_id = CallId::new();
        let invite = Signal::CallInvite {
            from_id: self.relay.local_id().clone(),
            to_id: to.clone(),
            call_id,
            call_type,
        };
        if let Err(e) = self.relay.send(invite) {
            release_all(&tracks, media, now);
            return Err(e);
        }

        let mut session = CallSession::new(call_id, to.clone(), CallRole::Caller, call_type);
        session.tracks = tracks;
        session.ring_deadline = Some(now + self.ring_timeout);
        tracing::info!(call = %call_id, peer = %to, call_type = ?call_type, "Outgoing call");
        self.transition(&mut session, CallState::Inviting);
        self.store(session);
        Ok(call_id)
    }

    /// Answer a ringing call. A missing device turns into a reject so the
    /// caller is not left waiting.
    pub fn accept(
        &mut self,
        call_id: CallId,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> VoiceResult<()> {
        let mut session = self.take_active(call_id)?;
        if session.info.state != CallState::Ringing {
            let state = session.info.state;
            self.store(session);
            return Err(VoiceError::InvalidState(format!(
                "call {call_id} is {state}, not ringing"
            )));
        }

        let tracks = match acquire_for(session.info.call_type, media, now) {
            Ok(tracks) => tracks,
            Err(e) => {
                self.send_control(&session, SignalKind::CallReject);
                self.finish(&mut session, CallState::Failed, EndReason::NoDevice, media, now);
                self.store(session);
                return Err(e);
            }
        };
        session.tracks = tracks;

        if let Err(e) = self.open_link(&mut session, Role::Responder, now) {
            self.send_control(&session, SignalKind::CallReject);
            self.finish(&mut session, CallState::Failed, EndReason::ConnectionFailed, media, now);
            self.store(session);
            return Err(e);
        }

        self.send_control(&session, SignalKind::CallAccept);
        session.ring_deadline = None;
        self.transition(&mut session, CallState::Accepted);
        self.store(session);
        Ok(())
    }

    pub fn reject(
        &mut self,
        call_id: CallId,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> VoiceResult<()> {
        let mut session = self.take_active(call_id)?;
        if session.info.state != CallState::Ringing {
            let state = session.info.state;
            self.store(session);
            return Err(VoiceError::InvalidState(format!(
                "call {call_id} is {state}, not ringing"
            )));
        }

        self.send_control(&session, SignalKind::CallReject);
        self.finish(&mut session, CallState::Rejected, EndReason::Declined, media, now);
        self.store(session);
        Ok(())
    }

    /// Hang up. While still inviting this cancels the call; while ringing it
    /// declines it.
    pub fn end(
        &mut self,
        call_id: CallId,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> VoiceResult<()> {
        let mut session = self.take_active(call_id)?;
        match session.info.state {
            CallState::Ringing => {
                self.send_control(&session, SignalKind::CallReject);
                self.finish(&mut session, CallState::Rejected, EndReason::Declined, media, now);
            }
            CallState::Inviting => {
                self.send_control(&session, SignalKind::CallEnd);
                self.finish(&mut session, CallState::Ended, EndReason::Cancelled, media, now);
            }
            _ => {
                self.send_control(&session, SignalKind::CallEnd);
                self.finish(&mut session, CallState::Ended, EndReason::HungUp, media, now);
            }
        }
        self.store(session);
        Ok(())
    }

    /// Feed a relay signal. Returns `false` for signals that are not about
    /// calls.
    pub fn handle_signal(
        &mut self,
        signal: Signal,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> bool {
        match signal {
            Signal::CallInvite {
                from_id,
                call_id,
                call_type,
                ..
            } => self.on_invite(from_id, call_id, call_type, media, now),

            Signal::CallAccept {
                from_id, call_id, ..
            } => self.on_accept(&from_id, call_id, media, now),

            Signal::CallReject {
                from_id, call_id, ..
            } => self.on_remote_control(&from_id, call_id, SignalKind::CallReject, media, now),

            Signal::CallEnd {
                from_id, call_id, ..
            } => self.on_remote_control(&from_id, call_id, SignalKind::CallEnd, media, now),

            Signal::NegoOffer {
                from_id,
                scope: Scope::Call(call_id),
                revision,
                sdp,
                ..
            } => self.with_link(call_id, &from_id, media, now, |link| {
                link.handle_offer(revision, &sdp, now)
            }),

            Signal::NegoAnswer {
                from_id,
                scope: Scope::Call(call_id),
                revision,
                sdp,
                ..
            } => self.with_link(call_id, &from_id, media, now, |link| {
                link.handle_answer(revision, &sdp, now)
            }),

            Signal::NegoCandidate {
                from_id,
                scope: Scope::Call(call_id),
                candidate,
                ..
            } => self.with_link(call_id, &from_id, media, now, |link| {
                link.handle_candidate(candidate)
            }),

            Signal::VoiceState {
                from_id,
                scope: Scope::Call(call_id),
                flags,
                ..
            } => {
                if self
                    .sessions
                    .get(&call_id)
                    .is_some_and(|s| s.info.peer_id == from_id)
                {
                    let _ = self.events.send(CallEvent::PeerState {
                        call_id,
                        peer_id: from_id,
                        flags,
                    });
                }
                true
            }

            Signal::DeliveryFailed {
                to_id,
                call_id: Some(call_id),
                kind,
            } => {
                self.on_delivery_failed(&to_id, call_id, kind, media, now);
                true
            }

            _ => false,
        }
    }

    /// Drive every call's link and fire ring timeouts.
    pub fn poll(&mut self, media: &mut MediaSourceManager, now: Instant) {
        let ids: Vec<CallId> = self.sessions.keys().copied().collect();
        for call_id in ids {
            let Some(mut session) = self.sessions.remove(&call_id) else {
                continue;
            };

            if let Some(link) = session.link.as_mut() {
                link.poll(now);
            }
            self.drain_link(&mut session, media, now);

            if session.is_active() && session.ring_deadline.is_some_and(|at| now >= at) {
                tracing::info!(call = %call_id, peer = %session.info.peer_id, "Ring timeout");
                match session.info.role {
                    CallRole::Caller => self.send_control(&session, SignalKind::CallEnd),
                    CallRole::Callee => self.send_control(&session, SignalKind::CallReject),
                }
                self.finish(&mut session, CallState::TimedOut, EndReason::TimedOut, media, now);
            }

            self.store(session);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .flat_map(|s| [s.ring_deadline, s.link.as_ref().and_then(|l| l.next_deadline())])
            .flatten()
            .min()
    }

    /// Announce local flags to every accepted call.
    pub fn set_flags(&self, flags: VoiceFlags) {
        for session in self.sessions.values().filter(|s| {
            matches!(s.info.state, CallState::Accepted | CallState::Connected)
        }) {
            let signal = Signal::VoiceState {
                from_id: self.relay.local_id().clone(),
                scope: Scope::Call(session.info.call_id),
                to_id: Some(session.info.peer_id.clone()),
                flags,
            };
            if let Err(e) = self.relay.send(signal) {
                tracing::warn!(call = %session.info.call_id, error = %e, "Failed to send voice state");
            }
        }
    }

    /// Add a shared track to every call that has a link.
    pub fn add_track(&mut self, track: &TrackHandle, now: Instant) {
        for link in self.links_mut() {
            if let Err(e) = link.add_track(track.clone(), now) {
                tracing::warn!(remote = %link.remote(), error = %e, "Failed to add track");
            }
        }
    }

    /// Record that `old` was swapped for `new` on the links; a call that
    /// owned `old` now owns `new`.
    pub fn retarget(&mut self, old: TrackId, new: &TrackHandle) {
        for session in self.sessions.values_mut() {
            for track in session.tracks.iter_mut().filter(|t| t.id == old) {
                *track = new.clone();
            }
        }
    }

    /// End every active call.
    pub fn end_all(&mut self, media: &mut MediaSourceManager, now: Instant) {
        let ids: Vec<CallId> = self.sessions.keys().copied().collect();
        for call_id in ids {
            let _ = self.end(call_id, media, now);
        }
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut PeerLink> {
        self.sessions.values_mut().filter_map(|s| s.link.as_mut())
    }

    pub fn session(&self, call_id: CallId) -> Option<CallInfo> {
        self.sessions
            .get(&call_id)
            .map(|s| s.info.clone())
            .or_else(|| self.finished.iter().find(|i| i.call_id == call_id).cloned())
    }

    pub fn active(&self) -> Vec<CallInfo> {
        self.sessions.values().map(|s| s.info.clone()).collect()
    }

    pub fn active_with(&self, peer: &UserId) -> Option<CallId> {
        self.sessions
            .values()
            .find(|s| &s.info.peer_id == peer)
            .map(|s| s.info.call_id)
    }

    pub fn link_state(&self, call_id: CallId) -> Option<LinkState> {
        self.sessions
            .get(&call_id)
            .and_then(|s| s.link.as_ref())
            .map(|l| l.state())
    }

    pub fn links_created(&self) -> usize {
        self.links_created
    }

    pub fn links_closed(&self) -> usize {
        self.links_closed
    }

    fn on_invite(
        &mut self,
        from: UserId,
        call_id: CallId,
        call_type: CallType,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> bool {
        if self.sessions.contains_key(&call_id) {
            return true;
        }

        if let Some(existing) = self.active_with(&from) {
            let ours_outgoing = self.sessions.get(&existing).is_some_and(|s| {
                s.info.state == CallState::Inviting && s.info.role == CallRole::Caller
            });
            let we_win = huddle_common::ids::is_initiator(self.relay.local_id(), &from);

            if ours_outgoing && we_win {
                tracing::debug!(call = %call_id, peer = %from, "Invite collision, keeping ours");
                return true;
            }
            if ours_outgoing {
                tracing::debug!(call = %existing, peer = %from, "Invite collision, yielding");
                if let Some(mut ours) = self.sessions.remove(&existing) {
                    self.finish(&mut ours, CallState::Ended, EndReason::Superseded, media, now);
                    self.store(ours);
                }
            } else {
                tracing::info!(call = %call_id, peer = %from, "Busy, rejecting invite");
                let reject = Signal::CallReject {
                    from_id: self.relay.local_id().clone(),
                    to_id: from,
                    call_id,
                };
                if let Err(e) = self.relay.send(reject) {
                    tracing::warn!(call = %call_id, error = %e, "Failed to send reject");
                }
                return true;
            }
        }

        let mut session = CallSession::new(call_id, from.clone(), CallRole::Callee, call_type);
        session.ring_deadline = Some(now + self.ring_timeout);
        tracing::info!(call = %call_id, peer = %from, call_type = ?call_type, "Incoming call");
        session.info.state = CallState::Ringing;
        let _ = self.events.send(CallEvent::Incoming(session.info.clone()));
        self.store(session);
        true
    }

    fn on_accept(
        &mut self,
        from: &UserId,
        call_id: CallId,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> bool {
        let Some(mut session) = self.take_from(call_id, from) else {
            return true;
        };
        if session.info.state != CallState::Inviting {
            self.store(session);
            return true;
        }

        session.ring_deadline = None;
        self.transition(&mut session, CallState::Accepted);
        match self.open_link(&mut session, Role::Initiator, now) {
            Ok(()) => self.drain_link(&mut session, media, now),
            Err(e) => {
                tracing::warn!(call = %call_id, error = %e, "Could not open peer link");
                self.send_control(&session, SignalKind::CallEnd);
                self.finish(&mut session, CallState::Failed, EndReason::ConnectionFailed, media, now);
            }
        }
        self.store(session);
        true
    }

    fn on_remote_control(
        &mut self,
        from: &UserId,
        call_id: CallId,
        kind: SignalKind,
        media: &mut MediaSourceManager,
        now: Instant,
    ) -> bool {
        let Some(mut session) = self.take_from(call_id, from) else {
            return true;
        };

        let (state, reason) = match (kind, session.info.state) {
            (SignalKind::CallReject, CallState::Inviting) => (CallState::Rejected, EndReason::Rejected),
            (_, CallState::Ringing) => (CallState::Ended, EndReason::Cancelled),
            // Another device of the callee declining or timing out after one
            // of its siblings already answered
            (SignalKind::CallReject, state) => {
                tracing::debug!(call = %call_id, peer = %from, state = %state, "Ignoring late reject");
                self.store(session);
                return true;
            }
            _ => (CallState::Ended, EndReason::RemoteHungUp),
        };
        tracing::info!(call = %call_id, peer = %from, kind = %kind, "Remote ended call");
        self.finish(&mut session, state, reason, media, now);
        self.store(session);
        true
    }

    fn on_delivery_failed(
        &mut self,
        to: &UserId,
        call_id: CallId,
        kind: SignalKind,
        media: &mut MediaSourceManager,
        now: Instant,
    ) {
        let Some(mut session) = self.take_from(call_id, to) else {
            return;
        };
        tracing::info!(call = %call_id, peer = %to, kind = %kind, "Call signal undeliverable");
        if session.info.state == CallState::Inviting {
            self.finish(&mut session, CallState::TimedOut, EndReason::Unreachable, media, now);
        } else {
            self.finish(&mut session, CallState::Failed, EndReason::ConnectionFailed, media, now);
        }
        self.store(session);
    }

    fn with_link(
        &mut self,
        call_id: CallId,
        from: &UserId,
        media: &mut MediaSourceManager,
        now: Instant,
        f: impl FnOnce(&mut PeerLink),
    ) -> bool {
        let Some(mut session) = self.take_from(call_id, from) else {
            tracing::debug!(call = %call_id, peer = %from, "Negotiation for unknown call");
            return true;
        };
        if session.info.state == CallState::Ringing && session.link.is_none() {
            // The caller only negotiates after an accept, so another device
            // of ours picked up
            tracing::info!(call = %call_id, peer = %from, "Call answered on another device");
            self.finish(&mut session, CallState::Ended, EndReason::AnsweredElsewhere, media, now);
            self.store(session);
            return true;
        }
        if let Some(link) = session.link.as_mut() {
            f(link);
        }
        self.drain_link(&mut session, media, now);
        self.store(session);
        true
    }

    /// Translate link events into call state.
    fn drain_link(&mut self, session: &mut CallSession, media: &mut MediaSourceManager, now: Instant) {
        let Some(link) = session.link.as_mut() else {
            return;
        };
        let call_id = session.info.call_id;

        for event in link.take_events() {
            match event {
                LinkEvent::StateChanged(LinkState::Connected)
                    if session.info.state == CallState::Accepted =>
                {
                    self.transition(session, CallState::Connected);
                }
                LinkEvent::StateChanged(_) => {}
                LinkEvent::RemoteTrack(track) => {
                    let _ = self.events.send(CallEvent::RemoteTrack {
                        call_id,
                        mid: track.mid,
                        kind: track.kind,
                    });
                }
                LinkEvent::RenegotiationFailed(reason) => {
                    let _ = self.events.send(CallEvent::RenegotiationFailed { call_id, reason });
                }
                LinkEvent::Failed(failure) => {
                    let error = failure.into_error(&session.info.peer_id);
                    tracing::warn!(call = %call_id, error = %error, "Call link failed");
                    self.send_control(session, SignalKind::CallEnd);
                    self.finish(session, CallState::Failed, EndReason::ConnectionFailed, media, now);
                    return;
                }
            }
        }
    }

    fn open_link(&mut self, session: &mut CallSession, role: Role, now: Instant) -> VoiceResult<()> {
        let engine = self.engines.create(&session.info.peer_id)?;
        let mut link = PeerLink::new(
            session.info.peer_id.clone(),
            Scope::Call(session.info.call_id),
            role,
            engine,
            self.relay.clone(),
            self.timers,
        );
        self.links_created += 1;
        link.connect(session.tracks.clone(), now);
        session.link = Some(link);
        Ok(())
    }

    /// Terminal transition: close the link and release the call's tracks.
    fn finish(
        &mut self,
        session: &mut CallSession,
        state: CallState,
        reason: EndReason,
        media: &mut MediaSourceManager,
        now: Instant,
    ) {
        if let Some(mut link) = session.link.take() {
            link.close();
            self.links_closed += 1;
        }
        release_all(&session.tracks, media, now);
        session.tracks.clear();
        session.ring_deadline = None;
        session.info.end_reason = Some(reason);
        self.transition(session, state);
    }

    fn transition(&self, session: &mut CallSession, state: CallState) {
        if session.info.state == state {
            return;
        }
        tracing::info!(
            call = %session.info.call_id,
            peer = %session.info.peer_id,
            from = %session.info.state,
            to = %state,
            reason = ?session.info.end_reason,
            "Call state"
        );
        session.info.state = state;
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: session.info.call_id,
            state,
            reason: session.info.end_reason,
        });
    }

    fn send_control(&self, session: &CallSession, kind: SignalKind) {
        let from_id = self.relay.local_id().clone();
        let to_id = session.info.peer_id.clone();
        let call_id = session.info.call_id;
        let signal = match kind {
            SignalKind::CallAccept => Signal::CallAccept { from_id, to_id, call_id },
            SignalKind::CallReject => Signal::CallReject { from_id, to_id, call_id },
            _ => Signal::CallEnd { from_id, to_id, call_id },
        };
        if let Err(e) = self.relay.send(signal) {
            tracing::warn!(call = %call_id, kind = %kind, error = %e, "Failed to send call control");
        }
    }

    fn take_active(&mut self, call_id: CallId) -> VoiceResult<CallSession> {
        self.sessions
            .remove(&call_id)
            .ok_or_else(|| VoiceError::InvalidState(format!("no active call {call_id}")))
    }

    /// Remove the active session for `call_id` if `peer` is its counterpart.
    fn take_from(&mut self, call_id: CallId, peer: &UserId) -> Option<CallSession> {
        if self.sessions.get(&call_id)?.info.peer_id != *peer {
            tracing::warn!(call = %call_id, peer = %peer, "Call signal from a non-participant");
            return None;
        }
        self.sessions.remove(&call_id)
    }

    fn store(&mut self, session: CallSession) {
        if session.is_active() {
            self.sessions.insert(session.info.call_id, session);
        } else {
            if self.finished.len() == HISTORY_LIMIT {
                self.finished.pop_front();
            }
            self.finished.push_back(session.info);
        }
    }
}

fn acquire_for(
    call_type: CallType,
    media: &mut MediaSourceManager,
    now: Instant,
) -> VoiceResult<Vec<TrackHandle>> {
    let mut kinds = vec![MediaKind::Audio];
    if call_type == CallType::Video {
        kinds.push(MediaKind::Video);
    }

    let mut tracks = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let constraints = Constraints {
            noise_suppression: kind.is_audio(),
            ..Default::default()
        };
        match media.acquire(kind, &constraints) {
            Ok(track) => tracks.push(track),
            Err(e) => {
                release_all(&tracks, media, now);
                return Err(e);
            }
        }
    }
    Ok(tracks)
}

fn release_all(tracks: &[TrackHandle], media: &mut MediaSourceManager, now: Instant) {
    for track in tracks {
        media.release(track.id, &mut [], now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackFactory;
    use crate::media::VirtualDevices;
    use tokio::sync::mpsc;

    struct Side {
        calls: CallManager,
        media: MediaSourceManager,
        out: mpsc::UnboundedReceiver<Signal>,
    }

    fn side(user: &str, devices: VirtualDevices) -> Side {
        let (relay, out) = RelayHandle::channel(user.into());
        Side {
            calls: CallManager::new(
                relay,
                Arc::new(LoopbackFactory::new(user)),
                &VoiceConfig::default(),
            ),
            media: MediaSourceManager::new(Box::new(devices)),
            out,
        }
    }

    fn sent(side: &mut Side) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(s) = side.out.try_recv() {
            signals.push(s);
        }
        signals
    }

    #[test]
    fn test_second_invite_is_refused_locally() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let bob = UserId::from("bob");

        alice
            .calls
            .invite(&bob, CallType::Voice, &mut alice.media, now)
            .unwrap();
        assert_eq!(sent(&mut alice).len(), 1);

        let err = alice
            .calls
            .invite(&bob, CallType::Voice, &mut alice.media, now)
            .unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
        assert!(sent(&mut alice).is_empty());
        assert_eq!(alice.calls.active().len(), 1);
    }

    #[test]
    fn test_missing_device_sends_nothing() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new().without(MediaKind::Video));

        let err = alice
            .calls
            .invite(&"bob".into(), CallType::Video, &mut alice.media, now)
            .unwrap_err();

        assert!(matches!(err, VoiceError::DeviceUnavailable { .. }));
        assert!(sent(&mut alice).is_empty());
        assert!(alice.media.tracks().is_empty());
        assert!(alice.calls.active().is_empty());
    }

    #[test]
    fn test_callee_without_device_rejects() {
        let now = Instant::now();
        let mut bob = side("bob", VirtualDevices::new().without(MediaKind::Audio));
        let call_id = CallId::new();
        bob.calls.handle_signal(
            Signal::CallInvite {
                from_id: "alice".into(),
                to_id: "bob".into(),
                call_id,
                call_type: CallType::Voice,
            },
            &mut bob.media,
            now,
        );

        assert!(bob.calls.accept(call_id, &mut bob.media, now).is_err());

        assert!(matches!(sent(&mut bob).as_slice(), [Signal::CallReject { .. }]));
        let info = bob.calls.session(call_id).unwrap();
        assert_eq!(info.state, CallState::Failed);
        assert_eq!(info.end_reason, Some(EndReason::NoDevice));
        assert_eq!(bob.calls.links_created(), 0);
    }

    #[test]
    fn test_ring_timeout_on_both_sides() {
        let t0 = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let mut bob = side("bob", VirtualDevices::new());

        let call_id = alice
            .calls
            .invite(&"bob".into(), CallType::Voice, &mut alice.media, t0)
            .unwrap();
        for signal in sent(&mut alice) {
            bob.calls.handle_signal(signal, &mut bob.media, t0);
        }
        assert_eq!(bob.calls.session(call_id).unwrap().state, CallState::Ringing);
        assert_eq!(alice.calls.next_deadline(), Some(t0 + Duration::from_secs(30)));

        let t1 = t0 + Duration::from_secs(30);
        alice.calls.poll(&mut alice.media, t1);
        bob.calls.poll(&mut bob.media, t1);

        assert_eq!(alice.calls.session(call_id).unwrap().state, CallState::TimedOut);
        assert_eq!(bob.calls.session(call_id).unwrap().state, CallState::TimedOut);
        assert!(matches!(sent(&mut bob).as_slice(), [Signal::CallReject { .. }]));
        assert_eq!(alice.calls.links_created(), alice.calls.links_closed());
        assert!(alice.media.tracks().is_empty());
    }

    #[test]
    fn test_late_reject_leaves_answered_call_alone() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let mut bob = side("bob", VirtualDevices::new());

        let call_id = alice
            .calls
            .invite(&"bob".into(), CallType::Voice, &mut alice.media, now)
            .unwrap();
        for signal in sent(&mut alice) {
            bob.calls.handle_signal(signal, &mut bob.media, now);
        }
        bob.calls.accept(call_id, &mut bob.media, now).unwrap();
        for _ in 0..8 {
            for signal in sent(&mut bob) {
                alice.calls.handle_signal(signal, &mut alice.media, now);
            }
            for signal in sent(&mut alice) {
                bob.calls.handle_signal(signal, &mut bob.media, now);
            }
        }
        let before = alice.calls.session(call_id).unwrap().state;
        assert!(!before.is_terminal());
        assert_ne!(before, CallState::Inviting);

        // Another of bob's devices giving up on its own ring
        alice.calls.handle_signal(
            Signal::CallReject {
                from_id: "bob".into(),
                to_id: "alice".into(),
                call_id,
            },
            &mut alice.media,
            now,
        );

        assert_eq!(alice.calls.session(call_id).unwrap().state, before);
        assert!(sent(&mut alice).is_empty());
        assert_eq!(alice.calls.links_closed(), 0);
    }

    #[test]
    fn test_undeliverable_invite_counts_as_timeout() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let call_id = alice
            .calls
            .invite(&"ghost".into(), CallType::Voice, &mut alice.media, now)
            .unwrap();

        alice.calls.handle_signal(
            Signal::DeliveryFailed {
                to_id: "ghost".into(),
                call_id: Some(call_id),
                kind: SignalKind::CallInvite,
            },
            &mut alice.media,
            now,
        );

        let info = alice.calls.session(call_id).unwrap();
        assert_eq!(info.state, CallState::TimedOut);
        assert_eq!(info.end_reason, Some(EndReason::Unreachable));
    }

    #[test]
    fn test_invite_collision_keeps_lower_ids_call() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let mut bob = side("bob", VirtualDevices::new());

        let alices = alice
            .calls
            .invite(&"bob".into(), CallType::Voice, &mut alice.media, now)
            .unwrap();
        let bobs = bob
            .calls
            .invite(&"alice".into(), CallType::Voice, &mut bob.media, now)
            .unwrap();

        let from_alice = sent(&mut alice);
        let from_bob = sent(&mut bob);
        for s in from_bob {
            alice.calls.handle_signal(s, &mut alice.media, now);
        }
        for s in from_alice {
            bob.calls.handle_signal(s, &mut bob.media, now);
        }

        assert_eq!(alice.calls.session(alices).unwrap().state, CallState::Inviting);
        assert!(alice.calls.session(bobs).is_none());
        assert_eq!(bob.calls.session(alices).unwrap().state, CallState::Ringing);
        assert_eq!(
            bob.calls.session(bobs).unwrap().end_reason,
            Some(EndReason::Superseded)
        );
        assert!(sent(&mut alice).is_empty());
        assert!(sent(&mut bob).is_empty());
    }

    #[test]
    fn test_busy_callee_rejects_new_invite() {
        let now = Instant::now();
        let mut bob = side("bob", VirtualDevices::new());
        let first = CallId::new();
        let second = CallId::new();
        for call_id in [first, second] {
            bob.calls.handle_signal(
                Signal::CallInvite {
                    from_id: "alice".into(),
                    to_id: "bob".into(),
                    call_id,
                    call_type: CallType::Voice,
                },
                &mut bob.media,
                now,
            );
        }

        assert_eq!(bob.calls.active().len(), 1);
        assert!(matches!(
            sent(&mut bob).as_slice(),
            [Signal::CallReject { call_id, .. }] if *call_id == second
        ));
    }

    #[test]
    fn test_caller_cancel_while_ringing() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let mut bob = side("bob", VirtualDevices::new());
        let call_id = alice
            .calls
            .invite(&"bob".into(), CallType::Voice, &mut alice.media, now)
            .unwrap();
        for s in sent(&mut alice) {
            bob.calls.handle_signal(s, &mut bob.media, now);
        }

        alice.calls.end(call_id, &mut alice.media, now).unwrap();
        for s in sent(&mut alice) {
            bob.calls.handle_signal(s, &mut bob.media, now);
        }

        assert_eq!(
            alice.calls.session(call_id).unwrap().end_reason,
            Some(EndReason::Cancelled)
        );
        let info = bob.calls.session(call_id).unwrap();
        assert_eq!(info.state, CallState::Ended);
        assert_eq!(info.end_reason, Some(EndReason::Cancelled));
    }

    #[test]
    fn test_signals_from_non_participants_are_ignored() {
        let now = Instant::now();
        let mut alice = side("alice", VirtualDevices::new());
        let call_id = alice
            .calls
            .invite(&"bob".into(), CallType::Voice, &mut alice.media, now)
            .unwrap();

        alice.calls.handle_signal(
            Signal::CallAccept {
                from_id: "mallory".into(),
                to_id: "alice".into(),
                call_id,
            },
            &mut alice.media,
            now,
        );

        assert_eq!(alice.calls.session(call_id).unwrap().state, CallState::Inviting);
        assert_eq!(alice.calls.links_created(), 0);
    }
}
