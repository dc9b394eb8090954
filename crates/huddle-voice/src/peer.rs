//! One media connection to exactly one remote participant.
//!
//! ```text
//!   idle ──▶ offering ──────────────▶ connecting ──▶ connected ──▶ closed
//!     └────▶ answering ─────────────────┘               │
//!                                                       └──▶ failed
//! ```
//!
//! The initiator offers, the responder answers; which side is which is
//! decided by the owner (caller for calls, lower user id in a channel mesh).
//! Offers and answers carry a per-direction revision so late or duplicated
//! descriptions are discarded instead of re-applied.
//!
//! A link is sans-IO: inbound signals and engine activity are fed in with the
//! current time, outbound signals go straight to the relay, and everything the
//! owner must react to is collected with [`PeerLink::take_events`].

use crate::engine::{Connectivity, EngineEvent, MediaEngine};
use crate::error::{VoiceError, VoiceResult};
use crate::media::{MediaKind, TrackHandle};
use crate::negotiation::NegotiationQueue;
use crate::relay_client::RelayHandle;
use huddle_common::config::VoiceConfig;
use huddle_common::{CandidatePayload, Scope, Signal, TrackId, UserId};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Role of `local` in a mesh pair: the lower id initiates.
    pub fn for_pair(local: &UserId, remote: &UserId) -> Self {
        if huddle_common::ids::is_initiator(local, remote) {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimers {
    /// Bound on one offer/answer cycle
    pub negotiation_timeout: Duration,
    /// Wait before the single connectivity restart
    pub restart_backoff: Duration,
}

impl Default for LinkTimers {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            restart_backoff: Duration::from_secs(2),
        }
    }
}

impl From<&VoiceConfig> for LinkTimers {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout(),
            restart_backoff: config.restart_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    NegotiationTimeout,
    ConnectivityLost,
    Engine(String),
}

impl LinkFailure {
    pub fn into_error(self, remote: &UserId) -> VoiceError {
        match self {
            LinkFailure::NegotiationTimeout => VoiceError::NegotiationTimeout(remote.clone()),
            LinkFailure::ConnectivityLost => VoiceError::ConnectivityLost(remote.clone()),
            LinkFailure::Engine(reason) => VoiceError::Engine(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub mid: String,
    pub kind: MediaKind,
}

/// Things the owning session or mesh reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    RemoteTrack(RemoteTrack),
    /// A track change could not be negotiated; the link kept its prior tracks.
    RenegotiationFailed(String),
    Failed(LinkFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Negotiation,
    Restart,
}

pub struct PeerLink {
    remote: UserId,
    scope: Scope,
    role: Role,
    state: LinkState,
    engine: Box<dyn MediaEngine>,
    relay: RelayHandle,
    queue: NegotiationQueue<CandidatePayload>,
    local_tracks: Vec<TrackHandle>,
    remote_tracks: Vec<RemoteTrack>,
    /// Revision of the last offer we sent
    local_revision: u32,
    /// Highest remote offer revision answered
    remote_revision: u32,
    pending_offer: Option<u32>,
    /// Tracks to fall back to if the outstanding renegotiation fails
    rollback_tracks: Option<Vec<TrackHandle>>,
    renegotiate_when_idle: bool,
    timer: Option<(Instant, Timer)>,
    restart_available: bool,
    timeout_failure: LinkFailure,
    timers: LinkTimers,
    events: Vec<LinkEvent>,
}

impl PeerLink {
    pub fn new(
        remote: UserId,
        scope: Scope,
        role: Role,
        engine: Box<dyn MediaEngine>,
        relay: RelayHandle,
        timers: LinkTimers,
    ) -> Self {
        Self {
            remote,
            scope,
            role,
            state: LinkState::Idle,
            engine,
            relay,
            queue: NegotiationQueue::new(),
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            local_revision: 0,
            remote_revision: 0,
            pending_offer: None,
            rollback_tracks: None,
            renegotiate_when_idle: false,
            timer: None,
            restart_available: true,
            timeout_failure: LinkFailure::NegotiationTimeout,
            timers,
            events: Vec::new(),
        }
    }

    /// Start negotiating with `tracks`. The initiator sends its offer; the
    /// responder starts waiting for one.
    pub fn connect(&mut self, tracks: Vec<TrackHandle>, now: Instant) {
        if self.state != LinkState::Idle {
            return;
        }
        self.local_tracks = tracks;

        match self.role {
            Role::Initiator => match self.send_offer(false, now) {
                Ok(()) => self.set_state(LinkState::Offering),
                Err(e) => self.fail(LinkFailure::Engine(e.to_string())),
            },
            Role::Responder => self.arm(Timer::Negotiation, now),
        }
    }

    pub fn handle_offer(&mut self, revision: u32, sdp: &str, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        if revision <= self.remote_revision {
            tracing::debug!(remote = %self.remote, revision, "Discarding stale offer");
            return;
        }

        // Both sides offered at once
        let mut reoffer = false;
        if self.pending_offer.is_some() {
            match self.role {
                Role::Initiator => {
                    tracing::debug!(remote = %self.remote, revision, "Offer collision, keeping ours");
                    return;
                }
                Role::Responder => {
                    tracing::debug!(remote = %self.remote, revision, "Offer collision, yielding");
                    self.engine.rollback();
                    self.pending_offer = None;
                    reoffer = self.state == LinkState::Connected;
                }
            }
        }

        let answer = match self.engine.accept_offer(sdp, &self.local_tracks) {
            Ok(answer) => answer,
            Err(e) if self.state == LinkState::Connected => {
                tracing::warn!(remote = %self.remote, error = %e, "Rejected renegotiation offer");
                self.events.push(LinkEvent::RenegotiationFailed(e.to_string()));
                return;
            }
            Err(e) => {
                self.fail(LinkFailure::Engine(e.to_string()));
                return;
            }
        };

        self.remote_revision = revision;
        self.send(Signal::NegoAnswer {
            from_id: self.relay.local_id().clone(),
            to_id: self.remote.clone(),
            scope: self.scope.clone(),
            revision,
            sdp: answer,
        });
        self.drain_candidates();

        match self.state {
            LinkState::Idle => {
                self.set_state(LinkState::Answering);
                self.set_state(LinkState::Connecting);
                self.arm(Timer::Negotiation, now);
            }
            LinkState::Answering | LinkState::Connecting | LinkState::Offering => {
                self.arm(Timer::Negotiation, now);
            }
            LinkState::Connected => {
                if reoffer {
                    self.start_renegotiation(now);
                } else if self.pending_offer.is_none() {
                    self.timer = None;
                }
            }
            LinkState::Closed | LinkState::Failed => {}
        }
    }

    pub fn handle_answer(&mut self, revision: u32, sdp: &str, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        if self.pending_offer != Some(revision) {
            tracing::debug!(remote = %self.remote, revision, "Discarding stale answer");
            return;
        }
        self.pending_offer = None;

        if let Err(e) = self.engine.accept_answer(sdp) {
            if self.state == LinkState::Connected {
                self.abandon_renegotiation(e.to_string());
            } else {
                self.fail(LinkFailure::Engine(e.to_string()));
            }
            return;
        }

        self.rollback_tracks = None;
        self.drain_candidates();

        match self.state {
            LinkState::Offering => {
                self.set_state(LinkState::Connecting);
                self.arm(Timer::Negotiation, now);
            }
            LinkState::Connecting => self.arm(Timer::Negotiation, now),
            LinkState::Connected => {
                self.timer = None;
                if std::mem::take(&mut self.renegotiate_when_idle) {
                    self.start_renegotiation(now);
                }
            }
            _ => {}
        }
    }

    pub fn handle_candidate(&mut self, candidate: CandidatePayload) {
        if self.state.is_terminal() {
            return;
        }
        if let Some(candidate) = self.queue.enqueue(candidate) {
            self.apply_candidate(&candidate);
        }
    }

    /// Negotiate a new local track set without touching connected media.
    /// Before the link is connected the change rides along with the first
    /// negotiation that follows.
    pub fn renegotiate(&mut self, tracks: Vec<TrackHandle>, now: Instant) -> VoiceResult<()> {
        if self.state.is_terminal() {
            return Err(VoiceError::InvalidState(format!(
                "link to {} is {}",
                self.remote, self.state
            )));
        }

        if self.state != LinkState::Connected || self.pending_offer.is_some() {
            if self.rollback_tracks.is_none() {
                self.rollback_tracks = Some(self.local_tracks.clone());
            }
            self.local_tracks = tracks;
            self.renegotiate_when_idle = true;
            return Ok(());
        }

        let previous = std::mem::replace(&mut self.local_tracks, tracks);
        match self.send_offer(false, now) {
            Ok(()) => {
                self.rollback_tracks = Some(previous);
                Ok(())
            }
            Err(e) => {
                self.local_tracks = previous;
                self.events.push(LinkEvent::RenegotiationFailed(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn add_track(&mut self, track: TrackHandle, now: Instant) -> VoiceResult<()> {
        let mut tracks = self.local_tracks.clone();
        tracks.push(track);
        self.renegotiate(tracks, now)
    }

    /// Stop sending `id`. The track is gone from the link even when the
    /// removal cannot be negotiated, and a later rollback never restores it.
    pub fn remove_track(&mut self, id: TrackId, now: Instant) {
        let tracks: Vec<TrackHandle> = self
            .local_tracks
            .iter()
            .filter(|t| t.id != id)
            .cloned()
            .collect();
        if let Err(e) = self.renegotiate(tracks, now) {
            tracing::debug!(remote = %self.remote, error = %e, "Track removal not negotiated");
            self.local_tracks.retain(|t| t.id != id);
        }
        if let Some(previous) = self.rollback_tracks.as_mut() {
            previous.retain(|t| t.id != id);
        }
    }

    /// Put `new` in place of `old`. Should the renegotiation fail, the link
    /// falls back to its prior track set with `new` still standing in for
    /// `old`.
    pub fn swap_track(&mut self, old: TrackId, new: TrackHandle, now: Instant) -> VoiceResult<()> {
        let tracks = self
            .local_tracks
            .iter()
            .map(|t| if t.id == old { new.clone() } else { t.clone() })
            .collect();
        self.renegotiate(tracks, now)?;
        if let Some(previous) = self.rollback_tracks.as_mut() {
            for track in previous.iter_mut().filter(|t| t.id == old) {
                *track = new.clone();
            }
        }
        Ok(())
    }

    /// Drive the engine and fire due timers.
    pub fn poll(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        for event in self.engine.poll(now) {
            match event {
                EngineEvent::LocalCandidate(candidate) => self.send(Signal::NegoCandidate {
                    from_id: self.relay.local_id().clone(),
                    to_id: self.remote.clone(),
                    scope: self.scope.clone(),
                    candidate,
                }),
                EngineEvent::Connectivity(c) => self.on_connectivity(c, now),
                EngineEvent::RemoteTrack { mid, kind } => {
                    let track = RemoteTrack { mid, kind };
                    self.remote_tracks.push(track.clone());
                    self.events.push(LinkEvent::RemoteTrack(track));
                }
            }
        }
        self.poll_timeouts(now);
    }

    pub fn poll_timeouts(&mut self, now: Instant) {
        let Some((at, timer)) = self.timer else {
            return;
        };
        if now < at || self.state.is_terminal() {
            return;
        }
        self.timer = None;

        match timer {
            Timer::Restart => self.restart(now),
            Timer::Negotiation if self.state == LinkState::Connected => {
                if self.pending_offer.take().is_some() {
                    self.engine.rollback();
                    self.abandon_renegotiation("renegotiation timed out".into());
                }
            }
            Timer::Negotiation if self.restart_available => {
                tracing::warn!(remote = %self.remote, state = %self.state, "Negotiation timed out, restarting");
                self.restart(now);
            }
            Timer::Negotiation => self.fail(self.timeout_failure.clone()),
        }
    }

    /// Tear down. Terminal and idempotent.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.engine.close();
        self.queue.clear();
        self.timer = None;
        self.pending_offer = None;
        self.set_state(LinkState::Closed);
    }

    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer.map(|(at, _)| at)
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn local_tracks(&self) -> &[TrackHandle] {
        &self.local_tracks
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn has_track(&self, id: TrackId) -> bool {
        self.local_tracks.iter().any(|t| t.id == id)
    }

    /// Remote candidates still waiting for a remote description.
    pub fn pending_candidates(&self) -> usize {
        self.queue.pending()
    }

    fn on_connectivity(&mut self, connectivity: Connectivity, now: Instant) {
        match connectivity {
            Connectivity::Connected => {
                if !matches!(
                    self.state,
                    LinkState::Offering | LinkState::Answering | LinkState::Connecting
                ) {
                    return;
                }
                self.set_state(LinkState::Connected);
                self.restart_available = true;
                self.timeout_failure = LinkFailure::NegotiationTimeout;
                if self.pending_offer.is_none() {
                    self.timer = None;
                    if std::mem::take(&mut self.renegotiate_when_idle) {
                        self.start_renegotiation(now);
                    }
                }
            }
            Connectivity::Disconnected => {
                if self.state != LinkState::Connected {
                    return;
                }
                if !self.restart_available {
                    self.fail(LinkFailure::ConnectivityLost);
                    return;
                }
                tracing::warn!(
                    remote = %self.remote,
                    backoff = ?self.timers.restart_backoff,
                    "Connectivity lost, scheduling restart"
                );
                self.pending_offer = None;
                self.timeout_failure = LinkFailure::ConnectivityLost;
                self.set_state(LinkState::Connecting);
                self.timer = Some((now + self.timers.restart_backoff, Timer::Restart));
            }
        }
    }

    /// The one automatic restart: the initiator offers with fresh transport
    /// credentials, the responder waits for that offer.
    fn restart(&mut self, now: Instant) {
        self.restart_available = false;
        self.queue.reset();
        match self.role {
            Role::Initiator => {
                if let Err(e) = self.send_offer(true, now) {
                    self.fail(LinkFailure::Engine(e.to_string()));
                }
            }
            Role::Responder => self.arm(Timer::Negotiation, now),
        }
    }

    fn start_renegotiation(&mut self, now: Instant) {
        self.renegotiate_when_idle = false;
        if let Err(e) = self.send_offer(false, now) {
            self.abandon_renegotiation(e.to_string());
        }
    }

    fn abandon_renegotiation(&mut self, reason: String) {
        tracing::warn!(remote = %self.remote, reason = %reason, "Renegotiation failed, keeping prior tracks");
        if let Some(previous) = self.rollback_tracks.take() {
            self.local_tracks = previous;
        }
        self.timer = None;
        self.events.push(LinkEvent::RenegotiationFailed(reason));
    }

    fn send_offer(&mut self, ice_restart: bool, now: Instant) -> VoiceResult<()> {
        let sdp = self.engine.create_offer(&self.local_tracks, ice_restart)?;
        self.local_revision += 1;
        self.pending_offer = Some(self.local_revision);
        self.send(Signal::NegoOffer {
            from_id: self.relay.local_id().clone(),
            to_id: self.remote.clone(),
            scope: self.scope.clone(),
            revision: self.local_revision,
            sdp,
        });
        self.arm(Timer::Negotiation, now);
        Ok(())
    }

    fn drain_candidates(&mut self) {
        let ready: Vec<CandidatePayload> = self.queue.mark_ready().collect();
        for candidate in &ready {
            self.apply_candidate(candidate);
        }
    }

    fn apply_candidate(&mut self, candidate: &CandidatePayload) {
        if let Err(e) = self.engine.add_remote_candidate(candidate) {
            tracing::warn!(remote = %self.remote, error = %e, "Failed to apply candidate");
        }
    }

    fn arm(&mut self, timer: Timer, now: Instant) {
        let after = match timer {
            Timer::Negotiation => self.timers.negotiation_timeout,
            Timer::Restart => self.timers.restart_backoff,
        };
        self.timer = Some((now + after, timer));
    }

    fn send(&self, signal: Signal) {
        if let Err(e) = self.relay.send(signal) {
            tracing::warn!(remote = %self.remote, error = %e, "Failed to queue signal");
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        tracing::debug!(
            remote = %self.remote,
            scope = %self.scope,
            from = %self.state,
            to = %state,
            "Peer link state"
        );
        self.state = state;
        self.events.push(LinkEvent::StateChanged(state));
    }

    fn fail(&mut self, failure: LinkFailure) {
        if self.state.is_terminal() {
            return;
        }
        tracing::warn!(remote = %self.remote, scope = %self.scope, failure = ?failure, "Peer link failed");
        self.engine.close();
        self.timer = None;
        self.pending_offer = None;
        self.set_state(LinkState::Failed);
        self.events.push(LinkEvent::Failed(failure));
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.engine.close();
        }
    }
}
