//! Media engine seam.
//!
//! A [`PeerLink`](crate::peer::PeerLink) runs the negotiation protocol; the
//! engine behind it owns the actual transport (ICE, DTLS, SRTP) and turns
//! descriptions into SDP. Engines are sans-IO from the link's point of view:
//! the link calls in with descriptions and candidates, and drains what
//! happened through [`MediaEngine::poll`].
//!
//! [`Str0mEngine`](crate::rtc::Str0mEngine) is the WebRTC implementation.
//! [`LoopbackEngine`] runs entirely in process: it reports connectivity as
//! soon as both descriptions are applied, and exposes a [`LoopbackControl`]
//! to drop or restore the network on demand. Headless clients and tests use it.

use crate::error::{VoiceError, VoiceResult};
use crate::media::{MediaKind, TrackHandle};
use huddle_common::{CandidatePayload, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local candidate to trickle to the remote side.
    LocalCandidate(CandidatePayload),
    Connectivity(Connectivity),
    RemoteTrack { mid: String, kind: MediaKind },
}

pub trait MediaEngine: Send {
    /// Create a local offer carrying `tracks`. With `ice_restart` the
    /// transport credentials are renewed.
    fn create_offer(&mut self, tracks: &[TrackHandle], ice_restart: bool) -> VoiceResult<String>;

    /// Apply a remote offer and return the local answer.
    fn accept_offer(&mut self, sdp: &str, tracks: &[TrackHandle]) -> VoiceResult<String>;

    /// Apply the remote answer to our outstanding offer.
    fn accept_answer(&mut self, sdp: &str) -> VoiceResult<()>;

    /// Abandon the outstanding local offer.
    fn rollback(&mut self);

    fn add_remote_candidate(&mut self, candidate: &CandidatePayload) -> VoiceResult<()>;

    /// Advance time and collect what happened since the last poll.
    fn poll(&mut self, now: Instant) -> Vec<EngineEvent>;

    fn close(&mut self);
}

/// Creates one engine per peer link.
pub trait EngineFactory: Send + Sync {
    fn create(&self, remote: &UserId) -> VoiceResult<Box<dyn MediaEngine>>;
}

// ── Loopback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LoopbackState {
    /// Revision counter baked into generated SDP
    generation: u32,
    pending_offer: bool,
    negotiated: bool,
    network_up: bool,
    reported: Option<Connectivity>,
    announced_candidate: bool,
    fail_next_offer: bool,
    offers: u32,
    ice_restarts: u32,
    remote_candidates: Vec<String>,
    remote_mids: Vec<String>,
    closed: bool,
    events: Vec<EngineEvent>,
}

/// Test and diagnostics handle onto a [`LoopbackEngine`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackControl {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackControl {
    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop or restore the simulated network path.
    pub fn set_network(&self, up: bool) {
        self.lock().network_up = up;
    }

    /// Make the next `create_offer` fail.
    pub fn fail_next_offer(&self) {
        self.lock().fail_next_offer = true;
    }

    pub fn offers_created(&self) -> u32 {
        self.lock().offers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.lock().ice_restarts
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.lock().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

pub struct LoopbackEngine {
    label: String,
    control: LoopbackControl,
}

impl LoopbackEngine {
    pub fn new(label: impl Into<String>) -> (Self, LoopbackControl) {
        let control = LoopbackControl::default();
        control.set_network(true);
        let engine = Self {
            label: label.into(),
            control: control.clone(),
        };
        (engine, control)
    }

    fn describe(&self, kind: &str, generation: u32, tracks: &[TrackHandle]) -> String {
        let mut sdp = format!(
            "v=0\r\no={} {generation} IN IP4 127.0.0.1\r\na=type:{kind}\r\na=ice-ufrag:{}{generation}\r\n",
            self.label, self.label
        );
        for (i, track) in tracks.iter().enumerate() {
            let media = if track.kind.is_audio() { "audio" } else { "video" };
            sdp.push_str(&format!("m={media}\r\na=mid:{i}\r\n"));
        }
        sdp
    }

    fn remote_tracks(state: &mut LoopbackState, sdp: &str) {
        let mut kind = None;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = Some(if media.starts_with("audio") {
                    MediaKind::Audio
                } else {
                    MediaKind::Video
                });
            } else if let (Some(mid), Some(k)) = (line.strip_prefix("a=mid:"), kind.take()) {
                if !state.remote_mids.iter().any(|m| m == mid) {
                    state.remote_mids.push(mid.to_owned());
                    state.events.push(EngineEvent::RemoteTrack {
                        mid: mid.to_owned(),
                        kind: k,
                    });
                }
            }
        }
    }
}

impl MediaEngine for LoopbackEngine {
    fn create_offer(&mut self, tracks: &[TrackHandle], ice_restart: bool) -> VoiceResult<String> {
        let generation = {
            let mut state = self.control.lock();
            if state.closed {
                return Err(VoiceError::Engine("engine closed".into()));
            }
            if std::mem::take(&mut state.fail_next_offer) {
                return Err(VoiceError::Engine("offer creation failed".into()));
            }
            state.offers += 1;
            state.generation += 1;
            state.pending_offer = true;
            if ice_restart {
                state.ice_restarts += 1;
                state.negotiated = false;
            }
            state.generation
        };
        Ok(self.describe("offer", generation, tracks))
    }

    fn accept_offer(&mut self, sdp: &str, tracks: &[TrackHandle]) -> VoiceResult<String> {
        let generation = {
            let mut state = self.control.lock();
            if state.closed {
                return Err(VoiceError::Engine("engine closed".into()));
            }
            if !sdp.starts_with("v=0") {
                return Err(VoiceError::Engine("unparseable offer".into()));
            }
            Self::remote_tracks(&mut state, sdp);
            state.pending_offer = false;
            state.negotiated = true;
            state.generation += 1;
            state.generation
        };
        Ok(self.describe("answer", generation, tracks))
    }

    fn accept_answer(&mut self, sdp: &str) -> VoiceResult<()> {
        let mut state = self.control.lock();
        if !state.pending_offer {
            return Err(VoiceError::Engine("no offer outstanding".into()));
        }
        if !sdp.starts_with("v=0") {
            return Err(VoiceError::Engine("unparseable answer".into()));
        }
        Self::remote_tracks(&mut state, sdp);
        state.pending_offer = false;
        state.negotiated = true;
        Ok(())
    }

    fn rollback(&mut self) {
        self.control.lock().pending_offer = false;
    }

    fn add_remote_candidate(&mut self, candidate: &CandidatePayload) -> VoiceResult<()> {
        self.control
            .lock()
            .remote_candidates
            .push(candidate.candidate.clone());
        Ok(())
    }

    fn poll(&mut self, _now: Instant) -> Vec<EngineEvent> {
        let mut state = self.control.lock();
        if state.closed {
            return Vec::new();
        }

        if state.negotiated && !state.announced_candidate {
            state.announced_candidate = true;
            let candidate = format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host ufrag {}", self.label);
            state
                .events
                .push(EngineEvent::LocalCandidate(CandidatePayload::new(candidate)));
        }

        let now_connected = if state.negotiated && state.network_up {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        };
        let changed = match state.reported {
            Some(previous) => previous != now_connected,
            // Nothing to report until the first connection
            None => now_connected == Connectivity::Connected,
        };
        if changed {
            state.reported = Some(now_connected);
            state.events.push(EngineEvent::Connectivity(now_connected));
        }

        std::mem::take(&mut state.events)
    }

    fn close(&mut self) {
        let mut state = self.control.lock();
        state.closed = true;
        state.events.clear();
    }
}

/// Hands out [`LoopbackEngine`]s and keeps their controls by remote user.
#[derive(Debug, Default)]
pub struct LoopbackFactory {
    label: String,
    controls: Mutex<HashMap<UserId, Vec<LoopbackControl>>>,
}

impl LoopbackFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Control of the most recent engine created for `remote`.
    pub fn control(&self, remote: &UserId) -> Option<LoopbackControl> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .and_then(|c| c.last().cloned())
    }

    /// Number of engines created for `remote` so far.
    pub fn created_for(&self, remote: &UserId) -> usize {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(remote)
            .map_or(0, Vec::len)
    }
}

impl EngineFactory for LoopbackFactory {
    fn create(&self, remote: &UserId) -> VoiceResult<Box<dyn MediaEngine>> {
        let (engine, control) = LoopbackEngine::new(format!("{}-{remote}", self.label));
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(remote.clone())
            .or_default()
            .push(control);
        Ok(Box::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::TrackId;

    fn mic() -> TrackHandle {
        TrackHandle {
            id: TrackId::new(),
            kind: MediaKind::Audio,
            label: "mic".into(),
        }
    }

    #[test]
    fn test_connects_once_both_descriptions_applied() {
        let (mut offerer, _) = LoopbackEngine::new("a");
        let (mut answerer, _) = LoopbackEngine::new("b");
        let now = Instant::now();

        let offer = offerer.create_offer(&[mic()], false).unwrap();
        assert!(offerer.poll(now).is_empty());

        let answer = answerer.accept_offer(&offer, &[mic()]).unwrap();
        let events = answerer.poll(now);
        assert!(events.contains(&EngineEvent::Connectivity(Connectivity::Connected)));
        assert!(events.contains(&EngineEvent::RemoteTrack {
            mid: "0".into(),
            kind: MediaKind::Audio
        }));

        offerer.accept_answer(&answer).unwrap();
        assert!(
            offerer
                .poll(now)
                .contains(&EngineEvent::Connectivity(Connectivity::Connected))
        );
    }

    #[test]
    fn test_network_drop_is_reported_once() {
        let (mut engine, control) = LoopbackEngine::new("a");
        let now = Instant::now();
        engine.accept_offer("v=0\r\n", &[]).unwrap();
        engine.poll(now);

        control.set_network(false);
        assert_eq!(
            engine.poll(now),
            vec![EngineEvent::Connectivity(Connectivity::Disconnected)]
        );
        assert!(engine.poll(now).is_empty());
    }

    #[test]
    fn test_answer_without_offer_is_rejected() {
        let (mut engine, _) = LoopbackEngine::new("a");
        assert!(engine.accept_answer("v=0\r\n").is_err());
    }
}
