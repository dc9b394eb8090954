//! WebRTC media engine on top of str0m.
//!
//! str0m is sans-IO: this engine owns one non-blocking UDP socket per link,
//! feeds received datagrams and timeouts into the `Rtc` instance on every
//! [`MediaEngine::poll`], and writes whatever it asks to transmit. The bound
//! socket address is the single host candidate announced to the remote side.

use crate::engine::{Connectivity, EngineEvent, EngineFactory, MediaEngine};
use crate::error::{VoiceError, VoiceResult};
use crate::media::{MediaKind, TrackHandle};
use huddle_common::{CandidatePayload, TrackId, UserId};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpApi, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind as RtcKind, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};

/// Largest datagram read from the socket
const RECV_BUFFER: usize = 2000;

/// One negotiated media line and the local track sending on it, if any.
struct MediaLine {
    mid: Mid,
    kind: RtcKind,
    track: Option<TrackId>,
}

pub struct Str0mEngine {
    remote: UserId,
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    local_candidate: String,
    pending: Option<SdpPendingOffer>,
    lines: Vec<MediaLine>,
    announced: bool,
    reported: Option<Connectivity>,
    buf: Vec<u8>,
    closed: bool,
}

impl Str0mEngine {
    pub fn bind(remote: UserId, ip: IpAddr) -> VoiceResult<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0))
            .map_err(|e| VoiceError::Engine(format!("bind failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| VoiceError::Engine(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| VoiceError::Engine(e.to_string()))?;

        let mut rtc = Rtc::builder().build(Instant::now());
        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| VoiceError::Engine(e.to_string()))?;
        let local_candidate = candidate.to_sdp_string();
        rtc.add_local_candidate(candidate);

        tracing::debug!(remote = %remote, addr = %local_addr, "Bound UDP socket for peer link");

        Ok(Self {
            remote,
            rtc,
            socket,
            local_addr,
            local_candidate,
            pending: None,
            lines: Vec::new(),
            announced: false,
            reported: None,
            buf: vec![0; RECV_BUFFER],
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Media line a local track is sent on.
    pub fn mid_for(&self, track: TrackId) -> Option<Mid> {
        self.lines
            .iter()
            .find(|l| l.track == Some(track))
            .map(|l| l.mid)
    }

    fn ensure_open(&self) -> VoiceResult<()> {
        if self.closed {
            return Err(VoiceError::Engine("engine closed".into()));
        }
        Ok(())
    }

    fn report(&mut self, connectivity: Connectivity, events: &mut Vec<EngineEvent>) {
        if self.reported != Some(connectivity) {
            self.reported = Some(connectivity);
            events.push(EngineEvent::Connectivity(connectivity));
        }
    }

    fn receive(&mut self, now: Instant) {
        loop {
            let (n, source) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(remote = %self.remote, error = %e, "UDP receive failed");
                    return;
                }
            };
            let Ok(receive) = Receive::new(Protocol::Udp, source, self.local_addr, &self.buf[..n]) else {
                continue;
            };
            let input = Input::Receive(now, receive);
            if self.rtc.accepts(&input) {
                if let Err(e) = self.rtc.handle_input(input) {
                    tracing::warn!(remote = %self.remote, error = %e, "Rejected datagram");
                }
            }
        }
    }
}

fn rtc_kind(kind: MediaKind) -> RtcKind {
    if kind.is_audio() {
        RtcKind::Audio
    } else {
        RtcKind::Video
    }
}

/// Map local tracks onto media lines: known tracks keep their line, new ones
/// reuse a line freed by a removed track of the same kind before a new line
/// is added.
fn assign_lines(change: &mut SdpApi<'_>, lines: &mut Vec<MediaLine>, tracks: &[TrackHandle]) {
    for line in lines.iter_mut() {
        if line.track.is_some_and(|id| !tracks.iter().any(|t| t.id == id)) {
            line.track = None;
        }
    }

    for track in tracks {
        if lines.iter().any(|l| l.track == Some(track.id)) {
            continue;
        }
        let kind = rtc_kind(track.kind);
        if let Some(free) = lines.iter_mut().find(|l| l.track.is_none() && l.kind == kind) {
            free.track = Some(track.id);
            continue;
        }
        let mid = change.add_media(kind, Direction::SendRecv, None, None, None);
        lines.push(MediaLine {
            mid,
            kind,
            track: Some(track.id),
        });
    }
}

/// Media lines of a received offer, in order, as `(mid, kind)`.
fn offered_lines(sdp: &str) -> Vec<(Mid, RtcKind)> {
    let mut found = Vec::new();
    let mut kind = None;
    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(RtcKind::Audio),
                Some("video") => Some(RtcKind::Video),
                _ => None,
            };
        } else if let (Some(mid), Some(k)) = (line.strip_prefix("a=mid:"), kind) {
            found.push((Mid::from(mid), k));
            kind = None;
        }
    }
    found
}

/// Adopt the remote side's media lines and put local tracks on free lines of
/// the same kind, so a later offer from this side reuses them.
fn adopt_lines(lines: &mut Vec<MediaLine>, offered: Vec<(Mid, RtcKind)>, tracks: &[TrackHandle]) {
    for (mid, kind) in offered {
        if !lines.iter().any(|l| l.mid == mid) {
            lines.push(MediaLine {
                mid,
                kind,
                track: None,
            });
        }
    }
    for track in tracks {
        if lines.iter().any(|l| l.track == Some(track.id)) {
            continue;
        }
        let kind = rtc_kind(track.kind);
        if let Some(free) = lines.iter_mut().find(|l| l.track.is_none() && l.kind == kind) {
            free.track = Some(track.id);
        }
    }
}

impl MediaEngine for Str0mEngine {
    fn create_offer(&mut self, tracks: &[TrackHandle], ice_restart: bool) -> VoiceResult<String> {
        self.ensure_open()?;
        let mut change = self.rtc.sdp_api();
        if ice_restart {
            change.ice_restart(true);
        }
        assign_lines(&mut change, &mut self.lines, tracks);

        let Some((offer, pending)) = change.apply() else {
            return Err(VoiceError::Engine("no media change to negotiate".into()));
        };
        self.pending = Some(pending);
        Ok(offer.to_sdp_string())
    }

    fn accept_offer(&mut self, sdp: &str, tracks: &[TrackHandle]) -> VoiceResult<String> {
        self.ensure_open()?;
        let offer = SdpOffer::from_sdp_string(sdp).map_err(|e| VoiceError::Engine(e.to_string()))?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| VoiceError::Engine(e.to_string()))?;
        adopt_lines(&mut self.lines, offered_lines(sdp), tracks);
        Ok(answer.to_sdp_string())
    }

    fn accept_answer(&mut self, sdp: &str) -> VoiceResult<()> {
        self.ensure_open()?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| VoiceError::Engine("no offer outstanding".into()))?;
        let answer = SdpAnswer::from_sdp_string(sdp).map_err(|e| VoiceError::Engine(e.to_string()))?;
        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| VoiceError::Engine(e.to_string()))
    }

    fn rollback(&mut self) {
        // Dropping the pending offer discards it
        self.pending = None;
    }

    fn add_remote_candidate(&mut self, candidate: &CandidatePayload) -> VoiceResult<()> {
        let candidate = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| VoiceError::Engine(e.to_string()))?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }

    fn poll(&mut self, now: Instant) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        if !self.announced {
            self.announced = true;
            events.push(EngineEvent::LocalCandidate(CandidatePayload {
                candidate: self.local_candidate.clone(),
                sdp_mid: None,
                sdp_m_line_index: Some(0),
            }));
        }

        self.receive(now);
        if let Err(e) = self.rtc.handle_input(Input::Timeout(now)) {
            tracing::warn!(remote = %self.remote, error = %e, "Timeout handling failed");
        }

        loop {
            match self.rtc.poll_output() {
                Ok(Output::Timeout(_)) => break,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self.socket.send_to(&transmit.contents, transmit.destination) {
                        tracing::debug!(remote = %self.remote, error = %e, "UDP send failed");
                    }
                }
                Ok(Output::Event(Event::Connected)) => self.report(Connectivity::Connected, &mut events),
                Ok(Output::Event(Event::IceConnectionStateChange(state))) => match state {
                    IceConnectionState::Disconnected => {
                        self.report(Connectivity::Disconnected, &mut events)
                    }
                    IceConnectionState::Connected | IceConnectionState::Completed
                        if self.reported.is_some() =>
                    {
                        self.report(Connectivity::Connected, &mut events)
                    }
                    _ => {}
                },
                Ok(Output::Event(Event::MediaAdded(added))) => {
                    events.push(EngineEvent::RemoteTrack {
                        mid: added.mid.to_string(),
                        kind: if added.kind == RtcKind::Audio {
                            MediaKind::Audio
                        } else {
                            MediaKind::Video
                        },
                    });
                }
                Ok(Output::Event(_)) => {}
                Err(e) => {
                    tracing::warn!(remote = %self.remote, error = %e, "Rtc failed");
                    self.report(Connectivity::Disconnected, &mut events);
                    break;
                }
            }
        }

        events
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending = None;
            self.rtc.disconnect();
        }
    }
}

/// Creates one [`Str0mEngine`] per link, each on its own socket.
#[derive(Debug, Clone)]
pub struct Str0mFactory {
    bind_ip: IpAddr,
}

impl Str0mFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl Default for Str0mFactory {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl EngineFactory for Str0mFactory {
    fn create(&self, remote: &UserId) -> VoiceResult<Box<dyn MediaEngine>> {
        Ok(Box::new(Str0mEngine::bind(remote.clone(), self.bind_ip)?))
    }
}
