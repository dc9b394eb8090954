//! Local capture tracks.
//!
//! Owns every local audio, camera and screen-capture track. Peer links only
//! hold [`TrackHandle`]s; a handle may be attached to several links at once,
//! so releasing a track first detaches it from every link it feeds.
//!
//! Capture itself is behind [`DeviceProvider`], the boundary to whatever
//! platform layer opens microphones and cameras.

use crate::error::{VoiceError, VoiceResult};
use crate::peer::PeerLink;
use huddle_common::TrackId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Instant;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    /// Audio goes on an audio m-line, camera and screen on video m-lines.
    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Audio)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Screen => "screen",
        })
    }
}

/// Capture constraints. Unset fields leave the choice to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    /// RNNoise suppression on microphone input
    #[serde(default)]
    pub noise_suppression: bool,
}

/// A live local track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub id: TrackId,
    pub kind: MediaKind,
    /// Device label reported by the provider
    pub label: String,
}

/// Platform capture backend.
pub trait DeviceProvider: Send {
    /// Start capturing. Returns the device label.
    fn open(
        &mut self,
        id: TrackId,
        kind: MediaKind,
        constraints: &Constraints,
    ) -> Result<String, String>;

    /// Stop capturing.
    fn close(&mut self, id: TrackId);
}

/// Device provider with no real hardware behind it. Every kind opens unless
/// marked unavailable.
#[derive(Debug, Default)]
pub struct VirtualDevices {
    unavailable: HashSet<MediaKind>,
    open: HashSet<TrackId>,
}

impl VirtualDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without(mut self, kind: MediaKind) -> Self {
        self.unavailable.insert(kind);
        self
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl DeviceProvider for VirtualDevices {
    fn open(
        &mut self,
        id: TrackId,
        kind: MediaKind,
        constraints: &Constraints,
    ) -> Result<String, String> {
        if self.unavailable.contains(&kind) {
            return Err(format!("no {kind} device present"));
        }
        self.open.insert(id);
        Ok(constraints
            .device_id
            .clone()
            .unwrap_or_else(|| format!("virtual {kind}")))
    }

    fn close(&mut self, id: TrackId) {
        self.open.remove(&id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Acquired(TrackHandle),
    Released { id: TrackId, kind: MediaKind },
    Replaced { old: TrackId, new: TrackHandle },
}

struct LocalTrack {
    handle: TrackHandle,
    enabled: bool,
}

pub struct MediaSourceManager {
    provider: Box<dyn DeviceProvider>,
    tracks: BTreeMap<TrackId, LocalTrack>,
    events: broadcast::Sender<MediaEvent>,
}

impl MediaSourceManager {
    pub fn new(provider: Box<dyn DeviceProvider>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            provider,
            tracks: BTreeMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Start capturing a new track.
    pub fn acquire(
        &mut self,
        kind: MediaKind,
        constraints: &Constraints,
    ) -> VoiceResult<TrackHandle> {
        let id = TrackId::new();
        let label = self
            .provider
            .open(id, kind, constraints)
            .map_err(|reason| VoiceError::DeviceUnavailable { kind, reason })?;

        let handle = TrackHandle { id, kind, label };
        tracing::info!(track = %id, kind = %kind, label = %handle.label, "Track acquired");

        self.tracks.insert(
            id,
            LocalTrack {
                handle: handle.clone(),
                enabled: true,
            },
        );
        let _ = self.events.send(MediaEvent::Acquired(handle.clone()));
        Ok(handle)
    }

    /// Stop a track, detaching it from every link it feeds first. Releasing
    /// an unknown or already released handle is a no-op and returns `false`.
    pub fn release(&mut self, id: TrackId, links: &mut [&mut PeerLink], now: Instant) -> bool {
        let Some(track) = self.tracks.remove(&id) else {
            return false;
        };

        for link in links.iter_mut().filter(|l| l.has_track(id)) {
            link.remove_track(id, now);
        }

        self.provider.close(id);
        tracing::info!(track = %id, kind = %track.handle.kind, "Track released");
        let _ = self.events.send(MediaEvent::Released {
            id,
            kind: track.handle.kind,
        });
        true
    }

    /// Hand every link carrying `old` the `new` track instead, renegotiating
    /// each one, then release `old`. Returns how many links were switched.
    pub fn replace(
        &mut self,
        old: TrackId,
        new: &TrackHandle,
        links: &mut [&mut PeerLink],
        now: Instant,
    ) -> VoiceResult<usize> {
        if !self.tracks.contains_key(&old) {
            return Err(VoiceError::InvalidState(format!("track {old} is not live")));
        }
        if !self.tracks.contains_key(&new.id) {
            return Err(VoiceError::InvalidState(format!("track {} is not live", new.id)));
        }

        let mut switched = 0;
        for link in links.iter_mut().filter(|l| l.has_track(old)) {
            // A failed renegotiation keeps the link on its prior tracks
            if link.swap_track(old, new.clone(), now).is_ok() {
                switched += 1;
            }
        }

        let _ = self.events.send(MediaEvent::Replaced {
            old,
            new: new.clone(),
        });
        self.release(old, links, now);
        Ok(switched)
    }

    /// Enable or disable sending on a track without renegotiating.
    pub fn set_enabled(&mut self, id: TrackId, enabled: bool) -> bool {
        match self.tracks.get_mut(&id) {
            Some(track) => {
                track.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, id: TrackId) -> bool {
        self.tracks.get(&id).is_some_and(|t| t.enabled)
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackHandle> {
        self.tracks.get(&id).map(|t| &t.handle)
    }

    /// Current track set.
    pub fn tracks(&self) -> Vec<TrackHandle> {
        self.tracks.values().map(|t| t.handle.clone()).collect()
    }

    pub fn first_of(&self, kind: MediaKind) -> Option<&TrackHandle> {
        self.tracks
            .values()
            .map(|t| &t.handle)
            .find(|h| h.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MediaSourceManager {
        MediaSourceManager::new(Box::new(VirtualDevices::new().without(MediaKind::Video)))
    }

    #[test]
    fn test_acquire_and_list() {
        let mut media = manager();
        let mic = media.acquire(MediaKind::Audio, &Constraints::default()).unwrap();

        assert_eq!(mic.label, "virtual audio");
        assert_eq!(media.tracks(), vec![mic.clone()]);
        assert_eq!(media.first_of(MediaKind::Audio), Some(&mic));
        assert!(media.is_enabled(mic.id));
    }

    #[test]
    fn test_missing_device_is_reported() {
        let mut media = manager();
        let err = media
            .acquire(MediaKind::Video, &Constraints::default())
            .unwrap_err();

        assert!(matches!(
            err,
            VoiceError::DeviceUnavailable {
                kind: MediaKind::Video,
                ..
            }
        ));
        assert!(media.tracks().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut media = manager();
        let mut events = media.subscribe();
        let mic = media.acquire(MediaKind::Audio, &Constraints::default()).unwrap();

        assert!(media.release(mic.id, &mut [], Instant::now()));
        assert!(!media.release(mic.id, &mut [], Instant::now()));

        assert!(matches!(events.try_recv(), Ok(MediaEvent::Acquired(_))));
        assert!(matches!(events.try_recv(), Ok(MediaEvent::Released { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_replace_requires_live_tracks() {
        let mut media = manager();
        let screen = media.acquire(MediaKind::Screen, &Constraints::default()).unwrap();
        let err = media
            .replace(TrackId::new(), &screen, &mut [], Instant::now())
            .unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
    }

    #[test]
    fn test_mute_toggles_enabled_flag() {
        let mut media = manager();
        let mic = media.acquire(MediaKind::Audio, &Constraints::default()).unwrap();

        assert!(media.set_enabled(mic.id, false));
        assert!(!media.is_enabled(mic.id));
        assert!(!media.set_enabled(TrackId::new(), false));
    }
}
