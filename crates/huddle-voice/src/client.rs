//! The client runtime: one relay session, the local media, every call, and
//! at most one joined voice channel.
//!
//! [`VoiceClient`] is synchronous and clock-driven so it can be stepped in
//! tests; [`VoiceClient::run`] wraps it in the async loop an application
//! spawns next to its [`RelaySession`](crate::relay_client::RelaySession).

use crate::call::{CallEvent, CallInfo, CallManager};
use crate::engine::EngineFactory;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{Constraints, DeviceProvider, MediaKind, MediaSourceManager, TrackHandle};
use crate::mesh::{ChannelMesh, MeshEvent};
use crate::peer::PeerLink;
use crate::relay_client::{ReadyInfo, RelayEvent, RelayHandle};
use crate::speaking::SpeakingDetector;
use huddle_common::config::VoiceConfig;
use huddle_common::signal::IceServer;
use huddle_common::{CallId, CallType, ChannelId, Signal, TrackId, UserId, VoiceFlags};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Requests from the application to a running client.
#[derive(Debug)]
pub enum VoiceCommand {
    Invite {
        to: UserId,
        call_type: CallType,
        reply: oneshot::Sender<VoiceResult<CallId>>,
    },
    Accept {
        call_id: CallId,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Reject {
        call_id: CallId,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    End {
        call_id: CallId,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    JoinChannel {
        channel_id: ChannelId,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    LeaveChannel,
    SetMute(bool),
    SetDeafen(bool),
    ScreenShare {
        enabled: bool,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Camera {
        enabled: bool,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    SwitchDevice {
        kind: MediaKind,
        constraints: Constraints,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    /// Mono 48kHz microphone samples for speaking detection
    Microphone(Vec<i16>),
    Shutdown,
}

pub struct VoiceClient {
    relay: RelayHandle,
    engines: Arc<dyn EngineFactory>,
    config: VoiceConfig,
    media: MediaSourceManager,
    calls: CallManager,
    mesh: Option<ChannelMesh>,
    flags: VoiceFlags,
    speaking: SpeakingDetector,
    ice_servers: Vec<IceServer>,
    /// Screen track and whether it took the place of a camera
    screen: Option<(TrackId, bool)>,
    camera: Option<TrackId>,
}

impl VoiceClient {
    pub fn new(
        relay: RelayHandle,
        engines: Arc<dyn EngineFactory>,
        devices: Box<dyn DeviceProvider>,
        config: VoiceConfig,
    ) -> Self {
        let calls = CallManager::new(relay.clone(), engines.clone(), &config);
        Self {
            relay,
            engines,
            ice_servers: config.ice_servers(),
            config,
            media: MediaSourceManager::new(devices),
            calls,
            mesh: None,
            flags: VoiceFlags::default(),
            speaking: SpeakingDetector::new(),
            screen: None,
            camera: None,
        }
    }

    pub fn local_id(&self) -> &UserId {
        self.relay.local_id()
    }

    pub fn flags(&self) -> VoiceFlags {
        self.flags
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn mesh(&self) -> Option<&ChannelMesh> {
        self.mesh.as_ref()
    }

    pub fn media(&self) -> &MediaSourceManager {
        &self.media
    }

    pub fn subscribe_calls(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    /// Events of the joined channel. A new join starts a new stream.
    pub fn subscribe_mesh(&self) -> Option<broadcast::Receiver<MeshEvent>> {
        self.mesh.as_ref().map(|m| m.subscribe())
    }

    /// Route one relay signal to the call manager or the channel mesh.
    pub fn handle_signal(&mut self, signal: Signal, now: Instant) {
        match signal {
            Signal::Error { code, message } => {
                tracing::warn!(code, message = %message, "Relay reported an error");
            }
            Signal::PresenceOnline { user_id } => tracing::debug!(user = %user_id, "Presence online"),
            Signal::PresenceOffline { user_id } => tracing::debug!(user = %user_id, "Presence offline"),
            signal if signal.call_id().is_some() => {
                self.calls.handle_signal(signal, &mut self.media, now);
            }
            signal => {
                let kind = signal.kind();
                let handled = self
                    .mesh
                    .as_mut()
                    .is_some_and(|mesh| mesh.handle_signal(signal, now));
                if !handled {
                    tracing::debug!(kind = %kind, "Unrouted signal");
                }
            }
        }
    }

    /// Drive timers and every link.
    pub fn poll(&mut self, now: Instant) {
        self.calls.poll(&mut self.media, now);
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.poll(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let mesh = self.mesh.as_ref().and_then(|m| m.next_deadline());
        match (self.calls.next_deadline(), mesh) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn invite(&mut self, to: &UserId, call_type: CallType, now: Instant) -> VoiceResult<CallId> {
        self.calls.invite(to, call_type, &mut self.media, now)
    }

    pub fn accept(&mut self, call_id: CallId, now: Instant) -> VoiceResult<()> {
        self.calls.accept(call_id, &mut self.media, now)?;
        self.calls.set_flags(self.flags);
        Ok(())
    }

    pub fn reject(&mut self, call_id: CallId, now: Instant) -> VoiceResult<()> {
        self.calls.reject(call_id, &mut self.media, now)
    }

    pub fn end(&mut self, call_id: CallId, now: Instant) -> VoiceResult<()> {
        self.calls.end(call_id, &mut self.media, now)
    }

    pub fn call(&self, call_id: CallId) -> Option<CallInfo> {
        self.calls.session(call_id)
    }

    /// Join a voice channel, leaving the current one first.
    pub fn join_channel(&mut self, channel_id: ChannelId, now: Instant) -> VoiceResult<()> {
        if self.mesh.as_ref().is_some_and(|m| *m.channel_id() == channel_id) {
            return Err(VoiceError::InvalidState(format!(
                "already in channel {channel_id}"
            )));
        }
        self.leave_channel(now);

        let mut mesh = ChannelMesh::join(
            channel_id,
            self.relay.clone(),
            self.engines.clone(),
            &self.config,
            &mut self.media,
        )?;
        mesh.preset_flags(self.flags);
        if let Some(mic) = mesh.tracks().first().map(|t| t.id) {
            self.media.set_enabled(mic, !self.flags.self_mute);
        }
        self.mesh = Some(mesh);
        Ok(())
    }

    pub fn leave_channel(&mut self, now: Instant) {
        if let Some(mut mesh) = self.mesh.take() {
            mesh.leave(&mut self.media, now);
            self.flags.speaking = false;
            self.speaking.reset();
        }
    }

    /// Mute stops sending on every microphone without renegotiating.
    pub fn set_mute(&mut self, muted: bool) {
        for mic in self.media.tracks().iter().filter(|t| t.kind == MediaKind::Audio) {
            self.media.set_enabled(mic.id, !muted);
        }
        self.flags.self_mute = muted;
        if muted {
            self.flags.speaking = false;
        }
        self.announce();
    }

    /// Deafen only changes what is played back; it does not mute.
    pub fn set_deafen(&mut self, deafened: bool) {
        self.flags.self_deaf = deafened;
        self.announce();
    }

    /// Share the screen. An active camera is swapped out for it on every
    /// link; otherwise the screen is added as an extra track.
    pub fn start_screen_share(&mut self, now: Instant) -> VoiceResult<()> {
        if self.screen.is_some() {
            return Err(VoiceError::InvalidState("screen share already active".into()));
        }
        let screen = self.media.acquire(MediaKind::Screen, &Constraints::default())?;

        let camera = self.media.first_of(MediaKind::Video).map(|t| t.id);
        match camera {
            Some(camera) => {
                self.swap(camera, &screen, now)?;
                self.camera = None;
                self.flags.video = false;
            }
            None => self.broadcast_track(&screen, now),
        }
        self.screen = Some((screen.id, camera.is_some()));
        self.flags.screen_share = true;
        self.announce();
        Ok(())
    }

    /// Stop sharing. A camera that was replaced comes back on the same
    /// media line.
    pub fn stop_screen_share(&mut self, now: Instant) -> VoiceResult<()> {
        let Some((screen, replaced_camera)) = self.screen else {
            return Err(VoiceError::InvalidState("no active screen share".into()));
        };

        let restored = if replaced_camera {
            match self.media.acquire(MediaKind::Video, &Constraints::default()) {
                Ok(camera) => {
                    if let Err(e) = self.swap(screen, &camera, now) {
                        self.media.release(camera.id, &mut [], now);
                        return Err(e);
                    }
                    self.camera = Some(camera.id);
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Camera could not be restored after screen share");
                    false
                }
            }
        } else {
            false
        };
        if !restored {
            self.release_shared(screen, now);
        }

        self.screen = None;
        self.flags.screen_share = false;
        self.flags.video = restored;
        self.announce();
        Ok(())
    }

    /// Turn the camera on or off. In a video call the call's own camera is
    /// paused rather than released.
    pub fn set_camera(&mut self, enabled: bool, now: Instant) -> VoiceResult<()> {
        let cameras: Vec<TrackId> = self
            .media
            .tracks()
            .iter()
            .filter(|t| t.kind == MediaKind::Video)
            .map(|t| t.id)
            .collect();

        if enabled {
            if cameras.is_empty() {
                let camera = self.media.acquire(MediaKind::Video, &Constraints::default())?;
                self.broadcast_track(&camera, now);
                self.camera = Some(camera.id);
            } else {
                for id in cameras {
                    self.media.set_enabled(id, true);
                }
            }
        } else {
            match self.camera.take() {
                Some(camera) => self.release_shared(camera, now),
                None => {
                    for id in cameras {
                        self.media.set_enabled(id, false);
                    }
                }
            }
        }

        self.flags.video = enabled;
        self.announce();
        Ok(())
    }

    /// Switch the device behind every track of `kind`, keeping each link on
    /// its media line.
    pub fn switch_device(
        &mut self,
        kind: MediaKind,
        constraints: &Constraints,
        now: Instant,
    ) -> VoiceResult<()> {
        let Some(old) = self.media.first_of(kind).cloned() else {
            return Err(VoiceError::InvalidState(format!("no live {kind} track")));
        };
        let enabled = self.media.is_enabled(old.id);
        let new = self.media.acquire(kind, constraints)?;
        self.media.set_enabled(new.id, enabled);
        self.swap(old.id, &new, now)?;

        if self.camera == Some(old.id) {
            self.camera = Some(new.id);
        }
        if let Some((screen, _)) = self.screen.as_mut() {
            if *screen == old.id {
                *screen = new.id;
            }
        }
        Ok(())
    }

    /// Feed microphone samples. Speaking changes are announced; nothing is
    /// detected while muted.
    pub fn feed_microphone(&mut self, samples: &[i16]) {
        if self.flags.self_mute {
            return;
        }
        if let Some(speaking) = self.speaking.push_samples(samples) {
            self.flags.speaking = speaking;
            self.announce();
        }
    }

    /// The relay came back with a fresh session.
    pub fn on_relay_reconnected(&mut self, ready: ReadyInfo) {
        if !ready.ice_servers.is_empty() {
            self.ice_servers = ready.ice_servers;
        }
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.reannounce();
        }
    }

    /// End every call and leave the channel.
    pub fn shutdown(&mut self, now: Instant) {
        self.calls.end_all(&mut self.media, now);
        self.leave_channel(now);
        for track in self.media.tracks() {
            self.media.release(track.id, &mut [], now);
        }
        self.screen = None;
        self.camera = None;
    }

    /// Run until the relay gives up or the application sends
    /// [`VoiceCommand::Shutdown`].
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<RelayEvent>,
        mut commands: mpsc::Receiver<VoiceCommand>,
    ) {
        let mut ticker = tokio::time::interval(self.config.engine_poll());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self
                .next_deadline()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                event = events.recv() => match event {
                    Some(RelayEvent::Signal(signal)) => self.handle_signal(signal, now()),
                    Some(RelayEvent::Reconnecting { attempt }) => {
                        tracing::info!(attempt, "Relay reconnecting");
                    }
                    Some(RelayEvent::Reconnected(ready)) => self.on_relay_reconnected(ready),
                    Some(RelayEvent::Disconnected) | None => {
                        tracing::warn!("Relay session gone, stopping voice client");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(VoiceCommand::Shutdown) | None => break,
                    Some(command) => self.execute(command, now()),
                },
                _ = tokio::time::sleep_until(deadline) => self.poll(now()),
                _ = ticker.tick() => self.poll(now()),
            }
        }

        self.shutdown(now());
    }

    fn execute(&mut self, command: VoiceCommand, now: Instant) {
        match command {
            VoiceCommand::Invite { to, call_type, reply } => {
                let _ = reply.send(self.invite(&to, call_type, now));
            }
            VoiceCommand::Accept { call_id, reply } => {
                let _ = reply.send(self.accept(call_id, now));
            }
            VoiceCommand::Reject { call_id, reply } => {
                let _ = reply.send(self.reject(call_id, now));
            }
            VoiceCommand::End { call_id, reply } => {
                let _ = reply.send(self.end(call_id, now));
            }
            VoiceCommand::JoinChannel { channel_id, reply } => {
                let _ = reply.send(self.join_channel(channel_id, now));
            }
            VoiceCommand::LeaveChannel => self.leave_channel(now),
            VoiceCommand::SetMute(muted) => self.set_mute(muted),
            VoiceCommand::SetDeafen(deafened) => self.set_deafen(deafened),
            VoiceCommand::ScreenShare { enabled, reply } => {
                let result = if enabled {
                    self.start_screen_share(now)
                } else {
                    self.stop_screen_share(now)
                };
                let _ = reply.send(result);
            }
            VoiceCommand::Camera { enabled, reply } => {
                let _ = reply.send(self.set_camera(enabled, now));
            }
            VoiceCommand::SwitchDevice {
                kind,
                constraints,
                reply,
            } => {
                let _ = reply.send(self.switch_device(kind, &constraints, now));
            }
            VoiceCommand::Microphone(samples) => self.feed_microphone(&samples),
            VoiceCommand::Shutdown => {}
        }
    }

    fn announce(&mut self) {
        self.calls.set_flags(self.flags);
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.set_flags(self.flags);
        }
    }

    /// Send a new track on every call and the channel.
    fn broadcast_track(&mut self, track: &TrackHandle, now: Instant) {
        self.calls.add_track(track, now);
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.add_track(track.clone(), now);
        }
    }

    /// Replace `old` with `new` on every link; whoever owned `old` owns `new`.
    fn swap(&mut self, old: TrackId, new: &TrackHandle, now: Instant) -> VoiceResult<()> {
        let mut links: Vec<&mut PeerLink> = self
            .calls
            .links_mut()
            .chain(self.mesh.iter_mut().flat_map(|m| m.links_mut()))
            .collect();
        let switched = self.media.replace(old, new, &mut links, now)?;
        tracing::debug!(old = %old, new = %new.id, switched, "Track replaced");

        self.calls.retarget(old, new);
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.retarget(old, new);
        }
        Ok(())
    }

    /// Release a client-owned track from every link.
    fn release_shared(&mut self, id: TrackId, now: Instant) {
        let mut links: Vec<&mut PeerLink> = self
            .calls
            .links_mut()
            .chain(self.mesh.iter_mut().flat_map(|m| m.links_mut()))
            .collect();
        self.media.release(id, &mut links, now);
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.forget_track(id);
        }
    }
}

/// Current time on tokio's clock, so paused-time tests drive the timers.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackFactory;
    use crate::media::VirtualDevices;

    fn client(name: &str) -> (VoiceClient, mpsc::UnboundedReceiver<Signal>) {
        let (relay, rx) = RelayHandle::channel(name.into());
        let client = VoiceClient::new(
            relay,
            Arc::new(LoopbackFactory::new(name)),
            Box::new(VirtualDevices::new()),
            VoiceConfig::default(),
        );
        (client, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Signal>) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    #[test]
    fn test_mute_disables_microphone_and_announces() {
        let (mut alice, mut rx) = client("alice");
        let now = Instant::now();
        alice.join_channel("general".into(), now).unwrap();
        drain(&mut rx);

        alice.set_mute(true);
        let mic = alice.media().first_of(MediaKind::Audio).unwrap().id;
        assert!(!alice.media().is_enabled(mic));

        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [Signal::VoiceState { flags, to_id: None, .. }] if flags.self_mute
        ));
    }

    #[test]
    fn test_deafen_does_not_mute() {
        let (mut alice, _rx) = client("alice");
        alice.set_deafen(true);
        assert!(alice.flags().self_deaf);
        assert!(!alice.flags().self_mute);
    }

    #[test]
    fn test_join_same_channel_twice_fails() {
        let (mut alice, _rx) = client("alice");
        let now = Instant::now();
        alice.join_channel("general".into(), now).unwrap();
        assert!(matches!(
            alice.join_channel("general".into(), now),
            Err(VoiceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_switching_channels_leaves_the_old_one() {
        let (mut alice, mut rx) = client("alice");
        let now = Instant::now();
        alice.join_channel("general".into(), now).unwrap();
        drain(&mut rx);

        alice.join_channel("music".into(), now).unwrap();
        let sent = drain(&mut rx);
        assert!(matches!(
            &sent[0],
            Signal::ChannelLeave { channel_id, .. } if channel_id.as_str() == "general"
        ));
        assert!(matches!(
            &sent[1],
            Signal::ChannelJoin { channel_id, .. } if channel_id.as_str() == "music"
        ));
        assert_eq!(alice.media().tracks().len(), 1);
    }

    #[test]
    fn test_screen_share_round_trip_without_camera() {
        let (mut alice, _rx) = client("alice");
        let now = Instant::now();
        alice.join_channel("general".into(), now).unwrap();

        alice.start_screen_share(now).unwrap();
        assert!(alice.flags().screen_share);
        assert!(alice.media().first_of(MediaKind::Screen).is_some());
        assert!(alice.start_screen_share(now).is_err());

        alice.stop_screen_share(now).unwrap();
        assert!(!alice.flags().screen_share);
        assert!(alice.media().first_of(MediaKind::Screen).is_none());
        assert_eq!(alice.mesh().unwrap().tracks().len(), 1);
    }

    #[test]
    fn test_screen_share_takes_the_camera_slot() {
        let (mut alice, _rx) = client("alice");
        let now = Instant::now();
        alice.set_camera(true, now).unwrap();
        assert!(alice.flags().video);

        alice.start_screen_share(now).unwrap();
        assert!(alice.media().first_of(MediaKind::Video).is_none());
        assert!(!alice.flags().video);

        alice.stop_screen_share(now).unwrap();
        assert!(alice.media().first_of(MediaKind::Video).is_some());
        assert!(alice.media().first_of(MediaKind::Screen).is_none());
        assert!(alice.flags().video);
    }

    #[test]
    fn test_failed_camera_restore_keeps_screen_share() {
        let (mut alice, _rx) = client("alice");
        let now = Instant::now();
        alice.set_camera(true, now).unwrap();
        alice.start_screen_share(now).unwrap();

        // The screen track vanished underneath the client
        let screen = alice.media.first_of(MediaKind::Screen).unwrap().id;
        alice.media.release(screen, &mut [], now);

        assert!(alice.stop_screen_share(now).is_err());
        assert_eq!(alice.screen, Some((screen, true)));
        assert!(alice.flags().screen_share);
        assert!(alice.media().first_of(MediaKind::Video).is_none());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (mut alice, _rx) = client("alice");
        let now = Instant::now();
        alice.join_channel("general".into(), now).unwrap();
        alice.invite(&"bob".into(), CallType::Video, now).unwrap();
        alice.set_camera(true, now).unwrap();

        alice.shutdown(now);
        assert!(alice.media().tracks().is_empty());
        assert!(alice.mesh().is_none());
        assert!(alice.calls().active().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (alice, mut rx) = client("alice");
        let (_events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(8);
        let task = tokio::spawn(alice.run(events, commands));

        let (reply, answer) = oneshot::channel();
        commands_tx
            .send(VoiceCommand::JoinChannel {
                channel_id: "general".into(),
                reply,
            })
            .await
            .unwrap();
        answer.await.unwrap().unwrap();

        commands_tx.send(VoiceCommand::Shutdown).await.unwrap();
        task.await.unwrap();

        let sent = drain(&mut rx);
        assert!(matches!(sent.first(), Some(Signal::ChannelJoin { .. })));
        assert!(matches!(sent.last(), Some(Signal::ChannelLeave { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_ring_timeout() {
        let (alice, mut rx) = client("alice");
        let (_events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(8);
        let task = tokio::spawn(alice.run(events, commands));

        let (reply, answer) = oneshot::channel();
        commands_tx
            .send(VoiceCommand::Invite {
                to: "bob".into(),
                call_type: CallType::Voice,
                reply,
            })
            .await
            .unwrap();
        let call_id = answer.await.unwrap().unwrap();

        tokio::time::sleep(VoiceConfig::default().ring_timeout() + Duration::from_secs(1)).await;
        commands_tx.send(VoiceCommand::Shutdown).await.unwrap();
        task.await.unwrap();

        let ends = drain(&mut rx)
            .into_iter()
            .filter(|s| matches!(s, Signal::CallEnd { call_id: id, .. } if *id == call_id))
            .count();
        assert_eq!(ends, 1);
    }
}
