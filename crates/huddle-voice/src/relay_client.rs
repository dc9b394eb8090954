//! WebSocket transport to the signaling relay.
//!
//! [`RelayClient::connect`] identifies, waits for `ready`, then spawns a
//! background task that owns the socket: it writes queued signals, sends
//! heartbeats, forwards inbound signals as [`RelayEvent`]s, and reconnects
//! with exponential backoff when the connection drops.
//!
//! Delivery is at most once. Signals queued while the connection is down are
//! dropped rather than replayed into a session the remote side may already
//! have abandoned.

use crate::error::{VoiceError, VoiceResult};
use futures_util::{SinkExt, StreamExt};
use huddle_common::signal::IceServer;
use huddle_common::{ConnectionId, Signal, UserId};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cheap, cloneable sending half of the relay connection.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    local: UserId,
    tx: mpsc::UnboundedSender<Signal>,
}

impl RelayHandle {
    pub fn new(local: UserId, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { local, tx }
    }

    /// A handle whose signals land in the returned receiver.
    pub fn channel(local: UserId) -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(local, tx), rx)
    }

    /// The authenticated local user.
    pub fn local_id(&self) -> &UserId {
        &self.local
    }

    pub fn send(&self, signal: Signal) -> VoiceResult<()> {
        self.tx.send(signal).map_err(|_| VoiceError::RelayClosed)
    }
}

/// Contents of the relay's `ready` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyInfo {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub heartbeat_interval: Duration,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug)]
pub enum RelayEvent {
    Signal(Signal),
    Reconnecting { attempt: u32 },
    /// A fresh session after a drop. Channel membership must be re-announced.
    Reconnected(ReadyInfo),
    /// Reconnect attempts exhausted.
    Disconnected,
}

pub struct RelayClient {
    url: String,
    token: String,
    max_reconnect: u32,
}

/// A live relay session: send through `handle`, receive from `events`.
pub struct RelaySession {
    pub handle: RelayHandle,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
    pub ready: ReadyInfo,
    pub task: JoinHandle<()>,
}

enum PumpEnd {
    /// Every handle or the event receiver was dropped
    OwnerGone,
    RemoteClosed,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            max_reconnect: 10,
        }
    }

    pub fn with_max_reconnect(mut self, attempts: u32) -> Self {
        self.max_reconnect = attempts;
        self
    }

    /// Connect and identify. Returns once the relay has sent `ready`; a
    /// refused token surfaces as [`VoiceError::Rejected`].
    pub async fn connect(self) -> VoiceResult<RelaySession> {
        let (socket, ready) = open(&self.url, &self.token).await?;
        tracing::info!(
            user_id = %ready.user_id,
            connection_id = %ready.connection_id,
            "Relay session ready"
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let handle = RelayHandle::new(ready.user_id.clone(), out_tx);
        let task = tokio::spawn(self.maintain(socket, ready.clone(), out_rx, ev_tx));

        Ok(RelaySession {
            handle,
            events: ev_rx,
            ready,
            task,
        })
    }

    async fn maintain(
        self,
        mut socket: Socket,
        mut ready: ReadyInfo,
        mut outbound: mpsc::UnboundedReceiver<Signal>,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) {
        loop {
            match pump(&mut socket, ready.heartbeat_interval, &mut outbound, &events).await {
                Ok(PumpEnd::OwnerGone) => {
                    let _ = socket.close(None).await;
                    tracing::debug!("Relay session closed by owner");
                    return;
                }
                Ok(PumpEnd::RemoteClosed) => tracing::warn!("Relay closed the connection"),
                Err(e) => tracing::warn!(error = %e, "Relay connection lost"),
            }

            let mut dropped = 0usize;
            while outbound.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                tracing::debug!(dropped, "Discarded signals queued before disconnect");
            }

            let mut attempts = 0u32;
            loop {
                attempts += 1;
                if attempts > self.max_reconnect {
                    tracing::error!(attempts = self.max_reconnect, "Relay: max reconnect attempts reached");
                    let _ = events.send(RelayEvent::Disconnected);
                    return;
                }
                let delay = Duration::from_secs(u64::min(2u64.saturating_pow(attempts), 30));
                tracing::warn!(attempt = attempts, delay = ?delay, "Relay: reconnecting");
                if events.send(RelayEvent::Reconnecting { attempt: attempts }).is_err() {
                    return;
                }
                sleep(delay).await;

                match open(&self.url, &self.token).await {
                    Ok((fresh, info)) => {
                        tracing::info!(connection_id = %info.connection_id, "Relay: reconnected");
                        socket = fresh;
                        ready = info;
                        if events.send(RelayEvent::Reconnected(ready.clone())).is_err() {
                            return;
                        }
                        break;
                    }
                    Err(VoiceError::Rejected { code, message }) => {
                        tracing::error!(code, message = %message, "Relay refused reconnect");
                        let _ = events.send(RelayEvent::Disconnected);
                        return;
                    }
                    Err(e) => tracing::warn!(attempt = attempts, error = %e, "Relay: reconnect failed"),
                }
            }
        }
    }
}

/// Connect, identify, and wait for `ready`.
async fn open(url: &str, token: &str) -> VoiceResult<(Socket, ReadyInfo)> {
    let (mut socket, _) = connect_async(url).await?;
    let identify = Signal::Identify {
        token: token.to_owned(),
    };
    socket
        .send(Message::text(serde_json::to_string(&identify)?))
        .await?;

    let ready = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_ready(&mut socket))
        .await
        .map_err(|_| VoiceError::RelayClosed)??;

    Ok((socket, ready))
}

async fn await_ready(socket: &mut Socket) -> VoiceResult<ReadyInfo> {
    while let Some(frame) = socket.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<Signal>(text.as_str())? {
            Signal::Ready {
                user_id,
                connection_id,
                heartbeat_interval_ms,
                ice_servers,
            } => {
                return Ok(ReadyInfo {
                    user_id,
                    connection_id,
                    heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
                    ice_servers,
                });
            }
            Signal::Error { code, message } => return Err(VoiceError::Rejected { code, message }),
            other => tracing::debug!(kind = %other.kind(), "Ignoring frame before ready"),
        }
    }
    Err(VoiceError::RelayClosed)
}

/// Run one connection until it drops or the owner goes away.
async fn pump(
    socket: &mut Socket,
    heartbeat: Duration,
    outbound: &mut mpsc::UnboundedReceiver<Signal>,
    events: &mpsc::UnboundedSender<RelayEvent>,
) -> VoiceResult<PumpEnd> {
    let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = socket.next() => {
                let Some(frame) = frame else {
                    return Ok(PumpEnd::RemoteClosed);
                };
                match frame? {
                    Message::Text(text) => match serde_json::from_str::<Signal>(text.as_str()) {
                        Ok(Signal::HeartbeatAck { .. }) => tracing::trace!("Relay heartbeat ack"),
                        Ok(signal) => {
                            if events.send(RelayEvent::Signal(signal)).is_err() {
                                return Ok(PumpEnd::OwnerGone);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Unparseable relay frame"),
                    },
                    Message::Close(_) => return Ok(PumpEnd::RemoteClosed),
                    _ => {}
                }
            }
            signal = outbound.recv() => {
                let Some(signal) = signal else {
                    return Ok(PumpEnd::OwnerGone);
                };
                tracing::debug!(kind = %signal.kind(), "Relay send");
                socket.send(Message::text(serde_json::to_string(&signal)?)).await?;
            }
            _ = ticker.tick() => {
                let heartbeat = Signal::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                socket.send(Message::text(serde_json::to_string(&heartbeat)?)).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_reports_closed_relay() {
        let (handle, rx) = RelayHandle::channel("alice".into());
        assert_eq!(handle.local_id(), &UserId::from("alice"));
        drop(rx);

        let err = handle
            .send(Signal::Heartbeat { timestamp: 0 })
            .unwrap_err();
        assert!(matches!(err, VoiceError::RelayClosed));
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let result = RelayClient::new("ws://127.0.0.1:1/relay", "token")
            .connect()
            .await;
        assert!(matches!(result, Err(VoiceError::WebSocket(_))));
    }
}
