use std::{sync::Arc, time::Duration};

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use shared::protocol::{CameraFrame, ServerEvent};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    endpoint::Endpoint,
    socket_io::{self, Handshake, Packet, PacketError},
};

const EVENT_BUFFER: usize = 256;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff applied when the live channel drops or cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before the channel gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th reconnect (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

/// One Socket.IO connection to the collaborator, owned by a single screen.
///
/// Camera frames bypass the event queue: only the newest frame is kept in a
/// watch slot and older ones are overwritten. Every other event is fanned out
/// to subscribers. Dropping the channel closes the connection.
pub struct LiveChannel {
    events: broadcast::Sender<ServerEvent>,
    frames: watch::Receiver<Option<CameraFrame>>,
    status: Arc<watch::Sender<ChannelStatus>>,
    task: JoinHandle<()>,
}

impl LiveChannel {
    pub fn open(endpoint: &Endpoint, policy: ReconnectPolicy) -> Self {
        let url = endpoint.live_url();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (frame_tx, frames) = watch::channel(None);
        let status = Arc::new(watch::Sender::new(ChannelStatus::Connecting));

        let task = tokio::spawn(run_channel(
            url,
            policy,
            events.clone(),
            frame_tx,
            Arc::clone(&status),
        ));

        Self {
            events,
            frames,
            status,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn frames(&self) -> watch::Receiver<Option<CameraFrame>> {
        self.frames.clone()
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.task.abort();
        self.status.send_replace(ChannelStatus::Closed);
    }
}

async fn run_channel(
    url: Url,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ServerEvent>,
    frames: watch::Sender<Option<CameraFrame>>,
    status: Arc<watch::Sender<ChannelStatus>>,
) {
    let mut failures = 0u32;
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => match join_namespace(&mut stream).await {
                Ok(handshake) => {
                    failures = 0;
                    status.send_replace(ChannelStatus::Connected);
                    info!(%url, sid = %handshake.sid, "live channel connected");
                    pump_events(stream, handshake.liveness(), &events, &frames).await;
                    warn!(%url, "live channel disconnected");
                }
                Err(err) => {
                    warn!(%url, %err, "live channel handshake failed");
                }
            },
            Err(err) => {
                warn!(%url, %err, "live channel connect failed");
            }
        }

        failures += 1;
        if failures > policy.max_attempts {
            error!(%url, attempts = policy.max_attempts, "live channel giving up");
            status.send_replace(ChannelStatus::Closed);
            return;
        }
        let delay = policy.delay_for(failures);
        info!(%url, attempt = failures, ?delay, "live channel reconnecting");
        status.send_replace(ChannelStatus::Reconnecting { attempt: failures });
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Error)]
enum JoinError {
    #[error(transparent)]
    Transport(#[from] WsError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("namespace join refused: {0}")]
    Refused(String),
    #[error("no handshake within {0:?}")]
    TimedOut(Duration),
    #[error("server closed during handshake")]
    Closed,
}

/// Waits for the Engine.IO open packet, then joins the default namespace.
async fn join_namespace<S>(stream: &mut S) -> Result<Handshake, JoinError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut handshake = None;
    loop {
        let msg = timeout(HANDSHAKE_TIMEOUT, stream.next())
            .await
            .map_err(|_| JoinError::TimedOut(HANDSHAKE_TIMEOUT))?;
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Err(JoinError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        };
        match socket_io::decode(&text)? {
            Packet::Open(open) => {
                stream.send(Message::Text(socket_io::CONNECT.into())).await?;
                handshake = Some(open);
            }
            Packet::Ping => stream.send(Message::Text(socket_io::PONG.into())).await?,
            Packet::Connected => {
                if let Some(open) = handshake.take() {
                    return Ok(open);
                }
            }
            Packet::ConnectError(reason) => return Err(JoinError::Refused(reason)),
            Packet::Close | Packet::Disconnect => return Err(JoinError::Closed),
            _ => {}
        }
    }
}

async fn pump_events<S>(
    mut stream: S,
    liveness: Duration,
    events: &broadcast::Sender<ServerEvent>,
    frames: &watch::Sender<Option<CameraFrame>>,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let msg = match timeout(liveness, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(err))) => {
                warn!(%err, "live channel receive failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(?liveness, "live channel heartbeat missed");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match socket_io::decode(&text) {
            Ok(Packet::Ping) => {
                if let Err(err) = stream.send(Message::Text(socket_io::PONG.into())).await {
                    warn!(%err, "live channel pong failed");
                    break;
                }
            }
            Ok(Packet::Event { name, payload }) => dispatch(&name, payload, events, frames),
            Ok(Packet::ConnectError(reason)) => {
                warn!(%reason, "live channel namespace dropped");
                break;
            }
            Ok(Packet::Close | Packet::Disconnect) => break,
            Ok(_) => {}
            Err(err) => debug!(%err, "skipping malformed live packet"),
        }
    }
}

fn dispatch(
    name: &str,
    payload: Value,
    events: &broadcast::Sender<ServerEvent>,
    frames: &watch::Sender<Option<CameraFrame>>,
) {
    match ServerEvent::from_named(name, payload) {
        Ok(Some(ServerEvent::CameraFrame(frame))) => {
            frames.send_replace(Some(frame));
        }
        Ok(Some(event)) => {
            debug!(event = event.name(), "live event");
            let _ = events.send(event);
        }
        Ok(None) => debug!(event = name, "ignoring unhandled live event"),
        Err(err) => debug!(event = name, %err, "skipping malformed live event"),
    }
}

#[cfg(test)]
#[path = "tests/live_channel_tests.rs"]
mod tests;
