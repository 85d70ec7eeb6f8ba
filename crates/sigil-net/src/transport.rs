//! Relay connection task with a command/event channel pair.
//!
//! The socket lives in a dedicated tokio task. The application talks to it
//! through a [`TransportHandle`] and reads [`TransportEvent`]s off a bounded
//! receiver. Dropped connections are retried forever with exponential
//! backoff until [`TransportHandle::shutdown`] is called.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sigil_shared::constants::{
    BACKOFF_CEILING, BACKOFF_FLOOR, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL,
};
use sigil_shared::protocol::{ClientFrame, ServerEvent};
use sigil_shared::ConnectionState;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

// ---------------------------------------------------------------------------
// Command / event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the transport task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Write one frame on the open connection.
    Send(ClientFrame),
    /// Join a room now and on every reconnect.
    SubscribeRoom(String),
    /// Stop re-joining a room on reconnect.
    UnsubscribeRoom(String),
    /// Close the socket and stop reconnecting.
    Shutdown,
}

/// Notifications sent *from* the transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Subscribe handshake written; the connection is usable.
    Opened,
    /// A well-formed relay event.
    Event(ServerEvent),
    /// The connection dropped or could not be established.
    Closed { reason: String },
    /// Next attempt number and how long until it starts.
    ReconnectScheduled { attempt: u32, delay: Duration },
}

/// Configuration for spawning the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay WebSocket endpoint. `http(s)://` is accepted and rewritten.
    pub url: String,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".into(),
            backoff_floor: BACKOFF_FLOOR,
            backoff_ceiling: BACKOFF_CEILING,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            channel_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to the transport task.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<TransportCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Build a handle over caller-owned channels. Used to drive a session
    /// without a real socket.
    pub fn from_parts(
        cmd_tx: mpsc::Sender<TransportCommand>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            cmd_tx,
            state_rx,
            stop_tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Queue a frame for the open connection. Returns `false` without
    /// queueing when the connection is not open or the queue is full.
    pub fn send(&self, frame: ClientFrame) -> bool {
        if self.state() != ConnectionState::Open {
            debug!("transport not open, frame dropped");
            return false;
        }
        match self.cmd_tx.try_send(TransportCommand::Send(frame)) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "transport queue rejected frame");
                false
            }
        }
    }

    pub fn subscribe_room(&self, room_id: impl Into<String>) -> bool {
        self.cmd_tx
            .try_send(TransportCommand::SubscribeRoom(room_id.into()))
            .is_ok()
    }

    pub fn unsubscribe_room(&self, room_id: impl Into<String>) -> bool {
        self.cmd_tx
            .try_send(TransportCommand::UnsubscribeRoom(room_id.into()))
            .is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    ///
    /// The stop signal does not go through the command queue, so a full
    /// queue cannot swallow it.
    pub fn shutdown(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("transport shutdown requested");
        }
        let _ = self.cmd_tx.try_send(TransportCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Spawn the relay connection in a background tokio task.
///
/// `subscribe` is written first on every connection, before any queued
/// command. Must be called from within a tokio runtime.
pub fn spawn_transport(
    config: TransportConfig,
    subscribe: ClientFrame,
) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
    let capacity = config.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (stop_tx, stop_rx) = watch::channel(false);

    let handle = TransportHandle {
        cmd_tx,
        state_rx,
        stop_tx: Arc::new(stop_tx),
    };

    let task = TransportTask {
        url: ws::http_to_ws_scheme(&config.url),
        backoff: Backoff::new(config.backoff_floor, config.backoff_ceiling),
        config,
        subscribe,
        rooms: BTreeSet::new(),
        cmd_rx,
        event_tx,
        state_tx,
        stop_rx,
    };
    tokio::spawn(task.run());

    (handle, event_rx)
}

/// How a single connection ended.
enum Ended {
    Shutdown,
    Dropped(String),
}

struct TransportTask {
    url: String,
    config: TransportConfig,
    backoff: Backoff,
    subscribe: ClientFrame,
    rooms: BTreeSet<String>,
    cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    stop_rx: watch::Receiver<bool>,
}

impl TransportTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.is_stopped() {
                break;
            }
            let _ = self.state_tx.send(ConnectionState::Connecting);
            debug!(url = %self.url, attempt, "connecting to relay");

            let reason = match tokio::time::timeout(
                self.config.connect_timeout,
                ws::connect(&self.url),
            )
            .await
            {
                Ok(Ok((writer, reader))) => {
                    attempt = 0;
                    self.backoff.reset();
                    match self.drive(writer, reader).await {
                        Ended::Shutdown => break,
                        Ended::Dropped(reason) => reason,
                    }
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "connect timed out".to_string(),
            };

            let _ = self.state_tx.send(ConnectionState::Closed);
            warn!(reason = %reason, "relay connection closed");
            self.emit(TransportEvent::Closed { reason }).await;

            // Shutdown may have raced the drop; never schedule after it.
            if self.is_stopped() {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.next_delay();
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.emit(TransportEvent::ReconnectScheduled { attempt, delay })
                .await;

            if self.wait_for_retry(delay).await {
                break;
            }
        }

        let _ = self.state_tx.send(ConnectionState::Closed);
        info!("transport stopped");
    }

    /// Sleep out the backoff while still taking commands. Returns `true`
    /// when shutdown was requested.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                _ = self.stop_rx.wait_for(|stopped| *stopped) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Send(_)) => {
                        debug!("frame dropped while disconnected");
                    }
                    Some(TransportCommand::SubscribeRoom(room)) => {
                        self.rooms.insert(room);
                    }
                    Some(TransportCommand::UnsubscribeRoom(room)) => {
                        self.rooms.remove(&room);
                    }
                    Some(TransportCommand::Shutdown) | None => return true,
                },
            }
        }
    }

    async fn drive(&mut self, mut writer: WsWriter, mut reader: WsReader) -> Ended {
        let subscribe = match self.subscribe.to_json() {
            Ok(json) => json,
            Err(e) => return Ended::Dropped(format!("subscribe frame: {e}")),
        };
        if let Err(e) = writer.send_text(subscribe).await {
            return Ended::Dropped(format!("{e:#}"));
        }
        for room in self.rooms.clone() {
            if let Err(reason) = send_frame(&mut writer, &ClientFrame::SubscribeRoom { room_id: room }).await {
                return Ended::Dropped(reason);
            }
        }

        let _ = self.state_tx.send(ConnectionState::Open);
        info!(url = %self.url, "relay connection open");
        self.emit(TransportEvent::Opened).await;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(TransportCommand::Send(frame)) => {
                        if let Err(reason) = send_frame(&mut writer, &frame).await {
                            return Ended::Dropped(reason);
                        }
                    }
                    Some(TransportCommand::SubscribeRoom(room)) => {
                        if self.rooms.insert(room.clone()) {
                            let frame = ClientFrame::SubscribeRoom { room_id: room };
                            if let Err(reason) = send_frame(&mut writer, &frame).await {
                                return Ended::Dropped(reason);
                            }
                        }
                    }
                    Some(TransportCommand::UnsubscribeRoom(room)) => {
                        self.rooms.remove(&room);
                    }
                    Some(TransportCommand::Shutdown) | None => {
                        close(&mut writer).await;
                        return Ended::Shutdown;
                    }
                },

                _ = async { self.stop_rx.wait_for(|stopped| *stopped).await.map(|_| ()) } => {
                    close(&mut writer).await;
                    return Ended::Shutdown;
                }

                _ = heartbeat.tick() => {
                    if let Err(reason) = send_frame(&mut writer, &ClientFrame::Heartbeat {}).await {
                        return Ended::Dropped(reason);
                    }
                }

                msg = reader.recv() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => self.emit(TransportEvent::Event(event)).await,
                        Err(e) => warn!(error = %e, len = text.len(), "malformed relay frame dropped"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            return Ended::Dropped(format!("{e:#}"));
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Binary(data))) => {
                        debug!(len = data.len(), "binary relay frame ignored");
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        return Ended::Dropped(format!("closed by relay ({code}) {reason}"));
                    }
                    Some(Err(e)) => return Ended::Dropped(format!("{e:#}")),
                    None => return Ended::Dropped("stream ended".into()),
                },
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("transport event receiver dropped");
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

async fn close(writer: &mut WsWriter) {
    if let Err(e) = writer.close().await {
        debug!(error = %e, "close handshake failed");
    }
}

async fn send_frame(writer: &mut WsWriter, frame: &ClientFrame) -> Result<(), String> {
    let json = frame.to_json().map_err(|e| e.to_string())?;
    writer.send_text(json).await.map_err(|e| format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_parts_send_respects_state() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let handle = TransportHandle::from_parts(cmd_tx, state_rx);

        assert!(!handle.send(ClientFrame::Heartbeat {}));
        assert!(cmd_rx.try_recv().is_err());

        state_tx.send(ConnectionState::Open).unwrap();
        assert!(handle.send(ClientFrame::Heartbeat {}));
        assert!(matches!(
            cmd_rx.recv().await,
            Some(TransportCommand::Send(ClientFrame::Heartbeat {}))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let handle = TransportHandle::from_parts(cmd_tx, state_rx);

        handle.shutdown();
        handle.shutdown();
        assert!(matches!(cmd_rx.recv().await, Some(TransportCommand::Shutdown)));
    }
}
