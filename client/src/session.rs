//! Tunnel session.
//!
//! Owns the relay connection lifecycle: handshake, message pumping,
//! reconnect on oversize close and graceful shutdown. State changes go
//! through [`ConnectionState::next`] so the policy can be exercised with an
//! in-memory [`Connector`].

use std::sync::Arc;
use std::time::Duration;

use dotunnel_shared::protocol::CLOSE_MESSAGE_TOO_BIG;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::TunnelError;
use crate::transport::{Connector, Transport};

/// Outbound frames buffered ahead of the writer
const OUTBOUND_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Rejected,
    Closed,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    Accepted,
    Conflict,
    HandshakeFailed,
    TooBig,
    Disconnected,
    Shutdown,
}

impl ConnectionState {
    /// Transition table. `None` means the event does not apply in this state.
    pub fn next(self, event: Event) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, event) {
            (Idle | Reconnecting, Event::Connect) => Some(Connecting),
            (Connecting, Event::Accepted) => Some(Open),
            (Connecting, Event::Conflict) => Some(Rejected),
            (Connecting, Event::HandshakeFailed) => Some(Closed),
            (Open, Event::TooBig) => Some(Reconnecting),
            (Open, Event::Disconnected) => Some(Closed),
            (Connecting | Open | Reconnecting, Event::Shutdown) => Some(Closed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Rejected | ConnectionState::Closed)
    }
}

/// How a session run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown request
    Shutdown,
    /// Relay closed the connection, with its close code if any
    Disconnected(Option<u16>),
}

/// Why one connection stopped being served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    TooBig,
    Remote(Option<u16>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub proxy_name: String,
    pub local_base: String,
    pub relay_url: String,
    pub public_url: String,
    pub reconnect_delay: Duration,
    pub shutdown_grace: Duration,
    pub debug: bool,
}

/// Requests a graceful shutdown. Safe to call any number of times.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

pub struct Session<C> {
    config: SessionConfig,
    connector: C,
    dispatcher: Arc<Dispatcher>,
    state: ConnectionState,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C: Connector> Session<C> {
    pub fn new(config: SessionConfig, connector: C, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            connector,
            dispatcher,
            state: ConnectionState::Idle,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Connect and serve until shutdown, a terminal close or a handshake
    /// error. `on_ready` receives (local base, public URL) on every
    /// successful handshake, including reconnects.
    pub async fn run<F>(&mut self, mut on_ready: F) -> Result<SessionEnd, TunnelError>
    where
        F: FnMut(&str, &str) + Send,
    {
        self.state = ConnectionState::Idle;
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            self.apply(Event::Connect);
            info!("Connecting to relay as '{}'", self.config.proxy_name);

            let attempt = tokio::select! {
                result = self.connector.connect(&self.config.relay_url) => Some(result),
                _ = shutdown_requested(&mut shutdown) => None,
            };

            let transport = match attempt {
                None => {
                    self.apply(Event::Shutdown);
                    return Ok(SessionEnd::Shutdown);
                }
                Some(Ok(transport)) => transport,
                Some(Err(TunnelError::NameInUse)) => {
                    self.apply(Event::Conflict);
                    return Err(TunnelError::NameInUse);
                }
                Some(Err(e)) => {
                    self.apply(Event::HandshakeFailed);
                    return Err(e);
                }
            };

            self.apply(Event::Accepted);
            on_ready(&self.config.local_base, &self.config.public_url);

            match self.serve(transport).await {
                CloseKind::TooBig => {
                    self.apply(Event::TooBig);
                    error!("Message too big. Please try to reduce the size of your requests.");
                    warn!("Reconnecting in {:?}...", self.config.reconnect_delay);

                    let interrupted = tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => false,
                        _ = shutdown_requested(&mut shutdown) => true,
                    };
                    if interrupted {
                        self.apply(Event::Shutdown);
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                CloseKind::Remote(code) => {
                    self.apply(Event::Disconnected);
                    return Ok(SessionEnd::Disconnected(code));
                }
                CloseKind::Shutdown => {
                    self.apply(Event::Shutdown);
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Pump one open connection until it closes
    async fn serve(&self, transport: Transport) -> CloseKind {
        let Transport { mut sink, mut stream } = transport;

        // Single writer: every outbound frame goes through this channel
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    warn!("Failed to send frame: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let mut shutdown = self.shutdown_rx.clone();
        let kind = loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutting down...");
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client-closed".into(),
                    }));
                    // Bounded even when the writer is stuck on a stalled relay
                    let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
                    if tokio::time::timeout_at(deadline, tx.send(close)).await.is_err() {
                        warn!("Close frame not queued within the grace period");
                    }
                    tokio::time::sleep_until(deadline).await;
                    break CloseKind::Shutdown;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.spawn_handler(text, tx.clone()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.spawn_handler(text, tx.clone()),
                        Err(_) => warn!("Skipping binary frame that is not UTF-8"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if tx.try_send(Message::Pong(data)).is_err() {
                            debug!("Outbound queue full, pong dropped");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break classify_close(frame),
                    Some(Ok(_)) => {}
                    Some(Err(WsError::Capacity(e))) => {
                        warn!("Inbound frame rejected: {}", e);
                        break CloseKind::TooBig;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break CloseKind::Remote(None);
                    }
                    None => break CloseKind::Remote(None),
                }
            }
        };

        writer.abort();
        kind
    }

    /// One task per inbound message; replies may complete in any order
    fn spawn_handler(&self, raw: String, tx: mpsc::Sender<Message>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            if let Some(frame) = dispatcher.handle_frame(&raw).await {
                if tx.send(Message::Text(frame)).await.is_err() {
                    debug!("Connection gone, response dropped");
                }
            }
        });
    }

    fn apply(&mut self, event: Event) {
        match self.state.next(event) {
            Some(next) => {
                if self.config.debug {
                    debug!(
                        "Connection state {:?} -> {:?} ({:?}){}",
                        self.state,
                        next,
                        event,
                        if next.is_terminal() { ", terminal" } else { "" }
                    );
                }
                self.state = next;
            }
            None => warn!("Ignoring {:?} in state {:?}", event, self.state),
        }
    }
}

fn classify_close(frame: Option<CloseFrame<'_>>) -> CloseKind {
    let Some(frame) = frame else {
        info!("Connection to the relay is closed");
        return CloseKind::Remote(None);
    };

    let code = u16::from(frame.code);
    info!("Connection to the relay is closed: {} - {}", code, frame.reason);
    if code == CLOSE_MESSAGE_TOO_BIG {
        CloseKind::TooBig
    } else {
        CloseKind::Remote(Some(code))
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    // The session keeps the sender alive, so an error here only happens on teardown
    let _ = rx.wait_for(|stop| *stop).await;
}
