//! Duplex byte transport to the instrument server.
//!
//! The only implementation is [`WebSocketTransport`]. It reconnects on its own
//! when the server drops the connection while we are receiving. Frames sent
//! during a reconnect are dropped rather than delivered late.

use std::{
    fmt::Display,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default TCP port of the instrument server.
pub const DEFAULT_PORT: u16 = 4649;
/// Default WebSocket service path of the instrument server.
pub const DEFAULT_SERVICE: &str = "SWSS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Receiving,
    Sending,
    Reconnecting,
}

impl ConnectionState {
    /// `true` for every state in which frames can flow.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Receiving | Self::Sending)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Disconnected => "disconnected",
                Self::Connected => "connected",
                Self::Receiving => "receiving",
                Self::Sending => "sending",
                Self::Reconnecting => "reconnecting",
            }
        )
    }
}

/// A reconnecting duplex channel carrying whole frames.
///
/// All methods take `&self` so that one task can wait in [`Transport::receive`]
/// while others send.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address`, or to the local host if `None`.
    ///
    /// Returns `Ok(false)` if the server refused the connection, or if the
    /// transport is neither disconnected nor reconnecting.
    async fn connect(&self, address: Option<String>) -> Result<bool, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    fn state(&self) -> ConnectionState;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub port: u16,
    pub service: String,
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt. Attempt `n` waits `n` times
    /// this long.
    pub reconnect_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service: DEFAULT_SERVICE.to_string(),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

impl TransportConfig {
    /// Build the server URI. A full `ws://` URI is used as given.
    #[must_use]
    pub fn uri(&self, address: Option<&str>) -> String {
        match address {
            Some(a) if a.starts_with("ws://") || a.starts_with("wss://") => a.to_string(),
            Some(a) => format!("ws://{a}:{}/{}", self.port, self.service),
            None => format!("ws://localhost:{}/{}", self.port, self.service),
        }
    }
}

pub struct WebSocketTransport {
    config: TransportConfig,
    state: Mutex<ConnectionState>,
    uri: Mutex<Option<String>>,
    sink: tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: tokio::sync::Mutex<Option<SplitStream<WsStream>>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl WebSocketTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            uri: Mutex::new(None),
            sink: tokio::sync::Mutex::new(None),
            stream: tokio::sync::Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            trace!("transport state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Mark send/receive activity. Only applies while the connection is open.
    fn mark_activity(&self, activity: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_open() {
            *current = activity;
        }
    }

    fn clear_activity(&self, activity: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == activity {
            *current = ConnectionState::Connected;
        }
    }

    /// Open a fresh connection to `uri`, replacing any previous one.
    async fn open(&self, uri: &str) -> Result<bool, TransportError> {
        match connect_async(uri).await {
            Ok((ws, _response)) => {
                let (sink, stream) = ws.split();
                *self.sink.lock().await = Some(sink);
                *self.stream.lock().await = Some(stream);
                self.set_state(ConnectionState::Connected);
                info!("Connected to {uri}");
                Ok(true)
            }
            Err(tungstenite::Error::Url(e)) => Err(TransportError::InvalidAddress {
                address: format!("{uri}: {e}"),
            }),
            Err(e) => {
                warn!("Connection to {uri} failed: {e}");
                Ok(false)
            }
        }
    }

    /// Retry the last URI with linear backoff.
    #[instrument(skip(self))]
    async fn reconnect(&self) -> Result<(), TransportError> {
        let uri = self
            .uri
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::InvalidState {
                operation: "reconnect",
                state: self.state(),
            })?;
        let attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.reconnect_backoff.saturating_mul(attempt)).await;
            if self.state() == ConnectionState::Disconnected {
                return Err(TransportError::InvalidState {
                    operation: "reconnect",
                    state: ConnectionState::Disconnected,
                });
            }
            info!("Reconnection attempt {attempt}/{attempts} to {uri}");
            if self.open(&uri).await? {
                return Ok(());
            }
        }

        self.set_state(ConnectionState::Disconnected);
        *self.sink.lock().await = None;
        Err(TransportError::Disconnection { attempts })
    }

    /// The connection dropped under us. Decide whether to recover.
    fn connection_lost(&self, reason: &str) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            // closed locally, nothing to recover
            return Err(TransportError::InvalidState {
                operation: "receive",
                state: ConnectionState::Disconnected,
            });
        }
        warn!("Connection lost ({reason}), reconnecting");
        self.set_state(ConnectionState::Reconnecting);
        Ok(())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    #[instrument(skip(self))]
    async fn connect(&self, address: Option<String>) -> Result<bool, TransportError> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        ) {
            warn!("connect requested while {state}, ignoring");
            return Ok(false);
        }
        let uri = self.config.uri(address.as_deref());
        *self.uri.lock().unwrap_or_else(PoisonError::into_inner) = Some(uri.clone());
        self.open(&uri).await
    }

    #[instrument(skip(self))]
    async fn disconnect(&self) -> Result<(), TransportError> {
        let state = self.state();
        if state == ConnectionState::Disconnected {
            return Err(TransportError::InvalidState {
                operation: "disconnect",
                state,
            });
        }
        self.set_state(ConnectionState::Disconnected);

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("error closing websocket: {e}");
            }
        }
        // A listener may still be parked on the stream. It notices the
        // disconnected state as soon as the close handshake finishes.
        if let Ok(mut stream) = self.stream.try_lock() {
            *stream = None;
        }
        info!("Disconnected");
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let state = self.state();
        match state {
            ConnectionState::Disconnected => {
                return Err(TransportError::InvalidState {
                    operation: "send",
                    state,
                })
            }
            ConnectionState::Reconnecting => {
                warn!("Dropping {} byte frame while reconnecting", frame.len());
                return Ok(());
            }
            _ => {}
        }

        self.mark_activity(ConnectionState::Sending);
        let result = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(Message::Binary(frame)).await,
                None => Err(tungstenite::Error::AlreadyClosed),
            }
        };
        self.clear_activity(ConnectionState::Sending);

        result.map_err(|e| {
            if self.state().is_open() {
                self.set_state(ConnectionState::Reconnecting);
            }
            e.into()
        })
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            let state = self.state();
            match state {
                ConnectionState::Disconnected => {
                    return Err(TransportError::InvalidState {
                        operation: "receive",
                        state,
                    })
                }
                ConnectionState::Reconnecting => {
                    self.reconnect().await?;
                    continue;
                }
                _ => {}
            }

            self.mark_activity(ConnectionState::Receiving);
            let next = {
                let mut stream = self.stream.lock().await;
                match stream.as_mut() {
                    Some(stream) => stream.next().await,
                    None => None,
                }
            };
            self.clear_activity(ConnectionState::Receiving);

            match next {
                Some(Ok(Message::Binary(frame))) => return Ok(frame),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map_or_else(
                        || "closed by peer".to_string(),
                        |f| format!("closed by peer: {} {}", f.code, f.reason),
                    );
                    self.connection_lost(&reason)?;
                }
                Some(Err(e)) => self.connection_lost(&e.to_string())?,
                None => self.connection_lost("stream ended")?,
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod unit {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::{ConnectionState, Transport, TransportConfig, WebSocketTransport};
    use crate::error::TransportError;

    #[test]
    fn uri_uses_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.uri(Some("172.18.160.1")), "ws://172.18.160.1:4649/SWSS");
        assert_eq!(config.uri(None), "ws://localhost:4649/SWSS");
        assert_eq!(config.uri(Some("ws://127.0.0.1:9000/x")), "ws://127.0.0.1:9000/x");
    }

    #[tokio::test]
    async fn send_and_receive_require_a_connection() {
        let transport = WebSocketTransport::default();
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        assert_matches!(
            transport.send(vec![0]).await,
            Err(TransportError::InvalidState { operation: "send", .. })
        );
        assert_matches!(
            transport.receive().await,
            Err(TransportError::InvalidState { operation: "receive", .. })
        );
        assert_matches!(
            transport.disconnect().await,
            Err(TransportError::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn refused_connection_returns_false() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
        let port = listener.local_addr().expect("should have address").port();
        drop(listener);

        let transport = WebSocketTransport::new(TransportConfig {
            port,
            reconnect_backoff: Duration::from_millis(1),
            ..TransportConfig::default()
        });
        let connected = transport
            .connect(Some("127.0.0.1".to_string()))
            .await
            .expect("refusal is not an error");
        assert!(!connected);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
