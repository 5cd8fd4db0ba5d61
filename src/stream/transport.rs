//! Transport seam used by the stream client.
//!
//! A [`Connector`] reports whether it can run in the current environment and
//! opens [`Transport`]s. The production implementation is a websocket over
//! tokio-tungstenite; tests plug in in-memory transports.

use std::fmt;
use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Capability mode of a stream transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamMode {
    /// Native websocket transport is available.
    WebSocket,
    /// No usable transport in this environment.
    NotSupported,
}

impl StreamMode {
    /// Human-readable mode label.
    pub fn label(self) -> &'static str {
        match self {
            StreamMode::WebSocket => "WebSocket",
            StreamMode::NotSupported => "NotSupported",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, StreamMode::WebSocket)
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inbound transport activity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// One complete inbound message.
    Message(String),
    /// The transport is gone; no further events follow.
    Closed(CloseReason),
}

/// Why a transport stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// Peer sent a close frame.
    Remote { code: Option<u16>, reason: String },
    /// Stream ended without a close frame.
    Ended,
    /// Transport failure.
    Error(String),
    /// Close was requested by this side.
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote {
                code: Some(code),
                reason,
            } => write!(f, "closed by peer ({code}) {reason}"),
            CloseReason::Remote { code: None, reason } => write!(f, "closed by peer {reason}"),
            CloseReason::Ended => f.write_str("stream ended"),
            CloseReason::Error(err) => write!(f, "transport error: {err}"),
            CloseReason::Local => f.write_str("closed locally"),
        }
    }
}

/// Errors produced while opening or writing to a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Transport contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Opens transports for a stream URL.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Reports whether this connector can run in the current environment.
    fn mode(&self) -> StreamMode;

    /// Opens a transport to `url`. Resolves once the transport is open.
    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// An open, full-duplex, message-oriented connection.
pub trait Transport: Send + 'static {
    /// Sends one complete text message.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next inbound event.
    ///
    /// After [`TransportEvent::Closed`] has been returned the transport must
    /// not be polled again.
    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Closes the transport, ignoring failures.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Websocket connector backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    fn mode(&self) -> StreamMode {
        StreamMode::WebSocket
    }

    async fn connect(&self, url: &str) -> Result<WebSocketTransport, TransportError> {
        let (socket, _) = connect_async(url).await?;
        Ok(WebSocketTransport { socket })
    }
}

/// Open websocket connection.
pub struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WebSocketTransport {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.socket.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(err) => {
                        debug!(
                            event = "binary_frame_dropped",
                            len = err.as_bytes().len()
                        );
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        return TransportEvent::Closed(CloseReason::Error(err.to_string()));
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => CloseReason::Remote {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => CloseReason::Remote {
                            code: None,
                            reason: String::new(),
                        },
                    };
                    return TransportEvent::Closed(reason);
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => {
                    return TransportEvent::Closed(CloseReason::Error(err.to_string()));
                }
                None => return TransportEvent::Closed(CloseReason::Ended),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.close(None).await {
            debug!(event = "websocket_close_failed", error = %err);
        }
    }
}
