//! Stream websocket client.
//!
//! A [`StreamClient`] owns one background worker that opens the transport,
//! sends the filter handshake and hands every inbound message to a
//! [`StreamHandler`] until the transport closes. There is no reconnect: once
//! closed, a new client has to be constructed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::stream::proto::{handshake_messages, STREAM_PATH};
use crate::stream::transport::{
    CloseReason, Connector, StreamMode, Transport, TransportEvent, WebSocketConnector,
};

/// Host used when options do not name one.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Upper bound for establishing the transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream server location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    host: String,
    port: Option<String>,
}

impl Endpoint {
    /// Builds an endpoint from a host and optional port.
    ///
    /// Blank ports are treated as absent. The host is kept as given and must
    /// not be blank.
    pub fn new(host: impl Into<String>, port: Option<String>) -> Result<Self, StreamClientError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(StreamClientError::InvalidEndpoint(
                "host must not be empty".to_string(),
            ));
        }
        let port = port
            .map(|port| port.trim().to_string())
            .filter(|port| !port.is_empty());
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Returns `host` or `host:port`.
    pub fn address(&self) -> String {
        match &self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// Returns the websocket URL of the stream path.
    pub fn url(&self) -> String {
        format!("ws://{}{STREAM_PATH}", self.address())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Connection options for [`StreamClient`].
///
/// Deserializable so it can be embedded in application config files; unset
/// fields keep their defaults.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamOptions {
    /// Stream server host.
    pub host: String,
    /// Optional port. Accepts a string or a number when deserialized.
    #[serde(deserialize_with = "deserialize_port")]
    pub port: Option<String>,
    /// Filters sent, in order, right after the connection opens.
    pub filters: Vec<String>,
    /// Connect timeout in milliseconds. `None` waits indefinitely.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            filters: Vec::new(),
            connect_timeout_ms: Some(duration_millis(DEFAULT_CONNECT_TIMEOUT)),
        }
    }
}

impl StreamOptions {
    /// Creates options for `host` with default port, filters and timeout.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Replaces the filter list.
    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout_ms = timeout.map(duration_millis);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Resolves the endpoint described by these options.
    pub fn endpoint(&self) -> Result<Endpoint, StreamClientError> {
        Endpoint::new(self.host.clone(), self.port.clone())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Text(String),
    Number(u16),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<PortValue>::deserialize(deserializer)?.map(|port| match port {
            PortValue::Text(text) => text,
            PortValue::Number(number) => number.to_string(),
        }),
    )
}

/// Transport connection state as seen by the client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Receives lifecycle callbacks from a [`StreamClient`].
///
/// All methods run on the client's worker task, one at a time and in
/// transport order. Panics are not caught and end the worker.
pub trait StreamHandler: Send + 'static {
    /// Called once per inbound message with the payload as received.
    fn on_message(&mut self, client: &StreamClient, payload: String);

    /// Called once the handshake has been sent.
    fn on_open(&mut self, client: &StreamClient);

    /// Called once when the connection is gone, whatever the cause.
    fn on_close(&mut self, client: &StreamClient);
}

/// [`StreamHandler`] assembled from three closures.
pub struct Callbacks<M, O, C> {
    on_message: M,
    on_open: O,
    on_close: C,
}

/// Builds a handler from message, open and close closures.
pub fn callbacks<M, O, C>(on_message: M, on_open: O, on_close: C) -> Callbacks<M, O, C>
where
    M: FnMut(&StreamClient, String) + Send + 'static,
    O: FnMut(&StreamClient) + Send + 'static,
    C: FnMut(&StreamClient) + Send + 'static,
{
    Callbacks {
        on_message,
        on_open,
        on_close,
    }
}

impl<M, O, C> StreamHandler for Callbacks<M, O, C>
where
    M: FnMut(&StreamClient, String) + Send + 'static,
    O: FnMut(&StreamClient) + Send + 'static,
    C: FnMut(&StreamClient) + Send + 'static,
{
    fn on_message(&mut self, client: &StreamClient, payload: String) {
        (self.on_message)(client, payload)
    }

    fn on_open(&mut self, client: &StreamClient) {
        (self.on_open)(client)
    }

    fn on_close(&mut self, client: &StreamClient) {
        (self.on_close)(client)
    }
}

/// Errors produced when constructing a stream client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// No usable transport in this environment. Terminal for the attempt.
    #[error("websocket not supported: {0}")]
    Unsupported(String),

    /// Endpoint options could not be resolved.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Reports the transport mode `connector` would run in.
///
/// Returns [`StreamMode::NotSupported`] when the connector itself is not
/// supported or no Tokio runtime is available to drive it.
pub fn detect_mode<C: Connector>(connector: &C) -> StreamMode {
    if Handle::try_current().is_err() {
        return StreamMode::NotSupported;
    }
    connector.mode()
}

#[derive(Debug)]
enum Command {
    Close,
}

/// Handle to one streaming connection.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone, Debug)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    endpoint: Endpoint,
    url: String,
    filters: Vec<String>,
    mode: StreamMode,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl StreamClient {
    /// Connects over websocket.
    ///
    /// See [`StreamClient::connect_with`].
    pub fn connect<H: StreamHandler>(
        options: StreamOptions,
        handler: H,
    ) -> Result<Self, StreamClientError> {
        Self::connect_with(options, WebSocketConnector, handler)
    }

    /// Starts a connection through `connector` and returns immediately.
    ///
    /// The client starts out disconnected while a worker task on the current
    /// Tokio runtime opens the transport. Progress is reported through
    /// `handler`. Fails without any connection attempt when the transport is
    /// not supported.
    pub fn connect_with<C, H>(
        options: StreamOptions,
        connector: C,
        handler: H,
    ) -> Result<Self, StreamClientError>
    where
        C: Connector,
        H: StreamHandler,
    {
        let endpoint = options.endpoint()?;
        let mode = detect_mode(&connector);
        let runtime = match (mode.is_supported(), Handle::try_current()) {
            (true, Ok(runtime)) => runtime,
            (_, runtime) => {
                let reason = if runtime.is_ok() || !mode.is_supported() {
                    "transport unavailable"
                } else {
                    "no tokio runtime available"
                };
                warn!(
                    event = "stream_unsupported",
                    address = %endpoint,
                    mode = mode.label(),
                    reason
                );
                return Err(StreamClientError::Unsupported(reason.to_string()));
            }
        };

        let url = endpoint.url();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let client = Self {
            inner: Arc::new(ClientInner {
                endpoint,
                url,
                filters: options.filters.clone(),
                mode,
                state: state_tx,
                commands: command_tx,
            }),
        };

        debug!(
            event = "stream_connecting",
            host = client.endpoint().host(),
            url = %client.url(),
            filters = client.filters().len()
        );
        runtime.spawn(stream_worker(
            client.clone(),
            connector,
            handler,
            command_rx,
            options.connect_timeout(),
        ));

        Ok(client)
    }

    pub fn mode(&self) -> StreamMode {
        self.inner.mode
    }

    /// Human-readable transport mode, e.g. `"WebSocket"`.
    pub fn mode_label(&self) -> &'static str {
        self.inner.mode.label()
    }

    /// Filters sent during the handshake, in send order.
    pub fn filters(&self) -> &[String] {
        &self.inner.filters
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Returns `host` or `host:port`.
    pub fn address(&self) -> String {
        self.inner.endpoint.address()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Asks the worker to close the connection.
    ///
    /// The handler still receives `on_close`. Calling this on a closed client
    /// does nothing.
    pub fn close(&self) {
        if self.inner.commands.send(Command::Close).is_err() {
            debug!(event = "stream_close_ignored", url = %self.url());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }
}

async fn stream_worker<C, H>(
    client: StreamClient,
    connector: C,
    mut handler: H,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connect_timeout: Option<Duration>,
) where
    C: Connector,
    H: StreamHandler,
{
    let reason = run_stream_session(
        &client,
        &connector,
        &mut handler,
        &mut commands,
        connect_timeout,
    )
    .await;

    client.set_state(ConnectionState::Disconnected);
    debug!(event = "stream_closed", url = %client.url(), reason = %reason);
    handler.on_close(&client);
}

async fn run_stream_session<C, H>(
    client: &StreamClient,
    connector: &C,
    handler: &mut H,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    connect_timeout: Option<Duration>,
) -> CloseReason
where
    C: Connector,
    H: StreamHandler,
{
    let mut transport = tokio::select! {
        opened = open_transport(connector, client.url(), connect_timeout) => match opened {
            Ok(transport) => transport,
            Err(reason) => {
                warn!(event = "stream_connect_failed", url = %client.url(), reason = %reason);
                return reason;
            }
        },
        _ = commands.recv() => return CloseReason::Local,
    };

    client.set_state(ConnectionState::Connected);
    for message in handshake_messages(client.filters()) {
        if let Err(err) = transport.send(message).await {
            transport.close().await;
            return CloseReason::Error(err.to_string());
        }
    }
    debug!(
        event = "stream_handshake_sent",
        url = %client.url(),
        filters = client.filters().len()
    );
    handler.on_open(client);

    loop {
        tokio::select! {
            _ = commands.recv() => {
                transport.close().await;
                return CloseReason::Local;
            }
            event = transport.recv() => match event {
                TransportEvent::Message(payload) => handler.on_message(client, payload),
                TransportEvent::Closed(reason) => return reason,
            }
        }
    }
}

async fn open_transport<C: Connector>(
    connector: &C,
    url: &str,
    connect_timeout: Option<Duration>,
) -> Result<C::Transport, CloseReason> {
    let connecting = connector.connect(url);
    let opened = match connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, connecting).await {
            Ok(opened) => opened,
            Err(_) => {
                return Err(CloseReason::Error(format!(
                    "connect timed out after {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => connecting.await,
    };
    opened.map_err(|err| CloseReason::Error(err.to_string()))
}
