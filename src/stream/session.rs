//! Higher-level stream session yielding decoded events.
//!
//! `StreamSession` drives a [`StreamClient`] with a channel-backed handler so
//! callers can `await` events instead of supplying callbacks. Payloads are
//! decoded with [`parse_event`]; payloads that fail to decode produce no
//! event.

use tokio::sync::mpsc;

use crate::stream::client::{StreamClient, StreamClientError, StreamHandler, StreamOptions};
use crate::stream::proto::{parse_event, EventHeaders, ServerEvent};
use crate::stream::transport::{Connector, WebSocketConnector};

/// Session-level event emitted by [`StreamSession::recv`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Handshake sent; the stream is live.
    Opened,
    /// Server keepalive.
    Ping,
    /// Decoded stream event.
    Event(EventHeaders),
    /// Connection is gone. Always the last event.
    Closed,
}

struct ChannelHandler {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StreamHandler for ChannelHandler {
    fn on_message(&mut self, _client: &StreamClient, payload: String) {
        let event = match parse_event(&payload) {
            Some(ServerEvent::Ping) => SessionEvent::Ping,
            Some(ServerEvent::Event(headers)) => SessionEvent::Event(headers),
            None => return,
        };
        let _ = self.events.send(event);
    }

    fn on_open(&mut self, _client: &StreamClient) {
        let _ = self.events.send(SessionEvent::Opened);
    }

    fn on_close(&mut self, _client: &StreamClient) {
        let _ = self.events.send(SessionEvent::Closed);
    }
}

/// Stream connection consumed as an event queue.
///
/// Dropping the session closes the connection.
#[derive(Debug)]
pub struct StreamSession {
    client: StreamClient,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl StreamSession {
    /// Connects a websocket session.
    pub fn connect(options: StreamOptions) -> Result<Self, StreamClientError> {
        Self::connect_with(options, WebSocketConnector)
    }

    /// Connects a session through `connector`.
    pub fn connect_with<C: Connector>(
        options: StreamOptions,
        connector: C,
    ) -> Result<Self, StreamClientError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = StreamClient::connect_with(
            options,
            connector,
            ChannelHandler { events: events_tx },
        )?;
        Ok(Self {
            client,
            events: events_rx,
        })
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    /// Receives the next session event.
    ///
    /// Returns `None` once [`SessionEvent::Closed`] has been delivered.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Waits for the next decoded event, skipping open and keepalive
    /// notifications. Returns `None` when the connection closes.
    pub async fn next_event(&mut self) -> Option<EventHeaders> {
        loop {
            match self.recv().await? {
                SessionEvent::Event(headers) => return Some(headers),
                SessionEvent::Opened | SessionEvent::Ping => {}
                SessionEvent::Closed => return None,
            }
        }
    }

    /// Closes the underlying connection.
    pub fn close(&self) {
        self.client.close();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.client.close();
    }
}
