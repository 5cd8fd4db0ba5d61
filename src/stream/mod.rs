//! Realtime stream modules.
//!
//! - `client`: websocket lifecycle, filter handshake and handler callbacks.
//! - `proto`: handshake constants and defensive event decoding.
//! - `session`: awaitable event stream built on top of the client.
//! - `transport`: connector/transport traits and the websocket backend.

/// Stream client and lifecycle callbacks.
pub mod client;
/// Handshake constants and stream event decoding.
pub mod proto;
/// Session wrapper that emits decoded events.
pub mod session;
/// Transport abstraction and websocket implementation.
pub mod transport;
