//! Rust client for FreeSWITCH HTTP event streams.
//!
//! A stream server pushes FreeSWITCH events to websocket clients on
//! `ws://<host>[:<port>]/websock`. Clients send their filters right after the
//! connection opens, terminate the list with `EOF`, then receive events until
//! the connection closes.
//!
//! - `stream`: client, transport, protocol helpers and session wrapper.

/// Stream client, transport, protocol and session modules.
pub mod stream;

pub use stream::client::{
    callbacks, detect_mode, ConnectionState, Endpoint, StreamClient, StreamClientError,
    StreamHandler, StreamOptions,
};
pub use stream::session::{SessionEvent, StreamSession};
pub use stream::transport::StreamMode;
