//! Request/response transport for the chunk store.
//!
//! A [`TransportServer`] owns one listener on a dedicated network thread and
//! hands every decoded request to a [`RequestHandler`]. A [`TransportClient`]
//! owns its connections on another thread; callers enqueue requests and get
//! back a [`PendingRequest`] that is fulfilled when the matching response
//! (same `uid`) arrives, in whatever order responses come back.
//!
//! ```ignore
//! let handler = Arc::new(Mutex::new(MyHandler::new()));
//! let server = TransportServer::start(ServerConfig::default(), handler)?;
//! let client = TransportClient::connect(ClientConfig::for_addr(server.local_addr()))?;
//! let reply = client.send(MessageKind::GetValue, key, None).wait()?;
//! ```

pub mod protocol;
pub mod client;
pub mod server;

pub use protocol::{Message, MessageKind, ProtocolError, next_uid};
pub use client::{ClientConfig, PendingRequest, TransportClient};
pub use server::{RequestHandler, ServerConfig, TransportServer};

use thiserror::Error;

/// Default store server port
pub const DEFAULT_PORT: u16 = 9743;

/// Errors raised by either transport endpoint
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed before the response arrived")]
    Disconnected,
}

/// Pace a connection to roughly `bandwidth` bytes per second after moving
/// `bytes`. A bandwidth of 0 disables pacing.
pub(crate) async fn throttle(bytes: usize, bandwidth: u32) {
    if bandwidth == 0 {
        return;
    }
    let secs = bytes as f64 / bandwidth as f64;
    tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
}
