//! Transport abstractions
//!
//! The engine talks to the network through two seams: a unary
//! request/response transport for session establishment and message
//! submission, and a byte stream for the inbound subscription. Both are
//! async traits so production implementations and test doubles plug in
//! interchangeably; the services never touch sockets directly.

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::wire::{UnaryRequest, UnaryResponse};

// ----------------------------------------------------------------------------
// Unary Transport
// ----------------------------------------------------------------------------

/// Request/response transport for the establishment and outbound flows.
///
/// `call` carries optional metadata pairs alongside the request; the auth
/// token travels under [`crate::wire::AUTH_METADATA_KEY`].
#[async_trait]
pub trait UnaryTransport: Send + Sync {
    /// (Re-)establish the underlying connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Issue one request and await its response.
    async fn call(
        &self,
        request: UnaryRequest,
        metadata: &[(&str, &str)],
    ) -> Result<UnaryResponse, TransportError>;

    /// Whether the transport reports a permanently failed connection.
    /// Services treat this as a terminal condition alongside their own end
    /// states.
    fn connection_lost(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Stream Socket
// ----------------------------------------------------------------------------

/// Result of one read from the stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRead {
    /// Bytes written into the caller's buffer.
    pub count: usize,
    /// Whether this read completed a message frame.
    pub end_of_message: bool,
}

/// Byte-stream transport for the inbound subscription.
///
/// Receivers take `&self`: the socket is shared between the listener loop
/// and the ping task, so implementations carry their own interior locking.
#[async_trait]
pub trait StreamSocket: Send + Sync {
    /// (Re-)open the stream connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Write one complete frame.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read into `buf`, reporting how much arrived and whether the frame is
    /// complete. A frame larger than `buf` fills it exactly with
    /// `end_of_message` false; the caller grows the buffer and reads again.
    async fn recv(&self, buf: &mut [u8]) -> Result<StreamRead, TransportError>;

    /// Whether the stream is currently open.
    fn is_open(&self) -> bool;
}
