//! Adaptive message framing for the inbound stream
//!
//! Inbound messages arrive in frames of unknown size. Reads start with a
//! small buffer and double it whenever a frame does not fit, up to a hard
//! cap; a frame still incomplete at the cap is a framing error. The doubling
//! is clamped to the cap so messages just under it still fit.

use crate::errors::{FlareError, FramingError};
use crate::transport::StreamSocket;

/// Starting buffer size for a frame read.
pub const INITIAL_BUFFER_SIZE: usize = 1024;
/// Hard upper bound on a single inbound message.
pub const MAX_MESSAGE_SIZE: usize = 2_000_000;

/// Read one complete message frame from the socket.
///
/// Transport errors pass through untouched so the caller can distinguish a
/// benign read timeout from an oversized frame.
pub async fn read_message(socket: &dyn StreamSocket) -> Result<Vec<u8>, FlareError> {
    let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
    let mut filled = 0usize;
    loop {
        let read = socket.recv(&mut buf[filled..]).await?;
        filled += read.count;
        if read.end_of_message {
            buf.truncate(filled);
            return Ok(buf);
        }
        if filled == buf.len() {
            if buf.len() >= MAX_MESSAGE_SIZE {
                return Err(FramingError::MessageTooLarge {
                    limit: MAX_MESSAGE_SIZE,
                }
                .into());
            }
            let grown = (buf.len() * 2).min(MAX_MESSAGE_SIZE);
            buf.resize(grown, 0);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
