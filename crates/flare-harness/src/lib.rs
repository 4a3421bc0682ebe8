//! Test transports for the Flare client
//!
//! In-memory implementations of the transport seams: a unary transport
//! driven by a caller-supplied handler, and a stream socket fed from a
//! scripted frame queue. Both record what the client did so tests can
//! assert on it. Nothing here touches the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flare_core::errors::TransportError;
use flare_core::transport::{StreamRead, StreamSocket, UnaryTransport};
use flare_core::wire::{UnaryRequest, UnaryResponse};

// ----------------------------------------------------------------------------
// Mock Unary Transport
// ----------------------------------------------------------------------------

type Handler =
    dyn Fn(&UnaryRequest, &[(&str, &str)]) -> Result<UnaryResponse, TransportError> + Send + Sync;

/// Unary transport backed by a handler closure.
pub struct MockUnaryTransport {
    handler: Box<Handler>,
    /// Connect attempts that should fail before one succeeds.
    connect_failures: AtomicU32,
    connects: AtomicU32,
    lost: AtomicBool,
    calls: Mutex<Vec<UnaryRequest>>,
    tokens_seen: Mutex<Vec<String>>,
}

impl MockUnaryTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&UnaryRequest, &[(&str, &str)]) -> Result<UnaryResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            connect_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            lost: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn mark_lost(&self, lost: bool) {
        self.lost.store(lost, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every request issued so far, in order.
    pub fn calls(&self) -> Vec<UnaryRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Auth tokens that accompanied authenticated calls, in order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnaryTransport for MockUnaryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed {
                reason: "scripted connect failure".into(),
            });
        }
        self.lost.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn call(
        &self,
        request: UnaryRequest,
        metadata: &[(&str, &str)],
    ) -> Result<UnaryResponse, TransportError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                reason: "connection lost".into(),
            });
        }
        for (key, value) in metadata {
            if *key == flare_core::wire::AUTH_METADATA_KEY {
                self.tokens_seen.lock().unwrap().push((*value).to_owned());
            }
        }
        let response = (self.handler)(&request, metadata);
        self.calls.lock().unwrap().push(request);
        response
    }

    fn connection_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Mock Stream Socket
// ----------------------------------------------------------------------------

/// Stream socket fed from a queue of pre-framed messages.
///
/// `chunk_size` bounds how many bytes a single `recv` returns, so tests can
/// force the adaptive-buffer path without multi-megabyte fixtures.
pub struct MockStreamSocket {
    frames: Mutex<VecDeque<Vec<u8>>>,
    /// Read position within the frame at the queue front.
    cursor: Mutex<usize>,
    chunk_size: usize,
    open: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    connect_failures: AtomicU32,
}

impl MockStreamSocket {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            cursor: Mutex::new(0),
            chunk_size,
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            connect_failures: AtomicU32::new(0),
        }
    }

    /// Queue a frame for the client to read.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.frames.lock().unwrap().push_back(frame);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Frames the client wrote, in order.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamSocket for MockStreamSocket {
    async fn connect(&self) -> Result<(), TransportError> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed {
                reason: "scripted connect failure".into(),
            });
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::SendFailed {
                reason: "socket closed".into(),
            });
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<StreamRead, TransportError> {
        loop {
            {
                let mut frames = self.frames.lock().unwrap();
                let mut cursor = self.cursor.lock().unwrap();
                if let Some(frame) = frames.front() {
                    let remaining = frame.len() - *cursor;
                    let count = remaining.min(buf.len()).min(self.chunk_size);
                    buf[..count].copy_from_slice(&frame[*cursor..*cursor + count]);
                    *cursor += count;
                    let end_of_message = *cursor == frame.len();
                    if end_of_message {
                        frames.pop_front();
                        *cursor = 0;
                    }
                    return Ok(StreamRead {
                        count,
                        end_of_message,
                    });
                }
            }
            // Nothing queued; wait like a quiet socket would. The caller's
            // read timeout is the way out.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
