//! Inbound message channel service
//!
//! Owns the subscription stream: subscribes with the session token, spawns a
//! keep-alive ping task, and reads framed messages into the received queue.
//! Messages stay encrypted in the queue; decryption happens when the caller
//! fetches them, so a missing contact identity never stalls the listener.

use std::sync::Arc;

use async_trait::async_trait;
use flare_core::crypto::aead_decrypt;
use flare_core::errors::{DecryptError, Result, TransportError};
use flare_core::framing::read_message;
use flare_core::fsm::Fsm;
use flare_core::identity::{ContactIdentity, IdentityStore};
use flare_core::transport::StreamSocket;
use flare_core::wire::{self, ClientFrame, InboundUserMessage, SubscribeRequest};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::queue::MessageQueue;
use crate::service::Service;

// ----------------------------------------------------------------------------
// States and Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundState {
    Initialized,
    Connecting,
    Listening,
    Receiving,
    Reconnecting,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InboundCommand {
    Run,
    Subscribed,
    FrameReady,
    Handled,
    Fail,
    Retry,
    Abort,
    Restart,
}

fn inbound_fsm() -> Fsm<InboundState, InboundCommand> {
    use InboundCommand as C;
    use InboundState as S;

    let mut fsm = Fsm::new(S::Initialized);
    fsm.register(S::Initialized, C::Run, S::Connecting)
        .register(S::Connecting, C::Subscribed, S::Listening)
        .register(S::Connecting, C::Fail, S::Reconnecting)
        .register(S::Listening, C::FrameReady, S::Receiving)
        .register(S::Listening, C::Fail, S::Reconnecting)
        .register(S::Receiving, C::Handled, S::Listening)
        .register(S::Receiving, C::Fail, S::Reconnecting)
        .register(S::Reconnecting, C::Retry, S::Connecting)
        .register(S::Reconnecting, C::Abort, S::Aborted)
        .register(S::Aborted, C::Restart, S::Initialized);
    fsm
}

// ----------------------------------------------------------------------------
// Deduplication
// ----------------------------------------------------------------------------

/// Remembers the identities of the last two delivered messages. Server-side
/// replay after a resubscription can repeat the tail of the stream; anything
/// older than two messages back is the caller's concern.
#[derive(Debug, Default)]
struct DedupWindow {
    recent: [Option<(String, u64)>; 2],
}

impl DedupWindow {
    /// Record the message identity; returns false if it was already seen.
    fn admit(&mut self, sender: &str, server_time: u64) -> bool {
        let id = (sender.to_owned(), server_time);
        if self.recent.iter().flatten().any(|seen| *seen == id) {
            return false;
        }
        self.recent.swap(0, 1);
        self.recent[1] = Some(id);
        true
    }
}

// ----------------------------------------------------------------------------
// Inbound Service
// ----------------------------------------------------------------------------

pub struct InboundService {
    socket: Arc<dyn StreamSocket>,
    config: ClientConfig,
    fsm: Fsm<InboundState, InboundCommand>,
    token_rx: watch::Receiver<Option<String>>,
    received: MessageQueue<InboundUserMessage>,
    dedup: DedupWindow,
    /// Timestamp from which the next subscription replays missed messages.
    last_server_time: u64,
    /// Frame decoded in Listening, handled in Receiving.
    staged: Option<InboundUserMessage>,
    ping_task: Option<JoinHandle<()>>,
    attempts_left: u32,
}

impl InboundService {
    pub fn new(
        socket: Arc<dyn StreamSocket>,
        config: ClientConfig,
        token_rx: watch::Receiver<Option<String>>,
        received: MessageQueue<InboundUserMessage>,
    ) -> Self {
        let attempts_left = config.reconnect_attempts;
        Self {
            socket,
            config,
            fsm: inbound_fsm(),
            token_rx,
            received,
            dedup: DedupWindow::default(),
            last_server_time: 0,
            staged: None,
            ping_task: None,
            attempts_left,
        }
    }

    pub fn state(&self) -> InboundState {
        self.fsm.state()
    }

    /// Return an aborted service to its initial state. The replay timestamp
    /// and dedup window survive so a resubscription picks up where the old
    /// stream stopped.
    pub fn restart(&mut self) -> Result<()> {
        self.advance(InboundCommand::Restart)?;
        self.attempts_left = self.config.reconnect_attempts;
        Ok(())
    }

    fn advance(&mut self, command: InboundCommand) -> Result<()> {
        let next = self.fsm.advance(command)?;
        debug!(?next, ?command, "inbound transition");
        Ok(())
    }

    /// Wait for a session token, open the stream, and send the subscribe
    /// frame.
    async fn handle_connecting(&mut self) -> Result<()> {
        let token = match self.wait_for_token().await {
            Some(token) => token,
            None => return self.advance(InboundCommand::Fail),
        };

        let connected = timeout(self.config.connect_timeout, self.socket.connect()).await;
        if !matches!(connected, Ok(Ok(()))) {
            warn!("inbound stream connect failed");
            return self.advance(InboundCommand::Fail);
        }

        let subscribe = ClientFrame::Subscribe(SubscribeRequest {
            token,
            begin_timestamp: self.last_server_time,
        });
        let frame = wire::encode(&subscribe)?;
        if self.socket.send(&frame).await.is_err() {
            warn!("subscribe frame send failed");
            return self.advance(InboundCommand::Fail);
        }

        info!(replay_from = self.last_server_time, "inbound stream subscribed");
        self.attempts_left = self.config.reconnect_attempts;
        self.spawn_ping_task();
        self.advance(InboundCommand::Subscribed)
    }

    async fn wait_for_token(&mut self) -> Option<String> {
        loop {
            if let Some(token) = self.token_rx.borrow().clone() {
                return Some(token);
            }
            if self.token_rx.changed().await.is_err() {
                // Token publisher dropped; the session is gone for good.
                return None;
            }
        }
    }

    /// The keep-alive runs for the service's whole life, spanning
    /// reconnections; send failures are expected while the stream is down
    /// and carry no signal the listener loop does not already have.
    fn spawn_ping_task(&mut self) {
        if self.ping_task.is_some() {
            return;
        }
        let socket = Arc::clone(&self.socket);
        let period = self.config.ping_interval;
        self.ping_task = Some(tokio::spawn(async move {
            let Ok(frame) = wire::encode(&ClientFrame::Ping) else {
                return;
            };
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if socket.is_open() {
                    let _ = socket.send(&frame).await;
                }
            }
        }));
    }

    async fn handle_listening(&mut self) -> Result<()> {
        let read = timeout(self.config.read_timeout, read_message(self.socket.as_ref())).await;
        let bytes = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.is_recoverable() => {
                warn!(error = %e, "inbound read failed");
                return self.advance(InboundCommand::Fail);
            }
            // Oversized frame or similar; the stream itself is fine but the
            // frame is unusable, so resubscribe past it.
            Ok(Err(e)) => {
                warn!(error = %e, "discarding unreadable inbound frame");
                return self.advance(InboundCommand::Fail);
            }
            // Quiet stream; poll again.
            Err(_) => return Ok(()),
        };

        match wire::decode::<InboundUserMessage>(&bytes) {
            Ok(message) => {
                self.staged = Some(message);
                self.advance(InboundCommand::FrameReady)
            }
            Err(e) => {
                warn!(error = %e, "undecodable inbound frame dropped");
                Ok(())
            }
        }
    }

    fn handle_receiving(&mut self) -> Result<()> {
        if let Some(message) = self.staged.take() {
            self.last_server_time = self.last_server_time.max(message.server_time);
            if self.dedup.admit(&message.sender_username, message.server_time) {
                debug!(
                    sender = %message.sender_username,
                    server_time = message.server_time,
                    "inbound message queued"
                );
                self.received.push(message);
            } else {
                debug!("duplicate inbound message dropped");
            }
        }
        self.advance(InboundCommand::Handled)
    }

    async fn handle_reconnecting(&mut self) -> Result<()> {
        if self.attempts_left == 0 {
            warn!("inbound reconnection attempts exhausted");
            return self.advance(InboundCommand::Abort);
        }
        self.attempts_left -= 1;
        tokio::time::sleep(self.config.reconnect_pause).await;
        self.advance(InboundCommand::Retry)
    }
}

impl Drop for InboundService {
    fn drop(&mut self) {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Service for InboundService {
    fn name(&self) -> &'static str {
        "inbound"
    }

    async fn step(&mut self) -> Result<()> {
        match self.fsm.state() {
            InboundState::Initialized => self.advance(InboundCommand::Run),
            InboundState::Connecting => self.handle_connecting().await,
            InboundState::Listening => self.handle_listening().await,
            InboundState::Receiving => self.handle_receiving(),
            InboundState::Reconnecting => self.handle_reconnecting().await,
            InboundState::Aborted => Ok(()),
        }
    }

    fn ended(&self) -> bool {
        self.fsm.state() == InboundState::Aborted
    }
}

// ----------------------------------------------------------------------------
// Decryption
// ----------------------------------------------------------------------------

/// Decrypt a received message against the identity store.
///
/// The sender's public key rides along with the message; an unknown sender
/// is added to the store on first contact. Failures leave the message intact
/// for the caller to retry or discard.
pub fn decrypt_received(
    store: &mut IdentityStore,
    message: &InboundUserMessage,
) -> core::result::Result<String, DecryptError> {
    if store.local().is_none() {
        return Err(DecryptError::UnknownContact {
            username: message.sender_username.clone(),
        });
    }

    if store.contact(&message.sender_username).is_none() {
        let contact =
            ContactIdentity::from_sec1_bytes(&message.sender_username, &message.sender_public_key)
                .map_err(|_| DecryptError::MalformedEnvelope)?;
        store.upsert_contact(contact);
    }

    let shared = store
        .shared_key_with(&message.sender_username)
        .ok_or_else(|| DecryptError::UnknownContact {
            username: message.sender_username.clone(),
        })?;

    let plaintext = aead_decrypt(&shared, &message.envelope).map_err(|_| {
        DecryptError::AuthenticationFailed {
            username: message.sender_username.clone(),
        }
    })?;
    String::from_utf8(plaintext).map_err(|_| DecryptError::MalformedEnvelope)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use flare_core::crypto::aead_encrypt;
    use flare_core::identity::IdentityKeyPair;

    use super::*;

    #[test]
    fn dedup_window_drops_the_last_two_identities() {
        let mut window = DedupWindow::default();
        assert!(window.admit("alice", 10));
        assert!(window.admit("alice", 11));
        assert!(!window.admit("alice", 10));
        assert!(!window.admit("alice", 11));
        // A third distinct message evicts the oldest entry.
        assert!(window.admit("alice", 12));
        assert!(window.admit("alice", 10));
    }

    #[test]
    fn same_timestamp_different_sender_is_not_a_duplicate() {
        let mut window = DedupWindow::default();
        assert!(window.admit("alice", 10));
        assert!(window.admit("bob", 10));
    }

    fn encrypted_message_from(
        sender: &IdentityKeyPair,
        recipient: &IdentityKeyPair,
        plaintext: &str,
    ) -> InboundUserMessage {
        let shared = sender.agree(recipient.public_key());
        InboundUserMessage {
            sender_username: "bob".into(),
            server_time: 100,
            envelope: aead_encrypt(&shared, plaintext.as_bytes()).unwrap(),
            sender_public_key: sender.public_key_bytes(),
        }
    }

    #[test]
    fn decrypt_adds_unknown_sender_and_recovers_plaintext() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let message = encrypted_message_from(&bob, &alice, "labas");

        let mut store = IdentityStore::new();
        store.set_local(alice);
        assert_eq!(decrypt_received(&mut store, &message).unwrap(), "labas");
        assert_eq!(store.contact_count(), 1);
    }

    #[test]
    fn decrypt_without_local_identity_fails() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let message = encrypted_message_from(&bob, &alice, "labas");

        let mut store = IdentityStore::new();
        assert!(matches!(
            decrypt_received(&mut store, &message),
            Err(DecryptError::UnknownContact { .. })
        ));
    }

    #[test]
    fn tampered_envelope_reports_authentication_failure() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let mut message = encrypted_message_from(&bob, &alice, "labas");
        message.envelope.ciphertext[0] ^= 0xFF;

        let mut store = IdentityStore::new();
        store.set_local(alice);
        assert!(matches!(
            decrypt_received(&mut store, &message),
            Err(DecryptError::AuthenticationFailed { .. })
        ));
    }
}
