//! Outbound message channel service
//!
//! Drains the pending queue one message at a time: encrypt for the
//! recipient, submit over the unary transport, and move the message to the
//! sent history only once the server acknowledges it. The pending queue is
//! peeked, not popped, so a transport failure mid-send never loses a
//! message; only explicit denials and unreachable recipients discard one.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use flare_core::crypto::aead_encrypt;
use flare_core::errors::{DenialError, Result, TransportError};
use flare_core::fsm::Fsm;
use flare_core::identity::{ContactIdentity, IdentityStore};
use flare_core::transport::UnaryTransport;
use flare_core::wire::{MessageRequest, UnaryRequest, UnaryResponse, AUTH_METADATA_KEY};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::queue::MessageQueue;
use crate::service::Service;

// ----------------------------------------------------------------------------
// States and Commands
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundState {
    Connected,
    SendingMessage,
    Reconnecting,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OutboundCommand {
    MessagePending,
    Sent,
    Discarded,
    Fail,
    Retry,
    Abort,
    Restart,
}

fn outbound_fsm() -> Fsm<OutboundState, OutboundCommand> {
    use OutboundCommand as C;
    use OutboundState as S;

    let mut fsm = Fsm::new(S::Connected);
    fsm.register(S::Connected, C::MessagePending, S::SendingMessage)
        .register(S::Connected, C::Fail, S::Reconnecting)
        .register(S::SendingMessage, C::Sent, S::Connected)
        .register(S::SendingMessage, C::Discarded, S::Connected)
        .register(S::SendingMessage, C::Fail, S::Reconnecting)
        .register(S::Reconnecting, C::Retry, S::Connected)
        .register(S::Reconnecting, C::Abort, S::Aborted)
        .register(S::Aborted, C::Restart, S::Connected);
    fsm
}

// ----------------------------------------------------------------------------
// Message Records
// ----------------------------------------------------------------------------

/// A plaintext message queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient_username: String,
    pub body: String,
}

/// A message the server has acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient_username: String,
    pub body: String,
    pub server_time: u64,
}

/// Events the outbound service reports back to the facade.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Sent(SentMessage),
    /// The message was discarded: the server denied it or the recipient's
    /// key could not be obtained.
    Discarded {
        message: OutboundMessage,
        denial: DenialError,
    },
}

// ----------------------------------------------------------------------------
// Outbound Service
// ----------------------------------------------------------------------------

pub struct OutboundService {
    transport: Arc<dyn UnaryTransport>,
    config: ClientConfig,
    fsm: Fsm<OutboundState, OutboundCommand>,
    identity: Arc<Mutex<IdentityStore>>,
    pending: MessageQueue<OutboundMessage>,
    sent: MessageQueue<SentMessage>,
    token_rx: watch::Receiver<Option<String>>,
    events: mpsc::UnboundedSender<OutboundEvent>,
    attempts_left: u32,
}

impl OutboundService {
    pub fn new(
        transport: Arc<dyn UnaryTransport>,
        config: ClientConfig,
        identity: Arc<Mutex<IdentityStore>>,
        pending: MessageQueue<OutboundMessage>,
        sent: MessageQueue<SentMessage>,
        token_rx: watch::Receiver<Option<String>>,
        events: mpsc::UnboundedSender<OutboundEvent>,
    ) -> Self {
        let attempts_left = config.reconnect_attempts;
        Self {
            transport,
            config,
            fsm: outbound_fsm(),
            identity,
            pending,
            sent,
            token_rx,
            events,
            attempts_left,
        }
    }

    pub fn state(&self) -> OutboundState {
        self.fsm.state()
    }

    /// Return an aborted service to duty with a fresh reconnection budget.
    /// Undelivered messages are still in the pending queue.
    pub fn restart(&mut self) -> Result<()> {
        self.advance(OutboundCommand::Restart)?;
        self.attempts_left = self.config.reconnect_attempts;
        Ok(())
    }

    fn advance(&mut self, command: OutboundCommand) -> Result<()> {
        let next = self.fsm.advance(command)?;
        debug!(?next, ?command, "outbound transition");
        Ok(())
    }

    fn emit(&self, event: OutboundEvent) {
        let _ = self.events.send(event);
    }

    async fn call(
        &self,
        request: UnaryRequest,
    ) -> core::result::Result<UnaryResponse, TransportError> {
        let token = self.token_rx.borrow().clone().unwrap_or_default();
        let metadata = [(AUTH_METADATA_KEY, token.as_str())];
        match timeout(self.config.call_timeout, self.transport.call(request, &metadata)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                duration_ms: self.config.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Ensure the identity store holds a key for the recipient, fetching it
    /// from the server on first contact.
    async fn ensure_contact(&mut self, username: &str) -> Result<bool> {
        let known = {
            let store = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            store.contact(username).is_some()
        };
        if known {
            return Ok(true);
        }

        match self
            .call(UnaryRequest::ContactKey {
                username: username.to_owned(),
            })
            .await
        {
            Ok(UnaryResponse::ContactKey(key_bytes)) => {
                match ContactIdentity::from_sec1_bytes(username, &key_bytes) {
                    Ok(contact) => {
                        let mut store = self.identity.lock().unwrap_or_else(|e| e.into_inner());
                        store.upsert_contact(contact);
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(%username, error = %e, "server returned an unusable contact key");
                        Ok(false)
                    }
                }
            }
            Ok(UnaryResponse::Deny(_)) | Ok(_) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_connected(&mut self) -> Result<()> {
        if self.pending.peek().is_some() {
            return self.advance(OutboundCommand::MessagePending);
        }
        // Nothing to send; idle briefly instead of spinning.
        tokio::time::sleep(self.config.read_timeout).await;
        Ok(())
    }

    async fn handle_sending(&mut self) -> Result<()> {
        let Some(message) = self.pending.peek() else {
            return self.advance(OutboundCommand::Sent);
        };

        match self.ensure_contact(&message.recipient_username).await {
            Ok(true) => {}
            Ok(false) => {
                // The recipient cannot be encrypted for; keeping the message
                // queued would wedge everything behind it.
                warn!(recipient = %message.recipient_username, "recipient unreachable, discarding message");
                self.pending.pop();
                self.emit(OutboundEvent::Discarded {
                    message,
                    denial: DenialError::Unknown {
                        reason: "recipient key unavailable".into(),
                    },
                });
                return self.advance(OutboundCommand::Discarded);
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "contact key fetch failed");
                return self.advance(OutboundCommand::Fail);
            }
            Err(e) => return Err(e),
        }

        let shared = {
            let mut store = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            store.shared_key_with(&message.recipient_username)
        };
        let Some(shared) = shared else {
            // No local key pair yet; the session service has not finished.
            warn!("outbound encryption unavailable before session establishment");
            return self.advance(OutboundCommand::Fail);
        };

        let envelope = aead_encrypt(&shared, message.body.as_bytes())?;
        let request = UnaryRequest::Message(MessageRequest {
            recipient_username: message.recipient_username.clone(),
            envelope,
        });

        match self.call(request).await {
            Ok(UnaryResponse::Message(ack)) => {
                self.pending.pop();
                let sent = SentMessage {
                    recipient_username: message.recipient_username,
                    body: message.body,
                    server_time: ack.server_time,
                };
                debug!(recipient = %sent.recipient_username, "message acknowledged");
                self.sent.push(sent.clone());
                self.emit(OutboundEvent::Sent(sent));
                self.attempts_left = self.config.reconnect_attempts;
                self.advance(OutboundCommand::Sent)
            }
            Ok(UnaryResponse::Deny(reason)) => {
                let denial = DenialError::from(reason);
                warn!(%denial, "message submission denied");
                self.pending.pop();
                self.emit(OutboundEvent::Discarded { message, denial });
                self.advance(OutboundCommand::Discarded)
            }
            Ok(other) => {
                warn!(?other, "unexpected response to message submission");
                self.advance(OutboundCommand::Fail)
            }
            Err(e) => {
                warn!(error = %e, "message submission failed");
                self.advance(OutboundCommand::Fail)
            }
        }
    }

    async fn handle_reconnecting(&mut self) -> Result<()> {
        if self.attempts_left == 0 {
            warn!("outbound reconnection attempts exhausted");
            return self.advance(OutboundCommand::Abort);
        }
        self.attempts_left -= 1;
        match timeout(self.config.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => {
                info!("outbound transport reconnected");
                self.attempts_left = self.config.reconnect_attempts;
                self.advance(OutboundCommand::Retry)
            }
            _ => {
                tokio::time::sleep(self.config.reconnect_pause).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Service for OutboundService {
    fn name(&self) -> &'static str {
        "outbound"
    }

    async fn step(&mut self) -> Result<()> {
        match self.fsm.state() {
            OutboundState::Connected => self.handle_connected().await,
            OutboundState::SendingMessage => self.handle_sending().await,
            OutboundState::Reconnecting => self.handle_reconnecting().await,
            OutboundState::Aborted => Ok(()),
        }
    }

    fn ended(&self) -> bool {
        self.fsm.state() == OutboundState::Aborted || self.transport.connection_lost()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
