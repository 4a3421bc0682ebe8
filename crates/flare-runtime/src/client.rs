//! Client facade
//!
//! Wires the three services together over shared state and channels and
//! exposes the operations an application actually calls: submit credentials,
//! send a message, fetch what arrived, persist the credential record, shut
//! down. The facade owns no protocol logic; everything flows through the
//! services.

use std::sync::{Arc, Mutex};

use flare_core::credentials::Credentials;
use flare_core::errors::{FlareError, Result};
use flare_core::identity::IdentityStore;
use flare_core::transport::{StreamSocket, UnaryTransport};
use flare_core::wire::InboundUserMessage;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::config::ClientConfig;
use crate::inbound::{decrypt_received, InboundService};
use crate::outbound::{OutboundEvent, OutboundMessage, OutboundService, SentMessage};
use crate::queue::MessageQueue;
use crate::service::{spawn_service, ServiceHandle};
use crate::session::{CredentialUpdate, SessionEvent, SessionIntent, SessionService};

// ----------------------------------------------------------------------------
// Received Message
// ----------------------------------------------------------------------------

/// A decrypted inbound message as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender_username: String,
    pub server_time: u64,
    pub body: String,
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

pub struct FlareClient {
    config: ClientConfig,
    unary: Arc<dyn UnaryTransport>,
    stream: Arc<dyn StreamSocket>,
    credentials: Arc<Mutex<Credentials>>,
    identity: Arc<Mutex<IdentityStore>>,
    token_rx: watch::Receiver<Option<String>>,
    credential_tx: mpsc::UnboundedSender<CredentialUpdate>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound_events: mpsc::UnboundedReceiver<OutboundEvent>,
    outbound_event_tx: mpsc::UnboundedSender<OutboundEvent>,
    pending: MessageQueue<OutboundMessage>,
    sent: MessageQueue<SentMessage>,
    received: MessageQueue<InboundUserMessage>,
    session: ServiceHandle,
    inbound: ServiceHandle,
    outbound: ServiceHandle,
}

impl FlareClient {
    /// Spawn the full service stack over the given transports.
    pub fn start(
        config: ClientConfig,
        unary: Arc<dyn UnaryTransport>,
        stream: Arc<dyn StreamSocket>,
    ) -> Self {
        let credentials = Arc::new(Mutex::new(Credentials::default()));
        let identity = Arc::new(Mutex::new(IdentityStore::new()));
        let (token_tx, token_rx) = watch::channel(None);
        let (credential_tx, credential_rx) = mpsc::unbounded_channel();
        let (session_event_tx, session_events) = mpsc::unbounded_channel();
        let (outbound_event_tx, outbound_events) = mpsc::unbounded_channel();

        let pending = MessageQueue::new();
        let sent = MessageQueue::new();
        let received = MessageQueue::new();

        let session = spawn_service(SessionService::new(
            Arc::clone(&unary),
            config.clone(),
            Arc::clone(&credentials),
            Arc::clone(&identity),
            token_tx,
            session_event_tx,
            credential_rx,
        ));
        let inbound = spawn_service(InboundService::new(
            Arc::clone(&stream),
            config.clone(),
            token_rx.clone(),
            received.clone(),
        ));
        let outbound = spawn_service(OutboundService::new(
            Arc::clone(&unary),
            config.clone(),
            Arc::clone(&identity),
            pending.clone(),
            sent.clone(),
            token_rx.clone(),
            outbound_event_tx.clone(),
        ));

        Self {
            config,
            unary,
            stream,
            credentials,
            identity,
            token_rx,
            credential_tx,
            session_events,
            outbound_events,
            outbound_event_tx,
            pending,
            sent,
            received,
            session,
            inbound,
            outbound,
        }
    }

    // ------------------------------------------------------------------------
    // Session Establishment
    // ------------------------------------------------------------------------

    /// Submit credentials for registration or login. The session service
    /// validates them and reports the outcome through session events.
    pub fn submit_credentials(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
        intent: SessionIntent,
    ) -> Result<()> {
        self.credential_tx
            .send(CredentialUpdate {
                username: username.into(),
                password: password.into(),
                intent,
            })
            .map_err(|_| FlareError::codec("session service is no longer running"))
    }

    /// Wait for the next session event.
    pub async fn next_session_event(&mut self) -> Option<SessionEvent> {
        self.session_events.recv().await
    }

    /// Session event already waiting, if any.
    pub fn poll_session_event(&mut self) -> Option<SessionEvent> {
        self.session_events.try_recv().ok()
    }

    /// The current auth token, once a session is established.
    pub fn auth_token(&self) -> Option<String> {
        self.token_rx.borrow().clone()
    }

    pub fn has_session(&self) -> bool {
        self.auth_token().is_some()
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Queue a plaintext message for a recipient. Encryption and delivery
    /// happen asynchronously in the outbound service.
    pub fn send_message(&self, recipient: impl Into<String>, body: impl Into<String>) {
        self.pending.push(OutboundMessage {
            recipient_username: recipient.into(),
            body: body.into(),
        });
    }

    /// Wait for the next outbound delivery event.
    pub async fn next_outbound_event(&mut self) -> Option<OutboundEvent> {
        self.outbound_events.recv().await
    }

    /// Messages the server has acknowledged so far, oldest first.
    pub fn sent_history(&self) -> Vec<SentMessage> {
        self.sent.drain()
    }

    /// Decrypt and return everything that has arrived since the last fetch.
    ///
    /// Messages that cannot be decrypted yet stay queued for a later fetch;
    /// a sender whose key arrives later is recoverable, and dropping mail is
    /// not.
    pub fn fetch_received(&self) -> Vec<ReceivedMessage> {
        let mut store = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = Vec::new();
        let mut retained = Vec::new();
        for message in self.received.drain() {
            match decrypt_received(&mut store, &message) {
                Ok(body) => delivered.push(ReceivedMessage {
                    sender_username: message.sender_username,
                    server_time: message.server_time,
                    body,
                }),
                Err(e) => {
                    warn!(sender = %message.sender_username, error = %e, "message left queued");
                    retained.push(message);
                }
            }
        }
        self.received.requeue_front(retained);
        delivered
    }

    /// Decrypted view of the received queue without consuming it. Messages
    /// that cannot be decrypted yet are omitted but stay queued.
    pub fn peek_received(&self) -> Vec<ReceivedMessage> {
        let mut store = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        self.received
            .snapshot()
            .into_iter()
            .filter_map(|message| {
                decrypt_received(&mut store, &message)
                    .ok()
                    .map(|body| ReceivedMessage {
                        sender_username: message.sender_username,
                        server_time: message.server_time,
                        body,
                    })
            })
            .collect()
    }

    /// Number of messages queued for sending but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the plaintext credential dump to the configured path.
    pub fn save_credentials(&self) -> Result<()> {
        let Some(path) = self.config.credential_dump_path.as_ref() else {
            return Err(FlareError::io("no credential dump path configured"));
        };
        let dump = {
            let creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
            creds.dump(&self.config.server_host)
        };
        std::fs::write(path, dump).map_err(|e| FlareError::io(e.to_string()))
    }

    /// Adopt a previously saved auth token so the session service can try
    /// the token shortcut instead of full establishment.
    pub fn adopt_token(&self, username: impl Into<String>, token: impl Into<String>) {
        let mut creds = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        creds.username = username.into();
        creds.auth_token = token.into();
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn session_finished(&self) -> bool {
        self.session.is_finished()
    }

    pub fn inbound_finished(&self) -> bool {
        self.inbound.is_finished()
    }

    pub fn outbound_finished(&self) -> bool {
        self.outbound.is_finished()
    }

    /// Tear down the message channel services and launch fresh ones after a
    /// terminal abort. The pending, sent, and received queues are preserved;
    /// the inbound subscription replays from timestamp zero.
    pub fn restart_messaging(&mut self) {
        self.inbound.abort();
        self.outbound.abort();
        self.inbound = spawn_service(InboundService::new(
            Arc::clone(&self.stream),
            self.config.clone(),
            self.token_rx.clone(),
            self.received.clone(),
        ));
        self.outbound = spawn_service(OutboundService::new(
            Arc::clone(&self.unary),
            self.config.clone(),
            Arc::clone(&self.identity),
            self.pending.clone(),
            self.sent.clone(),
            self.token_rx.clone(),
            self.outbound_event_tx.clone(),
        ));
    }

    /// Stop all services and wait for them to wind down. Service errors
    /// surface here.
    pub async fn shutdown(self) -> Result<()> {
        self.session.request_shutdown();
        self.inbound.request_shutdown();
        self.outbound.request_shutdown();
        // The inbound listener and outbound idle loop wake on their own
        // timeouts and observe the flag; the session may be blocked waiting
        // for credentials, so give it the same chance then abort.
        self.outbound.join().await?;
        self.inbound.abort();
        self.session.abort();
        Ok(())
    }
}
