//! Flare Client Runtime
//!
//! This crate contains the service runtime for the Flare chat client:
//! - `SessionService`: connect, fetch policy, collect credentials, register
//!   or log in, and publish the session token
//! - `InboundService`: subscribe to the message stream, keep it alive, and
//!   queue arrivals
//! - `OutboundService`: encrypt and submit queued messages, acknowledging
//!   into the sent history
//! - `FlareClient`: the facade that wires them together
//!
//! The protocol types, cryptography, and transport contracts live in
//! `flare-core`; this crate orchestrates them.

pub mod client;
pub mod config;
pub mod inbound;
pub mod outbound;
pub mod queue;
pub mod service;
pub mod session;

pub use client::{FlareClient, ReceivedMessage};
pub use config::ClientConfig;
pub use inbound::{decrypt_received, InboundService, InboundState};
pub use outbound::{OutboundEvent, OutboundMessage, OutboundService, OutboundState, SentMessage};
pub use queue::MessageQueue;
pub use service::{spawn_service, Service, ServiceHandle};
pub use session::{
    CredentialUpdate, SessionEvent, SessionIntent, SessionService, SessionState,
};
