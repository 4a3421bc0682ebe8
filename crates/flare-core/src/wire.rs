//! Wire records for the Flare protocol
//!
//! Two families of records live here: the unary request/response pairs
//! exchanged over the request/response transport during session
//! establishment and message submission, and the framed records flowing over
//! the inbound stream. Everything is serde-derived and encoded with bincode;
//! the codec helpers at the bottom are the single place encoding errors are
//! mapped into the crate error type.

use serde::{Deserialize, Serialize};

use crate::crypto::AeadCiphertext;
use crate::errors::FlareError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Metadata key under which the auth token accompanies authenticated calls.
pub const AUTH_METADATA_KEY: &str = "flare-auth";

// ----------------------------------------------------------------------------
// Session Establishment Records
// ----------------------------------------------------------------------------

/// Server verdict on a candidate username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsernameOpinion {
    Available,
    Taken,
    NonCompliant,
}

/// Why a registration or login attempt was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    UsernameTaken,
    UsernameMalformed { detail: String },
    PasswordMalformed { detail: String },
    CredentialMismatch,
    Other { detail: String },
}

impl From<DenyReason> for crate::errors::DenialError {
    fn from(reason: DenyReason) -> Self {
        use crate::errors::DenialError;
        match reason {
            DenyReason::UsernameTaken => DenialError::UsernameTaken,
            DenyReason::UsernameMalformed { detail } => {
                DenialError::UsernameMalformed { reason: detail }
            }
            DenyReason::PasswordMalformed { detail } => {
                DenialError::PasswordMalformed { reason: detail }
            }
            DenyReason::CredentialMismatch => DenialError::CredentialMismatch,
            DenyReason::Other { detail } => DenialError::Unknown { reason: detail },
        }
    }
}

/// Argon2 parameters and salt as exchanged with the server. The server
/// stores these verbatim at registration and returns them at login so the
/// client can reproduce the identical hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    pub memory_cost_kib: u64,
    pub time_cost: u64,
    /// The random salt component only; the deterministic component is
    /// recomputed from username and host.
    pub salt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password_hash: String,
    pub hash_params: HashParams,
    /// SEC1-encoded P-521 public key.
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterResponse {
    Token(String),
    Deny(DenyReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginResponse {
    Token(String),
    Deny(DenyReason),
}

/// Verdict of a token health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenHealth {
    Ok,
    Expired,
    Invalid,
}

// ----------------------------------------------------------------------------
// Unary Envelope
// ----------------------------------------------------------------------------

/// Every request the client issues over the unary transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnaryRequest {
    /// Fetch the server's credential policy.
    Requirements,
    /// Ask the server's opinion of a candidate username.
    UsernameOpinion { username: String },
    Register(RegisterRequest),
    Login(LoginRequest),
    /// Fetch the stored hash parameters for a username, ahead of login.
    ClientHashParams { username: String },
    /// Check whether the held token is still honored. Authenticated.
    TokenHealth,
    /// Exchange an expired token for a fresh one. Authenticated.
    RenewToken,
    /// Submit an encrypted message for a recipient. Authenticated.
    Message(MessageRequest),
    /// Fetch the stored public key of another user. Authenticated.
    ContactKey { username: String },
}

/// Every response the server returns over the unary transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnaryResponse {
    Requirements(crate::credentials::CredentialRequirements),
    UsernameOpinion(UsernameOpinion),
    Register(RegisterResponse),
    Login(LoginResponse),
    ClientHashParams(HashParams),
    TokenHealth(TokenHealth),
    RenewToken(String),
    Message(MessageAck),
    ContactKey(Vec<u8>),
    Deny(DenyReason),
}

// ----------------------------------------------------------------------------
// Message Channel Records
// ----------------------------------------------------------------------------

/// An outbound encrypted message as submitted to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub recipient_username: String,
    pub envelope: AeadCiphertext,
}

/// Server acknowledgement of a submitted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub server_time: u64,
}

/// First frame the client sends on the inbound stream: the token and the
/// timestamp from which missed messages should be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub token: String,
    pub begin_timestamp: u64,
}

/// Frames the client writes to the inbound stream after subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Subscribe(SubscribeRequest),
    /// Keep-alive; the server sends no reply.
    Ping,
}

/// A message delivered on the inbound stream, still encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundUserMessage {
    pub sender_username: String,
    /// Server-assigned delivery timestamp; with the sender it forms the
    /// deduplication identity of the message.
    pub server_time: u64,
    pub envelope: AeadCiphertext,
    /// SEC1-encoded sender public key, so decryption needs no extra lookup.
    pub sender_public_key: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encode a wire record with bincode.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, FlareError> {
    bincode::serialize(record).map_err(|e| FlareError::codec(e.to_string()))
}

/// Decode a wire record with bincode.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, FlareError> {
    bincode::deserialize(bytes).map_err(|e| FlareError::codec(e.to_string()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
