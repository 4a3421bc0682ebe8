//! Error types for the Flare client engine
//!
//! This module contains the error taxonomy used throughout the client:
//! transport failures (recoverable, drive reconnection), protocol denials
//! (typed, terminal for the current attempt), trust violations (fatal),
//! local decryption failures (non-fatal), and FSM contract violations,
//! unified under the main FlareError type.

use crate::fsm::TransitionUndefined;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport-level failures: recoverable, drive a reconnection transition
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {reason}")]
    ConnectFailed { reason: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("Transport shut down: {reason}")]
    Shutdown { reason: String },
}

/// Explicit server denials: terminal for the current attempt, never retried
/// silently
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenialError {
    #[error("Username is already taken")]
    UsernameTaken,
    #[error("Username is malformed: {reason}")]
    UsernameMalformed { reason: String },
    #[error("Password is malformed: {reason}")]
    PasswordMalformed { reason: String },
    #[error("Credentials do not match a registered user")]
    CredentialMismatch,
    #[error("Auth token is invalid")]
    TokenInvalid,
    #[error("Auth token has expired")]
    TokenExpired,
    #[error("Server denied the request: {reason}")]
    Unknown { reason: String },
}

/// Server-supplied hash parameters below the client's security floor.
/// Fatal: retrying cannot fix an adversarial server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrustError {
    #[error("Server memory cost {got} KiB is below the trust floor of {floor} KiB")]
    MemoryCostBelowFloor { got: u64, floor: u64 },
    #[error("Server time cost {got} is below the trust floor of {floor}")]
    TimeCostBelowFloor { got: u64, floor: u64 },
    #[error("Server salt carries {bits:.0} bits of entropy, below the floor of {floor}")]
    SaltBelowFloor { bits: f64, floor: u64 },
}

/// Cryptographic primitive failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Password hashing failed: {reason}")]
    HashingFailed { reason: String },
    #[error("Salt component missing: {component}")]
    SaltMissing { component: &'static str },
    #[error("Invalid public key encoding")]
    InvalidPublicKey,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Local decryption failures: the message stays queued for a later retry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    #[error("No contact identity known for sender {username}")]
    UnknownContact { username: String },
    #[error("Authentication tag verification failed for message from {username}")]
    AuthenticationFailed { username: String },
    #[error("Envelope payload is malformed")]
    MalformedEnvelope,
}

/// Adaptive-buffer framing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Inbound message exceeds the {limit}-byte buffer cap")]
    MessageTooLarge { limit: usize },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the Flare client
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlareError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Server denial: {0}")]
    Denial(#[from] DenialError),

    #[error("Trust violation: {0}")]
    Trust(#[from] TrustError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Decryption failure: {0}")]
    Decrypt(#[from] DecryptError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("State machine contract violation: {0}")]
    Transition(#[from] TransitionUndefined),

    #[error("Wire codec error: {reason}")]
    Codec { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl FlareError {
    /// Create a codec error from any serialization failure
    pub fn codec<T: Into<String>>(reason: T) -> Self {
        FlareError::Codec {
            reason: reason.into(),
        }
    }

    pub fn io<T: Into<String>>(reason: T) -> Self {
        FlareError::Io {
            reason: reason.into(),
        }
    }

    /// Whether this failure should drive a reconnection transition rather
    /// than surface as a terminal condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FlareError::Transport(_) | FlareError::Codec { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, FlareError>;
