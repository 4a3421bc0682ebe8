//! Flare Core Protocol Implementation
//!
//! This crate provides the foundational pieces of the Flare chat client:
//! credential and identity models, the cryptographic layer (Argon2i password
//! hashing, P-521 key agreement, ChaCha20-Poly1305 authenticated encryption),
//! the generic finite-state-machine engine that drives every long-running
//! network interaction, the wire record definitions, and the transport
//! contracts the runtime services are built on.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod credentials;
pub mod crypto;
pub mod errors;
pub mod framing;
pub mod fsm;
pub mod identity;
pub mod transport;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use credentials::{
    CredentialRequirements, Credentials, PasswordStrength, UsernameStatus,
};
pub use errors::{
    CryptoError, DecryptError, DenialError, FlareError, FramingError, Result, TransportError,
    TrustError,
};
pub use fsm::{Fsm, TransitionUndefined};
pub use identity::{ContactIdentity, IdentityKeyPair, IdentityStore};
pub use transport::{StreamRead, StreamSocket, UnaryTransport};
pub use wire::AUTH_METADATA_KEY;
