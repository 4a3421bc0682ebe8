//! Cryptographic primitives for the Flare protocol
//!
//! Three concerns live here: memory-hard password hashing (Argon2i, the
//! data-independent-addressing variant, for side-channel resistance),
//! P-521 Diffie-Hellman key agreement between contact identities, and the
//! ChaCha20-Poly1305 authenticated encryption used for the message channel.

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use p521::ecdh::diffie_hellman;
use p521::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::CryptoError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Default Argon2 memory cost for new registrations: 128 MiB.
pub const DEFAULT_MEMORY_COST_KIB: u32 = 131_072;
/// Lowest memory cost the client will accept from a server: 64 MiB.
pub const MIN_MEMORY_COST_KIB: u64 = 65_536;
/// Default Argon2 iteration count for new registrations.
pub const DEFAULT_TIME_COST: u32 = 3;
/// Lowest iteration count the client will accept from a server.
pub const MIN_TIME_COST: u64 = 3;
/// Lowest salt entropy the client will accept from a server, in bits.
pub const MIN_SALT_ENTROPY_BITS: u64 = 31;
/// Argon2 lane count.
const ARGON2_PARALLELISM: u32 = 4;
/// Raw hash output length in bytes.
const HASH_OUTPUT_LEN: usize = 32;
/// Length of the per-registration random salt component in bytes.
pub const RANDOM_SALT_LEN: usize = 16;
/// AEAD nonce length: 96 bits.
pub const NONCE_LEN: usize = 12;
/// Derived AEAD key length: 256 bits.
pub const SHARED_KEY_LEN: usize = 32;

// ----------------------------------------------------------------------------
// Password Hashing (Argon2i)
// ----------------------------------------------------------------------------

/// Generate a fresh random salt component, base64-encoded.
///
/// Regenerated on every registration and persisted alongside the credential
/// record; the server stores it so logins can reproduce the same hash.
pub fn random_salt_component() -> String {
    let mut bytes = [0u8; RANDOM_SALT_LEN];
    OsRng.fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Hash a password with Argon2i, returning the full PHC-encoded string.
///
/// The effective salt is both components concatenated and compressed through
/// SHA-256 (the PHC salt field is capped at 64 encoded characters, which the
/// raw concatenation can exceed). Both components are mandatory; a hash must
/// never be computed with either missing.
pub fn hash_password(
    password: &str,
    deterministic_salt: &str,
    random_salt: &str,
    memory_cost_kib: u32,
    time_cost: u32,
) -> Result<String, CryptoError> {
    if deterministic_salt.is_empty() {
        return Err(CryptoError::SaltMissing {
            component: "deterministic",
        });
    }
    if random_salt.is_empty() {
        return Err(CryptoError::SaltMissing {
            component: "random",
        });
    }

    let mut salt_input = Vec::with_capacity(deterministic_salt.len() + random_salt.len());
    salt_input.extend_from_slice(deterministic_salt.as_bytes());
    salt_input.extend_from_slice(random_salt.as_bytes());
    let salt_digest = Sha256::digest(&salt_input);

    let salt = SaltString::encode_b64(salt_digest.as_slice()).map_err(|e| CryptoError::HashingFailed {
        reason: e.to_string(),
    })?;
    let params = Params::new(
        memory_cost_kib,
        time_cost,
        ARGON2_PARALLELISM,
        Some(HASH_OUTPUT_LEN),
    )
    .map_err(|e| CryptoError::HashingFailed {
        reason: e.to_string(),
    })?;
    let argon2 = Argon2::new(Algorithm::Argon2i, Version::V0x13, params);

    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CryptoError::HashingFailed {
            reason: e.to_string(),
        })?;
    Ok(hash.to_string())
}

/// The transmittable segment of an encoded hash: everything after the last
/// `$` delimiter. Only this segment ever leaves the client.
pub fn transmittable_hash(encoded: &str) -> &str {
    encoded.rsplit('$').next().unwrap_or("")
}

/// Conservative entropy estimate for a base64-encoded salt: six bits per
/// character. Used for the server trust-floor check.
pub fn salt_entropy_bits(salt: &str) -> f64 {
    salt.len() as f64 * 6.0
}

// ----------------------------------------------------------------------------
// Key Agreement (P-521 ECDH)
// ----------------------------------------------------------------------------

/// 256-bit AEAD key derived from an ECDH shared secret. Zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; SHARED_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_LEN] {
        &self.0
    }
}

impl core::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Run the Diffie-Hellman agreement and compress the shared point into a
/// 256-bit AEAD key via SHA-256.
pub fn derive_shared_key(secret: &SecretKey, public: &PublicKey) -> SharedKey {
    let shared = diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
    let digest = Sha256::digest(shared.raw_secret_bytes());
    SharedKey(digest.into())
}

// ----------------------------------------------------------------------------
// Authenticated Encryption (ChaCha20-Poly1305)
// ----------------------------------------------------------------------------

/// Wire envelope for an encrypted message: ciphertext plus the fresh random
/// nonce it was sealed with. No associated data is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeadCiphertext {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Seal a plaintext under the shared key with a fresh random 96-bit nonce.
pub fn aead_encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<AeadCiphertext, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(AeadCiphertext { ciphertext, nonce })
}

/// Open an envelope. A wrong key or tampered ciphertext fails closed; no
/// partial plaintext is ever returned.
pub fn aead_decrypt(key: &SharedKey, envelope: &AeadCiphertext) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
