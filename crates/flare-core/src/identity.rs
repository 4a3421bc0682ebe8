//! Local identity key pair and per-contact identity records
//!
//! The identity key pair is a P-521 pair used exclusively for key agreement;
//! it is generated once per registration (or first login) and held for the
//! process lifetime. Contact records cache the derived shared key so the
//! agreement runs at most once per remote public key.

use std::collections::HashMap;

use p521::{PublicKey, SecretKey};
use rand_core::OsRng;

use crate::crypto::{derive_shared_key, SharedKey};
use crate::errors::CryptoError;

// ----------------------------------------------------------------------------
// Identity Key Pair
// ----------------------------------------------------------------------------

/// P-521 key pair for key agreement, distinct from the login credentials.
pub struct IdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Public key in SEC1 uncompressed encoding, as submitted to the server.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_sec1_bytes().into_vec()
    }

    /// Run key agreement against a remote public key.
    pub fn agree(&self, remote: &PublicKey) -> SharedKey {
        derive_shared_key(&self.secret, remote)
    }
}

impl core::fmt::Debug for IdentityKeyPair {
    // The secret scalar must never reach diagnostics.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(&self.public_key_bytes()[..8]))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Contact Identity
// ----------------------------------------------------------------------------

/// A remote contact: username, public key, and the lazily-derived shared key.
#[derive(Debug)]
pub struct ContactIdentity {
    username: String,
    public_key: PublicKey,
    shared_key: Option<SharedKey>,
}

impl ContactIdentity {
    pub fn new(username: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            username: username.into(),
            public_key,
            shared_key: None,
        }
    }

    /// Build a contact from a SEC1-encoded public key.
    pub fn from_sec1_bytes(
        username: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Self, CryptoError> {
        let public_key =
            PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::new(username, public_key))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Replace the remote public key, invalidating the cached shared key if
    /// it actually changed.
    pub fn set_public_key(&mut self, public_key: PublicKey) {
        if self.public_key != public_key {
            self.public_key = public_key;
            self.shared_key = None;
        }
    }

    /// The shared key for this contact, computing and caching it on first
    /// use.
    pub fn shared_key(&mut self, local: &IdentityKeyPair) -> &SharedKey {
        self.shared_key
            .get_or_insert_with(|| local.agree(&self.public_key))
    }
}

// ----------------------------------------------------------------------------
// Identity Store
// ----------------------------------------------------------------------------

/// Owns the local key pair and the contact map. Created once per client;
/// services borrow it and never clone the private key material.
#[derive(Debug, Default)]
pub struct IdentityStore {
    local: Option<IdentityKeyPair>,
    contacts: HashMap<String, ContactIdentity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> Option<&IdentityKeyPair> {
        self.local.as_ref()
    }

    /// Install the local key pair, replacing any previous one.
    pub fn set_local(&mut self, key_pair: IdentityKeyPair) {
        self.local = Some(key_pair);
    }

    /// Insert or update a contact keyed by username. An updated public key
    /// invalidates the contact's cached shared key.
    pub fn upsert_contact(&mut self, contact: ContactIdentity) {
        match self.contacts.get_mut(contact.username()) {
            Some(existing) => existing.set_public_key(contact.public_key),
            None => {
                self.contacts
                    .insert(contact.username().to_owned(), contact);
            }
        }
    }

    pub fn contact(&self, username: &str) -> Option<&ContactIdentity> {
        self.contacts.get(username)
    }

    pub fn contact_mut(&mut self, username: &str) -> Option<&mut ContactIdentity> {
        self.contacts.get_mut(username)
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    /// The shared key for a known contact, derived and cached on first use.
    /// `None` if either the local key pair or the contact is missing.
    pub fn shared_key_with(&mut self, username: &str) -> Option<SharedKey> {
        let local = self.local.as_ref()?;
        let contact = self.contacts.get_mut(username)?;
        Some(contact.shared_key(local).clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
