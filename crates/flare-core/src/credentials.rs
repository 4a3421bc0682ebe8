//! Session credentials and server-declared credential policy
//!
//! The credential record holds everything the session-establishment flow
//! needs: username, password, salt components, Argon2 cost parameters, the
//! derived hash, and the auth token once a session exists. The evaluators at
//! the bottom are the pure local half of credential validation; the live
//! server opinion is layered on top by the session service.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, DEFAULT_MEMORY_COST_KIB, DEFAULT_TIME_COST};
use crate::errors::CryptoError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Absolute password entropy floor in bits, applied on top of whatever the
/// server policy asks for.
pub const ENTROPY_FLOOR_BITS: f64 = 35.0;

/// Upper bound of the conservative local username check.
const USERNAME_SCREEN_MAX: usize = 32;

// ----------------------------------------------------------------------------
// Credentials
// ----------------------------------------------------------------------------

/// The client's credential record.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    /// Never transmitted in plaintext.
    pub password: String,
    /// Full PHC-encoded Argon2 hash, empty until derived.
    pub encoded_hash: String,
    /// Per-registration random salt component, base64.
    pub random_salt: String,
    /// Argon2 memory cost in KiB.
    pub memory_cost_kib: u32,
    /// Argon2 iteration count.
    pub time_cost: u32,
    /// Opaque server-issued token; empty until a session is established.
    pub auth_token: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            encoded_hash: String::new(),
            random_salt: String::new(),
            memory_cost_kib: DEFAULT_MEMORY_COST_KIB,
            time_cost: DEFAULT_TIME_COST,
            auth_token: String::new(),
        }
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Both username and password are present.
    pub fn filled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn has_token(&self) -> bool {
        !self.auth_token.is_empty()
    }

    /// Deterministic salt component: username concatenated with the service
    /// host.
    pub fn deterministic_salt(&self, host: &str) -> String {
        format!("{}{}", self.username, host)
    }

    /// Derive the encoded hash with the record's own cost parameters,
    /// generating a fresh random salt component first. Used on registration.
    pub fn derive_hash_for_registration(&mut self, host: &str) -> Result<(), CryptoError> {
        self.random_salt = crypto::random_salt_component();
        self.encoded_hash = crypto::hash_password(
            &self.password,
            &self.deterministic_salt(host),
            &self.random_salt,
            self.memory_cost_kib,
            self.time_cost,
        )?;
        Ok(())
    }

    /// Derive the encoded hash with server-supplied salt and cost
    /// parameters. Used on login; the caller is responsible for running the
    /// trust-floor check first.
    pub fn derive_hash_for_login(
        &mut self,
        host: &str,
        server_salt: &str,
        memory_cost_kib: u32,
        time_cost: u32,
    ) -> Result<(), CryptoError> {
        self.random_salt = server_salt.to_owned();
        self.memory_cost_kib = memory_cost_kib;
        self.time_cost = time_cost;
        self.encoded_hash = crypto::hash_password(
            &self.password,
            &self.deterministic_salt(host),
            server_salt,
            memory_cost_kib,
            time_cost,
        )?;
        Ok(())
    }

    /// The transmittable hash: final `$`-delimited segment of the encoded
    /// string.
    pub fn password_hash(&self) -> &str {
        crypto::transmittable_hash(&self.encoded_hash)
    }

    /// Human-readable dump of the full record, written on demand. This is
    /// the single place the secret fields are ever rendered.
    pub fn dump(&self, host: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.username,
            self.password,
            self.encoded_hash,
            self.deterministic_salt(host),
            self.random_salt,
            self.memory_cost_kib,
            self.time_cost,
            self.password_hash(),
            self.auth_token,
        )
    }
}

impl core::fmt::Debug for Credentials {
    // Secret fields stay out of diagnostics; see `dump` for the explicit
    // on-demand render.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("memory_cost_kib", &self.memory_cost_kib)
            .field("time_cost", &self.time_cost)
            .field("has_token", &self.has_token())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Server-Declared Policy
// ----------------------------------------------------------------------------

/// Character encoding constraint declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    Ascii,
    Unicode,
}

/// Username character-class constraint declared by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringFormat {
    LettersOnly,
    LettersNumbers,
    Alphanumeric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameRequirements {
    pub min_length: u64,
    pub max_length: u64,
    pub encoding: TextEncoding,
    pub format: StringFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordRequirements {
    pub max_length: u64,
    pub encoding: TextEncoding,
    pub min_entropy_bits: u64,
}

/// The server's declared credential policy, fetched during session
/// establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRequirements {
    pub username: UsernameRequirements,
    pub password: PasswordRequirements,
}

impl Default for CredentialRequirements {
    fn default() -> Self {
        Self {
            username: UsernameRequirements {
                min_length: 2,
                max_length: 32,
                encoding: TextEncoding::Ascii,
                format: StringFormat::Alphanumeric,
            },
            password: PasswordRequirements {
                max_length: 128,
                encoding: TextEncoding::Unicode,
                min_entropy_bits: 50,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Username Evaluation
// ----------------------------------------------------------------------------

/// Outcome of evaluating a candidate username. The first four variants come
/// from the local screen; `Taken` and `NonCompliant` only from the server's
/// live opinion. Only `Ok` is acceptable for proceeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameStatus {
    IsBlank,
    TooShort,
    TooLong,
    NotAlphanumeric,
    Taken,
    NonCompliant,
    Ok,
}

impl UsernameStatus {
    pub fn is_acceptable(self) -> bool {
        self == UsernameStatus::Ok
    }
}

/// Local half of username evaluation, in priority order: blank, too short,
/// too long, character class. `Ok` here means "clean locally"; the caller
/// still queries the server's opinion before accepting. The local screen
/// deliberately runs first and short-circuits so obviously bad candidates
/// never hit the network.
pub fn screen_username(policy: &UsernameRequirements, candidate: &str) -> UsernameStatus {
    if candidate.trim().is_empty() {
        return UsernameStatus::IsBlank;
    }
    let length = candidate.chars().count() as u64;
    if length < policy.min_length {
        return UsernameStatus::TooShort;
    }
    if length > policy.max_length {
        return UsernameStatus::TooLong;
    }
    if policy.format == StringFormat::Alphanumeric && !passes_alphanumeric_screen(candidate) {
        return UsernameStatus::NotAlphanumeric;
    }
    UsernameStatus::Ok
}

/// Conservative `^[A-Za-z0-9_]{1,32}$` equivalent.
fn passes_alphanumeric_screen(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= USERNAME_SCREEN_MAX
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ----------------------------------------------------------------------------
// Password Evaluation
// ----------------------------------------------------------------------------

/// Outcome of evaluating a candidate password. Everything from `VeryWeak`
/// upward is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStrength {
    IsBlank,
    TooLong,
    NotAllAscii,
    TooWeak,
    VeryWeak,
    Decent,
    Good,
    Great,
    Excellent,
}

impl PasswordStrength {
    pub fn is_acceptable(self) -> bool {
        matches!(
            self,
            PasswordStrength::VeryWeak
                | PasswordStrength::Decent
                | PasswordStrength::Good
                | PasswordStrength::Great
                | PasswordStrength::Excellent
        )
    }
}

/// Evaluate a candidate password against the policy.
///
/// Entropy is estimated with the zxcvbn guess-count heuristic:
/// bit-entropy = log2(estimated guesses). The acceptance threshold is the
/// larger of the server policy minimum and the absolute 35-bit floor.
pub fn evaluate_password(policy: &PasswordRequirements, candidate: &str) -> PasswordStrength {
    if candidate.trim().is_empty() {
        return PasswordStrength::IsBlank;
    }
    if candidate.chars().count() as u64 > policy.max_length {
        return PasswordStrength::TooLong;
    }
    if policy.encoding == TextEncoding::Ascii && !candidate.is_ascii() {
        return PasswordStrength::NotAllAscii;
    }

    let bits = estimate_entropy_bits(candidate);
    let floor = ENTROPY_FLOOR_BITS.max(policy.min_entropy_bits as f64);
    if bits < floor {
        return PasswordStrength::TooWeak;
    }
    if bits <= 50.0 {
        PasswordStrength::VeryWeak
    } else if bits <= 65.0 {
        PasswordStrength::Decent
    } else if bits <= 75.0 {
        PasswordStrength::Good
    } else if bits <= 90.0 {
        PasswordStrength::Great
    } else {
        PasswordStrength::Excellent
    }
}

/// Bit-entropy estimate from the zxcvbn guess count.
pub fn estimate_entropy_bits(password: &str) -> f64 {
    let estimate = zxcvbn::zxcvbn(password, &[]);
    // guesses_log10 avoids saturation on the u64 guess count.
    estimate.guesses_log10() * core::f64::consts::LOG2_10
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CredentialRequirements {
        CredentialRequirements::default()
    }

    #[test]
    fn blank_username_is_flagged_first() {
        assert_eq!(
            screen_username(&policy().username, ""),
            UsernameStatus::IsBlank
        );
        assert_eq!(
            screen_username(&policy().username, "   "),
            UsernameStatus::IsBlank
        );
    }

    #[test]
    fn username_length_bounds() {
        assert_eq!(
            screen_username(&policy().username, "a"),
            UsernameStatus::TooShort
        );
        let long = "a".repeat(33);
        assert_eq!(
            screen_username(&policy().username, &long),
            UsernameStatus::TooLong
        );
    }

    #[test]
    fn username_character_class() {
        assert_eq!(
            screen_username(&policy().username, "bad name!"),
            UsernameStatus::NotAlphanumeric
        );
        assert_eq!(
            screen_username(&policy().username, "herkus_leon_42"),
            UsernameStatus::Ok
        );
    }

    #[test]
    fn blank_password_is_flagged() {
        assert_eq!(
            evaluate_password(&policy().password, ""),
            PasswordStrength::IsBlank
        );
    }

    #[test]
    fn overlong_password_is_flagged() {
        let long = "x".repeat(129);
        assert_eq!(
            evaluate_password(&policy().password, &long),
            PasswordStrength::TooLong
        );
    }

    #[test]
    fn non_ascii_rejected_under_ascii_policy() {
        let mut ascii_policy = policy().password;
        ascii_policy.encoding = TextEncoding::Ascii;
        assert_eq!(
            evaluate_password(&ascii_policy, "pässwörd-čia"),
            PasswordStrength::NotAllAscii
        );
    }

    #[test]
    fn trivial_password_is_too_weak() {
        assert_eq!(
            evaluate_password(&policy().password, "abc123"),
            PasswordStrength::TooWeak
        );
    }

    #[test]
    fn strong_passphrase_is_acceptable() {
        let strength = evaluate_password(
            &policy().password,
            "correct-horse-battery-staple-9000-flare",
        );
        assert!(strength.is_acceptable(), "got {:?}", strength);
    }

    #[test]
    fn registration_hash_populates_record() {
        let mut creds = Credentials::new("alice_1", "pin-1234");
        creds.memory_cost_kib = 1024;
        creds.time_cost = 1;
        creds.derive_hash_for_registration("flare.example").unwrap();
        assert!(!creds.random_salt.is_empty());
        assert!(creds.encoded_hash.starts_with("$argon2i$"));
        assert!(!creds.password_hash().is_empty());
    }

    #[test]
    fn login_hash_reproduces_registration_hash() {
        let mut registered = Credentials::new("alice_1", "pin-1234");
        registered.memory_cost_kib = 1024;
        registered.time_cost = 1;
        registered
            .derive_hash_for_registration("flare.example")
            .unwrap();

        let mut login = Credentials::new("alice_1", "pin-1234");
        login
            .derive_hash_for_login("flare.example", &registered.random_salt, 1024, 1)
            .unwrap();
        assert_eq!(login.password_hash(), registered.password_hash());
    }

    #[test]
    fn debug_render_omits_secrets() {
        let mut creds = Credentials::new("alice_1", "hunter2-hunter2");
        creds.encoded_hash = "$argon2i$v=19$m=1024,t=1,p=4$c$d".into();
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("argon2i"));
    }

    #[test]
    fn dump_contains_the_full_record() {
        let mut creds = Credentials::new("alice_1", "pin-1234");
        creds.auth_token = "tok".into();
        let dump = creds.dump("flare.example");
        assert!(dump.contains("alice_1"));
        assert!(dump.contains("pin-1234"));
        assert!(dump.contains("tok"));
        assert!(dump.contains("alice_1flare.example"));
    }
}
