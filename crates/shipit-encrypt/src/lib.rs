//! Field-level encryption using AES-256-GCM with PBKDF2 key derivation.
//!
//! This crate seals individual secret-bearing fields (environment variable
//! values, TLS private keys, build tokens, audit diffs) before they are
//! stored, and derives keyed digests so hashed fields can be searched for
//! equality without opening every row.
//!
//! ## Usage
//!
//! ```
//! use shipit_encrypt::FieldCodec;
//!
//! let codec = FieldCodec::with_passphrase("my-secret-passphrase");
//!
//! let sealed = codec.encrypt_field("hunter2").expect("encryption failed");
//! assert_ne!(sealed, "hunter2");
//! assert_eq!(codec.decrypt_field(&sealed), "hunter2");
//!
//! // Values that were never sealed come back untouched.
//! assert_eq!(codec.decrypt_field("plain"), "plain");
//! ```
//!
//! ## Security
//!
//! - Uses AES-256-GCM for authenticated encryption
//! - PBKDF2 with 100,000 iterations, run once per codec
//! - Random nonce for each sealed value
//! - Sealed value format: base64(nonce || ciphertext || auth_tag)
//! - Digests are HMAC-SHA256 keyed by the derived key

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Environment variable consulted when no passphrase is configured
pub const DEFAULT_KEY_ENV: &str = "SHIPIT_ENCRYPT_KEY";

/// Size of the nonce for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag
const TAG_SIZE: usize = 16;
/// Number of PBKDF2 iterations
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Size of the derived key (256 bits for AES-256)
const KEY_SIZE: usize = 32;
/// Salt for deriving the field key; the key must be stable across processes
const FIELD_SALT: &[u8] = b"shipit.field-codec.v1";
/// Bytes of randomness in a generated token
const TOKEN_BYTES: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Encryption configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether encryption is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Passphrase for encryption/decryption (if enabled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Environment variable name to read passphrase from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl EncryptionConfig {
    /// Create a new encryption config with the given passphrase
    pub fn new(passphrase: String) -> Self {
        Self {
            enabled: true,
            passphrase: Some(passphrase),
            env_var: None,
        }
    }

    /// Create a new encryption config that reads passphrase from environment variable
    pub fn from_env(env_var: String) -> Self {
        Self {
            enabled: true,
            passphrase: None,
            env_var: Some(env_var),
        }
    }

    /// Get the passphrase, trying the environment variable first if configured
    pub fn get_passphrase(&self) -> Option<String> {
        if let Some(ref env_var) = self.env_var
            && let Ok(passphrase) = std::env::var(env_var)
            && !passphrase.is_empty()
        {
            return Some(passphrase);
        }

        self.passphrase.clone()
    }
}

/// Seals and opens individual field values.
///
/// A codec built without a secret is a pass-through: `encrypt_field` and
/// `decrypt_field` return their input, and digests fall back to plain
/// SHA-256.
#[derive(Clone)]
pub struct FieldCodec {
    key: Option<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for FieldCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCodec")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl FieldCodec {
    /// Build a codec from configuration.
    ///
    /// Fails when encryption is enabled but no passphrase can be resolved.
    pub fn new(config: &EncryptionConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::passthrough());
        }

        let passphrase = config.get_passphrase().context(
            "encryption is enabled but no passphrase available. Set SHIPIT_ENCRYPT_KEY environment variable or provide passphrase in config.",
        )?;

        Ok(Self::with_passphrase(&passphrase))
    }

    /// Codec that stores every value as plaintext.
    pub fn passthrough() -> Self {
        Self { key: None }
    }

    pub fn with_passphrase(passphrase: &str) -> Self {
        Self {
            key: Some(derive_key(passphrase, FIELD_SALT)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Seal a field value. Fresh nonce per call, so equal plaintexts seal differently.
    pub fn encrypt_field(&self, plaintext: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(key).context("failed to create AES-256-GCM cipher")?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {:?}", e))?;

        // Format: nonce || ciphertext
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&sealed))
    }

    /// Open a sealed value, failing if it is not valid ciphertext for this key.
    pub fn try_decrypt_field(&self, sealed: &str) -> Result<String> {
        let Some(key) = &self.key else {
            bail!("no encryption key configured");
        };

        let data = BASE64.decode(sealed).context("invalid base64 encoding")?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            bail!("encrypted data too short");
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(key).context("failed to create AES-256-GCM cipher")?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| {
                anyhow::anyhow!(
                    "decryption failed - wrong passphrase or corrupted data: {:?}",
                    e
                )
            })?;

        String::from_utf8(plaintext).context("decrypted data is not valid UTF-8")
    }

    /// Open a stored value. Anything that does not open is returned as-is,
    /// which lets rows written before encryption was switched on keep working.
    pub fn decrypt_field(&self, value: &str) -> String {
        if self.key.is_none() || !is_encrypted(value) {
            return value.to_string();
        }

        self.try_decrypt_field(value)
            .unwrap_or_else(|_| value.to_string())
    }

    /// Searchable digest of a plaintext value (lowercase hex).
    pub fn digest(&self, plaintext: &str) -> String {
        if let Some(key) = &self.key
            && let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key)
        {
            mac.update(plaintext.as_bytes());
            return hex::encode(mac.finalize().into_bytes());
        }

        hex::encode(Sha256::digest(plaintext.as_bytes()))
    }
}

/// Derive a 256-bit key from passphrase using PBKDF2-SHA256
fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Check if a value looks like sealed field data: valid base64 that decodes
/// to at least a nonce plus an authentication tag. Only a successful decrypt
/// proves it was sealed.
pub fn is_encrypted(content: &str) -> bool {
    let Ok(data) = BASE64.decode(content) else {
        return false;
    };

    data.len() >= NONCE_SIZE + TAG_SIZE
}

/// Random opaque token (32 lowercase hex characters) from the OS RNG.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
