use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::Mac;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = hmac::Hmac<Sha256>;

/// Env var holding an operator-supplied encryption passphrase. When unset
/// the key is derived from machine identity instead.
pub const PASSPHRASE_ENV: &str = "FARMHAND_ENCRYPT_KEY";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encrypted value too short")]
    TooShort,

    #[error("cipher failure")]
    Cipher,

    #[error("utf-8 decode failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypts session tokens for the `session_data` column. Tokens never hit
/// disk or logs in clear form; the wire format is base64(nonce || ciphertext)
/// with a random 12-byte nonce per seal.
pub struct TokenVault {
    cipher: Aes256Gcm,
}

/// Derive a 256-bit key via HMAC-SHA256(input, "farmhand-vault-v1").
fn derive_key(input: &str) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"farmhand-vault-v1")
        .expect("HMAC can take key of any size");
    mac.update(input.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    key
}

impl TokenVault {
    /// Key from the `FARMHAND_ENCRYPT_KEY` passphrase when set, otherwise
    /// from hostname + username so the key is stable across restarts but
    /// tied to the local machine/user.
    pub fn new() -> Self {
        match std::env::var(PASSPHRASE_ENV) {
            Ok(pass) if !pass.is_empty() => Self::from_passphrase(&pass),
            _ => {
                let hostname = hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown-host".to_string());
                let username = whoami::username();
                Self::from_passphrase(&format!("{}{}", hostname, username))
            }
        }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = derive_key(passphrase);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("32-byte key is valid for AES-256");
        Self { cipher }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        use base64::Engine;

        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Cipher)?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn open(&self, encoded: &str) -> Result<String, VaultError> {
        use base64::Engine;

        let combined = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        if combined.len() < 13 {
            return Err(VaultError::TooShort);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::Cipher)?;

        Ok(String::from_utf8(plaintext)?)
    }
}

impl Default for TokenVault {
    fn default() -> Self {
        Self::new()
    }
}
