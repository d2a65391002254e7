//! Credential-at-rest encryption for `Integration` rows (spec §6: "Secrets at
//! rest (`credentials_encrypted`) are AES-256 with a key from an environment
//! variable; if the key is missing, credential write operations must fail
//! loudly.").

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use thiserror::Error;

pub const KEY_ENV_VAR: &str = "LAYER7WAF_CREDENTIALS_KEY";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{KEY_ENV_VAR} is not set; refusing to write credentials")]
    MissingKey,
    #[error("{KEY_ENV_VAR} must decode to 32 bytes of hex")]
    MalformedKey,
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure (ciphertext tampered or wrong key)")]
    Decrypt,
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
}

fn load_key() -> Result<Key<Aes256Gcm>, CryptoError> {
    let raw = std::env::var(KEY_ENV_VAR).map_err(|_| CryptoError::MissingKey)?;
    let bytes = hex::decode(raw.trim()).map_err(|_| CryptoError::MalformedKey)?;
    if bytes.len() != 32 {
        return Err(CryptoError::MalformedKey);
    }
    Ok(*Key::<Aes256Gcm>::from_slice(&bytes))
}

/// Encrypt `plaintext` with the key named by `LAYER7WAF_CREDENTIALS_KEY`.
///
/// Returns `hex(nonce || ciphertext)`. Fails loudly (an `Err`, never a
/// silent no-op) if the key is absent, per the fatal-error policy of §7.
pub fn encrypt(plaintext: &str) -> Result<String, CryptoError> {
    let key = load_key()?;
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(encoded: &str) -> Result<String, CryptoError> {
    let key = load_key()?;
    let cipher = Aes256Gcm::new(&key);
    let raw = hex::decode(encoded).map_err(|_| CryptoError::Truncated)?;
    if raw.len() < 12 {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);
    let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
}
