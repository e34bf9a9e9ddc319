//! At-rest encryption for provider access and refresh tokens.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};
use crate::error::AppError;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// A sealed value as persisted: `base64(nonce):base64(ciphertext)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedToken {
    pub encrypted_data: String,
    pub nonce: String,
}

impl EncryptedToken {
    pub fn to_stored(&self) -> String {
        format!("{}:{}", self.nonce, self.encrypted_data)
    }

    pub fn from_stored(stored: &str) -> Result<Self, AppError> {
        let (nonce, encrypted_data) = stored
            .split_once(':')
            .ok_or_else(|| AppError::InternalError("Invalid stored token format".to_string()))?;
        Ok(Self {
            encrypted_data: encrypted_data.to_string(),
            nonce: nonce.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct TokenCipher {
    encryption_key: [u8; KEY_SIZE],
}

impl TokenCipher {
    pub fn new(encryption_key: [u8; KEY_SIZE]) -> Self {
        Self { encryption_key }
    }

    pub fn from_base64_key(key: &str) -> Result<Self, AppError> {
        let key_bytes = BASE64.decode(key)
            .map_err(|e| AppError::ConfigError(format!("Invalid encryption key: {}", e)))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(AppError::ConfigError("Invalid encryption key length".to_string()));
        }

        let mut encryption_key = [0u8; KEY_SIZE];
        encryption_key.copy_from_slice(&key_bytes);

        Ok(Self { encryption_key })
    }

    /// Fresh random key; values sealed with it do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedToken, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| AppError::InternalError(format!("Encryption error: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::InternalError(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedToken {
            encrypted_data: BASE64.encode(encrypted),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    pub fn decrypt(&self, encrypted: &EncryptedToken) -> Result<String, AppError> {
        let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
            .map_err(|e| AppError::InternalError(format!("Decryption error: {}", e)))?;

        let nonce_bytes = BASE64.decode(&encrypted.nonce)
            .map_err(|e| AppError::InternalError(format!("Invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(AppError::InternalError("Invalid nonce length".to_string()));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let encrypted_data = BASE64.decode(&encrypted.encrypted_data)
            .map_err(|e| AppError::InternalError(format!("Invalid encrypted data: {}", e)))?;

        let decrypted = cipher
            .decrypt(nonce, encrypted_data.as_ref())
            .map_err(|e| AppError::InternalError(format!("Decryption failed: {}", e)))?;

        String::from_utf8(decrypted)
            .map_err(|e| AppError::InternalError(format!("Invalid UTF-8: {}", e)))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, AppError> {
        Ok(self.encrypt(plaintext)?.to_stored())
    }

    pub fn open(&self, stored: &str) -> Result<String, AppError> {
        self.decrypt(&EncryptedToken::from_stored(stored)?)
    }
}

/// Hex SHA-256 digest; one-time tokens are persisted only in this form.
pub fn digest_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
