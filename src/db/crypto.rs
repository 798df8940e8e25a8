//! Decryption of target fields stored as AES-256-GCM `iv:tag:ciphertext` hex triples.
//!
//! Rows written without a key stay plaintext, so anything that does not decrypt is
//! returned as-is.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};

use super::store::DbError;

/// The registry writes 16-byte IVs.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

pub struct FieldCipher {
    cipher: Aes256Gcm16,
}

impl FieldCipher {
    /// Build from a 64 character hex key.
    pub fn from_hex_key(key: &str) -> Result<Self, DbError> {
        let bytes = hex::decode(key.trim())
            .map_err(|e| DbError::InvalidValue(format!("encryption key: {}", e)))?;
        if bytes.len() != 32 {
            return Err(DbError::InvalidValue(
                "encryption key must be 64 hex characters".to_string(),
            ));
        }

        let cipher = Aes256Gcm16::new_from_slice(&bytes)
            .map_err(|e| DbError::InvalidValue(format!("encryption key: {}", e)))?;
        Ok(Self { cipher })
    }

    /// `None` when `text` is not an `iv:tag:ciphertext` triple or does not authenticate.
    pub fn decrypt(&self, text: &str) -> Option<String> {
        let (iv, tag, data) = split_triple(text)?;

        let iv = hex::decode(iv).ok()?;
        let tag = hex::decode(tag).ok()?;
        let mut sealed = hex::decode(data).ok()?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return None;
        }
        sealed.extend_from_slice(&tag);

        let plain = self
            .cipher
            .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_slice())
            .ok()?;
        String::from_utf8(plain).ok()
    }

    /// Decrypted value, or `text` unchanged.
    pub fn reveal(&self, text: &str) -> String {
        match self.decrypt(text) {
            Some(plain) => plain,
            None => {
                if split_triple(text).is_some_and(|(iv, tag, _)| is_hex(iv) && is_hex(tag)) {
                    tracing::warn!("Decryption failed for an encrypted target field, using it as stored");
                }
                text.to_string()
            }
        }
    }

    #[cfg(test)]
    pub fn encrypt(&self, text: &str) -> String {
        let iv: [u8; IV_LEN] = rand::random();
        let mut sealed = self
            .cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), text.as_bytes())
            .unwrap();
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        format!("{}:{}:{}", hex::encode(iv), hex::encode(tag), hex::encode(sealed))
    }
}

fn split_triple(text: &str) -> Option<(&str, &str, &str)> {
    let mut parts = text.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(iv), Some(tag), Some(data), None) => Some((iv, tag, data)),
        _ => None,
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
