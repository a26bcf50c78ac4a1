use super::PayloadCipher;
use crate::error::{ChannelError, ChannelResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const KEY_SIZE: usize = 32; // AES-256
const NONCE_SIZE: usize = 12; // 96-bit GCM nonce
const TAG_SIZE: usize = 16;

/// AES-256-GCM payload cipher. Output is `nonce || ciphertext || tag`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],    // Random prefix per cipher instance
    nonce_counter: AtomicU64, // Counter for nonces
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("cipher", &"[Aes256Gcm instance]")
            .field("nonce_prefix", &self.nonce_prefix)
            .field("nonce_counter", &self.nonce_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> ChannelResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(ChannelError::Cipher(format!(
                "Invalid key size. Expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let key_array = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(key_array);

        let mut nonce_prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut nonce_prefix);

        Ok(Self {
            cipher,
            nonce_prefix,
            nonce_counter: AtomicU64::new(0),
        })
    }

    /// Derive the 256-bit key from a configured passphrase with SHA-256.
    pub fn from_passphrase(passphrase: &str) -> ChannelResult<Self> {
        if passphrase.is_empty() {
            return Err(ChannelError::Cipher(
                "AES-GCM passphrase must not be empty".to_string(),
            ));
        }
        let digest = Sha256::digest(passphrase.as_bytes());
        Self::new(digest.as_slice())
    }

    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    // 4-byte prefix | 8-byte big-endian counter
    fn generate_nonce_bytes(&self) -> [u8; NONCE_SIZE] {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        let count = self.nonce_counter.fetch_add(1, Ordering::SeqCst);

        nonce_bytes[0..4].copy_from_slice(&self.nonce_prefix);
        nonce_bytes[4..12].copy_from_slice(&count.to_be_bytes());

        if count == u64::MAX {
            tracing::error!("AES-GCM nonce counter has wrapped around; re-key required");
        }
        nonce_bytes
    }
}

impl PayloadCipher for AesGcmCipher {
    fn name(&self) -> &'static str {
        "aes-gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> ChannelResult<Vec<u8>> {
        let nonce_bytes = self.generate_nonce_bytes();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ChannelError::Cipher(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, ciphertext_with_nonce: &[u8]) -> ChannelResult<Vec<u8>> {
        if ciphertext_with_nonce.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ChannelError::MalformedPayload(
                "ciphertext is too short to contain a nonce and tag".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ChannelError::MalformedPayload("AES-GCM authentication failed".to_string()))
    }

    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_success() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();
        let plaintext = b"Hello, broker! This is a secret message.";

        let encrypted = cipher.encrypt(plaintext).unwrap();
        assert_eq!(encrypted.len(), plaintext.len() + cipher.overhead());
        let decrypted = cipher.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_passphrase_derivation_is_stable() {
        let a = AesGcmCipher::from_passphrase("neon_ipc_key").unwrap();
        let b = AesGcmCipher::from_passphrase("neon_ipc_key").unwrap();
        let ct = a.encrypt(b"shared secret").unwrap();
        assert_eq!(b.decrypt(&ct).unwrap(), b"shared secret");

        let other = AesGcmCipher::from_passphrase("other key").unwrap();
        assert!(other.decrypt(&ct).is_err());
    }

    #[test]
    fn test_decrypt_tampered_ciphertext() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();

        let mut encrypted = cipher.encrypt(b"Sensitive data.").unwrap();
        encrypted[NONCE_SIZE + 1] ^= 0xff;

        assert!(matches!(
            cipher.decrypt(&encrypted),
            Err(ChannelError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_invalid_key_size() {
        let err = AesGcmCipher::new(&[0u8; 16]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cipher error: Invalid key size. Expected 32 bytes, got 16"
        );
    }

    #[test]
    fn test_decrypt_too_short_ciphertext() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();
        assert!(matches!(
            cipher.decrypt(b"short"),
            Err(ChannelError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_nonce_counter_increments() {
        let key = AesGcmCipher::generate_key();
        let cipher = AesGcmCipher::new(&key).unwrap();

        let first = cipher.encrypt(b"message1").unwrap();
        let second = cipher.encrypt(b"message2").unwrap();

        assert_eq!(first[0..4], second[0..4], "prefix is per instance");
        let c1 = u64::from_be_bytes(first[4..NONCE_SIZE].try_into().unwrap());
        let c2 = u64::from_be_bytes(second[4..NONCE_SIZE].try_into().unwrap());
        assert_eq!(c1, 0);
        assert_eq!(c2, 1);
    }
}
