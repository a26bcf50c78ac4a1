//! Repeating-key XOR.
//!
//! This is a placeholder confidentiality mechanism: it has no integrity
//! protection and anyone holding the shared key can read every channel.

use super::PayloadCipher;
use crate::error::{ChannelError, ChannelResult};
use std::fmt;

/// XOR every byte of `input` with the key byte at the same position modulo
/// the key length. Applying it twice with the same key is the identity.
///
/// `key` must not be empty.
pub fn transform(input: &[u8], key: &[u8]) -> Vec<u8> {
    debug_assert!(!key.is_empty(), "xor key must not be empty");
    input
        .iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

pub struct XorCipher {
    key: Vec<u8>,
}

// Keep the key out of logs
impl fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XorCipher")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl XorCipher {
    pub fn new(key: &[u8]) -> ChannelResult<Self> {
        if key.is_empty() {
            return Err(ChannelError::Cipher("XOR key must not be empty".to_string()));
        }
        Ok(Self { key: key.to_vec() })
    }
}

impl PayloadCipher for XorCipher {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn encrypt(&self, plaintext: &[u8]) -> ChannelResult<Vec<u8>> {
        Ok(transform(plaintext, &self.key))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> ChannelResult<Vec<u8>> {
        Ok(transform(ciphertext, &self.key))
    }
}
