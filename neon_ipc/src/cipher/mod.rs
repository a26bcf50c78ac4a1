//! Payload ciphers.
//!
//! Every message body is passed through a [`PayloadCipher`] before it is
//! written to a channel and after it is read back. Drivers and producers only
//! see the trait, so the transform can be swapped through configuration.

pub mod aes_gcm;
pub mod xor;

use crate::error::ChannelResult;
use shared_utils::config::{CipherAlgorithm, CipherConfig};
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub use self::aes_gcm::AesGcmCipher;
pub use self::xor::{transform, XorCipher};

/// Reversible transform applied to message bodies.
pub trait PayloadCipher: Send + Sync + fmt::Debug {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Transform plaintext into the bytes written on the wire
    fn encrypt(&self, plaintext: &[u8]) -> ChannelResult<Vec<u8>>;

    /// Recover plaintext from wire bytes
    fn decrypt(&self, ciphertext: &[u8]) -> ChannelResult<Vec<u8>>;

    /// Bytes `encrypt` adds on top of the plaintext length
    fn overhead(&self) -> usize {
        0
    }
}

/// Build the cipher selected by `[cipher]`.
pub fn build_cipher(config: &CipherConfig) -> ChannelResult<Arc<dyn PayloadCipher>> {
    let cipher: Arc<dyn PayloadCipher> = match config.algorithm {
        CipherAlgorithm::Xor => Arc::new(XorCipher::new(config.key.as_bytes())?),
        CipherAlgorithm::AesGcm => Arc::new(AesGcmCipher::from_passphrase(&config.key)?),
    };
    info!(cipher = cipher.name(), "Payload cipher initialised");
    Ok(cipher)
}
