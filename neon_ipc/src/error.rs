//! Error types shared by the channel provisioners, drivers and producers.

use shared_utils::config::ChannelKind;
use std::io;
use thiserror::Error;

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error type for channel operations
///
/// An empty channel is never an error: drivers report it as `Ok(None)`.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Creating or securing a channel's OS object failed. Fatal at startup.
    #[error("Failed to provision {channel} channel ({reason}): {source}")]
    Provisioning {
        channel: ChannelKind,
        reason: String,
        #[source]
        source: io::Error,
    },

    /// A system call on an already provisioned object failed
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload too large, badly framed, or not decryptable. Logged and discarded.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Cipher construction or operation failed
    #[error("Cipher error: {0}")]
    Cipher(String),
}

impl ChannelError {
    pub(crate) fn provisioning(
        channel: ChannelKind,
        reason: impl Into<String>,
    ) -> impl FnOnce(io::Error) -> ChannelError {
        let reason = reason.into();
        move |source| ChannelError::Provisioning {
            channel,
            reason,
            source,
        }
    }

    pub(crate) fn sys(op: &'static str) -> impl FnOnce(io::Error) -> ChannelError {
        move |source| ChannelError::Sys { op, source }
    }

    /// Whether this error aborts broker startup.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Provisioning { .. })
    }
}
