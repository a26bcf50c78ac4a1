//! The transport-independent message surfaced by every channel driver.

use shared_utils::config::{ChannelKind, SecurityLevel};
use std::borrow::Cow;

/// Largest payload any channel carries, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// A decrypted message together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message arrived on
    pub channel: ChannelKind,
    /// Security level of that channel
    pub security: SecurityLevel,
    /// Decrypted payload
    pub payload: Vec<u8>,
    /// Sender process id; only the queue carries one
    pub sender_pid: Option<i32>,
    /// Name the sender declared alongside its pid
    pub sender_name: Option<String>,
}

impl Message {
    pub fn new(channel: ChannelKind, security: SecurityLevel, payload: Vec<u8>) -> Self {
        Self {
            channel,
            security,
            payload,
            sender_pid: None,
            sender_name: None,
        }
    }

    pub fn with_sender(mut self, pid: i32, name: Option<String>) -> Self {
        self.sender_pid = Some(pid);
        self.sender_name = name;
        self
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Cut a decrypted buffer at its first NUL, C-string style.
pub fn trim_at_nul(mut bytes: Vec<u8>) -> Vec<u8> {
    if let Some(end) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(end);
    }
    bytes
}
