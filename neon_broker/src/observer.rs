//! Hooks notified of everything the broker loop does with a message.

use neon_ipc::{ChannelError, ChannelKind, Message};
use tracing::{info, warn};

/// Receives broker events in the order they happen within a tick.
///
/// Only `on_message` is required; the other hooks default to doing nothing.
pub trait BrokerObserver: Send {
    /// A message passed the channel's policy and was delivered
    fn on_message(&mut self, message: &Message);

    /// The registry refused the sender of `message`
    fn on_denied(&mut self, _message: &Message, _pid: i32) {}

    /// Polling `channel` failed; the broker has moved on to the next channel
    fn on_error(&mut self, _channel: ChannelKind, _error: &ChannelError) {}
}

/// Default observer: writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl BrokerObserver for LogObserver {
    fn on_message(&mut self, message: &Message) {
        info!(
            channel = %message.channel,
            level = %message.security,
            sender_pid = message.sender_pid,
            sender_name = message.sender_name.as_deref(),
            len = message.payload.len(),
            text = %message.text(),
            "Message received"
        );
    }

    fn on_denied(&mut self, message: &Message, pid: i32) {
        warn!(
            channel = %message.channel,
            level = %message.security,
            sender_pid = pid,
            sender_name = message.sender_name.as_deref(),
            "Sender not authorized, message dropped"
        );
    }

    fn on_error(&mut self, channel: ChannelKind, error: &ChannelError) {
        match error {
            ChannelError::MalformedPayload(reason) => {
                warn!(%channel, %reason, "Discarded malformed message")
            }
            other => warn!(%channel, error = %other, "Channel poll failed"),
        }
    }
}
