//! NeonIPC channel library
//!
//! This crate holds everything the broker needs to serve its three IPC
//! channels: provisioning of the named pipe, SysV message queue and SysV
//! shared memory mailbox, the per-channel drivers that poll them without
//! blocking, the producers that write into them, the payload cipher, and the
//! bounded authorization registry.

pub mod channel;
pub mod cipher;
pub mod error;
pub mod framing;
pub mod message;
pub mod provision;
pub mod registry;
pub mod sysv;

/// Re-export common types for convenience
pub use channel::ChannelDriver;
pub use cipher::{build_cipher, PayloadCipher, XorCipher};
pub use error::{ChannelError, ChannelResult};
pub use message::{Message, MAX_MESSAGE_SIZE};
pub use provision::{provision, Channels};
pub use registry::{AuthDecision, AuthorizationRegistry, ProcessAuth};
pub use shared_utils::config::{ChannelKind, Framing, SecurityLevel};
