//! The three broker channels.
//!
//! Each module provides the channel handle (provisioning, inspection,
//! removal), the broker-side driver implementing [`ChannelDriver`], and the
//! producer used by writers.

pub mod pipe;
pub mod queue;
pub mod shm;

use crate::error::ChannelResult;
use crate::message::Message;
use shared_utils::config::{ChannelKind, SecurityLevel};

pub use self::pipe::{PipeChannel, PipeDriver, PipeProducer};
pub use self::queue::{QueueChannel, QueueDriver, QueueProducer};
pub use self::shm::{ShmChannel, ShmDriver, ShmProducer};

/// Broker-side reader of one channel.
pub trait ChannelDriver: Send {
    fn kind(&self) -> ChannelKind;

    /// Level the channel was provisioned at
    fn security(&self) -> SecurityLevel;

    /// Take at most one message without blocking; `Ok(None)` when there is
    /// nothing to read.
    fn poll(&mut self) -> ChannelResult<Option<Message>>;

    /// Destroy the underlying OS object
    fn remove(&self) -> ChannelResult<()>;
}
