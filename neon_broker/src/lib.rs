//! NeonIPC broker
//!
//! Polls the provisioned channels in a fixed order, checks queue senders
//! against the authorization registry and reports every message to the
//! registered observers.

pub mod broker;
pub mod observer;

pub use broker::{Broker, Delivery};
pub use observer::{BrokerObserver, LogObserver};
