//! The broker loop.
//!
//! One pass polls every channel once in the configured order, applies the
//! channel's authorization policy to whatever arrived and hands the result
//! to the observers. The loop repeats the pass at a fixed interval until it
//! is told to shut down.

use crate::observer::{BrokerObserver, LogObserver};
use neon_ipc::{
    AuthorizationRegistry, ChannelDriver, ChannelError, ChannelKind, ChannelResult, Channels,
    Message, PayloadCipher,
};
use shared_utils::config::Config;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to one message, or one failed poll, during a pass.
#[derive(Debug)]
pub enum Delivery {
    Delivered(Message),
    Denied { message: Message, pid: i32 },
    Failed { channel: ChannelKind, error: ChannelError },
}

impl Delivery {
    pub fn channel(&self) -> ChannelKind {
        match self {
            Delivery::Delivered(message) | Delivery::Denied { message, .. } => message.channel,
            Delivery::Failed { channel, .. } => *channel,
        }
    }
}

struct Slot {
    driver: Box<dyn ChannelDriver>,
    /// Check senders against the registry
    authorize: bool,
}

pub struct Broker {
    slots: Vec<Slot>,
    registry: AuthorizationRegistry,
    observers: Vec<Box<dyn BrokerObserver>>,
    tick_interval: Duration,
}

impl Broker {
    pub fn new(registry: AuthorizationRegistry, tick_interval: Duration) -> Self {
        Self {
            slots: Vec::new(),
            registry,
            observers: Vec::new(),
            tick_interval,
        }
    }

    /// Broker over provisioned `channels`, polled in `broker.order` and
    /// reporting through a [`LogObserver`].
    pub fn from_config(
        config: &Config,
        channels: Channels,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        let mut broker = Self::new(
            AuthorizationRegistry::from_config(&config.registry),
            config.broker.tick_interval(),
        );
        for driver in channels.into_drivers(&config.channels, cipher) {
            let authorize = config.channels.authorize(driver.kind());
            broker.add_channel(driver, authorize);
        }
        broker.sort_by_order(&config.broker.order);
        broker.add_observer(Box::new(LogObserver));
        broker
    }

    /// Append a channel to the end of the poll order.
    pub fn add_channel(&mut self, driver: Box<dyn ChannelDriver>, authorize: bool) {
        debug!(channel = %driver.kind(), authorize, "Registered channel");
        self.slots.push(Slot { driver, authorize });
    }

    pub fn add_observer(&mut self, observer: Box<dyn BrokerObserver>) {
        self.observers.push(observer);
    }

    /// Reorder channels to follow `order`. Kinds missing from `order` keep
    /// their relative position after the listed ones.
    pub fn sort_by_order(&mut self, order: &[ChannelKind]) {
        self.slots.sort_by_key(|slot| {
            order
                .iter()
                .position(|kind| *kind == slot.driver.kind())
                .unwrap_or(order.len())
        });
    }

    /// Channel kinds in poll order.
    pub fn order(&self) -> Vec<ChannelKind> {
        self.slots.iter().map(|slot| slot.driver.kind()).collect()
    }

    pub fn registry(&self) -> &AuthorizationRegistry {
        &self.registry
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Poll every channel once and return what happened, in poll order.
    pub fn tick(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        for slot in &mut self.slots {
            let kind = slot.driver.kind();
            let delivery = match slot.driver.poll() {
                Ok(None) => continue,
                Ok(Some(message)) => match message.sender_pid {
                    Some(pid) if slot.authorize => {
                        let name = message.sender_name.as_deref().unwrap_or("");
                        let level = slot.driver.security();
                        if self.registry.authorize(pid, name, level).is_granted() {
                            Delivery::Delivered(message)
                        } else {
                            Delivery::Denied { message, pid }
                        }
                    }
                    _ => Delivery::Delivered(message),
                },
                Err(error) => Delivery::Failed {
                    channel: kind,
                    error,
                },
            };

            notify(&mut self.observers, &delivery);
            deliveries.push(delivery);
        }

        deliveries
    }

    /// Run passes every `tick_interval` until `shutdown` resolves.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            order = ?self.order(),
            tick_ms = self.tick_interval.as_millis() as u64,
            "Broker loop started"
        );

        loop {
            self.tick();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        info!("Broker loop stopped");
    }

    /// Remove every channel's OS object. All channels are attempted; the
    /// first failure is returned.
    pub fn remove_channels(&self) -> ChannelResult<()> {
        let mut first_error = None;
        for slot in &self.slots {
            let kind = slot.driver.kind();
            match slot.driver.remove() {
                Ok(()) => info!(channel = %kind, "Removed channel"),
                Err(e) => {
                    warn!(channel = %kind, error = %e, "Failed to remove channel");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn notify(observers: &mut [Box<dyn BrokerObserver>], delivery: &Delivery) {
    for observer in observers.iter_mut() {
        match delivery {
            Delivery::Delivered(message) => observer.on_message(message),
            Delivery::Denied { message, pid } => observer.on_denied(message, *pid),
            Delivery::Failed { channel, error } => observer.on_error(*channel, error),
        }
    }
}
