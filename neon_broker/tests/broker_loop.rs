use neon_broker::{Broker, BrokerObserver, Delivery};
use neon_ipc::{
    AuthorizationRegistry, ChannelDriver, ChannelError, ChannelKind, ChannelResult, Message,
    SecurityLevel,
};
use shared_utils::config::EvictionPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Driver that replays a scripted sequence of poll results.
struct ScriptedDriver {
    kind: ChannelKind,
    security: SecurityLevel,
    script: VecDeque<ChannelResult<Option<Message>>>,
    polls: Arc<AtomicUsize>,
}

impl ScriptedDriver {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            security: SecurityLevel::High,
            script: VecDeque::new(),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn then_message(mut self, text: &str, sender: Option<i32>) -> Self {
        let mut message = Message::new(self.kind, self.security, text.as_bytes().to_vec());
        if let Some(pid) = sender {
            message = message.with_sender(pid, Some(format!("proc-{pid}")));
        }
        self.script.push_back(Ok(Some(message)));
        self
    }

    fn then_error(mut self, error: ChannelError) -> Self {
        self.script.push_back(Err(error));
        self
    }
}

impl ChannelDriver for ScriptedDriver {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn security(&self) -> SecurityLevel {
        self.security
    }

    fn poll(&mut self) -> ChannelResult<Option<Message>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(Ok(None))
    }

    fn remove(&self) -> ChannelResult<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl BrokerObserver for Recorder {
    fn on_message(&mut self, message: &Message) {
        self.events
            .lock()
            .unwrap()
            .push(format!("message {} {}", message.channel, message.text()));
    }

    fn on_denied(&mut self, message: &Message, pid: i32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("denied {} {pid}", message.channel));
    }

    fn on_error(&mut self, channel: ChannelKind, _error: &ChannelError) {
        self.events.lock().unwrap().push(format!("error {channel}"));
    }
}

fn broker(capacity: usize) -> Broker {
    Broker::new(
        AuthorizationRegistry::new(capacity, EvictionPolicy::Deny),
        Duration::from_millis(5),
    )
}

#[test]
fn tick_polls_channels_in_order() {
    let mut broker = broker(10);
    broker.add_channel(
        Box::new(ScriptedDriver::new(ChannelKind::Pipe).then_message("p", None)),
        false,
    );
    broker.add_channel(
        Box::new(ScriptedDriver::new(ChannelKind::Queue).then_message("q", Some(1))),
        true,
    );
    broker.add_channel(
        Box::new(ScriptedDriver::new(ChannelKind::Shm).then_message("s", None)),
        false,
    );

    let channels: Vec<ChannelKind> = broker.tick().iter().map(Delivery::channel).collect();
    assert_eq!(
        channels,
        vec![ChannelKind::Pipe, ChannelKind::Queue, ChannelKind::Shm]
    );
    assert!(broker.tick().is_empty());
}

#[test]
fn configured_order_is_respected() {
    let mut broker = broker(10);
    for kind in ChannelKind::ALL {
        broker.add_channel(
            Box::new(ScriptedDriver::new(kind).then_message("x", None)),
            false,
        );
    }
    broker.sort_by_order(&[ChannelKind::Shm, ChannelKind::Pipe, ChannelKind::Queue]);

    assert_eq!(
        broker.order(),
        vec![ChannelKind::Shm, ChannelKind::Pipe, ChannelKind::Queue]
    );
    let channels: Vec<ChannelKind> = broker.tick().iter().map(Delivery::channel).collect();
    assert_eq!(channels, broker.order());
}

#[test]
fn failing_channel_does_not_stop_the_pass() {
    let recorder = Recorder::default();
    let mut broker = broker(10);
    broker.add_observer(Box::new(recorder.clone()));
    broker.add_channel(
        Box::new(
            ScriptedDriver::new(ChannelKind::Pipe)
                .then_error(ChannelError::MalformedPayload("bad frame".to_string())),
        ),
        false,
    );
    broker.add_channel(
        Box::new(ScriptedDriver::new(ChannelKind::Queue).then_message("still here", Some(9))),
        true,
    );

    let deliveries = broker.tick();
    assert_eq!(deliveries.len(), 2);
    assert!(matches!(
        deliveries[0],
        Delivery::Failed {
            channel: ChannelKind::Pipe,
            error: ChannelError::MalformedPayload(_)
        }
    ));
    assert!(matches!(deliveries[1], Delivery::Delivered(_)));
    assert_eq!(
        recorder.events(),
        vec!["error pipe".to_string(), "message queue still here".to_string()]
    );
}

#[test]
fn senders_beyond_capacity_are_denied() {
    let recorder = Recorder::default();
    let mut broker = broker(2);
    broker.add_observer(Box::new(recorder.clone()));
    broker.add_channel(
        Box::new(
            ScriptedDriver::new(ChannelKind::Queue)
                .then_message("one", Some(100))
                .then_message("two", Some(200))
                .then_message("three", Some(300))
                .then_message("again", Some(100)),
        ),
        true,
    );

    let outcomes: Vec<Delivery> = (0..4).flat_map(|_| broker.tick()).collect();
    assert!(matches!(outcomes[0], Delivery::Delivered(_)));
    assert!(matches!(outcomes[1], Delivery::Delivered(_)));
    assert!(matches!(outcomes[2], Delivery::Denied { pid: 300, .. }));
    assert!(matches!(outcomes[3], Delivery::Delivered(_)));

    assert_eq!(broker.registry().len(), 2);
    assert!(broker.registry().get(300).is_none());
    assert_eq!(broker.registry().get(100).unwrap().name, "proc-100");
    assert!(recorder.events().contains(&"denied queue 300".to_string()));
}

#[test]
fn unchecked_channels_bypass_the_registry() {
    let mut broker = broker(1);
    broker.add_channel(
        Box::new(
            ScriptedDriver::new(ChannelKind::Queue)
                .then_message("a", Some(1))
                .then_message("b", Some(2)),
        ),
        false,
    );
    broker.add_channel(
        Box::new(ScriptedDriver::new(ChannelKind::Pipe).then_message("anonymous", None)),
        true,
    );

    let first = broker.tick();
    let second = broker.tick();
    assert!(first
        .iter()
        .chain(second.iter())
        .all(|d| matches!(d, Delivery::Delivered(_))));
    assert!(broker.registry().is_empty());
}

#[test]
fn granted_level_is_the_channel_level() {
    let mut broker = broker(4);
    let mut driver = ScriptedDriver::new(ChannelKind::Queue).then_message("m", Some(77));
    driver.security = SecurityLevel::Medium;
    broker.add_channel(Box::new(driver), true);

    broker.tick();
    assert_eq!(
        broker.registry().get(77).unwrap().security,
        SecurityLevel::Medium
    );
}

#[tokio::test]
async fn run_loops_until_shutdown() {
    let driver = ScriptedDriver::new(ChannelKind::Shm);
    let polls = Arc::clone(&driver.polls);
    let mut broker = broker(10);
    broker.add_channel(Box::new(driver), false);

    broker
        .run(tokio::time::sleep(Duration::from_millis(60)))
        .await;

    let count = polls.load(Ordering::SeqCst);
    assert!(count >= 2, "expected repeated passes, got {count}");
}

#[cfg(target_os = "linux")]
mod live_channels {
    use super::*;
    use neon_ipc::channel::QueueProducer;
    use neon_ipc::{build_cipher, provision};
    use shared_utils::config::Config;
    use tempfile::tempdir;

    #[test]
    fn broker_delivers_from_real_queue() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut config = Config::default();
        config.channels.pipe.path = dir.path().join("process_comm");
        config.channels.queue.path = dir.path().join("data_stream");
        config.channels.shm.path = dir.path().join("shared_cache");
        config.broker.order = vec![ChannelKind::Queue, ChannelKind::Shm, ChannelKind::Pipe];

        let cipher = build_cipher(&config.cipher)?;
        let channels = provision(&config.channels)?;
        let mut broker = Broker::from_config(&config, channels, Arc::clone(&cipher));
        assert_eq!(broker.order(), config.broker.order);

        let producer = QueueProducer::open(&config.channels.queue.path, "it-test", cipher)?;
        producer.send(b"through the broker")?;

        let deliveries = broker.tick();
        broker.remove_channels()?;

        assert_eq!(deliveries.len(), 1);
        match &deliveries[0] {
            Delivery::Delivered(message) => {
                assert_eq!(message.text(), "through the broker");
                assert_eq!(message.sender_pid, Some(producer.pid()));
            }
            other => panic!("unexpected delivery {other:?}"),
        }
        assert!(broker.registry().get(producer.pid()).is_some());
        Ok(())
    }
}
