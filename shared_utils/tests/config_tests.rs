use shared_utils::config::{
    ChannelKind, CipherAlgorithm, Config, ConfigError, EvictionPolicy, Framing, SecurityLevel,
};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_broker_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"

        [logging]
        log_to_file = true
        log_dir = "/tmp/neonipc-logs"

        [broker]
        tick_interval_ms = 50
        order = ["queue", "shm", "pipe"]
        remove_on_shutdown = true

        [cipher]
        algorithm = "aes-gcm"
        key = "a much better passphrase"

        [registry]
        capacity = 32
        eviction = "oldest-activity"

        [channels.pipe]
        path = "/tmp/process_comm"
        security = "medium"
        framing = "length-prefixed"

        [channels.queue]
        path = "/tmp/data_stream"
        security = "high"
        authorize = false

        [channels.shm]
        path = "/tmp/shared_cache"
        security = "low"
        framing = "length-prefixed"
        size = 4096
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert!(config.logging.log_to_file);
    assert_eq!(config.logging.log_dir, "/tmp/neonipc-logs");
    assert_eq!(config.broker.tick_interval_ms, 50);
    assert_eq!(
        config.broker.order,
        vec![ChannelKind::Queue, ChannelKind::Shm, ChannelKind::Pipe]
    );
    assert!(config.broker.remove_on_shutdown);
    assert_eq!(config.cipher.algorithm, CipherAlgorithm::AesGcm);
    assert_eq!(config.registry.capacity, 32);
    assert_eq!(config.registry.eviction, EvictionPolicy::OldestActivity);
    assert_eq!(config.channels.pipe.path, PathBuf::from("/tmp/process_comm"));
    assert_eq!(config.channels.pipe.security, SecurityLevel::Medium);
    assert_eq!(config.channels.pipe.framing, Framing::LengthPrefixed);
    assert!(!config.channels.queue.authorize);
    assert_eq!(config.channels.shm.security, SecurityLevel::Low);
    assert_eq!(config.channels.shm.size, 4096);
}

#[test]
fn test_partial_config_uses_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[channels.queue]\npath = \"my_queue\"\n")
        .unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "info");
    assert_eq!(config.channels.queue.path, PathBuf::from("my_queue"));
    assert_eq!(config.channels.queue.security, SecurityLevel::High);
    assert!(config.channels.queue.authorize);
    assert_eq!(config.channels.pipe.path, PathBuf::from("process_comm"));
    assert_eq!(config.channels.shm.path, PathBuf::from("shared_cache"));
    assert_eq!(config.cipher.key, "neon_ipc_key");
    assert_eq!(config.registry.capacity, 10);
    assert_eq!(config.broker.order, ChannelKind::ALL.to_vec());
}

#[test]
fn test_missing_file() {
    let result = Config::load("/definitely/not/here/neonipc.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_malformed_toml() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[broker\ntick_interval_ms = 5").unwrap();
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::TomlError(_))
    ));
}

#[test]
fn test_unknown_security_level_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[channels.pipe]\nsecurity = \"paranoid\"\n")
        .unwrap();
    assert!(Config::load(file.path()).is_err());
}

#[test]
fn test_invalid_order_rejected_on_load() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[broker]\norder = [\"pipe\", \"pipe\", \"shm\"]\n")
        .unwrap();

    match Config::load(file.path()) {
        Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "broker.order"),
        other => panic!("expected invalid broker.order, got {other:?}"),
    }
}

#[test]
fn test_save_and_reload() {
    let file = NamedTempFile::new().unwrap();

    let mut config = Config::new();
    config.channels.shm.size = 2048;
    config.registry.eviction = EvictionPolicy::OldestActivity;
    config.save(file.path()).unwrap();

    let loaded = Config::load(file.path()).unwrap();
    assert_eq!(loaded.channels.shm.size, 2048);
    assert_eq!(loaded.registry.eviction, EvictionPolicy::OldestActivity);
}
