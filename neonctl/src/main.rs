use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use neon_ipc::channel::{
    PipeChannel, PipeProducer, QueueChannel, QueueProducer, ShmChannel, ShmProducer,
};
use neon_ipc::{build_cipher, ChannelKind, PayloadCipher};
use serde::Serialize;
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging, Console, LogOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ChannelArg {
    Pipe,
    Queue,
    Shm,
}

impl From<ChannelArg> for ChannelKind {
    fn from(channel: ChannelArg) -> Self {
        match channel {
            ChannelArg::Pipe => ChannelKind::Pipe,
            ChannelArg::Queue => ChannelKind::Queue,
            ChannelArg::Shm => ChannelKind::Shm,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  neonctl send queue \"Test message 0\"\n  neonctl send pipe hello --repeat 10\n  neonctl status --output json\n  neonctl remove shm")]
struct Args {
    /// Path to the broker configuration file
    #[arg(short, long, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,

    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "warn",
        env = "NEONCTL_LOG_LEVEL"
    )]
    log_level: LogLevelArg,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a message and write it to a channel
    Send {
        #[arg(value_enum)]
        channel: ChannelArg,

        /// Message text
        text: String,

        /// Name announced to the broker (queue only)
        #[arg(long, default_value = "neonctl")]
        name: String,

        /// Send the message this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Send text-only queue frames without sender identity
        #[arg(long)]
        legacy: bool,

        /// How long to wait for the broker to drain the pipe, in milliseconds
        #[arg(long, default_value_t = 2000)]
        linger_ms: u64,
    },
    /// Show the provisioned channels and their permissions
    Status,
    /// Remove channel objects (all channels when none is given)
    Remove {
        #[arg(value_enum)]
        channel: Option<ChannelArg>,
    },
}

#[derive(Serialize)]
struct ChannelStatus {
    channel: String,
    path: String,
    present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ChannelStatus {
    fn new(channel: ChannelKind, path: &Path) -> Self {
        Self {
            channel: channel.to_string(),
            path: path.display().to_string(),
            present: false,
            mode: None,
            pending: None,
            locked: None,
            error: None,
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    match Config::load(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            debug!(path = %path.display(), "No configuration file, using defaults");
            let mut config = Config::new();
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(e).context("failed to load configuration"),
    }
}

#[allow(clippy::too_many_arguments)]
fn send(
    config: &Config,
    cipher: Arc<dyn PayloadCipher>,
    channel: ChannelArg,
    text: &str,
    name: &str,
    repeat: u32,
    legacy: bool,
    linger: Duration,
) -> Result<()> {
    if legacy && channel != ChannelArg::Queue {
        bail!("--legacy only applies to the queue channel");
    }

    match channel {
        ChannelArg::Pipe => {
            let pipe = &config.channels.pipe;
            info!(path = %pipe.path.display(), "Waiting for the broker to open the pipe");
            let mut producer = PipeProducer::open(&pipe.path, pipe.framing, cipher)?;
            for _ in 0..repeat {
                producer.send(text.as_bytes())?;
            }
            if !producer.linger(linger)? {
                warn!("Pipe not drained before timeout; unread data may be lost");
            }
        }
        ChannelArg::Queue => {
            let producer = QueueProducer::open(&config.channels.queue.path, name, cipher)?;
            for _ in 0..repeat {
                if legacy {
                    producer.send_legacy(text.as_bytes())?;
                } else {
                    producer.send(text.as_bytes())?;
                }
            }
        }
        ChannelArg::Shm => {
            let shm = &config.channels.shm;
            let producer = ShmProducer::open(&shm.path, shm.framing, cipher)?;
            for _ in 0..repeat {
                producer.send(text.as_bytes())?;
            }
        }
    }

    info!(channel = %ChannelKind::from(channel), repeat, "Message sent");
    Ok(())
}

fn status(config: &Config) -> Vec<ChannelStatus> {
    let channels = &config.channels;
    let mut rows = Vec::new();

    let mut pipe = ChannelStatus::new(ChannelKind::Pipe, &channels.pipe.path);
    match PipeChannel::open(&channels.pipe.path).and_then(|c| c.mode()) {
        Ok(mode) => {
            pipe.present = true;
            pipe.mode = Some(format!("{mode:o}"));
        }
        Err(e) => pipe.error = Some(e.to_string()),
    }
    rows.push(pipe);

    let mut queue = ChannelStatus::new(ChannelKind::Queue, &channels.queue.path);
    match QueueChannel::open(&channels.queue.path)
        .and_then(|c| Ok((c.mode()?, c.pending()?)))
    {
        Ok((mode, pending)) => {
            queue.present = true;
            queue.mode = Some(format!("{mode:o}"));
            queue.pending = Some(pending);
        }
        Err(e) => queue.error = Some(e.to_string()),
    }
    rows.push(queue);

    let mut shm = ChannelStatus::new(ChannelKind::Shm, &channels.shm.path);
    match ShmChannel::open(&channels.shm.path).and_then(|c| Ok((c.mode()?, c.lock_value()?))) {
        Ok((mode, lock)) => {
            shm.present = true;
            shm.mode = Some(format!("{mode:o}"));
            shm.locked = Some(lock == 0);
        }
        Err(e) => shm.error = Some(e.to_string()),
    }
    rows.push(shm);

    rows
}

fn print_status(output: OutputFormat, rows: &[ChannelStatus]) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Table => {
            for row in rows {
                if !row.present {
                    println!(
                        "{:<6} {:<24} missing ({})",
                        row.channel,
                        row.path,
                        row.error.as_deref().unwrap_or("unknown")
                    );
                    continue;
                }
                let mut line = format!(
                    "{:<6} {:<24} mode {}",
                    row.channel,
                    row.path,
                    row.mode.as_deref().unwrap_or("?")
                );
                if let Some(pending) = row.pending {
                    line.push_str(&format!(", {pending} pending"));
                }
                if let Some(locked) = row.locked {
                    line.push_str(if locked { ", locked" } else { ", unlocked" });
                }
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn remove(config: &Config, channel: Option<ChannelArg>) -> Result<()> {
    let selected: Vec<ChannelKind> = match channel {
        Some(channel) => vec![channel.into()],
        None => ChannelKind::ALL.to_vec(),
    };
    let channels = &config.channels;

    let mut failures = 0;
    for kind in selected {
        let result = match kind {
            ChannelKind::Pipe => PipeChannel::open(&channels.pipe.path).and_then(|c| c.remove()),
            ChannelKind::Queue => {
                QueueChannel::open(&channels.queue.path).and_then(|c| c.remove())
            }
            ChannelKind::Shm => ShmChannel::open(&channels.shm.path).and_then(|c| c.remove()),
        };
        match result {
            Ok(()) => println!("removed {kind}"),
            Err(e) => {
                failures += 1;
                eprintln!("could not remove {kind}: {e}");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} channel(s) could not be removed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(LogOptions {
        level: args.log_level.into(),
        console: Console::Stderr,
        ..Default::default()
    });

    let config = load_config(&args.config)?;

    match args.command {
        Command::Send {
            channel,
            text,
            name,
            repeat,
            legacy,
            linger_ms,
        } => {
            let cipher = build_cipher(&config.cipher)?;
            send(
                &config,
                cipher,
                channel,
                &text,
                &name,
                repeat,
                legacy,
                Duration::from_millis(linger_ms),
            )
        }
        Command::Status => print_status(args.output, &status(&config)),
        Command::Remove { channel } => remove(&config, channel),
    }
}
