//! NeonIPC broker daemon
//!
//! Provisions the named pipe, message queue and shared memory mailbox, then
//! polls them until SIGINT or SIGTERM arrives.

use anyhow::Context;
use clap::Parser;
use neon_broker::Broker;
use neon_ipc::{build_cipher, provision};
use shared_utils::config::{Config, ConfigError};
use shared_utils::logging::{init_logging, init_logging_from_config, LogOptions};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Command-line arguments for the broker
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,

    /// Log level, overriding the configuration
    #[clap(short, long)]
    log_level: Option<String>,
}

fn load_config(path: &Path) -> Result<(Config, bool), ConfigError> {
    match Config::load(path) {
        Ok(config) => Ok((config, true)),
        Err(ConfigError::FileNotFound(_)) => {
            let mut config = Config::new();
            config.apply_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            Ok((config, false))
        }
        Err(e) => Err(e),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (mut config, from_file) = match load_config(&args.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            let _guard = init_logging(LogOptions::default());
            error!(path = %args.config.display(), error = %e, "Invalid configuration");
            return Err(e).context("failed to load configuration");
        }
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let _guard = init_logging_from_config(&config);
    info!("NeonIPC broker starting up");
    if from_file {
        info!(path = %args.config.display(), "Loaded configuration");
    } else {
        warn!(
            path = %args.config.display(),
            "Configuration file not found, using defaults"
        );
    }

    let cipher = build_cipher(&config.cipher).context("failed to initialise payload cipher")?;

    let channels = match provision(&config.channels) {
        Ok(channels) => channels,
        Err(e) => {
            error!(error = %e, "Failed to provision channels");
            return Err(e).context("failed to provision channels");
        }
    };

    info!(
        pipe = %config.channels.pipe.path.display(),
        queue = %config.channels.queue.path.display(),
        shm = %config.channels.shm.path.display(),
        "NeonIPC broker listening"
    );

    let mut broker = Broker::from_config(&config, channels, cipher);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    };

    broker.run(shutdown).await;

    if config.broker.remove_on_shutdown {
        if let Err(e) = broker.remove_channels() {
            warn!(error = %e, "Some channels could not be removed");
        }
    }

    info!("NeonIPC broker shut down");
    Ok(())
}
