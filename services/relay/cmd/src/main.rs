//! chat-relay service binary.
//!
//! Bootstraps the session core: loads configuration, initializes logging,
//! wires the storage layer, ingestion pipeline and session registry, runs
//! the startup session-restoration sweep, and drains all sessions cleanly
//! on ctrl-c. The HTTP front door mounts on [`relay_api::RelayApi`] from an
//! embedding process; this binary runs the core itself.

use anyhow::Result;
use clap::Parser;
use relay_api::RelayApi;
use relay_ingest::IngestPipeline;
use relay_session::{DevConnector, ReconnectPolicy, SessionRegistry};
use relay_storage::{Storage, UserId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::RelayConfig;

/// Multi-tenant session manager for an external messaging network
#[derive(Parser, Debug)]
#[command(name = "chat-relay", version, about = "Multi-tenant external-messaging session manager")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Reconnect delay, e.g. 5s (overrides config)
    #[arg(long)]
    reconnect_delay: Option<humantime::Duration>,

    /// Message retention window, e.g. 24h (overrides config)
    #[arg(long)]
    retention_window: Option<humantime::Duration>,

    /// Storage mode: memory, redis (overrides config)
    #[arg(long)]
    storage_mode: Option<String>,

    /// Redis connection URL (overrides config)
    #[arg(long)]
    redis_url: Option<String>,

    /// Start a session for this user at boot (repeatable)
    #[arg(long)]
    connect_user: Vec<String>,

    /// Skip the startup session-restoration sweep
    #[arg(long)]
    no_restore: bool,

    /// Interval between status heartbeat log lines
    #[arg(long, default_value = "60s")]
    heartbeat_interval: humantime::Duration,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("chat_relay={}", args.log_level).parse()?)
        .add_directive(format!("relay_session={}", args.log_level).parse()?)
        .add_directive(format!("relay_storage={}", args.log_level).parse()?)
        .add_directive(format!("relay_ingest={}", args.log_level).parse()?)
        .add_directive(format!("relay_api={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!("Starting chat-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load_from_file(&args.config)?;
    if let Some(delay) = args.reconnect_delay {
        config.reconnect_delay = delay.into();
    }
    if let Some(window) = args.retention_window {
        config.retention_window = window.into();
    }
    if let Some(mode) = args.storage_mode {
        config.storage_mode = mode;
    }
    if let Some(url) = args.redis_url {
        config.redis_url = url;
    }

    let storage = Storage::from_mode(config.storage()).await?;
    let ingest = Arc::new(IngestPipeline::new(
        Arc::clone(&storage.messages),
        config.retention_window,
    ));

    // The real protocol client is provided by the embedding system; until
    // one is wired in, sessions run against the development transport
    warn!("No protocol client configured; sessions use the development transport");
    let connector = Arc::new(DevConnector::default());

    let registry = Arc::new(SessionRegistry::new(
        connector,
        Arc::clone(&storage.auth),
        ingest,
        ReconnectPolicy::new(config.reconnect_delay),
    ));

    // The front door mounts on this facade
    let api = Arc::new(RelayApi::new(
        Arc::clone(&registry),
        Arc::clone(&storage.messages),
    ));

    if !args.no_restore {
        let restored = registry.restore_sessions().await;
        if restored > 0 {
            info!("Restored {} session(s) from persisted state", restored);
        }
    }

    for user in &args.connect_user {
        let user = UserId::from(user.as_str());
        let response = api.connect(&user);
        info!(
            "Session requested for user {} (connected={}, pairing pending={})",
            user,
            response.connected,
            response.pairing_artifact.is_some()
        );
    }

    let heartbeat_interval: Duration = args.heartbeat_interval.into();
    let heartbeat_registry = Arc::clone(&registry);
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it
        interval.tick().await;
        loop {
            interval.tick().await;
            info!("{} active session(s)", heartbeat_registry.active_count());
        }
    });

    info!("chat-relay running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, draining sessions");
    heartbeat.abort();
    registry.shutdown().await;
    info!("chat-relay stopped");

    Ok(())
}
