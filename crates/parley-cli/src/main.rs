//! Parley command-line chat client.
//!
//! # Usage
//!
//! ```bash
//! # Connect as alice and open a session with bob
//! PARLEY_TOKEN=... parley --server wss://chat.example/ws --identity alice --peer bob
//! ```
//!
//! Session keys live in `--data-dir` and survive restarts. Type `/help` for
//! commands.

mod app;
mod error;
mod input;
mod render;

use std::{path::PathBuf, sync::Arc, time::Duration};

use app::App;
use clap::Parser;
use parley_client::{CoordinatorConfig, Environment, SessionCoordinator, SystemEnv, transport::RealtimeClient};
use parley_core::{CryptoEngine, EngineConfig, TransportConfig};
use parley_vault::{KeyVault, RedbStorage, UnavailableSecureStore, VaultConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley end-to-end encrypted chat
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "End-to-end encrypted realtime chat client")]
#[command(version)]
struct Args {
    /// Websocket endpoint; identity and token are appended
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
    server: String,

    /// Identity to connect as
    #[arg(short, long)]
    identity: String,

    /// Bearer credential
    #[arg(short, long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: String,

    /// Peer to open a session with on startup
    #[arg(short, long)]
    peer: Option<String>,

    /// Directory holding the key vault
    #[arg(long, default_value = "parley-data")]
    data_dir: PathBuf,

    /// Seconds to wait for a peer to answer a key exchange
    #[arg(long, default_value = "120")]
    handshake_timeout: u64,

    /// Days before a session key must be renegotiated
    #[arg(long, default_value = "7")]
    max_session_age: u64,

    /// Gzip frames whose JSON exceeds this many bytes
    #[arg(long)]
    compress_over: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // chat goes to stdout, logs to stderr
    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    tracing::info!(identity = %args.identity, server = %args.server, "Parley starting");

    std::fs::create_dir_all(&args.data_dir)?;
    let storage = RedbStorage::open(args.data_dir.join("vault.redb"))?;
    tracing::warn!("no platform keystore, session keys are stored obfuscated on disk");

    let env = SystemEnv::new();
    let vault = Arc::new(KeyVault::new(storage, UnavailableSecureStore, env.clone(), VaultConfig {
        max_session_age: Duration::from_secs(args.max_session_age * 24 * 60 * 60),
        ..VaultConfig::default()
    }));
    let engine = Arc::new(CryptoEngine::new(env.clone(), EngineConfig::default()));

    let mut coordinator = SessionCoordinator::new(
        args.identity.clone(),
        env.clone(),
        engine,
        vault,
        CoordinatorConfig {
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            ..CoordinatorConfig::default()
        },
    );
    let restored = coordinator.restore(env.now())?;
    if restored > 0 {
        tracing::info!(restored, "resumed stored sessions and key exchanges");
    }

    let (client, events) = RealtimeClient::spawn(env.clone(), TransportConfig {
        base_url: args.server,
        compress_threshold: args.compress_over,
        ..TransportConfig::default()
    });
    client.set_credential(args.token).await?;
    client.connect(args.identity).await?;

    App::new(env, coordinator, client, args.peer).run(events).await?;

    Ok(())
}
