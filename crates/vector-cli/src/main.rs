//! Thin CLI wrapper around `vector-core`: `start` runs the inbox model in
//! the foreground until interrupted, `dump` prints the viewer's stored
//! state as JSON, `stop` just points at how a running `start` is stopped,
//! since nothing here is a background daemon with an IPC channel.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use vector_core::model::EventId;
use vector_core::store::Timeline;
use vector_core::{EventStore, FileKeyStore, InboxConfig, InboxError, InboxModel, KeyStore, TungsteniteTransport};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Inbox(#[from] InboxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Parser)]
#[command(name = "vector-cli", about = "CLI client for the Vector inbox core")]
struct Opts {
    /// Directory holding the LMDB environment and the viewer's key file.
    #[arg(long, env = "VECTOR_DATA_DIR", default_value = "./vector-data")]
    data_dir: PathBuf,
    /// Comma-separated default relay set used for cold start.
    #[arg(long, env = "VECTOR_DEFAULT_RELAYS")]
    default_relays: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstraps the viewer's relay topology and runs the ingest loop.
    Start,
    /// There is no background daemon to signal; explains how to stop `start`.
    Stop,
    /// Prints the viewer's stored profile, follows, relays, and recent timelines.
    Dump,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_config(opts: &Opts) -> Result<InboxConfig, CliError> {
    let mut config = InboxConfig::default();
    if let Some(relays) = &opts.default_relays {
        config.default_relays = relays
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    config.validate().map_err(|e| CliError::Config(e.to_string()))?;
    Ok(config)
}

fn key_path(opts: &Opts) -> PathBuf {
    opts.data_dir.join("viewer.key")
}

fn store_path(opts: &Opts) -> PathBuf {
    opts.data_dir.join("store")
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    init_logging();
    let opts = Opts::parse();
    std::fs::create_dir_all(&opts.data_dir)?;

    match opts.command {
        Command::Start => run_start(&opts).await,
        Command::Stop => {
            println!("vector-cli has no background daemon; interrupt a running `start` with Ctrl-C to stop it gracefully.");
            Ok(())
        }
        Command::Dump => run_dump(&opts).await,
    }
}

async fn run_start(opts: &Opts) -> Result<(), CliError> {
    let config = load_config(opts)?;
    let key_path = key_path(opts);
    if !key_path.exists() {
        tracing::info!(path = %key_path.display(), "generating a new viewer key");
        FileKeyStore::generate_and_save(&key_path).map_err(InboxError::from)?;
    }
    let keystore = FileKeyStore::new(key_path);
    let store = Arc::new(EventStore::open(&store_path(opts), &config.store).map_err(InboxError::from)?);
    let model = InboxModel::<TungsteniteTransport>::new(config, store, &keystore)?;

    model.start().await?;
    tracing::info!("inbox model running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    model.stop().await;
    Ok(())
}

async fn run_dump(opts: &Opts) -> Result<(), CliError> {
    let config = load_config(opts)?;
    let keystore = FileKeyStore::new(key_path(opts));
    let viewer = keystore.load().map_err(InboxError::from)?;
    let viewer_pubkey = vector_core::model::PubKey::from_bytes(viewer.public_key().to_bytes());
    let store = EventStore::open(&store_path(opts), &config.store).map_err(InboxError::from)?;

    let (profile, profile_updated_at) = store.get_profile(&viewer_pubkey).map_err(InboxError::from)?;
    let follows = store.get_follows(&viewer_pubkey).map_err(InboxError::from)?;
    let general_relays = store.get_general_relays(&viewer_pubkey).map_err(InboxError::from)?;
    let dm_relays = store.get_dm_relays(&viewer_pubkey).map_err(InboxError::from)?;
    let post_ids = store
        .get_timeline_ids(Timeline::Post, &viewer_pubkey, 20)
        .map_err(InboxError::from)?;
    let chat_ids = store
        .get_timeline_ids(Timeline::Chat, &viewer_pubkey, 20)
        .map_err(InboxError::from)?;
    let relay_counters = store.get_all_relay_counters().map_err(InboxError::from)?;

    let dump = serde_json::json!({
        "viewer": viewer_pubkey.to_hex(),
        "profile": profile,
        "profile_updated_at": profile_updated_at,
        "follow_count": follows.len(),
        "general_relays": general_relays.iter().map(|r| r.uri.clone()).collect::<Vec<_>>(),
        "dm_relays": dm_relays.iter().map(|r| r.uri.clone()).collect::<Vec<_>>(),
        "recent_post_event_ids": post_ids.iter().map(EventId::to_hex).collect::<Vec<_>>(),
        "recent_chat_event_ids": chat_ids.iter().map(EventId::to_hex).collect::<Vec<_>>(),
        "relay_counters": relay_counters.into_iter().map(|(relay, counters)| serde_json::json!({
            "relay": relay,
            "invalid_events": counters.invalid_events,
            "decrypt_errors": counters.decrypt_errors,
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
