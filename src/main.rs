//! Crash game server binary

use clap::Parser;
use crashpoint::{
    api::ApiServer,
    config::{CrashConfig, StorageBackend},
    storage::{MemoryStorage, RocksStorage, Storage},
};
use std::{path::PathBuf, sync::Arc};

#[derive(Parser, Debug)]
#[command(name = "crashpoint")]
#[command(about = "Multiplier crash game server", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Database directory
    #[arg(long)]
    db_path: Option<String>,

    /// Keep users and rounds in memory only
    #[arg(long)]
    memory: bool,

    /// Allowed CORS origins (comma-separated, use * for all)
    #[arg(long)]
    cors_origins: Option<String>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CrashConfig::load(path)?,
        None => CrashConfig::default(),
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.storage.data_directory = db_path;
    }
    if args.memory {
        config.storage.backend = StorageBackend::Memory;
    }
    if let Some(origins) = args.cors_origins {
        config.server.allowed_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(timeout) = args.timeout {
        config.server.request_timeout_secs = timeout;
    }
    if let Ok(secret) = std::env::var("ADMIN_SECRET") {
        config.admin.secret = Some(secret);
    }
    config.validate()?;

    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => {
            println!("Using in-memory storage; nothing survives a restart");
            Arc::new(MemoryStorage::new())
        }
        StorageBackend::RocksDb => {
            println!("Opening database: {}", config.storage.data_directory);
            Arc::new(RocksStorage::open(&config.storage.data_directory)?)
        }
    };

    ApiServer::new(config, storage).run().await
}
