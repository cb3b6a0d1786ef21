#![warn(missing_docs)]

//! Tidemark metadata node

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tidemark_meta::{CommandLog, FileKvStore, KvStore, MemoryKvStore, MetaConfig, MetaStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tdm-meta")]
#[command(about = "Tidemark metadata node", long_about = None)]
struct Args {
    /// Path to a .toml or .json configuration file.
    #[arg(short, long, default_value = "/etc/tidemark/meta.toml")]
    config: PathBuf,

    /// Overrides the configured data directory.
    #[arg(short, long, env = "TDM_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        MetaConfig::from_file(&args.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", args.config.display());
        MetaConfig::default()
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    tracing::info!(url = %config.bind_url, "Tidemark metadata node starting...");

    // Command log and node-local state get one store each.
    let (log_kv, state_kv): (Arc<dyn KvStore>, Arc<dyn KvStore>) = match &config.data_dir {
        Some(dir) => (
            Arc::new(FileKvStore::open(&dir.join("log"))?),
            Arc::new(FileKvStore::open(&dir.join("state"))?),
        ),
        None => {
            tracing::warn!("No data_dir configured, metadata will not survive a restart");
            (Arc::new(MemoryKvStore::new()), Arc::new(MemoryKvStore::new()))
        }
    };

    let log = Arc::new(CommandLog::open(log_kv, &config.command_log)?);
    let store = MetaStore::new(config.clone(), log, state_kv);
    store.open()?;

    let node = store.initialize().await?;
    tracing::info!(node_id = %node.id, url = %node.url, "node registered");

    store.start_retention_policy_enforcement(config.retention_check_interval())?;
    store.start_shard_group_precreation(
        config.shard_group_precreate_check_interval(),
        config.shard_group_precreate_advance(),
    )?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    store.close().await?;
    Ok(())
}
