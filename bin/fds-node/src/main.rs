//! FDS node - Storage Manager and Data Manager in one process
//!
//! Peers are not wired in yet: migration messages addressed to other nodes
//! fail with a transport error and the affected migration aborts.

use anyhow::{Context, Result};
use clap::Parser;
use fds_common::{Config, Error, LifecycleSet, NodeUuid, QosDispatcher};
use fds_dm::{DataManager, DmMigrationMsg, DmMigrationTransport};
use fds_placement::{Dlt, DltManager, Dmt, DmtManager};
use fds_sm::{SmMigrationMsg, SmMigrationTransport, StorageManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fds-node")]
#[command(about = "FDS storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/fds/node.toml")]
    config: PathBuf,

    /// Root data directory
    #[arg(long, env = "FDS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node uuid as published in the DLT / DMT (0 picks a random one)
    #[arg(long, env = "FDS_NODE_UUID")]
    node_uuid: Option<u64>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Install a single-node DLT and DMT owning every token and volume
    #[arg(long)]
    standalone: bool,
}

/// Transport for a node without peers
struct NoPeers;

impl SmMigrationTransport for NoPeers {
    fn send(&self, to: NodeUuid, _from: NodeUuid, msg: SmMigrationMsg) -> fds_common::Result<()> {
        Err(Error::transport(format!("no route to {to} for {}", msg.kind())))
    }
}

impl DmMigrationTransport for NoPeers {
    fn send(&self, to: NodeUuid, _from: NodeUuid, _msg: DmMigrationMsg) -> fds_common::Result<()> {
        Err(Error::transport(format!("no route to {to}")))
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        Config::from_toml(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the file
    if let Some(dir) = &args.data_dir {
        config.node.data_dir.clone_from(dir);
    }
    if let Some(uuid) = args.node_uuid {
        config.node.uuid = uuid;
    }
    if config.node.uuid == 0 {
        config.node.uuid = uuid::Uuid::new_v4().as_u64_pair().0;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    config.logging.json |= args.log_json;
    config.validate()?;
    Ok(config)
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging.level, config.logging.json);

    let node = NodeUuid::new(config.node.uuid);
    info!(
        "Starting FDS node {} with data in {}",
        node,
        config.node.data_dir.display()
    );

    let qos = Arc::new(QosDispatcher::new(
        config.qos.max_threads,
        config.qos.default_iops_limit,
    ));
    let dlt = Arc::new(DltManager::for_dlt());
    let dmt = Arc::new(DmtManager::for_dmt());
    let transport = Arc::new(NoPeers);

    let sm = Arc::new(
        StorageManager::open(&config, Arc::clone(&qos), Arc::clone(&dlt), transport.clone())
            .context("opening storage manager")?,
    );
    let dm = Arc::new(
        DataManager::open(&config, Arc::clone(&qos), Arc::clone(&dmt), transport)
            .context("opening data manager")?,
    );

    let mut services = LifecycleSet::new();
    services.add(qos);
    services.add(sm.clone());
    services.add(dm.clone());
    services.start_all().context("starting services")?;

    if args.standalone {
        sm.migration()
            .on_dlt_update(Dlt::round_robin(1, config.sm.token_bits, &[node], 1)?)?;
        dm.on_dmt_update(Dmt::new(1, vec![vec![node]])?)?;
        info!("Standalone placement installed");
    }
    info!("FDS node {} serving {} volumes", node, dm.volume_ids().len());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Shutting down");
    services.stop_all();
    Ok(())
}
