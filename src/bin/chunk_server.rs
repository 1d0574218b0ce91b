use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pfs::chunkserver::Chunkserver;
use pfs::config::{parse_byte_size, Config, StorageBackend};
use pfs::network::{ChunkService, Network, TcpNetwork};
use pfs::rpc::{serve, ChunkServiceHandler};
use pfs::storage::{ChunkStorage, FileStorage, MemoryStorage};
use tokio::net::TcpListener;
use tracing::info;

/// pfs chunk server: holds chunk buffers and replicates writes.
#[derive(Parser, Debug)]
#[command(name = "pfs-chunk-server", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen_port: Option<u16>,

    /// Address registered with the controller
    #[arg(long)]
    self_address: Option<String>,

    #[arg(long)]
    controller_address: Option<String>,

    /// Store chunks as files under this directory instead of in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Upper bound on allocated chunk bytes, e.g. `"4 GiB"`
    #[arg(long)]
    storage_limit: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(address) = args.self_address {
        config.self_address = Some(address);
    }
    if let Some(address) = args.controller_address {
        config.controller_address = address;
    }
    if let Some(dir) = args.data_dir {
        config.storage.backend = StorageBackend::File;
        config.storage.data_dir = dir;
    }
    if let Some(limit) = &args.storage_limit {
        config.storage.limit_bytes = parse_byte_size(limit)?;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;
    pfs::logging::init(&config.log_level);

    let network: Arc<dyn Network> = Arc::new(TcpNetwork::new(config.rpc_timeout()));
    let address = config.advertised_address();
    let controller = Some(config.controller_address.clone());
    let limit = config.storage.limit_bytes;

    match config.storage.backend {
        StorageBackend::Memory => {
            let storage = MemoryStorage::new(limit);
            run(&config, Chunkserver::new(address, controller, network, storage)).await
        }
        StorageBackend::File => {
            let storage = FileStorage::new(&config.storage.data_dir, limit)
                .with_context(|| format!("opening {}", config.storage.data_dir.display()))?;
            run(&config, Chunkserver::new(address, controller, network, storage)).await
        }
    }
}

async fn run<S: ChunkStorage>(config: &Config, chunkserver: Chunkserver<S>) -> anyhow::Result<()> {
    let chunkserver = Arc::new(chunkserver);
    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("binding port {}", config.listen_port))?;
    info!(
        address = %chunkserver.id,
        port = config.listen_port,
        backend = ?config.storage.backend,
        "chunk server listening"
    );

    let service: Arc<dyn ChunkService> = chunkserver.clone();
    let mut server = tokio::spawn(serve(listener, Arc::new(ChunkServiceHandler(service))));

    chunkserver
        .register()
        .await
        .with_context(|| format!("registering with controller {}", config.controller_address))?;

    tokio::select! {
        served = &mut server => served??,
        _ = tokio::signal::ctrl_c() => {
            let stats = chunkserver.storage_stats();
            info!(chunks = stats.chunks, allocated_bytes = stats.allocated_bytes, "chunk server shutting down");
        }
    }
    Ok(())
}
