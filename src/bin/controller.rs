use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pfs::config::{parse_byte_size, Config};
use pfs::rpc::{serve, ControllerHandler};
use pfs::{Controller, ControllerService, TcpNetwork};
use tokio::net::TcpListener;
use tracing::info;

/// pfs controller: chunk server registry and blob placement.
#[derive(Parser, Debug)]
#[command(name = "pfs-controller", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    listen_port: Option<u16>,

    /// Chunk capacity, e.g. `4096` or `"64 MiB"`
    #[arg(long)]
    chunk_capacity: Option<String>,

    #[arg(long)]
    default_replication_factor: Option<u32>,

    #[arg(long)]
    log_level: Option<String>,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.dump_default_config {
        println!("{}", serde_json::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(capacity) = &args.chunk_capacity {
        config.chunk_capacity = parse_byte_size(capacity)?;
    }
    if let Some(factor) = args.default_replication_factor {
        config.default_replication_factor = factor;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate()?;
    pfs::logging::init(&config.log_level);

    let network = Arc::new(TcpNetwork::new(config.rpc_timeout()));
    let controller: Arc<dyn ControllerService> = Arc::new(Controller::new(&config, network));

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("binding port {}", config.listen_port))?;
    info!(
        port = config.listen_port,
        chunk_capacity = config.chunk_capacity,
        default_replication_factor = config.default_replication_factor,
        "controller listening"
    );

    tokio::select! {
        served = serve(listener, Arc::new(ControllerHandler(controller))) => served?,
        _ = tokio::signal::ctrl_c() => info!("controller shutting down"),
    }
    Ok(())
}
