use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use byte_unit::Byte;
use clap::{Parser, Subcommand};
use pfs::common::{hex, sha256sum};
use pfs::config::{parse_byte_size, Config};
use pfs::{BlobId, Client, TcpNetwork};
use tokio::io::BufWriter;

/// pfs client: upload and download blobs.
#[derive(Parser, Debug)]
#[command(name = "pfs-client", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    controller_address: Option<String>,

    /// Must match the controller's chunk capacity
    #[arg(long)]
    chunk_capacity: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file as a new blob
    Upload {
        file: PathBuf,
        /// Copies of every chunk; 0 uses the controller's default
        #[arg(short, long, default_value_t = 0)]
        replicas: u32,
    },
    /// Download a blob into a file
    Download { blob_id: BlobId, out: PathBuf },
    /// Show a blob's chunks and replicas
    Stat { blob_id: BlobId },
    /// Compare every replica of a blob
    Verify { blob_id: BlobId },
    /// List registered chunk servers
    Servers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(address) = args.controller_address {
        config.controller_address = address;
    }
    if let Some(capacity) = &args.chunk_capacity {
        config.chunk_capacity = parse_byte_size(capacity)?;
    }
    config.log_level = args.log_level.unwrap_or_else(|| "warn".to_string());
    config.validate()?;
    pfs::logging::init(&config.log_level);

    let network = Arc::new(TcpNetwork::new(config.rpc_timeout()));
    let client = Client::new(&config, network);

    match args.command {
        Command::Upload { file, replicas } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let meta = client.upload(&data, replicas).await?;
            println!("{}", meta.blob_id);
            println!("size    {:#}", Byte::from_u64(meta.size_bytes));
            println!("chunks  {}", meta.chunks.len());
            println!("status  {:?}", meta.status);
            println!("sha256  {}", hex(&sha256sum(&data)));
        }
        Command::Download { blob_id, out } => {
            let file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("creating {}", out.display()))?;
            let bytes = client.download_to(blob_id, BufWriter::new(file)).await?;
            let written = tokio::fs::read(&out).await?;
            println!("wrote {:#} to {}", Byte::from_u64(bytes), out.display());
            println!("sha256  {}", hex(&sha256sum(&written)));
        }
        Command::Stat { blob_id } => {
            let meta = client.stat(blob_id).await?;
            println!("blob    {}", meta.blob_id);
            println!("status  {:?}", meta.status);
            println!("size    {:#}", Byte::from_u64(meta.size_bytes));
            for (i, chunk) in meta.chunks.iter().enumerate() {
                println!("chunk {i:<4} {}  {}", chunk.chunk_id, chunk.replicas.join(" "));
            }
        }
        Command::Verify { blob_id } => {
            let report = client.verify(blob_id).await?;
            for (i, chunk) in report.chunks.iter().enumerate() {
                let verdict = if chunk.is_consistent() { "ok" } else { "MISMATCH" };
                println!("chunk {i:<4} {}  {verdict}", chunk.chunk_id);
                for replica in &chunk.replicas {
                    match &replica.info {
                        Ok(info) => println!(
                            "    {:<24} {:?} {:?} {}/{} crc32={:08x}",
                            replica.address,
                            info.role,
                            info.status,
                            info.committed_bytes,
                            info.capacity,
                            info.checksum
                        ),
                        Err(reason) => println!("    {:<24} error: {reason}", replica.address),
                    }
                }
            }
            if !report.is_consistent() {
                bail!("blob {blob_id} has diverging replicas");
            }
        }
        Command::Servers => {
            for server in client.list_servers().await? {
                println!(
                    "{:<24} {:?} {} chunks",
                    server.address, server.status, server.resident_chunks
                );
            }
        }
    }
    Ok(())
}
