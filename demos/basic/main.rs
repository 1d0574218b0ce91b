use std::sync::Arc;

use byte_unit::Byte;
use pfs::chunkserver::Chunkserver;
use pfs::common::{hex, sha256sum};
use pfs::config::Config;
use pfs::controller::Controller;
use pfs::network::{ChunkService, ControllerService, NetworkShim};
use pfs::storage::MemoryStorage;
use pfs::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pfs::logging::init("info");

    let mut config = Config {
        chunk_capacity: 4 * 1024,
        ..Config::default()
    };
    config.client.write_size = 1024;
    config.validate()?;

    let network = Arc::new(NetworkShim::new());

    // Setup controller.
    println!("Creating controller.\n");
    let controller: Arc<dyn ControllerService> = Arc::new(Controller::new(&config, network.clone()));
    network.add_controller(&config.controller_address, &controller);

    // Setup chunkserver 1-N.
    let n_chunkservers = 3;
    let mut chunkservers = Vec::new();
    for i in 0..n_chunkservers {
        let address = format!("127.0.0.1:{}", 5000 + i);
        println!("Creating chunkserver {address}.");
        let chunkserver = Arc::new(Chunkserver::new(
            address.clone(),
            Some(config.controller_address.clone()),
            network.clone(),
            MemoryStorage::new(1024 * 1024),
        ));
        chunkserver.register().await?;
        let service: Arc<dyn ChunkService> = chunkserver.clone();
        network.add_node(&address, &service);
        chunkservers.push(chunkserver);
    }

    // Setup client.
    println!("\nCreating client.\n");
    let client = Client::new(&config, network.clone());

    let data: Vec<u8> = "hello world\n".bytes().cycle().take(10_000).collect();
    let meta = client.upload(&data, 2).await?;
    println!(
        "uploaded blob {} ({:#}, {} chunks, {:?})",
        meta.blob_id,
        Byte::from_u64(meta.size_bytes),
        meta.chunks.len(),
        meta.status
    );
    for (i, chunk) in meta.chunks.iter().enumerate() {
        println!("  chunk {i} {} on {}", chunk.chunk_id, chunk.replicas.join(", "));
    }

    let downloaded = client.download(meta.blob_id).await?;
    println!("\nsha256 uploaded:   {}", hex(&sha256sum(&data)));
    println!("sha256 downloaded: {}", hex(&sha256sum(&downloaded)));

    let report = client.verify(meta.blob_id).await?;
    println!("replicas consistent: {}\n", report.is_consistent());

    for server in client.list_servers().await? {
        println!("{} {:?} {} chunks", server.address, server.status, server.resident_chunks);
    }
    for chunkserver in &chunkservers {
        let stats = chunkserver.storage_stats();
        println!(
            "{} used {:#} of {:#}",
            chunkserver.id,
            Byte::from_u64(stats.allocated_bytes),
            Byte::from_u64(stats.limit_bytes)
        );
    }
    Ok(())
}
