//! A cluster talking over real TCP sockets on ephemeral ports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pfs::chunk::ReplicaRole;
use pfs::chunkserver::Chunkserver;
use pfs::rpc::{serve, ChunkServiceHandler, ControllerHandler};
use pfs::storage::{FileStorage, MemoryStorage};
use pfs::{
    BlobId, BlobStatus, ChunkId, ChunkService, Client, Config, Controller, ControllerService,
    Network, PfsError, TcpNetwork,
};
use tokio::net::TcpListener;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

fn network() -> Arc<TcpNetwork> {
    Arc::new(TcpNetwork::new(Duration::from_secs(5)))
}

/// Start a controller and `num_servers` memory-backed chunk servers.
async fn start(num_servers: usize, chunk_capacity: u64) -> Config {
    let (listener, controller_address) = listen().await;
    let mut config = Config {
        controller_address,
        chunk_capacity,
        ..Config::default()
    };
    config.client.write_size = 7;
    config.client.read_size = 5;

    let controller: Arc<dyn ControllerService> = Arc::new(Controller::new(&config, network()));
    tokio::spawn(serve(listener, Arc::new(ControllerHandler(controller))));

    for _ in 0..num_servers {
        let (listener, address) = listen().await;
        let chunkserver = Arc::new(Chunkserver::new(
            address,
            Some(config.controller_address.clone()),
            network(),
            MemoryStorage::new(1 << 20),
        ));
        let service: Arc<dyn ChunkService> = chunkserver.clone();
        tokio::spawn(serve(listener, Arc::new(ChunkServiceHandler(service))));
        chunkserver.register().await.unwrap();
    }
    config
}

#[tokio::test]
async fn upload_and_download_over_tcp() {
    let config = start(3, 32).await;
    let client = Client::new(&config, network());

    let data: Vec<u8> = (0..100u8).collect();
    let meta = client.upload(&data, 2).await.unwrap();
    assert_eq!(meta.status, BlobStatus::Sealed);
    assert_eq!(meta.chunks.len(), 4);
    assert_eq!(client.download(meta.blob_id).await.unwrap(), data);
    assert!(client.verify(meta.blob_id).await.unwrap().is_consistent());

    let servers = client.list_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().map(|s| s.resident_chunks).sum::<u64>(), 8);
}

#[tokio::test]
async fn remote_errors_keep_their_kind() {
    let config = start(2, 4).await;
    let network = network();
    let controller = network.controller(&config.controller_address).unwrap();

    assert!(matches!(
        controller.create_blob(4, 3).await,
        Err(PfsError::InsufficientCapacity(_))
    ));
    assert!(matches!(
        controller.get_blob_metadata(BlobId::new()).await,
        Err(PfsError::NotFound(_))
    ));
    assert!(matches!(
        controller.add_chunk_server("not an address".into()).await,
        Err(PfsError::MalformedAddress(_))
    ));

    let meta = controller.create_blob(4, 2).await.unwrap();
    let chunk = &meta.chunks[0];
    let primary = network.chunk_server(&chunk.replicas[0]).unwrap();
    assert!(matches!(
        primary.write_chunk(chunk.chunk_id, 0, b"abcde".to_vec()).await,
        Err(PfsError::OverflowsCapacity(_))
    ));
    primary.write_chunk(chunk.chunk_id, 0, b"ab".to_vec()).await.unwrap();
    assert!(matches!(
        primary.write_chunk(chunk.chunk_id, 0, b"z".to_vec()).await,
        Err(PfsError::WriteOutOfOrder(_))
    ));
    assert!(matches!(
        primary.read_chunk(ChunkId::new(), 0, 1).await,
        Err(PfsError::NotFound(_))
    ));
    assert!(matches!(
        primary
            .create_chunk(chunk.chunk_id, 4, ReplicaRole::Primary, None)
            .await,
        Err(PfsError::AlreadyExists(_))
    ));

    let secondary = network.chunk_server(&chunk.replicas[1]).unwrap();
    assert_eq!(secondary.read_chunk(chunk.chunk_id, 0, 0).await.unwrap(), b"ab");
}

#[tokio::test]
async fn dead_address_is_unreachable() {
    let (listener, address) = listen().await;
    drop(listener);
    let network = TcpNetwork::new(Duration::from_millis(500));
    let err = network
        .chunk_server(&address)
        .unwrap()
        .list_chunks()
        .await
        .unwrap_err();
    assert!(matches!(err, PfsError::Unreachable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn silent_server_hits_the_deadline() {
    let (listener, address) = listen().await;
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });

    let network = TcpNetwork::new(Duration::from_millis(200));
    let started = Instant::now();
    let err = network
        .chunk_server(&address)
        .unwrap()
        .list_chunks()
        .await
        .unwrap_err();
    assert!(matches!(err, PfsError::Unreachable { .. }));
    assert!(err.to_string().contains("deadline exceeded"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn file_backed_chunk_server() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, address) = listen().await;
    let chunkserver = Arc::new(Chunkserver::new(
        address.clone(),
        None,
        network(),
        FileStorage::new(dir.path(), 1 << 20).unwrap(),
    ));
    let service: Arc<dyn ChunkService> = chunkserver.clone();
    tokio::spawn(serve(listener, Arc::new(ChunkServiceHandler(service))));

    let remote = network().chunk_server(&address).unwrap();
    let id = ChunkId::new();
    remote.create_chunk(id, 6, ReplicaRole::Primary, None).await.unwrap();
    remote.set_replicas(id, Vec::new()).await.unwrap();
    remote.write_chunk(id, 0, b"abc".to_vec()).await.unwrap();
    remote.write_chunk(id, 3, b"def".to_vec()).await.unwrap();
    assert_eq!(remote.read_chunk(id, 1, 4).await.unwrap(), b"bcde");
    assert_eq!(remote.list_chunks().await.unwrap(), vec![id]);
    assert_eq!(chunkserver.storage_stats().allocated_bytes, 6);

    remote.delete_chunk(id).await.unwrap();
    assert_eq!(chunkserver.storage_stats().allocated_bytes, 0);
    assert!(remote.list_chunks().await.unwrap().is_empty());
}
