//! Replica placement for a single chunk.

use tracing::{debug, trace, warn};

use crate::chunk::ReplicaRole;
use crate::common::ChunkId;
use crate::error::{PfsError, Result};
use crate::network::Network;

/// Create `chunk_id` on the first `num_replicas` candidates that accept it.
///
/// Candidates are tried in the given order (callers pass a random
/// permutation of the Healthy servers). The first server to accept becomes
/// the primary; later ones are created as secondaries pointing at it. A
/// server that fails CreateChunk is skipped; if it could not be heard from
/// it is also asked to delete the chunk, in case only the reply was lost. If fewer than `num_replicas`
/// servers accept, the accepted allocations are deleted best-effort and
/// placement fails with [`PfsError::InsufficientCapacity`].
///
/// Once every replica is placed the primary is handed the secondaries in
/// replica order; if it cannot take them the chunk is abandoned.
///
/// Returns the replica list, primary first.
pub async fn place_chunk(
    network: &dyn Network,
    candidates: &[String],
    chunk_id: ChunkId,
    size: u64,
    num_replicas: usize,
) -> Result<Vec<String>> {
    let mut accepted: Vec<String> = Vec::with_capacity(num_replicas);

    for candidate in candidates {
        if accepted.len() == num_replicas {
            break;
        }
        let (role, primary) = match accepted.first() {
            None => (ReplicaRole::Primary, None),
            Some(primary) => (ReplicaRole::Secondary, Some(primary.clone())),
        };
        let created = match network.chunk_server(candidate) {
            Ok(service) => service.create_chunk(chunk_id, size, role, primary).await,
            Err(e) => Err(e),
        };
        match created {
            Ok(()) => {
                debug!(%chunk_id, server = %candidate, ?role, "replica placed");
                accepted.push(candidate.clone());
            }
            Err(e) => {
                warn!(%chunk_id, server = %candidate, error = %e, "skipping server");
                if matches!(e, PfsError::Unreachable { .. }) {
                    discard(network, chunk_id, candidate).await;
                }
            }
        }
    }

    if accepted.len() < num_replicas {
        abandon(network, chunk_id, &accepted).await;
        return Err(PfsError::InsufficientCapacity(format!(
            "chunk {chunk_id}: {} of {num_replicas} replicas placed",
            accepted.len()
        )));
    }

    let primary = &accepted[0];
    let secondaries = accepted[1..].to_vec();
    let handed_over = match network.chunk_server(primary) {
        Ok(service) => service.set_replicas(chunk_id, secondaries).await,
        Err(e) => Err(e),
    };
    if let Err(e) = handed_over {
        warn!(%chunk_id, %primary, error = %e, "primary rejected its replica list");
        abandon(network, chunk_id, &accepted).await;
        return Err(e);
    }
    Ok(accepted)
}

/// Delete a chunk a server may hold after a failed CreateChunk. Most of
/// the time it holds nothing.
async fn discard(network: &dyn Network, chunk_id: ChunkId, server: &str) {
    let deleted = match network.chunk_server(server) {
        Ok(service) => service.delete_chunk(chunk_id).await,
        Err(e) => Err(e),
    };
    match deleted {
        Ok(()) => debug!(%chunk_id, %server, "removed chunk left by a failed create"),
        Err(e) => trace!(%chunk_id, %server, error = %e, "nothing to discard"),
    }
}

/// Best-effort deletion of a chunk's allocations.
pub async fn abandon(network: &dyn Network, chunk_id: ChunkId, servers: &[String]) {
    for server in servers {
        let deleted = match network.chunk_server(server) {
            Ok(service) => service.delete_chunk(chunk_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = deleted {
            warn!(%chunk_id, %server, error = %e, "orphaned chunk allocation");
        }
    }
}
