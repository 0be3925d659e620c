//! Per-endpoint worker: follows one consensus client's head and feeds the shared caches.

use crate::api_types::SseHead;
use crate::beacon_client::BeaconRpc;
use crate::indexer::{Error, Indexer};
use crate::types::{Epoch, Hash256, Slot};
use slog::{debug, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

const MAX_STREAM_BACKOFF: Duration = Duration::from_secs(60);

/// One connected consensus client endpoint and the state the indexer tracks for it.
pub struct ConsensusClient {
    pub id: u16,
    pub name: String,
    pub priority: i32,
    pub skip_validators: bool,
    pub rpc: Arc<dyn BeaconRpc>,
    head: parking_lot::RwLock<Option<(Slot, Hash256)>>,
    last_ensured_epoch: parking_lot::Mutex<Option<Epoch>>,
}

impl ConsensusClient {
    pub fn new(
        id: u16,
        name: String,
        priority: i32,
        skip_validators: bool,
        rpc: Arc<dyn BeaconRpc>,
    ) -> Self {
        ConsensusClient {
            id,
            name,
            priority,
            skip_validators,
            rpc,
            head: parking_lot::RwLock::new(None),
            last_ensured_epoch: parking_lot::Mutex::new(None),
        }
    }

    /// The client's last reported head, if any.
    pub fn head(&self) -> Option<(Slot, Hash256)> {
        *self.head.read()
    }

    pub fn is_ready(&self) -> bool {
        self.head.read().is_some()
    }

    fn set_head(&self, slot: Slot, root: Hash256) {
        *self.head.write() = Some((slot, root));
    }

    fn last_ensured_epoch(&self) -> Option<Epoch> {
        *self.last_ensured_epoch.lock()
    }

    fn set_last_ensured_epoch(&self, epoch: Epoch) {
        *self.last_ensured_epoch.lock() = Some(epoch);
    }
}

/// Consume the client's head event stream until shutdown, reconnecting with exponential
/// backoff when the subscription drops.
pub(crate) async fn run_client_worker(
    indexer: Arc<Indexer>,
    client: Arc<ConsensusClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let log = indexer.log.new(o!("client" => client.name.clone()));
    let mut failed_attempts = 0u32;

    // A node on the wrong chain would poison the cache; check its genesis before following it.
    match client.rpc.genesis().await {
        Ok(genesis) => {
            let expected = indexer.chain().genesis_time;
            if expected != 0 && genesis.genesis_time != expected {
                warn!(
                    log,
                    "Client genesis time mismatch";
                    "expected" => expected,
                    "got" => genesis.genesis_time,
                );
            }
        }
        Err(e) => debug!(log, "Could not fetch genesis"; "error" => %e),
    }

    loop {
        if *shutdown.borrow() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let rpc = client.rpc.clone();
        let mut stream = Box::pin(rpc.stream_head(tx));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                result = &mut stream => {
                    match result {
                        Ok(()) => debug!(log, "Head stream ended"),
                        Err(e) => warn!(log, "Head stream failed"; "error" => %e),
                    }
                    break;
                }
                event = rx.recv() => {
                    match event {
                        Some(head) => {
                            failed_attempts = 0;
                            if let Err(e) = process_head_event(&indexer, &client, &head, &log).await {
                                warn!(
                                    log,
                                    "Error processing head event";
                                    "slot" => %head.slot,
                                    "root" => ?head.block,
                                    "error" => %e,
                                );
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        failed_attempts += 1;
        let backoff = stream_backoff(failed_attempts);
        debug!(log, "Restarting head stream"; "backoff" => ?backoff);
        tokio::select! {
            _ = sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn stream_backoff(failed_attempts: u32) -> Duration {
    let secs = 1u64 << failed_attempts.min(6);
    Duration::from_secs(secs).min(MAX_STREAM_BACKOFF)
}

async fn process_head_event(
    indexer: &Arc<Indexer>,
    client: &Arc<ConsensusClient>,
    head: &SseHead,
    log: &Logger,
) -> Result<(), Error> {
    let slots_per_epoch = indexer.chain().slots_per_epoch;

    backfill_chain(indexer, client, head.block, log).await?;
    client.set_head(head.slot, head.block);

    // Recompute canonical/orphaned flags relative to the new head.
    let low_slot = indexer.cache_low_slot();
    indexer
        .block_cache()
        .set_canonical_chain(head.block, low_slot);

    let epoch = head.slot.epoch(slots_per_epoch);
    let crossed_epoch = client
        .last_ensured_epoch()
        .map_or(true, |last| epoch > last)
        || head.epoch_transition;

    if crossed_epoch {
        // The previous epoch may still be missing votes or duties on this fork.
        if epoch.as_u64() > 0 {
            if let Err(e) = indexer
                .duty_loader()
                .ensure_epoch_stats(epoch - 1, head.block, client)
                .await
            {
                warn!(
                    log,
                    "Could not ensure previous epoch stats";
                    "epoch" => %(epoch - 1),
                    "error" => %e,
                );
            }
        }
        indexer
            .duty_loader()
            .ensure_epoch_stats(epoch, head.block, client)
            .await?;
        client.set_last_ensured_epoch(epoch);

        match client.rpc.finality_checkpoints().await {
            Ok(checkpoints) => indexer.update_finality(checkpoints.finalized, &client.name),
            Err(e) => warn!(log, "Could not fetch finality checkpoints"; "error" => %e),
        }
    }

    Ok(())
}

/// Pull `root` and any unknown ancestors into the block cache, headers and bodies included.
/// Stops at the first already-cached block, at slot zero or at the cache's low watermark.
async fn backfill_chain(
    indexer: &Arc<Indexer>,
    client: &Arc<ConsensusClient>,
    head_root: Hash256,
    log: &Logger,
) -> Result<(), Error> {
    let low_slot = indexer.cache_low_slot();
    let mut root = head_root;

    loop {
        if let Some(existing) = indexer.block_cache().get(root) {
            existing.mark_seen_by(client.id);
            return Ok(());
        }

        let header = match client.rpc.block_header(root).await? {
            Some(header) => header.header.message,
            // Unknown to the client; keep what we have.
            None => return Ok(()),
        };

        let (block, _) = indexer
            .block_cache()
            .put(root, header.slot, header.parent_root, client.id);
        block.set_header(header.clone());
        if !block.has_body() {
            if let Some(body) = client.rpc.block_body(root).await? {
                block.set_body(body.message.body);
            }
        }
        debug!(log, "Cached block"; "slot" => %header.slot, "root" => ?root);

        if header.slot.as_u64() == 0 || header.slot <= low_slot {
            return Ok(());
        }
        root = header.parent_root;
    }
}
