//! Epoch backfill.
//!
//! The live pipeline only persists epochs it watched happen. Anything older (an indexer that
//! started late, or downtime) is caught up here: blocks, duties and votes for one epoch at a
//! time are fetched straight from a client and written through the same transactional path,
//! resuming from the stored sync state.

use crate::indexer::duty_loader::load_validator_stats;
use crate::indexer::votes::aggregate_epoch_votes;
use crate::indexer::{Error, Indexer};
use crate::types::{Epoch, Slot};
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

const SYNC_MAX_BACKOFF: Duration = Duration::from_secs(120);

pub(crate) async fn run_synchronizer(indexer: Arc<Indexer>, mut shutdown: watch::Receiver<bool>) {
    let log = indexer.log.new(o!("service" => "synchronizer"));
    let cooldown =
        Duration::from_secs(indexer.indexer_config().sync_epoch_cooldown_secs.max(1));
    let mut failed_attempts = 0u32;

    loop {
        let delay = if failed_attempts == 0 {
            cooldown
        } else {
            (cooldown * 2u32.saturating_pow(failed_attempts.min(6))).min(SYNC_MAX_BACKOFF)
        };
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }

        let finalized_epoch = indexer.finalized_checkpoint().epoch;
        let epoch = match indexer.next_epoch_to_persist() {
            Ok(epoch) => epoch,
            Err(e) => {
                failed_attempts += 1;
                warn!(log, "Could not read sync state"; "error" => %e);
                continue;
            }
        };
        if epoch >= finalized_epoch {
            failed_attempts = 0;
            continue;
        }

        // If the live cache can serve this epoch, the writer loop will.
        if indexer
            .get_cached_epoch_stats(epoch)
            .map_or(false, |stats| stats.duties_loaded())
        {
            failed_attempts = 0;
            continue;
        }

        match sync_epoch(&indexer, epoch, &log).await {
            Ok(()) => {
                failed_attempts = 0;
                info!(log, "persistence_committed"; "epoch" => %epoch, "backfill" => true);
            }
            Err(e) => {
                failed_attempts += 1;
                warn!(
                    log,
                    "Epoch synchronization failed";
                    "epoch" => %epoch,
                    "error" => %e,
                    "failed_attempts" => failed_attempts,
                );
            }
        }
    }
}

/// Fetch, load and persist a single epoch.
async fn sync_epoch(indexer: &Arc<Indexer>, epoch: Epoch, log: &Logger) -> Result<(), Error> {
    let client = indexer.best_client().ok_or(Error::NoClientAvailable)?;
    let slots_per_epoch = indexer.chain().slots_per_epoch;

    debug!(log, "Synchronizing epoch"; "epoch" => %epoch, "client" => &client.name);

    // Pull the epoch's blocks, plus the following epoch for late attestation inclusions.
    let first_slot = epoch.start_slot(slots_per_epoch);
    let last_slot = (epoch + 1).end_slot(slots_per_epoch);
    let mut head = None;
    for slot in first_slot.as_u64()..=last_slot.as_u64() {
        let header = match client.rpc.block_header_by_slot(Slot::new(slot)).await? {
            Some(header) => header,
            // Skipped slot.
            None => continue,
        };
        let message = header.header.message;
        let (block, _) = indexer.block_cache().put(
            header.root,
            message.slot,
            message.parent_root,
            client.id,
        );
        if block.header().is_none() {
            block.set_header(message);
        }
        if !block.has_body() {
            if let Some(body) = client.rpc.block_body(header.root).await? {
                block.set_body(body.message.body);
            }
        }
        head = Some(block);
    }
    // An entirely empty epoch pair still gets a (zero-vote) row; the dependent root then comes
    // from the persistence layer or the duties response.
    let head_root = head.as_ref().map(|block| block.root).unwrap_or_default();
    if head.is_some() {
        indexer.block_cache().set_canonical_chain(head_root, first_slot);
    }

    // Load duties synchronously through the regular loader machinery.
    let loader = indexer.duty_loader().clone();
    let mut proposer_duties = None;
    let dependent_root = loader
        .select_dependent_root(epoch, head_root, &client, &mut proposer_duties)
        .await?;
    let (stats, _) = indexer
        .epoch_stats_cache()
        .create_or_get(epoch, dependent_root);
    loader
        .clone()
        .load_epoch_stats(stats.clone(), client.clone(), proposer_duties)
        .await?;

    // Vote weighting needs the validator snapshot; load it in-line rather than racing the
    // spawned task.
    if !client.skip_validators {
        let state_ref = stats.duties().await.dependent_state_ref.clone();
        if let Some(state_ref) = state_ref {
            load_validator_stats(
                stats.clone(),
                client.rpc.clone(),
                state_ref,
                indexer.duty_loader().validator_load_limiter(),
                log.clone(),
            )
            .await;
        }
    }

    let target_root = indexer
        .block_cache()
        .last_canonical_block(epoch, slots_per_epoch, head_root)
        .map(|block| block.root)
        .unwrap_or_default();
    let votes = aggregate_epoch_votes(
        indexer.block_cache(),
        indexer.chain(),
        epoch,
        head_root,
        &stats,
        target_root,
        false,
        true,
        log,
    )
    .await;

    let blocks = indexer.block_cache().all_blocks_in_range(
        epoch.start_slot(slots_per_epoch),
        epoch.end_slot(slots_per_epoch),
    );
    indexer
        .write_epoch_to_db(epoch, &stats, &votes, &blocks)
        .await
}
