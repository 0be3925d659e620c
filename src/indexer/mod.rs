//! The indexer core: caches, duty loading, vote aggregation and the persistence pipeline.

pub mod block_cache;
pub mod client;
pub mod duty_loader;
pub mod epoch_stats;
pub mod synchronizer;
pub mod votes;

use crate::api_types::Checkpoint;
use crate::beacon_client::{self, BeaconRpc};
use crate::config::{ChainConfig, Config, EndpointConfig, IndexerConfig};
use crate::database::{self, BlockRow, BlockStatus, Database, EpochRow, SYNC_STATE_KEY};
use crate::types::{Epoch, Hash256, Slot, UNKNOWN_PROPOSER};
use block_cache::{BlockCache, CacheBlock};
use client::ConsensusClient;
use duty_loader::DutyLoader;
use epoch_stats::{EpochStats, EpochStatsCache};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, Logger};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use votes::EpochVotes;

#[derive(Debug)]
pub enum Error {
    BeaconApi(beacon_client::Error),
    Database(database::Error),
    /// No dependent root could be derived for the epoch, from the cache, the persistence layer
    /// or the upstream client.
    DependentRootUnavailable(Epoch),
    /// The dependent block's header is unknown upstream; permanent for this record.
    DependentHeaderNotFound(Hash256),
    NoClientAvailable,
    EpochStatsUnavailable(Epoch),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<beacon_client::Error> for Error {
    fn from(e: beacon_client::Error) -> Self {
        Error::BeaconApi(e)
    }
}

impl From<database::Error> for Error {
    fn from(e: database::Error) -> Self {
        Error::Database(e)
    }
}

/// One distinct chain head currently reported across clients.
#[derive(Debug, Clone)]
pub struct HeadFork {
    pub root: Hash256,
    pub slot: Slot,
    pub clients: Vec<String>,
}

/// Synchronization progress persisted under [`SYNC_STATE_KEY`]: the next epoch the writer has
/// to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub epoch: u64,
}

struct ServiceHandles {
    persistence: Option<JoinHandle<()>>,
    synchronizer: Option<JoinHandle<()>>,
    clients: Vec<JoinHandle<()>>,
}

/// Owns the block and epoch caches and drives all background services. Constructed once and
/// shared by `Arc`.
pub struct Indexer {
    chain: ChainConfig,
    config: IndexerConfig,
    block_cache: Arc<BlockCache>,
    epoch_stats: Arc<EpochStatsCache>,
    duty_loader: Arc<DutyLoader>,
    database: Database,
    clients: parking_lot::RwLock<Vec<Arc<ConsensusClient>>>,
    finalized: parking_lot::RwLock<Checkpoint>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<ServiceHandles>,
    pub(crate) log: Logger,
}

impl Indexer {
    pub fn new(config: &Config, database: Database, log: Logger) -> Arc<Self> {
        let log = log.new(o!("service" => "indexer"));
        let block_cache = Arc::new(BlockCache::new());
        let epoch_stats = Arc::new(EpochStatsCache::new());
        let duty_loader = Arc::new(DutyLoader::new(
            config.chain.clone(),
            epoch_stats.clone(),
            block_cache.clone(),
            database.clone(),
            config.indexer.max_parallel_validator_set_requests,
            log.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Indexer {
            chain: config.chain.clone(),
            config: config.indexer.clone(),
            block_cache,
            epoch_stats,
            duty_loader,
            database,
            clients: parking_lot::RwLock::new(Vec::new()),
            finalized: parking_lot::RwLock::new(Checkpoint {
                epoch: Epoch::new(0),
                root: Hash256::zero(),
            }),
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(ServiceHandles {
                persistence: None,
                synchronizer: None,
                clients: Vec::new(),
            }),
            log,
        })
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn indexer_config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn block_cache(&self) -> &Arc<BlockCache> {
        &self.block_cache
    }

    pub fn epoch_stats_cache(&self) -> &Arc<EpochStatsCache> {
        &self.epoch_stats
    }

    pub fn duty_loader(&self) -> &Arc<DutyLoader> {
        &self.duty_loader
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Register a consensus client endpoint and start following its head.
    pub fn add_client(
        self: &Arc<Self>,
        endpoint: &EndpointConfig,
        rpc: Arc<dyn BeaconRpc>,
    ) -> Arc<ConsensusClient> {
        let mut clients = self.clients.write();
        let client = Arc::new(ConsensusClient::new(
            clients.len() as u16,
            endpoint.name.clone(),
            endpoint.priority,
            endpoint.skip_validators,
            rpc,
        ));
        clients.push(client.clone());

        let handle = tokio::spawn(client::run_client_worker(
            self.clone(),
            client.clone(),
            self.shutdown_rx.clone(),
        ));
        self.handles.lock().clients.push(handle);

        info!(self.log, "Added consensus client"; "client" => &client.name, "id" => client.id);
        client
    }

    pub fn clients(&self) -> Vec<Arc<ConsensusClient>> {
        self.clients.read().clone()
    }

    /// Start the persistence writer and the synchronizer, as configured.
    pub fn start_services(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !self.config.disable_index_writer && handles.persistence.is_none() {
            handles.persistence = Some(tokio::spawn(run_persistence_loop(
                self.clone(),
                self.shutdown_rx.clone(),
            )));
        }
        if !self.config.disable_index_writer
            && !self.config.disable_synchronizer
            && handles.synchronizer.is_none()
        {
            handles.synchronizer = Some(tokio::spawn(synchronizer::run_synchronizer(
                self.clone(),
                self.shutdown_rx.clone(),
            )));
        }
    }

    /// Signal all services and wait for them to settle, writer first, head streams last.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let (persistence, synchronizer, clients) = {
            let mut handles = self.handles.lock();
            (
                handles.persistence.take(),
                handles.synchronizer.take(),
                std::mem::take(&mut handles.clients),
            )
        };

        if let Some(handle) = persistence {
            let _ = handle.await;
        }
        if let Some(handle) = synchronizer {
            let _ = handle.await;
        }
        for handle in clients {
            let _ = handle.await;
        }
        info!(self.log, "Indexer stopped");
    }

    pub fn finalized_checkpoint(&self) -> Checkpoint {
        *self.finalized.read()
    }

    /// Advance the cached finality checkpoint; never moves backwards.
    pub fn update_finality(&self, checkpoint: Checkpoint, client_name: &str) {
        let mut finalized = self.finalized.write();
        if checkpoint.epoch > finalized.epoch {
            info!(
                self.log,
                "Finalized checkpoint advanced";
                "epoch" => %checkpoint.epoch,
                "root" => ?checkpoint.root,
                "client" => client_name,
            );
            *finalized = checkpoint;
        }
    }

    /// Lowest slot the in-memory caches are expected to retain.
    pub fn cache_low_slot(&self) -> Slot {
        let finalized_epoch = self.finalized_checkpoint().epoch;
        finalized_epoch
            .saturating_sub(self.config.in_memory_epochs)
            .start_slot(self.chain.slots_per_epoch)
    }

    /// The distinct heads currently followed across clients, most-confirmed first. Two heads
    /// belong to the same fork when one is an ancestor of the other within the cached window.
    pub fn head_forks(&self) -> Vec<HeadFork> {
        let mut forks: Vec<HeadFork> = Vec::new();
        for client in self.clients.read().iter() {
            let (slot, root) = match client.head() {
                Some(head) => head,
                None => continue,
            };
            let same_fork = forks.iter_mut().find(|fork| {
                fork.root == root
                    || self.block_cache.is_canonical_of(fork.root, root)
                    || self.block_cache.is_canonical_of(root, fork.root)
            });
            match same_fork {
                Some(fork) => {
                    if slot > fork.slot {
                        fork.slot = slot;
                        fork.root = root;
                    }
                    fork.clients.push(client.name.clone());
                }
                None => forks.push(HeadFork {
                    root,
                    slot,
                    clients: vec![client.name.clone()],
                }),
            }
        }
        forks.sort_by(|a, b| {
            b.clients
                .len()
                .cmp(&a.clients.len())
                .then(b.slot.cmp(&a.slot))
        });
        forks
    }

    /// The most-confirmed head across all clients.
    pub fn canonical_head(&self) -> Option<(Slot, Hash256)> {
        self.head_forks().first().map(|fork| (fork.slot, fork.root))
    }

    /// The epoch record whose dependent root lies on the current canonical chain, preferring
    /// the one confirmed by the most load passes.
    pub fn get_cached_epoch_stats(&self, epoch: Epoch) -> Option<Arc<EpochStats>> {
        let (_, head_root) = self.canonical_head()?;
        let candidates = self.epoch_stats.all_for_epoch(epoch);

        let matched = candidates
            .iter()
            .filter(|stats| {
                self.block_cache
                    .is_canonical_of(stats.dependent_root, head_root)
            })
            .max_by_key(|stats| stats.seen_count())
            .cloned();
        if matched.is_some() {
            return matched;
        }

        // The dependent root may already have left the cached window (or came from the
        // persistence layer); an unambiguous record is still useful.
        if candidates.len() == 1 && self.block_cache.get(candidates[0].dependent_root).is_none() {
            return Some(candidates[0].clone());
        }
        None
    }

    /// Aggregate the votes for `epoch` on the current canonical chain.
    pub async fn get_epoch_votes(&self, epoch: Epoch) -> Option<(Arc<EpochStats>, EpochVotes)> {
        let (_, head_root) = self.canonical_head()?;
        let stats = self.get_cached_epoch_stats(epoch)?;
        let target_root = self
            .block_cache
            .last_canonical_block(epoch, self.chain.slots_per_epoch, head_root)
            .map(|block| block.root)
            .unwrap_or_default();

        let votes = votes::aggregate_epoch_votes(
            &self.block_cache,
            &self.chain,
            epoch,
            head_root,
            &stats,
            target_root,
            false,
            false,
            &self.log,
        )
        .await;
        Some((stats, votes))
    }

    /// The next epoch the writer has to persist.
    pub fn next_epoch_to_persist(&self) -> Result<Epoch, Error> {
        let state: Option<SyncState> = self.database.get_explorer_state(SYNC_STATE_KEY)?;
        Ok(Epoch::new(state.map(|state| state.epoch).unwrap_or(0)))
    }

    /// Persist the next finalized epoch out of the live cache, if it is available there.
    /// Returns `true` when an epoch was committed.
    pub async fn persist_next_epoch(&self, log: &Logger) -> Result<bool, Error> {
        let finalized_epoch = self.finalized_checkpoint().epoch;
        let epoch = self.next_epoch_to_persist()?;
        // Only write beyond finality.
        if epoch >= finalized_epoch {
            return Ok(false);
        }

        let stats = match self.get_cached_epoch_stats(epoch) {
            Some(stats) if stats.duties_loaded() => stats,
            // Not in the live cache (or still loading): the synchronizer owns this epoch.
            _ => return Ok(false),
        };
        let (_, head_root) = self
            .canonical_head()
            .ok_or(Error::EpochStatsUnavailable(epoch))?;

        let slots_per_epoch = self.chain.slots_per_epoch;
        let target_root = self
            .block_cache
            .last_canonical_block(epoch, slots_per_epoch, head_root)
            .map(|block| block.root)
            .unwrap_or_default();
        let votes = votes::aggregate_epoch_votes(
            &self.block_cache,
            &self.chain,
            epoch,
            head_root,
            &stats,
            target_root,
            false,
            true,
            log,
        )
        .await;

        let blocks = self.block_cache.all_blocks_in_range(
            epoch.start_slot(slots_per_epoch),
            epoch.end_slot(slots_per_epoch),
        );
        self.write_epoch_to_db(epoch, &stats, &votes, &blocks).await?;

        info!(
            log,
            "persistence_committed";
            "epoch" => %epoch,
            "blocks" => blocks.len(),
        );

        self.prune_caches(log);
        Ok(true)
    }

    /// Write one epoch and its blocks in a single transaction and advance the sync state.
    pub(crate) async fn write_epoch_to_db(
        &self,
        epoch: Epoch,
        stats: &EpochStats,
        votes: &EpochVotes,
        blocks: &[Arc<CacheBlock>],
    ) -> Result<(), Error> {
        let duties = stats.duties().await;
        let validators = stats.validators().await;

        let canonical: Vec<&Arc<CacheBlock>> =
            blocks.iter().filter(|block| block.is_canonical()).collect();
        let epoch_row = EpochRow {
            epoch: epoch.as_u64(),
            dependent_root: stats.dependent_root,
            validator_count: validators.as_ref().map_or(0, |v| v.validator_count),
            validator_balance: validators.as_ref().map_or(0, |v| v.validator_balance),
            eligible_amount: validators.as_ref().map_or(0, |v| v.eligible_amount),
            vote_counts: votes.vote_counts,
            target_votes: votes.current_epoch.target_vote_amount
                + votes.next_epoch.target_vote_amount,
            head_votes: votes.current_epoch.head_vote_amount + votes.next_epoch.head_vote_amount,
            total_votes: votes.current_epoch.total_vote_amount
                + votes.next_epoch.total_vote_amount,
            block_count: canonical.len() as u64,
            attestation_count: canonical
                .iter()
                .map(|block| block.attestation_count() as u64)
                .sum(),
        };

        let mut block_rows = Vec::with_capacity(blocks.len());
        for block in blocks {
            let proposer = block
                .header()
                .map(|header| header.proposer_index)
                .or_else(|| {
                    duties
                        .proposer_assignments
                        .as_ref()
                        .and_then(|assignments| assignments.get(&block.slot).copied())
                })
                .unwrap_or(UNKNOWN_PROPOSER);
            block_rows.push(BlockRow {
                root: block.root,
                slot: block.slot.as_u64(),
                parent_root: block.parent_root(),
                proposer,
                status: if block.is_canonical() {
                    BlockStatus::Canonical
                } else {
                    BlockStatus::Orphaned
                },
                attestation_count: block.attestation_count() as u64,
            });
        }
        drop(duties);
        drop(validators);

        let next_state = SyncState {
            epoch: epoch.as_u64() + 1,
        };
        self.database.with_transaction(|txn| {
            Database::insert_epoch(txn, &epoch_row)?;
            for row in &block_rows {
                Database::insert_block(txn, row)?;
            }
            Database::set_explorer_state(txn, SYNC_STATE_KEY, &next_state)
        })?;

        for block in blocks {
            block.set_persisted();
        }
        Ok(())
    }

    /// Drop cache entries that fell out of the retention window and are safely persisted.
    /// Freshly persisted epochs linger for `cache_persistence_delay` epochs so readers keep
    /// seeing them while the frontend view catches up.
    fn prune_caches(&self, log: &Logger) {
        let persisted_low = self
            .next_epoch_to_persist()
            .unwrap_or(Epoch::new(0))
            .saturating_sub(self.config.cache_persistence_delay)
            .start_slot(self.chain.slots_per_epoch);
        let low_slot = self.cache_low_slot().min(persisted_low);
        let removed_blocks = self.block_cache.prune(low_slot);
        let removed_stats = self
            .epoch_stats
            .remove_epochs_below(low_slot.epoch(self.chain.slots_per_epoch));
        if removed_blocks > 0 || removed_stats > 0 {
            debug!(
                log,
                "Pruned caches";
                "blocks" => removed_blocks,
                "epoch_stats" => removed_stats,
                "low_slot" => %low_slot,
            );
        }
    }

    /// The client preferred for direct requests, by priority.
    pub(crate) fn best_client(&self) -> Option<Arc<ConsensusClient>> {
        self.clients
            .read()
            .iter()
            .max_by_key(|client| (client.is_ready(), client.priority))
            .cloned()
    }
}

const PERSISTENCE_MAX_BACKOFF: Duration = Duration::from_secs(120);
/// Consecutive persistence-layer failures after which the writer gives up and the indexer
/// keeps running read-only.
const PERSISTENCE_MAX_FAILURES: u32 = 10;

/// Writer loop: persists finalized epochs in ascending order, retrying with exponential
/// backoff on failure.
async fn run_persistence_loop(indexer: Arc<Indexer>, mut shutdown: watch::Receiver<bool>) {
    let log = indexer.log.new(o!("service" => "persistence"));
    let interval = Duration::from_secs(indexer.chain.seconds_per_slot.max(1));
    let mut failed_attempts = 0u32;

    loop {
        let delay = if failed_attempts == 0 {
            interval
        } else {
            (interval * 2u32.saturating_pow(failed_attempts.min(6))).min(PERSISTENCE_MAX_BACKOFF)
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

        match indexer.persist_next_epoch(&log).await {
            Ok(_) => failed_attempts = 0,
            Err(e) => {
                failed_attempts += 1;
                error!(
                    log,
                    "persistence_failed";
                    "error" => %e,
                    "failed_attempts" => failed_attempts,
                );
                // A persistence layer that stays broken is not recoverable from here; stop
                // writing and leave the query surface up.
                if matches!(e, Error::Database(_)) && failed_attempts >= PERSISTENCE_MAX_FAILURES {
                    error!(log, "Persistence writer stopped, indexer is read-only");
                    return;
                }
            }
        }
    }
}
