//! Lazy, deduplicated loading of per-epoch duty assignments and validator snapshots.
//!
//! `ensure_epoch_stats` is cheap and idempotent: it derives the dependent root for the
//! requested epoch as seen from a client's head, creates (or joins) the matching
//! [`EpochStats`] record and spawns a background pass that fills in whatever is still
//! missing. Concurrent callers for the same `(epoch, dependent_root)` serialise on the
//! record's duties lock and find nothing left to do.

use crate::api_types::{DutiesResponse, ProposerData, StateId};
use crate::beacon_client::BeaconRpc;
use crate::config::ChainConfig;
use crate::database::Database;
use crate::indexer::block_cache::BlockCache;
use crate::indexer::client::ConsensusClient;
use crate::indexer::epoch_stats::{EpochStats, EpochStatsCache, EpochValidatorStats};
use crate::indexer::Error;
use crate::types::{Epoch, Hash256, Slot, UNKNOWN_PROPOSER};
use slog::{debug, info, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

type ProposerDuties = DutiesResponse<Vec<ProposerData>>;

enum LoadOutcome {
    Done,
    /// The upstream reported duties for a different dependent root; loading continues on the
    /// record keyed by that root.
    Redirect(Arc<EpochStats>, ProposerDuties),
}

pub struct DutyLoader {
    chain: ChainConfig,
    epoch_stats: Arc<EpochStatsCache>,
    block_cache: Arc<BlockCache>,
    database: Database,
    /// Bounds the number of concurrent validator-set downloads across all clients.
    validator_load_limiter: Arc<Semaphore>,
    log: Logger,
}

impl DutyLoader {
    pub fn new(
        chain: ChainConfig,
        epoch_stats: Arc<EpochStatsCache>,
        block_cache: Arc<BlockCache>,
        database: Database,
        max_parallel_validator_set_requests: usize,
        log: Logger,
    ) -> Self {
        DutyLoader {
            chain,
            epoch_stats,
            block_cache,
            database,
            validator_load_limiter: Arc::new(Semaphore::new(
                max_parallel_validator_set_requests.max(1),
            )),
            log,
        }
    }

    /// Make sure an [`EpochStats`] record exists for `epoch` as seen from `head` and that a
    /// loader is driving it towards completeness. Returns the record immediately; population
    /// happens in the background.
    pub async fn ensure_epoch_stats(
        self: &Arc<Self>,
        epoch: Epoch,
        head: Hash256,
        client: &Arc<ConsensusClient>,
    ) -> Result<Arc<EpochStats>, Error> {
        let mut proposer_duties = None;
        let dependent_root = self
            .select_dependent_root(epoch, head, client, &mut proposer_duties)
            .await?;

        let (stats, is_new) = self.epoch_stats.create_or_get(epoch, dependent_root);
        if is_new {
            info!(
                self.log,
                "epoch_stats_created";
                "epoch" => %epoch,
                "dependent_root" => ?dependent_root,
                "client" => &client.name,
            );
        } else {
            debug!(
                self.log,
                "ensure epoch stats";
                "epoch" => %epoch,
                "dependent_root" => ?dependent_root,
                "client" => &client.name,
            );
        }

        let loader = self.clone();
        let load_stats = stats.clone();
        let load_client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = loader
                .clone()
                .load_epoch_stats(load_stats, load_client.clone(), proposer_duties)
                .await
            {
                warn!(
                    loader.log,
                    "Error while loading epoch stats";
                    "epoch" => %epoch,
                    "client" => &load_client.name,
                    "error" => %e,
                );
            }
        });

        Ok(stats)
    }

    pub(crate) fn validator_load_limiter(&self) -> Arc<Semaphore> {
        self.validator_load_limiter.clone()
    }

    /// Dependent root for `epoch` on the chain ending at `head`.
    pub(crate) async fn select_dependent_root(
        &self,
        epoch: Epoch,
        head: Hash256,
        client: &ConsensusClient,
        proposer_duties: &mut Option<ProposerDuties>,
    ) -> Result<Hash256, Error> {
        let slots_per_epoch = self.chain.slots_per_epoch;

        if let Some(first_block) =
            self.block_cache
                .first_canonical_block(epoch, slots_per_epoch, head)
        {
            // The genesis block is the only block deciding its own duties.
            if epoch.as_u64() == 0 {
                return Ok(first_block.root);
            }
            return Ok(first_block.parent_root());
        }

        if epoch.as_u64() > 0 {
            if let Some(last_block) =
                self.block_cache
                    .last_canonical_block(epoch - 1, slots_per_epoch, head)
            {
                return Ok(last_block.root);
            }
        }

        if self.chain.whisk_active_at(epoch) {
            let first_slot = epoch.start_slot(slots_per_epoch);
            return self
                .database
                .get_highest_root_before_slot(first_slot)?
                .ok_or(Error::DependentRootUnavailable(epoch));
        }

        let duties = client.rpc.proposer_duties(epoch).await?;
        let dependent_root = duties.dependent_root;
        // Thread the response through to the loader so it is not fetched twice.
        *proposer_duties = Some(duties);
        Ok(dependent_root)
    }

    /// Run load passes until one completes without a dependent-root redirect.
    pub async fn load_epoch_stats(
        self: Arc<Self>,
        mut stats: Arc<EpochStats>,
        client: Arc<ConsensusClient>,
        mut proposer_duties: Option<ProposerDuties>,
    ) -> Result<(), Error> {
        loop {
            match self
                .load_epoch_stats_once(&stats, &client, proposer_duties.take())
                .await?
            {
                LoadOutcome::Done => return Ok(()),
                LoadOutcome::Redirect(alt_stats, duties) => {
                    stats = alt_stats;
                    proposer_duties = Some(duties);
                }
            }
        }
    }

    /// One population pass over `stats`. Holds the duties lock exclusively for the duration;
    /// fields that a previous pass already filled are left untouched, so after an error only
    /// the missing fields are retried.
    async fn load_epoch_stats_once(
        &self,
        stats: &Arc<EpochStats>,
        client: &Arc<ConsensusClient>,
        proposer_duties: Option<ProposerDuties>,
    ) -> Result<LoadOutcome, Error> {
        let mut duties = stats.duties_write().await;

        let epoch = stats.epoch;
        let slots_per_epoch = self.chain.slots_per_epoch;
        let whisk_active = self.chain.whisk_active_at(epoch);

        if duties.proposer_assignments.is_none() {
            let response = if whisk_active {
                None
            } else {
                let response = match proposer_duties {
                    Some(response) => response,
                    None => client.rpc.proposer_duties(epoch).await?,
                };
                if response.dependent_root != stats.dependent_root {
                    warn!(
                        self.log,
                        "epoch_stats_dependent_root_mismatch";
                        "epoch" => %epoch,
                        "expected" => ?stats.dependent_root,
                        "got" => ?response.dependent_root,
                        "client" => &client.name,
                    );
                    let (alt_stats, is_new) = self
                        .epoch_stats
                        .create_or_get(epoch, response.dependent_root);
                    if is_new {
                        info!(
                            self.log,
                            "epoch_stats_created";
                            "epoch" => %epoch,
                            "dependent_root" => ?response.dependent_root,
                            "client" => &client.name,
                        );
                    }
                    return Ok(LoadOutcome::Redirect(alt_stats, response));
                }
                Some(response)
            };

            let mut assignments = HashMap::with_capacity(slots_per_epoch as usize);
            match response {
                // Proposer assignments are not derivable under Whisk; record the sentinel for
                // every slot of the epoch.
                None => {
                    let first_slot = epoch.start_slot(slots_per_epoch).as_u64();
                    for slot in first_slot..first_slot + slots_per_epoch {
                        assignments.insert(Slot::new(slot), UNKNOWN_PROPOSER);
                    }
                }
                Some(response) => {
                    for duty in response.data {
                        assignments.insert(duty.slot, duty.validator_index);
                    }
                }
            }
            duties.proposer_assignments = Some(assignments);
        }

        let state_ref = match duties.dependent_state_ref.clone() {
            Some(state_ref) => state_ref,
            None => {
                let state_ref = self.derive_state_ref(epoch, stats.dependent_root, client).await?;
                duties.dependent_state_ref = Some(state_ref.clone());
                state_ref
            }
        };

        // The validator snapshot loads independently of the duties; it only needs the state
        // ref derived above.
        if !client.skip_validators && stats.validators_unloaded() {
            let load_stats = stats.clone();
            let rpc = client.rpc.clone();
            let limiter = self.validator_load_limiter.clone();
            let validator_state_ref = state_ref.clone();
            let log = self.log.clone();
            tokio::spawn(async move {
                load_validator_stats(load_stats, rpc, validator_state_ref, limiter, log).await;
            });
        }

        if duties.attester_assignments.is_none() {
            let committees = client.rpc.committee_duties(&state_ref, epoch).await?;
            let mut assignments: HashMap<(Slot, u64), Vec<u64>> = HashMap::new();
            for committee in committees {
                assignments
                    .entry((committee.slot, committee.index))
                    .or_default()
                    .extend(committee.validators);
            }
            duties.attester_assignments = Some(assignments);
        }

        if duties.sync_assignments.is_none() && epoch >= self.chain.altair_fork_epoch {
            // The sync committee rotates exactly at the fork boundary, so the boundary slot
            // itself must be used as the state here, not the dependent state.
            let sync_state_ref = if epoch.as_u64() > 0 && epoch == self.chain.altair_fork_epoch {
                StateId::Slot(epoch.start_slot(slots_per_epoch))
            } else {
                state_ref.clone()
            };
            if let Some(sync_committee) =
                client.rpc.sync_committee(&sync_state_ref, epoch).await?
            {
                duties.sync_assignments = Some(sync_committee.validators);
            }
        }

        let seen_count = stats.increment_seen_count();
        if seen_count == 1 {
            info!(
                self.log,
                "epoch_stats_loaded";
                "epoch" => %epoch,
                "dependent_root" => ?stats.dependent_root,
                "client" => &client.name,
            );
        } else {
            debug!(
                self.log,
                "epoch_stats_loaded";
                "epoch" => %epoch,
                "seen_count" => seen_count,
                "client" => &client.name,
            );
        }

        Ok(LoadOutcome::Done)
    }

    /// The state identifier behind `dependent_root`: `genesis` for epoch zero or slot-zero
    /// dependent blocks, otherwise the state root of the dependent block's header.
    async fn derive_state_ref(
        &self,
        epoch: Epoch,
        dependent_root: Hash256,
        client: &ConsensusClient,
    ) -> Result<StateId, Error> {
        if epoch.as_u64() == 0 {
            return Ok(StateId::Genesis);
        }

        if let Some(block) = self.block_cache.get(dependent_root) {
            if block.slot.as_u64() == 0 {
                return Ok(StateId::Genesis);
            }
            if let Some(header) = block.header() {
                return Ok(StateId::Root(header.state_root));
            }
        }

        let header = client
            .rpc
            .block_header(dependent_root)
            .await?
            .ok_or(Error::DependentHeaderNotFound(dependent_root))?;
        if header.header.message.slot.as_u64() == 0 {
            Ok(StateId::Genesis)
        } else {
            Ok(StateId::Root(header.header.message.state_root))
        }
    }
}

/// Download the validator set behind `state_ref` and distil the per-epoch snapshot. Failures
/// are logged and leave the record unloaded; the next `ensure` retries.
pub async fn load_validator_stats(
    stats: Arc<EpochStats>,
    rpc: Arc<dyn BeaconRpc>,
    state_ref: StateId,
    limiter: Arc<Semaphore>,
    log: Logger,
) {
    let mut guard = stats.validators_write().await;
    if guard.is_some() {
        return;
    }

    // Bound concurrent validator-set downloads; the permit is released on every path when it
    // drops.
    let permit = match limiter.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let state_ref = if stats.epoch.as_u64() == 0 {
        StateId::Genesis
    } else {
        state_ref
    };
    let result = rpc.state_validators(&state_ref).await;
    drop(permit);

    let validators = match result {
        Ok(validators) => validators,
        Err(e) => {
            warn!(
                log,
                "Error fetching epoch validators";
                "epoch" => %stats.epoch,
                "error" => %e,
            );
            return;
        }
    };

    let mut validator_stats = EpochValidatorStats::default();
    for validator in validators {
        validator_stats
            .validator_balances
            .insert(validator.index, validator.validator.effective_balance);
        if validator.validator.activation_epoch <= stats.epoch
            && stats.epoch < validator.validator.exit_epoch
        {
            validator_stats.validator_count += 1;
            validator_stats.validator_balance += validator.balance;
            validator_stats.eligible_amount += validator.validator.effective_balance;
        }
    }
    *guard = Some(validator_stats);
}
