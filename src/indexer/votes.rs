//! Aggregation of attestation votes over the cached canonical chain.

use crate::config::ChainConfig;
use crate::indexer::block_cache::BlockCache;
use crate::indexer::epoch_stats::EpochStats;
use crate::types::{Epoch, Hash256};
use slog::{debug, Logger};
use std::collections::HashSet;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VoteBucket {
    pub target_vote_amount: u64,
    pub head_vote_amount: u64,
    pub total_vote_amount: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EpochVotes {
    /// Votes included in blocks of the attested epoch itself.
    pub current_epoch: VoteBucket,
    /// Votes included one epoch late.
    pub next_epoch: VoteBucket,
    /// When `true`, amounts are plain vote counts because no validator snapshot was available
    /// to weight them by effective balance.
    pub vote_counts: bool,
    /// Every validator attributed to any bucket, exactly once.
    pub activity: HashSet<u64>,
}

/// Aggregate the votes for `epoch` along the chain ending at `head`.
///
/// Scans blocks of the epoch itself and, unless `current_only`, of the following epoch (late
/// inclusions). With `await_loaded` the call blocks until in-flight duty and validator loads
/// on `stats` have settled; otherwise whatever is loaded right now is used, degrading
/// gracefully to zero activity when committees are missing.
///
/// An attestation votes "head" for the block it was included behind, so the comparison uses
/// the parent root of the including block.
pub async fn aggregate_epoch_votes(
    block_cache: &BlockCache,
    chain: &ChainConfig,
    epoch: Epoch,
    head: Hash256,
    stats: &EpochStats,
    target_root: Hash256,
    current_only: bool,
    await_loaded: bool,
    log: &Logger,
) -> EpochVotes {
    let slots_per_epoch = chain.slots_per_epoch;
    let first_slot = epoch.start_slot(slots_per_epoch);
    let last_slot = if current_only {
        epoch.end_slot(slots_per_epoch)
    } else {
        // Votes for this epoch may be included in the next one too.
        (epoch + 1).end_slot(slots_per_epoch)
    };

    let duties = if await_loaded {
        Some(stats.duties().await)
    } else {
        stats.try_duties()
    };
    let validators = if await_loaded {
        Some(stats.validators().await)
    } else {
        stats.try_validators()
    };

    let attester_assignments = duties
        .as_ref()
        .and_then(|duties| duties.attester_assignments.as_ref());
    let balances = validators
        .as_ref()
        .and_then(|guard| guard.as_ref())
        .map(|stats| &stats.validator_balances);

    let mut votes = EpochVotes {
        vote_counts: balances.is_none(),
        ..EpochVotes::default()
    };

    for block in block_cache.blocks_in_slot_range(first_slot, last_slot, head) {
        let is_next_epoch = block.epoch(slots_per_epoch) > epoch;
        let parent_root = block.parent_root();

        block.with_body(|body| {
            let body = match body {
                Some(body) => body,
                None => return,
            };
            for attestation in &body.attestations {
                if attestation.data.slot.epoch(slots_per_epoch) != epoch {
                    continue;
                }

                let mut vote_amount = 0;
                if let Some(assignments) = attester_assignments {
                    if let Some(committee) =
                        assignments.get(&(attestation.data.slot, attestation.data.index))
                    {
                        for (bit_index, validator_index) in committee.iter().enumerate() {
                            if !attestation.has_aggregation_bit(bit_index) {
                                continue;
                            }
                            // A validator only counts once per epoch, whichever aggregate
                            // includes it first.
                            if !votes.activity.insert(*validator_index) {
                                continue;
                            }
                            vote_amount += match balances {
                                Some(balances) => {
                                    balances.get(validator_index).copied().unwrap_or(0)
                                }
                                None => 1,
                            };
                        }
                    }
                }

                let bucket = if is_next_epoch {
                    &mut votes.next_epoch
                } else {
                    &mut votes.current_epoch
                };
                if attestation.data.target.root == target_root {
                    bucket.target_vote_amount += vote_amount;
                }
                if attestation.data.beacon_block_root == parent_root {
                    bucket.head_vote_amount += vote_amount;
                }
                bucket.total_vote_amount += vote_amount;
            }
        });
    }

    debug!(
        log,
        "epoch_votes_aggregated";
        "epoch" => %epoch,
        "current_total" => votes.current_epoch.total_vote_amount,
        "next_total" => votes.next_epoch.total_vote_amount,
        "activity" => votes.activity.len(),
        "vote_counts" => votes.vote_counts,
    );

    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::{Attestation, AttestationData, BeaconBlockBody, Checkpoint};
    use crate::indexer::epoch_stats::{EpochStatsCache, EpochValidatorStats};
    use crate::logger::null_logger;
    use crate::types::Slot;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn root(byte: u8) -> Hash256 {
        Hash256::repeat_byte(byte)
    }

    fn attestation(
        slot: u64,
        committee: u64,
        bits: Vec<u8>,
        beacon_block_root: Hash256,
        target_root: Hash256,
    ) -> Attestation {
        Attestation {
            aggregation_bits: bits,
            data: AttestationData {
                slot: Slot::new(slot),
                index: committee,
                beacon_block_root,
                source: Checkpoint {
                    epoch: Epoch::new(0),
                    root: Hash256::zero(),
                },
                target: Checkpoint {
                    epoch: Epoch::new(0),
                    root: target_root,
                },
            },
        }
    }

    struct Fixture {
        cache: BlockCache,
        chain: ChainConfig,
        stats: Arc<crate::indexer::epoch_stats::EpochStats>,
        head: Hash256,
        target: Hash256,
    }

    /// Two-block chain in epoch 0 (slots 0 and 1) plus one block in epoch 1 carrying a late
    /// attestation for epoch 0. Committee of 4 validators at (slot 0, committee 0).
    async fn fixture(with_balances: bool) -> Fixture {
        let chain = ChainConfig {
            slots_per_epoch: 4,
            ..ChainConfig::default()
        };
        let cache = BlockCache::new();
        let target = root(1);
        cache.put(target, Slot::new(0), Hash256::zero(), 0);
        cache.put(root(2), Slot::new(1), root(1), 0);
        cache.put(root(3), Slot::new(4), root(2), 0);

        // Block at slot 1 includes an attestation for slot 0 voting the chain head and target.
        cache.get(root(2)).unwrap().set_body(BeaconBlockBody {
            attestations: vec![attestation(0, 0, vec![0b0000_0111], root(1), target)],
        });
        // Next-epoch block includes a late attestation with one additional validator.
        cache.get(root(3)).unwrap().set_body(BeaconBlockBody {
            attestations: vec![attestation(0, 0, vec![0b0000_1111], root(2), target)],
        });

        let stats_cache = EpochStatsCache::new();
        let (stats, _) = stats_cache.create_or_get(Epoch::new(0), target);
        {
            let mut duties = stats.duties_write().await;
            let mut assignments: HashMap<(Slot, u64), Vec<u64>> = HashMap::new();
            assignments.insert((Slot::new(0), 0), vec![10, 11, 12, 13]);
            duties.attester_assignments = Some(assignments);
            duties.proposer_assignments = Some(HashMap::new());
        }
        if with_balances {
            let mut validator_stats = EpochValidatorStats::default();
            for (index, balance) in [(10, 32), (11, 32), (12, 31), (13, 30)] {
                validator_stats.validator_balances.insert(index, balance);
            }
            *stats.validators_write().await = Some(validator_stats);
        }

        Fixture {
            cache,
            chain,
            stats,
            head: root(3),
            target,
        }
    }

    #[tokio::test]
    async fn weighted_aggregation_with_late_inclusion() {
        let fix = fixture(true).await;
        let votes = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            fix.head,
            &fix.stats,
            fix.target,
            false,
            true,
            &null_logger(),
        )
        .await;

        assert!(!votes.vote_counts);
        // Validators 10, 11, 12 vote in epoch 0; 13 only in the late aggregate.
        assert_eq!(votes.current_epoch.total_vote_amount, 32 + 32 + 31);
        assert_eq!(votes.current_epoch.target_vote_amount, 95);
        // The attestation names the including block's parent, so it is a head vote.
        assert_eq!(votes.current_epoch.head_vote_amount, 95);
        assert_eq!(votes.next_epoch.total_vote_amount, 30);
        assert_eq!(votes.next_epoch.target_vote_amount, 30);
        assert_eq!(votes.activity.len(), 4);

        // Idempotent over the same inputs.
        let again = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            fix.head,
            &fix.stats,
            fix.target,
            false,
            true,
            &null_logger(),
        )
        .await;
        assert_eq!(votes, again);
    }

    #[tokio::test]
    async fn current_only_excludes_late_inclusions() {
        let fix = fixture(true).await;
        let votes = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            fix.head,
            &fix.stats,
            fix.target,
            true,
            true,
            &null_logger(),
        )
        .await;

        assert_eq!(votes.next_epoch, VoteBucket::default());
        assert_eq!(votes.activity.len(), 3);
    }

    #[tokio::test]
    async fn falls_back_to_vote_counts_without_validator_stats() {
        let fix = fixture(false).await;
        let votes = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            fix.head,
            &fix.stats,
            fix.target,
            false,
            true,
            &null_logger(),
        )
        .await;

        assert!(votes.vote_counts);
        // One unit per unique voting validator.
        assert_eq!(
            votes.current_epoch.total_vote_amount + votes.next_epoch.total_vote_amount,
            votes.activity.len() as u64
        );
    }

    #[tokio::test]
    async fn adding_a_block_never_decreases_buckets() {
        let fix = fixture(true).await;
        let before = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            fix.head,
            &fix.stats,
            fix.target,
            false,
            true,
            &null_logger(),
        )
        .await;

        // Extend the chain with another next-epoch block carrying a new aggregate.
        fix.cache.put(root(4), Slot::new(5), root(3), 0);
        fix.cache.get(root(4)).unwrap().set_body(BeaconBlockBody {
            attestations: vec![attestation(1, 0, vec![0b0000_0001], root(9), root(9))],
        });
        {
            let mut duties = fix.stats.duties_write().await;
            duties
                .attester_assignments
                .as_mut()
                .unwrap()
                .insert((Slot::new(1), 0), vec![20]);
        }

        let after = aggregate_epoch_votes(
            &fix.cache,
            &fix.chain,
            Epoch::new(0),
            root(4),
            &fix.stats,
            fix.target,
            false,
            true,
            &null_logger(),
        )
        .await;

        assert!(after.current_epoch.total_vote_amount >= before.current_epoch.total_vote_amount);
        assert!(after.next_epoch.total_vote_amount >= before.next_epoch.total_vote_amount);
        assert!(after.activity.len() >= before.activity.len());
    }
}
