//! Per-epoch duty assignments and validator snapshots.
//!
//! Records are keyed by `(epoch, dependent_root)`: the same epoch can have several records
//! alive at once, one per fork the connected clients are following. Records are peers; none
//! shadows another.
//!
//! Each record has two independent readiness gates, realised as async reader-writer locks. A
//! loader holds the write half for the duration of a population pass, so "the read half can be
//! acquired" doubles as the readiness probe and readers that want to wait simply await a read
//! guard.

use crate::api_types::StateId;
use crate::types::{Epoch, Hash256, Slot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Duty assignments for one epoch, derived from one dependent root.
#[derive(Default)]
pub struct EpochDuties {
    /// State identifier used to query committees and validators for this epoch.
    pub dependent_state_ref: Option<StateId>,
    /// One entry per slot of the epoch. Contains [`crate::types::UNKNOWN_PROPOSER`] when the
    /// chain no longer exposes proposer assignments ahead of time.
    pub proposer_assignments: Option<HashMap<Slot, u64>>,
    /// Validator order per `(slot, committee_index)` defines attestation aggregation bit
    /// positions and must match the upstream response ordering.
    pub attester_assignments: Option<HashMap<(Slot, u64), Vec<u64>>>,
    /// Only present from the Altair fork onward. `Some(vec![])` means loaded-but-empty.
    pub sync_assignments: Option<Vec<u64>>,
}

impl EpochDuties {
    /// Whether the fields a duty load is responsible for are all populated.
    pub fn is_complete(&self, requires_sync_committee: bool) -> bool {
        self.proposer_assignments.is_some()
            && self.attester_assignments.is_some()
            && (!requires_sync_committee || self.sync_assignments.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochValidatorStats {
    pub validator_count: u64,
    pub validator_balance: u64,
    pub eligible_amount: u64,
    /// Effective balance per validator index, used to weight votes.
    pub validator_balances: HashMap<u64, u64>,
}

pub struct EpochStats {
    pub epoch: Epoch,
    pub dependent_root: Hash256,
    duties: RwLock<EpochDuties>,
    validators: RwLock<Option<EpochValidatorStats>>,
    seen_count: parking_lot::Mutex<u64>,
}

impl EpochStats {
    fn new(epoch: Epoch, dependent_root: Hash256) -> Self {
        EpochStats {
            epoch,
            dependent_root,
            duties: RwLock::new(EpochDuties::default()),
            validators: RwLock::new(None),
            seen_count: parking_lot::Mutex::new(0),
        }
    }

    /// `true` when no duty load is in progress.
    pub fn is_ready(&self) -> bool {
        self.duties.try_read().is_ok()
    }

    /// `true` when no validator load is in progress.
    pub fn is_validators_ready(&self) -> bool {
        self.validators.try_read().is_ok()
    }

    /// Wait for any in-flight duty load to finish.
    pub async fn duties(&self) -> RwLockReadGuard<'_, EpochDuties> {
        self.duties.read().await
    }

    pub fn try_duties(&self) -> Option<RwLockReadGuard<'_, EpochDuties>> {
        self.duties.try_read().ok()
    }

    pub async fn validators(&self) -> RwLockReadGuard<'_, Option<EpochValidatorStats>> {
        self.validators.read().await
    }

    pub fn try_validators(&self) -> Option<RwLockReadGuard<'_, Option<EpochValidatorStats>>> {
        self.validators.try_read().ok()
    }

    pub(crate) async fn duties_write(&self) -> RwLockWriteGuard<'_, EpochDuties> {
        self.duties.write().await
    }

    pub(crate) async fn validators_write(
        &self,
    ) -> RwLockWriteGuard<'_, Option<EpochValidatorStats>> {
        self.validators.write().await
    }

    /// Whether a validator load is worth spawning: nothing loaded and no load in flight.
    pub(crate) fn validators_unloaded(&self) -> bool {
        self.validators
            .try_read()
            .map(|guard| guard.is_none())
            .unwrap_or(false)
    }

    /// Duties are loaded when the lock is free and a previous pass populated the mandatory
    /// fields.
    pub fn duties_loaded(&self) -> bool {
        self.try_duties()
            .map(|duties| {
                duties.proposer_assignments.is_some() && duties.attester_assignments.is_some()
            })
            .unwrap_or(false)
    }

    /// How many load passes completed for this record, across all clients.
    pub fn seen_count(&self) -> u64 {
        *self.seen_count.lock()
    }

    pub(crate) fn increment_seen_count(&self) -> u64 {
        let mut seen_count = self.seen_count.lock();
        *seen_count += 1;
        *seen_count
    }
}

/// All live [`EpochStats`] records, grouped by epoch.
#[derive(Default)]
pub struct EpochStatsCache {
    map: parking_lot::RwLock<HashMap<Epoch, Vec<Arc<EpochStats>>>>,
}

impl EpochStatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the record for `(epoch, dependent_root)`. With `None` the first record of the
    /// epoch (if any) is returned.
    pub fn get(&self, epoch: Epoch, dependent_root: Option<Hash256>) -> Option<Arc<EpochStats>> {
        let map = self.map.read();
        let records = map.get(&epoch)?;
        match dependent_root {
            Some(root) => records
                .iter()
                .find(|stats| stats.dependent_root == root)
                .cloned(),
            None => records.first().cloned(),
        }
    }

    pub fn all_for_epoch(&self, epoch: Epoch) -> Vec<Arc<EpochStats>> {
        self.map.read().get(&epoch).cloned().unwrap_or_default()
    }

    /// Atomic create-or-get. The boolean is `true` when the record was created by this call.
    pub fn create_or_get(
        &self,
        epoch: Epoch,
        dependent_root: Hash256,
    ) -> (Arc<EpochStats>, bool) {
        let mut map = self.map.write();
        let records = map.entry(epoch).or_default();
        if let Some(existing) = records
            .iter()
            .find(|stats| stats.dependent_root == dependent_root)
        {
            return (existing.clone(), false);
        }
        let stats = Arc::new(EpochStats::new(epoch, dependent_root));
        records.push(stats.clone());
        (stats, true)
    }

    /// Drop every record for epochs strictly below `epoch`.
    pub fn remove_epochs_below(&self, epoch: Epoch) -> usize {
        let mut map = self.map.write();
        let before: usize = map.values().map(Vec::len).sum();
        map.retain(|&record_epoch, _| record_epoch >= epoch);
        before - map.values().map(Vec::len).sum::<usize>()
    }

    pub fn len(&self) -> usize {
        self.map.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_or_get_is_idempotent_per_dependent_root() {
        let cache = EpochStatsCache::new();
        let root_a = Hash256::repeat_byte(0xaa);
        let root_b = Hash256::repeat_byte(0xbb);

        let (stats_a, new_a) = cache.create_or_get(Epoch::new(1), root_a);
        let (stats_a2, new_a2) = cache.create_or_get(Epoch::new(1), root_a);
        assert!(new_a);
        assert!(!new_a2);
        assert!(Arc::ptr_eq(&stats_a, &stats_a2));

        // A different dependent root creates a peer record for the same epoch.
        let (_, new_b) = cache.create_or_get(Epoch::new(1), root_b);
        assert!(new_b);
        assert_eq!(cache.all_for_epoch(Epoch::new(1)).len(), 2);

        assert!(cache.get(Epoch::new(1), Some(root_b)).is_some());
        assert!(cache.get(Epoch::new(2), None).is_none());
    }

    #[test]
    fn readiness_reflects_write_lock() {
        let stats = EpochStats::new(Epoch::new(0), Hash256::zero());
        assert!(stats.is_ready());
        assert!(!stats.duties_loaded());

        let guard = stats.duties.try_write().unwrap();
        assert!(!stats.is_ready());
        drop(guard);
        assert!(stats.is_ready());
    }

    #[test]
    fn seen_count_is_monotonic() {
        let stats = EpochStats::new(Epoch::new(0), Hash256::zero());
        assert_eq!(stats.seen_count(), 0);
        assert_eq!(stats.increment_seen_count(), 1);
        assert_eq!(stats.increment_seen_count(), 2);
        assert_eq!(stats.seen_count(), 2);
    }

    #[test]
    fn prune_drops_old_epochs() {
        let cache = EpochStatsCache::new();
        cache.create_or_get(Epoch::new(1), Hash256::repeat_byte(1));
        cache.create_or_get(Epoch::new(2), Hash256::repeat_byte(2));
        cache.create_or_get(Epoch::new(2), Hash256::repeat_byte(3));

        assert_eq!(cache.remove_epochs_below(Epoch::new(2)), 1);
        assert!(cache.get(Epoch::new(1), None).is_none());
        assert_eq!(cache.all_for_epoch(Epoch::new(2)).len(), 2);
    }
}
