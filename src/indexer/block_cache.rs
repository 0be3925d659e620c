//! An in-memory cache of recently observed blocks, indexed by root and by slot.
//!
//! Chain membership is always evaluated by walking parent links back from a given head root, so
//! blocks from competing forks can coexist. Walks are bounded by slot ranges and terminate at
//! slot zero or at the first unknown parent; partial information is returned rather than failing.

use crate::api_types::{BeaconBlockBody, BeaconBlockHeader};
use crate::types::{Epoch, Hash256, Slot};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A single observed block. The `root` and `slot` are fixed at insertion; everything else is
/// filled in lazily and guarded by the per-block lock.
pub struct CacheBlock {
    pub root: Hash256,
    pub slot: Slot,
    inner: RwLock<BlockInner>,
}

struct BlockInner {
    parent_root: Hash256,
    header: Option<BeaconBlockHeader>,
    body: Option<BeaconBlockBody>,
    seen_by: SmallVec<[u16; 4]>,
    is_canonical: bool,
    is_orphaned: bool,
    is_persisted: bool,
}

impl CacheBlock {
    fn new(root: Hash256, slot: Slot, parent_root: Hash256) -> Self {
        CacheBlock {
            root,
            slot,
            inner: RwLock::new(BlockInner {
                parent_root,
                header: None,
                body: None,
                seen_by: SmallVec::new(),
                is_canonical: false,
                is_orphaned: false,
                is_persisted: false,
            }),
        }
    }

    pub fn epoch(&self, slots_per_epoch: u64) -> Epoch {
        self.slot.epoch(slots_per_epoch)
    }

    pub fn parent_root(&self) -> Hash256 {
        self.inner.read().parent_root
    }

    pub fn header(&self) -> Option<BeaconBlockHeader> {
        self.inner.read().header.clone()
    }

    pub fn set_header(&self, header: BeaconBlockHeader) {
        self.inner.write().header = Some(header);
    }

    pub fn has_body(&self) -> bool {
        self.inner.read().body.is_some()
    }

    pub fn set_body(&self, body: BeaconBlockBody) {
        self.inner.write().body = Some(body);
    }

    /// Run `f` against the block body without cloning it. The per-block lock is held for the
    /// duration of `f`.
    pub fn with_body<R>(&self, f: impl FnOnce(Option<&BeaconBlockBody>) -> R) -> R {
        f(self.inner.read().body.as_ref())
    }

    pub fn attestation_count(&self) -> usize {
        self.inner
            .read()
            .body
            .as_ref()
            .map_or(0, |body| body.attestations.len())
    }

    pub fn seen_by(&self) -> SmallVec<[u16; 4]> {
        self.inner.read().seen_by.clone()
    }

    pub fn mark_seen_by(&self, client_id: u16) {
        let mut inner = self.inner.write();
        if !inner.seen_by.contains(&client_id) {
            inner.seen_by.push(client_id);
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.inner.read().is_canonical
    }

    pub fn is_orphaned(&self) -> bool {
        self.inner.read().is_orphaned
    }

    pub fn is_persisted(&self) -> bool {
        self.inner.read().is_persisted
    }

    pub fn set_persisted(&self) {
        self.inner.write().is_persisted = true;
    }
}

#[derive(Default)]
pub struct BlockCache {
    blocks: RwLock<HashMap<Hash256, Arc<CacheBlock>>>,
    slot_index: RwLock<BTreeMap<Slot, SmallVec<[Hash256; 2]>>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block observation. Idempotent: a root already present only gains another
    /// `seen_by` entry. The boolean is `true` on first insertion.
    pub fn put(
        &self,
        root: Hash256,
        slot: Slot,
        parent_root: Hash256,
        client_id: u16,
    ) -> (Arc<CacheBlock>, bool) {
        let mut blocks = self.blocks.write();
        if let Some(existing) = blocks.get(&root) {
            existing.mark_seen_by(client_id);
            return (existing.clone(), false);
        }

        let block = Arc::new(CacheBlock::new(root, slot, parent_root));
        block.mark_seen_by(client_id);
        blocks.insert(root, block.clone());
        self.slot_index
            .write()
            .entry(slot)
            .or_default()
            .push(root);
        (block, true)
    }

    pub fn get(&self, root: Hash256) -> Option<Arc<CacheBlock>> {
        self.blocks.read().get(&root).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn highest_slot(&self) -> Option<Slot> {
        self.slot_index
            .read()
            .keys()
            .next_back()
            .copied()
    }

    /// Walk parent links from `head`, calling `visit` for every known block with
    /// `slot >= lo`. Stops at slot zero, below `lo`, or at the first unknown parent.
    fn walk_chain(&self, head: Hash256, lo: Slot, mut visit: impl FnMut(&Arc<CacheBlock>)) {
        let mut current = match self.get(head) {
            Some(block) => block,
            None => return,
        };
        loop {
            if current.slot < lo {
                return;
            }
            visit(&current);
            if current.slot.as_u64() == 0 {
                return;
            }
            let parent_root = current.parent_root();
            current = match self.get(parent_root) {
                Some(block) => block,
                None => return,
            };
        }
    }

    /// The block with the smallest slot inside `epoch` on the chain ending at `head`.
    pub fn first_canonical_block(
        &self,
        epoch: Epoch,
        slots_per_epoch: u64,
        head: Hash256,
    ) -> Option<Arc<CacheBlock>> {
        let lo = epoch.start_slot(slots_per_epoch);
        let hi = epoch.end_slot(slots_per_epoch);
        let mut first = None;
        self.walk_chain(head, lo, |block| {
            if block.slot <= hi {
                first = Some(block.clone());
            }
        });
        first
    }

    /// The block with the largest slot inside `epoch` on the chain ending at `head`.
    pub fn last_canonical_block(
        &self,
        epoch: Epoch,
        slots_per_epoch: u64,
        head: Hash256,
    ) -> Option<Arc<CacheBlock>> {
        let lo = epoch.start_slot(slots_per_epoch);
        let hi = epoch.end_slot(slots_per_epoch);
        let mut last = None;
        self.walk_chain(head, lo, |block| {
            if block.slot <= hi && last.is_none() {
                last = Some(block.clone());
            }
        });
        last
    }

    /// All blocks with `lo <= slot <= hi` on the chain ending at `head`, in ascending slot
    /// order.
    pub fn blocks_in_slot_range(
        &self,
        lo: Slot,
        hi: Slot,
        head: Hash256,
    ) -> Vec<Arc<CacheBlock>> {
        let mut blocks = Vec::new();
        self.walk_chain(head, lo, |block| {
            if block.slot <= hi {
                blocks.push(block.clone());
            }
        });
        blocks.reverse();
        blocks
    }

    /// Is `root` an ancestor of (or equal to) `head`, within the cached window?
    pub fn is_canonical_of(&self, root: Hash256, head: Hash256) -> bool {
        let lo = self.get(root).map(|block| block.slot).unwrap_or_default();
        let mut found = false;
        self.walk_chain(head, lo, |block| {
            if block.root == root {
                found = true;
            }
        });
        found
    }

    /// Flag the ancestry of `head` down to `lo` as canonical and every other cached block in
    /// that slot range as orphaned. Called whenever a client head moves.
    pub fn set_canonical_chain(&self, head: Hash256, lo: Slot) {
        let mut chain = HashSet::new();
        self.walk_chain(head, lo, |block| {
            chain.insert(block.root);
            let mut inner = block.inner.write();
            inner.is_canonical = true;
            inner.is_orphaned = false;
        });

        let hi = match self.get(head) {
            Some(block) => block.slot,
            None => return,
        };
        // Lock order: blocks before slot_index, as everywhere else.
        let blocks = self.blocks.read();
        let slot_index = self.slot_index.read();
        for (_, roots) in slot_index.range(lo..=hi) {
            for root in roots {
                if chain.contains(root) {
                    continue;
                }
                if let Some(block) = blocks.get(root) {
                    let mut inner = block.inner.write();
                    inner.is_canonical = false;
                    inner.is_orphaned = true;
                }
            }
        }
    }

    /// Every cached block with `lo <= slot <= hi`, canonical or not, in ascending slot order.
    pub fn all_blocks_in_range(&self, lo: Slot, hi: Slot) -> Vec<Arc<CacheBlock>> {
        let blocks = self.blocks.read();
        let slot_index = self.slot_index.read();
        slot_index
            .range(lo..=hi)
            .flat_map(|(_, roots)| roots.iter())
            .filter_map(|root| blocks.get(root).cloned())
            .collect()
    }

    /// Drop all persisted blocks with `slot < below`. Unpersisted blocks are retained until the
    /// writer has committed them.
    pub fn prune(&self, below: Slot) -> usize {
        let mut blocks = self.blocks.write();
        let mut slot_index = self.slot_index.write();
        let prunable: Vec<Slot> = slot_index
            .range(..below)
            .map(|(slot, _)| *slot)
            .collect();

        let mut removed = 0;
        for slot in prunable {
            if let Some(roots) = slot_index.get_mut(&slot) {
                roots.retain(|root| {
                    let keep = blocks.get(root).map_or(false, |block| !block.is_persisted());
                    if !keep && blocks.remove(root).is_some() {
                        removed += 1;
                    }
                    keep
                });
                if roots.is_empty() {
                    slot_index.remove(&slot);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(byte: u8) -> Hash256 {
        Hash256::repeat_byte(byte)
    }

    /// A linear chain with one block per slot, starting at slot 0.
    fn linear_chain(cache: &BlockCache, slots: u64) -> Vec<Hash256> {
        let mut roots = vec![];
        let mut parent = Hash256::zero();
        for slot in 0..slots {
            let block_root = root(slot as u8 + 1);
            cache.put(block_root, Slot::new(slot), parent, 0);
            roots.push(block_root);
            parent = block_root;
        }
        roots
    }

    #[test]
    fn put_is_idempotent() {
        let cache = BlockCache::new();
        let (_, new) = cache.put(root(1), Slot::new(0), Hash256::zero(), 0);
        assert!(new);
        let (block, new) = cache.put(root(1), Slot::new(0), Hash256::zero(), 1);
        assert!(!new);
        assert_eq!(block.seen_by().as_slice(), &[0, 1]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_and_last_canonical() {
        let cache = BlockCache::new();
        let roots = linear_chain(&cache, 64);
        let head = roots[63];

        let first = cache
            .first_canonical_block(Epoch::new(1), 32, head)
            .unwrap();
        assert_eq!(first.slot, Slot::new(32));

        let last = cache.last_canonical_block(Epoch::new(1), 32, head).unwrap();
        assert_eq!(last.slot, Slot::new(63));

        // Walking from a mid-chain head must not see later blocks.
        let last = cache
            .last_canonical_block(Epoch::new(1), 32, roots[40])
            .unwrap();
        assert_eq!(last.slot, Slot::new(40));
    }

    #[test]
    fn walks_handle_skipped_slots_and_gaps() {
        let cache = BlockCache::new();
        // Slots 0, 1, 3 with 2 skipped.
        cache.put(root(1), Slot::new(0), Hash256::zero(), 0);
        cache.put(root(2), Slot::new(1), root(1), 0);
        cache.put(root(4), Slot::new(3), root(2), 0);

        let blocks = cache.blocks_in_slot_range(Slot::new(0), Slot::new(3), root(4));
        let slots: Vec<u64> = blocks.iter().map(|b| b.slot.as_u64()).collect();
        assert_eq!(slots, vec![0, 1, 3]);

        // Unknown parent terminates the walk with partial results.
        cache.put(root(9), Slot::new(5), root(8), 0);
        let blocks = cache.blocks_in_slot_range(Slot::new(0), Slot::new(5), root(9));
        let slots: Vec<u64> = blocks.iter().map(|b| b.slot.as_u64()).collect();
        assert_eq!(slots, vec![5]);
    }

    #[test]
    fn fork_walks_follow_the_given_head() {
        let cache = BlockCache::new();
        cache.put(root(1), Slot::new(0), Hash256::zero(), 0);
        cache.put(root(2), Slot::new(1), root(1), 0);
        // Two children of root(2) at slot 2.
        cache.put(root(3), Slot::new(2), root(2), 0);
        cache.put(root(4), Slot::new(2), root(2), 1);

        let last_a = cache.last_canonical_block(Epoch::new(0), 32, root(3)).unwrap();
        let last_b = cache.last_canonical_block(Epoch::new(0), 32, root(4)).unwrap();
        assert_eq!(last_a.root, root(3));
        assert_eq!(last_b.root, root(4));

        assert!(cache.is_canonical_of(root(2), root(3)));
        assert!(!cache.is_canonical_of(root(4), root(3)));
    }

    #[test]
    fn orphans_are_flagged_on_reorg() {
        let cache = BlockCache::new();
        cache.put(root(1), Slot::new(0), Hash256::zero(), 0);
        cache.put(root(2), Slot::new(1), root(1), 0);
        cache.put(root(3), Slot::new(2), root(2), 0);
        cache.set_canonical_chain(root(3), Slot::new(0));
        assert!(cache.get(root(3)).unwrap().is_canonical());

        // A competing block at slot 2 becomes the new head.
        cache.put(root(4), Slot::new(2), root(2), 0);
        cache.set_canonical_chain(root(4), Slot::new(0));

        assert!(cache.get(root(4)).unwrap().is_canonical());
        let old = cache.get(root(3)).unwrap();
        assert!(!old.is_canonical());
        assert!(old.is_orphaned());
        // Shared ancestry stays canonical.
        assert!(cache.get(root(2)).unwrap().is_canonical());
    }

    #[test]
    fn prune_only_removes_persisted_blocks() {
        let cache = BlockCache::new();
        let roots = linear_chain(&cache, 4);
        cache.get(roots[0]).unwrap().set_persisted();
        cache.get(roots[1]).unwrap().set_persisted();

        let removed = cache.prune(Slot::new(3));
        assert_eq!(removed, 2);
        assert!(cache.get(roots[0]).is_none());
        assert!(cache.get(roots[2]).is_some());

        // Unpersisted block at slot 2 survives below the threshold.
        assert_eq!(cache.prune(Slot::new(3)), 0);
        assert!(cache.get(roots[2]).is_some());
    }
}
