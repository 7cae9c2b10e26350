// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The stash, and the oblivious scans shared by the stash and fetched paths.
//!
//! Every scan here touches every slot it is given, whatever the outcome, so that
//! where (or whether) a block was found never shows up in timing or memory accesses.

use crate::{
    block::Block,
    utils::{ct_gt_i64, max_depth},
    BlockId, BlockSize, BucketSize, LeafId, OramError, StashSize, TreeHeight,
};
use parking_lot::Mutex;
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use zeroize::Zeroize;

/// Swaps into `hold` every block of `blocks` whose identifier is `block_id`, if `enabled`.
///
/// With `hold` empty and `block_id` present at most once, `hold` ends up holding that
/// block and its slot ends up empty.
pub fn find_and_extract(blocks: &mut [Block], block_id: BlockId, hold: &mut Block, enabled: Choice) {
    for block in blocks.iter_mut() {
        let found = block.id.ct_eq(&block_id) & enabled;
        hold.ct_swap(block, found);
    }
}

/// Moves `block` into the first empty slot of `blocks` while `pending` is set, clearing
/// `pending` once it is placed.
///
/// Chaining calls over consecutive chunks with the same `pending` inserts into the first
/// empty slot of the concatenation.
pub fn insert_first_empty(blocks: &mut [Block], block: &mut Block, pending: &mut Choice) {
    for slot in blocks.iter_mut() {
        let free = slot.ct_is_empty();
        let place = free & *pending;
        slot.ct_swap(block, place);
        *pending &= !place;
    }
}

/// Returns the deepest level any non-empty block of `blocks` may reach on `path`, or -1.
pub(crate) fn max_depth_in(blocks: &[Block], path: LeafId, height: TreeHeight) -> i64 {
    let mut deepest = -1i64;
    for block in blocks {
        let candidate = max_depth(block.leaf, path, height);
        let deeper = ct_gt_i64(candidate, deepest) & !block.ct_is_empty();
        deepest.conditional_assign(&candidate, deeper);
    }
    deepest
}

/// Returns whether `blocks` has an empty slot.
pub(crate) fn has_free(blocks: &[Block]) -> Choice {
    let mut free = Choice::from(0);
    for block in blocks {
        free |= block.ct_is_empty();
    }
    free
}

/// The bounded overflow area of a sequential store.
#[derive(Debug)]
pub struct Stash {
    blocks: Vec<Block>,
}

impl Stash {
    /// Returns a stash of `stash_size` empty slots of `block_size`-byte blocks.
    pub fn new(stash_size: StashSize, block_size: BlockSize) -> Self {
        Self {
            blocks: vec![Block::empty(block_size); stash_size],
        }
    }

    /// The number of slots.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the stash has no slots.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The number of occupied slots. Not oblivious; for monitoring only.
    pub fn occupancy(&self) -> StashSize {
        self.blocks.iter().filter(|block| !block.is_empty()).count()
    }

    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    /// Extracts the block `block_id` from the stash, returning an empty block if absent.
    pub fn find_and_extract(&mut self, block_id: BlockId, block_size: BlockSize) -> Block {
        let mut hold = Block::empty(block_size);
        find_and_extract(&mut self.blocks, block_id, &mut hold, Choice::from(1));
        hold
    }

    /// Inserts `block` into the first empty slot.
    ///
    /// # Errors
    ///
    /// Returns a `StashOverflowError` if every slot is occupied.
    pub fn insert(&mut self, mut block: Block) -> Result<(), OramError> {
        let mut pending = Choice::from(1);
        insert_first_empty(&mut self.blocks, &mut block, &mut pending);
        if bool::from(pending) {
            return Err(OramError::StashOverflowError);
        }
        Ok(())
    }
}

impl Drop for Stash {
    fn drop(&mut self) {
        self.blocks.zeroize();
    }
}

/// A stash split into independently locked chunks of `bucket_size` slots, the last one
/// holding the remainder. Chunks are always locked in ascending order.
#[derive(Debug)]
pub(crate) struct ChunkedStash {
    chunks: Vec<Mutex<Vec<Block>>>,
}

impl ChunkedStash {
    pub(crate) fn new(stash_size: StashSize, bucket_size: BucketSize, block_size: BlockSize) -> Self {
        let chunks = (0..stash_size)
            .step_by(bucket_size)
            .map(|start| {
                let len = bucket_size.min(stash_size - start);
                Mutex::new(vec![Block::empty(block_size); len])
            })
            .collect();
        Self { chunks }
    }

    pub(crate) fn chunks(&self) -> &[Mutex<Vec<Block>>] {
        &self.chunks
    }

    /// The number of occupied slots, locking each chunk in turn.
    pub(crate) fn occupancy(&self) -> StashSize {
        self.chunks
            .iter()
            .map(|chunk| chunk.lock().iter().filter(|block| !block.is_empty()).count())
            .sum()
    }
}

impl Drop for ChunkedStash {
    fn drop(&mut self) {
        for chunk in &mut self.chunks {
            chunk.get_mut().zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: BlockId, leaf: LeafId) -> Block {
        Block::new(id, leaf, vec![id as u8; 4])
    }

    #[test]
    fn extract_leaves_a_hole() {
        let mut stash = Stash::new(4, 4);
        stash.insert(block(1, 0)).unwrap();
        stash.insert(block(2, 1)).unwrap();

        let found = stash.find_and_extract(2, 4);
        assert_eq!(found, block(2, 1));
        assert_eq!(stash.occupancy(), 1);

        let missing = stash.find_and_extract(9, 4);
        assert!(missing.is_empty());
        assert_eq!(stash.occupancy(), 1);
    }

    #[test]
    fn disabled_extract_touches_nothing() {
        let mut blocks = vec![block(1, 0), block(2, 0)];
        let mut hold = Block::empty(4);
        find_and_extract(&mut blocks, 2, &mut hold, Choice::from(0));
        assert!(hold.is_empty());
        assert_eq!(blocks[1], block(2, 0));
    }

    #[test]
    fn insert_fills_first_hole_across_chunks() {
        let mut first = vec![block(1, 0), block(2, 0)];
        let mut second = vec![Block::empty(4), Block::empty(4)];
        let mut incoming = block(3, 0);
        let mut pending = Choice::from(1);

        insert_first_empty(&mut first, &mut incoming, &mut pending);
        insert_first_empty(&mut second, &mut incoming, &mut pending);

        assert!(!bool::from(pending));
        assert!(incoming.is_empty());
        assert_eq!(second[0], block(3, 0));
        assert!(second[1].is_empty());
    }

    #[test]
    fn overflow_is_reported() {
        let mut stash = Stash::new(2, 4);
        stash.insert(block(1, 0)).unwrap();
        stash.insert(block(2, 0)).unwrap();
        assert_eq!(stash.insert(block(3, 0)), Err(OramError::StashOverflowError));
    }

    #[test]
    fn chunks_cover_the_stash() {
        let stash = ChunkedStash::new(10, 4, 4);
        let sizes: Vec<usize> = stash.chunks().iter().map(|chunk| chunk.lock().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let small = ChunkedStash::new(3, 4, 4);
        assert_eq!(small.chunks().len(), 1);
        assert_eq!(small.chunks()[0].lock().len(), 3);

        let mut incoming = block(1, 0);
        let mut pending = Choice::from(1);
        for chunk in stash.chunks() {
            insert_first_empty(&mut chunk.lock(), &mut incoming, &mut pending);
        }
        assert_eq!(stash.occupancy(), 1);
    }

    #[test]
    fn depth_and_free_slots() {
        let blocks = vec![block(1, 0b000), Block::empty(4), block(2, 0b100)];
        // Path 0b100 shares two levels with leaf 0b000 and all three with leaf 0b100.
        assert_eq!(max_depth_in(&blocks, 0b100, 3), 3);
        assert_eq!(max_depth_in(&blocks[..2], 0b100, 3), 2);
        assert_eq!(max_depth_in(&blocks[1..2], 0b100, 3), -1);
        assert!(bool::from(has_free(&blocks)));
        assert!(!bool::from(has_free(&blocks[..1])));
    }
}
