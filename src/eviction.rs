// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Circuit ORAM eviction along one path.
//!
//! Eviction runs in three sweeps over the stash (level -1) and the buckets of the path
//! (levels 0 to `height`):
//!
//! 1. `deepest`, root to leaf: for every level, the deepest level any block at or above it
//!    may reach, and the shallowest level holding such a block.
//! 2. `target`, leaf to root: for every level, the level its deepest block should move to.
//!    A level is only chosen as a destination if it has a free slot or will itself give
//!    up a block.
//! 3. `evict`, stash then root to leaf: a single-block hold register picks up and drops
//!    blocks according to the targets.
//!
//! Every sweep touches every slot and only uses constant-time selections.

use crate::{
    block::Block,
    stash::{has_free, max_depth_in},
    utils::{ct_eq_i64, ct_ge_i64, max_depth, BOTTOM, STASH_LEVEL},
    BlockSize, LeafId, TreeHeight,
};
use subtle::{Choice, ConditionallySelectable};

fn select(choice: Choice, if_true: i64, if_false: i64) -> i64 {
    i64::conditional_select(&if_false, &if_true, choice)
}

/// Maps level -1 (the stash) through `height` to table positions.
fn slot(level: i64) -> usize {
    // Levels are never below the stash level.
    (level + 1) as usize
}

/// The per-level tables driving one eviction.
#[derive(Debug)]
pub(crate) struct EvictionPlan {
    path: LeafId,
    height: TreeHeight,
    longest_jump_down: Vec<i64>,
    closest_src_bucket: Vec<i64>,
    next_dst_bucket: Vec<i64>,
    has_free: Vec<Choice>,
    goal: i64,
    closest: i64,
}

impl EvictionPlan {
    pub(crate) fn new(path: LeafId, height: TreeHeight) -> Self {
        let levels = height as usize + 2;
        let mut longest_jump_down = vec![BOTTOM; levels];
        longest_jump_down[slot(STASH_LEVEL)] = -1;
        Self {
            path,
            height,
            longest_jump_down,
            closest_src_bucket: vec![BOTTOM; levels],
            next_dst_bucket: vec![BOTTOM; levels],
            has_free: vec![Choice::from(0); levels - 1],
            goal: -1,
            closest: STASH_LEVEL,
        }
    }

    /// First sweep, stash part. May be called once per stash chunk, before any level.
    pub(crate) fn scan_stash(&mut self, blocks: &[Block]) {
        let jump = max_depth_in(blocks, self.path, self.height);
        let deeper = !ct_ge_i64(self.goal, jump);
        self.goal = select(deeper, jump, self.goal);
        self.longest_jump_down[slot(STASH_LEVEL)] = self.goal;
    }

    /// First sweep, one bucket. Must be called for levels 0 to `height` in order.
    pub(crate) fn scan_level(&mut self, level: TreeHeight, bucket: &[Block]) {
        let i = i64::from(level);

        self.closest_src_bucket[slot(i)] = select(ct_ge_i64(self.goal, i), self.closest, BOTTOM);

        let jump = max_depth_in(bucket, self.path, self.height);
        self.longest_jump_down[slot(i)] = jump;

        let better = ct_ge_i64(jump, self.goal);
        self.closest = select(better, i, self.closest);
        self.goal = select(better, jump, self.goal);

        self.has_free[level as usize] = has_free(bucket);
    }

    /// Second sweep.
    pub(crate) fn target(&mut self) {
        let mut src = BOTTOM;
        let mut dst = BOTTOM;

        for level in (0..=self.height).rev() {
            let i = i64::from(level);

            let reached = ct_eq_i64(src, i);
            let next_dst = select(reached, dst, BOTTOM);
            self.next_dst_bucket[slot(i)] = next_dst;
            dst = select(reached, BOTTOM, dst);
            src = select(reached, BOTTOM, src);

            // Someone above can fill this level, and it either has room right now or will
            // give up its own deepest block further down.
            let closest_src = self.closest_src_bucket[slot(i)];
            let new_dst = !ct_eq_i64(closest_src, BOTTOM)
                & ((ct_eq_i64(dst, BOTTOM) & self.has_free[level as usize])
                    | !ct_eq_i64(next_dst, BOTTOM));

            dst = select(new_dst, i, dst);
            src = select(new_dst, closest_src, src);
        }

        self.next_dst_bucket[slot(STASH_LEVEL)] = select(ct_eq_i64(src, STASH_LEVEL), dst, BOTTOM);
    }

    /// Starts the third sweep.
    pub(crate) fn cursor(&self, block_size: BlockSize) -> EvictionCursor<'_> {
        EvictionCursor {
            plan: self,
            hold: Block::empty(block_size),
            dst: self.next_dst_bucket[slot(STASH_LEVEL)],
        }
    }
}

/// The hold register and pending destination of the third sweep.
pub(crate) struct EvictionCursor<'a> {
    plan: &'a EvictionPlan,
    hold: Block,
    dst: i64,
}

impl EvictionCursor<'_> {
    /// Third sweep, stash part. May be called once per stash chunk, before any level.
    pub(crate) fn evict_stash(&mut self, blocks: &mut [Block]) {
        let plan = self.plan;
        let fill = !ct_eq_i64(plan.next_dst_bucket[slot(STASH_LEVEL)], BOTTOM);
        let target_depth = plan.longest_jump_down[slot(STASH_LEVEL)];

        for block in blocks.iter_mut() {
            let deepest = ct_eq_i64(max_depth(block.leaf, plan.path, plan.height), target_depth)
                & fill
                & !block.ct_is_empty();
            self.hold.ct_swap(block, deepest);
        }
    }

    /// Third sweep, one bucket. Must be called for levels 0 to `height` in order.
    pub(crate) fn evict_level(&mut self, level: TreeHeight, bucket: &mut [Block]) {
        let plan = self.plan;
        let i = i64::from(level);
        let next_dst = plan.next_dst_bucket[slot(i)];
        let target_depth = plan.longest_jump_down[slot(i)];

        // The held block has reached its destination.
        let necessary = ct_eq_i64(i, self.dst) & !self.hold.ct_is_empty();
        self.dst = select(necessary, BOTTOM, self.dst);

        // This level gives up its deepest block, which takes the held block's place.
        let swap_valid = !ct_eq_i64(next_dst, BOTTOM);
        self.dst = select(swap_valid, next_dst, self.dst);

        for block in bucket.iter_mut() {
            let deepest = ct_eq_i64(max_depth(block.leaf, plan.path, plan.height), target_depth)
                & !block.ct_is_empty();
            let drop_hold = !swap_valid & necessary & block.ct_is_empty();
            self.hold.ct_swap(block, drop_hold | (swap_valid & deepest));
        }
    }

    /// Ends the sweep. The hold register is always empty once the leaf has been processed.
    pub(crate) fn finish(self) {
        debug_assert!(self.hold.is_empty(), "eviction lost {:?}", self.hold);
    }
}
