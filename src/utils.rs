// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Utilities.

use crate::{LeafId, TreeHeight, TreeIndex};
use rand::{CryptoRng, Rng};
use subtle::{Choice, ConstantTimeEq, ConstantTimeGreater};

/// The level value denoting "no level" in the eviction tables.
pub(crate) const BOTTOM: i64 = -2;
/// The level value denoting the stash in the eviction tables.
pub(crate) const STASH_LEVEL: i64 = -1;

pub(crate) fn left_child(index: TreeIndex) -> TreeIndex {
    2 * index + 1
}

pub(crate) fn right_child(index: TreeIndex) -> TreeIndex {
    2 * index + 2
}

pub(crate) fn parent(index: TreeIndex) -> TreeIndex {
    (index - 1) >> 1
}

/// The depth of `index` in the tree; the root is at level 0.
pub(crate) fn level_of(index: TreeIndex) -> TreeHeight {
    (index + 1).ilog2()
}

/// Bit `level` of `leaf` selects the branch taken below level `level`: set means right.
pub(crate) fn goes_right(leaf: LeafId, level: TreeHeight) -> bool {
    (leaf >> level) & 1 == 1
}

/// Returns the child of `index` (which sits at `level`) on the path to `leaf`.
pub(crate) fn child_toward(index: TreeIndex, leaf: LeafId, level: TreeHeight) -> TreeIndex {
    2 * index + 1 + ((leaf >> level) & 1)
}

/// Returns the deepest level at which the paths to `leaf` and `path` still share a bucket.
///
/// This is the deepest level a block routed toward `leaf` may occupy on `path`.
pub(crate) fn max_depth(leaf: LeafId, path: LeafId, height: TreeHeight) -> i64 {
    i64::from(((leaf ^ path) | (1 << height)).trailing_zeros())
}

/// Returns a uniformly random leaf of a tree of height `height`.
pub(crate) fn random_leaf<R: Rng + CryptoRng>(height: TreeHeight, rng: &mut R) -> LeafId {
    rng.gen_range(0..(1u64 << height))
}

fn order_preserving(value: i64) -> u64 {
    (value as u64) ^ (1 << 63)
}

/// Constant-time `a > b` on signed values.
pub(crate) fn ct_gt_i64(a: i64, b: i64) -> Choice {
    order_preserving(a).ct_gt(&order_preserving(b))
}

/// Constant-time `a >= b` on signed values.
pub(crate) fn ct_ge_i64(a: i64, b: i64) -> Choice {
    !ct_gt_i64(b, a)
}

/// Constant-time `a == b` on signed values.
pub(crate) fn ct_eq_i64(a: i64, b: i64) -> Choice {
    a.ct_eq(&b)
}
