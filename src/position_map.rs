// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Position maps, which record the leaf every block is currently routed toward.

use crate::{utils::random_leaf, BlockId, LeafId, OramError, TreeHeight};
use parking_lot::Mutex;
use rand::{CryptoRng, Rng};

/// Maps block identifiers to leaves. Shared between the workers of a concurrent store.
pub trait PositionMap
where
    Self: Sized + Send + Sync,
{
    /// Returns a map for blocks `0..block_capacity` in a tree of height `height`,
    /// with no block assigned yet.
    fn new(block_capacity: BlockId, height: TreeHeight) -> Result<Self, OramError>;

    /// Returns `(old_leaf, new_leaf)` for `block_id`, recording `new_leaf` as its fresh
    /// uniformly random leaf. A block that was never assigned reports a random `old_leaf`.
    ///
    /// A decoy lookup leaves the map untouched and reports `new_leaf == old_leaf`.
    fn lookup_and_reassign<R: Rng + CryptoRng>(
        &self,
        block_id: BlockId,
        is_decoy: bool,
        rng: &mut R,
    ) -> Result<(LeafId, LeafId), OramError>;

    /// Records `leaf` as the leaf of `block_id`, for blocks placed without a lookup.
    fn assign(&self, block_id: BlockId, leaf: LeafId) -> Result<(), OramError>;
}

/// A position map held as a plain array in trusted memory.
///
/// Lookups index the array directly, so the map itself is not oblivious; it is meant for
/// deployments where the map never leaves protected memory, and for testing.
#[derive(Debug)]
pub struct InsecurePositionMap {
    leaves: Mutex<Vec<LeafId>>,
    height: TreeHeight,
}

impl InsecurePositionMap {
    const UNASSIGNED: LeafId = LeafId::MAX;
}

impl PositionMap for InsecurePositionMap {
    fn new(block_capacity: BlockId, height: TreeHeight) -> Result<Self, OramError> {
        Ok(Self {
            leaves: Mutex::new(vec![Self::UNASSIGNED; block_capacity.try_into()?]),
            height,
        })
    }

    fn lookup_and_reassign<R: Rng + CryptoRng>(
        &self,
        block_id: BlockId,
        is_decoy: bool,
        rng: &mut R,
    ) -> Result<(LeafId, LeafId), OramError> {
        let index: usize = block_id.try_into()?;
        let mut leaves = self.leaves.lock();
        let capacity = leaves.len();
        let slot = leaves
            .get_mut(index)
            .ok_or(OramError::AddressOutOfBoundsError {
                block_id,
                capacity: capacity.try_into()?,
            })?;

        let old_leaf = if *slot == Self::UNASSIGNED {
            random_leaf(self.height, rng)
        } else {
            *slot
        };
        if is_decoy {
            return Ok((old_leaf, old_leaf));
        }

        let new_leaf = random_leaf(self.height, rng);
        *slot = new_leaf;
        Ok((old_leaf, new_leaf))
    }

    fn assign(&self, block_id: BlockId, leaf: LeafId) -> Result<(), OramError> {
        let index: usize = block_id.try_into()?;
        let mut leaves = self.leaves.lock();
        let capacity = leaves.len();
        let slot = leaves
            .get_mut(index)
            .ok_or(OramError::AddressOutOfBoundsError {
                block_id,
                capacity: capacity.try_into()?,
            })?;
        *slot = leaf;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn reassignment_chains() {
        let mut rng = StdRng::seed_from_u64(0);
        let map = InsecurePositionMap::new(4, 3).unwrap();

        let (_, first) = map.lookup_and_reassign(2, false, &mut rng).unwrap();
        let (old, second) = map.lookup_and_reassign(2, false, &mut rng).unwrap();
        assert_eq!(old, first);
        let (old, _) = map.lookup_and_reassign(2, false, &mut rng).unwrap();
        assert_eq!(old, second);
        assert!(first < 8 && second < 8);
    }

    #[test]
    fn decoys_do_not_reassign() {
        let mut rng = StdRng::seed_from_u64(1);
        let map = InsecurePositionMap::new(4, 3).unwrap();

        let (_, assigned) = map.lookup_and_reassign(1, false, &mut rng).unwrap();
        let (old, new) = map.lookup_and_reassign(1, true, &mut rng).unwrap();
        assert_eq!((old, new), (assigned, assigned));
        let (old, _) = map.lookup_and_reassign(1, false, &mut rng).unwrap();
        assert_eq!(old, assigned);
    }

    #[test]
    fn assigned_leaves_are_looked_up() {
        let mut rng = StdRng::seed_from_u64(3);
        let map = InsecurePositionMap::new(4, 3).unwrap();

        map.assign(3, 5).unwrap();
        let (old, new) = map.lookup_and_reassign(3, false, &mut rng).unwrap();
        assert_eq!(old, 5);
        let (old, _) = map.lookup_and_reassign(3, true, &mut rng).unwrap();
        assert_eq!(old, new);
        assert!(map.assign(4, 0).is_err());
    }

    #[test]
    fn out_of_range_lookups_fail() {
        let mut rng = StdRng::seed_from_u64(2);
        let map = InsecurePositionMap::new(4, 3).unwrap();
        assert_eq!(
            map.lookup_and_reassign(4, false, &mut rng),
            Err(OramError::AddressOutOfBoundsError {
                block_id: 4,
                capacity: 4
            })
        );
    }
}
