// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A sequential Circuit ORAM tree store.

use crate::{
    block::Block,
    bucket::{AssociatedData, BucketCodec},
    config::{OramConfig, TreeGeometry},
    crypto::ChaChaCipher,
    database::{Database, SimpleDatabase},
    eviction::EvictionPlan,
    position_map::{InsecurePositionMap, PositionMap},
    stash::{find_and_extract, Stash},
    utils::{child_toward, goes_right, parent},
    BlockId, BlockSize, LeafId, Oram, OramError, StashSize, Tag, TreeIndex,
};
use rand::{CryptoRng, Rng, RngCore};
use subtle::Choice;
use zeroize::Zeroize;

/// A doubly oblivious Circuit ORAM tree store.
///
/// The store holds `block_capacity` blocks in a binary tree of encrypted buckets kept in
/// untrusted memory `D`, plus a small stash in trusted memory. Callers name the leaf a
/// block currently sits on and the leaf it should move to; keeping track of leaves is the
/// job of a position map (see [`MappedCircuitOram`]).
///
/// Every access reads and rewrites one path, then evicts along the two paths
/// `2 * counter` and `2 * counter + 1` of a fixed schedule, so the physical access pattern
/// depends only on the (uniformly random) leaves named by the caller.
///
/// ## Integrity
///
/// Buckets are sealed with an AEAD whose associated data holds the tags of both children.
/// Only the root tag is kept in trusted memory. Any bucket that fails to authenticate is
/// reported as an `IntegrityError`, after which the store refuses every further operation.
///
/// ## Security
///
/// Operations are oblivious *unless* the stash overflows, which is reported as a fatal
/// `StashOverflowError`. With `Z = 4`, a stash of a few dozen blocks makes an overflow
/// vanishingly unlikely.
#[derive(Debug)]
pub struct CircuitOram<D: Database = SimpleDatabase> {
    config: OramConfig,
    geometry: TreeGeometry,
    /// The untrusted memory holding the bucket tree.
    pub(crate) physical_memory: D,
    codec: BucketCodec<ChaChaCipher>,
    /// The Circuit ORAM stash.
    pub(crate) stash: Stash,
    /// The buckets of the last fetched path, root first, `Z` blocks per level.
    fetched_path: Vec<Block>,
    /// The associated data of the last fetched path, root first.
    associated_data: Vec<AssociatedData>,
    /// The tag of the root bucket. The only integrity value held in trusted memory.
    merkle_root: Tag,
    access_counter: u64,
    /// The path fetched by `access_r`, awaiting `access_w`.
    split: Option<(LeafId, TreeIndex)>,
    poison: Option<OramError>,
}

impl<D: Database> CircuitOram<D> {
    /// Returns a new store for the parameters in `config`, with every block reading as zeroes.
    ///
    /// Only the root bucket is written; every other bucket is written the first time a path
    /// through it is.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `config` does not validate.
    pub fn new<R: RngCore + CryptoRng>(config: OramConfig, rng: &mut R) -> Result<Self, OramError> {
        log::info!(
            "CircuitOram::new(capacity = {}, block_size = {}, bucket_size = {}, stash_size = {})",
            config.block_capacity,
            config.block_size,
            config.bucket_size,
            config.stash_size,
        );

        let geometry = config.validate()?;
        let mut physical_memory = D::new(geometry.bucket_count)?;
        let codec = BucketCodec::new(ChaChaCipher::new(rng), config.block_size, config.bucket_size);

        let merkle_root = codec.store_bucket(
            &mut physical_memory,
            0,
            &codec.empty_blocks(),
            &AssociatedData::default(),
            rng,
        )?;

        let path_length = geometry.path_length();
        Ok(Self {
            stash: Stash::new(config.stash_size, config.block_size),
            fetched_path: vec![Block::empty(config.block_size); path_length * config.bucket_size],
            associated_data: vec![AssociatedData::default(); path_length],
            config,
            geometry,
            physical_memory,
            codec,
            merkle_root,
            access_counter: 0,
            split: None,
            poison: None,
        })
    }

    /// The number of blocks the store can hold.
    pub fn block_capacity(&self) -> BlockId {
        self.config.block_capacity
    }

    /// The payload size of a block.
    pub fn block_size(&self) -> BlockSize {
        self.config.block_size
    }

    /// The shape of the bucket tree.
    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    /// The tag of the root bucket.
    pub fn merkle_root(&self) -> Tag {
        self.merkle_root
    }

    /// The number of completed accesses.
    pub fn access_counter(&self) -> u64 {
        self.access_counter
    }

    /// The number of occupied stash slots. Not oblivious; for monitoring only.
    pub fn stash_occupancy(&self) -> StashSize {
        self.stash.occupancy()
    }

    /// The untrusted memory holding the bucket tree.
    pub fn physical_memory(&self) -> &D {
        &self.physical_memory
    }

    /// Reads block `block_id`, which the caller asserts is routed toward `leaf`, and re-routes
    /// it toward `next_leaf`. If `data_in` is given it replaces the payload.
    ///
    /// Returns the payload held before the call, or zeroes if the block was never written.
    pub fn access<R: RngCore + CryptoRng>(
        &mut self,
        block_id: BlockId,
        leaf: LeafId,
        data_in: Option<&[u8]>,
        next_leaf: LeafId,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        self.check_block_id(block_id)?;
        if let Some(data) = data_in {
            self.check_payload(data)?;
        }
        self.guarded(|oram| {
            let terminal = oram.fetch_path_unguarded(leaf)?;
            let mut fetched = oram.extract(block_id);
            let data_out = fetched.payload.clone();

            if let Some(data) = data_in {
                fetched.payload.copy_from_slice(data);
            }
            fetched.id = block_id;
            fetched.leaf = next_leaf;
            oram.stash.insert(fetched)?;

            oram.write_back_unguarded(leaf, terminal, rng)?;
            oram.evict_round(rng)?;
            Ok(data_out)
        })
    }

    /// The read half of a split access: fetches the path to `leaf` and extracts block
    /// `block_id` from it or from the stash, returning its payload.
    ///
    /// The block is removed from the store until the matching [`CircuitOram::access_w`].
    /// Other oblivious work may run in between, as long as it does not use this store.
    pub fn access_r(&mut self, block_id: BlockId, leaf: LeafId) -> Result<Vec<u8>, OramError> {
        self.check_block_id(block_id)?;
        self.guarded(|oram| {
            let terminal = oram.fetch_path_unguarded(leaf)?;
            let fetched = oram.extract(block_id);
            oram.split = Some((leaf, terminal));
            Ok(fetched.payload.clone())
        })
    }

    /// The write half of a split access: puts block `block_id` back with payload `data_in`,
    /// routed toward `next_leaf`, writes back the path fetched by `access_r` and evicts.
    ///
    /// # Errors
    ///
    /// Returns an `UnmatchedSplitAccessError` unless the last operation was `access_r` on `leaf`.
    pub fn access_w<R: RngCore + CryptoRng>(
        &mut self,
        block_id: BlockId,
        leaf: LeafId,
        data_in: &[u8],
        next_leaf: LeafId,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.check_block_id(block_id)?;
        self.check_payload(data_in)?;
        let geometry = self.geometry;
        match self.split {
            Some((split_leaf, _))
                if geometry.normalize_leaf(split_leaf) == geometry.normalize_leaf(leaf) => {}
            _ => return Err(OramError::UnmatchedSplitAccessError),
        }

        self.guarded(|oram| {
            let (_, terminal) = oram.split.take().ok_or(OramError::UnmatchedSplitAccessError)?;
            oram.stash
                .insert(Block::new(block_id, next_leaf, data_in.to_vec()))?;
            oram.write_back_unguarded(leaf, terminal, rng)?;
            oram.evict_round(rng)
        })
    }

    /// Inserts block `block_id` routed toward `next_leaf` without looking for an existing
    /// copy, then evicts. Meant for loading blocks that are not in the store yet.
    pub fn write<R: RngCore + CryptoRng>(
        &mut self,
        block_id: BlockId,
        data_in: &[u8],
        next_leaf: LeafId,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.check_block_id(block_id)?;
        self.check_payload(data_in)?;
        self.guarded(|oram| {
            oram.stash
                .insert(Block::new(block_id, next_leaf, data_in.to_vec()))?;
            oram.evict_round(rng)
        })
    }

    /// Reads and authenticates the path to `leaf` into the path buffer, returning the heap
    /// index of its leaf bucket.
    ///
    /// Buckets below the first one that was never written are not read; their slots are
    /// filled with empty blocks. Which buckets were ever written is already visible from
    /// the access pattern, so stopping early leaks nothing.
    pub fn fetch_path(&mut self, leaf: LeafId) -> Result<TreeIndex, OramError> {
        self.guarded(|oram| oram.fetch_path_unguarded(leaf))
    }

    /// Seals the path buffer back onto the path to `leaf`, from `terminal` (its leaf bucket)
    /// up to the root, and records the new root tag.
    pub fn write_back<R: RngCore + CryptoRng>(
        &mut self,
        leaf: LeafId,
        terminal: TreeIndex,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.guarded(|oram| oram.write_back_unguarded(leaf, terminal, rng))
    }

    fn guarded<T, F>(&mut self, operation: F) -> Result<T, OramError>
    where
        F: FnOnce(&mut Self) -> Result<T, OramError>,
    {
        if let Some(error) = &self.poison {
            return Err(error.clone());
        }
        let result = operation(self);
        if let Err(error) = &result {
            if error.is_fatal() {
                log::error!("CircuitOram is unusable after a fatal error: {}", error);
                self.poison = Some(error.clone());
            }
        }
        result
    }

    fn check_block_id(&self, block_id: BlockId) -> Result<(), OramError> {
        // Only leaks whether the identifier is well-formed.
        if block_id >= self.config.block_capacity {
            return Err(OramError::AddressOutOfBoundsError {
                block_id,
                capacity: self.config.block_capacity,
            });
        }
        Ok(())
    }

    fn check_payload(&self, data: &[u8]) -> Result<(), OramError> {
        if data.len() != self.config.block_size {
            return Err(OramError::InvalidBlockSizeError {
                expected: self.config.block_size,
                actual: data.len(),
            });
        }
        Ok(())
    }

    fn level_range(&self, level: u32) -> std::ops::Range<usize> {
        let start = level as usize * self.config.bucket_size;
        start..start + self.config.bucket_size
    }

    /// Scans the whole path buffer and then the whole stash for `block_id`.
    fn extract(&mut self, block_id: BlockId) -> Block {
        let mut hold = Block::empty(self.config.block_size);
        let enabled = Choice::from(1);
        find_and_extract(&mut self.fetched_path, block_id, &mut hold, enabled);
        find_and_extract(self.stash.blocks_mut(), block_id, &mut hold, enabled);
        hold
    }

    fn fetch_path_unguarded(&mut self, leaf: LeafId) -> Result<TreeIndex, OramError> {
        self.split = None;
        let height = self.geometry.height;

        let mut index: TreeIndex = 0;
        let mut expected_tag = self.merkle_root;
        let mut reachable = true;

        for level in 0..=height {
            let range = self.level_range(level);
            if reachable {
                let (blocks, associated_data) =
                    self.codec
                        .load_bucket(&mut self.physical_memory, index, &expected_tag)?;
                for (slot, block) in self.fetched_path[range].iter_mut().zip(blocks) {
                    *slot = block;
                }

                let right = goes_right(leaf, level);
                reachable = level < height && associated_data.reaches(right);
                expected_tag = *associated_data.child_tag(right);
                self.associated_data[level as usize] = associated_data;
            } else {
                for slot in &mut self.fetched_path[range] {
                    slot.id = Block::EMPTY_ID;
                }
                self.associated_data[level as usize] = AssociatedData::default();
            }

            if level < height {
                index = child_toward(index, leaf, level);
            }
        }

        Ok(index)
    }

    fn write_back_unguarded<R: RngCore + CryptoRng>(
        &mut self,
        leaf: LeafId,
        terminal: TreeIndex,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let height = self.geometry.height;

        // Mark the branch just taken as written. A sibling keeps its flag only if every
        // bucket above it was reached by the fetch.
        let mut reachable = true;
        for level in 0..height {
            let associated_data = &mut self.associated_data[level as usize];
            let right = goes_right(leaf, level);
            let sibling = reachable && associated_data.reaches(!right);
            associated_data.set_reaches(!right, sibling);
            reachable = reachable && associated_data.reaches(right);
            associated_data.set_reaches(right, true);
        }
        let leaf_data = &mut self.associated_data[height as usize];
        leaf_data.reach_left = false;
        leaf_data.reach_right = false;

        let mut index = terminal;
        for level in (0..=height).rev() {
            let range = self.level_range(level);
            let tag = self.codec.store_bucket(
                &mut self.physical_memory,
                index,
                &self.fetched_path[range],
                &self.associated_data[level as usize],
                rng,
            )?;

            if level > 0 {
                self.associated_data[level as usize - 1].set_child_tag(goes_right(leaf, level - 1), tag);
                index = parent(index);
            } else {
                self.merkle_root = tag;
            }
        }

        Ok(())
    }

    fn evict_round<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OramError> {
        let first = self.access_counter.wrapping_mul(2);
        self.evict(first, rng)?;
        self.evict(first.wrapping_add(1), rng)?;
        self.access_counter += 1;
        Ok(())
    }

    fn evict<R: RngCore + CryptoRng>(&mut self, path: LeafId, rng: &mut R) -> Result<(), OramError> {
        let terminal = self.fetch_path_unguarded(path)?;
        let height = self.geometry.height;

        let mut plan = EvictionPlan::new(path, height);
        plan.scan_stash(self.stash.blocks());
        for level in 0..=height {
            let range = self.level_range(level);
            plan.scan_level(level, &self.fetched_path[range]);
        }
        plan.target();

        let mut cursor = plan.cursor(self.config.block_size);
        cursor.evict_stash(self.stash.blocks_mut());
        for level in 0..=height {
            let range = self.level_range(level);
            cursor.evict_level(level, &mut self.fetched_path[range]);
        }
        cursor.finish();

        self.write_back_unguarded(path, terminal, rng)
    }

    /// Walks every bucket reachable from the root, authenticating each one, and returns
    /// their contents. Reads the whole tree; for inspection in tests only.
    #[cfg(test)]
    pub(crate) fn tree_contents(&mut self) -> Result<Vec<(TreeIndex, Vec<Block>)>, OramError> {
        let mut result = Vec::new();
        let mut pending = vec![(0, self.merkle_root)];
        while let Some((index, tag)) = pending.pop() {
            let (blocks, associated_data) =
                self.codec.load_bucket(&mut self.physical_memory, index, &tag)?;
            for right in [false, true] {
                if associated_data.reaches(right) {
                    let child = 2 * index + 1 + u64::from(right);
                    pending.push((child, *associated_data.child_tag(right)));
                }
            }
            result.push((index, blocks));
        }
        Ok(result)
    }
}

impl<D: Database> CircuitOram<D> {
    /// Overwrites the plaintext left in the path buffer by the last access.
    fn wipe_fetched_path(&mut self) {
        self.fetched_path.zeroize();
    }
}

impl<D: Database> Drop for CircuitOram<D> {
    fn drop(&mut self) {
        // The stash wipes itself.
        self.wipe_fetched_path();
    }
}

/// A [`CircuitOram`] paired with a position map, so that callers only name block identifiers.
#[derive(Debug)]
pub struct MappedCircuitOram<D: Database = SimpleDatabase, P: PositionMap = InsecurePositionMap> {
    /// The underlying tree store.
    pub(crate) oram: CircuitOram<D>,
    position_map: P,
}

impl<D: Database, P: PositionMap> MappedCircuitOram<D, P> {
    /// Returns a new store for the parameters in `config`, with every block reading as zeroes.
    pub fn new<R: RngCore + CryptoRng>(config: OramConfig, rng: &mut R) -> Result<Self, OramError> {
        let oram = CircuitOram::new(config, rng)?;
        let position_map = P::new(oram.block_capacity(), oram.geometry().height)?;
        Ok(Self { oram, position_map })
    }

    /// The underlying tree store.
    pub fn inner(&self) -> &CircuitOram<D> {
        &self.oram
    }
}

impl<D: Database, P: PositionMap> Oram for MappedCircuitOram<D, P> {
    fn block_capacity(&self) -> BlockId {
        self.oram.block_capacity()
    }

    fn block_size(&self) -> BlockSize {
        self.oram.block_size()
    }

    fn access<R: Rng + CryptoRng>(
        &mut self,
        block_id: BlockId,
        data_in: Option<&[u8]>,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        self.oram.check_block_id(block_id)?;
        let (leaf, next_leaf) = self.position_map.lookup_and_reassign(block_id, false, rng)?;
        self.oram.access(block_id, leaf, data_in, next_leaf, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::CountAccessesDatabase,
        test_utils::*,
        utils::{level_of, max_depth},
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn example_config() -> OramConfig {
        OramConfig::new(16, 8).with_bucket_size(4).with_stash_size(16)
    }

    #[test]
    fn split_access_round_trip() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(0);
        let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();

        oram.write(5, &[0xAA; 8], 3, &mut rng).unwrap();
        assert_eq!(oram.access_r(5, 3).unwrap(), vec![0xAA; 8]);
        oram.access_w(5, 3, &[0xBB; 8], 9, &mut rng).unwrap();
        assert_eq!(oram.access_r(5, 9).unwrap(), vec![0xBB; 8]);
    }

    #[test]
    fn access_returns_previous_value() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(1);
        let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();

        let first = oram.access(2, 0, Some(&[1; 8]), 6, &mut rng).unwrap();
        assert_eq!(first, vec![0; 8]);
        let second = oram.access(2, 6, None, 4, &mut rng).unwrap();
        assert_eq!(second, vec![1; 8]);
        let third = oram.access(2, 4, Some(&[2; 8]), 4, &mut rng).unwrap();
        assert_eq!(third, vec![1; 8]);
        assert_eq!(oram.access(2, 4, None, 1, &mut rng).unwrap(), vec![2; 8]);
        assert_eq!(oram.access_counter(), 4);
    }

    #[test]
    fn invalid_requests_are_not_fatal() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(2);
        let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();

        assert_eq!(
            oram.access(16, 0, None, 0, &mut rng),
            Err(OramError::AddressOutOfBoundsError {
                block_id: 16,
                capacity: 16
            })
        );
        assert_eq!(
            oram.write(1, &[0; 3], 0, &mut rng),
            Err(OramError::InvalidBlockSizeError {
                expected: 8,
                actual: 3
            })
        );
        assert_eq!(
            oram.access_w(1, 0, &[0; 8], 0, &mut rng),
            Err(OramError::UnmatchedSplitAccessError)
        );

        oram.access_r(1, 2).unwrap();
        assert_eq!(
            oram.access_w(1, 5, &[0; 8], 0, &mut rng),
            Err(OramError::UnmatchedSplitAccessError)
        );
        oram.access_w(1, 2, &[7; 8], 0, &mut rng).unwrap();
        assert_eq!(oram.access(1, 0, None, 0, &mut rng).unwrap(), vec![7; 8]);
    }

    #[test]
    fn path_invariant_holds_after_every_access() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(3);
        let config = OramConfig::new(32, 4).with_stash_size(20);
        let mut oram = MappedCircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();

        for i in 0..200u64 {
            let id = (i * 7) % 32;
            oram.write(id, &[i as u8; 4], &mut rng).unwrap();
            assert_path_invariant(&mut oram.oram);
        }
    }

    #[test]
    fn blocks_are_conserved() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(4);
        let config = OramConfig::new(64, 4).with_stash_size(32);
        let mut oram = MappedCircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();

        for id in 0..64u64 {
            oram.write(id, &[id as u8; 4], &mut rng).unwrap();
            let resident: usize = oram
                .oram
                .tree_contents()
                .unwrap()
                .iter()
                .map(|(_, blocks)| blocks.iter().filter(|b| !b.is_empty()).count())
                .sum();
            assert_eq!(resident + oram.oram.stash_occupancy(), id as usize + 1);
        }
    }

    #[test]
    fn stash_stays_small() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(5);
        let config = OramConfig::new(256, 4).with_stash_size(40);
        let mut oram = MappedCircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();
        let leaves = oram.oram.geometry().leaf_count;

        let mut largest = 0;
        for i in 0..(4 * leaves) {
            let id = rng.gen_range(0..256);
            oram.write(id, &[i as u8; 4], &mut rng).unwrap();
            largest = largest.max(oram.oram.stash_occupancy());
        }
        assert!(largest <= 20, "stash grew to {largest}");
    }

    #[test]
    fn every_access_writes_three_paths() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(6);
        let mut oram =
            MappedCircuitOram::<CountAccessesDatabase>::new(example_config(), &mut rng).unwrap();
        let path_length = oram.oram.geometry().path_length() as u64;

        for i in 0..50u64 {
            oram.oram.physical_memory.reset_counts();
            if i % 2 == 0 {
                oram.read(i % 16, &mut rng).unwrap();
            } else {
                oram.write(i % 16, &[1; 8], &mut rng).unwrap();
            }
            assert_eq!(oram.oram.physical_memory.get_write_count(), 3 * path_length);
            assert!(oram.oram.physical_memory.get_read_count() <= 3 * path_length);
        }

        oram.oram.physical_memory.reset_counts();
        oram.oram.write(3, &[2; 8], 1, &mut rng).unwrap();
        assert_eq!(oram.oram.physical_memory.get_write_count(), 2 * path_length);
    }

    #[test]
    fn eviction_schedule_covers_every_leaf() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(7);
        let mut oram =
            MappedCircuitOram::<CountAccessesDatabase>::new(example_config(), &mut rng).unwrap();
        let geometry = *oram.oram.geometry();

        // Writes go through the stash only, so every leaf write comes from eviction.
        for id in 0..(geometry.leaf_count / 2) {
            oram.oram.write(id, &[0; 8], 0, &mut rng).unwrap();
        }
        for leaf in 0..geometry.leaf_count {
            let index = geometry.leaf_bucket(leaf) as usize;
            assert_eq!(oram.oram.physical_memory.writes[index], 1, "leaf {leaf}");
        }
    }

    #[test]
    fn tampered_ciphertext_is_fatal() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(8);
        let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();
        oram.write(1, &[1; 8], 0, &mut rng).unwrap();

        let leaf_bucket = oram.geometry().leaf_bucket(0);
        oram.physical_memory.bucket_mut(leaf_bucket).ciphertext[20] ^= 1;

        let error = OramError::IntegrityError { index: leaf_bucket };
        assert_eq!(oram.access_r(1, 0), Err(error.clone()));
        // The store stays unusable, even for paths that were not tampered with.
        assert_eq!(oram.access_r(1, 1), Err(error.clone()));
        assert_eq!(oram.write(2, &[0; 8], 0, &mut rng), Err(error));
    }

    #[test]
    fn tampered_tag_or_flags_are_fatal() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(9);

        for target in 0..3 {
            let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();
            oram.write(1, &[1; 8], 0, &mut rng).unwrap();
            // Paths 0 and 1 are written by the first eviction round, so the root reaches
            // both of its children.
            let root_child = 1;
            let bucket = oram.physical_memory.bucket_mut(root_child);
            match target {
                0 => bucket.tag[0] ^= 1,
                1 => bucket.iv[0] ^= 1,
                _ => bucket.reach_left = !bucket.reach_left,
            }

            let result = oram.access(1, 0, None, 0, &mut rng);
            assert!(
                matches!(result, Err(OramError::IntegrityError { .. })),
                "target {target}: {result:?}"
            );
        }
    }

    #[test]
    fn replayed_bucket_is_detected() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(10);
        let mut oram = CircuitOram::<SimpleDatabase>::new(example_config(), &mut rng).unwrap();
        oram.write(1, &[1; 8], 0, &mut rng).unwrap();

        let stale = oram.physical_memory.bucket_mut(0).clone();
        oram.write(2, &[2; 8], 0, &mut rng).unwrap();
        *oram.physical_memory.bucket_mut(0) = stale;

        assert_eq!(
            oram.fetch_path(0),
            Err(OramError::IntegrityError { index: 0 })
        );
    }

    #[test]
    fn single_bucket_tree() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(11);
        let config = OramConfig::new(1, 4).with_bucket_size(2).with_stash_size(4);
        let mut oram = MappedCircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();
        assert_eq!(oram.oram.geometry().height, 0);

        oram.write(0, &[3; 4], &mut rng).unwrap();
        assert_eq!(oram.read(0, &mut rng).unwrap(), vec![3; 4]);
        assert_path_invariant(&mut oram.oram);
    }

    #[test]
    fn path_buffer_is_wiped() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(13);
        let config = OramConfig::new(2, 4).with_bucket_size(2).with_stash_size(4);
        let mut oram = CircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();

        oram.write(1, &[0xAA; 4], 0, &mut rng).unwrap();
        assert!(oram
            .fetched_path
            .iter()
            .any(|block| block.payload == vec![0xAA; 4]));

        oram.wipe_fetched_path();
        assert!(oram
            .fetched_path
            .iter()
            .all(|block| block.payload.iter().all(|&byte| byte == 0)));
    }

    #[test]
    fn blocks_sit_on_their_paths() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(12);
        let config = OramConfig::new(16, 4).with_stash_size(16);
        let mut oram = MappedCircuitOram::<SimpleDatabase>::new(config, &mut rng).unwrap();
        for id in 0..16u64 {
            oram.write(id, &[0; 4], &mut rng).unwrap();
        }

        let height = oram.oram.geometry().height;
        let leaf_bucket_start = (1u64 << height) - 1;
        for (index, blocks) in oram.oram.tree_contents().unwrap() {
            let level = i64::from(level_of(index));
            for block in blocks.iter().filter(|b| !b.is_empty()) {
                // The leaf bucket of the path the block sits on shares `level` levels with it.
                let mut below = index;
                while below < leaf_bucket_start {
                    below = 2 * below + 1;
                }
                let leaf_of_bucket = reverse_route(below, height);
                assert!(max_depth(block.leaf, leaf_of_bucket, height) >= level);
            }
        }
    }

    /// Recovers the leaf identifier routing to the leaf bucket `index`.
    fn reverse_route(mut index: TreeIndex, height: u32) -> LeafId {
        let mut leaf = 0;
        for level in (0..height).rev() {
            let parent_index = (index - 1) >> 1;
            if index == 2 * parent_index + 2 {
                leaf |= 1 << level;
            }
            index = parent_index;
        }
        leaf
    }

    create_correctness_tests_for_oram_type!(MappedCircuitOram);
    create_correctness_tests_for_oram_type!(CountedMappedCircuitOram);
}
