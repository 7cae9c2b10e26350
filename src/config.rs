// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Store parameters and the tree shape derived from them.

use crate::{
    block::Block, bucket::ASSOCIATED_DATA_SIZE, utils, BlockId, BlockSize, BucketSize, LeafId,
    OramError, StashSize, TreeHeight, TreeIndex, IV_SIZE, TAG_SIZE,
};

/// The parameter "Z" that sets the number of blocks per bucket; typical values are 2 to 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// The default number of blocks the stash can hold.
pub const DEFAULT_STASH_SIZE: StashSize = 64;

/// The default number of worker threads of a [`crate::TaoStore`].
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// The default bound, in bytes, on the plaintext subtree cached by a [`crate::TaoStore`].
pub const DEFAULT_MEMORY_BOUND: usize = 1 << 26;

/// The memory budget, in bytes, used to size the write-back batch when none is given.
pub const DEFAULT_ENCLAVE_BUDGET: usize = 1 << 25;

/// Parameters of a tree store.
///
/// - `block_capacity` ("N"): the number of logical blocks. Need not be a power of two.
/// - `block_size` ("B"): the payload size of every block in bytes.
/// - `bucket_size` ("Z"): the number of blocks per bucket. Must be at least 2.
/// - `stash_size` ("S"): the number of blocks the stash can hold. Along with `bucket_size`
///     this sets the probability of a stash overflow, which is fatal, and should be set with care.
/// - `worker_count`: the size of the worker pool of a concurrent store.
/// - `write_back_batch` ("K"): the number of completed paths persisted per write-back cycle
///     of a concurrent store. Derived from [`DEFAULT_ENCLAVE_BUDGET`] when `None`.
/// - `memory_bound`: the maximum size, in bytes, of the subtree cached by a concurrent store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OramConfig {
    /// The number of logical blocks.
    pub block_capacity: BlockId,
    /// The payload size of every block in bytes.
    pub block_size: BlockSize,
    /// The number of blocks per bucket.
    pub bucket_size: BucketSize,
    /// The number of blocks the stash can hold.
    pub stash_size: StashSize,
    /// The size of the worker pool of a concurrent store.
    pub worker_count: usize,
    /// The number of paths persisted per write-back cycle.
    pub write_back_batch: Option<usize>,
    /// The bound, in bytes, on the cached subtree of a concurrent store.
    pub memory_bound: usize,
}

impl OramConfig {
    /// Returns a configuration for `block_capacity` blocks of `block_size` bytes,
    /// with default values for every other parameter.
    pub fn new(block_capacity: BlockId, block_size: BlockSize) -> Self {
        Self {
            block_capacity,
            block_size,
            bucket_size: DEFAULT_BLOCKS_PER_BUCKET,
            stash_size: DEFAULT_STASH_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            write_back_batch: None,
            memory_bound: DEFAULT_MEMORY_BOUND,
        }
    }

    /// Sets the number of blocks per bucket.
    pub fn with_bucket_size(mut self, bucket_size: BucketSize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Sets the number of blocks the stash can hold.
    pub fn with_stash_size(mut self, stash_size: StashSize) -> Self {
        self.stash_size = stash_size;
        self
    }

    /// Sets the size of the worker pool.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Sets the number of paths persisted per write-back cycle.
    pub fn with_write_back_batch(mut self, write_back_batch: usize) -> Self {
        self.write_back_batch = Some(write_back_batch);
        self
    }

    /// Sets the bound, in bytes, on the cached subtree.
    pub fn with_memory_bound(mut self, memory_bound: usize) -> Self {
        self.memory_bound = memory_bound;
        self
    }

    /// Checks the parameters, returning the shape of the tree they describe.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` in the following cases.
    ///
    /// - `block_capacity` is 0, or too large to be padded to a power of two.
    /// - `block_size` is 0.
    /// - `bucket_size` is 0 or 1.
    /// - `stash_size` is 0.
    /// - `worker_count` is 0.
    /// - `write_back_batch` is `Some(0)`.
    /// - `memory_bound` cannot hold a single cached bucket.
    pub fn validate(&self) -> Result<TreeGeometry, OramError> {
        if self.block_capacity == 0 {
            return Err(invalid("block_capacity must be positive"));
        }
        if self.block_size == 0 {
            return Err(invalid("block_size must be positive"));
        }
        if self.bucket_size <= 1 {
            return Err(invalid("bucket_size must be at least 2"));
        }
        if self.stash_size == 0 {
            return Err(invalid("stash_size must be positive"));
        }
        if self.worker_count == 0 {
            return Err(invalid("worker_count must be positive"));
        }
        if self.write_back_batch == Some(0) {
            return Err(invalid("write_back_batch must be positive"));
        }
        if self.memory_bound < self.cached_node_bytes() {
            return Err(invalid("memory_bound cannot hold a single bucket"));
        }
        TreeGeometry::for_capacity(self.block_capacity)
    }

    /// The length in bytes of one serialized block.
    pub fn block_bytes(&self) -> usize {
        Block::serialized_len(self.block_size)
    }

    /// The length in bytes of the plaintext of one bucket.
    pub fn bucket_bytes(&self) -> usize {
        self.bucket_size * self.block_bytes()
    }

    /// The approximate number of bytes used by one node of a cached subtree.
    pub fn cached_node_bytes(&self) -> usize {
        self.bucket_bytes() + ASSOCIATED_DATA_SIZE + TAG_SIZE + IV_SIZE
    }

    /// The maximum number of nodes a cached subtree may hold.
    pub fn subtree_node_bound(&self) -> usize {
        self.memory_bound / self.cached_node_bytes()
    }

    /// The number of paths persisted per write-back cycle.
    ///
    /// When none was configured, this is the power of two that keeps a batch of paths
    /// fetched by every worker within [`DEFAULT_ENCLAVE_BUDGET`], or 1 if even a single
    /// batch exceeds it.
    pub fn write_back_batch(&self, geometry: &TreeGeometry) -> usize {
        if let Some(batch) = self.write_back_batch {
            return batch;
        }

        let height = usize::try_from(geometry.height).unwrap_or(usize::MAX).max(1);
        let batch_bytes = self
            .cached_node_bytes()
            .saturating_mul(height)
            .saturating_mul(self.worker_count);
        let batch = DEFAULT_ENCLAVE_BUDGET / batch_bytes.max(1);
        if batch == 0 {
            1
        } else {
            batch.next_power_of_two()
        }
    }
}

fn invalid(reason: &str) -> OramError {
    OramError::InvalidConfigurationError(reason.to_string())
}

/// The shape of the bucket tree.
///
/// The block capacity is padded to a power of two `n_pow` (at least 2). The tree then has
/// `n_pow - 1` buckets arranged in `height + 1` levels, and `2^height` leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeGeometry {
    /// The height `L` of the tree.
    pub height: TreeHeight,
    /// The number of buckets.
    pub bucket_count: TreeIndex,
    /// The number of leaves, `2^height`.
    pub leaf_count: LeafId,
}

impl TreeGeometry {
    /// Returns the shape of the tree holding `block_capacity` blocks.
    pub fn for_capacity(block_capacity: BlockId) -> Result<Self, OramError> {
        let padded = block_capacity
            .checked_next_power_of_two()
            .ok_or_else(|| invalid("block_capacity is too large"))?
            .max(2);
        let height = padded.ilog2() - 1;

        Ok(Self {
            height,
            bucket_count: padded - 1,
            leaf_count: 1 << height,
        })
    }

    /// The number of buckets on a root-to-leaf path.
    pub fn path_length(&self) -> usize {
        // `height` is below 64, so this never truncates.
        self.height as usize + 1
    }

    /// Returns the heap index of the bucket at `level` on the path to `leaf`.
    pub fn node_on_path(&self, leaf: LeafId, level: TreeHeight) -> TreeIndex {
        let mut index = 0;
        for i in 0..level {
            index = utils::child_toward(index, leaf, i);
        }
        index
    }

    /// Returns the heap index of the leaf bucket of the path to `leaf`.
    pub fn leaf_bucket(&self, leaf: LeafId) -> TreeIndex {
        self.node_on_path(leaf, self.height)
    }

    /// Reduces `leaf` to the range `0..leaf_count`.
    pub fn normalize_leaf(&self, leaf: LeafId) -> LeafId {
        leaf & (self.leaf_count - 1)
    }
}
