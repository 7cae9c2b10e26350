// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Circuit ORAM with authenticated buckets and a concurrent
//! subtree cache.
//!
//! The crate offers two stores over the same encrypted bucket tree:
//!
//! - [`CircuitOram`], a sequential tree store whose callers supply leaf identifiers
//!   themselves (typically from a recursive position map), together with
//!   [`MappedCircuitOram`], which pairs it with an in-memory [`position_map::PositionMap`].
//! - [`TaoStore`], a concurrent store that keeps a plaintext working subtree in memory,
//!   serves requests from a worker pool, coalesces duplicate requests and persists the
//!   subtree in the background.
//!
//! Every bucket is encrypted with an AEAD whose associated data commits to the tags of
//! the bucket's children, so that the tag of the root bucket acts as the root of a
//! Merkle tree over the whole store.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use thiserror::Error;

pub mod block;
pub mod bucket;
pub mod circuit_oram;
pub mod config;
pub mod crypto;
pub mod database;
mod dispatcher;
pub(crate) mod eviction;
pub mod position_map;
pub mod stash;
mod subtree;
pub mod taostore;
pub(crate) mod utils;
mod write_back;

#[cfg(test)]
mod test_utils;

pub use crate::block::Block;
pub use crate::circuit_oram::{CircuitOram, MappedCircuitOram};
pub use crate::config::{OramConfig, TreeGeometry};
pub use crate::taostore::{TaoStore, TaoStoreStatistics};

/// The identifier of a logical block. Valid identifiers lie in `0..block_capacity`.
pub type BlockId = u64;
/// The identifier of a root-to-leaf path. Only the low `height` bits are used for routing.
pub type LeafId = u64;
/// The binary-heap index of a bucket in the tree (root = 0).
pub type TreeIndex = u64;
/// The height `L` of the tree; a path holds `L + 1` buckets.
pub type TreeHeight = u32;
/// The number of bytes of payload held by a block.
pub type BlockSize = usize;
/// The number of blocks held by a bucket ("Z" in the ORAM literature).
pub type BucketSize = usize;
/// The number of blocks held by the stash.
pub type StashSize = usize;

/// The length in bytes of a bucket authentication tag.
pub const TAG_SIZE: usize = 16;
/// The length in bytes of a bucket IV.
pub const IV_SIZE: usize = 12;

/// An AEAD authentication tag.
pub type Tag = [u8; TAG_SIZE];
/// An AEAD initialization vector.
pub type Iv = [u8; IV_SIZE];

/// The errors that may be returned by the stores in this crate.
///
/// `IntegrityError`, `StashOverflowError` and `SubtreeMemoryExceeded` are fatal: once a store
/// has returned one of them, every subsequent call on that store returns the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OramError {
    /// Returned when a conversion between integer types fails.
    #[error("Integer conversion error.")]
    IntegerConversionError(#[from] std::num::TryFromIntError),
    /// Returned when a store is created with invalid parameters.
    #[error("Invalid configuration: {0}.")]
    InvalidConfigurationError(String),
    /// Returned when a block identifier outside `0..block_capacity` is accessed.
    #[error("Block {block_id} is out of bounds for a store of capacity {capacity}.")]
    AddressOutOfBoundsError {
        /// The offending block identifier.
        block_id: BlockId,
        /// The capacity of the store.
        capacity: BlockId,
    },
    /// Returned when a caller supplies a payload of the wrong length.
    #[error("Expected a payload of {expected} bytes, got {actual}.")]
    InvalidBlockSizeError {
        /// The configured block size.
        expected: BlockSize,
        /// The length of the supplied payload.
        actual: BlockSize,
    },
    /// The write half of a split access did not follow a read half on the same path.
    #[error("access_w must follow access_r on the same path.")]
    UnmatchedSplitAccessError,
    /// A bucket failed authentication. The untrusted storage has been tampered with.
    #[error("Integrity check failed for bucket {index}.")]
    IntegrityError {
        /// The heap index of the bucket that failed to authenticate.
        index: TreeIndex,
    },
    /// No free stash slot was available for a block.
    #[error("The stash overflowed.")]
    StashOverflowError,
    /// The cached subtree of a concurrent store outgrew its memory bound.
    #[error("The cached subtree holds {nodes} nodes, exceeding its bound of {bound}.")]
    SubtreeMemoryExceeded {
        /// The number of nodes the subtree would have held.
        nodes: usize,
        /// The maximum number of nodes allowed.
        bound: usize,
    },
    /// The worker pool of a concurrent store could not be built.
    #[error("Failed to build the worker pool: {0}.")]
    ThreadPoolError(String),
    /// A request reached a concurrent store that is shutting down.
    #[error("The store is shutting down.")]
    StoreShutDown,
}

impl OramError {
    /// Returns true if the error leaves the store unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OramError::IntegrityError { .. }
                | OramError::StashOverflowError
                | OramError::SubtreeMemoryExceeded { .. }
        )
    }
}

/// A store mapping block identifiers `0 <= block_id < block_capacity` to
/// fixed-size byte payloads, hiding which identifier is accessed.
///
/// Blocks that were never written read as all zeroes.
pub trait Oram {
    /// The number of blocks the store can hold.
    fn block_capacity(&self) -> BlockId;

    /// The payload size of every block, in bytes.
    fn block_size(&self) -> BlockSize;

    /// Reads the block `block_id` and, if `data_in` is given, replaces its payload.
    /// Returns the payload held before the call.
    fn access<R: rand::Rng + rand::CryptoRng>(
        &mut self,
        block_id: BlockId,
        data_in: Option<&[u8]>,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError>;

    /// Obliviously reads the block `block_id`.
    fn read<R: rand::Rng + rand::CryptoRng>(
        &mut self,
        block_id: BlockId,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        self.access(block_id, None, rng)
    }

    /// Obliviously writes `value` to the block `block_id`, returning the previous payload.
    fn write<R: rand::Rng + rand::CryptoRng>(
        &mut self,
        block_id: BlockId,
        value: &[u8],
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        self.access(block_id, Some(value), rng)
    }
}
