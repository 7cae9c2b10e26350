// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The block structure stored in buckets and in the stash.

use crate::{BlockId, BlockSize, LeafId};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};
use zeroize::Zeroize;

const HEADER_SIZE: usize = 16;

/// A logical block: an identifier, the leaf it is currently routed toward, and its payload.
///
/// Every slot of a bucket and of the stash holds a `Block`; unoccupied slots hold the
/// empty block, whose identifier is [`Block::EMPTY_ID`].
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct Block {
    /// The logical identifier, or `EMPTY_ID`.
    pub id: BlockId,
    /// The leaf this block is routed toward. Only used to compute eviction depths.
    pub leaf: LeafId,
    /// The payload.
    pub payload: Vec<u8>,
}

impl Block {
    /// The identifier of an unoccupied slot.
    pub const EMPTY_ID: BlockId = BlockId::MAX;

    /// Returns an empty block with a zeroed payload of `block_size` bytes.
    pub fn empty(block_size: BlockSize) -> Self {
        Self {
            id: Self::EMPTY_ID,
            leaf: 0,
            payload: vec![0u8; block_size],
        }
    }

    /// Returns a block holding `payload`, routed toward `leaf`.
    pub fn new(id: BlockId, leaf: LeafId, payload: Vec<u8>) -> Self {
        Self { id, leaf, payload }
    }

    /// Returns whether this slot is unoccupied, in constant time.
    pub fn ct_is_empty(&self) -> Choice {
        self.id.ct_eq(&Self::EMPTY_ID)
    }

    /// Returns whether this slot is unoccupied.
    pub fn is_empty(&self) -> bool {
        self.ct_is_empty().into()
    }

    /// Swaps `self` and `other` if `choice` is set, touching every byte either way.
    ///
    /// Both payloads must have the same length.
    pub fn ct_swap(&mut self, other: &mut Block, choice: Choice) {
        debug_assert_eq!(self.payload.len(), other.payload.len());
        BlockId::conditional_swap(&mut self.id, &mut other.id, choice);
        LeafId::conditional_swap(&mut self.leaf, &mut other.leaf, choice);
        for (a, b) in self.payload.iter_mut().zip(other.payload.iter_mut()) {
            u8::conditional_swap(a, b, choice);
        }
    }

    /// Overwrites `self` with `other` if `choice` is set, touching every byte either way.
    pub fn ct_assign(&mut self, other: &Block, choice: Choice) {
        debug_assert_eq!(self.payload.len(), other.payload.len());
        self.id.conditional_assign(&other.id, choice);
        self.leaf.conditional_assign(&other.leaf, choice);
        for (a, b) in self.payload.iter_mut().zip(other.payload.iter()) {
            a.conditional_assign(b, choice);
        }
    }

    /// The length of a serialized block with a `block_size`-byte payload.
    pub fn serialized_len(block_size: BlockSize) -> usize {
        HEADER_SIZE + block_size
    }

    /// Appends the little-endian serialization of this block to `out`.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.leaf.to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Parses a block serialized by [`Block::write_to`]. `bytes` must hold exactly one block.
    pub(crate) fn read_from(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let mut leaf = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        leaf.copy_from_slice(&bytes[8..HEADER_SIZE]);
        Self {
            id: BlockId::from_le_bytes(id),
            leaf: LeafId::from_le_bytes(leaf),
            payload: bytes[HEADER_SIZE..].to_vec(),
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "Block::Empty")
        } else {
            f.debug_struct("Block")
                .field("id", &self.id)
                .field("leaf", &self.leaf)
                .field("payload", &self.payload)
                .finish()
        }
    }
}
