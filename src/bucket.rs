// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Encrypted buckets and the codec that seals and opens them.
//!
//! A bucket's tag authenticates its ciphertext together with an [`AssociatedData`] record
//! holding the tags of its two children and whether each child has ever been written.
//! Verifying the root against a trusted tag and then each child against the tag its
//! verified parent committed to amounts to checking a Merkle proof for the path.

use crate::{
    block::Block,
    crypto::{random_iv, AuthenticatedCipher, ChaChaCipher},
    database::Database,
    utils::{left_child, right_child},
    BlockSize, BucketSize, Iv, OramError, Tag, TreeIndex, TAG_SIZE,
};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// The serialized length of an [`AssociatedData`] record.
pub const ASSOCIATED_DATA_SIZE: usize = 2 * TAG_SIZE + 2;

/// The data authenticated alongside a bucket's ciphertext.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssociatedData {
    /// The tag of the left child, or zeroes if `reach_left` is false.
    pub left_tag: Tag,
    /// The tag of the right child, or zeroes if `reach_right` is false.
    pub right_tag: Tag,
    /// Whether the left child has ever been written.
    pub reach_left: bool,
    /// Whether the right child has ever been written.
    pub reach_right: bool,
}

impl AssociatedData {
    /// Serializes the record as `left_tag || right_tag || reach_left || reach_right`.
    pub fn to_bytes(&self) -> [u8; ASSOCIATED_DATA_SIZE] {
        let mut bytes = [0u8; ASSOCIATED_DATA_SIZE];
        bytes[..TAG_SIZE].copy_from_slice(&self.left_tag);
        bytes[TAG_SIZE..2 * TAG_SIZE].copy_from_slice(&self.right_tag);
        bytes[2 * TAG_SIZE] = u8::from(self.reach_left);
        bytes[2 * TAG_SIZE + 1] = u8::from(self.reach_right);
        bytes
    }

    /// The tag of the right child if `right`, else of the left child.
    pub fn child_tag(&self, right: bool) -> &Tag {
        if right {
            &self.right_tag
        } else {
            &self.left_tag
        }
    }

    /// Records a new tag for the right child if `right`, else for the left child.
    pub fn set_child_tag(&mut self, right: bool, tag: Tag) {
        if right {
            self.right_tag = tag;
        } else {
            self.left_tag = tag;
        }
    }

    /// Whether the right child (if `right`) or the left child has ever been written.
    pub fn reaches(&self, right: bool) -> bool {
        if right {
            self.reach_right
        } else {
            self.reach_left
        }
    }

    /// Sets the reachability flag of the right child if `right`, else of the left child.
    pub fn set_reaches(&mut self, right: bool, reachable: bool) {
        if right {
            self.reach_right = reachable;
        } else {
            self.reach_left = reachable;
        }
    }
}

/// A bucket as held by untrusted storage.
///
/// The reachability flags are stored in the clear: whether a bucket was ever written is
/// visible from the access pattern anyway. They are still authenticated through the
/// associated data of the bucket that holds them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptedBucket {
    /// The sealed blocks. Empty for a bucket that was never written.
    pub ciphertext: Vec<u8>,
    /// The authentication tag.
    pub tag: Tag,
    /// The IV the bucket was sealed under.
    pub iv: Iv,
    /// Whether the left child has ever been written.
    pub reach_left: bool,
    /// Whether the right child has ever been written.
    pub reach_right: bool,
}

/// Seals and opens buckets of `bucket_size` blocks of `block_size` bytes.
#[derive(Debug)]
pub struct BucketCodec<C = ChaChaCipher> {
    cipher: C,
    block_size: BlockSize,
    bucket_size: BucketSize,
}

impl<C: AuthenticatedCipher> BucketCodec<C> {
    /// Returns a codec sealing buckets with `cipher`.
    pub fn new(cipher: C, block_size: BlockSize, bucket_size: BucketSize) -> Self {
        Self {
            cipher,
            block_size,
            bucket_size,
        }
    }

    /// The payload size of a block.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The number of blocks per bucket.
    pub fn bucket_size(&self) -> BucketSize {
        self.bucket_size
    }

    /// The contents of a bucket that was never written.
    pub fn empty_blocks(&self) -> Vec<Block> {
        vec![Block::empty(self.block_size); self.bucket_size]
    }

    fn plaintext_len(&self) -> usize {
        self.bucket_size * Block::serialized_len(self.block_size)
    }

    /// Opens the bucket stored at `index`, checking it against `expected_tag`, which the
    /// caller takes from the already verified parent (or the trusted root tag).
    ///
    /// # Errors
    ///
    /// Returns an `IntegrityError` if the bucket does not authenticate.
    pub fn decode_bucket(
        &self,
        index: TreeIndex,
        bucket: &EncryptedBucket,
        expected_tag: &Tag,
        associated_data: &AssociatedData,
    ) -> Result<Vec<Block>, OramError> {
        if bucket.ciphertext.len() != self.plaintext_len() {
            return Err(OramError::IntegrityError { index });
        }

        let mut buffer = bucket.ciphertext.clone();
        self.cipher
            .decrypt(
                &bucket.iv,
                &associated_data.to_bytes(),
                &mut buffer,
                expected_tag,
            )
            .map_err(|_| OramError::IntegrityError { index })?;

        let blocks = buffer
            .chunks_exact(Block::serialized_len(self.block_size))
            .map(Block::read_from)
            .collect();
        buffer.zeroize();
        Ok(blocks)
    }

    /// Seals `blocks` under a fresh IV. The returned bucket's tag must be propagated into
    /// the associated data of the parent bucket.
    pub fn encode_bucket<R: RngCore + CryptoRng>(
        &self,
        blocks: &[Block],
        associated_data: &AssociatedData,
        rng: &mut R,
    ) -> Result<EncryptedBucket, OramError> {
        debug_assert_eq!(blocks.len(), self.bucket_size);

        let mut buffer = Vec::with_capacity(self.plaintext_len());
        for block in blocks {
            block.write_to(&mut buffer);
        }

        let iv = random_iv(rng);
        let tag = self
            .cipher
            .encrypt(&iv, &associated_data.to_bytes(), &mut buffer)
            .map_err(|_| {
                OramError::InvalidConfigurationError("bucket too large to encrypt".to_string())
            })?;

        Ok(EncryptedBucket {
            ciphertext: buffer,
            tag,
            iv,
            reach_left: associated_data.reach_left,
            reach_right: associated_data.reach_right,
        })
    }

    /// Reads the bucket at `index` from `physical_memory` and opens it against `expected_tag`.
    ///
    /// The associated data is rebuilt from the bucket's reachability flags and the tags of
    /// the children those flags mark as written; the tag of an unwritten child is zero.
    pub fn load_bucket<D: Database>(
        &self,
        physical_memory: &mut D,
        index: TreeIndex,
        expected_tag: &Tag,
    ) -> Result<(Vec<Block>, AssociatedData), OramError> {
        let bucket = physical_memory.read_db(index)?;
        let capacity = physical_memory.capacity()?;

        let mut associated_data = AssociatedData {
            reach_left: bucket.reach_left,
            reach_right: bucket.reach_right,
            ..AssociatedData::default()
        };
        for right in [false, true] {
            if associated_data.reaches(right) {
                let child = if right {
                    right_child(index)
                } else {
                    left_child(index)
                };
                // A leaf claiming to have children can only come from tampering.
                if child >= capacity {
                    return Err(OramError::IntegrityError { index });
                }
                associated_data.set_child_tag(right, physical_memory.read_tag(child)?);
            }
        }

        let blocks = self.decode_bucket(index, &bucket, expected_tag, &associated_data)?;
        Ok((blocks, associated_data))
    }

    /// Seals `blocks` and writes them to `index` in `physical_memory`, returning the new tag.
    pub fn store_bucket<D: Database, R: RngCore + CryptoRng>(
        &self,
        physical_memory: &mut D,
        index: TreeIndex,
        blocks: &[Block],
        associated_data: &AssociatedData,
        rng: &mut R,
    ) -> Result<Tag, OramError> {
        let bucket = self.encode_bucket(blocks, associated_data, rng)?;
        let tag = bucket.tag;
        physical_memory.write_db(index, bucket)?;
        Ok(tag)
    }
}
