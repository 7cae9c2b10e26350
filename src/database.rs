// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Untrusted memory holding the encrypted bucket tree.

use crate::{bucket::EncryptedBucket, OramError, Tag, TreeIndex};

/// A simple Memory trait to model the untrusted memory controller a TEE is interacting with.
///
/// Implementations may place the buckets anywhere, including outside the trusted boundary;
/// everything written through this trait is sealed.
pub trait Database
where
    Self: Sized + Send,
{
    /// Returns a new `Database` holding `number_of_buckets` never-written buckets.
    fn new(number_of_buckets: TreeIndex) -> Result<Self, OramError>;
    /// Returns the number of buckets stored by `self`.
    fn capacity(&self) -> Result<TreeIndex, OramError>;
    /// Reads the bucket stored at `index`.
    fn read_db(&mut self, index: TreeIndex) -> Result<EncryptedBucket, OramError>;
    /// Reads only the tag of the bucket stored at `index`.
    fn read_tag(&mut self, index: TreeIndex) -> Result<Tag, OramError>;
    /// Writes the bucket stored at `index`, returning the bucket it replaces.
    fn write_db(
        &mut self,
        index: TreeIndex,
        bucket: EncryptedBucket,
    ) -> Result<EncryptedBucket, OramError>;
}

/// A simple Database that stores its buckets as a Vec.
#[derive(Debug)]
pub struct SimpleDatabase(pub(crate) Vec<EncryptedBucket>);

impl Database for SimpleDatabase {
    fn new(number_of_buckets: TreeIndex) -> Result<Self, OramError> {
        Ok(Self(vec![
            EncryptedBucket::default();
            number_of_buckets.try_into()?
        ]))
    }

    fn capacity(&self) -> Result<TreeIndex, OramError> {
        Ok(self.0.len().try_into()?)
    }

    fn read_db(&mut self, index: TreeIndex) -> Result<EncryptedBucket, OramError> {
        let index: usize = index.try_into()?;
        Ok(self.0[index].clone())
    }

    fn read_tag(&mut self, index: TreeIndex) -> Result<Tag, OramError> {
        let index: usize = index.try_into()?;
        Ok(self.0[index].tag)
    }

    fn write_db(
        &mut self,
        index: TreeIndex,
        bucket: EncryptedBucket,
    ) -> Result<EncryptedBucket, OramError> {
        let index: usize = index.try_into()?;
        Ok(std::mem::replace(&mut self.0[index], bucket))
    }
}

/// A Database that counts reads and writes.
#[derive(Debug)]
pub struct CountAccessesDatabase {
    pub(crate) data: SimpleDatabase,
    /// `reads[i]` tracks the total number of bucket reads made to index `i`.
    pub reads: Vec<u64>,
    /// `tag_reads[i]` tracks the total number of tag-only reads made to index `i`.
    pub tag_reads: Vec<u64>,
    /// `writes[i]` tracks the total number of writes made to index `i`.
    pub writes: Vec<u64>,
}

impl CountAccessesDatabase {
    /// Returns the total number of bucket reads to the database.
    pub fn get_read_count(&self) -> u64 {
        self.reads.iter().sum()
    }

    /// Returns the total number of writes to the database.
    pub fn get_write_count(&self) -> u64 {
        self.writes.iter().sum()
    }

    /// Forgets every access counted so far.
    pub fn reset_counts(&mut self) {
        for count in self
            .reads
            .iter_mut()
            .chain(self.tag_reads.iter_mut())
            .chain(self.writes.iter_mut())
        {
            *count = 0;
        }
    }
}

impl Database for CountAccessesDatabase {
    fn new(number_of_buckets: TreeIndex) -> Result<Self, OramError> {
        let len: usize = number_of_buckets.try_into()?;
        Ok(Self {
            data: Database::new(number_of_buckets)?,
            reads: vec![0u64; len],
            tag_reads: vec![0u64; len],
            writes: vec![0u64; len],
        })
    }

    fn capacity(&self) -> Result<TreeIndex, OramError> {
        self.data.capacity()
    }

    fn read_db(&mut self, index: TreeIndex) -> Result<EncryptedBucket, OramError> {
        log::debug!("Physical read -- {}", index);

        self.reads[usize::try_from(index)?] += 1;
        self.data.read_db(index)
    }

    fn read_tag(&mut self, index: TreeIndex) -> Result<Tag, OramError> {
        self.tag_reads[usize::try_from(index)?] += 1;
        self.data.read_tag(index)
    }

    fn write_db(
        &mut self,
        index: TreeIndex,
        bucket: EncryptedBucket,
    ) -> Result<EncryptedBucket, OramError> {
        log::debug!("Physical write -- {}", index);

        self.writes[usize::try_from(index)?] += 1;
        self.data.write_db(index, bucket)
    }
}
