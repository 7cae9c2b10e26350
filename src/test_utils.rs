// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities: logging, workload drivers and test-generation macros.

use crate::bucket::EncryptedBucket;
use crate::circuit_oram::{CircuitOram, MappedCircuitOram};
use crate::config::OramConfig;
use crate::database::{CountAccessesDatabase, Database, SimpleDatabase};
use crate::taostore::TaoStore;
use crate::utils::level_of;
use crate::{BlockSize, Oram, OramError, TreeIndex};
use duplicate::duplicate_item;
use rand::{rngs::StdRng, CryptoRng, Rng, RngCore, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

pub(crate) type CountedMappedCircuitOram = MappedCircuitOram<CountAccessesDatabase>;

pub(crate) trait Testable: Oram + Sized {
    fn new_for_test<R: RngCore + CryptoRng>(
        config: OramConfig,
        rng: &mut R,
    ) -> Result<Self, OramError>;

    /// Called once a workload has finished.
    fn test_hook(&mut self) {}
}

#[duplicate_item(
    database_type;
    [SimpleDatabase];
    [CountAccessesDatabase];
)]
impl Testable for MappedCircuitOram<database_type> {
    fn new_for_test<R: RngCore + CryptoRng>(
        config: OramConfig,
        rng: &mut R,
    ) -> Result<Self, OramError> {
        MappedCircuitOram::new(config, rng)
    }

    fn test_hook(&mut self) {
        assert_path_invariant(&mut self.oram);
        assert!(self.oram.stash_occupancy() <= self.oram.stash.len());
    }
}

impl Testable for TaoStore {
    fn new_for_test<R: RngCore + CryptoRng>(
        config: OramConfig,
        _rng: &mut R,
    ) -> Result<Self, OramError> {
        TaoStore::spawn(config)
    }

    fn test_hook(&mut self) {
        self.flush().unwrap();
        let statistics = self.statistics();
        assert_eq!(statistics.cached_nodes, 1);
        assert_eq!(statistics.evictions, 2 * statistics.fetches);
    }
}

/// Direct access to the buckets of a database, for simulating an attacker.
pub(crate) trait TamperableDatabase {
    fn bucket_mut(&mut self, index: TreeIndex) -> &mut EncryptedBucket;
}

#[duplicate_item(
    database_type   buckets;
    [SimpleDatabase]   [0];
    [CountAccessesDatabase]   [data.0];
)]
impl TamperableDatabase for database_type {
    fn bucket_mut(&mut self, index: TreeIndex) -> &mut EncryptedBucket {
        &mut self.buckets[index as usize]
    }
}

/// Checks that every block in the tree sits in a bucket on the path to its leaf.
pub(crate) fn assert_path_invariant<D: Database>(oram: &mut CircuitOram<D>) {
    let geometry = *oram.geometry();
    for (index, blocks) in oram.tree_contents().unwrap() {
        let level = level_of(index);
        for block in blocks.iter().filter(|block| !block.is_empty()) {
            assert_eq!(
                geometry.node_on_path(block.leaf, level),
                index,
                "block {} routed toward leaf {} sits off its path",
                block.id,
                block.leaf
            );
        }
    }
}

pub(crate) fn random_payload<R: Rng>(block_size: BlockSize, rng: &mut R) -> Vec<u8> {
    (0..block_size).map(|_| rng.gen()).collect()
}

/// Tests the correctness of an `Oram` type T on a workload of random reads and writes.
pub(crate) fn random_workload<T: Testable>(config: OramConfig, num_operations: u32) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let capacity = config.block_capacity;
    let block_size = config.block_size;
    let mut oram = T::new_for_test(config, &mut rng).unwrap();
    let mut mirror_array = vec![vec![0u8; block_size]; capacity as usize];

    for _ in 0..num_operations {
        let random_index = rng.gen_range(0..capacity);
        let slot = random_index as usize;
        let random_block_value = random_payload(block_size, &mut rng);

        let read_versus_write = rng.gen::<bool>();

        if read_versus_write {
            assert_eq!(oram.read(random_index, &mut rng).unwrap(), mirror_array[slot]);
        } else {
            let previous = oram
                .write(random_index, &random_block_value, &mut rng)
                .unwrap();
            assert_eq!(previous, mirror_array[slot]);
            mirror_array[slot] = random_block_value;
        }
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index, &mut rng).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }

    oram.test_hook();
}

/// Tests the correctness of an `Oram` type T on repeated passes of sequential accesses
/// 0, 1, ..., `capacity - 1`.
pub(crate) fn linear_workload<T: Testable>(config: OramConfig, num_operations: u32) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let capacity = config.block_capacity;
    let block_size = config.block_size;
    let mut oram = T::new_for_test(config, &mut rng).unwrap();
    let mut mirror_array = vec![vec![0u8; block_size]; capacity as usize];

    let num_passes = u64::from(num_operations) / capacity;

    for _ in 0..num_passes {
        for index in 0..capacity {
            let slot = index as usize;
            let random_block_value = random_payload(block_size, &mut rng);

            if rng.gen::<bool>() {
                assert_eq!(oram.read(index, &mut rng).unwrap(), mirror_array[slot]);
            } else {
                oram.write(index, &random_block_value, &mut rng).unwrap();
                mirror_array[slot] = random_block_value;
            }
        }
    }

    for index in 0..capacity {
        assert_eq!(
            oram.read(index, &mut rng).unwrap(),
            mirror_array[index as usize],
            "{index}"
        )
    }

    oram.test_hook();
}

macro_rules! create_correctness_test {
    ($function_name:ident, $oram_type: ident, $block_size: expr, $block_capacity:expr, $bucket_size: expr, $iterations_to_test: expr) => {
        paste::paste! {
            #[test]
            fn [<$function_name _ $oram_type:snake _ $block_capacity _ $block_size _ $bucket_size _ $iterations_to_test>]() {
                let config = crate::config::OramConfig::new($block_capacity, $block_size)
                    .with_bucket_size($bucket_size);
                $function_name::<$oram_type>(config, $iterations_to_test);
            }
        }
    };
}

macro_rules! create_correctness_tests_for_workload_and_oram_type {
    ($function_name: ident, $oram_type: ident) => {
        create_correctness_test!($function_name, $oram_type, 2, 2, 2, 10);
        create_correctness_test!($function_name, $oram_type, 4, 8, 4, 100);
        create_correctness_test!($function_name, $oram_type, 8, 8, 3, 100);
        create_correctness_test!($function_name, $oram_type, 4, 16, 2, 100);
        create_correctness_test!($function_name, $oram_type, 4, 32, 4, 100);
        // Block size 16 bytes, block capacity 64 blocks, 4 blocks per bucket, 100 operations
        create_correctness_test!($function_name, $oram_type, 16, 64, 4, 100);
        create_correctness_test!($function_name, $oram_type, 8, 17, 4, 200);
        create_correctness_test!($function_name, $oram_type, 2, 8, 4, 1000);
    };
}

macro_rules! create_correctness_tests_for_oram_type {
    ($oram_type: ident) => {
        create_correctness_tests_for_workload_and_oram_type!(linear_workload, $oram_type);
        create_correctness_tests_for_workload_and_oram_type!(random_workload, $oram_type);
    };
}

pub(crate) use create_correctness_test;
pub(crate) use create_correctness_tests_for_oram_type;
pub(crate) use create_correctness_tests_for_workload_and_oram_type;
