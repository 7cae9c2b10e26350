// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A concurrent Circuit ORAM store.
//!
//! [`TaoStore`] serves requests from a pool of worker threads over a plaintext subtree
//! cached in trusted memory. Every request fetches one path and then evicts along two, just
//! like [`crate::CircuitOram`], but paths are read and modified in the cache; a background
//! thread seals modified nodes back into storage and prunes the cache.
//!
//! Locks are always taken in the order: pending-request queue, stash chunks (ascending),
//! cached nodes (root to leaf), then the in-flight path multiset or storage. The write-back
//! thread only try-locks nodes out of that order.
//!
//! A worker is admitted only while the cache has room for every node that it and the
//! workers already admitted could materialize. Otherwise it waits, holding no lock, for
//! write-back to prune.

use crate::{
    block::Block,
    bucket::{AssociatedData, BucketCodec},
    config::{OramConfig, TreeGeometry},
    crypto::ChaChaCipher,
    database::{Database, SimpleDatabase},
    dispatcher::{Dispatcher, Request},
    eviction::EvictionPlan,
    position_map::{InsecurePositionMap, PositionMap},
    stash::{find_and_extract, insert_first_empty, ChunkedStash},
    subtree::{NodeStatus, Subtree},
    utils::goes_right,
    write_back::WriteBack,
    BlockId, BlockSize, LeafId, Oram, OramError, Tag,
};
use parking_lot::{Condvar, Mutex};
use rand::{CryptoRng, Rng, RngCore};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use subtle::{Choice, ConditionallySelectable};

/// Counters describing the work done by a [`TaoStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaoStoreStatistics {
    /// Paths fetched to serve requests, real or synthetic.
    pub fetches: u64,
    /// Paths evicted.
    pub evictions: u64,
    /// Write-back cycles run.
    pub write_back_cycles: u64,
    /// Cached nodes pruned by write-back.
    pub pruned_nodes: u64,
    /// Nodes currently cached, the root included.
    pub cached_nodes: usize,
}

struct Shared<D, P> {
    config: OramConfig,
    geometry: TreeGeometry,
    codec: BucketCodec,
    storage: Mutex<D>,
    merkle_root: Mutex<Tag>,
    position_map: P,
    stash: ChunkedStash,
    subtree: Subtree,
    dispatcher: Dispatcher,
    write_back: WriteBack,
    eviction_counter: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
    jobs: Mutex<usize>,
    idle: Condvar,
    admitted: Mutex<usize>,
    room: Condvar,
    poison: Mutex<Option<OramError>>,
}

impl<D: Database, P: PositionMap> Shared<D, P> {
    fn check_poison(&self) -> Result<(), OramError> {
        match &*self.poison.lock() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Makes the store unusable and fails every pending request.
    fn fail(&self, error: OramError) {
        let error = {
            let mut poison = self.poison.lock();
            match &*poison {
                Some(first) => first.clone(),
                None => {
                    log::error!("TaoStore is unusable after an error: {}", error);
                    *poison = Some(error.clone());
                    error
                }
            }
        };
        self.dispatcher.fail_all(&error);
        self.room_changed();
    }

    /// The most nodes one request can materialize: one path fetched, two evicted.
    fn node_reserve(&self) -> usize {
        3 * self.geometry.height as usize
    }

    /// Blocks until the cache has room for one more operation.
    ///
    /// A lone operation is always admitted once write-back has nothing left to prune, so a
    /// bound too small for a single request still surfaces as `SubtreeMemoryExceeded`.
    fn admit(&self) -> Result<(), OramError> {
        let reserve = self.node_reserve();
        let bound = self.subtree.node_bound();
        let mut admitted = self.admitted.lock();
        loop {
            self.check_poison()?;
            let needed = self.subtree.cached_nodes() + reserve * (*admitted + 1);
            if needed <= bound || (*admitted == 0 && self.write_back.is_settled()) {
                *admitted += 1;
                return Ok(());
            }
            self.write_back.request_cycle();
            self.room.wait(&mut admitted);
        }
    }

    fn release(&self) {
        *self.admitted.lock() -= 1;
        self.room.notify_all();
    }

    /// Wakes operations waiting for room in the cache.
    fn room_changed(&self) {
        let _admitted = self.admitted.lock();
        self.room.notify_all();
    }

    fn start_job(&self) {
        *self.jobs.lock() += 1;
    }

    fn finish_job(&self) {
        let mut jobs = self.jobs.lock();
        *jobs -= 1;
        if *jobs == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut jobs = self.jobs.lock();
        while *jobs > 0 {
            self.idle.wait(&mut jobs);
        }
    }

    fn run_job(&self, request: Request) {
        let result = self.admit().and_then(|()| {
            let result = self.serve(&request);
            self.release();
            result
        });
        if let Err(error) = result {
            self.fail(error);
        }
        self.finish_job();
    }

    /// Places a block that is not stored yet, routed toward `leaf`, then evicts.
    fn load(&self, block_id: BlockId, data_in: &[u8], leaf: LeafId) -> Result<(), OramError> {
        self.admit()?;
        let result = self.insert_and_evict(block_id, data_in, leaf);
        self.release();
        if let Err(error) = &result {
            self.fail(error.clone());
        }
        result
    }

    fn insert_and_evict(&self, block_id: BlockId, data_in: &[u8], leaf: LeafId) -> Result<(), OramError> {
        let leaf = self.geometry.normalize_leaf(leaf);
        self.position_map.assign(block_id, leaf)?;

        let mut block = Block::new(block_id, leaf, data_in.to_vec());
        let mut pending = Choice::from(1);
        let chunks = self.stash.chunks();
        let mut chunk = chunks[0].lock();
        insert_first_empty(&mut chunk, &mut block, &mut pending);
        for next in &chunks[1..] {
            chunk = next.lock();
            insert_first_empty(&mut chunk, &mut block, &mut pending);
        }
        drop(chunk);
        if bool::from(pending) {
            return Err(OramError::StashOverflowError);
        }
        self.evict_scheduled()
    }

    /// Serves one request: fetch, answer, then evict along the next two scheduled paths.
    fn serve(&self, request: &Request) -> Result<(), OramError> {
        self.check_poison()?;
        let mut rng = rand::thread_rng();

        let synthetic = Choice::from(u8::from(request.synthetic));
        let decoy = rng.gen_range(0..self.config.block_capacity);
        let search_id = BlockId::conditional_select(&request.block_id, &decoy, synthetic);
        let (leaf, new_leaf) =
            self.position_map
                .lookup_and_reassign(search_id, request.synthetic, &mut rng)?;

        let mut block = self.fetch(leaf, search_id, !synthetic)?;

        let queue = self.dispatcher.answer(request, &mut block, new_leaf);
        let chunks = self.stash.chunks();
        let mut chunk = chunks[0].lock();
        drop(queue);
        self.dispatcher.notify();

        let mut pending = !synthetic;
        insert_first_empty(&mut chunk, &mut block, &mut pending);
        for next in &chunks[1..] {
            chunk = next.lock();
            insert_first_empty(&mut chunk, &mut block, &mut pending);
        }
        drop(chunk);
        if bool::from(pending) {
            return Err(OramError::StashOverflowError);
        }
        self.evict_scheduled()
    }

    /// Evicts along the next two paths of the schedule.
    fn evict_scheduled(&self) -> Result<(), OramError> {
        let first = self
            .eviction_counter
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_mul(2);
        self.evict(first)?;
        self.evict(first.wrapping_add(1))
    }

    /// Scans the stash and then the path to `leaf` for `block_id`, extracting it if `enabled`.
    fn fetch(&self, leaf: LeafId, block_id: BlockId, enabled: Choice) -> Result<Block, OramError> {
        let registration = self.subtree.register(leaf);
        let mut hold = Block::empty(self.config.block_size);

        let chunks = self.stash.chunks();
        let mut chunk = chunks[0].lock();
        find_and_extract(&mut chunk, block_id, &mut hold, enabled);
        for next in &chunks[1..] {
            chunk = next.lock();
            find_and_extract(&mut chunk, block_id, &mut hold, enabled);
        }

        let mut node = self.subtree.lock_root();
        drop(chunk);
        loop {
            find_and_extract(&mut node.blocks, block_id, &mut hold, enabled);
            node.status = NodeStatus::Dirty;
            if node.level == self.geometry.height {
                break;
            }
            node = self
                .subtree
                .descend(node, leaf, &self.codec, &self.storage)?;
        }
        drop(node);
        drop(registration);

        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.write_back.complete_path(leaf);
        Ok(hold)
    }

    fn evict(&self, path: LeafId) -> Result<(), OramError> {
        let registration = self.subtree.register(path);
        let height = self.geometry.height;
        let mut plan = EvictionPlan::new(path, height);

        let mut stash: Vec<_> = self.stash.chunks().iter().map(|chunk| chunk.lock()).collect();
        for chunk in &stash {
            plan.scan_stash(chunk);
        }

        let mut nodes = Vec::with_capacity(self.geometry.path_length());
        nodes.push(self.subtree.lock_root());
        for level in 0..height {
            let parent = &mut nodes[level as usize];
            let child = self.subtree.lock_child(
                parent,
                goes_right(path, level),
                &self.codec,
                &self.storage,
            )?;
            nodes.push(child);
        }
        for (level, node) in (0..).zip(&nodes) {
            plan.scan_level(level, &node.blocks);
        }
        plan.target();

        let mut cursor = plan.cursor(self.config.block_size);
        for chunk in stash.iter_mut() {
            cursor.evict_stash(chunk);
        }
        drop(stash);
        for (level, mut node) in (0..).zip(nodes) {
            cursor.evict_level(level, &mut node.blocks);
            node.status = NodeStatus::Dirty;
        }
        cursor.finish();
        drop(registration);

        self.evictions.fetch_add(1, Ordering::SeqCst);
        self.write_back.complete_path(path);
        Ok(())
    }

    fn write_back_cycle<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<(), OramError> {
        self.write_back.run_cycle(
            &self.subtree,
            &self.codec,
            &self.storage,
            &self.merkle_root,
            rng,
        )
    }

    fn run_write_back(&self) {
        let mut rng = rand::thread_rng();
        while self.write_back.wait_for_work() {
            loop {
                if self.check_poison().is_err() {
                    break;
                }
                if let Err(error) = self.write_back_cycle(&mut rng) {
                    self.fail(error);
                    break;
                }
                self.room_changed();
                if !self.write_back.has_backlog() {
                    break;
                }
            }
        }
        log::debug!("Write-back thread stopped");
    }
}

/// A concurrent store mapping block identifiers to fixed-size payloads, hiding which
/// identifiers are accessed.
///
/// Requests are served by a pool of `worker_count` threads. Concurrent requests for the
/// same block are coalesced: one of them fetches the block while the others fetch decoy
/// paths, so the access pattern does not reveal that the identifiers collided. Answers
/// are released to callers in the order the requests arrived.
///
/// Any error met while serving a request is fatal: the request and every pending request
/// fail with it, and so does every later call.
pub struct TaoStore<D: Database = SimpleDatabase, P: PositionMap = InsecurePositionMap> {
    shared: Arc<Shared<D, P>>,
    pool: rayon::ThreadPool,
    dispatcher_thread: Option<JoinHandle<()>>,
    write_back_thread: Option<JoinHandle<()>>,
}

impl<D: Database + 'static, P: PositionMap + 'static> TaoStore<D, P> {
    /// Starts a store for the parameters in `config`, with every block reading as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if `config` does not validate, or a
    /// `ThreadPoolError` if the worker threads cannot be started.
    pub fn spawn(config: OramConfig) -> Result<Self, OramError> {
        log::info!(
            "TaoStore::spawn(capacity = {}, block_size = {}, bucket_size = {}, stash_size = {}, workers = {})",
            config.block_capacity,
            config.block_size,
            config.bucket_size,
            config.stash_size,
            config.worker_count,
        );

        let geometry = config.validate()?;
        let mut rng = rand::thread_rng();
        let mut storage = D::new(geometry.bucket_count)?;
        let codec = BucketCodec::new(ChaChaCipher::new(&mut rng), config.block_size, config.bucket_size);
        let merkle_root = codec.store_bucket(
            &mut storage,
            0,
            &codec.empty_blocks(),
            &AssociatedData::default(),
            &mut rng,
        )?;

        let write_back_batch = config.write_back_batch(&geometry);
        log::debug!("Writing back every {} paths", write_back_batch);

        let shared = Arc::new(Shared {
            geometry,
            subtree: Subtree::new(codec.empty_blocks(), geometry, config.subtree_node_bound()),
            stash: ChunkedStash::new(config.stash_size, config.bucket_size, config.block_size),
            position_map: P::new(config.block_capacity, geometry.height)?,
            codec,
            storage: Mutex::new(storage),
            merkle_root: Mutex::new(merkle_root),
            dispatcher: Dispatcher::new(),
            write_back: WriteBack::new(write_back_batch),
            eviction_counter: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            jobs: Mutex::new(0),
            idle: Condvar::new(),
            admitted: Mutex::new(0),
            room: Condvar::new(),
            poison: Mutex::new(None),
            config,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(shared.config.worker_count)
            .thread_name(|i| format!("taostore-worker-{i}"))
            .build()
            .map_err(|error| OramError::ThreadPoolError(error.to_string()))?;

        let dispatcher_thread = {
            let dispatcher_shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("taostore-dispatcher".to_string())
                .spawn(move || dispatcher_shared.dispatcher.run())
                .map_err(|error| OramError::ThreadPoolError(error.to_string()))?
        };
        let write_back_shared = Arc::clone(&shared);
        let write_back_thread = match thread::Builder::new()
            .name("taostore-write-back".to_string())
            .spawn(move || write_back_shared.run_write_back())
        {
            Ok(handle) => handle,
            Err(error) => {
                stop_dispatcher(&shared, dispatcher_thread);
                return Err(OramError::ThreadPoolError(error.to_string()));
            }
        };

        Ok(Self {
            shared,
            pool,
            dispatcher_thread: Some(dispatcher_thread),
            write_back_thread: Some(write_back_thread),
        })
    }

    /// Reads block `block_id` and, if `data_in` is given, replaces its payload, blocking
    /// until the request has been served. Returns the payload held before the request.
    ///
    /// # Errors
    ///
    /// Returns an `AddressOutOfBoundsError` or `InvalidBlockSizeError` for malformed
    /// requests, and the error that made the store unusable if it is.
    pub fn access(&self, block_id: BlockId, data_in: Option<&[u8]>) -> Result<Vec<u8>, OramError> {
        self.check_request(block_id, data_in)?;

        let (request, ticket) = self
            .shared
            .dispatcher
            .submit(block_id, data_in.map(<[u8]>::to_vec))?;
        self.shared.start_job();
        let shared = Arc::clone(&self.shared);
        self.pool.spawn(move || shared.run_job(request));
        ticket.wait()
    }

    /// Reads block `block_id`.
    pub fn read(&self, block_id: BlockId) -> Result<Vec<u8>, OramError> {
        self.access(block_id, None)
    }

    /// Inserts block `block_id` routed toward `next_leaf` without looking for an existing
    /// copy, then evicts along the next two scheduled paths. Meant for loading blocks that
    /// are not in the store yet; blocks already stored are updated with [`Self::access`].
    ///
    /// # Errors
    ///
    /// Fails like [`Self::access`]. A stash overflow is fatal.
    pub fn write(&self, block_id: BlockId, data_in: &[u8], next_leaf: LeafId) -> Result<(), OramError> {
        self.check_request(block_id, Some(data_in))?;
        self.shared.start_job();
        let result = self.shared.load(block_id, data_in, next_leaf);
        self.shared.finish_job();
        result
    }

    fn check_request(&self, block_id: BlockId, data_in: Option<&[u8]>) -> Result<(), OramError> {
        self.shared.check_poison()?;
        let config = &self.shared.config;
        if block_id >= config.block_capacity {
            return Err(OramError::AddressOutOfBoundsError {
                block_id,
                capacity: config.block_capacity,
            });
        }
        if let Some(data) = data_in {
            if data.len() != config.block_size {
                return Err(OramError::InvalidBlockSizeError {
                    expected: config.block_size,
                    actual: data.len(),
                });
            }
        }
        Ok(())
    }
}

fn stop_dispatcher<D: Database, P: PositionMap>(shared: &Shared<D, P>, dispatcher: JoinHandle<()>) {
    shared.dispatcher.shut_down();
    if dispatcher.join().is_err() {
        log::error!("The dispatcher thread panicked");
    }
}

impl<D: Database, P: PositionMap> TaoStore<D, P> {
    /// The number of blocks the store can hold.
    pub fn block_capacity(&self) -> BlockId {
        self.shared.config.block_capacity
    }

    /// The payload size of a block.
    pub fn block_size(&self) -> BlockSize {
        self.shared.config.block_size
    }

    /// The tag of the root bucket as last written to storage.
    pub fn merkle_root(&self) -> Tag {
        *self.shared.merkle_root.lock()
    }

    /// Waits for every accepted request to be fully served, then writes the cached subtree
    /// back to storage. Once this returns, only the root is cached.
    ///
    /// # Errors
    ///
    /// Returns the error that made the store unusable, if any.
    pub fn flush(&self) -> Result<(), OramError> {
        let shared = &self.shared;
        shared.wait_idle();
        shared.check_poison()?;

        let mut rng = rand::thread_rng();
        loop {
            if let Err(error) = shared.write_back_cycle(&mut rng) {
                shared.fail(error.clone());
                return Err(error);
            }
            if shared.write_back.is_drained() {
                return Ok(());
            }
        }
    }

    /// Returns counters describing the work done so far.
    pub fn statistics(&self) -> TaoStoreStatistics {
        let shared = &self.shared;
        TaoStoreStatistics {
            fetches: shared.fetches.load(Ordering::SeqCst),
            evictions: shared.evictions.load(Ordering::SeqCst),
            write_back_cycles: shared.write_back.cycles(),
            pruned_nodes: shared.write_back.pruned(),
            cached_nodes: shared.subtree.cached_nodes(),
        }
    }

    /// The number of occupied stash slots. Not oblivious; for monitoring only.
    pub fn stash_occupancy(&self) -> usize {
        self.shared.stash.occupancy()
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> parking_lot::MutexGuard<'_, D> {
        self.shared.storage.lock()
    }
}

impl<D: Database, P: PositionMap> std::fmt::Debug for TaoStore<D, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaoStore")
            .field("config", &self.shared.config)
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

impl<D: Database, P: PositionMap> Drop for TaoStore<D, P> {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::warn!("TaoStore shut down without writing back its cache: {}", error);
        }

        self.shared.write_back.shut_down();
        if let Some(handle) = self.write_back_thread.take() {
            if handle.join().is_err() {
                log::error!("The write-back thread panicked");
            }
        }
        if let Some(handle) = self.dispatcher_thread.take() {
            stop_dispatcher(&self.shared, handle);
        }
        log::info!("TaoStore shut down");
    }
}

impl<D: Database + 'static, P: PositionMap + 'static> Oram for TaoStore<D, P> {
    fn block_capacity(&self) -> BlockId {
        self.shared.config.block_capacity
    }

    fn block_size(&self) -> BlockSize {
        self.shared.config.block_size
    }

    /// Serves the request on the worker pool. `_rng` is unused: every thread of the store
    /// draws its own randomness.
    fn access<R: Rng + CryptoRng>(
        &mut self,
        block_id: BlockId,
        data_in: Option<&[u8]>,
        _rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        TaoStore::access(self, block_id, data_in)
    }
}
