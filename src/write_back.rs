// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Background persistence of the cached subtree.
//!
//! Completed paths are queued. A write-back cycle takes up to `batch` of them, collects the
//! cached nodes on those paths and visits them deepest first. A dirty node is sealed and
//! written to storage, and its tag is recorded in its parent, which becomes dirty in turn
//! and is visited later in the same cycle. A clean node without cached children that no
//! in-flight operation is heading for is pruned.
//!
//! Cycles follow each other without waiting while a full batch is queued, so the queue
//! cannot outgrow the workers that fill it.
//!
//! Nodes are only ever try-locked here. A node (or parent) that is busy is skipped, and one
//! of its paths goes back on the queue for a later cycle.

use crate::{
    bucket::BucketCodec,
    database::Database,
    subtree::{NodeRef, NodeStatus, Subtree},
    LeafId, OramError, Tag, TreeIndex,
};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use rand::{CryptoRng, RngCore};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct Signal {
    pending: bool,
    shutdown: bool,
}

enum Visit {
    Done,
    Busy,
}

#[derive(Debug)]
pub(crate) struct WriteBack {
    queue: SegQueue<LeafId>,
    batch: usize,
    completed_paths: AtomicU64,
    cycle: Mutex<()>,
    signal: Mutex<Signal>,
    wake: Condvar,
    cycles: AtomicU64,
    pruned: AtomicU64,
}

impl WriteBack {
    pub(crate) fn new(batch: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            batch,
            completed_paths: AtomicU64::new(0),
            cycle: Mutex::new(()),
            signal: Mutex::new(Signal::default()),
            wake: Condvar::new(),
            cycles: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// Queues a completed path, waking the write-back thread every `batch` paths.
    pub(crate) fn complete_path(&self, leaf: LeafId) {
        self.queue.push(leaf);
        let completed = self.completed_paths.fetch_add(1, Ordering::SeqCst) + 1;
        if completed % self.batch as u64 == 0 {
            self.signal.lock().pending = true;
            self.wake.notify_one();
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether no path is queued and no cycle is running.
    pub(crate) fn is_settled(&self) -> bool {
        self.is_drained() && !self.cycle.is_locked()
    }

    /// Whether a full batch of paths is waiting, so another cycle should follow at once.
    pub(crate) fn has_backlog(&self) -> bool {
        self.queue.len() >= self.batch
    }

    /// Asks for a cycle before the next batch boundary, if any path is queued.
    pub(crate) fn request_cycle(&self) {
        if self.is_drained() {
            return;
        }
        self.signal.lock().pending = true;
        self.wake.notify_one();
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub(crate) fn pruned(&self) -> u64 {
        self.pruned.load(Ordering::SeqCst)
    }

    /// Blocks until a cycle is due. Returns false once shut down.
    pub(crate) fn wait_for_work(&self) -> bool {
        let mut signal = self.signal.lock();
        while !signal.pending && !signal.shutdown {
            self.wake.wait(&mut signal);
        }
        signal.pending = false;
        !signal.shutdown
    }

    pub(crate) fn shut_down(&self) {
        self.signal.lock().shutdown = true;
        self.wake.notify_all();
    }

    /// Runs one write-back cycle over up to `batch` queued paths.
    pub(crate) fn run_cycle<D: Database, R: RngCore + CryptoRng>(
        &self,
        subtree: &Subtree,
        codec: &BucketCodec,
        storage: &Mutex<D>,
        merkle_root: &Mutex<Tag>,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let _cycle = self.cycle.lock();

        let mut leaves = Vec::with_capacity(self.batch);
        while leaves.len() < self.batch {
            match self.queue.pop() {
                Some(leaf) => leaves.push(leaf),
                None => break,
            }
        }
        if leaves.is_empty() {
            return Ok(());
        }

        let mut nodes: BTreeMap<TreeIndex, (NodeRef, LeafId)> = BTreeMap::new();
        for &leaf in &leaves {
            for (index, node) in subtree.cached_path(leaf) {
                nodes.entry(index).or_insert((node, leaf));
            }
        }

        // Heap indices grow with depth, so reverse index order visits children first.
        let mut retry = BTreeSet::new();
        let mut pruned = 0;
        for (node, leaf) in nodes.values().rev() {
            match self.visit(node, subtree, codec, storage, merkle_root, rng)? {
                (Visit::Done, was_pruned) => pruned += u64::from(was_pruned),
                (Visit::Busy, _) => {
                    retry.insert(*leaf);
                }
            }
        }
        for leaf in &retry {
            self.queue.push(*leaf);
        }

        self.pruned.fetch_add(pruned, Ordering::SeqCst);
        self.cycles.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Write-back cycle over {} paths: {} nodes visited, {} pruned, {} paths requeued",
            leaves.len(),
            nodes.len(),
            pruned,
            retry.len()
        );
        Ok(())
    }

    fn visit<D: Database, R: RngCore + CryptoRng>(
        &self,
        node: &NodeRef,
        subtree: &Subtree,
        codec: &BucketCodec,
        storage: &Mutex<D>,
        merkle_root: &Mutex<Tag>,
        rng: &mut R,
    ) -> Result<(Visit, bool), OramError> {
        let Some(mut guard) = node.try_lock() else {
            return Ok((Visit::Busy, false));
        };
        if guard.status == NodeStatus::Pruned {
            return Ok((Visit::Done, false));
        }

        let Some(parent) = guard.parent.upgrade() else {
            // The root.
            if guard.status == NodeStatus::Dirty {
                let tag = codec.store_bucket(
                    &mut *storage.lock(),
                    guard.index,
                    &guard.blocks,
                    &guard.associated_data,
                    rng,
                )?;
                *merkle_root.lock() = tag;
                guard.status = NodeStatus::Clean;
            }
            return Ok((Visit::Done, false));
        };
        let Some(mut parent_guard) = parent.try_lock() else {
            return Ok((Visit::Busy, false));
        };

        if guard.status == NodeStatus::Dirty {
            let tag = codec.store_bucket(
                &mut *storage.lock(),
                guard.index,
                &guard.blocks,
                &guard.associated_data,
                rng,
            )?;
            let right = guard.index == 2 * parent_guard.index + 2;
            parent_guard.associated_data.set_child_tag(right, tag);
            parent_guard.status = NodeStatus::Dirty;
            guard.status = NodeStatus::Clean;
        }

        if !guard.is_childless() {
            return Ok((Visit::Done, false));
        }
        if subtree.is_in_flight(guard.index) {
            return Ok((Visit::Busy, false));
        }
        subtree.prune(&mut guard, &mut parent_guard);
        Ok((Visit::Done, true))
    }
}
