// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The plaintext subtree cached by a concurrent store.
//!
//! Each cached node owns its children and holds a weak reference to its parent. Nodes are
//! only reached through [`LockedNode`] handles: a traversal holds the lock on a node while
//! it locks the next one, so no thread ever sees a half-updated path, and a node cannot be
//! pruned while another thread holds its parent.

use crate::{
    block::Block,
    bucket::{AssociatedData, BucketCodec},
    config::TreeGeometry,
    database::Database,
    utils::{child_toward, goes_right},
    LeafId, OramError, TreeHeight, TreeIndex,
};
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use zeroize::Zeroize;

pub(crate) type NodeRef = Arc<Mutex<CacheNode>>;

/// An owned lock on a cached node.
pub(crate) type LockedNode = ArcMutexGuard<RawMutex, CacheNode>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeStatus {
    /// Matches the bucket in storage.
    Clean,
    /// Changed since it was last written to storage.
    Dirty,
    /// Detached from the tree; any handle still pointing here is stale.
    Pruned,
}

#[derive(Debug)]
pub(crate) struct CacheNode {
    pub(crate) index: TreeIndex,
    pub(crate) level: TreeHeight,
    pub(crate) blocks: Vec<Block>,
    pub(crate) associated_data: AssociatedData,
    pub(crate) children: [Option<NodeRef>; 2],
    pub(crate) parent: Weak<Mutex<CacheNode>>,
    pub(crate) status: NodeStatus,
    this: Weak<Mutex<CacheNode>>,
}

impl CacheNode {
    fn new_ref(
        index: TreeIndex,
        level: TreeHeight,
        blocks: Vec<Block>,
        associated_data: AssociatedData,
        parent: Weak<Mutex<CacheNode>>,
        status: NodeStatus,
    ) -> NodeRef {
        Arc::new_cyclic(|this| {
            Mutex::new(CacheNode {
                index,
                level,
                blocks,
                associated_data,
                children: [None, None],
                parent,
                status,
                this: this.clone(),
            })
        })
    }

    pub(crate) fn is_childless(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
}

impl Drop for CacheNode {
    fn drop(&mut self) {
        self.blocks.zeroize();
    }
}

/// Counts, for every non-root bucket, the operations whose path runs through it.
#[derive(Debug)]
struct PathMultiset {
    counts: Mutex<HashMap<TreeIndex, usize>>,
}

/// Keeps a path registered in the in-flight multiset until dropped.
#[derive(Debug)]
pub(crate) struct PathRegistration<'a> {
    multiset: &'a PathMultiset,
    indices: Vec<TreeIndex>,
}

impl Drop for PathRegistration<'_> {
    fn drop(&mut self) {
        let mut counts = self.multiset.counts.lock();
        for index in &self.indices {
            if let Some(count) = counts.get_mut(index) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(index);
                }
            }
        }
    }
}

/// The cached subtree. The root is always cached.
#[derive(Debug)]
pub(crate) struct Subtree {
    root: NodeRef,
    geometry: TreeGeometry,
    node_count: AtomicUsize,
    node_bound: usize,
    in_flight: PathMultiset,
}

impl Subtree {
    /// Returns a subtree holding only a clean root with contents `root_blocks`.
    pub(crate) fn new(root_blocks: Vec<Block>, geometry: TreeGeometry, node_bound: usize) -> Self {
        Self {
            root: CacheNode::new_ref(
                0,
                0,
                root_blocks,
                AssociatedData::default(),
                Weak::new(),
                NodeStatus::Clean,
            ),
            geometry,
            node_count: AtomicUsize::new(1),
            node_bound,
            in_flight: PathMultiset {
                counts: Mutex::new(HashMap::new()),
            },
        }
    }

    pub(crate) fn cached_nodes(&self) -> usize {
        self.node_count.load(Ordering::SeqCst)
    }

    pub(crate) fn node_bound(&self) -> usize {
        self.node_bound
    }

    pub(crate) fn lock_root(&self) -> LockedNode {
        self.root.lock_arc()
    }

    /// Registers levels 1 to `height` of the path to `leaf` as in flight.
    pub(crate) fn register(&self, leaf: LeafId) -> PathRegistration<'_> {
        let mut indices = Vec::with_capacity(self.geometry.height as usize);
        let mut index = 0;
        for level in 0..self.geometry.height {
            index = child_toward(index, leaf, level);
            indices.push(index);
        }

        let mut counts = self.in_flight.counts.lock();
        for index in &indices {
            *counts.entry(*index).or_insert(0) += 1;
        }
        PathRegistration {
            multiset: &self.in_flight,
            indices,
        }
    }

    pub(crate) fn is_in_flight(&self, index: TreeIndex) -> bool {
        self.in_flight.counts.lock().contains_key(&index)
    }

    /// Locks the child of `parent` on the `right` side, keeping `parent` locked.
    ///
    /// A child that is not cached is materialized: decoded from storage against the tag
    /// held by `parent` if `parent` marks it as written, or created empty otherwise. Either
    /// way `parent` now marks it as written and both nodes become dirty.
    ///
    /// # Errors
    ///
    /// Returns a `SubtreeMemoryExceeded` error if materializing the child would exceed the
    /// node bound, or an `IntegrityError` if its bucket does not authenticate.
    pub(crate) fn lock_child<D: Database>(
        &self,
        parent: &mut LockedNode,
        right: bool,
        codec: &BucketCodec,
        storage: &Mutex<D>,
    ) -> Result<LockedNode, OramError> {
        let side = usize::from(right);
        if let Some(child) = &parent.children[side] {
            return Ok(child.lock_arc());
        }

        let index = 2 * parent.index + 1 + TreeIndex::from(right);
        let (blocks, associated_data) = if parent.associated_data.reaches(right) {
            let mut storage = storage.lock();
            codec.load_bucket(&mut *storage, index, parent.associated_data.child_tag(right))?
        } else {
            (codec.empty_blocks(), AssociatedData::default())
        };

        let nodes = self.node_count.fetch_add(1, Ordering::SeqCst) + 1;
        if nodes > self.node_bound {
            self.node_count.fetch_sub(1, Ordering::SeqCst);
            return Err(OramError::SubtreeMemoryExceeded {
                nodes,
                bound: self.node_bound,
            });
        }

        let child = CacheNode::new_ref(
            index,
            parent.level + 1,
            blocks,
            associated_data,
            parent.this.clone(),
            NodeStatus::Dirty,
        );
        parent.associated_data.set_reaches(right, true);
        parent.status = NodeStatus::Dirty;
        let locked = child.lock_arc();
        parent.children[side] = Some(child);
        Ok(locked)
    }

    /// Steps from `parent` to its child toward `leaf`, releasing `parent` only once the
    /// child is locked.
    pub(crate) fn descend<D: Database>(
        &self,
        mut parent: LockedNode,
        leaf: LeafId,
        codec: &BucketCodec,
        storage: &Mutex<D>,
    ) -> Result<LockedNode, OramError> {
        let right = goes_right(leaf, parent.level);
        let child = self.lock_child(&mut parent, right, codec, storage)?;
        drop(parent);
        Ok(child)
    }

    /// Returns the cached nodes on the path to `leaf`, root first, without materializing any.
    pub(crate) fn cached_path(&self, leaf: LeafId) -> Vec<(TreeIndex, NodeRef)> {
        let mut path = vec![(0, Arc::clone(&self.root))];
        let mut node = self.root.lock_arc();
        while node.level < self.geometry.height {
            let Some(child) = node.children[usize::from(goes_right(leaf, node.level))].clone()
            else {
                break;
            };
            let next = child.lock_arc();
            path.push((next.index, child));
            node = next;
        }
        path
    }

    /// Detaches `node` from `parent`. The caller must have written `node` to storage and
    /// recorded its tag in `parent`.
    pub(crate) fn prune(&self, node: &mut CacheNode, parent: &mut CacheNode) {
        debug_assert!(node.is_childless());
        let side = usize::from(node.index == 2 * parent.index + 2);
        parent.children[side] = None;
        node.status = NodeStatus::Pruned;
        node.blocks.zeroize();
        self.node_count.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Pruned cached node {}", node.index);
    }
}
