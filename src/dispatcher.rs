// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The pending-request queue of a concurrent store.
//!
//! Every request is queued on arrival. A request for a block that an earlier, still
//! unanswered request is already fetching becomes *synthetic*: its worker fetches a decoy
//! path instead, and its result is copied from that earlier request, its *leader*, when the
//! leader answers. The dispatcher thread releases answered requests in arrival order.

use crate::{block::Block, BlockId, LeafId, OramError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{collections::VecDeque, sync::Arc};
use subtle::{Choice, ConditionallySelectable};

type Outcome = Result<Vec<u8>, OramError>;

/// Where a caller waits for the outcome of its request.
#[derive(Debug, Default)]
pub(crate) struct Ticket {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Ticket {
    fn fulfil(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    /// Blocks until the request has been answered.
    pub(crate) fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            self.ready.wait(&mut outcome);
        }
    }
}

/// What a worker needs to know about the request it serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Request {
    pub(crate) id: u64,
    pub(crate) block_id: BlockId,
    pub(crate) synthetic: bool,
}

#[derive(Debug)]
struct PendingEntry {
    request: Request,
    /// The request whose result a synthetic request copies. Equal to `request.id` otherwise.
    leader: u64,
    /// Whether the worker serving this request has answered.
    handled: bool,
    data_in: Option<Vec<u8>>,
    outcome: Option<Outcome>,
    ticket: Arc<Ticket>,
}

impl PendingEntry {
    fn is_releasable(&self) -> bool {
        self.handled && self.outcome.is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    entries: VecDeque<PendingEntry>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a request for `block_id`, marking it synthetic if an unanswered real request
    /// for the same block is already queued.
    pub(crate) fn submit(
        &self,
        block_id: BlockId,
        data_in: Option<Vec<u8>>,
    ) -> Result<(Request, Arc<Ticket>), OramError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(OramError::StoreShutDown);
        }

        let id = state.next_id;
        state.next_id += 1;

        let leader = state
            .entries
            .iter()
            .find(|entry| {
                !entry.handled && !entry.request.synthetic && entry.request.block_id == block_id
            })
            .map(|entry| entry.request.id);

        let request = Request {
            id,
            block_id,
            synthetic: leader.is_some(),
        };
        let ticket = Arc::new(Ticket::default());
        state.entries.push_back(PendingEntry {
            request,
            leader: leader.unwrap_or(id),
            handled: false,
            data_in,
            outcome: None,
            ticket: Arc::clone(&ticket),
        });
        Ok((request, ticket))
    }

    /// Answers `request` with the contents of `block`, the block fetched for it (empty for
    /// a synthetic request).
    ///
    /// A real request answers itself and every synthetic request it leads, in arrival
    /// order: each is given the payload as it stands, and then its own `data_in`, if any,
    /// is applied. `block` is then re-tagged with `request.block_id` and `new_leaf`.
    ///
    /// The queue stays locked until the returned guard is dropped, so that the caller can
    /// claim the first stash chunk before any later request for the same block can start.
    pub(crate) fn answer(
        &self,
        request: &Request,
        block: &mut Block,
        new_leaf: LeafId,
    ) -> MutexGuard<'_, QueueState> {
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            let own = entry.request.id == request.id;
            if own {
                entry.handled = true;
            }
            if request.synthetic || !(own || entry.leader == request.id) {
                continue;
            }

            entry.outcome = Some(Ok(block.payload.clone()));
            if let Some(data) = entry.data_in.take() {
                block.payload = data;
            }
        }

        let real = !Choice::from(u8::from(request.synthetic));
        block.id.conditional_assign(&request.block_id, real);
        block.leaf.conditional_assign(&new_leaf, real);
        state
    }

    /// Wakes the dispatcher thread.
    pub(crate) fn notify(&self) {
        self.changed.notify_all();
    }

    /// Answers every queued request with `error`.
    pub(crate) fn fail_all(&self, error: &OramError) {
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            entry.handled = true;
            if entry.outcome.is_none() {
                entry.outcome = Some(Err(error.clone()));
            }
        }
        drop(state);
        self.notify();
    }

    /// Releases answered requests in arrival order until shut down with an empty queue.
    pub(crate) fn run(&self) {
        let mut state = self.state.lock();
        loop {
            while state
                .entries
                .front()
                .is_some_and(PendingEntry::is_releasable)
            {
                if let Some(mut entry) = state.entries.pop_front() {
                    if let Some(outcome) = entry.outcome.take() {
                        entry.ticket.fulfil(outcome);
                    }
                }
            }
            if state.shutdown && state.entries.is_empty() {
                break;
            }
            self.changed.wait(&mut state);
        }
        log::debug!("Dispatcher stopped");
    }

    /// Refuses new requests and lets the dispatcher thread exit once the queue drains.
    pub(crate) fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.notify();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_logger;
    use std::thread;

    #[test]
    fn duplicates_become_synthetic() {
        init_logger();
        let dispatcher = Dispatcher::new();

        let (first, _) = dispatcher.submit(3, None).unwrap();
        let (second, _) = dispatcher.submit(3, Some(vec![1; 4])).unwrap();
        let (other, _) = dispatcher.submit(4, None).unwrap();
        assert!(!first.synthetic);
        assert!(second.synthetic);
        assert!(!other.synthetic);

        let mut block = Block::new(3, 0, vec![7; 4]);
        drop(dispatcher.answer(&first, &mut block, 5));
        assert_eq!(block.payload, vec![1; 4]);
        assert_eq!(block.leaf, 5);

        // The leader has answered, so a new request for block 3 is real again.
        let (third, _) = dispatcher.submit(3, None).unwrap();
        assert!(!third.synthetic);
    }

    #[test]
    fn answers_are_released_in_order() {
        init_logger();
        let dispatcher = Arc::new(Dispatcher::new());
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.run())
        };

        let (first, first_ticket) = dispatcher.submit(1, Some(vec![2; 4])).unwrap();
        let (second, second_ticket) = dispatcher.submit(1, Some(vec![3; 4])).unwrap();
        let (third, third_ticket) = dispatcher.submit(2, None).unwrap();

        // A synthetic request carries an empty block.
        let mut decoy = Block::empty(4);
        drop(dispatcher.answer(&second, &mut decoy, 0));
        assert!(decoy.is_empty());

        let mut fetched = Block::new(2, 1, vec![9; 4]);
        drop(dispatcher.answer(&third, &mut fetched, 1));
        dispatcher.notify();

        let mut block = Block::empty(4);
        drop(dispatcher.answer(&first, &mut block, 6));
        dispatcher.notify();
        assert_eq!(block.id, 1);
        assert_eq!(block.payload, vec![3; 4]);

        assert_eq!(first_ticket.wait(), Ok(vec![0; 4]));
        assert_eq!(second_ticket.wait(), Ok(vec![2; 4]));
        assert_eq!(third_ticket.wait(), Ok(vec![9; 4]));

        dispatcher.shut_down();
        runner.join().unwrap();
        assert_eq!(dispatcher.len(), 0);
        assert_eq!(dispatcher.submit(1, None).err(), Some(OramError::StoreShutDown));
    }

    #[test]
    fn failures_reach_every_caller() {
        init_logger();
        let dispatcher = Arc::new(Dispatcher::new());
        let runner = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.run())
        };

        let (_, first) = dispatcher.submit(1, None).unwrap();
        let (_, second) = dispatcher.submit(1, None).unwrap();
        dispatcher.fail_all(&OramError::StashOverflowError);

        assert_eq!(first.wait(), Err(OramError::StashOverflowError));
        assert_eq!(second.wait(), Err(OramError::StashOverflowError));

        dispatcher.shut_down();
        runner.join().unwrap();
    }
}
