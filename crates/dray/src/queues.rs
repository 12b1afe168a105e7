// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The four ray queues and their admission rules.
//!
//! - `ray_queue`: rays ready to trace locally
//! - `out_queue[treelet]`: rays bound for a remote treelet with a known owner
//! - `pending_queue[treelet]`: rays bound for a remote treelet with no known
//!   owner yet
//! - `finished_queue`: rays whose contribution is complete
//!
//! `out_queue_size` / `pending_queue_size` are aggregate sizes maintained
//! incrementally on every enqueue/dequeue. Rays are owned by exactly one
//! queue at a time; all moves are transfers.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ray::{RayState, TreeletId, WorkerId};

/// Where classification placed a ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Local treelet: the ray queue.
    Local,
    /// Remote treelet with a known owner.
    Out(TreeletId),
    /// Remote treelet with no known owner yet.
    Pending(TreeletId),
}

/// Queue state plus the treelet-ownership knowledge that drives admission.
#[derive(Debug, Default)]
pub struct RayQueues {
    pub ray_queue: VecDeque<RayState>,
    out_queue: HashMap<TreeletId, VecDeque<RayState>>,
    pending_queue: HashMap<TreeletId, VecDeque<RayState>>,
    pub finished_queue: VecDeque<RayState>,
    pub finished_path_ids: Vec<u64>,

    out_queue_size: usize,
    pending_queue_size: usize,

    /// Treelets this worker owns (loaded into the local BVH).
    pub owned_treelets: HashSet<TreeletId>,
    /// Known remote owners per treelet; a treelet may have several.
    treelet_to_worker: HashMap<TreeletId, Vec<WorkerId>>,
    /// Remote treelets with queued pending rays and no known owner.
    pub needed_treelets: HashSet<TreeletId>,
    /// Treelets whose owner has already been requested from the coordinator.
    pub requested_treelets: HashSet<TreeletId>,
}

impl RayQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn out_queue_size(&self) -> usize {
        self.out_queue_size
    }

    pub fn pending_queue_size(&self) -> usize {
        self.pending_queue_size
    }

    /// Classify a processed or newly generated ray by its current treelet
    /// and enqueue it accordingly.
    pub fn classify(&mut self, ray: RayState) -> Placement {
        let treelet = ray.current_treelet();

        if self.owned_treelets.contains(&treelet) {
            self.ray_queue.push_back(ray);
            return Placement::Local;
        }

        if self.treelet_to_worker.contains_key(&treelet) {
            self.out_queue.entry(treelet).or_default().push_back(ray);
            self.out_queue_size += 1;
            Placement::Out(treelet)
        } else {
            self.needed_treelets.insert(treelet);
            self.pending_queue.entry(treelet).or_default().push_back(ray);
            self.pending_queue_size += 1;
            Placement::Pending(treelet)
        }
    }

    /// Candidate owners for a treelet.
    pub fn workers_for_treelet(&self, treelet: TreeletId) -> Option<&[WorkerId]> {
        self.treelet_to_worker.get(&treelet).map(|v| v.as_slice())
    }

    /// Record that `worker` owns `treelet` and promote every pending ray for
    /// it into the out queue. Returns the number of rays promoted.
    pub fn announce_treelet(&mut self, treelet: TreeletId, worker: WorkerId) -> usize {
        self.treelet_to_worker.entry(treelet).or_default().push(worker);
        self.needed_treelets.remove(&treelet);
        self.requested_treelets.remove(&treelet);

        let Some(mut pending) = self.pending_queue.remove(&treelet) else {
            return 0;
        };
        let promoted = pending.len();
        self.pending_queue_size -= promoted;
        self.out_queue_size += promoted;
        self.out_queue
            .entry(treelet)
            .or_default()
            .append(&mut pending);

        if promoted > 0 {
            log::debug!(
                "[QUEUE] treelet {} announced by worker {}, promoted {} pending rays",
                treelet,
                worker,
                promoted
            );
        }
        promoted
    }

    /// Treelets with at least one queued outbound ray.
    pub fn out_treelets(&self) -> Vec<TreeletId> {
        self.out_queue
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(t, _)| *t)
            .collect()
    }

    /// Pop the next outbound ray for a treelet.
    pub fn pop_out(&mut self, treelet: TreeletId) -> Option<RayState> {
        let ray = self.out_queue.get_mut(&treelet)?.pop_front()?;
        self.out_queue_size -= 1;
        Some(ray)
    }

    /// Put an un-sent ray back at the front of its out queue (packet
    /// assembly overflow carry).
    pub fn unpop_out(&mut self, treelet: TreeletId, ray: RayState) {
        self.out_queue.entry(treelet).or_default().push_front(ray);
        self.out_queue_size += 1;
    }

    pub fn out_len(&self, treelet: TreeletId) -> usize {
        self.out_queue.get(&treelet).map_or(0, VecDeque::len)
    }

    pub fn pending_len(&self, treelet: TreeletId) -> usize {
        self.pending_queue.get(&treelet).map_or(0, VecDeque::len)
    }

    /// Invariant check used by tests: the aggregate counters match the
    /// per-treelet deque sizes.
    pub fn counters_consistent(&self) -> bool {
        self.out_queue_size == self.out_queue.values().map(VecDeque::len).sum::<usize>()
            && self.pending_queue_size
                == self.pending_queue.values().map(VecDeque::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ray::TreeletNode;

    fn ray_for(treelet: TreeletId) -> RayState {
        let mut ray = RayState::default();
        ray.to_visit.push(TreeletNode { treelet, node: 0 });
        ray
    }

    #[test]
    fn test_owned_treelet_goes_local() {
        let mut queues = RayQueues::new();
        queues.owned_treelets.insert(3);

        assert_eq!(queues.classify(ray_for(3)), Placement::Local);
        assert_eq!(queues.ray_queue.len(), 1);
        assert_eq!(queues.out_queue_size(), 0);
        assert_eq!(queues.pending_queue_size(), 0);
        assert!(queues.counters_consistent());
    }

    #[test]
    fn test_known_remote_goes_out() {
        let mut queues = RayQueues::new();
        queues.announce_treelet(7, 42);

        assert_eq!(queues.classify(ray_for(7)), Placement::Out(7));
        assert_eq!(queues.out_queue_size(), 1);
        assert!(queues.needed_treelets.is_empty());
        assert!(queues.counters_consistent());
    }

    #[test]
    fn test_unknown_remote_goes_pending() {
        let mut queues = RayQueues::new();

        assert_eq!(queues.classify(ray_for(9)), Placement::Pending(9));
        assert_eq!(queues.pending_queue_size(), 1);
        assert!(queues.needed_treelets.contains(&9));
        assert!(queues.counters_consistent());
    }

    #[test]
    fn test_announce_promotes_pending() {
        let mut queues = RayQueues::new();
        queues.classify(ray_for(9));
        queues.classify(ray_for(9));
        queues.requested_treelets.insert(9);

        let promoted = queues.announce_treelet(9, 5);
        assert_eq!(promoted, 2);
        assert_eq!(queues.pending_len(9), 0);
        assert_eq!(queues.out_len(9), 2);
        assert_eq!(queues.pending_queue_size(), 0);
        assert_eq!(queues.out_queue_size(), 2);
        assert!(queues.needed_treelets.is_empty());
        assert!(queues.requested_treelets.is_empty());
        assert_eq!(queues.workers_for_treelet(9), Some(&[5u64][..]));
        assert!(queues.counters_consistent());
    }

    #[test]
    fn test_promotion_preserves_order() {
        let mut queues = RayQueues::new();
        let mut first = ray_for(4);
        first.sample.id = 100;
        let mut second = ray_for(4);
        second.sample.id = 200;
        queues.classify(first);
        queues.classify(second);

        queues.announce_treelet(4, 1);
        assert_eq!(queues.pop_out(4).unwrap().sample.id, 100);
        assert_eq!(queues.pop_out(4).unwrap().sample.id, 200);
    }

    #[test]
    fn test_unpop_returns_to_front() {
        let mut queues = RayQueues::new();
        queues.announce_treelet(2, 1);
        let mut a = ray_for(2);
        a.sample.id = 1;
        let mut b = ray_for(2);
        b.sample.id = 2;
        queues.classify(a);
        queues.classify(b);

        let first = queues.pop_out(2).unwrap();
        queues.unpop_out(2, first);
        assert_eq!(queues.out_queue_size(), 2);
        assert_eq!(queues.pop_out(2).unwrap().sample.id, 1);
        assert!(queues.counters_consistent());
    }

    #[test]
    fn test_out_treelets_skips_empty() {
        let mut queues = RayQueues::new();
        queues.announce_treelet(2, 1);
        queues.classify(ray_for(2));
        queues.pop_out(2);
        assert!(queues.out_treelets().is_empty());
    }

    #[test]
    fn test_multiple_owners_accumulate() {
        let mut queues = RayQueues::new();
        queues.announce_treelet(6, 1);
        queues.announce_treelet(6, 2);
        assert_eq!(queues.workers_for_treelet(6), Some(&[1u64, 2u64][..]));
    }
}
