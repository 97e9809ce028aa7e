use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::wire::rpc_id::RpcId;


/// A bounded insertion-ordered set of recently seen [RpcId]s, used to answer duplicate frames
///  for operations that are already fully processed (re-ACK a consumed reply, drop a stale
///  duplicate request) without unbounded memory growth.
///
/// When the capacity is reached, the oldest entry is evicted. A duplicate arriving after its id
///  was evicted is indistinguishable from garbage and gets dropped by the caller - acceptable,
///  since eviction implies the duplicate is many thousands of messages stale.
pub struct IdCache {
    capacity: usize,
    order: VecDeque<RpcId>,
    ids: FxHashSet<RpcId>,
}

impl IdCache {
    pub fn new(capacity: usize) -> IdCache {
        assert!(capacity > 0, "id cache capacity must be positive");
        IdCache {
            capacity,
            order: VecDeque::with_capacity(capacity),
            ids: FxHashSet::default(),
        }
    }

    pub fn insert(&mut self, id: RpcId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, id: &RpcId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}
