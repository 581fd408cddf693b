/// Fence-gated deferred reclamation
///
/// Resources that the GPU may still be using are parked here together
/// with the fence of the work that uses them. They are handed back only
/// once a poll observes that fence signaled. Polling is lazy: whoever
/// acquires the resource type next drains the queue first.

use std::collections::VecDeque;
use crate::gpu::Fence;

pub struct DeferredReclaimer<F, T> {
    pending: VecDeque<(F, T)>,
}

impl<F: Fence, T> DeferredReclaimer<F, T> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Park `item` until `fence` signals
    pub fn add_event(&mut self, fence: F, item: T) {
        self.pending.push_back((fence, item));
    }

    /// Hand every item whose fence has signaled to `reclaim`, without waiting
    pub fn poll<R: FnMut(T)>(&mut self, mut reclaim: R) -> usize {
        let mut reclaimed = 0;
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0.is_signaled() {
                if let Some((_, item)) = self.pending.remove(i) {
                    reclaim(item);
                    reclaimed += 1;
                }
            } else {
                i += 1;
            }
        }
        reclaimed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<F: Fence, T> Default for DeferredReclaimer<F, T> {
    fn default() -> Self {
        Self::new()
    }
}
