/// Shared upload/download streaming buffers
///
/// A streaming buffer is a host-visible staging region owned by the device
/// backend, from which short-lived ranges are sub-allocated. Ranges that
/// were handed to the GPU are only returned once the fence of that work
/// signals; download ranges are copied out to the host at that moment.

use std::time::Instant;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use crate::error::DeviceResult;
use crate::gpu::{Fence, StagingMemory, INVALID_ADDRESS};
use super::range_allocator::{AllocationStrategy, RangeAllocator};
use super::reclaim::DeferredReclaimer;

/// Bytes read back from the download ring once a pass completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDownload {
    /// Position of the originating request within its batch
    pub request: usize,
    pub data: Vec<u8>,
}

/// A download range to read back before it is freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBack {
    pub address: u32,
    /// Allocated size of the range
    pub allocated: u32,
    /// Bytes of payload to deliver (<= `allocated`)
    pub len: u32,
    pub request: usize,
}

enum Reclaim {
    Free(Vec<(u32, u32)>),
    ReadBack {
        ranges: Vec<ReadBack>,
        sink: Sender<StagedDownload>,
    },
}

pub struct StreamingBuffer<M, F> {
    memory: M,
    allocator: Mutex<RangeAllocator>,
    deferred: Mutex<DeferredReclaimer<F, Reclaim>>,
}

impl<M: StagingMemory, F: Fence> StreamingBuffer<M, F> {
    pub fn new(memory: M, strategy: AllocationStrategy) -> Self {
        let capacity = memory.size();
        Self {
            memory,
            allocator: Mutex::new(RangeAllocator::new(capacity, strategy)),
            deferred: Mutex::new(DeferredReclaimer::new()),
        }
    }

    /// Staging memory behind this buffer
    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn buffer(&self) -> &M::Buffer {
        self.memory.buffer()
    }

    pub fn capacity(&self) -> u32 {
        self.memory.size()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocator.lock().allocated_bytes()
    }

    /// Reclaim items still waiting on their fence
    pub fn pending_reclaims(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Fill every `INVALID_ADDRESS` slot of `addresses`, retrying until
    /// `deadline`. Slots already holding an address are left untouched.
    /// Returns whether every slot holds a valid address.
    pub fn multi_alloc(
        &self,
        deadline: Instant,
        addresses: &mut [u32],
        sizes: &[u32],
        alignment: u32,
    ) -> bool {
        debug_assert_eq!(addresses.len(), sizes.len());

        let capacity = self.capacity();
        if sizes.iter().any(|&size| size > capacity) {
            return false;
        }

        loop {
            self.reclaim();

            let satisfied = {
                let mut allocator = self.allocator.lock();
                let mut satisfied = true;
                for (address, &size) in addresses.iter_mut().zip(sizes) {
                    if *address == INVALID_ADDRESS {
                        match allocator.allocate(size, alignment) {
                            Some(allocated) => *address = allocated,
                            None => satisfied = false,
                        }
                    }
                }
                satisfied
            };

            if satisfied {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Free ranges once `fence` signals
    pub fn multi_free(&self, addresses: &[u32], sizes: &[u32], fence: F) {
        let ranges = Self::valid_ranges(addresses, sizes);
        if !ranges.is_empty() {
            self.deferred.lock().add_event(fence, Reclaim::Free(ranges));
        }
    }

    /// Free ranges that never reached the GPU
    pub fn multi_free_now(&self, addresses: &[u32], sizes: &[u32]) {
        let mut allocator = self.allocator.lock();
        for (address, size) in Self::valid_ranges(addresses, sizes) {
            allocator.free(address, size);
        }
    }

    /// Once `fence` signals, send each range's payload to `sink`, then free it
    pub fn multi_free_with_readback(&self, ranges: Vec<ReadBack>, fence: F, sink: Sender<StagedDownload>) {
        if !ranges.is_empty() {
            self.deferred.lock().add_event(fence, Reclaim::ReadBack { ranges, sink });
        }
    }

    /// Drain every reclaim whose fence has signaled; returns the number drained
    pub fn reclaim(&self) -> usize {
        let mut ready = Vec::new();
        let drained = self.deferred.lock().poll(|item| ready.push(item));
        if drained == 0 {
            return 0;
        }

        let mut freed = Vec::new();
        for item in ready {
            match item {
                Reclaim::Free(ranges) => freed.extend(ranges),
                Reclaim::ReadBack { ranges, sink } => {
                    for range in ranges {
                        match self.read_back(&range) {
                            Ok(data) => {
                                // A dropped receiver just means nobody wants the bytes
                                let _ = sink.send(StagedDownload {
                                    request: range.request,
                                    data,
                                });
                            }
                            Err(e) => log::warn!(
                                "[StreamingBuffer] Read-back for request {} failed: {}",
                                range.request,
                                e
                            ),
                        }
                        freed.push((range.address, range.allocated));
                    }
                }
            }
        }

        let mut allocator = self.allocator.lock();
        for (address, size) in freed {
            allocator.free(address, size);
        }
        log::trace!("[StreamingBuffer] Reclaimed {} deferred frees", drained);
        drained
    }

    fn read_back(&self, range: &ReadBack) -> DeviceResult<Vec<u8>> {
        let mut data = vec![0u8; range.len as usize];
        self.memory.read(range.address, &mut data)?;
        Ok(data)
    }

    fn valid_ranges(addresses: &[u32], sizes: &[u32]) -> Vec<(u32, u32)> {
        addresses
            .iter()
            .zip(sizes)
            .filter(|&(&address, _)| address != INVALID_ADDRESS)
            .map(|(&address, &size)| (address, size))
            .collect()
    }
}
