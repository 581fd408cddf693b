/// Address range allocator
///
/// Hands out aligned byte ranges inside a fixed-size region and merges
/// adjacent free ranges on release. Backs the streaming buffers; holds no
/// GPU objects itself.

use serde::{Deserialize, Serialize};

/// Allocation strategy for picking a free range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// First range that fits
    FirstFit,
    /// Smallest range that fits (least waste)
    BestFit,
    /// Largest range first (reduces fragmentation)
    WorstFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    offset: u32,
    size: u32,
}

impl FreeRange {
    fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    /// Aligned start of an allocation of `size` bytes, if it fits
    fn fit(&self, size: u32, alignment: u32) -> Option<u32> {
        let aligned = align_up(self.offset as u64, alignment as u64);
        (aligned + size as u64 <= self.end()).then_some(aligned as u32)
    }
}

/// Round `value` up to a multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

/// Free-list allocator over `[0, capacity)`
#[derive(Debug)]
pub struct RangeAllocator {
    capacity: u32,
    strategy: AllocationStrategy,
    /// Sorted by offset, never adjacent
    free: Vec<FreeRange>,
    allocated_bytes: u64,
}

impl RangeAllocator {
    pub fn new(capacity: u32, strategy: AllocationStrategy) -> Self {
        let free = if capacity > 0 {
            vec![FreeRange { offset: 0, size: capacity }]
        } else {
            Vec::new()
        };

        Self {
            capacity,
            strategy,
            free,
            allocated_bytes: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity as u64 - self.allocated_bytes
    }

    /// Allocate `size` bytes at an address aligned to `alignment`
    pub fn allocate(&mut self, size: u32, alignment: u32) -> Option<u32> {
        if size == 0 || size > self.capacity {
            return None;
        }

        let mut candidates = self
            .free
            .iter()
            .enumerate()
            .filter_map(|(idx, range)| range.fit(size, alignment).map(|addr| (idx, addr, range.size)));

        let (idx, address) = match self.strategy {
            AllocationStrategy::FirstFit => candidates.next().map(|(idx, addr, _)| (idx, addr))?,
            AllocationStrategy::BestFit => candidates
                .min_by_key(|(_, _, range_size)| *range_size)
                .map(|(idx, addr, _)| (idx, addr))?,
            AllocationStrategy::WorstFit => candidates
                .max_by_key(|(_, _, range_size)| *range_size)
                .map(|(idx, addr, _)| (idx, addr))?,
        };

        let range = self.free[idx];
        let prefix = FreeRange {
            offset: range.offset,
            size: address - range.offset,
        };
        let suffix_offset = address + size;
        let suffix = FreeRange {
            offset: suffix_offset,
            size: (range.end() - suffix_offset as u64) as u32,
        };

        // Replace the consumed range with whatever is left on either side
        let remaining: Vec<FreeRange> = [prefix, suffix].into_iter().filter(|r| r.size > 0).collect();
        self.free.splice(idx..=idx, remaining);

        self.allocated_bytes += size as u64;
        Some(address)
    }

    /// Return a range obtained from [`allocate`](Self::allocate)
    pub fn free(&mut self, address: u32, size: u32) {
        if size == 0 {
            return;
        }
        debug_assert!(address as u64 + size as u64 <= self.capacity as u64);

        let idx = self.free.partition_point(|r| r.offset < address);
        debug_assert!(
            idx == self.free.len() || self.free[idx].offset >= address + size,
            "double free of range {}+{}",
            address,
            size
        );
        self.free.insert(idx, FreeRange { offset: address, size });
        self.allocated_bytes = self.allocated_bytes.saturating_sub(size as u64);

        // Merge with the following range, then the preceding one
        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].offset as u64 {
            self.free[idx].size += self.free[idx + 1].size;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].offset as u64 {
            self.free[idx - 1].size += self.free[idx].size;
            self.free.remove(idx);
        }
    }

    /// Number of disjoint free ranges
    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }
}
