//! Property pools
//!
//! A property pool stores per-element properties structure-of-arrays style
//! on the GPU: property `p` of slot `i` lives at
//! `property_offset(p) + i * property_size(p)` in the pool's memory block.
//! The transfer engine only borrows pools through [`PropertyPool`].

use parking_lot::Mutex;
use crate::error::DeviceResult;
use crate::gpu::{BufferUsage, Driver};
use crate::memory::align_up;

/// GPU-resident structure-of-arrays container
pub trait PropertyPool<B> {
    fn property_count(&self) -> u32;

    /// Bytes per element of `property`
    fn property_size(&self, property: u32) -> u32;

    /// Number of element slots
    fn capacity(&self) -> u32;

    /// Byte offset of `property`'s block within [`memory_block`](Self::memory_block)
    fn property_offset(&self, property: u32) -> u64;

    fn memory_block(&self) -> &B;

    /// Reserve `out.len()` slots, writing their indices to `out`.
    /// All or nothing: on `false` no slot was reserved.
    fn allocate_properties(&self, out: &mut [u32]) -> bool;

    fn free_properties(&self, indices: &[u32]);
}

struct SlotState {
    free: Vec<u32>,
    next: u32,
    live: Vec<bool>,
}

impl SlotState {
    fn available(&self, capacity: u32) -> usize {
        self.free.len() + (capacity - self.next) as usize
    }
}

/// One backing buffer, one aligned block per property
pub struct SoaPropertyPool<B> {
    buffer: B,
    capacity: u32,
    sizes: Vec<u32>,
    offsets: Vec<u64>,
    slots: Mutex<SlotState>,
}

impl<B> SoaPropertyPool<B> {
    pub fn new<D>(driver: &D, label: &str, capacity: u32, property_sizes: &[u32]) -> DeviceResult<Self>
    where
        D: Driver<Buffer = B>,
    {
        let alignment = driver.min_storage_buffer_offset_alignment().max(4) as u64;

        let mut offsets = Vec::with_capacity(property_sizes.len());
        let mut size = 0u64;
        for &property_size in property_sizes {
            size = align_up(size, alignment);
            offsets.push(size);
            size += capacity as u64 * property_size as u64;
        }

        let buffer = driver.create_buffer(label, size.max(4), BufferUsage::PropertyStorage)?;
        log::debug!(
            "[SoaPropertyPool] '{}': {} properties x {} slots, {} bytes",
            label,
            property_sizes.len(),
            capacity,
            size
        );

        Ok(Self {
            buffer,
            capacity,
            sizes: property_sizes.to_vec(),
            offsets,
            slots: Mutex::new(SlotState {
                free: Vec::new(),
                next: 0,
                live: vec![false; capacity as usize],
            }),
        })
    }

    /// Slots currently reserved
    pub fn allocated_count(&self) -> u32 {
        let slots = self.slots.lock();
        self.capacity - slots.available(self.capacity) as u32
    }

    pub fn is_allocated(&self, index: u32) -> bool {
        self.slots.lock().live.get(index as usize).copied().unwrap_or(false)
    }

    /// Byte range of one element of `property` in the memory block
    pub fn element_range(&self, property: u32, index: u32) -> std::ops::Range<u64> {
        let size = self.sizes[property as usize] as u64;
        let start = self.offsets[property as usize] + index as u64 * size;
        start..start + size
    }
}

impl<B> PropertyPool<B> for SoaPropertyPool<B> {
    fn property_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    fn property_size(&self, property: u32) -> u32 {
        self.sizes[property as usize]
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn property_offset(&self, property: u32) -> u64 {
        self.offsets[property as usize]
    }

    fn memory_block(&self) -> &B {
        &self.buffer
    }

    fn allocate_properties(&self, out: &mut [u32]) -> bool {
        let mut slots = self.slots.lock();
        if slots.available(self.capacity) < out.len() {
            return false;
        }

        for index in out.iter_mut() {
            *index = match slots.free.pop() {
                Some(reused) => reused,
                None => {
                    slots.next += 1;
                    slots.next - 1
                }
            };
            slots.live[*index as usize] = true;
        }
        true
    }

    fn free_properties(&self, indices: &[u32]) {
        let mut slots = self.slots.lock();
        for &index in indices {
            match slots.live.get_mut(index as usize) {
                Some(live) if *live => {
                    *live = false;
                    slots.free.push(index);
                }
                _ => log::warn!("[SoaPropertyPool] Ignoring free of unallocated slot {}", index),
            }
        }
    }
}
