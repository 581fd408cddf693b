//! Descriptor set cache
//!
//! One cache per properties-per-pass count. Sets handed to a pass are
//! parked with that pass's fence and only become free again once a later
//! acquisition (or an explicit drain) sees the fence signaled.

use crate::error::DeviceResult;
use crate::gpu::shader::{copy_layout_bindings, HEADER_BINDING, INPUT_BINDING, OUTPUT_BINDING};
use crate::gpu::{BufferRange, DescriptorType, DescriptorWrite, Driver};
use crate::memory::DeferredReclaimer;
use super::request::TransferRequest;

pub struct DescriptorSetCache<D: Driver> {
    property_count: u32,
    layout: D::DescriptorSetLayout,
    free: Vec<D::DescriptorSet>,
    in_flight: DeferredReclaimer<D::Fence, D::DescriptorSet>,
    created: usize,
}

impl<D: Driver> DescriptorSetCache<D> {
    /// Create the layout for `property_count` properties and `reserve` free sets
    pub fn new(driver: &D, property_count: u32, reserve: usize) -> DeviceResult<Self> {
        let layout = driver.create_descriptor_set_layout(&copy_layout_bindings(property_count))?;
        let mut cache = Self {
            property_count,
            layout,
            free: Vec::with_capacity(reserve),
            in_flight: DeferredReclaimer::new(),
            created: 0,
        };
        for _ in 0..reserve {
            let set = driver.create_descriptor_set(&cache.layout)?;
            cache.free.push(set);
            cache.created += 1;
        }
        Ok(cache)
    }

    pub fn layout(&self) -> &D::DescriptorSetLayout {
        &self.layout
    }

    pub fn property_count(&self) -> u32 {
        self.property_count
    }

    /// Acquire a set and bind one pass's buffers to it.
    ///
    /// `upload_addresses` holds the header range first, then one range per
    /// upload request in request order; `download_addresses` holds one range
    /// per download request in request order.
    pub fn get_next_set(
        &mut self,
        driver: &D,
        requests: &[TransferRequest<'_, D::Buffer>],
        header_size: u32,
        upload_addresses: &[u32],
        download_addresses: &[u32],
    ) -> DeviceResult<D::DescriptorSet> {
        debug_assert_eq!(requests.len() as u32, self.property_count);
        self.drain();

        let set = match self.free.pop() {
            Some(set) => set,
            None => {
                let set = driver.create_descriptor_set(&self.layout)?;
                self.created += 1;
                log::trace!(
                    "[DescriptorSetCache] x{}: created set #{}",
                    self.property_count,
                    self.created
                );
                set
            }
        };

        if let Err(e) = Self::write_set(driver, &set, requests, header_size, upload_addresses, download_addresses) {
            self.free.push(set);
            return Err(e);
        }
        Ok(set)
    }

    fn write_set(
        driver: &D,
        set: &D::DescriptorSet,
        requests: &[TransferRequest<'_, D::Buffer>],
        header_size: u32,
        upload_addresses: &[u32],
        download_addresses: &[u32],
    ) -> DeviceResult<()> {
        let up = driver.up_streaming_buffer().buffer();
        let down = driver.down_streaming_buffer().buffer();

        let header = [BufferRange {
            buffer: up,
            offset: upload_addresses[0] as u64,
            size: header_size as u64,
        }];

        let mut inputs = Vec::with_capacity(requests.len());
        let mut outputs = Vec::with_capacity(requests.len());
        let mut uploads = upload_addresses[1..].iter();
        let mut downloads = download_addresses.iter();
        for request in requests {
            let pool = BufferRange {
                buffer: request.pool.memory_block(),
                offset: request.pool.property_offset(request.property),
                size: request.pool.capacity() as u64 * request.property_size() as u64,
            };
            let staged = |address: Option<&u32>, buffer| BufferRange {
                buffer,
                offset: address.copied().unwrap_or_default() as u64,
                size: request.staging_size() as u64,
            };

            if request.is_download() {
                inputs.push(pool);
                outputs.push(staged(downloads.next(), down));
            } else {
                inputs.push(staged(uploads.next(), up));
                outputs.push(pool);
            }
        }

        let write = |binding, buffers| DescriptorWrite {
            set,
            binding,
            array_element: 0,
            ty: DescriptorType::StorageBuffer,
            buffers,
        };
        driver.update_descriptor_sets(&[
            write(HEADER_BINDING, &header[..]),
            write(INPUT_BINDING, &inputs[..]),
            write(OUTPUT_BINDING, &outputs[..]),
        ])
    }

    /// Park `set` until `fence` signals
    pub fn release_set(&mut self, fence: D::Fence, set: D::DescriptorSet) {
        self.in_flight.add_event(fence, set);
    }

    /// Return a set that never reached the GPU
    pub fn recycle_unused(&mut self, set: D::DescriptorSet) {
        self.free.push(set);
    }

    /// Move sets whose fence has signaled back to the free list
    pub fn drain(&mut self) -> usize {
        let free = &mut self.free;
        self.in_flight.poll(|set| free.push(set))
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn created_count(&self) -> usize {
        self.created
    }
}
