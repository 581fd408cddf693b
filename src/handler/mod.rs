//! Property pool handler
//!
//! Batches property uploads and downloads into compute passes. Each pass
//! moves up to [`PropertyPoolHandler::max_properties_per_pass`] requests:
//! its header and upload payloads are staged in the upload streaming
//! buffer, a descriptor set binds staging ranges and pool blocks, one
//! dispatch scatters (uploads) or gathers (downloads) the words, and every
//! resource the pass touched is handed back only after its fence signals.

pub mod descriptor_cache;
pub mod header;
pub mod pipeline_table;
pub mod request;

pub use descriptor_cache::DescriptorSetCache;
pub use header::{HeaderEntry, HeaderView, PassHeader};
pub use pipeline_table::{PipelineTable, PipelineVariant};
pub use request::{AllocationRequest, Transfer, TransferDirection, TransferFailure, TransferRequest};

use std::sync::Arc;
use std::time::{Duration, Instant};
use crossbeam_channel::Sender;
use crate::config::TransferConfig;
use crate::error::{DeviceError, DeviceResult, StagingRing, TransferError, TransferResult};
use crate::gpu::{Driver, Fence, StagingMemory, INVALID_ADDRESS};
use crate::memory::{ReadBack, StagedDownload, TransferStats, TransferType};

pub struct PropertyPoolHandler<D: Driver> {
    driver: Arc<D>,
    pipelines: PipelineTable<D>,
    max_properties_per_pass: u32,
    workgroup_size: u32,
    staging_alignment: u32,
    stats: TransferStats,

    // Per-pass scratch, reused across calls
    header: PassHeader,
    upload_addresses: Vec<u32>,
    upload_sizes: Vec<u32>,
    download_addresses: Vec<u32>,
    download_sizes: Vec<u32>,
}

impl<D: Driver> PropertyPoolHandler<D> {
    pub fn new(
        driver: Arc<D>,
        pipeline_cache: Option<&D::PipelineCache>,
        config: &TransferConfig,
    ) -> DeviceResult<Self> {
        let bindings = driver.max_storage_buffer_bindings();
        let max_properties_per_pass = bindings.saturating_sub(1) / 2;
        if max_properties_per_pass == 0 {
            return Err(DeviceError::Unsupported(format!(
                "{} storage buffer bindings cannot fit a header, an input and an output",
                bindings
            )));
        }
        if config.ideal_workgroup_size == 0 {
            return Err(DeviceError::Unsupported("workgroup size of 0".to_string()));
        }

        let pipelines = PipelineTable::new(
            &*driver,
            pipeline_cache,
            max_properties_per_pass,
            config.ideal_workgroup_size,
            config.descriptor_set_reserve,
        )?;
        let staging_alignment = driver.min_storage_buffer_offset_alignment().max(4);

        log::info!(
            "[PropertyPoolHandler] Built {} pipeline variants ({} storage bindings, workgroup size {}, staging alignment {})",
            pipelines.len(),
            bindings,
            config.ideal_workgroup_size,
            staging_alignment
        );

        let scratch = max_properties_per_pass as usize + 1;
        Ok(Self {
            driver,
            pipelines,
            max_properties_per_pass,
            workgroup_size: config.ideal_workgroup_size,
            staging_alignment,
            stats: TransferStats::new(),
            header: PassHeader::new(),
            upload_addresses: Vec::with_capacity(scratch),
            upload_sizes: Vec::with_capacity(scratch),
            download_addresses: Vec::with_capacity(scratch),
            download_sizes: Vec::with_capacity(scratch),
        })
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// `(max storage buffer bindings - 1) / 2`: one header plus an input and
    /// an output per property
    pub fn max_properties_per_pass(&self) -> u32 {
        self.max_properties_per_pass
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn pipelines(&self) -> &PipelineTable<D> {
        &self.pipelines
    }

    /// Reserve pool slots for every request, then upload their data.
    ///
    /// If any pool allocation fails, the slots already granted by this call
    /// are freed and no work is issued. If a pass fails later, slots of the
    /// requests whose pass was never dispatched are freed as well.
    pub fn add_properties(
        &mut self,
        requests: &mut [AllocationRequest<'_, D::Buffer>],
        max_wait: Duration,
    ) -> Result<Transfer<D::Fence>, TransferFailure<D::Fence>> {
        for i in 0..requests.len() {
            let request = &mut requests[i];
            if request.pool.allocate_properties(request.out_indices) {
                continue;
            }

            let error = TransferError::PoolAllocation {
                request: i,
                requested: request.out_indices.len(),
            };
            log::warn!("[PropertyPoolHandler] {}", error);
            for granted in &requests[..i] {
                granted.pool.free_properties(&granted.out_indices[..]);
            }
            self.stats.calls += 1;
            self.stats.record_failure(&error);
            return Err(TransferFailure::before_dispatch(error));
        }

        let transfers: Vec<_> = requests.iter().map(|request| request.as_transfer()).collect();
        let result = self.transfer_properties(&transfers, max_wait);

        if let Err(failure) = &result {
            let first_undispatched = failure.passes_dispatched * self.max_properties_per_pass as usize;
            for request in requests.iter().skip(first_undispatched) {
                request.pool.free_properties(&request.out_indices[..]);
            }
            log::debug!(
                "[PropertyPoolHandler] Returned slots of {} undispatched allocation requests",
                requests.len().saturating_sub(first_undispatched)
            );
        }
        result
    }

    /// Transfer a batch of requests, `max_properties_per_pass` per pass.
    ///
    /// Every pass shares one staging deadline of `now + max_wait`. The first
    /// failing pass stops the batch; passes before it stay dispatched.
    pub fn transfer_properties(
        &mut self,
        requests: &[TransferRequest<'_, D::Buffer>],
        max_wait: Duration,
    ) -> Result<Transfer<D::Fence>, TransferFailure<D::Fence>> {
        self.stats.calls += 1;

        for (i, request) in requests.iter().enumerate() {
            if let Err(reason) = request.validate() {
                let error = TransferError::InvalidRequest { request: i, reason };
                log::warn!("[PropertyPoolHandler] Rejected batch: {}", error);
                self.stats.record_failure(&error);
                return Err(TransferFailure::before_dispatch(error));
            }
        }

        let (sink, downloads) = crossbeam_channel::unbounded();
        if requests.is_empty() {
            return Ok(Transfer {
                fence: None,
                passes: 0,
                downloads,
            });
        }

        let deadline = Instant::now() + max_wait;
        let per_pass = self.max_properties_per_pass as usize;
        let mut fence = None;
        let mut passes = 0;

        for (pass, chunk) in requests.chunks(per_pass).enumerate() {
            match self.run_pass(chunk, pass * per_pass, deadline, max_wait, &sink) {
                Ok(pass_fence) => {
                    fence = Some(pass_fence);
                    passes += 1;
                }
                Err(error) => {
                    self.stats.record_failure(&error);
                    return Err(TransferFailure {
                        error,
                        passes_dispatched: passes,
                        fence,
                        downloads,
                    });
                }
            }
        }

        log::debug!(
            "[PropertyPoolHandler] Transferred {} requests in {} passes",
            requests.len(),
            passes
        );
        Ok(Transfer {
            fence,
            passes,
            downloads,
        })
    }

    /// Drain every fence-gated queue: both streaming buffers and all
    /// descriptor set caches. Returns the number of items reclaimed.
    pub fn reclaim(&mut self) -> usize {
        let mut reclaimed = self.driver.up_streaming_buffer().reclaim();
        reclaimed += self.driver.down_streaming_buffer().reclaim();
        for variant in self.pipelines.iter_mut() {
            reclaimed += variant.cache.drain();
        }
        if reclaimed > 0 {
            log::trace!("[PropertyPoolHandler] Reclaimed {} items", reclaimed);
        }
        reclaimed
    }

    /// Poll `fence` until it signals or `max_wait` passes, then reclaim.
    /// Returns whether the fence signaled.
    pub fn wait_for(&mut self, fence: &D::Fence, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let signaled = loop {
            if fence.is_signaled() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::yield_now();
        };
        self.reclaim();
        signaled
    }

    fn run_pass(
        &mut self,
        requests: &[TransferRequest<'_, D::Buffer>],
        first_request: usize,
        deadline: Instant,
        max_wait: Duration,
        sink: &Sender<StagedDownload>,
    ) -> TransferResult<D::Fence> {
        let driver = Arc::clone(&self.driver);
        let up = driver.up_streaming_buffer();
        let down = driver.down_streaming_buffer();

        self.header.encode(requests.iter().map(|request| HeaderEntry {
            indices: request.indices,
            property_size: request.property_size(),
            download: request.is_download(),
        }));

        self.upload_addresses.clear();
        self.upload_sizes.clear();
        self.download_addresses.clear();
        self.download_sizes.clear();

        self.upload_addresses.push(INVALID_ADDRESS);
        self.upload_sizes.push(self.header.byte_size());
        for request in requests {
            if request.is_download() {
                self.download_addresses.push(INVALID_ADDRESS);
                self.download_sizes.push(request.staging_size());
            } else {
                self.upload_addresses.push(INVALID_ADDRESS);
                self.upload_sizes.push(request.staging_size());
            }
        }

        if !up.multi_alloc(deadline, &mut self.upload_addresses, &self.upload_sizes, self.staging_alignment) {
            up.multi_free_now(&self.upload_addresses, &self.upload_sizes);
            return Err(self.staging_timeout(StagingRing::Upload, &self.upload_sizes, max_wait));
        }
        if !self.download_addresses.is_empty()
            && !down.multi_alloc(deadline, &mut self.download_addresses, &self.download_sizes, self.staging_alignment)
        {
            self.free_staging_now();
            return Err(self.staging_timeout(StagingRing::Download, &self.download_sizes, max_wait));
        }

        if let Err(e) = self.stage_uploads(requests) {
            self.free_staging_now();
            return Err(e.into());
        }

        let variant = self.pipelines.variant_mut(requests.len());
        driver.bind_compute_pipeline(&variant.pipeline);

        let created = variant.cache.created_count();
        let set = match variant.cache.get_next_set(
            &driver,
            requests,
            self.header.byte_size(),
            &self.upload_addresses,
            &self.download_addresses,
        ) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("[PropertyPoolHandler] Descriptor set acquisition failed: {}", e);
                self.free_staging_now();
                return Err(TransferError::DescriptorSetAcquisition(e));
            }
        };
        if variant.cache.created_count() > created {
            self.stats.descriptor_sets_created += 1;
        } else {
            self.stats.descriptor_sets_reused += 1;
        }

        driver.bind_descriptor_set(&variant.pipeline, &set);
        let workgroups = self.header.workgroups(self.workgroup_size);
        let fence = match driver
            .dispatch(workgroups, requests.len() as u32, 1)
            .and_then(|()| driver.place_fence())
        {
            Ok(fence) => fence,
            Err(e) => {
                variant.cache.recycle_unused(set);
                self.free_staging_now();
                return Err(e.into());
            }
        };

        up.multi_free(&self.upload_addresses, &self.upload_sizes, fence.clone());
        if !self.download_addresses.is_empty() {
            let mut staged = self.download_addresses.iter().zip(&self.download_sizes);
            let readbacks: Vec<ReadBack> = requests
                .iter()
                .enumerate()
                .filter(|(_, request)| request.is_download())
                .filter_map(|(i, request)| {
                    let (&address, &allocated) = staged.next()?;
                    Some(ReadBack {
                        address,
                        allocated,
                        len: request.byte_size() as u32,
                        request: first_request + i,
                    })
                })
                .collect();
            down.multi_free_with_readback(readbacks, fence.clone(), sink.clone());
        }
        variant.cache.release_set(fence.clone(), set);

        self.stats.passes += 1;
        for request in requests {
            let transfer_type = if request.is_download() {
                TransferType::Download
            } else {
                TransferType::Upload
            };
            self.stats
                .record_request(transfer_type, request.indices.len(), request.byte_size());
        }

        log::trace!(
            "[PropertyPoolHandler] Pass at request {}: {} properties, {} workgroups, header {} bytes",
            first_request,
            requests.len(),
            workgroups,
            self.header.byte_size()
        );
        Ok(fence)
    }

    /// Copy the header and every upload payload into their staging ranges
    fn stage_uploads(&self, requests: &[TransferRequest<'_, D::Buffer>]) -> DeviceResult<()> {
        let memory = self.driver.up_streaming_buffer().memory();
        memory.write(self.upload_addresses[0], self.header.as_bytes())?;

        let mut addresses = self.upload_addresses[1..].iter();
        for request in requests {
            if let TransferDirection::Upload(data) = request.direction {
                if let Some(&address) = addresses.next() {
                    memory.write(address, data)?;
                }
            }
        }
        Ok(())
    }

    /// Release this pass's staging ranges; nothing referenced them yet
    fn free_staging_now(&self) {
        self.driver
            .up_streaming_buffer()
            .multi_free_now(&self.upload_addresses, &self.upload_sizes);
        self.driver
            .down_streaming_buffer()
            .multi_free_now(&self.download_addresses, &self.download_sizes);
    }

    fn staging_timeout(&self, ring: StagingRing, sizes: &[u32], max_wait: Duration) -> TransferError {
        let error = TransferError::StagingTimeout {
            ring,
            bytes: sizes.iter().map(|&size| size as u64).sum(),
            waited: max_wait,
        };
        log::warn!("[PropertyPoolHandler] {}", error);
        error
    }
}
