//! wgpu backend
//!
//! Arrayed descriptor bindings are flattened to consecutive binding
//! numbers (see [`flattened_binding`]). Work is recorded into one command
//! encoder that `place_fence` submits; the returned fence flips once the
//! queue reports the submission done.

use std::borrow::Cow;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use crate::config::TransferConfig;
use crate::error::{DeviceError, DeviceErrorContext, DeviceResult};
use crate::memory::{align_up, StreamingBuffer};
use super::driver::{
    BufferUsage, DescriptorBinding, DescriptorWrite, Driver, Fence, StagingMemory,
};
use super::shader::{flattened_binding, CopyShader, INPUT_BINDING};

/// Fence backed by `Queue::on_submitted_work_done`
#[derive(Clone)]
pub struct WgpuFence {
    signaled: Arc<AtomicBool>,
    device: Arc<wgpu::Device>,
}

impl WgpuFence {
    /// Block until the fence signals
    pub fn wait(&self) {
        while !self.signaled.load(Ordering::Acquire) {
            self.device.poll(wgpu::Maintain::Wait);
        }
    }
}

impl Fence for WgpuFence {
    fn is_signaled(&self) -> bool {
        if self.signaled.load(Ordering::Acquire) {
            return true;
        }
        self.device.poll(wgpu::Maintain::Poll);
        self.signaled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WgpuFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuFence")
            .field("signaled", &self.signaled.load(Ordering::Relaxed))
            .finish()
    }
}

/// Streaming buffer memory on a storage buffer
pub struct WgpuStaging {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffer: Arc<wgpu::Buffer>,
    size: u32,
}

impl StagingMemory for WgpuStaging {
    type Buffer = Arc<wgpu::Buffer>;

    fn buffer(&self) -> &Arc<wgpu::Buffer> {
        &self.buffer
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn write(&self, address: u32, data: &[u8]) -> DeviceResult<()> {
        check_range("staging", address as u64, data.len() as u64, self.size as u64)?;
        self.queue.write_buffer(&self.buffer, address as u64, data);
        Ok(())
    }

    fn read(&self, address: u32, out: &mut [u8]) -> DeviceResult<()> {
        check_range("staging", address as u64, out.len() as u64, self.size as u64)?;
        let bytes = read_buffer_range(&self.device, &self.queue, &self.buffer, address as u64, out.len() as u64)?;
        out.copy_from_slice(&bytes);
        Ok(())
    }
}

pub struct WgpuSetLayout {
    layout: Arc<wgpu::BindGroupLayout>,
    property_count: u32,
}

struct SetState {
    id: u64,
    layout: Arc<wgpu::BindGroupLayout>,
    property_count: u32,
    /// Indexed by flattened binding number
    slots: Mutex<Vec<Option<(Arc<wgpu::Buffer>, u64, u64)>>>,
    bind_group: Mutex<Option<Arc<wgpu::BindGroup>>>,
}

/// Descriptor set materialized as a bind group once every slot is written
#[derive(Clone)]
pub struct WgpuDescriptorSet {
    state: Arc<SetState>,
}

impl WgpuDescriptorSet {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    fn bind_group(&self, driver: &WgpuDriver) -> DeviceResult<Arc<wgpu::BindGroup>> {
        let mut cached = self.state.bind_group.lock();
        if let Some(group) = cached.as_ref() {
            return Ok(group.clone());
        }

        let slots = self.state.slots.lock();
        let n = self.state.property_count;
        let mut entries = Vec::with_capacity(slots.len());
        for (flat, slot) in slots.iter().enumerate() {
            let Some((buffer, offset, size)) = slot else {
                let flat = flat as u32;
                let (binding, element) = match flat {
                    0 => (0, 0),
                    f if f <= n => (1, f - 1),
                    f => (2, f - 1 - n),
                };
                return Err(DeviceError::IncompleteDescriptorSet { binding, element });
            };
            entries.push(wgpu::BindGroupEntry {
                binding: flat as u32,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: *offset,
                    size: NonZeroU64::new(*size),
                }),
            });
        }

        let group = driver.validated("create_bind_group", || {
            Arc::new(driver.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Property Copy Bind Group"),
                layout: &self.state.layout,
                entries: &entries,
            }))
        })?;
        *cached = Some(group.clone());
        Ok(group)
    }
}

#[derive(Default)]
struct Recording {
    encoder: Option<wgpu::CommandEncoder>,
    pipeline: Option<Arc<wgpu::ComputePipeline>>,
    bind_group: Option<Arc<wgpu::BindGroup>>,
    bind_error: Option<DeviceError>,
}

pub struct WgpuDriver {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    next_set_id: AtomicU64,
    recording: Mutex<Recording>,
    up: StreamingBuffer<WgpuStaging, WgpuFence>,
    down: StreamingBuffer<WgpuStaging, WgpuFence>,
}

impl WgpuDriver {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: &TransferConfig) -> DeviceResult<Self> {
        let staging = |label: &str, size: u32| WgpuStaging {
            device: device.clone(),
            queue: queue.clone(),
            buffer: Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })),
            size,
        };
        let up = staging("Upload Streaming Buffer", config.upload_ring_size);
        let down = staging("Download Streaming Buffer", config.download_ring_size);

        let limits = device.limits();
        log::info!(
            "[WgpuDriver] Initialized ({} storage buffers per stage, {} byte offset alignment)",
            limits.max_storage_buffers_per_shader_stage,
            limits.min_storage_buffer_offset_alignment
        );

        Ok(Self {
            device,
            queue,
            next_set_id: AtomicU64::new(0),
            recording: Mutex::new(Recording::default()),
            up: StreamingBuffer::new(up, config.allocation_strategy),
            down: StreamingBuffer::new(down, config.allocation_strategy),
        })
    }

    /// Headless device on the default adapter, with the adapter's limits
    pub fn request_default(config: &TransferConfig) -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| DeviceError::Unsupported("no suitable adapter".to_string()))?;

        log::info!("[WgpuDriver] Using adapter {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Property Transfer Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .device_context("request_device")?;

        Self::new(Arc::new(device), Arc::new(queue), config)
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Blocking read of `len` bytes at `offset`
    pub fn read_buffer(&self, buffer: &wgpu::Buffer, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        read_buffer_range(&self.device, &self.queue, buffer, offset, len)
    }

    /// Queue a write; visible to work submitted afterwards
    pub fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> DeviceResult<()> {
        check_range("buffer", offset, data.len() as u64, buffer.size())?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    /// Run `f` inside a validation error scope
    fn validated<T>(&self, what: &str, f: impl FnOnce() -> T) -> DeviceResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(DeviceError::Backend(format!("{}: {}", what, error))),
            None => Ok(value),
        }
    }
}

impl Driver for WgpuDriver {
    type Buffer = Arc<wgpu::Buffer>;
    type DescriptorSetLayout = WgpuSetLayout;
    type DescriptorSet = WgpuDescriptorSet;
    type Pipeline = Arc<wgpu::ComputePipeline>;
    type PipelineCache = ();
    type Fence = WgpuFence;
    type Staging = WgpuStaging;

    fn max_storage_buffer_bindings(&self) -> u32 {
        self.device.limits().max_storage_buffers_per_shader_stage
    }

    fn min_storage_buffer_offset_alignment(&self) -> u32 {
        self.device.limits().min_storage_buffer_offset_alignment
    }

    fn create_buffer(&self, label: &str, size: u64, _usage: BufferUsage) -> DeviceResult<Arc<wgpu::Buffer>> {
        // Pools and staging rings are all bound as storage and copied from
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        self.validated("create_buffer", || {
            Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: align_up(size, wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            }))
        })
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> DeviceResult<WgpuSetLayout> {
        let property_count = bindings
            .iter()
            .find(|b| b.binding == INPUT_BINDING)
            .map(|b| b.count)
            .unwrap_or(0);

        let mut entries = Vec::new();
        for binding in bindings {
            for element in 0..binding.count {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: flattened_binding(binding.binding, element, property_count),
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                });
            }
        }

        let limit = self.max_storage_buffer_bindings() as usize;
        if entries.len() > limit {
            return Err(DeviceError::Unsupported(format!(
                "layout uses {} storage buffers, device allows {}",
                entries.len(),
                limit
            )));
        }

        let layout = self.validated("create_bind_group_layout", || {
            self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Property Copy Layout"),
                entries: &entries,
            })
        })?;
        Ok(WgpuSetLayout {
            layout: Arc::new(layout),
            property_count,
        })
    }

    fn create_descriptor_set(&self, layout: &WgpuSetLayout) -> DeviceResult<WgpuDescriptorSet> {
        let slots = 1 + 2 * layout.property_count as usize;
        Ok(WgpuDescriptorSet {
            state: Arc::new(SetState {
                id: self.next_set_id.fetch_add(1, Ordering::Relaxed),
                layout: layout.layout.clone(),
                property_count: layout.property_count,
                slots: Mutex::new(vec![None; slots]),
                bind_group: Mutex::new(None),
            }),
        })
    }

    fn update_descriptor_sets(
        &self,
        writes: &[DescriptorWrite<'_, WgpuDescriptorSet, Arc<wgpu::Buffer>>],
    ) -> DeviceResult<()> {
        let max_binding_size = self.device.limits().max_storage_buffer_binding_size as u64;
        for write in writes {
            let state = &write.set.state;
            let mut slots = state.slots.lock();
            for (i, range) in write.buffers.iter().enumerate() {
                let element = write.array_element + i as u32;
                let flat = flattened_binding(write.binding, element, state.property_count) as usize;
                check_range("binding", range.offset, range.size, range.buffer.size())?;
                if range.size > max_binding_size {
                    return Err(DeviceError::Unsupported(format!(
                        "binding {} element {} spans {} bytes, device allows {}",
                        write.binding, element, range.size, max_binding_size
                    )));
                }
                let slot = slots.get_mut(flat).ok_or_else(|| {
                    DeviceError::Backend(format!("binding {} element {} not in layout", write.binding, element))
                })?;
                *slot = Some((range.buffer.clone(), range.offset, range.size));
            }
            *state.bind_group.lock() = None;
        }
        Ok(())
    }

    fn create_compute_pipeline(
        &self,
        _cache: Option<&()>,
        layout: &WgpuSetLayout,
        shader: &CopyShader,
    ) -> DeviceResult<Arc<wgpu::ComputePipeline>> {
        let label = format!("Property Copy x{}", shader.property_count);
        self.validated("create_compute_pipeline", || {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label.as_str()),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(&shader.source)),
            });
            let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label.as_str()),
                bind_group_layouts: &[&layout.layout],
                push_constant_ranges: &[],
            });
            Arc::new(self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label.as_str()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: shader.entry_point(),
            }))
        })
    }

    fn bind_compute_pipeline(&self, pipeline: &Arc<wgpu::ComputePipeline>) {
        self.recording.lock().pipeline = Some(pipeline.clone());
    }

    fn bind_descriptor_set(&self, _pipeline: &Arc<wgpu::ComputePipeline>, set: &WgpuDescriptorSet) {
        let mut recording = self.recording.lock();
        match set.bind_group(self) {
            Ok(group) => {
                recording.bind_group = Some(group);
                recording.bind_error = None;
            }
            Err(e) => {
                log::warn!("[WgpuDriver] Cannot bind descriptor set {}: {}", set.id(), e);
                recording.bind_group = None;
                recording.bind_error = Some(e);
            }
        }
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) -> DeviceResult<()> {
        let mut recording = self.recording.lock();
        if let Some(e) = recording.bind_error.take() {
            return Err(e);
        }
        let pipeline = recording.pipeline.clone().ok_or(DeviceError::NotBound("compute pipeline"))?;
        let bind_group = recording.bind_group.clone().ok_or(DeviceError::NotBound("descriptor set"))?;

        let device = &self.device;
        let encoder = recording.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Property Transfer Encoder"),
            })
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Property Copy Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        Ok(())
    }

    fn place_fence(&self) -> DeviceResult<WgpuFence> {
        let encoder = self.recording.lock().encoder.take();
        let encoder = encoder.unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Property Transfer Fence"),
            })
        });
        self.queue.submit(Some(encoder.finish()));

        let signaled = Arc::new(AtomicBool::new(false));
        let flag = signaled.clone();
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));

        Ok(WgpuFence {
            signaled,
            device: self.device.clone(),
        })
    }

    fn up_streaming_buffer(&self) -> &StreamingBuffer<WgpuStaging, WgpuFence> {
        &self.up
    }

    fn down_streaming_buffer(&self) -> &StreamingBuffer<WgpuStaging, WgpuFence> {
        &self.down
    }
}

fn check_range(what: &str, offset: u64, len: u64, size: u64) -> DeviceResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfRange {
            buffer: what.to_string(),
            offset,
            len,
            size,
        }),
    }
}

/// Copy a range into a mappable buffer and read it back, blocking
fn read_buffer_range(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: u64,
    len: u64,
) -> DeviceResult<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let copy_len = align_up(len, wgpu::COPY_BUFFER_ALIGNMENT);
    check_range("read-back source", offset, copy_len, buffer.size())?;

    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Read-back Buffer"),
        size: copy_len,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Read-back Encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, offset, &readback, 0, copy_len);
    queue.submit(Some(encoder.finish()));

    let buffer_slice = readback.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // Receiver only goes away if this function already returned
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    pollster::block_on(rx)
        .device_context("read-back channel closed")?
        .device_context("map read-back buffer")?;

    let data = buffer_slice.get_mapped_range()[..len as usize].to_vec();
    readback.unmap();
    Ok(data)
}
