//! Host emulation backend
//!
//! Implements [`Driver`] on plain byte vectors. Dispatches run the copy
//! kernel on the calling thread, word for word, with the same header
//! decoding and redirection as the WGSL kernel. Fences can be held
//! unsignaled so fence-gated recycling can be observed step by step.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use crate::config::TransferConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::handler::header::{redirect, HeaderView};
use crate::memory::StreamingBuffer;
use super::driver::{
    BufferUsage, DescriptorBinding, DescriptorWrite, Driver, Fence, StagingMemory,
};
use super::shader::{CopyShader, HEADER_BINDING, INPUT_BINDING, OUTPUT_BINDING};

/// Shared host buffer; clones alias the same bytes
#[derive(Clone)]
pub struct CpuBuffer {
    id: u64,
    label: Arc<str>,
    data: Arc<RwLock<Vec<u8>>>,
}

impl CpuBuffer {
    pub fn new(id: u64, label: &str, len: usize) -> Self {
        Self {
            id,
            label: Arc::from(label),
            data: Arc::new(RwLock::new(vec![0; len])),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: u64, len: usize) -> DeviceResult<Vec<u8>> {
        let data = self.data.read();
        let range = self.checked_range(offset, len as u64, data.len())?;
        Ok(data[range].to_vec())
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> DeviceResult<()> {
        let mut data = self.data.write();
        let range = self.checked_range(offset, bytes.len() as u64, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Whole contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn aliases(&self, other: &CpuBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    fn checked_range(&self, offset: u64, len: u64, size: usize) -> DeviceResult<std::ops::Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= size as u64);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(DeviceError::OutOfRange {
                buffer: self.label.to_string(),
                offset,
                len,
                size: size as u64,
            }),
        }
    }
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

/// Host fence; clones share the signaled flag
#[derive(Debug, Clone)]
pub struct CpuFence {
    id: u64,
    signaled: Arc<AtomicBool>,
}

impl CpuFence {
    pub fn new(id: u64, signaled: bool) -> Self {
        Self {
            id,
            signaled: Arc::new(AtomicBool::new(signaled)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }
}

impl Fence for CpuFence {
    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// Staging memory on a host buffer
pub struct CpuStaging {
    buffer: CpuBuffer,
}

impl CpuStaging {
    pub fn new(buffer: CpuBuffer) -> Self {
        Self { buffer }
    }
}

impl StagingMemory for CpuStaging {
    type Buffer = CpuBuffer;

    fn buffer(&self) -> &CpuBuffer {
        &self.buffer
    }

    fn size(&self) -> u32 {
        self.buffer.len() as u32
    }

    fn write(&self, address: u32, data: &[u8]) -> DeviceResult<()> {
        self.buffer.write(address as u64, data)
    }

    fn read(&self, address: u32, out: &mut [u8]) -> DeviceResult<()> {
        let bytes = self.buffer.read(address as u64, out.len())?;
        out.copy_from_slice(&bytes);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CpuSetLayout {
    bindings: Vec<DescriptorBinding>,
}

impl CpuSetLayout {
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

#[derive(Debug, Clone)]
struct BoundRange {
    buffer: CpuBuffer,
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct SetState {
    id: u64,
    /// Per binding, per array element
    slots: Mutex<Vec<Vec<Option<BoundRange>>>>,
}

/// Descriptor set recording the ranges written into it
#[derive(Debug, Clone)]
pub struct CpuDescriptorSet {
    state: Arc<SetState>,
}

impl CpuDescriptorSet {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Buffer id, offset and size bound at `binding[element]`
    pub fn bound(&self, binding: u32, element: u32) -> Option<(u64, u64, u64)> {
        let slots = self.state.slots.lock();
        let range = slots.get(binding as usize)?.get(element as usize)?.as_ref()?;
        Some((range.buffer.id(), range.offset, range.size))
    }

    fn range(&self, binding: u32, element: u32) -> DeviceResult<BoundRange> {
        let slots = self.state.slots.lock();
        slots
            .get(binding as usize)
            .and_then(|elements| elements.get(element as usize))
            .and_then(|slot| slot.clone())
            .ok_or(DeviceError::IncompleteDescriptorSet { binding, element })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPipeline {
    pub id: u64,
    pub property_count: u32,
    pub workgroup_size: u32,
}

/// Recorded device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuCommand {
    BindPipeline { property_count: u32 },
    BindDescriptorSet { set: u64 },
    Dispatch { x: u32, y: u32, z: u32, property_count: u32, set: u64 },
    PlaceFence { fence: u64 },
}

/// When fences placed by the driver signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Work completes before `place_fence` returns
    Immediate,
    /// Fences stay pending until `signal` / `signal_all`
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDeviceLimits {
    pub max_storage_buffer_bindings: u32,
    pub min_storage_buffer_offset_alignment: u32,
}

impl Default for CpuDeviceLimits {
    fn default() -> Self {
        Self {
            max_storage_buffer_bindings: 8,
            min_storage_buffer_offset_alignment: 256,
        }
    }
}

#[derive(Default)]
struct Recording {
    pipeline: Option<CpuPipeline>,
    set: Option<CpuDescriptorSet>,
}

pub struct CpuDriver {
    limits: CpuDeviceLimits,
    fence_mode: FenceMode,
    next_id: AtomicU64,
    recording: Mutex<Recording>,
    commands: Mutex<Vec<CpuCommand>>,
    pending_fences: Mutex<Vec<CpuFence>>,
    failing_descriptor_sets: AtomicUsize,
    up: StreamingBuffer<CpuStaging, CpuFence>,
    down: StreamingBuffer<CpuStaging, CpuFence>,
}

impl CpuDriver {
    pub fn new(limits: CpuDeviceLimits, config: &TransferConfig, fence_mode: FenceMode) -> Self {
        let up = CpuStaging::new(CpuBuffer::new(1, "upload streaming buffer", config.upload_ring_size as usize));
        let down = CpuStaging::new(CpuBuffer::new(2, "download streaming buffer", config.download_ring_size as usize));

        log::info!(
            "[CpuDriver] Created host device ({} storage bindings, {} byte offset alignment, {:?} fences)",
            limits.max_storage_buffer_bindings,
            limits.min_storage_buffer_offset_alignment,
            fence_mode
        );

        Self {
            limits,
            fence_mode,
            next_id: AtomicU64::new(3),
            recording: Mutex::new(Recording::default()),
            commands: Mutex::new(Vec::new()),
            pending_fences: Mutex::new(Vec::new()),
            failing_descriptor_sets: AtomicUsize::new(0),
            up: StreamingBuffer::new(up, config.allocation_strategy),
            down: StreamingBuffer::new(down, config.allocation_strategy),
        }
    }

    pub fn fence_mode(&self) -> FenceMode {
        self.fence_mode
    }

    /// Signal every fence placed so far
    pub fn signal_all(&self) {
        for fence in self.pending_fences.lock().drain(..) {
            fence.signal();
        }
    }

    pub fn signal(&self, fence: &CpuFence) {
        fence.signal();
        self.pending_fences.lock().retain(|pending| pending.id() != fence.id());
    }

    pub fn pending_fences(&self) -> usize {
        self.pending_fences.lock().len()
    }

    pub fn commands(&self) -> Vec<CpuCommand> {
        self.commands.lock().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|command| matches!(command, CpuCommand::Dispatch { .. }))
            .count()
    }

    /// Make the next `count` descriptor set creations fail
    pub fn fail_next_descriptor_sets(&self, count: usize) {
        self.failing_descriptor_sets.store(count, Ordering::Relaxed);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, command: CpuCommand) {
        self.commands.lock().push(command);
    }

    /// Run one property's slice of the copy kernel
    fn run_property(
        &self,
        header: &HeaderView<'_>,
        set: &CpuDescriptorSet,
        prop: u32,
        invocations: u32,
    ) -> DeviceResult<()> {
        let not_in_header = || DeviceError::Backend(format!("header has no entry for property {}", prop));
        let count = header.element_count(prop).ok_or_else(not_in_header)?;
        let (dwords, download) = header.dwords(prop).ok_or_else(not_in_header)?;
        let index_offset = header.index_offset(prop).ok_or_else(not_in_header)?;
        if dwords == 0 {
            return Ok(());
        }

        let input = set.range(INPUT_BINDING, prop)?;
        let output = set.range(OUTPUT_BINDING, prop)?;
        let source = input.buffer.read(input.offset, input.size as usize)?;

        let mut data = output.buffer.data.write();
        let out_end = output.offset + output.size;
        if out_end > data.len() as u64 {
            return Err(DeviceError::OutOfRange {
                buffer: output.buffer.label().to_string(),
                offset: output.offset,
                len: output.size,
                size: data.len() as u64,
            });
        }

        for g in 0..invocations {
            let index = g / dwords;
            if index >= count {
                break;
            }
            let slot = index_offset
                .checked_add(index)
                .and_then(|i| header.index(i))
                .ok_or_else(not_in_header)?;
            let redir = redirect(slot, index, dwords, g);
            let (in_word, out_word) = if download { (redir, g) } else { (g, redir) };

            let src = in_word as u64 * 4;
            if src + 4 > input.size {
                return Err(DeviceError::OutOfRange {
                    buffer: input.buffer.label().to_string(),
                    offset: input.offset + src,
                    len: 4,
                    size: input.size,
                });
            }
            let dst = out_word as u64 * 4;
            if dst + 4 > output.size {
                return Err(DeviceError::OutOfRange {
                    buffer: output.buffer.label().to_string(),
                    offset: output.offset + dst,
                    len: 4,
                    size: output.size,
                });
            }

            let dst = (output.offset + dst) as usize;
            let src = src as usize;
            data[dst..dst + 4].copy_from_slice(&source[src..src + 4]);
        }
        Ok(())
    }
}

impl Driver for CpuDriver {
    type Buffer = CpuBuffer;
    type DescriptorSetLayout = CpuSetLayout;
    type DescriptorSet = CpuDescriptorSet;
    type Pipeline = CpuPipeline;
    type PipelineCache = ();
    type Fence = CpuFence;
    type Staging = CpuStaging;

    fn max_storage_buffer_bindings(&self) -> u32 {
        self.limits.max_storage_buffer_bindings
    }

    fn min_storage_buffer_offset_alignment(&self) -> u32 {
        self.limits.min_storage_buffer_offset_alignment
    }

    fn create_buffer(&self, label: &str, size: u64, _usage: BufferUsage) -> DeviceResult<CpuBuffer> {
        let len = usize::try_from(size)
            .map_err(|_| DeviceError::Unsupported(format!("buffer '{}' of {} bytes", label, size)))?;
        Ok(CpuBuffer::new(self.next_id(), label, len))
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> DeviceResult<CpuSetLayout> {
        let storage: u32 = bindings.iter().map(|b| b.count).sum();
        if storage > self.limits.max_storage_buffer_bindings {
            return Err(DeviceError::Unsupported(format!(
                "layout uses {} storage buffers, device allows {}",
                storage, self.limits.max_storage_buffer_bindings
            )));
        }
        Ok(CpuSetLayout {
            bindings: bindings.to_vec(),
        })
    }

    fn create_descriptor_set(&self, layout: &CpuSetLayout) -> DeviceResult<CpuDescriptorSet> {
        let failing = self.failing_descriptor_sets.load(Ordering::Relaxed);
        if failing > 0 {
            self.failing_descriptor_sets.store(failing - 1, Ordering::Relaxed);
            return Err(DeviceError::Backend("descriptor pool exhausted".to_string()));
        }

        let mut slots = Vec::new();
        for binding in &layout.bindings {
            let index = binding.binding as usize;
            if slots.len() <= index {
                slots.resize(index + 1, Vec::new());
            }
            slots[index] = vec![None; binding.count as usize];
        }
        Ok(CpuDescriptorSet {
            state: Arc::new(SetState {
                id: self.next_id(),
                slots: Mutex::new(slots),
            }),
        })
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_, CpuDescriptorSet, CpuBuffer>]) -> DeviceResult<()> {
        for write in writes {
            let mut slots = write.set.state.slots.lock();
            for (i, range) in write.buffers.iter().enumerate() {
                let element = write.array_element + i as u32;
                let slot = slots
                    .get_mut(write.binding as usize)
                    .and_then(|elements| elements.get_mut(element as usize))
                    .ok_or_else(|| {
                        DeviceError::Backend(format!(
                            "binding {} element {} not in layout",
                            write.binding, element
                        ))
                    })?;

                let size = range.buffer.len() as u64;
                if range.offset + range.size > size {
                    return Err(DeviceError::OutOfRange {
                        buffer: range.buffer.label().to_string(),
                        offset: range.offset,
                        len: range.size,
                        size,
                    });
                }
                *slot = Some(BoundRange {
                    buffer: range.buffer.clone(),
                    offset: range.offset,
                    size: range.size,
                });
            }
        }
        Ok(())
    }

    fn create_compute_pipeline(
        &self,
        _cache: Option<&()>,
        layout: &CpuSetLayout,
        shader: &CopyShader,
    ) -> DeviceResult<CpuPipeline> {
        let matches_layout = layout
            .bindings
            .iter()
            .filter(|b| b.binding != HEADER_BINDING)
            .all(|b| b.count == shader.property_count);
        if !matches_layout {
            return Err(DeviceError::Unsupported(format!(
                "layout does not match a {}-property copy shader",
                shader.property_count
            )));
        }
        Ok(CpuPipeline {
            id: self.next_id(),
            property_count: shader.property_count,
            workgroup_size: shader.workgroup_size,
        })
    }

    fn bind_compute_pipeline(&self, pipeline: &CpuPipeline) {
        self.recording.lock().pipeline = Some(*pipeline);
        self.record(CpuCommand::BindPipeline {
            property_count: pipeline.property_count,
        });
    }

    fn bind_descriptor_set(&self, _pipeline: &CpuPipeline, set: &CpuDescriptorSet) {
        self.recording.lock().set = Some(set.clone());
        self.record(CpuCommand::BindDescriptorSet { set: set.id() });
    }

    fn dispatch(&self, x: u32, y: u32, z: u32) -> DeviceResult<()> {
        let (pipeline, set) = {
            let recording = self.recording.lock();
            let pipeline = recording.pipeline.ok_or(DeviceError::NotBound("compute pipeline"))?;
            let set = recording.set.clone().ok_or(DeviceError::NotBound("descriptor set"))?;
            (pipeline, set)
        };
        self.record(CpuCommand::Dispatch {
            x,
            y,
            z,
            property_count: pipeline.property_count,
            set: set.id(),
        });

        let header_range = set.range(HEADER_BINDING, 0)?;
        let header_bytes = header_range.buffer.read(header_range.offset, header_range.size as usize)?;
        let words: Vec<u32> = header_bytes
            .chunks_exact(4)
            .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            .collect();
        let header = HeaderView::new(&words, pipeline.property_count);

        let invocations = x.saturating_mul(pipeline.workgroup_size);
        for _ in 0..z {
            for prop in 0..y.min(pipeline.property_count) {
                self.run_property(&header, &set, prop, invocations)?;
            }
        }
        log::trace!("[CpuDriver] Dispatched {}x{}x{} on set {}", x, y, z, set.id());
        Ok(())
    }

    fn place_fence(&self) -> DeviceResult<CpuFence> {
        let fence = CpuFence::new(self.next_id(), self.fence_mode == FenceMode::Immediate);
        if self.fence_mode == FenceMode::Manual {
            self.pending_fences.lock().push(fence.clone());
        }
        self.record(CpuCommand::PlaceFence { fence: fence.id() });
        Ok(fence)
    }

    fn up_streaming_buffer(&self) -> &StreamingBuffer<CpuStaging, CpuFence> {
        &self.up
    }

    fn down_streaming_buffer(&self) -> &StreamingBuffer<CpuStaging, CpuFence> {
        &self.down
    }
}
