//! Device capability interfaces
//!
//! The property pool handler never talks to a graphics API directly.
//! Everything it needs from the device (buffers, descriptor sets, compute
//! pipelines, dispatch and fences) is expressed through [`Driver`], so the
//! same pass scheduling runs on wgpu or on the host emulation.

use std::fmt::Debug;
use crate::error::DeviceResult;
use crate::memory::StreamingBuffer;
use super::shader::CopyShader;

/// Sentinel for a staging slot that holds no allocation
pub const INVALID_ADDRESS: u32 = u32::MAX;

/// GPU-to-host completion signal.
///
/// Clones share state: the caller, the streaming buffers and the
/// descriptor set caches all hold the same fence.
pub trait Fence: Clone + Debug {
    /// Non-blocking completion check
    fn is_signaled(&self) -> bool;
}

/// Host-visible staging memory behind a streaming buffer
pub trait StagingMemory {
    type Buffer;

    /// Buffer handle used when binding staged ranges
    fn buffer(&self) -> &Self::Buffer;

    fn size(&self) -> u32;

    /// Copy `data` into staging memory at `address`
    fn write(&self, address: u32, data: &[u8]) -> DeviceResult<()>;

    /// Copy staging memory at `address` into `out`
    fn read(&self, address: u32, out: &mut [u8]) -> DeviceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    StorageBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Compute,
}

/// One binding point of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    /// Array length of the binding
    pub count: u32,
    pub stage: ShaderStage,
}

/// Intended use of a buffer created through the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Backing store of a property pool
    PropertyStorage,
    UploadStaging,
    DownloadStaging,
}

/// Byte range of a buffer bound to one descriptor array element
pub struct BufferRange<'a, B> {
    pub buffer: &'a B,
    pub offset: u64,
    pub size: u64,
}

impl<B> Clone for BufferRange<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for BufferRange<'_, B> {}

/// Write of consecutive array elements of one binding
pub struct DescriptorWrite<'a, S, B> {
    pub set: &'a S,
    pub binding: u32,
    pub array_element: u32,
    pub ty: DescriptorType,
    pub buffers: &'a [BufferRange<'a, B>],
}

/// Graphics device as consumed by the transfer engine.
///
/// Binding and dispatch are stateful, immediate-style calls on the
/// submitting thread; `place_fence` marks everything recorded so far.
pub trait Driver {
    /// Cheap, shareable buffer handle
    type Buffer: Clone;
    type DescriptorSetLayout;
    type DescriptorSet;
    type Pipeline;
    type PipelineCache;
    type Fence: Fence;
    type Staging: StagingMemory<Buffer = Self::Buffer>;

    fn max_storage_buffer_bindings(&self) -> u32;

    /// Required alignment of storage buffer binding offsets
    fn min_storage_buffer_offset_alignment(&self) -> u32;

    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> DeviceResult<Self::Buffer>;

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> DeviceResult<Self::DescriptorSetLayout>;

    fn create_descriptor_set(&self, layout: &Self::DescriptorSetLayout) -> DeviceResult<Self::DescriptorSet>;

    fn update_descriptor_sets(
        &self,
        writes: &[DescriptorWrite<'_, Self::DescriptorSet, Self::Buffer>],
    ) -> DeviceResult<()>;

    fn create_compute_pipeline(
        &self,
        cache: Option<&Self::PipelineCache>,
        layout: &Self::DescriptorSetLayout,
        shader: &CopyShader,
    ) -> DeviceResult<Self::Pipeline>;

    fn bind_compute_pipeline(&self, pipeline: &Self::Pipeline);

    fn bind_descriptor_set(&self, pipeline: &Self::Pipeline, set: &Self::DescriptorSet);

    fn dispatch(&self, x: u32, y: u32, z: u32) -> DeviceResult<()>;

    /// Fence signaled once all previously recorded work completes
    fn place_fence(&self) -> DeviceResult<Self::Fence>;

    fn up_streaming_buffer(&self) -> &StreamingBuffer<Self::Staging, Self::Fence>;

    fn down_streaming_buffer(&self) -> &StreamingBuffer<Self::Staging, Self::Fence>;
}
