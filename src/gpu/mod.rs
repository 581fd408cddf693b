//! Device abstraction and backends
//!
//! [`driver`] defines what the transfer engine needs from a graphics
//! device, [`shader`] generates the copy kernel, and the backends implement
//! the driver on the host ([`cpu_driver`]) or on wgpu ([`wgpu_driver`]).

pub mod cpu_driver;
pub mod driver;
pub mod shader;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu_driver;

pub use cpu_driver::{CpuBuffer, CpuCommand, CpuDeviceLimits, CpuDriver, CpuFence, FenceMode};
pub use driver::{
    BufferRange, BufferUsage, DescriptorBinding, DescriptorType, DescriptorWrite, Driver, Fence,
    ShaderStage, StagingMemory, INVALID_ADDRESS,
};
pub use shader::CopyShader;
#[cfg(feature = "wgpu-backend")]
pub use wgpu_driver::{WgpuDriver, WgpuFence};
