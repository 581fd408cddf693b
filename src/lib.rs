//! GPU property pool transfer engine
//!
//! Moves per-element property data between host memory and
//! structure-of-arrays GPU pools. Requests are batched into compute passes
//! that scatter uploaded words into pool slots, or gather pool slots into
//! download staging, through an index redirection table.

pub mod config;
pub mod error;
pub mod gpu;
pub mod handler;
pub mod memory;
pub mod pool;

pub use config::TransferConfig;
pub use error::{
    ConfigError, ConfigResult, DeviceError, DeviceErrorContext, DeviceResult, StagingRing, TransferError,
    TransferResult,
};
pub use gpu::{CpuDeviceLimits, CpuDriver, CpuFence, Driver, Fence, FenceMode};
#[cfg(feature = "wgpu-backend")]
pub use gpu::{WgpuDriver, WgpuFence};
pub use handler::{AllocationRequest, PropertyPoolHandler, Transfer, TransferDirection, TransferFailure, TransferRequest};
pub use memory::{AllocationStrategy, StagedDownload, TransferStats, TransferType};
pub use pool::{PropertyPool, SoaPropertyPool};
