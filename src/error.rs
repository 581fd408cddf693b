//! Error types for the property pool transfer engine
//!
//! Device backends report [`DeviceError`], the handler reports
//! [`TransferError`], and configuration loading reports [`ConfigError`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which shared streaming buffer an allocation was made from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingRing {
    Upload,
    Download,
}

impl fmt::Display for StagingRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagingRing::Upload => write!(f, "upload"),
            StagingRing::Download => write!(f, "download"),
        }
    }
}

/// Errors raised by a device backend
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("access of {len} bytes at offset {offset} exceeds '{buffer}' ({size} bytes)")]
    OutOfRange {
        buffer: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("descriptor set incomplete: binding {binding} element {element} was never written")]
    IncompleteDescriptorSet { binding: u32, element: u32 },

    #[error("no {0} bound before dispatch")]
    NotBound(&'static str),

    #[error("unsupported device: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Helper trait for attaching context to backend failures
pub trait DeviceErrorContext<T> {
    fn device_context(self, context: &str) -> DeviceResult<T>;
}

impl<T, E> DeviceErrorContext<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn device_context(self, context: &str) -> DeviceResult<T> {
        self.map_err(|e| DeviceError::Backend(format!("{}: {}", context, e)))
    }
}

impl<T> DeviceErrorContext<T> for Option<T> {
    fn device_context(self, context: &str) -> DeviceResult<T> {
        self.ok_or_else(|| DeviceError::Backend(format!("{}: missing value", context)))
    }
}

/// Errors raised by `add_properties` / `transfer_properties`
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("property pool could not reserve {requested} slots for request {request}")]
    PoolAllocation { request: usize, requested: usize },

    #[error("{ring} staging allocation of {bytes} bytes not satisfied within {waited:?}")]
    StagingTimeout {
        ring: StagingRing,
        bytes: u64,
        waited: Duration,
    },

    #[error("descriptor set acquisition failed: {0}")]
    DescriptorSetAcquisition(#[source] DeviceError),

    #[error("request {request} is invalid: {reason}")]
    InvalidRequest { request: usize, reason: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for handler operations that do not dispatch
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors raised while loading a [`crate::config::TransferConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;
