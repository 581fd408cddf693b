//! Transfer and allocation requests, and what a transfer call returns

use std::fmt;
use crossbeam_channel::Receiver;
use thiserror::Error;
use crate::error::TransferError;
use crate::memory::{align_up, StagedDownload};
use crate::pool::PropertyPool;

/// Direction of a property transfer
#[derive(Clone, Copy)]
pub enum TransferDirection<'a> {
    /// Host bytes to pool slots; `indices.len() * property_size` bytes
    Upload(&'a [u8]),
    /// Pool slots to host, delivered through [`Transfer::downloads`]
    Download,
}

impl TransferDirection<'_> {
    pub fn is_download(&self) -> bool {
        matches!(self, TransferDirection::Download)
    }
}

impl fmt::Debug for TransferDirection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload(data) => write!(f, "Upload({} bytes)", data.len()),
            TransferDirection::Download => write!(f, "Download"),
        }
    }
}

/// Move one property of a set of pool slots in one direction
pub struct TransferRequest<'a, B> {
    pub pool: &'a dyn PropertyPool<B>,
    pub property: u32,
    /// Target slots; any order, duplicates allowed for downloads
    pub indices: &'a [u32],
    pub direction: TransferDirection<'a>,
}

impl<'a, B> TransferRequest<'a, B> {
    pub fn upload(pool: &'a dyn PropertyPool<B>, property: u32, indices: &'a [u32], data: &'a [u8]) -> Self {
        Self {
            pool,
            property,
            indices,
            direction: TransferDirection::Upload(data),
        }
    }

    pub fn download(pool: &'a dyn PropertyPool<B>, property: u32, indices: &'a [u32]) -> Self {
        Self {
            pool,
            property,
            indices,
            direction: TransferDirection::Download,
        }
    }

    pub fn is_download(&self) -> bool {
        self.direction.is_download()
    }

    pub fn property_size(&self) -> u32 {
        self.pool.property_size(self.property)
    }

    /// Bytes moved by this request
    pub fn byte_size(&self) -> u64 {
        self.indices.len() as u64 * self.property_size() as u64
    }

    /// Bytes reserved in a streaming buffer: whole words, at least one
    pub fn staging_size(&self) -> u32 {
        align_up(self.byte_size().max(4), 4) as u32
    }

    /// Check the request against its pool before any work is issued
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.property >= self.pool.property_count() {
            return Err(format!(
                "property {} out of range (pool has {})",
                self.property,
                self.pool.property_count()
            ));
        }

        let size = self.property_size();
        if size == 0 || size % 4 != 0 {
            return Err(format!("property size {} is not a non-zero multiple of 4", size));
        }

        let capacity = self.pool.capacity();
        if let Some(index) = self.indices.iter().find(|&&index| index >= capacity) {
            return Err(format!("index {} out of range (capacity {})", index, capacity));
        }

        if self.byte_size() > u32::MAX as u64 {
            return Err(format!("transfer of {} bytes exceeds 32-bit addressing", self.byte_size()));
        }

        if let TransferDirection::Upload(data) = self.direction {
            if data.len() as u64 != self.byte_size() {
                return Err(format!(
                    "upload data is {} bytes, expected {} ({} indices x {} bytes)",
                    data.len(),
                    self.byte_size(),
                    self.indices.len(),
                    size
                ));
            }
        }
        Ok(())
    }
}

impl<B> Clone for TransferRequest<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for TransferRequest<'_, B> {}

impl<B> fmt::Debug for TransferRequest<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("property", &self.property)
            .field("indices", &self.indices.len())
            .field("direction", &self.direction)
            .finish()
    }
}

/// Reserve fresh pool slots, then upload `data` into them
pub struct AllocationRequest<'a, B> {
    pub pool: &'a dyn PropertyPool<B>,
    pub property: u32,
    /// Receives the allocated slot indices; its length is the slot count
    pub out_indices: &'a mut [u32],
    pub data: &'a [u8],
}

impl<'a, B> AllocationRequest<'a, B> {
    pub fn new(pool: &'a dyn PropertyPool<B>, property: u32, out_indices: &'a mut [u32], data: &'a [u8]) -> Self {
        Self {
            pool,
            property,
            out_indices,
            data,
        }
    }

    /// Upload request over the allocated indices
    pub fn as_transfer(&self) -> TransferRequest<'_, B> {
        TransferRequest::upload(self.pool, self.property, &self.out_indices[..], self.data)
    }
}

/// A batch whose every pass was dispatched
#[derive(Debug)]
pub struct Transfer<F> {
    /// Fence of the last pass; `None` only for an empty batch
    pub fence: Option<F>,
    pub passes: usize,
    /// Download payloads, available once their pass's fence signaled and
    /// the handler reclaimed
    pub downloads: Receiver<StagedDownload>,
}

/// A batch that stopped at a failing pass.
///
/// Passes before the failing one were dispatched and are not rolled back.
#[derive(Debug, Error)]
#[error("{error} ({passes_dispatched} passes already dispatched)")]
pub struct TransferFailure<F: fmt::Debug> {
    #[source]
    pub error: TransferError,
    pub passes_dispatched: usize,
    /// Fence of the last dispatched pass
    pub fence: Option<F>,
    pub downloads: Receiver<StagedDownload>,
}

impl<F: fmt::Debug> TransferFailure<F> {
    pub(crate) fn before_dispatch(error: TransferError) -> Self {
        let (_, downloads) = crossbeam_channel::unbounded();
        Self {
            error,
            passes_dispatched: 0,
            fence: None,
            downloads,
        }
    }
}
