/// Transfer statistics
///
/// Running counters kept by the property pool handler: how much data moved
/// in which direction, how many passes it took, and how well the
/// descriptor set caches are being reused.

use std::collections::HashMap;
use crate::error::TransferError;

/// Type of staged transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    /// Host to pool
    Upload,
    /// Pool to host
    Download,
}

/// Failure categories, mirroring [`TransferError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    PoolAllocation,
    StagingTimeout,
    DescriptorSet,
    InvalidRequest,
    Device,
}

impl From<&TransferError> for FailureKind {
    fn from(error: &TransferError) -> Self {
        match error {
            TransferError::PoolAllocation { .. } => FailureKind::PoolAllocation,
            TransferError::StagingTimeout { .. } => FailureKind::StagingTimeout,
            TransferError::DescriptorSetAcquisition(_) => FailureKind::DescriptorSet,
            TransferError::InvalidRequest { .. } => FailureKind::InvalidRequest,
            TransferError::Device(_) => FailureKind::Device,
        }
    }
}

/// Per-direction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeMetrics {
    pub bytes: u64,
    pub requests: u64,
    pub elements: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Calls to `transfer_properties` (including via `add_properties`)
    pub calls: u64,
    /// Compute dispatches issued
    pub passes: u64,
    pub descriptor_sets_created: u64,
    pub descriptor_sets_reused: u64,
    by_type: HashMap<TransferType, TypeMetrics>,
    failures: HashMap<FailureKind, u64>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self, transfer_type: TransferType, elements: usize, bytes: u64) {
        let entry = self.by_type.entry(transfer_type).or_default();
        entry.requests += 1;
        entry.elements += elements as u64;
        entry.bytes += bytes;
    }

    pub fn record_failure(&mut self, error: &TransferError) {
        *self.failures.entry(FailureKind::from(error)).or_insert(0) += 1;
    }

    pub fn metrics(&self, transfer_type: TransferType) -> TypeMetrics {
        self.by_type.get(&transfer_type).copied().unwrap_or_default()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.metrics(TransferType::Upload).bytes
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.metrics(TransferType::Download).bytes
    }

    pub fn failures(&self, kind: FailureKind) -> u64 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    /// Share of descriptor set acquisitions served from the cache
    pub fn descriptor_reuse_ratio(&self) -> f64 {
        let total = self.descriptor_sets_created + self.descriptor_sets_reused;
        if total == 0 {
            0.0
        } else {
            self.descriptor_sets_reused as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::error::StagingRing;

    #[test]
    fn test_counters_by_direction() {
        let mut stats = TransferStats::new();
        stats.record_request(TransferType::Upload, 3, 12);
        stats.record_request(TransferType::Upload, 1, 4);
        stats.record_request(TransferType::Download, 2, 16);

        assert_eq!(stats.bytes_uploaded(), 16);
        assert_eq!(stats.metrics(TransferType::Upload).requests, 2);
        assert_eq!(stats.bytes_downloaded(), 16);
    }

    #[test]
    fn test_failure_kinds() {
        let mut stats = TransferStats::new();
        stats.record_failure(&TransferError::StagingTimeout {
            ring: StagingRing::Upload,
            bytes: 4,
            waited: Duration::ZERO,
        });
        assert_eq!(stats.failures(FailureKind::StagingTimeout), 1);
        assert_eq!(stats.failures(FailureKind::PoolAllocation), 0);
    }

    #[test]
    fn test_reuse_ratio() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.descriptor_reuse_ratio(), 0.0);
        stats.descriptor_sets_created = 1;
        stats.descriptor_sets_reused = 3;
        assert_eq!(stats.descriptor_reuse_ratio(), 0.75);
    }
}
