/// Staging memory management
///
/// Streaming (staging) buffer sub-allocation, fence-gated deferred
/// reclamation, and transfer statistics.

pub mod range_allocator;
pub mod reclaim;
pub mod streaming_buffer;
pub mod transfer_stats;

pub use range_allocator::{align_up, AllocationStrategy, RangeAllocator};
pub use reclaim::DeferredReclaimer;
pub use streaming_buffer::{ReadBack, StagedDownload, StreamingBuffer};
pub use transfer_stats::{FailureKind, TransferStats, TransferType, TypeMetrics};
