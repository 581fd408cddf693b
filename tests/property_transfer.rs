//! Property Transfer Tests
//!
//! Drives the property pool handler end to end on the host emulation
//! backend: pass splitting, scatter/gather correctness, fence-gated reuse
//! of staging memory and descriptor sets, and partial-batch failures.

use std::sync::Arc;
use std::time::Duration;
use property_pool_engine::gpu::{CpuBuffer, CpuCommand};
use property_pool_engine::memory::FailureKind;
use property_pool_engine::{
    AllocationRequest, CpuDeviceLimits, CpuDriver, Driver, Fence, FenceMode, PropertyPool, PropertyPoolHandler,
    SoaPropertyPool, StagingRing, TransferConfig, TransferError, TransferRequest,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const WAIT: Duration = Duration::from_millis(2);

fn test_config() -> TransferConfig {
    TransferConfig {
        ideal_workgroup_size: 64,
        upload_ring_size: 64 * 1024,
        download_ring_size: 64 * 1024,
        descriptor_set_reserve: 0,
        ..TransferConfig::default()
    }
}

fn setup_with(
    bindings: u32,
    mode: FenceMode,
    config: TransferConfig,
) -> (Arc<CpuDriver>, PropertyPoolHandler<CpuDriver>) {
    let limits = CpuDeviceLimits {
        max_storage_buffer_bindings: bindings,
        min_storage_buffer_offset_alignment: 4,
    };
    let driver = Arc::new(CpuDriver::new(limits, &config, mode));
    let handler = PropertyPoolHandler::new(driver.clone(), None, &config).unwrap();
    (driver, handler)
}

fn setup(bindings: u32, mode: FenceMode) -> (Arc<CpuDriver>, PropertyPoolHandler<CpuDriver>) {
    setup_with(bindings, mode, test_config())
}

fn pool(driver: &CpuDriver, capacity: u32, sizes: &[u32]) -> SoaPropertyPool<CpuBuffer> {
    SoaPropertyPool::new(driver, "test pool", capacity, sizes).unwrap()
}

fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

fn property_words(pool: &SoaPropertyPool<CpuBuffer>, property: u32) -> Vec<u32> {
    let len = pool.capacity() as usize * pool.property_size(property) as usize;
    to_words(&pool.memory_block().read(pool.property_offset(property), len).unwrap())
}

fn dispatches(driver: &CpuDriver) -> Vec<(u32, u32, u32)> {
    driver
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            CpuCommand::Dispatch { x, y, property_count, .. } => Some((x, y, property_count)),
            _ => None,
        })
        .collect()
}

fn bound_sets(driver: &CpuDriver) -> Vec<u64> {
    driver
        .commands()
        .into_iter()
        .filter_map(|command| match command {
            CpuCommand::BindDescriptorSet { set } => Some(set),
            _ => None,
        })
        .collect()
}

#[test]
fn test_scatter_upload_touches_only_target_slots() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 1024, &[4]);

    let indices = [5u32, 100, 900];
    let values = [1u32, 2, 3];
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    let transfer = handler
        .transfer_properties(&[TransferRequest::upload(&pool, 0, &indices, &data)], WAIT)
        .unwrap();
    assert_eq!(transfer.passes, 1);
    assert!(transfer.fence.as_ref().is_some_and(|fence| fence.is_signaled()));

    let words = property_words(&pool, 0);
    for (slot, word) in words.iter().enumerate() {
        let expected = match slot {
            5 => 1,
            100 => 2,
            900 => 3,
            _ => 0,
        };
        assert_eq!(*word, expected, "slot {}", slot);
    }
}

#[test]
fn test_batch_is_split_into_fixed_size_passes() {
    let (driver, mut handler) = setup(5, FenceMode::Immediate);
    assert_eq!(handler.max_properties_per_pass(), 2);

    let pool = pool(&driver, 16, &[4, 4, 4, 4, 4]);
    let indices = [0u32, 1];
    let data = [7u8; 8];
    let requests: Vec<_> = (0..5)
        .map(|p| TransferRequest::upload(&pool, p, &indices, &data))
        .collect();

    let transfer = handler.transfer_properties(&requests, WAIT).unwrap();
    assert_eq!(transfer.passes, 3);

    let counts: Vec<u32> = dispatches(&driver).iter().map(|&(_, y, _)| y).collect();
    assert_eq!(counts, vec![2, 2, 1]);
    for &(_, y, property_count) in &dispatches(&driver) {
        assert_eq!(y, property_count);
    }
    assert_eq!(handler.stats().passes, 3);
    assert_eq!(handler.stats().bytes_uploaded(), 40);
}

#[test]
fn test_dispatch_covers_largest_property_of_pass() {
    let (driver, mut handler) = setup(5, FenceMode::Immediate);
    let pool = pool(&driver, 128, &[4, 16]);

    let small: Vec<u32> = (0..100).collect();
    let large: Vec<u32> = (0..10).map(|i| 127 - i).collect();
    let small_data = vec![1u8; 400];
    let large_data = vec![2u8; 160];

    handler
        .transfer_properties(
            &[
                TransferRequest::upload(&pool, 0, &small, &small_data),
                TransferRequest::upload(&pool, 1, &large, &large_data),
            ],
            WAIT,
        )
        .unwrap();

    // 100 words vs 10 x 4 words, 64 invocations per workgroup
    assert_eq!(dispatches(&driver), vec![(2, 2, 2)]);
}

#[test]
fn test_round_trip_with_shuffled_indices() {
    let (driver, mut handler) = setup(7, FenceMode::Immediate);
    let sizes = [4u32, 8, 12, 20];
    let pool = pool(&driver, 500, &sizes);
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut slots: Vec<u32> = (0..500).collect();
    slots.shuffle(&mut rng);
    let indices = &slots[..321];

    let payloads: Vec<Vec<u8>> = sizes
        .iter()
        .map(|&size| (0..indices.len() * size as usize).map(|_| rng.gen()).collect())
        .collect();
    let uploads: Vec<_> = payloads
        .iter()
        .enumerate()
        .map(|(p, data)| TransferRequest::upload(&pool, p as u32, indices, data))
        .collect();
    let upload = handler.transfer_properties(&uploads, WAIT).unwrap();
    assert_eq!(upload.passes, 2);

    let downloads: Vec<_> = (0..sizes.len() as u32)
        .map(|p| TransferRequest::download(&pool, p, indices))
        .collect();
    let download = handler.transfer_properties(&downloads, WAIT).unwrap();
    let fence = download.fence.clone().unwrap();
    assert!(handler.wait_for(&fence, WAIT));

    let mut received: Vec<_> = download.downloads.try_iter().collect();
    received.sort_by_key(|staged| staged.request);
    assert_eq!(received.len(), sizes.len());
    for staged in received {
        assert_eq!(staged.data, payloads[staged.request], "property {}", staged.request);
    }
    assert_eq!(handler.stats().bytes_downloaded(), handler.stats().bytes_uploaded());
}

#[test]
fn test_download_gathers_duplicates_in_request_order() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 16, &[8]);

    let slots = [3u32, 7];
    let data: Vec<u8> = [10u32, 11, 20, 21].iter().flat_map(|v| v.to_le_bytes()).collect();
    handler
        .transfer_properties(&[TransferRequest::upload(&pool, 0, &slots, &data)], WAIT)
        .unwrap();

    let gather = [7u32, 3, 3];
    let download = handler
        .transfer_properties(&[TransferRequest::download(&pool, 0, &gather)], WAIT)
        .unwrap();
    handler.reclaim();

    let staged = download.downloads.try_recv().unwrap();
    assert_eq!(to_words(&staged.data), vec![20, 21, 10, 11, 10, 11]);
}

#[test]
fn test_mixed_upload_and_download_in_one_pass() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 16, &[4, 8, 12]);

    let seed_slots = [1u32, 3, 9, 15];
    let scalars: Vec<u8> = [10u32, 30, 90, 150].iter().flat_map(|v| v.to_le_bytes()).collect();
    let triples: Vec<u8> = seed_slots
        .iter()
        .flat_map(|&slot| (0..3).map(move |c| slot * 100 + c))
        .flat_map(|v: u32| v.to_le_bytes())
        .collect();
    handler
        .transfer_properties(
            &[
                TransferRequest::upload(&pool, 0, &seed_slots, &scalars),
                TransferRequest::upload(&pool, 2, &seed_slots, &triples),
            ],
            WAIT,
        )
        .unwrap();

    let gather = [15u32, 3, 3];
    let scatter = [9u32, 1];
    let pairs: Vec<u8> = [7u32, 8, 5, 6].iter().flat_map(|v| v.to_le_bytes()).collect();
    let mixed = handler
        .transfer_properties(
            &[
                TransferRequest::download(&pool, 2, &gather),
                TransferRequest::upload(&pool, 1, &scatter, &pairs),
                TransferRequest::download(&pool, 0, &scatter),
            ],
            WAIT,
        )
        .unwrap();
    assert_eq!(mixed.passes, 1);
    assert!(handler.wait_for(mixed.fence.as_ref().unwrap(), WAIT));

    let mut staged: Vec<_> = mixed.downloads.try_iter().collect();
    staged.sort_by_key(|download| download.request);
    assert_eq!(staged.len(), 2);
    assert_eq!(staged[0].request, 0);
    assert_eq!(
        to_words(&staged[0].data),
        vec![1500, 1501, 1502, 300, 301, 302, 300, 301, 302]
    );
    assert_eq!(staged[1].request, 2);
    assert_eq!(to_words(&staged[1].data), vec![90, 10]);

    let vectors = property_words(&pool, 1);
    assert_eq!(&vectors[18..20], &[7, 8]);
    assert_eq!(&vectors[2..4], &[5, 6]);
    assert_eq!(vectors.iter().filter(|&&w| w != 0).count(), 4);

    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 0);
    assert_eq!(driver.down_streaming_buffer().allocated_bytes(), 0);
}

#[test]
fn test_download_delivered_only_after_fence() {
    let (driver, mut handler) = setup(8, FenceMode::Manual);
    let pool = pool(&driver, 8, &[4]);
    let indices = [1u32];

    let download = handler
        .transfer_properties(&[TransferRequest::download(&pool, 0, &indices)], WAIT)
        .unwrap();
    handler.reclaim();
    assert!(download.downloads.try_recv().is_err());
    assert!(!handler.wait_for(download.fence.as_ref().unwrap(), Duration::from_millis(1)));

    driver.signal_all();
    assert!(handler.wait_for(download.fence.as_ref().unwrap(), WAIT));
    let staged = download.downloads.try_recv().unwrap();
    assert_eq!(staged.request, 0);
    assert_eq!(staged.data, vec![0; 4]);
}

#[test]
fn test_descriptor_set_not_reused_before_fence() {
    let (driver, mut handler) = setup(5, FenceMode::Manual);
    let pool = pool(&driver, 8, &[4]);
    let indices = [2u32];
    let data = [1u8; 4];
    let request = [TransferRequest::upload(&pool, 0, &indices, &data)];

    let first = handler.transfer_properties(&request, WAIT).unwrap();
    handler.transfer_properties(&request, WAIT).unwrap();
    let sets = bound_sets(&driver);
    assert_ne!(sets[0], sets[1]);

    driver.signal(first.fence.as_ref().unwrap());
    handler.transfer_properties(&request, WAIT).unwrap();
    let sets = bound_sets(&driver);
    assert_eq!(sets[2], sets[0]);

    let cache = &handler.pipelines().variant(1).cache;
    assert_eq!(cache.created_count(), 2);
    assert_eq!(cache.in_flight_count(), 2);
    assert_eq!(handler.stats().descriptor_sets_created, 2);
    assert_eq!(handler.stats().descriptor_sets_reused, 1);
}

#[test]
fn test_staging_not_reallocated_before_fence() {
    let config = TransferConfig {
        upload_ring_size: 128,
        ..test_config()
    };
    let (driver, mut handler) = setup_with(8, FenceMode::Manual, config);
    let pool = pool(&driver, 8, &[4]);
    let indices: Vec<u32> = (0..8).collect();
    let data = [9u8; 32];
    let request = [TransferRequest::upload(&pool, 0, &indices, &data)];

    // 44 byte header + 32 byte payload
    handler.transfer_properties(&request, WAIT).unwrap();
    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 76);

    let failure = handler.transfer_properties(&request, WAIT).unwrap_err();
    assert!(matches!(
        failure.error,
        TransferError::StagingTimeout { ring: StagingRing::Upload, bytes: 76, .. }
    ));
    assert_eq!(failure.passes_dispatched, 0);
    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 76);
    assert_eq!(driver.dispatch_count(), 1);

    driver.signal_all();
    handler.transfer_properties(&request, WAIT).unwrap();
    assert_eq!(driver.dispatch_count(), 2);
    assert_eq!(handler.stats().failures(FailureKind::StagingTimeout), 1);
}

#[test]
fn test_staging_timeout_keeps_earlier_passes() {
    let config = TransferConfig {
        upload_ring_size: 64,
        ..test_config()
    };
    let (driver, mut handler) = setup_with(5, FenceMode::Manual, config);
    let pool = pool(&driver, 16, &[4]);
    let slots = [[0u32], [1], [2], [3]];
    let data = [5u8; 4];
    let requests: Vec<_> = slots
        .iter()
        .map(|indices| TransferRequest::upload(&pool, 0, indices, &data))
        .collect();

    // Pass 1 holds 32 header + 8 payload bytes of the 64 byte ring
    let failure = handler.transfer_properties(&requests, WAIT).unwrap_err();
    assert!(matches!(failure.error, TransferError::StagingTimeout { .. }));
    assert_eq!(failure.passes_dispatched, 1);
    assert!(failure.fence.is_some());
    assert_eq!(driver.dispatch_count(), 1);

    let words = property_words(&pool, 0);
    assert_eq!(&words[..4], &[0x0505_0505, 0x0505_0505, 0, 0]);
}

#[test]
fn test_add_properties_returns_undispatched_slots() {
    let config = TransferConfig {
        upload_ring_size: 64,
        ..test_config()
    };
    let (driver, mut handler) = setup_with(5, FenceMode::Manual, config);
    let pool = pool(&driver, 16, &[4]);
    let data = [3u8; 4];
    let mut slots = [[u32::MAX]; 4];
    let mut requests: Vec<_> = slots
        .iter_mut()
        .map(|out| AllocationRequest::new(&pool, 0, out, &data))
        .collect();

    let failure = handler.add_properties(&mut requests, WAIT).unwrap_err();
    assert_eq!(failure.passes_dispatched, 1);
    drop(requests);

    assert_eq!(pool.allocated_count(), 2);
    assert!(pool.is_allocated(slots[0][0]) && pool.is_allocated(slots[1][0]));
    assert!(!pool.is_allocated(slots[2][0]) && !pool.is_allocated(slots[3][0]));
}

#[test]
fn test_pool_allocation_failure_issues_no_work() {
    let (driver, mut handler) = setup(5, FenceMode::Immediate);
    let big = pool(&driver, 64, &[4]);
    let small = pool(&driver, 1, &[4]);
    let data = [1u8; 8];

    let mut slots = [[u32::MAX; 2]; 5];
    let mut requests: Vec<_> = slots
        .iter_mut()
        .enumerate()
        .map(|(i, out)| {
            let target: &SoaPropertyPool<CpuBuffer> = if i == 2 { &small } else { &big };
            AllocationRequest::new(target, 0, out, &data)
        })
        .collect();

    let failure = handler.add_properties(&mut requests, WAIT).unwrap_err();
    assert!(matches!(
        failure.error,
        TransferError::PoolAllocation { request: 2, requested: 2 }
    ));
    assert_eq!(failure.passes_dispatched, 0);
    assert!(failure.fence.is_none());
    assert_eq!(driver.dispatch_count(), 0);
    assert_eq!(big.allocated_count(), 0);
    assert_eq!(small.allocated_count(), 0);
    assert_eq!(handler.stats().failures(FailureKind::PoolAllocation), 1);
}

#[test]
fn test_add_properties_uploads_into_new_slots() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 32, &[4, 8]);
    let positions: Vec<u8> = [1u32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
    let velocities: Vec<u8> = [4u32, 5, 6, 7].iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut first = [0u32; 3];
    let mut second = [0u32; 2];
    let mut requests = [
        AllocationRequest::new(&pool, 0, &mut first, &positions),
        AllocationRequest::new(&pool, 1, &mut second, &velocities),
    ];
    let transfer = handler.add_properties(&mut requests, WAIT).unwrap();
    assert_eq!(transfer.passes, 1);

    assert_eq!(first, [0, 1, 2]);
    assert_eq!(second, [3, 4]);
    assert_eq!(&property_words(&pool, 0)[..3], &[1, 2, 3]);
    assert_eq!(&property_words(&pool, 1)[6..10], &[4, 5, 6, 7]);
}

#[test]
fn test_invalid_requests_rejected_before_dispatch() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 8, &[4, 6]);
    let good_indices = [0u32];
    let good_data = [0u8; 4];
    let good = TransferRequest::upload(&pool, 0, &good_indices, &good_data);

    let out_of_range = [8u32];
    let short = [0u8; 3];
    let cases = [
        TransferRequest::download(&pool, 2, &good_indices),
        TransferRequest::download(&pool, 0, &out_of_range),
        TransferRequest::upload(&pool, 0, &good_indices, &short),
        TransferRequest::download(&pool, 1, &good_indices),
    ];

    for bad in cases {
        let failure = handler.transfer_properties(&[good, bad], WAIT).unwrap_err();
        assert!(
            matches!(failure.error, TransferError::InvalidRequest { request: 1, .. }),
            "{:?}",
            bad
        );
        assert_eq!(failure.passes_dispatched, 0);
    }
    assert_eq!(driver.dispatch_count(), 0);
    assert_eq!(handler.stats().failures(FailureKind::InvalidRequest), 4);
}

#[test]
fn test_empty_batch_succeeds_without_work() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let transfer = handler.transfer_properties(&[], WAIT).unwrap();
    assert!(transfer.fence.is_none());
    assert_eq!(transfer.passes, 0);
    assert!(driver.commands().is_empty());
}

#[test]
fn test_descriptor_failure_frees_staging() {
    let (driver, mut handler) = setup(8, FenceMode::Immediate);
    let pool = pool(&driver, 8, &[4]);
    let indices = [1u32, 2];
    let data = [4u8; 8];
    let request = [TransferRequest::upload(&pool, 0, &indices, &data)];

    driver.fail_next_descriptor_sets(1);
    let failure = handler.transfer_properties(&request, WAIT).unwrap_err();
    assert!(matches!(failure.error, TransferError::DescriptorSetAcquisition(_)));
    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 0);
    assert_eq!(driver.dispatch_count(), 0);

    handler.transfer_properties(&request, WAIT).unwrap();
    assert_eq!(driver.dispatch_count(), 1);
}

#[test]
fn test_too_few_bindings_is_unsupported() {
    let limits = CpuDeviceLimits {
        max_storage_buffer_bindings: 2,
        min_storage_buffer_offset_alignment: 4,
    };
    let config = test_config();
    let driver = Arc::new(CpuDriver::new(limits, &config, FenceMode::Immediate));
    assert!(PropertyPoolHandler::new(driver, None, &config).is_err());
}
