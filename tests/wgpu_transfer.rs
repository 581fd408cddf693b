//! GPU Property Transfer Tests
//!
//! Runs the copy kernel on a real adapter and checks uploads land in the
//! right slots and downloads return them. Skipped when no GPU is present.

#![cfg(feature = "wgpu-backend")]

use std::sync::Arc;
use std::time::Duration;
use property_pool_engine::{
    Driver, PropertyPool, PropertyPoolHandler, SoaPropertyPool, TransferConfig, TransferError, TransferRequest,
    WgpuDriver,
};

const WAIT: Duration = Duration::from_secs(5);

/// Initialize GPU context for tests
fn init_gpu() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    init_gpu_with_limits(wgpu::Limits::default())
}

fn init_gpu_with_limits(limits: wgpu::Limits) -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("GPU Test Device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
        },
        None,
    ))
    .ok()?;

    Some((Arc::new(device), Arc::new(queue)))
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

#[test]
fn test_gpu_scatter_and_gather() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let config = TransferConfig {
        ideal_workgroup_size: 64,
        upload_ring_size: 1 << 20,
        download_ring_size: 1 << 20,
        ..TransferConfig::default()
    };
    let driver = Arc::new(WgpuDriver::new(device, queue, &config).unwrap());
    let mut handler = PropertyPoolHandler::new(driver.clone(), None, &config).unwrap();
    let pool = SoaPropertyPool::new(&*driver, "GPU Test Pool", 1024, &[4, 12]).unwrap();

    let indices = [5u32, 100, 900];
    let scalars: Vec<u8> = [1u32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
    let vectors: Vec<u8> = (10u32..19).flat_map(|v| v.to_le_bytes()).collect();
    let upload = handler
        .transfer_properties(
            &[
                TransferRequest::upload(&pool, 0, &indices, &scalars),
                TransferRequest::upload(&pool, 1, &indices, &vectors),
            ],
            WAIT,
        )
        .unwrap();
    assert!(handler.wait_for(upload.fence.as_ref().unwrap(), WAIT));

    let block = driver
        .read_buffer(pool.memory_block(), pool.property_offset(0), 1024 * 4)
        .unwrap();
    let block = words(&block);
    assert_eq!((block[5], block[100], block[900]), (1, 2, 3));
    assert_eq!(block.iter().filter(|&&w| w != 0).count(), 3);

    let gather = [900u32, 5];
    let download = handler
        .transfer_properties(&[TransferRequest::download(&pool, 1, &gather)], WAIT)
        .unwrap();
    assert!(handler.wait_for(download.fence.as_ref().unwrap(), WAIT));

    let staged = download.downloads.try_recv().unwrap();
    assert_eq!(words(&staged.data), vec![16, 17, 18, 10, 11, 12]);
    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 0);
}

#[test]
fn test_gpu_oversized_pool_binding_fails_pass() {
    let limits = wgpu::Limits {
        max_storage_buffer_binding_size: 2048,
        ..wgpu::Limits::default()
    };
    let Some((device, queue)) = init_gpu_with_limits(limits) else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let config = TransferConfig {
        ideal_workgroup_size: 64,
        upload_ring_size: 1024,
        download_ring_size: 1024,
        ..TransferConfig::default()
    };
    let driver = Arc::new(WgpuDriver::new(device, queue, &config).unwrap());
    let mut handler = PropertyPoolHandler::new(driver.clone(), None, &config).unwrap();
    // 1024 slots x 4 bytes is twice the binding limit
    let pool = SoaPropertyPool::new(&*driver, "Oversized Pool", 1024, &[4]).unwrap();

    let indices = [7u32];
    let data = 42u32.to_le_bytes();
    let result = handler.transfer_properties(&[TransferRequest::upload(&pool, 0, &indices, &data)], WAIT);
    let Err(failure) = result else {
        panic!("binding beyond the device limit must fail the pass");
    };

    assert!(matches!(failure.error, TransferError::DescriptorSetAcquisition(_)));
    assert_eq!(failure.passes_dispatched, 0);
    assert!(failure.fence.is_none());
    assert_eq!(driver.up_streaming_buffer().allocated_bytes(), 0);
}
