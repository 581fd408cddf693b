/// Property transfer demo
///
/// Uploads three properties into a structure-of-arrays pool at scattered
/// slots, downloads them again and checks the round trip. Runs on the GPU
/// when an adapter is available, otherwise on the host emulation backend.
///
/// Usage: transfer_demo [config.toml] [--cpu]

use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use property_pool_engine::{
    CpuDeviceLimits, CpuDriver, Driver, FenceMode, PropertyPool, PropertyPoolHandler, SoaPropertyPool,
    TransferConfig, TransferRequest, TransferType,
};

const CAPACITY: u32 = 4096;
const PROPERTY_SIZES: [u32; 3] = [4, 12, 16];

fn main() -> Result<()> {
    env_logger::init();

    println!("Property Pool Transfer Demo");
    println!("===========================");

    let mut config_path = None;
    let mut force_cpu = false;
    for arg in std::env::args().skip(1) {
        if arg == "--cpu" {
            force_cpu = true;
        } else {
            config_path = Some(arg);
        }
    }

    let config = match config_path {
        Some(path) => TransferConfig::load(&path)?,
        None => TransferConfig::default(),
    };

    #[cfg(feature = "wgpu-backend")]
    if !force_cpu {
        match property_pool_engine::WgpuDriver::request_default(&config) {
            Ok(driver) => {
                println!("Backend: wgpu");
                return run(Arc::new(driver), &config);
            }
            Err(e) => log::warn!("GPU unavailable ({}), falling back to host emulation", e),
        }
    }
    #[cfg(not(feature = "wgpu-backend"))]
    let _ = force_cpu;

    println!("Backend: host emulation");
    let driver = CpuDriver::new(CpuDeviceLimits::default(), &config, FenceMode::Immediate);
    run(Arc::new(driver), &config)
}

fn run<D: Driver>(driver: Arc<D>, config: &TransferConfig) -> Result<()> {
    let mut handler = PropertyPoolHandler::new(driver.clone(), None, config)?;
    println!("Properties per pass: {}", handler.max_properties_per_pass());

    let pool = SoaPropertyPool::new(&*driver, "Demo Pool", CAPACITY, &PROPERTY_SIZES)?;
    let wait = Duration::from_secs(5);

    // Every 7th slot, reversed, so the redirection table is non-trivial
    let indices: Vec<u32> = (0..CAPACITY / 7).map(|i| CAPACITY - 1 - i * 7).collect();
    let payloads: Vec<Vec<u8>> = (0..pool.property_count())
        .map(|p| {
            let len = indices.len() * pool.property_size(p) as usize;
            (0..len).map(|b| (b as u32 * 31 + p * 7) as u8).collect()
        })
        .collect();

    let uploads: Vec<_> = payloads
        .iter()
        .enumerate()
        .map(|(p, data)| TransferRequest::upload(&pool, p as u32, &indices, data))
        .collect();
    let upload = handler
        .transfer_properties(&uploads, wait)
        .map_err(|failure| anyhow!("upload failed: {}", failure))?;
    println!("Upload: {} passes", upload.passes);
    if let Some(fence) = &upload.fence {
        if !handler.wait_for(fence, wait) {
            bail!("upload did not complete within {:?}", wait);
        }
    }

    let downloads: Vec<_> = (0..pool.property_count())
        .map(|p| TransferRequest::download(&pool, p, &indices))
        .collect();
    let download = handler
        .transfer_properties(&downloads, wait)
        .map_err(|failure| anyhow!("download failed: {}", failure))?;
    if let Some(fence) = &download.fence {
        if !handler.wait_for(fence, wait) {
            bail!("download did not complete within {:?}", wait);
        }
    }

    let mut verified = 0;
    for staged in download.downloads.try_iter() {
        if staged.data != payloads[staged.request] {
            bail!("property {} did not round-trip", staged.request);
        }
        verified += 1;
    }
    if verified != payloads.len() {
        bail!("expected {} downloads, received {}", payloads.len(), verified);
    }

    let stats = handler.stats();
    println!("Round trip verified for {} properties", verified);
    println!(
        "Bytes uploaded: {}, downloaded: {}, passes: {}",
        stats.bytes_uploaded(),
        stats.bytes_downloaded(),
        stats.passes
    );
    println!(
        "Download requests: {}, descriptor set reuse: {:.0}%",
        stats.metrics(TransferType::Download).requests,
        stats.descriptor_reuse_ratio() * 100.0
    );
    Ok(())
}
