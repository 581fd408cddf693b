//! Pipeline variants, one per properties-per-pass count

use crate::error::DeviceResult;
use crate::gpu::{CopyShader, Driver};
use super::descriptor_cache::DescriptorSetCache;

/// Copy pipeline specialized for `property_count` properties, with the
/// descriptor sets that fit its layout
pub struct PipelineVariant<D: Driver> {
    pub shader: CopyShader,
    pub pipeline: D::Pipeline,
    pub cache: DescriptorSetCache<D>,
}

pub struct PipelineTable<D: Driver> {
    variants: Vec<PipelineVariant<D>>,
}

impl<D: Driver> PipelineTable<D> {
    /// Build variants for 1..=`max_properties_per_pass` properties
    pub fn new(
        driver: &D,
        pipeline_cache: Option<&D::PipelineCache>,
        max_properties_per_pass: u32,
        workgroup_size: u32,
        descriptor_set_reserve: usize,
    ) -> DeviceResult<Self> {
        let mut variants = Vec::with_capacity(max_properties_per_pass as usize);
        for property_count in 1..=max_properties_per_pass {
            let shader = CopyShader::new(property_count, workgroup_size);
            let cache = DescriptorSetCache::new(driver, property_count, descriptor_set_reserve)?;
            let pipeline = driver.create_compute_pipeline(pipeline_cache, cache.layout(), &shader)?;
            variants.push(PipelineVariant { shader, pipeline, cache });
        }
        log::debug!(
            "[PipelineTable] Built {} copy pipeline variants (workgroup size {})",
            variants.len(),
            workgroup_size
        );
        Ok(Self { variants })
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Variant for `property_count` properties.
    ///
    /// Panics when `property_count` is 0 or above the per-pass maximum.
    pub fn variant(&self, property_count: usize) -> &PipelineVariant<D> {
        &self.variants[property_count - 1]
    }

    pub fn variant_mut(&mut self, property_count: usize) -> &mut PipelineVariant<D> {
        &mut self.variants[property_count - 1]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineVariant<D>> {
        self.variants.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PipelineVariant<D>> {
        self.variants.iter_mut()
    }
}
