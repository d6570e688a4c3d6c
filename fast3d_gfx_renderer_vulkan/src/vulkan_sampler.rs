/// SamplerCache - VkSampler objects keyed by filter and addressing
///
/// N64 tiles only ever need a handful of distinct samplers, so every
/// combination is created on first use and kept until teardown.

use ash::vk;
use fast3d_gfx::fast3d::render::{FilteringMode, SamplerParameters, G_TX_CLAMP, G_TX_MIRROR};
use fast3d_gfx::fast3d::Result;
use rustc_hash::FxHashMap;

use crate::vulkan_driver::{DeviceDriver, SamplerDesc};
use crate::vulkan_shader_source::FILTER_THREE_POINT;

/// Vulkan address mode for a tile axis
pub fn address_mode(cm: u32) -> vk::SamplerAddressMode {
    if cm & G_TX_CLAMP != 0 {
        vk::SamplerAddressMode::CLAMP_TO_EDGE
    } else if cm & G_TX_MIRROR != 0 {
        vk::SamplerAddressMode::MIRRORED_REPEAT
    } else {
        vk::SamplerAddressMode::REPEAT
    }
}

/// Hardware filter for a tile under the global filtering mode
///
/// Three-point filtering runs in the shader on top of nearest sampling.
pub fn sampler_desc(params: SamplerParameters, mode: FilteringMode) -> SamplerDesc {
    let linear = params.linear_filter && mode == FilteringMode::Linear;
    SamplerDesc {
        filter: if linear { vk::Filter::LINEAR } else { vk::Filter::NEAREST },
        address_u: address_mode(params.cms),
        address_v: address_mode(params.cmt),
    }
}

/// Value of the push-constant filtering flag for a tile
pub fn shader_filtering(params: SamplerParameters, mode: FilteringMode) -> i32 {
    if params.linear_filter && mode == FilteringMode::ThreePoint {
        FILTER_THREE_POINT
    } else {
        0
    }
}

#[derive(Debug, Default)]
pub struct SamplerCache {
    cache: FxHashMap<SamplerDesc, vk::Sampler>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the sampler for a description
    pub fn get<D: DeviceDriver>(&mut self, driver: &mut D, desc: SamplerDesc) -> Result<vk::Sampler> {
        if let Some(&sampler) = self.cache.get(&desc) {
            return Ok(sampler);
        }
        let sampler = driver.create_sampler(&desc)?;
        self.cache.insert(desc, sampler);
        Ok(sampler)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Destroy every cached sampler; the device must still be alive
    pub fn destroy_all<D: DeviceDriver>(&mut self, driver: &mut D) {
        for (_, sampler) in self.cache.drain() {
            driver.destroy_sampler(sampler);
        }
    }
}

#[cfg(test)]
#[path = "vulkan_sampler_tests.rs"]
mod tests;
