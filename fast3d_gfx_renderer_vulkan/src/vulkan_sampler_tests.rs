//! Unit tests for vulkan_sampler.rs

use ash::vk;
use fast3d_gfx::fast3d::render::{FilteringMode, SamplerParameters, G_TX_CLAMP, G_TX_MIRROR};

use crate::mock_driver::MockDriver;
use crate::vulkan_sampler::{address_mode, sampler_desc, shader_filtering, SamplerCache};
use crate::vulkan_shader_source::FILTER_THREE_POINT;

fn linear(cms: u32, cmt: u32) -> SamplerParameters {
    SamplerParameters { linear_filter: true, cms, cmt }
}

#[test]
fn test_address_mode_bits() {
    assert_eq!(address_mode(0), vk::SamplerAddressMode::REPEAT);
    assert_eq!(address_mode(G_TX_MIRROR), vk::SamplerAddressMode::MIRRORED_REPEAT);
    assert_eq!(address_mode(G_TX_CLAMP), vk::SamplerAddressMode::CLAMP_TO_EDGE);
    // Clamp wins over mirror
    assert_eq!(address_mode(G_TX_CLAMP | G_TX_MIRROR), vk::SamplerAddressMode::CLAMP_TO_EDGE);
}

#[test]
fn test_sampler_desc_filter_follows_mode() {
    let params = linear(G_TX_CLAMP, G_TX_MIRROR);

    let desc = sampler_desc(params, FilteringMode::Linear);
    assert_eq!(desc.filter, vk::Filter::LINEAR);
    assert_eq!(desc.address_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    assert_eq!(desc.address_v, vk::SamplerAddressMode::MIRRORED_REPEAT);

    assert_eq!(sampler_desc(params, FilteringMode::ThreePoint).filter, vk::Filter::NEAREST);
    assert_eq!(sampler_desc(params, FilteringMode::None).filter, vk::Filter::NEAREST);

    let nearest = SamplerParameters { linear_filter: false, ..params };
    assert_eq!(sampler_desc(nearest, FilteringMode::Linear).filter, vk::Filter::NEAREST);
}

#[test]
fn test_shader_filtering_only_for_three_point() {
    assert_eq!(shader_filtering(linear(0, 0), FilteringMode::ThreePoint), FILTER_THREE_POINT);
    assert_eq!(shader_filtering(linear(0, 0), FilteringMode::Linear), 0);
    assert_eq!(shader_filtering(linear(0, 0), FilteringMode::None), 0);
    assert_eq!(shader_filtering(SamplerParameters::default(), FilteringMode::ThreePoint), 0);
}

#[test]
fn test_sampler_cache_reuses_samplers() {
    let mut driver = MockDriver::new();
    let mut cache = SamplerCache::new();

    let a = cache.get(&mut driver, sampler_desc(linear(0, 0), FilteringMode::Linear)).unwrap();
    let b = cache.get(&mut driver, sampler_desc(linear(0, 0), FilteringMode::Linear)).unwrap();
    let c = cache.get(&mut driver, sampler_desc(linear(G_TX_CLAMP, 0), FilteringMode::Linear)).unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(cache.len(), 2);
    assert_eq!(driver.lock().live_count("sampler"), 2);

    cache.destroy_all(&mut driver);
    assert_eq!(cache.len(), 0);
    assert_eq!(driver.lock().live_count("sampler"), 0);
    assert!(driver.lock().violations.is_empty());
}
