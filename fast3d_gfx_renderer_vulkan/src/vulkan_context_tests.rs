//! Unit tests for vulkan_context.rs

use ash::vk;
use ash::vk::Handle;
use fast3d_gfx::fast3d::Error;

use crate::vulkan_context::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    descriptor_pool_sizes, select_physical_device, DESCRIPTOR_POOL_CAPACITY,
};
use crate::vulkan_driver::{PhysicalDeviceInfo, QueueFamilyInfo};

fn family(index: u32, flags: vk::QueueFlags, supports_present: bool) -> QueueFamilyInfo {
    QueueFamilyInfo { index, flags, queue_count: 1, supports_present }
}

fn device(raw: u64, device_type: vk::PhysicalDeviceType, families: Vec<QueueFamilyInfo>) -> PhysicalDeviceInfo {
    PhysicalDeviceInfo {
        handle: vk::PhysicalDevice::from_raw(raw),
        name: format!("gpu{}", raw),
        device_type,
        queue_families: families,
    }
}

fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: min,
        max_image_count: max,
        current_extent: vk::Extent2D { width: current.0, height: current.1 },
        min_image_extent: vk::Extent2D { width: 1, height: 1 },
        max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
        ..Default::default()
    }
}

// ============================================================================
// PHYSICAL DEVICE SELECTION
// ============================================================================

#[test]
fn test_discrete_preferred_over_integrated() {
    let both = vec![family(0, vk::QueueFlags::GRAPHICS, true)];
    let devices = vec![
        device(1, vk::PhysicalDeviceType::INTEGRATED_GPU, both.clone()),
        device(2, vk::PhysicalDeviceType::DISCRETE_GPU, both.clone()),
        device(3, vk::PhysicalDeviceType::CPU, both),
    ];

    let selection = select_physical_device(&devices).unwrap();
    assert_eq!(selection.physical_device, vk::PhysicalDevice::from_raw(2));
    assert_eq!(selection.graphics_family, 0);
    assert_eq!(selection.present_family, 0);
}

#[test]
fn test_device_without_present_is_skipped() {
    let devices = vec![
        device(1, vk::PhysicalDeviceType::DISCRETE_GPU, vec![family(0, vk::QueueFlags::GRAPHICS, false)]),
        device(2, vk::PhysicalDeviceType::VIRTUAL_GPU, vec![family(0, vk::QueueFlags::GRAPHICS, true)]),
    ];

    let selection = select_physical_device(&devices).unwrap();
    assert_eq!(selection.physical_device, vk::PhysicalDevice::from_raw(2));
}

#[test]
fn test_separate_graphics_and_present_families() {
    let devices = vec![device(
        7,
        vk::PhysicalDeviceType::DISCRETE_GPU,
        vec![
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
            family(1, vk::QueueFlags::TRANSFER, true),
        ],
    )];

    let selection = select_physical_device(&devices).unwrap();
    assert_eq!(selection.graphics_family, 0);
    assert_eq!(selection.present_family, 1);
}

#[test]
fn test_no_queue_families_fails_naming_the_step() {
    let devices = vec![device(1, vk::PhysicalDeviceType::DISCRETE_GPU, Vec::new())];

    match select_physical_device(&devices) {
        Err(Error::InitializationFailed(msg)) => assert!(msg.contains("physical device selection")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_no_devices_fails() {
    assert!(matches!(select_physical_device(&[]), Err(Error::InitializationFailed(_))));
}

// ============================================================================
// SWAPCHAIN PARAMETERS
// ============================================================================

#[test]
fn test_surface_format_preference_order() {
    let formats = [
        vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
        vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_UNORM, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
    ];
    assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);
}

#[test]
fn test_surface_format_falls_back_to_first() {
    let formats = [
        vk::SurfaceFormatKHR { format: vk::Format::A2B10G10R10_UNORM_PACK32, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
        vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_UNORM, color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT },
    ];
    assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::A2B10G10R10_UNORM_PACK32);
    assert!(matches!(choose_surface_format(&[]), Err(Error::BackendError(_))));
}

#[test]
fn test_present_mode() {
    let all = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
    assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
    assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
    assert_eq!(
        choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], false),
        vk::PresentModeKHR::IMMEDIATE
    );
    assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
}

#[test]
fn test_extent_uses_current_or_clamps_window() {
    assert_eq!(
        choose_extent(&caps(2, 3, (800, 600)), (1024, 768)),
        vk::Extent2D { width: 800, height: 600 }
    );
    assert_eq!(
        choose_extent(&caps(2, 3, (u32::MAX, u32::MAX)), (5000, 480)),
        vk::Extent2D { width: 4096, height: 480 }
    );
}

#[test]
fn test_image_count() {
    assert_eq!(choose_image_count(&caps(2, 8, (1, 1))), 3);
    assert_eq!(choose_image_count(&caps(3, 3, (1, 1))), 3);
    assert_eq!(choose_image_count(&caps(2, 0, (1, 1))), 3);
}

#[test]
fn test_descriptor_pool_sizes() {
    let sizes = descriptor_pool_sizes();
    assert_eq!(sizes.len(), 11);
    assert!(sizes.iter().all(|s| s.descriptor_count == DESCRIPTOR_POOL_CAPACITY));
    assert!(sizes.iter().any(|s| s.ty == vk::DescriptorType::INPUT_ATTACHMENT));
}
