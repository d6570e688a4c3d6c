/// DeviceContext - device, queues, swapchain and the objects parented to them
///
/// Bootstrap runs in a fixed order and every step either succeeds or reports
/// the step that failed:
///
/// 1. physical device selection
/// 2. logical device
/// 3. swapchain
/// 4. queue handles
/// 5. descriptor pool
/// 6. render pass
/// 7. per-image framebuffer set (see `vulkan_frame_buffer`)
///
/// A resize re-enters at the swapchain step. The retired swapchain is
/// destroyed only once its replacement exists, and the render pass survives
/// unless the surface format changed.

use ash::vk;
use fast3d_gfx::fast3d::{Error, Result};
use fast3d_gfx::engine_error;

use crate::vulkan_driver::{
    DeviceDriver, DeviceSelection, PhysicalDeviceInfo, SurfaceSupport, SwapchainDesc,
};

const SOURCE: &str = "fast3d::vulkan";

/// Descriptors of each type the pool can hold
pub const DESCRIPTOR_POOL_CAPACITY: u32 = 1000;

/// Surface formats in order of preference
pub const PREFERRED_SURFACE_FORMATS: [vk::Format; 4] = [
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_SRGB,
];

/// Bootstrap progress of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Uninitialized,
    DeviceReady,
    SwapchainReady,
    RenderPassReady,
    FramebuffersReady,
    Running,
}

// ============================================================================
// Selection helpers
// ============================================================================

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Pick the best device exposing a graphics family and a present family
///
/// A family that does both is preferred over two separate ones.
pub fn select_physical_device(devices: &[PhysicalDeviceInfo]) -> Result<DeviceSelection> {
    let mut best: Option<(u32, DeviceSelection)> = None;

    for device in devices {
        let graphics = device
            .queue_families
            .iter()
            .filter(|f| f.queue_count > 0 && f.flags.contains(vk::QueueFlags::GRAPHICS));
        let combined = graphics.clone().find(|f| f.supports_present);
        let present = device.queue_families.iter().find(|f| f.queue_count > 0 && f.supports_present);

        let (graphics_family, present_family) = match (combined, graphics.clone().next(), present) {
            (Some(family), _, _) => (family.index, family.index),
            (None, Some(g), Some(p)) => (g.index, p.index),
            _ => {
                fast3d_gfx::engine_debug!(
                    SOURCE,
                    "Skipping '{}': no graphics + present queue families",
                    device.name
                );
                continue;
            }
        };

        let score = device_type_score(device.device_type);
        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((score, DeviceSelection {
                physical_device: device.handle,
                name: device.name.clone(),
                graphics_family,
                present_family,
            }));
        }
    }

    best.map(|(_, selection)| selection).ok_or_else(|| {
        engine_error!(
            SOURCE,
            "Physical device selection: none of {} device(s) has graphics and present queues",
            devices.len()
        );
        Error::InitializationFailed(
            "physical device selection: no device with graphics and present queue families".to_string(),
        )
    })
}

/// Preferred format with SRGB_NONLINEAR color space, else the first one
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    PREFERRED_SURFACE_FORMATS
        .iter()
        .find_map(|preferred| {
            formats.iter().find(|f| {
                f.format == *preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| {
            engine_error!(SOURCE, "Surface reports no formats");
            Error::BackendError("surface reports no formats".to_string())
        })
}

/// FIFO with vsync; otherwise MAILBOX, then IMMEDIATE, when supported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync {
        for candidate in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if modes.contains(&candidate) {
                return candidate;
            }
        }
    }
    vk::PresentModeKHR::FIFO
}

/// Surface extent, or the window size clamped to the caps when the surface
/// leaves it to the swapchain
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_size.0.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_size.1.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, bounded by the maximum (0 = unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn swapchain_desc(support: &SurfaceSupport, window_size: (u32, u32), vsync: bool) -> Result<SwapchainDesc> {
    Ok(SwapchainDesc {
        surface_format: choose_surface_format(&support.formats)?,
        extent: choose_extent(&support.capabilities, window_size),
        image_count: choose_image_count(&support.capabilities),
        present_mode: choose_present_mode(&support.present_modes, vsync),
        pre_transform: support.capabilities.current_transform,
    })
}

/// Fixed capacities for every descriptor type
pub fn descriptor_pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    [
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        vk::DescriptorType::INPUT_ATTACHMENT,
    ]
    .into_iter()
    .map(|ty| vk::DescriptorPoolSize { ty, descriptor_count: DESCRIPTOR_POOL_CAPACITY })
    .collect()
}

// ============================================================================
// DeviceContext
// ============================================================================

/// Device-level objects of a running backend
#[derive(Debug)]
pub struct DeviceContext {
    pub selection: DeviceSelection,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub descriptor_pool: vk::DescriptorPool,
}

impl DeviceContext {
    /// Steps 1 and 2: pick a device and create the logical device
    pub fn create_device<D: DeviceDriver>(driver: &mut D) -> Result<Self> {
        let devices = driver.physical_devices()?;
        let selection = select_physical_device(&devices)?;
        fast3d_gfx::engine_info!(
            SOURCE,
            "Selected '{}' (graphics family {}, present family {})",
            selection.name,
            selection.graphics_family,
            selection.present_family
        );

        driver.create_logical_device(&selection).map_err(|e| {
            engine_error!(SOURCE, "Logical device creation failed: {}", e);
            Error::InitializationFailed(format!("logical device creation: {}", e))
        })?;

        Ok(Self {
            selection,
            graphics_queue: vk::Queue::null(),
            present_queue: vk::Queue::null(),
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
        })
    }

    /// Step 3 (and the resize path): build a swapchain for the current
    /// surface, retiring the previous one
    ///
    /// Returns whether the surface format changed. On failure the previous
    /// swapchain is left untouched and the error is recoverable.
    pub fn rebuild_swapchain<D: DeviceDriver>(
        &mut self,
        driver: &mut D,
        window_size: (u32, u32),
        vsync: bool,
    ) -> Result<bool> {
        let support = driver.surface_support(self.selection.physical_device)?;
        let desc = swapchain_desc(&support, window_size, vsync)?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            fast3d_gfx::engine_debug!(SOURCE, "Surface has zero extent, postponing swapchain build");
            return Err(Error::SwapchainOutOfDate);
        }

        let old = self.swapchain;
        let swapchain = driver.create_swapchain(&desc, old).map_err(|e| {
            fast3d_gfx::engine_warn!(SOURCE, "Swapchain creation failed: {}", e);
            Error::SwapchainOutOfDate
        })?;
        let images = match driver.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                driver.destroy_swapchain(swapchain);
                fast3d_gfx::engine_warn!(SOURCE, "Swapchain image query failed: {}", e);
                return Err(Error::SwapchainOutOfDate);
            }
        };

        if old != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(old);
        }

        let format_changed = self.surface_format.format != desc.surface_format.format;
        self.swapchain = swapchain;
        self.surface_format = desc.surface_format;
        self.extent = desc.extent;
        self.images = images;

        fast3d_gfx::engine_debug!(
            SOURCE,
            "Swapchain {}x{}, {} images, {:?}, {:?}",
            desc.extent.width,
            desc.extent.height,
            self.images.len(),
            desc.surface_format.format,
            desc.present_mode
        );
        Ok(format_changed)
    }

    /// Step 4: queue handles
    pub fn fetch_queues<D: DeviceDriver>(&mut self, driver: &mut D) -> Result<()> {
        let fetch = |driver: &mut D, family: u32| {
            driver.device_queue(family).map_err(|e| {
                engine_error!(SOURCE, "Queue retrieval for family {} failed: {}", family, e);
                Error::InitializationFailed(format!("queue retrieval (family {}): {}", family, e))
            })
        };
        self.graphics_queue = fetch(driver, self.selection.graphics_family)?;
        self.present_queue = fetch(driver, self.selection.present_family)?;
        Ok(())
    }

    /// Step 5: descriptor pool
    pub fn create_descriptor_pool<D: DeviceDriver>(&mut self, driver: &mut D) -> Result<()> {
        let sizes = descriptor_pool_sizes();
        let max_sets = DESCRIPTOR_POOL_CAPACITY * sizes.len() as u32;
        self.descriptor_pool = driver.create_descriptor_pool(&sizes, max_sets).map_err(|e| {
            engine_error!(SOURCE, "Descriptor pool creation failed: {}", e);
            Error::InitializationFailed(format!("descriptor pool creation: {}", e))
        })?;
        Ok(())
    }

    pub fn destroy<D: DeviceDriver>(&mut self, driver: &mut D) {
        if self.descriptor_pool != vk::DescriptorPool::null() {
            driver.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            driver.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

#[cfg(test)]
#[path = "vulkan_context_tests.rs"]
mod tests;
