/// AshDriver - DeviceDriver over a real Vulkan instance
///
/// Owns the entry, instance, window surface, optional debug messenger,
/// logical device and GPU allocator. The logical device is created later
/// than the rest (after physical device selection), so device-level state is
/// optional until `create_logical_device` ran.
///
/// Destruction order on drop: allocator, upload pool, device, surface,
/// messenger, instance.

use ash::vk;
use fast3d_gfx::fast3d::render::RendererConfig;
use fast3d_gfx::fast3d::{Error, NativeWindow, Result};
use fast3d_gfx::{engine_err, engine_error, engine_info, engine_warn};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;

use crate::debug;
use crate::vulkan_driver::{
    AcquireOutcome, AttachmentClear, DeviceDriver, DeviceSelection, FrameSubmit, GpuBuffer, GpuImage,
    GraphicsPipelineDesc, ImageClear, ImageDesc, PhysicalDeviceInfo, PresentOutcome, QueueFamilyInfo, RenderPassBegin,
    RenderPassLayout, SamplerDesc, SurfaceSupport, SwapchainDesc, TextureBinding,
};

const SOURCE: &str = "fast3d::vulkan";

/// Device-level objects, present once the logical device exists
struct DeviceState {
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    allocator: Option<Allocator>,
    graphics_family: u32,
    present_family: u32,
    graphics_queue: vk::Queue,
    /// Pool for blocking one-shot transfers (uploads, readbacks, layout changes)
    upload_pool: vk::CommandPool,
}

pub struct AshDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    state: Option<DeviceState>,
}

fn subresource(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn layers(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Access mask matching an image layout, for one-shot barriers
fn layout_access(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        _ => vk::AccessFlags::empty(),
    }
}

fn layout_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource(aspect))
        .src_access_mask(layout_access(old_layout))
        .dst_access_mask(layout_access(new_layout))
}

impl AshDriver {
    /// Load Vulkan, create the instance, the window surface and (when
    /// requested and compiled in) the validation messenger
    pub fn new(window: &dyn NativeWindow, config: &RendererConfig) -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| {
                engine_error!(SOURCE, "Failed to load Vulkan library: {:?}", e);
                Error::InitializationFailed(format!("Vulkan loader: {:?}", e))
            })?;

            let app_name = std::ffi::CString::new(config.app_name.as_str()).unwrap_or_default();
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"Fast3D")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_1);

            let display_handle = window.display_handle().map_err(|e| {
                engine_error!(SOURCE, "Failed to get display handle: {}", e);
                Error::InitializationFailed(format!("display handle: {}", e))
            })?;
            let mut extension_names = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| {
                    engine_error!(SOURCE, "Failed to get required extensions: {}", e);
                    Error::InitializationFailed(format!("required instance extensions: {}", e))
                })?
                .to_vec();

            let validation = config.enable_validation
                && cfg!(feature = "vulkan-validation")
                && Self::validation_layer_available(&entry);
            if config.enable_validation && !validation {
                engine_warn!(SOURCE, "Validation requested but not available, continuing without it");
            }

            let layer_names = if validation {
                extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
                vec![debug::VALIDATION_LAYER.as_ptr()]
            } else {
                vec![]
            };

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names)
                .enabled_extension_names(&extension_names);

            let instance = entry.create_instance(&create_info, None).map_err(|e| {
                engine_error!(SOURCE, "Failed to create Vulkan instance: {:?}", e);
                Error::InitializationFailed(format!("instance creation: {:?}", e))
            })?;

            let debug_messenger = if validation {
                debug::reset_validation_stats();
                let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
                match debug_utils.create_debug_utils_messenger(&debug::messenger_create_info(), None) {
                    Ok(messenger) => Some((debug_utils, messenger)),
                    Err(e) => {
                        engine_warn!(SOURCE, "Failed to create debug messenger: {:?}", e);
                        None
                    }
                }
            } else {
                None
            };

            let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
            let surface = window
                .window_handle()
                .map_err(|e| format!("window handle: {}", e))
                .and_then(|window_handle| {
                    ash_window::create_surface(
                        &entry,
                        &instance,
                        display_handle.as_raw(),
                        window_handle.as_raw(),
                        None,
                    )
                    .map_err(|e| format!("surface creation: {:?}", e))
                });
            let surface = match surface {
                Ok(surface) => surface,
                Err(message) => {
                    engine_error!(SOURCE, "Failed to create window surface: {}", message);
                    if let Some((debug_utils, messenger)) = &debug_messenger {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                    return Err(Error::InitializationFailed(message));
                }
            };

            engine_info!(SOURCE, "Vulkan instance ready (validation: {})", debug_messenger.is_some());

            Ok(Self {
                _entry: entry,
                instance,
                surface_loader,
                surface,
                debug_messenger,
                state: None,
            })
        }
    }

    fn validation_layer_available(entry: &ash::Entry) -> bool {
        unsafe { entry.enumerate_instance_layer_properties() }
            .map(|layers| {
                layers.iter().any(|layer| {
                    layer
                        .layer_name_as_c_str()
                        .map(|name| name == debug::VALIDATION_LAYER)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn state(&self) -> Result<&DeviceState> {
        self.state
            .as_ref()
            .ok_or_else(|| engine_err!(SOURCE, "Logical device not created"))
    }

    fn supports_swapchain(&self, physical_device: vk::PhysicalDevice) -> bool {
        unsafe { self.instance.enumerate_device_extension_properties(physical_device) }
            .map(|extensions| {
                extensions.iter().any(|ext| {
                    ext.extension_name_as_c_str()
                        .map(|name| name == ash::khr::swapchain::NAME)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn allocate(&mut self, name: &str, requirements: vk::MemoryRequirements, location: MemoryLocation, linear: bool) -> Result<Allocation> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| engine_err!(SOURCE, "Logical device not created"))?;
        let allocator = state
            .allocator
            .as_mut()
            .ok_or_else(|| engine_err!(SOURCE, "GPU allocator already destroyed"))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                let size_mb = requirements.size as f64 / (1024.0 * 1024.0);
                engine_error!(SOURCE, "Out of GPU memory for {} ({:.2} MB): {:?}", name, size_mb, e);
                Error::OutOfMemory
            })
    }

    fn free(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.state.as_mut().and_then(|state| state.allocator.as_mut()) {
            if let Err(e) = allocator.free(allocation) {
                engine_warn!(SOURCE, "Failed to free GPU allocation: {:?}", e);
            }
        }
    }

    /// Record and run a command buffer on the graphics queue, blocking until
    /// it completed
    fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let state = self.state()?;
        let device = &state.device;
        unsafe {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(state.upload_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device
                .allocate_command_buffers(&allocate_info)
                .map_err(|e| engine_err!(SOURCE, "Failed to allocate one-shot command buffer: {:?}", e))?[0];

            let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.free_command_buffers(state.upload_pool, &[command_buffer]);
                    return Err(engine_err!(SOURCE, "Failed to create one-shot fence: {:?}", e));
                }
            };

            let result = (|| -> std::result::Result<(), vk::Result> {
                let begin_info =
                    vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                device.begin_command_buffer(command_buffer, &begin_info)?;
                record(device, command_buffer);
                device.end_command_buffer(command_buffer)?;
                let command_buffers = [command_buffer];
                let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
                device.queue_submit(state.graphics_queue, &[submit], fence)?;
                device.wait_for_fences(&[fence], true, u64::MAX)
            })();

            device.destroy_fence(fence, None);
            device.free_command_buffers(state.upload_pool, &[command_buffer]);
            result.map_err(|e| engine_err!(SOURCE, "One-shot submission failed: {:?}", e))
        }
    }
}

impl DeviceDriver for AshDriver {
    // ===== DEVICE =====

    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>> {
        let handles = unsafe { self.instance.enumerate_physical_devices() }.map_err(|e| {
            engine_error!(SOURCE, "Failed to enumerate physical devices: {:?}", e);
            Error::InitializationFailed(format!("physical device enumeration: {:?}", e))
        })?;

        let mut devices = Vec::with_capacity(handles.len());
        for handle in handles {
            let properties = unsafe { self.instance.get_physical_device_properties(handle) };
            let name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            if !self.supports_swapchain(handle) {
                engine_info!(SOURCE, "Skipping '{}': no swapchain support", name);
                continue;
            }

            let families = unsafe { self.instance.get_physical_device_queue_family_properties(handle) };
            let queue_families = families
                .iter()
                .enumerate()
                .map(|(index, family)| QueueFamilyInfo {
                    index: index as u32,
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                    supports_present: unsafe {
                        self.surface_loader
                            .get_physical_device_surface_support(handle, index as u32, self.surface)
                            .unwrap_or(false)
                    },
                })
                .collect();

            devices.push(PhysicalDeviceInfo {
                handle,
                name,
                device_type: properties.device_type,
                queue_families,
            });
        }
        Ok(devices)
    }

    fn create_logical_device(&mut self, selection: &DeviceSelection) -> Result<()> {
        unsafe {
            let queue_priorities = [1.0];
            let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
                .queue_family_index(selection.graphics_family)
                .queue_priorities(&queue_priorities)];
            if selection.present_family != selection.graphics_family {
                queue_create_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(selection.present_family)
                        .queue_priorities(&queue_priorities),
                );
            }

            let device_extension_names = [ash::khr::swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();
            let device_create_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&device_extension_names)
                .enabled_features(&device_features);

            let device = self
                .instance
                .create_device(selection.physical_device, &device_create_info, None)
                .map_err(|e| engine_err!(SOURCE, "vkCreateDevice failed: {:?}", e))?;

            let allocator = match Allocator::new(&AllocatorCreateDesc {
                instance: self.instance.clone(),
                device: device.clone(),
                physical_device: selection.physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            }) {
                Ok(allocator) => allocator,
                Err(e) => {
                    device.destroy_device(None);
                    return Err(engine_err!(SOURCE, "Failed to create GPU allocator: {:?}", e));
                }
            };

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(selection.graphics_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let upload_pool = match device.create_command_pool(&pool_info, None) {
                Ok(pool) => pool,
                Err(e) => {
                    drop(allocator);
                    device.destroy_device(None);
                    return Err(engine_err!(SOURCE, "Failed to create upload command pool: {:?}", e));
                }
            };

            let swapchain_loader = ash::khr::swapchain::Device::new(&self.instance, &device);
            let graphics_queue = device.get_device_queue(selection.graphics_family, 0);

            self.state = Some(DeviceState {
                device,
                swapchain_loader,
                allocator: Some(allocator),
                graphics_family: selection.graphics_family,
                present_family: selection.present_family,
                graphics_queue,
                upload_pool,
            });
            Ok(())
        }
    }

    fn device_queue(&mut self, family: u32) -> Result<vk::Queue> {
        let state = self.state()?;
        let queue = unsafe { state.device.get_device_queue(family, 0) };
        if queue == vk::Queue::null() {
            return Err(engine_err!(SOURCE, "No queue 0 in family {}", family));
        }
        Ok(queue)
    }

    fn device_wait_idle(&mut self) -> Result<()> {
        let state = self.state()?;
        unsafe { state.device.device_wait_idle() }
            .map_err(|e| engine_err!(SOURCE, "vkDeviceWaitIdle failed: {:?}", e))
    }

    // ===== SWAPCHAIN =====

    fn surface_support(&mut self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(|e| engine_err!(SOURCE, "Failed to query surface capabilities: {:?}", e))?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(|e| engine_err!(SOURCE, "Failed to query surface formats: {:?}", e))?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(|e| engine_err!(SOURCE, "Failed to query present modes: {:?}", e))?;
            Ok(SurfaceSupport { capabilities, formats, present_modes })
        }
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR> {
        let state = self.state()?;
        let family_indices = [state.graphics_family, state.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old);
        if state.graphics_family != state.present_family {
            create_info = create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices);
        }
        unsafe { state.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateSwapchainKHR failed: {:?}", e))
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let state = self.state()?;
        unsafe { state.swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(|e| engine_err!(SOURCE, "vkGetSwapchainImagesKHR failed: {:?}", e))
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        if let Some(state) = &self.state {
            unsafe { state.swapchain_loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let state = self.state()?;
        match unsafe { state.swapchain_loader.acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null()) } {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(engine_err!(SOURCE, "vkAcquireNextImageKHR failed: {:?}", e)),
        }
    }

    fn queue_present(
        &mut self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let state = self.state()?;
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe { state.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(engine_err!(SOURCE, "vkQueuePresentKHR failed: {:?}", e)),
        }
    }

    // ===== VIEWS, PASSES, FRAMEBUFFERS =====

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let state = self.state()?;
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource(aspect));
        unsafe { state.device.create_image_view(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateImageView failed: {:?}", e))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_image_view(view, None) };
        }
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> Result<vk::RenderPass> {
        let state = self.state()?;
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = layout.depth_attachment.map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&layout.dependencies);
        unsafe { state.device.create_render_pass(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateRenderPass failed: {:?}", e))
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let state = self.state()?;
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { state.device.create_framebuffer(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateFramebuffer failed: {:?}", e))
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    // ===== COMMANDS AND SYNCHRONIZATION =====

    fn create_command_pool(&mut self, family: u32) -> Result<vk::CommandPool> {
        let state = self.state()?;
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { state.device.create_command_pool(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateCommandPool failed: {:?}", e))
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_command_pool(pool, None) };
        }
    }

    fn allocate_command_buffer(&mut self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let state = self.state()?;
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { state.device.allocate_command_buffers(&allocate_info) }
            .map_err(|e| engine_err!(SOURCE, "vkAllocateCommandBuffers failed: {:?}", e))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| engine_err!(SOURCE, "vkAllocateCommandBuffers returned no buffer"))
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let state = self.state()?;
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        unsafe { state.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateFence failed: {:?}", e))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fences(&mut self, fences: &[vk::Fence]) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        let state = self.state()?;
        unsafe { state.device.wait_for_fences(fences, true, u64::MAX) }
            .map_err(|e| engine_err!(SOURCE, "vkWaitForFences failed: {:?}", e))
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let state = self.state()?;
        unsafe { state.device.reset_fences(&[fence]) }
            .map_err(|e| engine_err!(SOURCE, "vkResetFences failed: {:?}", e))
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let state = self.state()?;
        unsafe { state.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateSemaphore failed: {:?}", e))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn begin_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let state = self.state()?;
        unsafe {
            state
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| engine_err!(SOURCE, "vkResetCommandBuffer failed: {:?}", e))?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            state
                .device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(|e| engine_err!(SOURCE, "vkBeginCommandBuffer failed: {:?}", e))
        }
    }

    fn end_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let state = self.state()?;
        unsafe { state.device.end_command_buffer(command_buffer) }
            .map_err(|e| engine_err!(SOURCE, "vkEndCommandBuffer failed: {:?}", e))
    }

    fn queue_submit(&mut self, queue: vk::Queue, submit: &FrameSubmit) -> Result<()> {
        let state = self.state()?;
        let wait_semaphores = [submit.wait_semaphore];
        let wait_stages = [submit.wait_stage];
        let command_buffers = [submit.command_buffer];
        let signal_semaphores = [submit.signal_semaphore];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe { state.device.queue_submit(queue, &[submit_info], submit.fence) }
            .map_err(|e| engine_err!(SOURCE, "vkQueueSubmit failed: {:?}", e))
    }

    // ===== DESCRIPTORS =====

    fn create_descriptor_pool(
        &mut self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        let state = self.state()?;
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { state.device.create_descriptor_pool(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateDescriptorPool failed: {:?}", e))
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_descriptor_pool(pool, None) };
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let state = self.state()?;
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        unsafe { state.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateDescriptorSetLayout failed: {:?}", e))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let state = self.state()?;
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        match unsafe { state.device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets
                .into_iter()
                .next()
                .ok_or_else(|| engine_err!(SOURCE, "vkAllocateDescriptorSets returned no set")),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                engine_error!(SOURCE, "Descriptor pool exhausted");
                Err(Error::DescriptorPoolExhausted)
            }
            Err(e) => Err(engine_err!(SOURCE, "vkAllocateDescriptorSets failed: {:?}", e)),
        }
    }

    fn free_descriptor_sets(&mut self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) {
        if let Some(state) = &self.state {
            if let Err(e) = unsafe { state.device.free_descriptor_sets(pool, sets) } {
                engine_warn!(SOURCE, "vkFreeDescriptorSets failed: {:?}", e);
            }
        }
    }

    fn write_texture_descriptors(&mut self, set: vk::DescriptorSet, textures: &[TextureBinding; 2]) {
        let Some(state) = &self.state else {
            return;
        };
        let image_infos = (*textures).map(|(view, _)| {
            [vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
        });
        let sampler_infos = (*textures).map(|(_, sampler)| [vk::DescriptorImageInfo::default().sampler(sampler)]);

        let mut writes = Vec::with_capacity(4);
        for unit in 0..2 {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(2 * unit as u32)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_infos[unit]),
            );
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(2 * unit as u32 + 1)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&sampler_infos[unit]),
            );
        }
        unsafe { state.device.update_descriptor_sets(&writes, &[]) };
    }

    // ===== PIPELINES =====

    fn create_pipeline_layout(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> Result<vk::PipelineLayout> {
        let state = self.state()?;
        let set_layouts = [set_layout];
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: push_constant_size,
        }];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        unsafe { state.device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreatePipelineLayout failed: {:?}", e))
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        let state = self.state()?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { state.device.create_shader_module(&create_info, None) }.map_err(|e| {
            engine_error!(SOURCE, "vkCreateShaderModule failed: {:?}", e);
            Error::ShaderCompilationFailed(format!("vkCreateShaderModule: {:?}", e))
        })
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_shader_module(module, None) };
        }
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline> {
        let state = self.state()?;
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_module)
                .name(c"main"),
        ];

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(desc.attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport::default()];
        let scissors = [vk::Rect2D::default()];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let mut rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);
        if desc.decal {
            rasterization_state = rasterization_state
                .depth_bias_enable(true)
                .depth_bias_constant_factor(-2.0)
                .depth_bias_slope_factor(-2.0)
                .depth_bias_clamp(0.0);
        }

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(desc.samples);

        let mut color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(desc.blend);
        if desc.blend {
            color_blend_attachment = color_blend_attachment
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD);
        }
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&color_blend_attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .depth_stencil_state(&depth_stencil_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            state
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_create_info], None)
        }
        .map_err(|e| engine_err!(SOURCE, "Failed to create graphics pipeline: {:?}", e.1))?;
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| engine_err!(SOURCE, "vkCreateGraphicsPipelines returned no pipeline"))
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let state = self.state()?;
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(desc.address_u)
            .address_mode_v(desc.address_v)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(0.0)
            .unnormalized_coordinates(false);
        unsafe { state.device.create_sampler(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateSampler failed: {:?}", e))
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_sampler(sampler, None) };
        }
    }

    // ===== MEMORY RESOURCES =====

    fn create_image(&mut self, desc: &ImageDesc) -> Result<GpuImage> {
        let device = self.state()?.device.clone();
        let extent3d = vk::Extent3D { width: desc.extent.width, height: desc.extent.height, depth: 1 };
        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent3d)
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "Failed to create {} image: {:?}", desc.name, e))?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(desc.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut gpu_image = GpuImage {
            image,
            view: vk::ImageView::null(),
            format: desc.format,
            extent: desc.extent,
            samples: desc.samples,
            aspect: desc.aspect,
            allocation: None,
        };

        let bound = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) };
        gpu_image.allocation = Some(allocation);
        let prepared = bound
            .map_err(|e| engine_err!(SOURCE, "Failed to bind {} image memory: {:?}", desc.name, e))
            .and_then(|_| self.create_image_view(image, desc.format, desc.aspect))
            .and_then(|view| {
                gpu_image.view = view;
                if desc.layout == vk::ImageLayout::UNDEFINED && desc.clear.is_none() {
                    return Ok(());
                }
                self.one_shot(|device, command_buffer| unsafe {
                    let mut current = vk::ImageLayout::UNDEFINED;
                    if let Some(clear) = desc.clear {
                        let to_transfer =
                            layout_barrier(image, desc.aspect, current, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                        device.cmd_pipeline_barrier(
                            command_buffer,
                            vk::PipelineStageFlags::TOP_OF_PIPE,
                            vk::PipelineStageFlags::TRANSFER,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[to_transfer],
                        );
                        let range = subresource(desc.aspect);
                        match clear {
                            ImageClear::Color(float32) => device.cmd_clear_color_image(
                                command_buffer,
                                image,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                &vk::ClearColorValue { float32 },
                                &[range],
                            ),
                            ImageClear::Depth(depth) => device.cmd_clear_depth_stencil_image(
                                command_buffer,
                                image,
                                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                                &vk::ClearDepthStencilValue { depth, stencil: 0 },
                                &[range],
                            ),
                        }
                        current = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
                    }
                    if desc.layout != current && desc.layout != vk::ImageLayout::UNDEFINED {
                        let barrier = layout_barrier(image, desc.aspect, current, desc.layout);
                        device.cmd_pipeline_barrier(
                            command_buffer,
                            vk::PipelineStageFlags::TOP_OF_PIPE | vk::PipelineStageFlags::TRANSFER,
                            vk::PipelineStageFlags::ALL_COMMANDS,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[],
                            &[barrier],
                        );
                    }
                })
            });

        match prepared {
            Ok(()) => Ok(gpu_image),
            Err(e) => {
                self.destroy_image(gpu_image);
                Err(e)
            }
        }
    }

    fn destroy_image(&mut self, mut image: GpuImage) {
        if let Some(state) = &self.state {
            unsafe {
                if image.view != vk::ImageView::null() {
                    state.device.destroy_image_view(image.view, None);
                }
                state.device.destroy_image(image.image, None);
            }
        }
        if let Some(allocation) = image.allocation.take() {
            self.free(allocation);
        }
    }

    fn upload_image(&mut self, image: &GpuImage, rgba: &[u8]) -> Result<()> {
        let expected = image.extent.width as usize * image.extent.height as usize * 4;
        if rgba.len() < expected {
            return Err(Error::InvalidResource(format!(
                "texture data is {} bytes, {}x{} RGBA needs {}",
                rgba.len(),
                image.extent.width,
                image.extent.height,
                expected
            )));
        }

        let mut staging = self.create_buffer(expected as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let uploaded = self.write_buffer(&mut staging, 0, &rgba[..expected]).and_then(|_| {
            let to_transfer = layout_barrier(
                image.image,
                image.aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            let to_shader = layout_barrier(
                image.image,
                image.aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(layers(image.aspect))
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D { width: image.extent.width, height: image.extent.height, depth: 1 });
            let staging_buffer = staging.buffer;
            let target = image.image;

            self.one_shot(|device, command_buffer| unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    staging_buffer,
                    target,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_shader],
                );
            })
        });
        self.destroy_buffer(staging);
        uploaded
    }

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        let device = self.state()?.device.clone();
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None) }
            .map_err(|e| engine_err!(SOURCE, "vkCreateBuffer failed: {:?}", e))?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let location = if usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        };
        let allocation = match self.allocate("buffer", requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(engine_err!(SOURCE, "Failed to bind buffer memory: {:?}", e));
        }

        Ok(GpuBuffer { buffer, size, allocation: Some(allocation) })
    }

    fn destroy_buffer(&mut self, mut buffer: GpuBuffer) {
        if let Some(state) = &self.state {
            unsafe { state.device.destroy_buffer(buffer.buffer, None) };
        }
        if let Some(allocation) = buffer.allocation.take() {
            self.free(allocation);
        }
    }

    fn write_buffer(&mut self, buffer: &mut GpuBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as u64;
        if end > buffer.size {
            engine_error!(SOURCE, "Buffer write {}..{} exceeds size {}", offset, end, buffer.size);
            return Err(Error::OutOfMemory);
        }
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| engine_err!(SOURCE, "Buffer is not host mapped"))?;
        mapped[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    fn read_depth(&mut self, image: &GpuImage, texels: &[(u32, u32)]) -> Result<Vec<f32>> {
        if texels.is_empty() {
            return Ok(Vec::new());
        }
        if image.samples != vk::SampleCountFlags::TYPE_1 {
            return Err(Error::InvalidResource("depth readback from a multisampled image".to_string()));
        }

        let texel_size = std::mem::size_of::<f32>() as u64;
        let staging = self.create_buffer(texels.len() as u64 * texel_size, vk::BufferUsageFlags::TRANSFER_DST)?;
        let regions: Vec<vk::BufferImageCopy> = texels
            .iter()
            .enumerate()
            .map(|(index, &(x, y))| {
                vk::BufferImageCopy::default()
                    .buffer_offset(index as u64 * texel_size)
                    .image_subresource(layers(vk::ImageAspectFlags::DEPTH))
                    .image_offset(vk::Offset3D {
                        x: x.min(image.extent.width.saturating_sub(1)) as i32,
                        y: y.min(image.extent.height.saturating_sub(1)) as i32,
                        z: 0,
                    })
                    .image_extent(vk::Extent3D { width: 1, height: 1, depth: 1 })
            })
            .collect();

        let to_transfer = layout_barrier(
            image.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        let to_attachment = layout_barrier(
            image.image,
            vk::ImageAspectFlags::DEPTH,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );
        let source = image.image;
        let destination = staging.buffer;

        let copied = self.one_shot(|device, command_buffer| unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_copy_image_to_buffer(
                command_buffer,
                source,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                destination,
                &regions,
            );
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );
        });

        let depths = copied.and_then(|_| {
            staging
                .allocation
                .as_ref()
                .and_then(|allocation| allocation.mapped_slice())
                .map(|bytes| {
                    bytes[..texels.len() * texel_size as usize]
                        .chunks_exact(texel_size as usize)
                        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                        .collect()
                })
                .ok_or_else(|| engine_err!(SOURCE, "Depth readback buffer is not host mapped"))
        });
        self.destroy_buffer(staging);
        depths
    }

    // ===== RECORDING =====

    fn cmd_begin_render_pass(&mut self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        if let Some(state) = &self.state {
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(begin.render_pass)
                .framebuffer(begin.framebuffer)
                .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: begin.extent })
                .clear_values(&begin.clear_values);
            unsafe {
                state
                    .device
                    .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE)
            };
        }
    }

    fn cmd_end_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        if let Some(state) = &self.state {
            unsafe { state.device.cmd_end_render_pass(command_buffer) };
        }
    }

    fn cmd_bind_pipeline(&mut self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        if let Some(state) = &self.state {
            unsafe {
                state
                    .device
                    .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
            };
        }
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        if let Some(state) = &self.state {
            unsafe {
                state.device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &[set],
                    &[],
                )
            };
        }
    }

    fn cmd_push_constants(&mut self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, bytes: &[u8]) {
        if let Some(state) = &self.state {
            unsafe {
                state
                    .device
                    .cmd_push_constants(command_buffer, layout, vk::ShaderStageFlags::FRAGMENT, 0, bytes)
            };
        }
    }

    fn cmd_set_viewport(&mut self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        if let Some(state) = &self.state {
            unsafe { state.device.cmd_set_viewport(command_buffer, 0, &[viewport]) };
        }
    }

    fn cmd_set_scissor(&mut self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        if let Some(state) = &self.state {
            unsafe { state.device.cmd_set_scissor(command_buffer, 0, &[scissor]) };
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64) {
        if let Some(state) = &self.state {
            unsafe { state.device.cmd_bind_vertex_buffers(command_buffer, 0, &[buffer], &[offset]) };
        }
    }

    fn cmd_draw(&mut self, command_buffer: vk::CommandBuffer, vertex_count: u32, first_vertex: u32) {
        if let Some(state) = &self.state {
            unsafe { state.device.cmd_draw(command_buffer, vertex_count, 1, first_vertex, 0) };
        }
    }

    fn cmd_clear_attachments(&mut self, command_buffer: vk::CommandBuffer, clear: &AttachmentClear) {
        let Some(state) = &self.state else {
            return;
        };
        let mut attachments = Vec::with_capacity(2);
        if let Some(color) = clear.color {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue { color: vk::ClearColorValue { float32: color } },
            });
        }
        if let Some(depth) = clear.depth {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                },
            });
        }
        if attachments.is_empty() {
            return;
        }
        let rects = [vk::ClearRect { rect: clear.rect, base_array_layer: 0, layer_count: 1 }];
        unsafe { state.device.cmd_clear_attachments(command_buffer, &attachments, &rects) };
    }

    fn cmd_resolve_image(&mut self, command_buffer: vk::CommandBuffer, source: &GpuImage, target: &GpuImage) {
        let Some(state) = &self.state else {
            return;
        };
        let aspect = vk::ImageAspectFlags::COLOR;
        let before = [
            layout_barrier(
                source.image,
                aspect,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ),
            layout_barrier(
                target.image,
                aspect,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
        ];
        let after = [
            layout_barrier(
                source.image,
                aspect,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            layout_barrier(
                target.image,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        ];
        let extent = vk::Extent3D {
            width: source.extent.width.min(target.extent.width),
            height: source.extent.height.min(target.extent.height),
            depth: 1,
        };
        let region = vk::ImageResolve::default()
            .src_subresource(layers(aspect))
            .src_offset(vk::Offset3D::default())
            .dst_subresource(layers(aspect))
            .dst_offset(vk::Offset3D::default())
            .extent(extent);

        unsafe {
            state.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &before,
            );
            state.device.cmd_resolve_image(
                command_buffer,
                source.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            state.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &after,
            );
        }
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        unsafe {
            if let Some(mut state) = self.state.take() {
                state.device.device_wait_idle().ok();
                // Allocator must go before the device it allocates from
                drop(state.allocator.take());
                state.device.destroy_command_pool(state.upload_pool, None);
                state.device.destroy_device(None);
            }
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
