/// DeviceDriver - the seam between the backend and the Vulkan API
///
/// Every Vulkan call the backend makes goes through this trait. `AshDriver`
/// forwards to the real device; the test driver records calls and hands out
/// fake handles so bootstrap, resize and fence bookkeeping can be exercised
/// without a GPU.
///
/// Methods take plain handles and small descriptor structs. Ownership of
/// every returned handle stays with the caller, which must destroy it through
/// the matching `destroy_*` call.

use ash::vk;
use fast3d_gfx::fast3d::Result;
use gpu_allocator::vulkan::Allocation;

// ============================================================================
// Device discovery
// ============================================================================

/// One queue family of a physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Can present to the window surface
    pub supports_present: bool,
}

/// A candidate physical device
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<QueueFamilyInfo>,
}

/// Outcome of physical device selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub graphics_family: u32,
    pub present_family: u32,
}

// ============================================================================
// Swapchain
// ============================================================================

/// What the window surface supports on the selected device
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// One frame's queue submission
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmit {
    pub command_buffer: vk::CommandBuffer,
    /// Image-available semaphore of the acquire
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    /// Render-finished semaphore the present waits on
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

// ============================================================================
// Memory resources
// ============================================================================

/// Image plus its single view and backing memory
#[derive(Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    pub allocation: Option<Allocation>,
}

/// Initial contents written before the layout transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageClear {
    Color([f32; 4]),
    Depth(f32),
}

/// Image creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    /// Layout the image is transitioned to right after creation
    pub layout: vk::ImageLayout,
    /// Needs TRANSFER_DST usage
    pub clear: Option<ImageClear>,
    pub name: &'static str,
}

/// Host-visible buffer (CpuToGpu)
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub allocation: Option<Allocation>,
}

// ============================================================================
// Pipelines and recording
// ============================================================================

/// Render pass description; attachment 0 is always the color attachment
#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub depth_attachment: Option<u32>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

#[derive(Clone)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: Vec<vk::ClearValue>,
}

/// In-pass clear of the bound attachments
#[derive(Debug, Clone, Copy)]
pub struct AttachmentClear {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub rect: vk::Rect2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
}

/// Fixed-function state of one graphics pipeline
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub samples: vk::SampleCountFlags,
    pub vertex_stride: u32,
    pub attributes: &'a [vk::VertexInputAttributeDescription],
    pub depth_test: bool,
    pub depth_write: bool,
    /// Decal z-mode: pulled towards the viewer with a depth bias
    pub decal: bool,
    pub blend: bool,
}

/// Image view and sampler bound to one texture unit
pub type TextureBinding = (vk::ImageView, vk::Sampler);

// ============================================================================
// DeviceDriver trait
// ============================================================================

pub trait DeviceDriver {
    // ===== DEVICE =====

    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>>;

    fn create_logical_device(&mut self, selection: &DeviceSelection) -> Result<()>;

    fn device_queue(&mut self, family: u32) -> Result<vk::Queue>;

    fn device_wait_idle(&mut self) -> Result<()>;

    // ===== SWAPCHAIN =====

    fn surface_support(&mut self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport>;

    /// `old` is retired by the new swapchain but must still be destroyed by
    /// the caller
    fn create_swapchain(&mut self, desc: &SwapchainDesc, old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR>;

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore) -> Result<AcquireOutcome>;

    fn queue_present(
        &mut self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;

    // ===== VIEWS, PASSES, FRAMEBUFFERS =====

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;

    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> Result<vk::RenderPass>;

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer);

    // ===== COMMANDS AND SYNCHRONIZATION =====

    /// Pool whose command buffers can be reset individually
    fn create_command_pool(&mut self, family: u32) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&mut self, pool: vk::CommandPool);

    fn allocate_command_buffer(&mut self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&mut self, fence: vk::Fence);

    /// Block until every fence is signaled
    fn wait_for_fences(&mut self, fences: &[vk::Fence]) -> Result<()>;

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    /// Reset and begin one-time recording
    fn begin_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn end_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn queue_submit(&mut self, queue: vk::Queue, submit: &FrameSubmit) -> Result<()>;

    // ===== DESCRIPTORS =====

    fn create_descriptor_pool(
        &mut self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool);

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout);

    /// Pool exhaustion is `Error::DescriptorPoolExhausted`
    fn allocate_descriptor_set(
        &mut self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet>;

    fn free_descriptor_sets(&mut self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]);

    /// Write both texture units (sampled image + sampler binding pairs)
    fn write_texture_descriptors(&mut self, set: vk::DescriptorSet, textures: &[TextureBinding; 2]);

    // ===== PIPELINES =====

    fn create_pipeline_layout(
        &mut self,
        set_layout: vk::DescriptorSetLayout,
        push_constant_size: u32,
    ) -> Result<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout);

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule>;

    fn destroy_shader_module(&mut self, module: vk::ShaderModule);

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline>;

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline);

    fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<vk::Sampler>;

    fn destroy_sampler(&mut self, sampler: vk::Sampler);

    // ===== MEMORY RESOURCES =====

    fn create_image(&mut self, desc: &ImageDesc) -> Result<GpuImage>;

    fn destroy_image(&mut self, image: GpuImage);

    /// Copy tightly packed RGBA8 pixels into a sampled image (blocking)
    fn upload_image(&mut self, image: &GpuImage, rgba: &[u8]) -> Result<()>;

    fn create_buffer(&mut self, size: u64, usage: vk::BufferUsageFlags) -> Result<GpuBuffer>;

    fn destroy_buffer(&mut self, buffer: GpuBuffer);

    fn write_buffer(&mut self, buffer: &mut GpuBuffer, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Read normalized depth at texel coordinates of a single-sample depth
    /// image (blocking)
    fn read_depth(&mut self, image: &GpuImage, texels: &[(u32, u32)]) -> Result<Vec<f32>>;

    // ===== RECORDING =====

    fn cmd_begin_render_pass(&mut self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);

    fn cmd_end_render_pass(&mut self, command_buffer: vk::CommandBuffer);

    fn cmd_bind_pipeline(&mut self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );

    fn cmd_push_constants(&mut self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, bytes: &[u8]);

    fn cmd_set_viewport(&mut self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);

    fn cmd_set_scissor(&mut self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);

    fn cmd_bind_vertex_buffer(&mut self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64);

    fn cmd_draw(&mut self, command_buffer: vk::CommandBuffer, vertex_count: u32, first_vertex: u32);

    fn cmd_clear_attachments(&mut self, command_buffer: vk::CommandBuffer, clear: &AttachmentClear);

    /// Resolve a multisampled color image into a single-sample one; both are
    /// left in SHADER_READ_ONLY_OPTIMAL
    fn cmd_resolve_image(&mut self, command_buffer: vk::CommandBuffer, source: &GpuImage, target: &GpuImage);
}
