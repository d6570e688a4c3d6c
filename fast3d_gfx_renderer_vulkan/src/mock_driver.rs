/// Mock DeviceDriver for unit tests (no GPU required)
///
/// Hands out fake handles from a counter, keeps the set of live objects per
/// kind and records notable calls by name. Fence usage is checked as the
/// GPU would enforce it: a command buffer is never begun while its last
/// submission is unwaited and a fence is never reset or resubmitted while
/// in flight. Violations are collected instead of panicking.
///
/// All state sits behind an `Arc<Mutex<_>>` so tests can keep a handle on
/// it after the driver moved into the backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use ash::vk::Handle;
use fast3d_gfx::fast3d::{Error, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::vulkan_driver::{
    AcquireOutcome, AttachmentClear, DeviceDriver, DeviceSelection, FrameSubmit, GpuBuffer, GpuImage,
    GraphicsPipelineDesc, ImageClear, ImageDesc, PhysicalDeviceInfo, PresentOutcome, QueueFamilyInfo, RenderPassBegin,
    RenderPassLayout, SamplerDesc, SurfaceSupport, SwapchainDesc, TextureBinding,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    InFlight,
}

#[derive(Debug)]
pub struct MockState {
    /// Notable calls in order
    pub calls: Vec<String>,
    /// Synchronization or lifetime mistakes
    pub violations: Vec<String>,
    live: FxHashMap<&'static str, FxHashSet<u64>>,
    next_handle: u64,

    /// Devices report queue families
    pub queue_families: bool,
    pub extent: vk::Extent2D,
    pub surface_format: vk::Format,
    pub min_image_count: u32,
    /// Outcomes returned by the next acquires, then round-robin images
    pub acquire_script: VecDeque<AcquireOutcome>,
    pub present_script: VecDeque<PresentOutcome>,
    /// Value returned for every depth texel
    pub depth: f32,
    pub depth_reads: Vec<Vec<(u32, u32)>>,
    pub draws: Vec<u32>,
    pub uploads: usize,
    /// Initial clears requested at image creation
    pub image_clears: Vec<ImageClear>,
    /// Make the next swapchain creations and submits fail
    pub fail_swapchain: bool,
    pub fail_submit: bool,

    swapchain_images: FxHashMap<u64, u32>,
    next_image: u32,
    fences: FxHashMap<u64, FenceState>,
    /// Command buffer -> fence of its unwaited submission
    pending: FxHashMap<u64, u64>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            violations: Vec::new(),
            live: FxHashMap::default(),
            next_handle: 1,
            queue_families: true,
            extent: vk::Extent2D { width: 640, height: 480 },
            surface_format: vk::Format::B8G8R8A8_UNORM,
            min_image_count: 2,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            depth: 0.5,
            depth_reads: Vec::new(),
            draws: Vec::new(),
            uploads: 0,
            image_clears: Vec::new(),
            fail_swapchain: false,
            fail_submit: false,
            swapchain_images: FxHashMap::default(),
            next_image: 0,
            fences: FxHashMap::default(),
            pending: FxHashMap::default(),
        }
    }
}

impl MockState {
    pub fn live_count(&self, kind: &str) -> usize {
        self.live.get(kind).map_or(0, |handles| handles.len())
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|call| call.as_str() == name).count()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.calls.iter().position(|call| call == name)
    }

    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }

    fn create<H: Handle>(&mut self, kind: &'static str) -> H {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.live.entry(kind).or_default().insert(raw);
        H::from_raw(raw)
    }

    fn destroy<H: Handle>(&mut self, kind: &'static str, handle: H) {
        let raw = handle.as_raw();
        if !self.live.entry(kind).or_default().remove(&raw) {
            self.violations.push(format!("{} {} destroyed but not live", kind, raw));
        }
    }
}

pub type SharedMockState = Arc<Mutex<MockState>>;

#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    pub state: SharedMockState,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MockState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl DeviceDriver for MockDriver {
    // ===== DEVICE =====

    fn physical_devices(&mut self) -> Result<Vec<PhysicalDeviceInfo>> {
        let mut state = self.lock();
        state.record("physical_devices");
        let queue_families = if state.queue_families {
            vec![QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                supports_present: true,
            }]
        } else {
            Vec::new()
        };
        Ok(vec![PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::from_raw(0x1000),
            name: "Mock GPU".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            queue_families,
        }])
    }

    fn create_logical_device(&mut self, _selection: &DeviceSelection) -> Result<()> {
        self.lock().record("create_logical_device");
        Ok(())
    }

    fn device_queue(&mut self, family: u32) -> Result<vk::Queue> {
        self.lock().record("device_queue");
        Ok(vk::Queue::from_raw(0x2000 + family as u64))
    }

    fn device_wait_idle(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.record("device_wait_idle");
        for fence in state.fences.values_mut() {
            if *fence == FenceState::InFlight {
                *fence = FenceState::Signaled;
            }
        }
        state.pending.clear();
        Ok(())
    }

    // ===== SWAPCHAIN =====

    fn surface_support(&mut self, _physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        let mut state = self.lock();
        state.record("surface_support");
        Ok(SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: state.min_image_count,
                max_image_count: 8,
                current_extent: state.extent,
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: state.surface_format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        })
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc, _old: vk::SwapchainKHR) -> Result<vk::SwapchainKHR> {
        let mut state = self.lock();
        state.record("create_swapchain");
        if state.fail_swapchain {
            return Err(Error::BackendError("surface lost".to_string()));
        }
        let swapchain: vk::SwapchainKHR = state.create("swapchain");
        state.swapchain_images.insert(swapchain.as_raw(), desc.image_count);
        state.next_image = 0;
        Ok(swapchain)
    }

    fn swapchain_images(&mut self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let state = self.lock();
        let count = state.swapchain_images.get(&swapchain.as_raw()).copied().unwrap_or(0);
        Ok((0..count).map(|index| vk::Image::from_raw(0x10_0000 + index as u64)).collect())
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        let mut state = self.lock();
        state.record("destroy_swapchain");
        state.swapchain_images.remove(&swapchain.as_raw());
        state.destroy("swapchain", swapchain);
    }

    fn acquire_next_image(&mut self, swapchain: vk::SwapchainKHR, _signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let mut state = self.lock();
        state.record("acquire");
        if let Some(outcome) = state.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let count = state.swapchain_images.get(&swapchain.as_raw()).copied().unwrap_or(1).max(1);
        let image_index = state.next_image % count;
        state.next_image += 1;
        Ok(AcquireOutcome::Acquired { image_index, suboptimal: false })
    }

    fn queue_present(
        &mut self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        _image_index: u32,
        _wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let mut state = self.lock();
        state.record("present");
        Ok(state.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }

    // ===== VIEWS, PASSES, FRAMEBUFFERS =====

    fn create_image_view(
        &mut self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        Ok(self.lock().create("image_view"))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.lock().destroy("image_view", view);
    }

    fn create_render_pass(&mut self, _layout: &RenderPassLayout) -> Result<vk::RenderPass> {
        let mut state = self.lock();
        state.record("create_render_pass");
        Ok(state.create("render_pass"))
    }

    fn destroy_render_pass(&mut self, render_pass: vk::RenderPass) {
        self.lock().destroy("render_pass", render_pass);
    }

    fn create_framebuffer(
        &mut self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(self.lock().create("framebuffer"))
    }

    fn destroy_framebuffer(&mut self, framebuffer: vk::Framebuffer) {
        self.lock().destroy("framebuffer", framebuffer);
    }

    // ===== COMMANDS AND SYNCHRONIZATION =====

    fn create_command_pool(&mut self, _family: u32) -> Result<vk::CommandPool> {
        Ok(self.lock().create("command_pool"))
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        self.lock().destroy("command_pool", pool);
    }

    fn allocate_command_buffer(&mut self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.lock();
        let raw = state.next_handle;
        state.next_handle += 1;
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.lock();
        let fence: vk::Fence = state.create("fence");
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence.as_raw(), initial);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        let mut state = self.lock();
        if state.fences.remove(&fence.as_raw()) == Some(FenceState::InFlight) {
            state.violations.push(format!("fence {} destroyed while in flight", fence.as_raw()));
        }
        state.destroy("fence", fence);
    }

    fn wait_for_fences(&mut self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.lock();
        state.record("wait_fences");
        for fence in fences {
            let raw = fence.as_raw();
            match state.fences.get(&raw).copied() {
                Some(FenceState::Unsignaled) => {
                    state.violations.push(format!("wait on fence {} that was never submitted", raw));
                }
                Some(_) => {
                    state.fences.insert(raw, FenceState::Signaled);
                    state.pending.retain(|_, pending| *pending != raw);
                }
                None => state.violations.push(format!("wait on unknown fence {}", raw)),
            }
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let mut state = self.lock();
        state.record("reset_fence");
        let raw = fence.as_raw();
        if state.fences.get(&raw) == Some(&FenceState::InFlight) {
            state.violations.push(format!("fence {} reset while in flight", raw));
        }
        state.fences.insert(raw, FenceState::Unsignaled);
        Ok(())
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        Ok(self.lock().create("semaphore"))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.lock().destroy("semaphore", semaphore);
    }

    fn begin_command_buffer(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.lock();
        state.record("begin_command_buffer");
        if let Some(fence) = state.pending.get(&command_buffer.as_raw()).copied() {
            state.violations.push(format!(
                "command buffer {} re-recorded before fence {} was waited",
                command_buffer.as_raw(),
                fence
            ));
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, _command_buffer: vk::CommandBuffer) -> Result<()> {
        self.lock().record("end_command_buffer");
        Ok(())
    }

    fn queue_submit(&mut self, _queue: vk::Queue, submit: &FrameSubmit) -> Result<()> {
        let mut state = self.lock();
        state.record("submit");
        if state.fail_submit {
            return Err(Error::BackendError("device lost".to_string()));
        }
        let fence = submit.fence.as_raw();
        if state.fences.get(&fence) != Some(&FenceState::Unsignaled) {
            state.violations.push(format!("submit with fence {} that was not reset", fence));
        }
        state.fences.insert(fence, FenceState::InFlight);
        state.pending.insert(submit.command_buffer.as_raw(), fence);
        Ok(())
    }

    // ===== DESCRIPTORS =====

    fn create_descriptor_pool(
        &mut self,
        _sizes: &[vk::DescriptorPoolSize],
        _max_sets: u32,
    ) -> Result<vk::DescriptorPool> {
        Ok(self.lock().create("descriptor_pool"))
    }

    fn destroy_descriptor_pool(&mut self, pool: vk::DescriptorPool) {
        self.lock().destroy("descriptor_pool", pool);
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.lock().create("descriptor_set_layout"))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.lock().destroy("descriptor_set_layout", layout);
    }

    fn allocate_descriptor_set(
        &mut self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        Ok(self.lock().create("descriptor_set"))
    }

    fn free_descriptor_sets(&mut self, _pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) {
        let mut state = self.lock();
        for &set in sets {
            state.destroy("descriptor_set", set);
        }
    }

    fn write_texture_descriptors(&mut self, _set: vk::DescriptorSet, _textures: &[TextureBinding; 2]) {
        self.lock().record("write_descriptors");
    }

    // ===== PIPELINES =====

    fn create_pipeline_layout(
        &mut self,
        _set_layout: vk::DescriptorSetLayout,
        _push_constant_size: u32,
    ) -> Result<vk::PipelineLayout> {
        Ok(self.lock().create("pipeline_layout"))
    }

    fn destroy_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.lock().destroy("pipeline_layout", layout);
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.first() != Some(&0x0723_0203) {
            return Err(Error::ShaderCompilationFailed("not SPIR-V".to_string()));
        }
        Ok(self.lock().create("shader_module"))
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.lock().destroy("shader_module", module);
    }

    fn create_graphics_pipeline(&mut self, _desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline> {
        let mut state = self.lock();
        state.record("create_pipeline");
        Ok(state.create("pipeline"))
    }

    fn destroy_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.lock().destroy("pipeline", pipeline);
    }

    fn create_sampler(&mut self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(self.lock().create("sampler"))
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.lock().destroy("sampler", sampler);
    }

    // ===== MEMORY RESOURCES =====

    fn create_image(&mut self, desc: &ImageDesc) -> Result<GpuImage> {
        let mut state = self.lock();
        if let Some(clear) = desc.clear {
            state.record("clear_image");
            state.image_clears.push(clear);
        }
        let image = state.create("image");
        let view = state.create("image_view");
        Ok(GpuImage {
            image,
            view,
            format: desc.format,
            extent: desc.extent,
            samples: desc.samples,
            aspect: desc.aspect,
            allocation: None,
        })
    }

    fn destroy_image(&mut self, image: GpuImage) {
        let mut state = self.lock();
        state.destroy("image_view", image.view);
        state.destroy("image", image.image);
    }

    fn upload_image(&mut self, image: &GpuImage, rgba: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let expected = image.extent.width as usize * image.extent.height as usize * 4;
        if rgba.len() != expected {
            state.violations.push(format!("upload of {} bytes into a {}-byte image", rgba.len(), expected));
        }
        state.uploads += 1;
        Ok(())
    }

    fn create_buffer(&mut self, size: u64, _usage: vk::BufferUsageFlags) -> Result<GpuBuffer> {
        let buffer = self.lock().create("buffer");
        Ok(GpuBuffer { buffer, size, allocation: None })
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.lock().destroy("buffer", buffer.buffer);
    }

    fn write_buffer(&mut self, buffer: &mut GpuBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() as u64 > buffer.size {
            return Err(Error::OutOfMemory);
        }
        Ok(())
    }

    fn read_depth(&mut self, image: &GpuImage, texels: &[(u32, u32)]) -> Result<Vec<f32>> {
        let mut state = self.lock();
        state.record("read_depth");
        if image.samples != vk::SampleCountFlags::TYPE_1 {
            return Err(Error::InvalidResource("multisampled depth".to_string()));
        }
        state.depth_reads.push(texels.to_vec());
        Ok(vec![state.depth; texels.len()])
    }

    // ===== RECORDING =====

    fn cmd_begin_render_pass(&mut self, _command_buffer: vk::CommandBuffer, _begin: &RenderPassBegin) {
        self.lock().record("begin_render_pass");
    }

    fn cmd_end_render_pass(&mut self, _command_buffer: vk::CommandBuffer) {
        self.lock().record("end_render_pass");
    }

    fn cmd_bind_pipeline(&mut self, _command_buffer: vk::CommandBuffer, _pipeline: vk::Pipeline) {}

    fn cmd_bind_descriptor_set(
        &mut self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _set: vk::DescriptorSet,
    ) {
    }

    fn cmd_push_constants(&mut self, _command_buffer: vk::CommandBuffer, _layout: vk::PipelineLayout, _bytes: &[u8]) {}

    fn cmd_set_viewport(&mut self, _command_buffer: vk::CommandBuffer, _viewport: vk::Viewport) {}

    fn cmd_set_scissor(&mut self, _command_buffer: vk::CommandBuffer, _scissor: vk::Rect2D) {}

    fn cmd_bind_vertex_buffer(&mut self, _command_buffer: vk::CommandBuffer, _buffer: vk::Buffer, _offset: u64) {}

    fn cmd_draw(&mut self, _command_buffer: vk::CommandBuffer, vertex_count: u32, _first_vertex: u32) {
        let mut state = self.lock();
        state.record("draw");
        state.draws.push(vertex_count);
    }

    fn cmd_clear_attachments(&mut self, _command_buffer: vk::CommandBuffer, _clear: &AttachmentClear) {
        self.lock().record("clear_attachments");
    }

    fn cmd_resolve_image(&mut self, _command_buffer: vk::CommandBuffer, _source: &GpuImage, _target: &GpuImage) {
        self.lock().record("resolve_image");
    }
}
