/// VulkanRenderingApi - the `RenderingApi` contract on top of a `DeviceDriver`
///
/// One swapchain slot per image records one frame at a time:
///
/// - `start_frame` acquires an image, waits the slot's fence, releases what
///   the slot's previous submission referenced and begins its command buffer
/// - render passes open lazily on the first draw or clear of a target and
///   close when the target changes or the frame ends
/// - `end_frame` submits with the slot's fence and presents
///
/// The acquire signals a spare semaphore which is then swapped into the
/// slot, since the image index (and so the slot) is only known afterwards.
///
/// `submitted` has one bit per slot with work on the GPU. Objects replaced
/// while a bit is set (or while a frame records) go through the
/// `RetirementQueue` instead of being destroyed in place.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use fast3d_gfx::fast3d::combiner::{ColorCombinerKey, FeatureDescriptor};
use fast3d_gfx::fast3d::render::{
    depth_to_u16, ClipParameters, FilteringMode, FramebufferId, FramebufferParameters,
    RendererConfig, SamplerParameters, TextureId,
};
use fast3d_gfx::fast3d::shader::{ShaderCache, ShaderProgram};
use fast3d_gfx::fast3d::{Error, NativeWindow, RenderingApi, Result};
use fast3d_gfx::{engine_bail, engine_debug, engine_err, engine_error, engine_info, engine_trace, engine_warn};
use rustc_hash::FxHashMap;

use crate::vulkan_context::{BootstrapState, DeviceContext};
use crate::vulkan_device::AshDriver;
use crate::vulkan_driver::{
    AcquireOutcome, AttachmentClear, DeviceDriver, FrameSubmit, GpuImage, ImageDesc, PresentOutcome,
    RenderPassBegin, TextureBinding,
};
use crate::vulkan_frame_buffer::{OffscreenFramebuffer, Retired, RetirementQueue, SwapchainFramebuffer};
use crate::vulkan_pipeline::{PipelineCache, PipelineKey};
use crate::vulkan_render_pass::{swapchain_pass_layout, OffscreenPassCache, RenderPassKind};
use crate::vulkan_sampler::{sampler_desc, shader_filtering, SamplerCache};
use crate::vulkan_shader::VulkanShaderProgram;
use crate::vulkan_shader_source::{FrameConstants, PUSH_CONSTANT_SIZE};
use crate::vulkan_texture::TextureTable;

const SOURCE: &str = "fast3d::vulkan";

/// Name the backend registers under
pub const BACKEND_NAME: &str = "vulkan";

/// Texture units of every combiner program
pub const TEXTURE_UNITS: usize = 2;

/// Format of uploaded textures
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Swapchain slots tracked by the in-flight bitmask
const MAX_SLOTS: usize = u64::BITS as usize;

/// Opens the driver once a window is available
pub type DriverLoader<D> = Box<dyn FnOnce(&dyn NativeWindow, &RendererConfig) -> Result<D>>;

struct Device<D> {
    driver: D,
    context: DeviceContext,
}

/// What a texture unit samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextureSource {
    Texture(TextureId),
    Framebuffer(FramebufferId),
}

/// Rectangle in framebuffer pixels, origin at the bottom-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    fn full(extent: vk::Extent2D) -> Self {
        Self::new(0, 0, extent.width as i32, extent.height as i32)
    }

    /// First row of the rectangle in Vulkan's top-left framebuffer space
    fn top_row(&self, extent: vk::Extent2D, invert_y: bool) -> i32 {
        if invert_y {
            self.y
        } else {
            extent.height as i32 - self.y - self.height
        }
    }
}

/// Vulkan viewport for a bottom-left origin rectangle
///
/// Targets with `invert_y` keep their rows bottom-up, which a negative
/// viewport height produces.
pub fn viewport_for(rect: Rect, extent: vk::Extent2D, invert_y: bool) -> vk::Viewport {
    let top = rect.top_row(extent, invert_y) as f32;
    let height = rect.height as f32;
    let (y, height) = if invert_y { (top + height, -height) } else { (top, height) };
    vk::Viewport {
        x: rect.x as f32,
        y,
        width: rect.width as f32,
        height,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Vulkan scissor for a bottom-left origin rectangle, clipped to the target
pub fn scissor_for(rect: Rect, extent: vk::Extent2D, invert_y: bool) -> vk::Rect2D {
    let top = rect.top_row(extent, invert_y);
    let x0 = rect.x.clamp(0, extent.width as i32);
    let y0 = top.clamp(0, extent.height as i32);
    let x1 = (rect.x + rect.width).clamp(x0, extent.width as i32);
    let y1 = (top + rect.height).clamp(y0, extent.height as i32);
    vk::Rect2D {
        offset: vk::Offset2D { x: x0, y: y0 },
        extent: vk::Extent2D { width: (x1 - x0) as u32, height: (y1 - y0) as u32 },
    }
}

/// Texel of a depth image for bottom-left origin coordinates
pub fn depth_texel(coordinate: (f32, f32), extent: vk::Extent2D, invert_y: bool) -> (u32, u32) {
    let max_x = extent.width.saturating_sub(1);
    let max_y = extent.height.saturating_sub(1);
    let column = (coordinate.0.max(0.0) as u32).min(max_x);
    let row = (coordinate.1.max(0.0) as u32).min(max_y);
    (column, if invert_y { row } else { max_y - row })
}

/// Bindings 0/1 and 2/3: sampled image + sampler of each texture unit
fn texture_set_layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 2 * TEXTURE_UNITS] {
    std::array::from_fn(|binding| {
        let descriptor_type = if binding % 2 == 0 {
            vk::DescriptorType::SAMPLED_IMAGE
        } else {
            vk::DescriptorType::SAMPLER
        };
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding as u32)
            .descriptor_type(descriptor_type)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
    })
}

/// Sampled RGBA8 image filled with `rgba`
fn create_texture_image<D: DeviceDriver>(driver: &mut D, width: u32, height: u32, rgba: &[u8]) -> Result<GpuImage> {
    let image = driver.create_image(&ImageDesc {
        extent: vk::Extent2D { width, height },
        format: TEXTURE_FORMAT,
        usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        samples: vk::SampleCountFlags::TYPE_1,
        aspect: vk::ImageAspectFlags::COLOR,
        layout: vk::ImageLayout::UNDEFINED,
        clear: None,
        name: "texture",
    })?;
    if let Err(e) = driver.upload_image(&image, rgba) {
        driver.destroy_image(image);
        return Err(e);
    }
    Ok(image)
}

fn not_initialized() -> Error {
    Error::BackendError("Vulkan backend is not initialized".to_string())
}

fn invalid_framebuffer(fb: FramebufferId) -> Error {
    Error::InvalidResource(format!("framebuffer {} is unknown or has no storage", fb.raw()))
}

/// Name the bootstrap step a failure belongs to
fn init_step(step: &str, error: Error) -> Error {
    match error {
        Error::InitializationFailed(_) => error,
        other => {
            engine_error!(SOURCE, "Bootstrap step '{}' failed: {}", step, other);
            Error::InitializationFailed(format!("{}: {}", step, other))
        }
    }
}

/// Draw state set between draws
#[derive(Debug, Clone)]
struct DrawState {
    active_tile: usize,
    textures: [Option<TextureSource>; TEXTURE_UNITS],
    samplers: [SamplerParameters; TEXTURE_UNITS],
    filter: FilteringMode,
    depth_test: bool,
    depth_mask: bool,
    decal: bool,
    use_alpha: bool,
    /// Full target until set
    viewport: Option<Rect>,
    scissor: Option<Rect>,
    target: FramebufferId,
    noise_scale: f32,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            active_tile: 0,
            textures: [None; TEXTURE_UNITS],
            samplers: [SamplerParameters::default(); TEXTURE_UNITS],
            filter: FilteringMode::default(),
            depth_test: false,
            depth_mask: false,
            decal: false,
            use_alpha: false,
            viewport: None,
            scissor: None,
            target: FramebufferId::MAIN,
            noise_scale: 1.0,
        }
    }
}

/// The frame being recorded
#[derive(Debug, Clone, Copy)]
struct FrameState {
    slot: usize,
    image_index: u32,
    open_pass: Option<FramebufferId>,
    main_pass_begun: bool,
}

/// Vulkan backend
pub struct VulkanRenderingApi<D: DeviceDriver = AshDriver> {
    config: RendererConfig,
    loader: Option<DriverLoader<D>>,
    device: Option<Device<D>>,
    state: BootstrapState,
    window_size: (u32, u32),
    needs_rebuild: bool,

    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    swapchain_pass: vk::RenderPass,
    offscreen_passes: OffscreenPassCache,
    slots: Vec<SwapchainFramebuffer>,
    spare_semaphore: vk::Semaphore,

    shaders: ShaderCache<VulkanShaderProgram>,
    pipelines: PipelineCache,
    samplers: SamplerCache,
    textures: TextureTable,
    white_texture: Option<GpuImage>,
    framebuffers: FxHashMap<FramebufferId, OffscreenFramebuffer>,
    next_framebuffer: u64,
    retired: RetirementQueue,

    submitted: u64,
    frame: Option<FrameState>,
    frame_count: i32,
    draw: DrawState,
}

impl VulkanRenderingApi<AshDriver> {
    /// Backend on the system Vulkan loader; nothing is created before `init`
    pub fn new(config: RendererConfig) -> Self {
        Self::with_loader(config, AshDriver::new)
    }
}

impl<D: DeviceDriver> VulkanRenderingApi<D> {
    /// Backend whose driver comes from `loader`
    pub fn with_loader<F>(config: RendererConfig, loader: F) -> Self
    where
        F: FnOnce(&dyn NativeWindow, &RendererConfig) -> Result<D> + 'static,
    {
        Self {
            config,
            loader: Some(Box::new(loader)),
            device: None,
            state: BootstrapState::Uninitialized,
            window_size: (0, 0),
            needs_rebuild: false,
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            swapchain_pass: vk::RenderPass::null(),
            offscreen_passes: OffscreenPassCache::default(),
            slots: Vec::new(),
            spare_semaphore: vk::Semaphore::null(),
            shaders: ShaderCache::new(),
            pipelines: PipelineCache::new(),
            samplers: SamplerCache::new(),
            textures: TextureTable::new(),
            white_texture: None,
            framebuffers: FxHashMap::default(),
            next_framebuffer: 1,
            retired: RetirementQueue::new(),
            submitted: 0,
            frame: None,
            frame_count: 0,
            draw: DrawState::default(),
        }
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.state
    }

    pub fn frame_count(&self) -> i32 {
        self.frame_count
    }

    pub fn in_frame(&self) -> bool {
        self.frame.is_some()
    }

    #[cfg(test)]
    pub(crate) fn driver(&self) -> Option<&D> {
        self.device.as_ref().map(|device| &device.driver)
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn swapchain_render_pass(&self) -> vk::RenderPass {
        self.swapchain_pass
    }

    #[cfg(test)]
    pub(crate) fn retired_count(&self) -> usize {
        self.retired.len()
    }

    #[cfg(test)]
    pub(crate) fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    // ===== BOOTSTRAP =====

    /// Steps 3 to 7 once the device exists
    fn bootstrap(&mut self) -> Result<()> {
        let vsync = self.config.vsync;
        let window_size = self.window_size;
        let vertex_buffer_size = self.config.vertex_buffer_size;
        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };

        match context.rebuild_swapchain(driver, window_size, vsync) {
            Ok(_) => self.state = BootstrapState::SwapchainReady,
            Err(Error::SwapchainOutOfDate) => {
                engine_warn!(SOURCE, "Window has no drawable area yet, swapchain deferred to the first frame");
                self.needs_rebuild = true;
            }
            Err(e) => return Err(init_step("swapchain", e)),
        }

        context.fetch_queues(driver)?;
        context.create_descriptor_pool(driver)?;

        self.set_layout = driver
            .create_descriptor_set_layout(&texture_set_layout_bindings())
            .map_err(|e| init_step("descriptor set layout", e))?;
        self.pipeline_layout = driver
            .create_pipeline_layout(self.set_layout, PUSH_CONSTANT_SIZE)
            .map_err(|e| init_step("pipeline layout", e))?;
        self.spare_semaphore = driver.create_semaphore().map_err(|e| init_step("acquire semaphore", e))?;
        self.white_texture = Some(
            create_texture_image(driver, 1, 1, &[255; 4]).map_err(|e| init_step("white texture", e))?,
        );

        if self.needs_rebuild {
            return Ok(());
        }

        self.swapchain_pass = driver
            .create_render_pass(&swapchain_pass_layout(context.surface_format.format))
            .map_err(|e| init_step("render pass", e))?;
        self.state = BootstrapState::RenderPassReady;

        if context.images.len() > MAX_SLOTS {
            return Err(init_step(
                "framebuffers",
                Error::BackendError(format!("{} swapchain images", context.images.len())),
            ));
        }
        self.slots = SwapchainFramebuffer::create_set(driver, context, self.swapchain_pass, vertex_buffer_size)
            .map_err(|e| init_step("framebuffers", e))?;
        self.state = BootstrapState::FramebuffersReady;

        self.state = BootstrapState::Running;
        engine_info!(
            SOURCE,
            "Vulkan backend running ({}x{}, {} swapchain images)",
            context.extent.width,
            context.extent.height,
            self.slots.len()
        );
        Ok(())
    }

    /// Re-enter bootstrap at the swapchain step
    fn recreate_swapchain(&mut self) -> Result<()> {
        let vsync = self.config.vsync;
        let window_size = self.window_size;
        let vertex_buffer_size = self.config.vertex_buffer_size;
        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };

        self.needs_rebuild = true;
        driver.device_wait_idle()?;
        self.submitted = 0;
        self.retired.destroy_all(driver);
        for slot in self.slots.drain(..) {
            slot.destroy(driver, context.descriptor_pool);
        }
        // Re-entry point; stays here until a rebuild succeeds
        self.state = BootstrapState::SwapchainReady;

        let format_changed = context.rebuild_swapchain(driver, window_size, vsync)?;

        if format_changed || self.swapchain_pass == vk::RenderPass::null() {
            let removed = self.pipelines.remove_for_pass(driver, RenderPassKind::Swapchain);
            if self.swapchain_pass != vk::RenderPass::null() {
                driver.destroy_render_pass(self.swapchain_pass);
                self.swapchain_pass = vk::RenderPass::null();
            }
            self.swapchain_pass = driver.create_render_pass(&swapchain_pass_layout(context.surface_format.format))?;
            engine_debug!(
                SOURCE,
                "Window render pass rebuilt for {:?} ({} pipelines dropped)",
                context.surface_format.format,
                removed
            );
        }
        self.state = BootstrapState::RenderPassReady;

        if context.images.len() > MAX_SLOTS {
            engine_bail!(SOURCE, "Swapchain has {} images, at most {} are supported", context.images.len(), MAX_SLOTS);
        }
        self.slots = SwapchainFramebuffer::create_set(driver, context, self.swapchain_pass, vertex_buffer_size)?;
        self.state = BootstrapState::FramebuffersReady;

        self.state = BootstrapState::Running;
        self.needs_rebuild = false;
        engine_debug!(
            SOURCE,
            "Swapchain rebuilt: {}x{}, {} slots",
            context.extent.width,
            context.extent.height,
            self.slots.len()
        );
        Ok(())
    }

    // ===== FRAME HELPERS =====

    /// Slots whose work may still reference an object retired now
    fn in_flight_mask(&self) -> u64 {
        self.submitted | self.frame.map_or(0, |frame| 1u64 << frame.slot)
    }

    /// Wait for every submitted slot and run their retirements
    fn wait_submitted(&mut self) -> Result<()> {
        if self.submitted == 0 {
            return Ok(());
        }
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let submitted = self.submitted;
        let fences: Vec<vk::Fence> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(index, _)| submitted & (1u64 << index) != 0)
            .map(|(_, slot)| slot.fence)
            .collect();
        device.driver.wait_for_fences(&fences)?;
        for index in 0..self.slots.len() {
            if submitted & (1u64 << index) != 0 {
                self.retired.slot_completed(&mut device.driver, index);
            }
        }
        self.submitted = 0;
        Ok(())
    }

    fn retire(&mut self, item: Retired) {
        let in_flight = self.in_flight_mask();
        match self.device.as_mut() {
            Some(device) => self.retired.retire(&mut device.driver, item, in_flight),
            None => engine_warn!(SOURCE, "Dropping {:?} without a device", item),
        }
    }

    /// Pass kind, extent and row order of the current target
    fn target_info(&self) -> Result<(RenderPassKind, vk::Extent2D, bool)> {
        let target = self.draw.target;
        if target.is_main() {
            let device = self.device.as_ref().ok_or_else(not_initialized)?;
            return Ok((RenderPassKind::Swapchain, device.context.extent, false));
        }
        let framebuffer = self
            .framebuffers
            .get(&target)
            .filter(|framebuffer| framebuffer.is_allocated())
            .ok_or_else(|| invalid_framebuffer(target))?;
        Ok((framebuffer.kind(), framebuffer.extent(), framebuffer.params.invert_y))
    }

    /// Begin the render pass of the current target unless it is open
    fn ensure_pass(&mut self) -> Result<()> {
        let Some(frame) = self.frame.as_mut() else {
            engine_bail!(SOURCE, "Recording outside of a frame");
        };
        let target = self.draw.target;
        if frame.open_pass == Some(target) {
            return Ok(());
        }
        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };
        let slot = &self.slots[frame.slot];

        let begin = if target.is_main() {
            if frame.main_pass_begun {
                engine_warn!(SOURCE, "Window pass reopened in frame {}, its contents are cleared again", self.frame_count);
            }
            RenderPassBegin {
                render_pass: self.swapchain_pass,
                framebuffer: slot.framebuffer,
                extent: context.extent,
                clear_values: vec![vk::ClearValue {
                    color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] },
                }],
            }
        } else {
            let framebuffer = self
                .framebuffers
                .get(&target)
                .filter(|framebuffer| framebuffer.is_allocated())
                .ok_or_else(|| invalid_framebuffer(target))?;
            RenderPassBegin {
                render_pass: framebuffer.render_pass,
                framebuffer: framebuffer.framebuffer,
                extent: framebuffer.extent(),
                clear_values: Vec::new(),
            }
        };

        if frame.open_pass.take().is_some() {
            driver.cmd_end_render_pass(slot.command_buffer);
        }
        driver.cmd_begin_render_pass(slot.command_buffer, &begin);
        frame.open_pass = Some(target);
        frame.main_pass_begun |= target.is_main();
        Ok(())
    }

    fn close_pass(&mut self) {
        let (Some(frame), Some(device)) = (self.frame.as_mut(), self.device.as_mut()) else {
            return;
        };
        if frame.open_pass.take().is_some() {
            device.driver.cmd_end_render_pass(self.slots[frame.slot].command_buffer);
        }
    }

    /// Image view and sampler for both texture units of a program
    fn texture_bindings(&mut self, features: &FeatureDescriptor) -> Result<[TextureBinding; TEXTURE_UNITS]> {
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let white = self.white_texture.as_ref().map(|image| image.view).ok_or_else(not_initialized)?;

        let mut bindings = [(white, vk::Sampler::null()); TEXTURE_UNITS];
        for (unit, binding) in bindings.iter_mut().enumerate() {
            let view = match self.draw.textures[unit].filter(|_| features.uses_texture(unit)) {
                Some(TextureSource::Texture(id)) => self.textures.image(id).map(|image| image.view),
                Some(TextureSource::Framebuffer(fb)) => self
                    .framebuffers
                    .get(&fb)
                    .and_then(|framebuffer| framebuffer.color.as_ref())
                    .map(|image| image.view),
                None => None,
            };
            let sampler = self
                .samplers
                .get(&mut device.driver, sampler_desc(self.draw.samplers[unit], self.draw.filter))?;
            *binding = (view.unwrap_or(white), sampler);
        }
        Ok(bindings)
    }

    fn tile_index(&self, tile: usize) -> Option<usize> {
        if tile < TEXTURE_UNITS {
            Some(tile)
        } else {
            engine_warn!(SOURCE, "Tile {} is out of range", tile);
            None
        }
    }

    fn teardown(&mut self) {
        let Some(Device { mut driver, mut context }) = self.device.take() else {
            return;
        };
        if let Err(e) = driver.device_wait_idle() {
            engine_warn!(SOURCE, "Device wait before teardown failed: {}", e);
        }
        self.frame = None;
        self.submitted = 0;

        for slot in self.slots.drain(..) {
            slot.destroy(&mut driver, context.descriptor_pool);
        }
        self.retired.destroy_all(&mut driver);
        for (_, mut framebuffer) in self.framebuffers.drain() {
            let (images, handle) = framebuffer.take_resources();
            for image in images {
                driver.destroy_image(image);
            }
            if handle != vk::Framebuffer::null() {
                driver.destroy_framebuffer(handle);
            }
        }
        for image in self.textures.drain() {
            driver.destroy_image(image);
        }
        if let Some(image) = self.white_texture.take() {
            driver.destroy_image(image);
        }
        self.pipelines.destroy_all(&mut driver);
        for program in self.shaders.drain() {
            program.destroy(&mut driver);
        }
        self.samplers.destroy_all(&mut driver);
        self.offscreen_passes.destroy_all(&mut driver);
        if self.swapchain_pass != vk::RenderPass::null() {
            driver.destroy_render_pass(self.swapchain_pass);
            self.swapchain_pass = vk::RenderPass::null();
        }
        if self.spare_semaphore != vk::Semaphore::null() {
            driver.destroy_semaphore(self.spare_semaphore);
            self.spare_semaphore = vk::Semaphore::null();
        }
        if self.pipeline_layout != vk::PipelineLayout::null() {
            driver.destroy_pipeline_layout(self.pipeline_layout);
            self.pipeline_layout = vk::PipelineLayout::null();
        }
        if self.set_layout != vk::DescriptorSetLayout::null() {
            driver.destroy_descriptor_set_layout(self.set_layout);
            self.set_layout = vk::DescriptorSetLayout::null();
        }
        context.destroy(&mut driver);
        self.state = BootstrapState::Uninitialized;
        engine_info!(SOURCE, "Vulkan backend shut down");
    }
}

impl<D: DeviceDriver> RenderingApi for VulkanRenderingApi<D> {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn clip_parameters(&self) -> ClipParameters {
        ClipParameters { z_is_from_0_to_1: true, invert_y: true }
    }

    // ===== SHADERS =====

    fn unload_shader(&mut self, program: &Arc<dyn ShaderProgram>) {
        let key = program.key();
        debug_assert!(
            self.frame.is_none() || self.shaders.bound_key() != Some(key),
            "shader {} unloaded while bound by the recording frame",
            key
        );
        if self.shaders.lookup(key).is_none() {
            return;
        }
        if let Err(e) = self.wait_submitted() {
            engine_warn!(SOURCE, "Waiting for frames before unloading shader {} failed: {}", key, e);
        }
        let Some(device) = self.device.as_mut() else {
            self.shaders.unload(key);
            return;
        };
        let removed = self.pipelines.remove_for_key(&mut device.driver, key);
        if let Some(program) = self.shaders.unload(key) {
            program.destroy(&mut device.driver);
        }
        engine_debug!(SOURCE, "Unloaded shader {} ({} pipelines)", key, removed);
    }

    fn load_shader(&mut self, program: &Arc<dyn ShaderProgram>) -> Result<()> {
        self.shaders.bind(program.key()).map(|_| ())
    }

    fn create_and_load_new_shader(&mut self, key: ColorCombinerKey) -> Result<Arc<dyn ShaderProgram>> {
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let driver = &mut device.driver;
        let program = self
            .shaders
            .load_or_create(key, |key, features| VulkanShaderProgram::compile(driver, key, features))?;
        Ok(program as Arc<dyn ShaderProgram>)
    }

    fn lookup_shader(&self, key: ColorCombinerKey) -> Option<Arc<dyn ShaderProgram>> {
        self.shaders.lookup(key).map(|program| program as Arc<dyn ShaderProgram>)
    }

    // ===== TEXTURES =====

    fn new_texture(&mut self) -> TextureId {
        self.textures.allocate()
    }

    fn select_texture(&mut self, tile: usize, id: TextureId) {
        if let Some(tile) = self.tile_index(tile) {
            self.draw.active_tile = tile;
            self.draw.textures[tile] = Some(TextureSource::Texture(id));
        }
    }

    fn upload_texture(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() < expected {
            return Err(Error::InvalidResource(format!(
                "texture upload of {}x{} with {} bytes",
                width,
                height,
                rgba.len()
            )));
        }
        let tile = self.draw.active_tile;
        let id = match self.draw.textures[tile] {
            Some(TextureSource::Texture(id)) if self.textures.contains(id) => id,
            _ => {
                return Err(Error::InvalidResource(format!("no texture selected on tile {}", tile)));
            }
        };

        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let image = create_texture_image(&mut device.driver, width, height, &rgba[..expected])?;
        match self.textures.replace(id, image) {
            Ok(Some(old)) => self.retire(Retired::Image(old)),
            Ok(None) => {}
            Err(image) => {
                device.driver.destroy_image(image);
                return Err(Error::InvalidResource(format!("texture {} was deleted", id.raw())));
            }
        }
        engine_trace!(SOURCE, "Uploaded {}x{} texture {}", width, height, id.raw());
        Ok(())
    }

    fn set_sampler_parameters(&mut self, tile: usize, params: SamplerParameters) {
        if let Some(tile) = self.tile_index(tile) {
            self.draw.samplers[tile] = params;
        }
    }

    fn delete_texture(&mut self, id: TextureId) {
        for source in self.draw.textures.iter_mut() {
            if *source == Some(TextureSource::Texture(id)) {
                *source = None;
            }
        }
        if let Some(image) = self.textures.remove(id) {
            self.retire(Retired::Image(image));
        }
    }

    fn set_texture_filter(&mut self, mode: FilteringMode) {
        self.draw.filter = mode;
    }

    fn texture_filter(&self) -> FilteringMode {
        self.draw.filter
    }

    fn select_texture_fb(&mut self, fb: FramebufferId) -> Result<()> {
        let framebuffer = self
            .framebuffers
            .get(&fb)
            .filter(|framebuffer| framebuffer.is_allocated())
            .ok_or_else(|| invalid_framebuffer(fb))?;
        if framebuffer.params.msaa_level > 1 {
            return Err(Error::InvalidResource(format!(
                "framebuffer {} is multisampled, resolve it before sampling",
                fb.raw()
            )));
        }
        let tile = self.draw.active_tile;
        self.draw.textures[tile] = Some(TextureSource::Framebuffer(fb));
        Ok(())
    }

    // ===== DRAW STATE =====

    fn set_depth_test_and_mask(&mut self, depth_test: bool, depth_mask: bool) {
        self.draw.depth_test = depth_test;
        self.draw.depth_mask = depth_mask;
    }

    fn set_zmode_decal(&mut self, decal: bool) {
        self.draw.decal = decal;
    }

    fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.draw.viewport = Some(Rect::new(x, y, width, height));
    }

    fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.draw.scissor = Some(Rect::new(x, y, width, height));
    }

    fn set_use_alpha(&mut self, use_alpha: bool) {
        self.draw.use_alpha = use_alpha;
    }

    fn draw_triangles(&mut self, vertices: &[f32], num_tris: usize) -> Result<()> {
        let program = self
            .shaders
            .bound()
            .ok_or_else(|| engine_err!(SOURCE, "draw_triangles without a bound shader"))?;
        let vertex_count = num_tris * 3;
        let float_count = vertex_count * program.layout().stride_floats() as usize;
        if vertices.len() < float_count {
            return Err(Error::InvalidResource(format!(
                "{} triangles need {} floats, got {}",
                num_tris,
                float_count,
                vertices.len()
            )));
        }

        self.ensure_pass()?;
        let (pass, extent, invert_y) = self.target_info()?;
        let viewport = self.draw.viewport.unwrap_or(Rect::full(extent));
        if num_tris == 0 || viewport.width <= 0 || viewport.height <= 0 {
            return Ok(());
        }
        let scissor = self.draw.scissor.unwrap_or(Rect::full(extent));
        let bindings = self.texture_bindings(program.features())?;

        let frame = self.frame.ok_or_else(|| engine_err!(SOURCE, "draw_triangles outside of a frame"))?;
        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };

        let render_pass = match pass {
            RenderPassKind::Swapchain => self.swapchain_pass,
            RenderPassKind::Offscreen { has_depth, samples } => {
                self.offscreen_passes.get_or_create(driver, has_depth, samples)?
            }
        };
        let pipeline_key = PipelineKey {
            key: program.key(),
            depth_test: self.draw.depth_test,
            depth_mask: self.draw.depth_mask,
            decal: self.draw.decal,
            use_alpha: self.draw.use_alpha,
            pass,
        };
        let pipeline = self
            .pipelines
            .get_or_create(driver, pipeline_key, &program, self.pipeline_layout, render_pass)?;

        let slot = &mut self.slots[frame.slot];
        let set = match slot.cached_descriptor_set(&bindings) {
            Some(set) => set,
            None => {
                let set = driver.allocate_descriptor_set(context.descriptor_pool, self.set_layout)?;
                driver.write_texture_descriptors(set, &bindings);
                slot.track_descriptor_set(bindings, set);
                set
            }
        };

        let bytes: &[u8] = bytemuck::cast_slice(&vertices[..float_count]);
        let offset = slot.vertex_offset;
        let buffer = slot.vertex_buffer.as_mut().ok_or_else(not_initialized)?;
        if offset + bytes.len() as u64 > buffer.size {
            engine_error!(
                SOURCE,
                "Vertex ring buffer full: {} + {} bytes exceeds {}",
                offset,
                bytes.len(),
                buffer.size
            );
            return Err(Error::OutOfMemory);
        }
        driver.write_buffer(buffer, offset, bytes)?;
        let vertex_buffer = buffer.buffer;
        slot.vertex_offset = offset + bytes.len() as u64;

        let constants = FrameConstants {
            frame_count: self.frame_count,
            noise_scale: self.draw.noise_scale,
            texture_filtering: [
                shader_filtering(self.draw.samplers[0], self.draw.filter),
                shader_filtering(self.draw.samplers[1], self.draw.filter),
            ],
        };

        let command_buffer = slot.command_buffer;
        driver.cmd_bind_pipeline(command_buffer, pipeline);
        driver.cmd_set_viewport(command_buffer, viewport_for(viewport, extent, invert_y));
        driver.cmd_set_scissor(command_buffer, scissor_for(scissor, extent, invert_y));
        driver.cmd_bind_descriptor_set(command_buffer, self.pipeline_layout, set);
        driver.cmd_push_constants(command_buffer, self.pipeline_layout, bytemuck::bytes_of(&constants));
        driver.cmd_bind_vertex_buffer(command_buffer, vertex_buffer, offset);
        driver.cmd_draw(command_buffer, vertex_count as u32, 0);
        Ok(())
    }

    // ===== LIFECYCLE =====

    fn init(&mut self, window: &dyn NativeWindow) -> Result<()> {
        let Some(loader) = self.loader.take() else {
            engine_bail!(SOURCE, "init called twice");
        };
        let mut driver = loader(window, &self.config)?;
        let context = DeviceContext::create_device(&mut driver)?;
        self.device = Some(Device { driver, context });
        self.state = BootstrapState::DeviceReady;
        self.window_size = window.inner_size();
        self.bootstrap()
    }

    fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.window_size = (width, height);
        self.needs_rebuild = true;
        if self.frame.is_some() || self.device.is_none() {
            return Ok(());
        }
        let rebuilt = self.recreate_swapchain();
        if let Err(Error::SwapchainOutOfDate) = rebuilt {
            engine_warn!(SOURCE, "Swapchain rebuild for {}x{} failed, retried next frame", width, height);
        }
        rebuilt
    }

    fn start_frame(&mut self) -> Result<()> {
        if self.frame.is_some() {
            engine_bail!(SOURCE, "start_frame called inside a frame");
        }
        if self.device.is_none() {
            return Err(not_initialized());
        }
        if self.needs_rebuild || self.state != BootstrapState::Running {
            self.recreate_swapchain()?;
        }
        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };

        let acquire_semaphore = self.spare_semaphore;
        let image_index = match driver.acquire_next_image(context.swapchain, acquire_semaphore)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    self.needs_rebuild = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                engine_warn!(SOURCE, "Swapchain out of date on acquire, frame skipped");
                self.needs_rebuild = true;
                return Err(Error::SwapchainOutOfDate);
            }
        };
        let slot_index = image_index as usize;
        let Some(slot) = self.slots.get_mut(slot_index) else {
            engine_bail!(SOURCE, "Acquired image {} has no framebuffer slot", image_index);
        };
        self.spare_semaphore = std::mem::replace(&mut slot.image_available, acquire_semaphore);

        driver.wait_for_fences(&[slot.fence])?;
        self.submitted &= !(1u64 << slot_index);
        self.retired.slot_completed(driver, slot_index);
        slot.release_frame_resources(driver, context.descriptor_pool);
        driver.begin_command_buffer(slot.command_buffer)?;

        self.frame_count = self.frame_count.wrapping_add(1);
        self.frame = Some(FrameState {
            slot: slot_index,
            image_index,
            open_pass: None,
            main_pass_begun: false,
        });
        self.draw.target = FramebufferId::MAIN;
        self.draw.noise_scale = 1.0;
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        let Some(frame) = self.frame else {
            engine_bail!(SOURCE, "end_frame called outside a frame");
        };
        if !frame.main_pass_begun {
            // The window image is only cleared by its pass
            self.draw.target = FramebufferId::MAIN;
            self.ensure_pass()?;
        }
        self.close_pass();
        self.frame = None;

        let Some(Device { driver, context }) = self.device.as_mut() else {
            return Err(not_initialized());
        };
        let slot = &mut self.slots[frame.slot];
        driver.end_command_buffer(slot.command_buffer)?;
        driver.reset_fence(slot.fence)?;
        let submitted = driver.queue_submit(
            context.graphics_queue,
            &FrameSubmit {
                command_buffer: slot.command_buffer,
                wait_semaphore: slot.image_available,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: slot.render_finished,
                fence: slot.fence,
            },
        );
        if let Err(e) = submitted {
            // Nothing will signal the reset fence, and the acquired image
            // semaphore stays pending: hand the slot a signaled fence and
            // rebuild every slot before the next frame
            engine_error!(SOURCE, "Submit of frame {} failed: {}", self.frame_count, e);
            self.needs_rebuild = true;
            let fence = driver.create_fence(true)?;
            driver.destroy_fence(std::mem::replace(&mut slot.fence, fence));
            return Err(e);
        }
        self.submitted |= 1u64 << frame.slot;

        match driver.queue_present(context.present_queue, context.swapchain, frame.image_index, slot.render_finished)? {
            PresentOutcome::Presented => {}
            outcome => {
                engine_debug!(SOURCE, "Present returned {:?}, swapchain rebuilt next frame", outcome);
                self.needs_rebuild = true;
            }
        }
        Ok(())
    }

    fn finish_render(&mut self) -> Result<()> {
        self.wait_submitted()
    }

    // ===== FRAMEBUFFERS =====

    fn create_framebuffer(&mut self) -> FramebufferId {
        let fb = FramebufferId::from_raw(self.next_framebuffer);
        self.next_framebuffer += 1;
        self.framebuffers.insert(fb, OffscreenFramebuffer::unallocated());
        fb
    }

    fn update_framebuffer_parameters(&mut self, fb: FramebufferId, params: FramebufferParameters) -> Result<()> {
        if fb.is_main() {
            return Ok(());
        }
        let current = self.framebuffers.get_mut(&fb).ok_or_else(|| invalid_framebuffer(fb))?;
        if !current.needs_rebuild(&params) {
            current.params = params;
            return Ok(());
        }

        if self.frame.and_then(|frame| frame.open_pass) == Some(fb) {
            self.close_pass();
        }
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let rebuilt = OffscreenFramebuffer::build(&mut device.driver, &mut self.offscreen_passes, params)?;
        engine_debug!(
            SOURCE,
            "Framebuffer {} is now {}x{} (msaa {}, depth {})",
            fb.raw(),
            params.width,
            params.height,
            params.msaa_level,
            params.has_depth_buffer
        );

        if let Some(mut previous) = self.framebuffers.insert(fb, rebuilt) {
            let (images, framebuffer) = previous.take_resources();
            for image in images {
                self.retire(Retired::Image(image));
            }
            if framebuffer != vk::Framebuffer::null() {
                self.retire(Retired::Framebuffer(framebuffer));
            }
        }
        Ok(())
    }

    fn start_draw_to_framebuffer(&mut self, fb: FramebufferId, noise_scale: f32) -> Result<()> {
        if !fb.is_main() && !self.framebuffers.get(&fb).is_some_and(|framebuffer| framebuffer.is_allocated()) {
            return Err(invalid_framebuffer(fb));
        }
        if self.frame.and_then(|frame| frame.open_pass).is_some_and(|open| open != fb) {
            self.close_pass();
        }
        self.draw.target = fb;
        self.draw.noise_scale = noise_scale;
        Ok(())
    }

    fn clear_framebuffer(&mut self) -> Result<()> {
        self.ensure_pass()?;
        let (pass, extent, _) = self.target_info()?;
        let frame = self.frame.ok_or_else(|| engine_err!(SOURCE, "clear_framebuffer outside of a frame"))?;
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        device.driver.cmd_clear_attachments(
            self.slots[frame.slot].command_buffer,
            &AttachmentClear {
                color: Some([0.0, 0.0, 0.0, 1.0]),
                depth: pass.has_depth().then_some(1.0),
                rect: vk::Rect2D { offset: vk::Offset2D::default(), extent },
            },
        );
        Ok(())
    }

    fn resolve_msaa_color_buffer(&mut self, target: FramebufferId, source: FramebufferId) -> Result<()> {
        let Some(frame) = self.frame else {
            engine_bail!(SOURCE, "resolve_msaa_color_buffer outside of a frame");
        };
        if target.is_main() || source.is_main() {
            return Err(Error::InvalidResource(
                "the window framebuffer cannot take part in an MSAA resolve".to_string(),
            ));
        }
        {
            let source_fb = self.framebuffers.get(&source).filter(|fb| fb.is_allocated());
            let target_fb = self.framebuffers.get(&target).filter(|fb| fb.is_allocated());
            let (source_fb, target_fb) = match (source_fb, target_fb) {
                (Some(s), Some(t)) => (s, t),
                (None, _) => return Err(invalid_framebuffer(source)),
                (_, None) => return Err(invalid_framebuffer(target)),
            };
            if source_fb.params.msaa_level <= 1 || target_fb.params.msaa_level > 1 {
                return Err(Error::InvalidResource(format!(
                    "resolve needs a multisampled source ({}) and a single-sample target ({})",
                    source.raw(),
                    target.raw()
                )));
            }
            if source_fb.extent() != target_fb.extent() {
                return Err(Error::InvalidResource(format!(
                    "resolve between framebuffers of different sizes ({} and {})",
                    source.raw(),
                    target.raw()
                )));
            }
        }

        self.close_pass();
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let source_image = self.framebuffers.get(&source).and_then(|fb| fb.color.as_ref());
        let target_image = self.framebuffers.get(&target).and_then(|fb| fb.color.as_ref());
        if let (Some(source_image), Some(target_image)) = (source_image, target_image) {
            device
                .driver
                .cmd_resolve_image(self.slots[frame.slot].command_buffer, source_image, target_image);
        }
        Ok(())
    }

    fn get_pixel_depth(&mut self, fb: FramebufferId, coordinates: &[(f32, f32)]) -> Result<Vec<u16>> {
        if self.frame.is_some() {
            engine_bail!(SOURCE, "get_pixel_depth called inside a frame");
        }
        {
            let framebuffer = self
                .framebuffers
                .get(&fb)
                .filter(|framebuffer| framebuffer.is_allocated())
                .ok_or_else(|| invalid_framebuffer(fb))?;
            if framebuffer.depth.is_none() || framebuffer.params.msaa_level > 1 {
                return Err(Error::InvalidResource(format!(
                    "framebuffer {} has no single-sample depth buffer",
                    fb.raw()
                )));
            }
        }
        if coordinates.is_empty() {
            return Ok(Vec::new());
        }

        self.wait_submitted()?;
        let device = self.device.as_mut().ok_or_else(not_initialized)?;
        let framebuffer = self.framebuffers.get(&fb).ok_or_else(|| invalid_framebuffer(fb))?;
        let depth = framebuffer.depth.as_ref().ok_or_else(|| invalid_framebuffer(fb))?;
        let texels: Vec<(u32, u32)> = coordinates
            .iter()
            .map(|&coordinate| depth_texel(coordinate, framebuffer.extent(), framebuffer.params.invert_y))
            .collect();
        let values = device.driver.read_depth(depth, &texels)?;
        Ok(values.into_iter().map(depth_to_u16).collect())
    }

    fn framebuffer_texture_handle(&self, fb: FramebufferId) -> Option<u64> {
        self.framebuffers
            .get(&fb)?
            .color
            .as_ref()
            .map(|image| image.view.as_raw())
    }
}

impl<D: DeviceDriver> Drop for VulkanRenderingApi<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "vulkan_rendering_api_tests.rs"]
mod tests;
