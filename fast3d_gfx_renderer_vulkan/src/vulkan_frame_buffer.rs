/// Framebuffers - per swapchain image slots and offscreen render targets
///
/// A `SwapchainFramebuffer` is everything one in-flight frame needs: its own
/// command buffer guarded by a fence, the framebuffer over one swapchain
/// image, a vertex ring buffer and the descriptor sets written during the
/// frame. Descriptor sets are freed only after the slot's fence signals.
///
/// Images and framebuffers replaced while frames are in flight go to the
/// `RetirementQueue` and are destroyed once every slot that could still
/// reference them has been waited on.
///
/// An `OffscreenFramebuffer` is a render target created through the
/// contract: a color image that is sampled afterwards plus an optional depth
/// image, both with the requested sample count. Both are cleared at
/// creation (opaque black, far depth) since the offscreen pass loads them.

use ash::vk;
use fast3d_gfx::fast3d::render::FramebufferParameters;
use fast3d_gfx::fast3d::{Error, Result};
use fast3d_gfx::engine_error;
use rustc_hash::FxHashMap;

use crate::vulkan_context::DeviceContext;
use crate::vulkan_driver::{DeviceDriver, GpuBuffer, GpuImage, ImageClear, ImageDesc, TextureBinding};
use crate::vulkan_render_pass::{
    sample_count_flags, OffscreenPassCache, RenderPassKind, DEPTH_FORMAT, OFFSCREEN_COLOR_FORMAT,
};

const SOURCE: &str = "fast3d::vulkan";

// ============================================================================
// Swapchain slots
// ============================================================================

/// Frame resources bound to one swapchain image
#[derive(Debug)]
pub struct SwapchainFramebuffer {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the last submission of this slot completed
    pub fence: vk::Fence,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    /// Waited on by the present of this image
    pub render_finished: vk::Semaphore,
    /// Signaled by the acquire that returned this image
    pub image_available: vk::Semaphore,
    pub vertex_buffer: Option<GpuBuffer>,
    /// Write cursor into the vertex buffer, reset every frame
    pub vertex_offset: u64,
    /// Sets written this frame, deduplicated by texture bindings
    descriptor_sets: FxHashMap<[TextureBinding; 2], vk::DescriptorSet>,
}

impl SwapchainFramebuffer {
    fn empty() -> Self {
        Self {
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            render_finished: vk::Semaphore::null(),
            image_available: vk::Semaphore::null(),
            vertex_buffer: None,
            vertex_offset: 0,
            descriptor_sets: FxHashMap::default(),
        }
    }

    /// Build the slot of one swapchain image
    pub fn create<D: DeviceDriver>(
        driver: &mut D,
        context: &DeviceContext,
        image: vk::Image,
        render_pass: vk::RenderPass,
        vertex_buffer_size: u64,
    ) -> Result<Self> {
        let mut slot = Self::empty();
        match slot.fill(driver, context, image, render_pass, vertex_buffer_size) {
            Ok(()) => Ok(slot),
            Err(e) => {
                slot.destroy(driver, context.descriptor_pool);
                Err(e)
            }
        }
    }

    fn fill<D: DeviceDriver>(
        &mut self,
        driver: &mut D,
        context: &DeviceContext,
        image: vk::Image,
        render_pass: vk::RenderPass,
        vertex_buffer_size: u64,
    ) -> Result<()> {
        self.command_pool = driver.create_command_pool(context.selection.graphics_family)?;
        self.command_buffer = driver.allocate_command_buffer(self.command_pool)?;
        // Signaled so the first wait of the slot returns immediately
        self.fence = driver.create_fence(true)?;
        self.view = driver.create_image_view(
            image,
            context.surface_format.format,
            vk::ImageAspectFlags::COLOR,
        )?;
        self.framebuffer = driver.create_framebuffer(render_pass, &[self.view], context.extent)?;
        self.render_finished = driver.create_semaphore()?;
        self.image_available = driver.create_semaphore()?;
        self.vertex_buffer = Some(driver.create_buffer(vertex_buffer_size, vk::BufferUsageFlags::VERTEX_BUFFER)?);
        Ok(())
    }

    /// One slot per swapchain image; nothing is left behind on failure
    pub fn create_set<D: DeviceDriver>(
        driver: &mut D,
        context: &DeviceContext,
        render_pass: vk::RenderPass,
        vertex_buffer_size: u64,
    ) -> Result<Vec<Self>> {
        let mut slots = Vec::with_capacity(context.images.len());
        for (index, &image) in context.images.iter().enumerate() {
            match Self::create(driver, context, image, render_pass, vertex_buffer_size) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    engine_error!(SOURCE, "Framebuffer set creation failed at image {}: {}", index, e);
                    for slot in slots.drain(..) {
                        slot.destroy(driver, context.descriptor_pool);
                    }
                    return Err(e);
                }
            }
        }
        Ok(slots)
    }

    pub fn cached_descriptor_set(&self, bindings: &[TextureBinding; 2]) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(bindings).copied()
    }

    pub fn track_descriptor_set(&mut self, bindings: [TextureBinding; 2], set: vk::DescriptorSet) {
        self.descriptor_sets.insert(bindings, set);
    }

    pub fn descriptor_set_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// Release what the previous submission of this slot referenced; only
    /// valid once its fence has signaled
    pub fn release_frame_resources<D: DeviceDriver>(&mut self, driver: &mut D, pool: vk::DescriptorPool) {
        if !self.descriptor_sets.is_empty() {
            let sets: Vec<vk::DescriptorSet> = self.descriptor_sets.drain().map(|(_, set)| set).collect();
            driver.free_descriptor_sets(pool, &sets);
        }
        self.vertex_offset = 0;
    }

    /// Destroy the slot; the device must be idle
    pub fn destroy<D: DeviceDriver>(mut self, driver: &mut D, pool: vk::DescriptorPool) {
        self.release_frame_resources(driver, pool);
        if let Some(buffer) = self.vertex_buffer.take() {
            driver.destroy_buffer(buffer);
        }
        if self.image_available != vk::Semaphore::null() {
            driver.destroy_semaphore(self.image_available);
        }
        if self.render_finished != vk::Semaphore::null() {
            driver.destroy_semaphore(self.render_finished);
        }
        if self.framebuffer != vk::Framebuffer::null() {
            driver.destroy_framebuffer(self.framebuffer);
        }
        if self.view != vk::ImageView::null() {
            driver.destroy_image_view(self.view);
        }
        if self.fence != vk::Fence::null() {
            driver.destroy_fence(self.fence);
        }
        // Frees the command buffer with it
        if self.command_pool != vk::CommandPool::null() {
            driver.destroy_command_pool(self.command_pool);
        }
    }
}

// ============================================================================
// Deferred destruction
// ============================================================================

/// GPU object whose destruction waits for in-flight frames
#[derive(Debug)]
pub enum Retired {
    Image(GpuImage),
    Framebuffer(vk::Framebuffer),
}

impl Retired {
    fn destroy<D: DeviceDriver>(self, driver: &mut D) {
        match self {
            Retired::Image(image) => driver.destroy_image(image),
            Retired::Framebuffer(framebuffer) => driver.destroy_framebuffer(framebuffer),
        }
    }
}

/// Retired objects tagged with the slots (bit per slot index) that were in
/// flight when they were retired
#[derive(Debug, Default)]
pub struct RetirementQueue {
    entries: Vec<(u64, Retired)>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` behind the slots in `in_flight`; with nothing in flight
    /// it is destroyed right away
    pub fn retire<D: DeviceDriver>(&mut self, driver: &mut D, item: Retired, in_flight: u64) {
        if in_flight == 0 {
            item.destroy(driver);
        } else {
            self.entries.push((in_flight, item));
        }
    }

    /// A slot's fence signaled; destroy what no longer waits on any slot
    pub fn slot_completed<D: DeviceDriver>(&mut self, driver: &mut D, slot: usize) {
        let bit = 1u64 << slot;
        let mut index = 0;
        while index < self.entries.len() {
            self.entries[index].0 &= !bit;
            if self.entries[index].0 == 0 {
                let (_, item) = self.entries.swap_remove(index);
                item.destroy(driver);
            } else {
                index += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Destroy everything; the device must be idle
    pub fn destroy_all<D: DeviceDriver>(&mut self, driver: &mut D) {
        for (_, item) in self.entries.drain(..) {
            item.destroy(driver);
        }
    }
}

// ============================================================================
// Offscreen render targets
// ============================================================================

/// Render target created through `create_framebuffer`
#[derive(Debug)]
pub struct OffscreenFramebuffer {
    pub params: FramebufferParameters,
    pub color: Option<GpuImage>,
    pub depth: Option<GpuImage>,
    pub framebuffer: vk::Framebuffer,
    pub render_pass: vk::RenderPass,
}

impl OffscreenFramebuffer {
    /// A target with no storage yet (zero size until first update)
    pub fn unallocated() -> Self {
        Self {
            params: FramebufferParameters::default(),
            color: None,
            depth: None,
            framebuffer: vk::Framebuffer::null(),
            render_pass: vk::RenderPass::null(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.framebuffer != vk::Framebuffer::null()
    }

    pub fn kind(&self) -> RenderPassKind {
        RenderPassKind::Offscreen {
            has_depth: self.depth.is_some(),
            samples: self.params.msaa_level.max(1),
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.params.width, height: self.params.height }
    }

    /// Whether new parameters require new images
    pub fn needs_rebuild(&self, params: &FramebufferParameters) -> bool {
        !self.is_allocated()
            || self.params.width != params.width
            || self.params.height != params.height
            || self.params.msaa_level.max(1) != params.msaa_level.max(1)
            || self.params.has_depth_buffer != params.has_depth_buffer
    }

    /// Allocate images and framebuffer for `params`
    pub fn build<D: DeviceDriver>(
        driver: &mut D,
        passes: &mut OffscreenPassCache,
        params: FramebufferParameters,
    ) -> Result<Self> {
        if params.width == 0 || params.height == 0 {
            return Err(Error::InvalidResource(format!(
                "framebuffer size {}x{}",
                params.width, params.height
            )));
        }
        let samples = params.msaa_level.max(1);
        let extent = vk::Extent2D { width: params.width, height: params.height };

        let mut target = Self::unallocated();
        target.params = params;
        target.render_pass = passes.get_or_create(driver, params.has_depth_buffer, samples)?;

        let built = (|| -> Result<()> {
            target.color = Some(driver.create_image(&ImageDesc {
                extent,
                format: OFFSCREEN_COLOR_FORMAT,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                samples: sample_count_flags(samples),
                aspect: vk::ImageAspectFlags::COLOR,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                clear: Some(ImageClear::Color([0.0, 0.0, 0.0, 1.0])),
                name: "offscreen_color",
            })?);
            if params.has_depth_buffer {
                target.depth = Some(driver.create_image(&ImageDesc {
                    extent,
                    format: DEPTH_FORMAT,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
                        | vk::ImageUsageFlags::TRANSFER_SRC
                        | vk::ImageUsageFlags::TRANSFER_DST,
                    samples: sample_count_flags(samples),
                    aspect: vk::ImageAspectFlags::DEPTH,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    clear: Some(ImageClear::Depth(1.0)),
                    name: "offscreen_depth",
                })?);
            }
            let mut views = Vec::with_capacity(2);
            views.extend(target.color.as_ref().map(|image| image.view));
            views.extend(target.depth.as_ref().map(|image| image.view));
            target.framebuffer = driver.create_framebuffer(target.render_pass, &views, extent)?;
            Ok(())
        })();

        match built {
            Ok(()) => Ok(target),
            Err(e) => {
                engine_error!(SOURCE, "Offscreen framebuffer {}x{} failed: {}", params.width, params.height, e);
                let (images, framebuffer) = target.take_resources();
                for image in images {
                    driver.destroy_image(image);
                }
                if framebuffer != vk::Framebuffer::null() {
                    driver.destroy_framebuffer(framebuffer);
                }
                Err(e)
            }
        }
    }

    /// Detach images and framebuffer so they can be retired or destroyed
    pub fn take_resources(&mut self) -> (Vec<GpuImage>, vk::Framebuffer) {
        let images = self.color.take().into_iter().chain(self.depth.take()).collect();
        let framebuffer = std::mem::replace(&mut self.framebuffer, vk::Framebuffer::null());
        (images, framebuffer)
    }
}

#[cfg(test)]
#[path = "vulkan_frame_buffer_tests.rs"]
mod tests;
