/*!
# Fast3D Graphics - Vulkan Backend

Vulkan implementation of the Fast3D `RenderingApi`.

Device bring-up, swapchain management and the per-frame loop are built on
Ash for the Vulkan bindings and gpu-allocator for memory. Combiner programs
are generated as GLSL and compiled to SPIR-V with naga at runtime.

Every Vulkan call goes through the `DeviceDriver` trait: `AshDriver` is the
real one, tests swap in a recording mock.

The backend is selected at startup through the `BackendRegistry`:

```no_run
use fast3d_gfx::fast3d::BackendRegistry;
use fast3d_gfx::fast3d::render::RendererConfig;

let mut registry = BackendRegistry::new();
fast3d_gfx_renderer_vulkan::register(&mut registry);
let backend = registry.create("vulkan", &RendererConfig::default())?;
# Ok::<(), fast3d_gfx::fast3d::Error>(())
```
*/

// Vulkan seam
mod vulkan_driver;
mod vulkan_device;
mod debug;

// Device state
mod vulkan_context;
mod vulkan_render_pass;
mod vulkan_frame_buffer;

// Resources
mod vulkan_shader_source;
mod vulkan_shader;
mod vulkan_sampler;
mod vulkan_pipeline;
mod vulkan_texture;

// Backend
mod vulkan_rendering_api;

#[cfg(test)]
mod mock_driver;

use fast3d_gfx::fast3d::render::RendererConfig;
use fast3d_gfx::fast3d::{BackendRegistry, RenderingApi, Result};

pub use vulkan_rendering_api::{DriverLoader, VulkanRenderingApi, BACKEND_NAME};
pub use vulkan_context::BootstrapState;
pub use vulkan_device::AshDriver;
pub use vulkan_driver::{
    AcquireOutcome, AttachmentClear, DeviceDriver, DeviceSelection, FrameSubmit, GpuBuffer, GpuImage,
    GraphicsPipelineDesc, ImageClear, ImageDesc, PhysicalDeviceInfo, PresentOutcome, QueueFamilyInfo, RenderPassBegin,
    RenderPassLayout, SamplerDesc, SurfaceSupport, SwapchainDesc, TextureBinding,
};

// Re-export debug utilities
pub use debug::{reset_validation_stats, validation_stats, ValidationStats};

/// Register the Vulkan backend under `BACKEND_NAME`
pub fn register(registry: &mut BackendRegistry) {
    registry.register(BACKEND_NAME, create_backend);
}

fn create_backend(config: &RendererConfig) -> Result<Box<dyn RenderingApi>> {
    Ok(Box::new(VulkanRenderingApi::new(config.clone())))
}
