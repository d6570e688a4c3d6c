//! GPU tests for VulkanRenderingApi
//!
//! These tests drive the real backend against a hidden window. All of them
//! require a Vulkan capable GPU and are marked with #[ignore].
//!
//! Run with: cargo test --test vulkan_renderer_tests -- --ignored

use fast3d_gfx::fast3d::combiner::{ColorCombinerKey, CombinerInput, ShaderOptions};
use fast3d_gfx::fast3d::render::{FramebufferParameters, RendererConfig, SamplerParameters};
use fast3d_gfx::fast3d::{BackendRegistry, RenderingApi};
use fast3d_gfx_renderer_vulkan::{BootstrapState, VulkanRenderingApi, BACKEND_NAME};
use serial_test::serial;
use winit::event_loop::EventLoop;
use winit::window::Window;

/// Helper to create a hidden test window
#[allow(deprecated)]
fn create_test_window() -> (Window, EventLoop<()>) {
    let event_loop = EventLoop::new().unwrap();
    let window_attrs = Window::default_attributes()
        .with_title("Fast3D Vulkan Test")
        .with_inner_size(winit::dpi::PhysicalSize::new(320, 240))
        .with_visible(false);
    let window = event_loop.create_window(window_attrs).unwrap();
    (window, event_loop)
}

fn test_config() -> RendererConfig {
    RendererConfig { enable_validation: true, ..RendererConfig::default() }
}

fn shade_key() -> ColorCombinerKey {
    use CombinerInput::{Input1, Zero};
    ColorCombinerKey::from_parts(&[[[Zero, Zero, Zero, Input1]; 2]; 2], ShaderOptions::empty())
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_init_reaches_running() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());

    api.init(&window).unwrap();

    assert_eq!(api.bootstrap_state(), BootstrapState::Running);
    assert_eq!(api.name(), BACKEND_NAME);
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_registry_creates_backend() {
    let (window, _event_loop) = create_test_window();
    let mut registry = BackendRegistry::new();
    fast3d_gfx_renderer_vulkan::register(&mut registry);

    let mut backend = registry.create("Vulkan", &test_config()).unwrap();
    backend.init(&window).unwrap();

    assert_eq!(backend.name(), "vulkan");
}

// ============================================================================
// FRAMES
// ============================================================================

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_empty_frames() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());
    api.init(&window).unwrap();

    for _ in 0..5 {
        api.start_frame().unwrap();
        api.end_frame().unwrap();
    }
    api.finish_render().unwrap();

    assert_eq!(api.frame_count(), 5);
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_draw_shaded_triangle() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());
    api.init(&window).unwrap();

    let program = api.create_and_load_new_shader(shade_key()).unwrap();
    let num_floats = program.info().num_floats as usize;
    #[rustfmt::skip]
    let positions: [[f32; 4]; 3] = [
        [-0.5, -0.5, 0.0, 1.0],
        [ 0.5, -0.5, 0.0, 1.0],
        [ 0.0,  0.5, 0.0, 1.0],
    ];
    let mut vertices = Vec::with_capacity(num_floats * 3);
    for position in positions {
        vertices.extend_from_slice(&position);
        vertices.resize(vertices.len() + num_floats - 4, 1.0);
    }

    api.start_frame().unwrap();
    api.draw_triangles(&vertices, 1).unwrap();
    api.end_frame().unwrap();
    api.finish_render().unwrap();
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_textured_upload() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());
    api.init(&window).unwrap();

    let texture = api.new_texture();
    api.select_texture(0, texture);
    let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
    api.upload_texture(&pixels, 4, 4).unwrap();
    api.set_sampler_parameters(0, SamplerParameters { linear_filter: true, ..Default::default() });

    api.start_frame().unwrap();
    api.end_frame().unwrap();
    api.delete_texture(texture);
    api.finish_render().unwrap();
}

// ============================================================================
// FRAMEBUFFERS
// ============================================================================

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_offscreen_depth_readback() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());
    api.init(&window).unwrap();

    let fb = api.create_framebuffer();
    let params = FramebufferParameters {
        width: 64,
        height: 64,
        has_depth_buffer: true,
        can_extract_depth: true,
        ..Default::default()
    };
    api.update_framebuffer_parameters(fb, params).unwrap();
    assert!(api.framebuffer_texture_handle(fb).is_some());

    api.start_frame().unwrap();
    api.start_draw_to_framebuffer(fb, 1.0).unwrap();
    api.clear_framebuffer().unwrap();
    api.end_frame().unwrap();
    api.finish_render().unwrap();

    // Cleared depth is the far plane
    let depths = api.get_pixel_depth(fb, &[(1.0, 1.0), (32.0, 32.0)]).unwrap();
    assert_eq!(depths, vec![0xFFFC, 0xFFFC]);
}

#[test]
#[ignore] // Requires GPU
#[serial]
fn test_vulkan_msaa_resolve() {
    let (window, _event_loop) = create_test_window();
    let mut api = VulkanRenderingApi::new(test_config());
    api.init(&window).unwrap();

    let source = api.create_framebuffer();
    let target = api.create_framebuffer();
    let base = FramebufferParameters { width: 128, height: 96, render_target: true, ..Default::default() };
    api.update_framebuffer_parameters(source, FramebufferParameters { msaa_level: 4, ..base }).unwrap();
    api.update_framebuffer_parameters(target, base).unwrap();

    api.start_frame().unwrap();
    api.start_draw_to_framebuffer(source, 1.0).unwrap();
    api.clear_framebuffer().unwrap();
    api.resolve_msaa_color_buffer(target, source).unwrap();
    api.end_frame().unwrap();
    api.finish_render().unwrap();
}
