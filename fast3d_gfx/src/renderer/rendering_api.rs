/// RenderingApi trait - the polymorphic surface every backend implements
///
/// The display list interpreter drives exactly one `RenderingApi` per
/// process. Calls are not reentrant and must be serialized by the caller:
/// `start_frame` precedes every draw, texture or framebuffer mutation of a
/// frame and `end_frame` follows them.

use std::sync::Arc;
use glam::{Mat4, Vec3, Vec4};

use crate::combiner::ColorCombinerKey;
use crate::config::JsonConfig;
use crate::error::Result;
use crate::shader::{ShaderInfo, ShaderProgram};
use crate::window::NativeWindow;

// ============================================================================
// Common types
// ============================================================================

/// Clip-space conventions of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipParameters {
    /// Clip-space depth runs 0..1 instead of -1..1
    pub z_is_from_0_to_1: bool,
    /// Clip-space Y points down
    pub invert_y: bool,
}

impl ClipParameters {
    /// Convert an OpenGL-style projection into this backend's clip space
    pub fn adjust_projection(&self, projection: Mat4) -> Mat4 {
        let mut correction = Mat4::IDENTITY;
        if self.z_is_from_0_to_1 {
            // z' = 0.5 * z + 0.5 * w
            correction = Mat4::from_cols(
                Vec4::X,
                Vec4::Y,
                Vec4::new(0.0, 0.0, 0.5, 0.0),
                Vec4::new(0.0, 0.0, 0.5, 1.0),
            );
        }
        if self.invert_y {
            correction = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * correction;
        }
        correction * projection
    }
}

/// Texture filtering applied when the combiner asks for bilinear sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilteringMode {
    /// N64-style three-point filtering
    #[default]
    ThreePoint,
    Linear,
    /// Always nearest, regardless of the requested filter
    None,
}

/// N64 tile addressing bit: mirror
pub const G_TX_MIRROR: u32 = 0x1;

/// N64 tile addressing bit: clamp
pub const G_TX_CLAMP: u32 = 0x2;

/// Sampler state of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerParameters {
    pub linear_filter: bool,
    /// S axis addressing (G_TX_MIRROR / G_TX_CLAMP bits)
    pub cms: u32,
    /// T axis addressing
    pub cmt: u32,
}

/// Opaque texture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(u64);

impl TextureId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Opaque framebuffer handle; `MAIN` is the window surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferId(u64);

impl FramebufferId {
    pub const MAIN: FramebufferId = FramebufferId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_main(self) -> bool {
        self == Self::MAIN
    }
}

/// Size and capabilities of a render target framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferParameters {
    pub width: u32,
    pub height: u32,
    /// Sample count (1 = no MSAA)
    pub msaa_level: u32,
    pub invert_y: bool,
    pub render_target: bool,
    pub has_depth_buffer: bool,
    pub can_extract_depth: bool,
}

impl Default for FramebufferParameters {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            msaa_level: 1,
            invert_y: false,
            render_target: true,
            has_depth_buffer: false,
            can_extract_depth: false,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Enable validation/debug layers
    pub enable_validation: bool,
    /// Application name
    pub app_name: String,
    /// Present with vertical sync
    pub vsync: bool,
    /// Per-frame vertex ring buffer size in bytes
    pub vertex_buffer_size: u64,
}

impl RendererConfig {
    /// Read overrides from the persisted configuration store
    pub fn from_config(config: &JsonConfig) -> Self {
        let defaults = Self::default();
        Self {
            enable_validation: config.get_boolean("Window.Backend.Validation", defaults.enable_validation),
            app_name: config.get_string("Window.Title", &defaults.app_name),
            vsync: config.get_boolean("Window.VSync", defaults.vsync),
            vertex_buffer_size: config
                .get_uinteger("Window.Backend.VertexBufferSize", defaults.vertex_buffer_size as u32)
                as u64,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
            app_name: "Fast3D".to_string(),
            vsync: true,
            vertex_buffer_size: 8 * 1024 * 1024,
        }
    }
}

// ============================================================================
// RenderingApi trait
// ============================================================================

/// Backend contract driven by the display list interpreter
pub trait RenderingApi {
    /// Backend name (e.g. "vulkan")
    fn name(&self) -> &'static str;

    fn clip_parameters(&self) -> ClipParameters;

    // ===== SHADERS =====

    /// Release a program's GPU objects and drop it from the cache
    fn unload_shader(&mut self, program: &Arc<dyn ShaderProgram>);

    /// Bind a program previously returned by this backend
    fn load_shader(&mut self, program: &Arc<dyn ShaderProgram>) -> Result<()>;

    /// Compile (or fetch) and bind the program for a combiner key
    fn create_and_load_new_shader(&mut self, key: ColorCombinerKey) -> Result<Arc<dyn ShaderProgram>>;

    fn lookup_shader(&self, key: ColorCombinerKey) -> Option<Arc<dyn ShaderProgram>>;

    fn shader_info(&self, program: &dyn ShaderProgram) -> ShaderInfo {
        program.info()
    }

    // ===== TEXTURES =====

    fn new_texture(&mut self) -> TextureId;

    fn select_texture(&mut self, tile: usize, id: TextureId);

    /// Upload RGBA8 pixels into the texture selected for the active tile
    fn upload_texture(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()>;

    fn set_sampler_parameters(&mut self, tile: usize, params: SamplerParameters);

    fn delete_texture(&mut self, id: TextureId);

    fn set_texture_filter(&mut self, mode: FilteringMode);

    fn texture_filter(&self) -> FilteringMode;

    /// Sample a framebuffer's color attachment on the active tile
    fn select_texture_fb(&mut self, fb: FramebufferId) -> Result<()>;

    // ===== DRAW STATE =====

    fn set_depth_test_and_mask(&mut self, depth_test: bool, depth_mask: bool);

    fn set_zmode_decal(&mut self, decal: bool);

    fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32);

    fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32);

    fn set_use_alpha(&mut self, use_alpha: bool);

    /// Draw `num_tris` triangles of interleaved vertices laid out for the
    /// bound program
    fn draw_triangles(&mut self, vertices: &[f32], num_tris: usize) -> Result<()>;

    // ===== LIFECYCLE =====

    fn init(&mut self, window: &dyn NativeWindow) -> Result<()>;

    /// The window surface changed size
    fn on_resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn start_frame(&mut self) -> Result<()>;

    fn end_frame(&mut self) -> Result<()>;

    /// Block until every submitted frame has completed on the GPU
    fn finish_render(&mut self) -> Result<()>;

    // ===== FRAMEBUFFERS =====

    fn create_framebuffer(&mut self) -> FramebufferId;

    fn update_framebuffer_parameters(
        &mut self,
        fb: FramebufferId,
        params: FramebufferParameters,
    ) -> Result<()>;

    fn start_draw_to_framebuffer(&mut self, fb: FramebufferId, noise_scale: f32) -> Result<()>;

    /// Clear color and depth of the current framebuffer
    fn clear_framebuffer(&mut self) -> Result<()>;

    fn resolve_msaa_color_buffer(&mut self, target: FramebufferId, source: FramebufferId) -> Result<()>;

    /// Depth values (16-bit, N64 z-buffer precision) at framebuffer
    /// coordinates; only valid outside a frame
    fn get_pixel_depth(&mut self, fb: FramebufferId, coordinates: &[(f32, f32)]) -> Result<Vec<u16>>;

    /// Native handle of a framebuffer's color texture
    fn framebuffer_texture_handle(&self, fb: FramebufferId) -> Option<u64>;
}

/// Convert a normalized depth value to N64 z-buffer precision
pub fn depth_to_u16(depth: f32) -> u16 {
    ((depth.clamp(0.0, 1.0) * 65535.0) as u16) & 0xFFFC
}
