/// Mock RenderingApi for unit tests (no GPU required)
///
/// Records every contract call by name so frame driver and registry tests
/// can check call ordering without a real backend.

use std::sync::{Arc, Mutex};

use crate::combiner::{ColorCombinerKey, FeatureDescriptor};
use crate::error::{Error, Result};
use crate::renderer::{
    depth_to_u16, ClipParameters, FilteringMode, FramebufferId, FramebufferParameters,
    RenderingApi, SamplerParameters, TextureId,
};
use crate::shader::{ShaderCache, ShaderProgram};
use crate::window::NativeWindow;

#[derive(Debug)]
pub struct MockShaderProgram {
    key: ColorCombinerKey,
    features: FeatureDescriptor,
}

impl ShaderProgram for MockShaderProgram {
    fn key(&self) -> ColorCombinerKey {
        self.key
    }

    fn features(&self) -> &FeatureDescriptor {
        &self.features
    }
}

/// Shared call log, cloned out before the mock is boxed
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct MockRenderingApi {
    pub calls: CallLog,
    /// Errors returned by the next `start_frame` calls, in order
    pub start_errors: Vec<Error>,
    pub end_error: Option<Error>,
    /// Depth returned for every sampled coordinate
    pub depth: f32,
    shaders: ShaderCache<MockShaderProgram>,
    next_texture: u64,
    next_framebuffer: u64,
    filter: FilteringMode,
    in_frame: bool,
}

impl MockRenderingApi {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            start_errors: Vec::new(),
            end_error: None,
            depth: 0.5,
            shaders: ShaderCache::new(),
            next_texture: 1,
            next_framebuffer: 1,
            filter: FilteringMode::default(),
            in_frame: false,
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

impl RenderingApi for MockRenderingApi {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn clip_parameters(&self) -> ClipParameters {
        ClipParameters { z_is_from_0_to_1: false, invert_y: false }
    }

    fn unload_shader(&mut self, program: &Arc<dyn ShaderProgram>) {
        self.record("unload_shader");
        self.shaders.unload(program.key());
    }

    fn load_shader(&mut self, program: &Arc<dyn ShaderProgram>) -> Result<()> {
        self.record("load_shader");
        self.shaders.bind(program.key()).map(|_| ())
    }

    fn create_and_load_new_shader(&mut self, key: ColorCombinerKey) -> Result<Arc<dyn ShaderProgram>> {
        self.record("create_and_load_new_shader");
        let program = self
            .shaders
            .load_or_create(key, |key, features| Ok(MockShaderProgram { key, features }))?;
        Ok(program as Arc<dyn ShaderProgram>)
    }

    fn lookup_shader(&self, key: ColorCombinerKey) -> Option<Arc<dyn ShaderProgram>> {
        self.shaders.lookup(key).map(|p| p as Arc<dyn ShaderProgram>)
    }

    fn new_texture(&mut self) -> TextureId {
        self.record("new_texture");
        self.next_texture += 1;
        TextureId::from_raw(self.next_texture - 1)
    }

    fn select_texture(&mut self, _tile: usize, _id: TextureId) {
        self.record("select_texture");
    }

    fn upload_texture(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()> {
        self.record("upload_texture");
        if rgba.len() < (width * height * 4) as usize {
            return Err(Error::InvalidResource("short texture data".to_string()));
        }
        Ok(())
    }

    fn set_sampler_parameters(&mut self, _tile: usize, _params: SamplerParameters) {
        self.record("set_sampler_parameters");
    }

    fn delete_texture(&mut self, _id: TextureId) {
        self.record("delete_texture");
    }

    fn set_texture_filter(&mut self, mode: FilteringMode) {
        self.filter = mode;
    }

    fn texture_filter(&self) -> FilteringMode {
        self.filter
    }

    fn select_texture_fb(&mut self, _fb: FramebufferId) -> Result<()> {
        self.record("select_texture_fb");
        Ok(())
    }

    fn set_depth_test_and_mask(&mut self, _depth_test: bool, _depth_mask: bool) {
        self.record("set_depth_test_and_mask");
    }

    fn set_zmode_decal(&mut self, _decal: bool) {
        self.record("set_zmode_decal");
    }

    fn set_viewport(&mut self, _x: i32, _y: i32, _width: i32, _height: i32) {
        self.record("set_viewport");
    }

    fn set_scissor(&mut self, _x: i32, _y: i32, _width: i32, _height: i32) {
        self.record("set_scissor");
    }

    fn set_use_alpha(&mut self, _use_alpha: bool) {
        self.record("set_use_alpha");
    }

    fn draw_triangles(&mut self, _vertices: &[f32], _num_tris: usize) -> Result<()> {
        debug_assert!(self.in_frame, "draw outside of a frame");
        self.record("draw_triangles");
        Ok(())
    }

    fn init(&mut self, _window: &dyn NativeWindow) -> Result<()> {
        self.record("init");
        Ok(())
    }

    fn on_resize(&mut self, _width: u32, _height: u32) -> Result<()> {
        self.record("on_resize");
        Ok(())
    }

    fn start_frame(&mut self) -> Result<()> {
        self.record("start_frame");
        if !self.start_errors.is_empty() {
            return Err(self.start_errors.remove(0));
        }
        self.in_frame = true;
        Ok(())
    }

    fn end_frame(&mut self) -> Result<()> {
        self.record("end_frame");
        self.in_frame = false;
        match self.end_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish_render(&mut self) -> Result<()> {
        self.record("finish_render");
        Ok(())
    }

    fn create_framebuffer(&mut self) -> FramebufferId {
        self.record("create_framebuffer");
        self.next_framebuffer += 1;
        FramebufferId::from_raw(self.next_framebuffer - 1)
    }

    fn update_framebuffer_parameters(&mut self, _fb: FramebufferId, _params: FramebufferParameters) -> Result<()> {
        self.record("update_framebuffer_parameters");
        Ok(())
    }

    fn start_draw_to_framebuffer(&mut self, _fb: FramebufferId, _noise_scale: f32) -> Result<()> {
        self.record("start_draw_to_framebuffer");
        Ok(())
    }

    fn clear_framebuffer(&mut self) -> Result<()> {
        self.record("clear_framebuffer");
        Ok(())
    }

    fn resolve_msaa_color_buffer(&mut self, _target: FramebufferId, _source: FramebufferId) -> Result<()> {
        self.record("resolve_msaa_color_buffer");
        Ok(())
    }

    fn get_pixel_depth(&mut self, _fb: FramebufferId, coordinates: &[(f32, f32)]) -> Result<Vec<u16>> {
        self.record("get_pixel_depth");
        Ok(coordinates.iter().map(|_| depth_to_u16(self.depth)).collect())
    }

    fn framebuffer_texture_handle(&self, fb: FramebufferId) -> Option<u64> {
        Some(fb.raw())
    }
}

impl Default for MockRenderingApi {
    fn default() -> Self {
        Self::new()
    }
}
