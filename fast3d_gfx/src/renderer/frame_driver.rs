/// Frame driver - owns the active backend and runs one frame at a time
///
/// start_frame -> command replay -> end_frame. A frame whose start fails
/// with a recoverable error (out-of-date swapchain) is skipped, not aborted.

use std::time::Duration;

use crate::config::JsonConfig;
use crate::error::Result;
use crate::window::NativeWindow;
use super::backend_registry::BackendRegistry;
use super::rendering_api::{FramebufferId, RenderingApi, RendererConfig};

/// Configuration key naming the backend
pub const BACKEND_CONFIG_KEY: &str = "Window.Backend.Name";

/// Backend used when the configuration does not name one
pub const DEFAULT_BACKEND: &str = "vulkan";

/// Display refresh the frame divisor is applied to
pub const BASE_REFRESH_HZ: u32 = 60;

/// Source of one frame's draw commands (the display list interpreter)
pub trait CommandReplayer {
    fn replay(&mut self, api: &mut dyn RenderingApi) -> Result<()>;
}

impl<F> CommandReplayer for F
where
    F: FnMut(&mut dyn RenderingApi) -> Result<()>,
{
    fn replay(&mut self, api: &mut dyn RenderingApi) -> Result<()> {
        self(api)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Commands were replayed and the frame was submitted
    Rendered,
    /// The backend could not start the frame (swapchain out of date)
    Skipped,
}

pub struct FrameDriver {
    api: Box<dyn RenderingApi>,
    frame_count: u64,
    skipped_frames: u64,
    frame_divisor: u32,
}

impl FrameDriver {
    pub fn new(api: Box<dyn RenderingApi>) -> Self {
        Self {
            api,
            frame_count: 0,
            skipped_frames: 0,
            frame_divisor: 1,
        }
    }

    /// Create the backend named by `Window.Backend.Name` (default "vulkan")
    pub fn from_config(registry: &BackendRegistry, config: &JsonConfig) -> Result<Self> {
        let name = config.get_string(BACKEND_CONFIG_KEY, DEFAULT_BACKEND);
        let renderer_config = RendererConfig::from_config(config);
        Ok(Self::new(registry.create(&name, &renderer_config)?))
    }

    pub fn init(&mut self, window: &dyn NativeWindow) -> Result<()> {
        self.api.init(window)
    }

    pub fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        match self.api.on_resize(width, height) {
            Err(e) if e.is_recoverable() => {
                crate::engine_warn!("fast3d::FrameDriver", "Resize deferred: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Run one frame
    ///
    /// Replay errors still end the frame before being returned, so the
    /// backend never stays mid-recording.
    pub fn run_frame<R>(&mut self, replayer: &mut R) -> Result<FrameOutcome>
    where
        R: CommandReplayer + ?Sized,
    {
        match self.api.start_frame() {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                self.skipped_frames += 1;
                crate::engine_warn!("fast3d::FrameDriver", "Skipping frame {}: {}", self.frame_count, e);
                return Ok(FrameOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let replayed = replayer.replay(self.api.as_mut());
        let ended = self.api.end_frame();
        self.frame_count += 1;

        replayed?;
        match ended {
            Ok(()) => Ok(FrameOutcome::Rendered),
            Err(e) if e.is_recoverable() => {
                crate::engine_warn!("fast3d::FrameDriver", "Present failed: {}", e);
                Ok(FrameOutcome::Rendered)
            }
            Err(e) => Err(e),
        }
    }

    /// Read depth after every submitted frame has completed
    pub fn read_pixel_depth(&mut self, fb: FramebufferId, coordinates: &[(f32, f32)]) -> Result<Vec<u16>> {
        self.api.finish_render()?;
        self.api.get_pixel_depth(fb, coordinates)
    }

    /// Render every `divisor`-th refresh (minimum 1)
    pub fn set_frame_divisor(&mut self, divisor: u32) {
        self.frame_divisor = divisor.max(1);
    }

    pub fn frame_divisor(&self) -> u32 {
        self.frame_divisor
    }

    /// Target time between frames for the current divisor
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(self.frame_divisor as u64) / BASE_REFRESH_HZ
    }

    /// Frames that were started and ended
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    pub fn api(&self) -> &dyn RenderingApi {
        self.api.as_ref()
    }

    pub fn api_mut(&mut self) -> &mut dyn RenderingApi {
        self.api.as_mut()
    }

    /// Wait for the GPU before the backend is dropped
    pub fn shutdown(&mut self) -> Result<()> {
        self.api.finish_render()
    }
}
