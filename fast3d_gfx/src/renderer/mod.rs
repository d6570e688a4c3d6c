/// Renderer module - backend contract, registry and frame driver

// Module declarations
pub mod rendering_api;
pub mod backend_registry;
pub mod frame_driver;

#[cfg(test)]
pub mod mock_rendering_api;

// Re-export everything from rendering_api.rs
pub use rendering_api::*;

pub use backend_registry::{BackendFactory, BackendRegistry};
pub use frame_driver::{
    CommandReplayer, FrameDriver, FrameOutcome, BACKEND_CONFIG_KEY, BASE_REFRESH_HZ, DEFAULT_BACKEND,
};
