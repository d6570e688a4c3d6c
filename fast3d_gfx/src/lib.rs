/*!
# Fast3D Graphics

Backend-agnostic core of the Fast3D renderer: the pieces every graphics
backend shares when replaying N64-style display lists.

## Architecture

- **Combiner**: combiner key decoding into a feature descriptor
- **Shader**: vertex layout, `ShaderProgram` trait and the per-backend program cache
- **RenderingApi**: the backend contract, selected at startup through the `BackendRegistry`
- **FrameDriver**: owns the active backend and runs start/replay/end for each frame
- **Config**: persisted JSON key/value store
- **Input**: controller port resolution and keyboard mapping

Backend implementations (Vulkan, ...) live in their own crates and register a
factory with the `BackendRegistry`.
*/

// Internal modules
mod error;
mod engine;
pub mod log;
pub mod combiner;
pub mod config;
pub mod input;
pub mod renderer;
pub mod shader;
pub mod window;

// Main fast3d namespace module
pub mod fast3d {
    // Error types
    pub use crate::error::{Error, Result};

    // Log hub
    pub use crate::engine::Engine;

    // Backend contract
    pub use crate::renderer::{BackendRegistry, FrameDriver, RenderingApi};

    pub use crate::window::NativeWindow;

    // Logging sub-module (types only, NOT macros)
    pub mod log {
        pub use crate::log::{Logger, LogEntry, LogSeverity, DefaultLogger};
    }

    pub mod combiner {
        pub use crate::combiner::*;
    }

    pub mod shader {
        pub use crate::shader::*;
    }

    pub mod render {
        pub use crate::renderer::*;
    }

    pub mod config {
        pub use crate::config::*;
    }

    pub mod input {
        pub use crate::input::*;
    }
}

// Re-export math library at crate root
pub use glam;

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;

#[cfg(test)]
#[path = "log_tests.rs"]
mod log_tests;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
