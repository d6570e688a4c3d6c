//! Error types for the Fast3D graphics backend
//!
//! Every fallible operation of the rendering contract, the backend bootstrap,
//! the configuration store and the shader pipeline returns [`Result`].
//! Transient conditions (an out-of-date swapchain) are distinguished from
//! fatal ones with [`Error::is_recoverable`].

use std::fmt;

/// Result type for Fast3D operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fast3D backend errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Backend-specific error (Vulkan, OpenGL, etc.)
    BackendError(String),

    /// Out of GPU memory (or a per-frame ring buffer overflowed)
    OutOfMemory,

    /// Invalid resource (texture, framebuffer, shader, etc.)
    InvalidResource(String),

    /// Initialization failed (device selection, logical device, queues)
    InitializationFailed(String),

    /// Shader synthesis or compilation failed
    ShaderCompilationFailed(String),

    /// The fixed-capacity descriptor pool ran out of sets
    DescriptorPoolExhausted,

    /// The swapchain no longer matches the surface and must be rebuilt
    SwapchainOutOfDate,

    /// Configuration store could not be read or written
    ConfigError(String),
}

impl Error {
    /// Whether the caller may skip the current frame and try again
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SwapchainOutOfDate)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::ShaderCompilationFailed(msg) => write!(f, "Shader compilation failed: {}", msg),
            Error::DescriptorPoolExhausted => write!(f, "Descriptor pool exhausted"),
            Error::SwapchainOutOfDate => write!(f, "Swapchain out of date"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ===== ERROR MACROS =====

/// Log an ERROR (with file:line) and produce an [`Error::BackendError`]
///
/// # Example
///
/// ```no_run
/// # use fast3d_gfx::engine_err;
/// let err = engine_err!("fast3d::vulkan", "vkCreateFence failed: {}", -1);
/// ```
#[macro_export]
macro_rules! engine_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::engine_error!($source, "{}", message);
        $crate::fast3d::Error::BackendError(message)
    }};
}

/// Log an ERROR (with file:line) and return `Err(Error::BackendError)`
#[macro_export]
macro_rules! engine_bail {
    ($source:expr, $($arg:tt)*) => {
        return Err($crate::engine_err!($source, $($arg)*))
    };
}
