//! Native window seam
//!
//! The windowing shim owns the OS window and event loop; backends only need
//! its raw handles (to create a surface) and its current pixel size.

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window a backend can present to
pub trait NativeWindow: HasDisplayHandle + HasWindowHandle {
    /// Drawable size in physical pixels
    fn inner_size(&self) -> (u32, u32);
}

impl NativeWindow for winit::window::Window {
    fn inner_size(&self) -> (u32, u32) {
        let size = winit::window::Window::inner_size(self);
        (size.width, size.height)
    }
}
