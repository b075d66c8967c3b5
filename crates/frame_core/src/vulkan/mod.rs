//! Vulkan backend
//!
//! [`VulkanDevice`] implements [`GpuDevice`](crate::gpu::GpuDevice) for a GLFW
//! [`Window`]. The remaining modules are the RAII pieces it is assembled from.

pub mod buffer;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod render_pass;
pub mod swapchain;
pub mod window;

pub use device::VulkanDevice;
pub use window::{Window, WindowError, WindowResult};
