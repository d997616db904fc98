/*!
# Nebula Render Queue - Vulkan Backend

Vulkan implementation of the nebula_render_queue device traits.

This crate implements `GraphicsDevice` and `PresentSurface` with the Ash
bindings and uses gpu-allocator for attachment memory. It operates on
handles the application already created (device, queue, surface); instance
and device setup and surface-format negotiation stay on the application
side.

Wiring it up:

1. Wrap the logical device and graphics queue in a [`VulkanDevice`].
2. Build a [`VulkanSwapchain`] over the window surface.
3. Hand both to `RenderQueue::new` from the core crate.
4. Create offscreen targets through a [`VulkanFramebufferFactory`] built
   with the same depth format as the swapchain.
*/

// Vulkan implementation modules
mod vulkan_device;
mod vulkan_framebuffer;
mod vulkan_swapchain;

pub use vulkan_device::VulkanDevice;
pub use vulkan_framebuffer::VulkanFramebufferFactory;
pub use vulkan_swapchain::{VulkanSwapchain, VulkanSwapchainDesc};
