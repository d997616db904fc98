/// PresentSurface trait - swapchain access for the executor
///
/// Abstracts image acquisition and presentation so frame execution can run
/// against the Vulkan swapchain or against a mock in tests. One acquire and
/// one present per frame; the surface owns the semaphore pairs that order
/// acquisition, rendering, and presentation.

use ash::vk;
use crate::error::Result;

/// One backbuffer entry: the swapchain image, its view, and the framebuffer
/// binding it (plus the shared depth attachment) for the backbuffer pass
#[derive(Debug, Clone, Copy)]
pub struct BackbufferImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

/// Result of acquiring a swapchain image for a frame
///
/// `acquire_semaphore` signals when the image is ready to be rendered to;
/// the frame submission waits on it. `render_complete_semaphore` is what the
/// submission must signal and presentation waits on.
#[derive(Debug, Clone, Copy)]
pub struct AcquiredImage {
    pub image_index: u32,
    pub acquire_semaphore: vk::Semaphore,
    pub render_complete_semaphore: vk::Semaphore,
    pub suboptimal: bool,
}

/// Swapchain-facing operations
///
/// Consumed from the execution side only, so the trait requires `Send` but
/// not `Sync`; the executor owns the surface exclusively.
pub trait PresentSurface: Send {
    /// Current surface extent
    fn extent(&self) -> vk::Extent2D;

    /// Color format of the swapchain images
    fn color_format(&self) -> vk::Format;

    /// Format of the shared depth attachment
    fn depth_format(&self) -> vk::Format;

    /// Number of swapchain images
    fn image_count(&self) -> u32;

    /// Look up a backbuffer entry by swapchain image index
    ///
    /// # Errors
    ///
    /// `Error::InvalidResource` if the index is out of range.
    fn backbuffer(&self, image_index: u32) -> Result<BackbufferImage>;

    /// Acquire the next swapchain image
    ///
    /// # Errors
    ///
    /// `Error::SurfaceOutOfDate` when the swapchain must be recreated before
    /// rendering can continue. A suboptimal acquire still succeeds, with
    /// `suboptimal` set so the caller can schedule a recreate.
    fn acquire_image(&mut self) -> Result<AcquiredImage>;

    /// Queue the image for presentation, waiting on its render-complete
    /// semaphore
    ///
    /// # Errors
    ///
    /// `Error::SurfaceOutOfDate` when the swapchain must be recreated. A
    /// suboptimal present is reported as success.
    fn present(&mut self, image_index: u32) -> Result<()>;

    /// Tear down and rebuild the swapchain at the current surface size
    ///
    /// `backbuffer_pass` is the render pass the new framebuffers must be
    /// compatible with. The caller guarantees no frame is in flight.
    fn recreate(&mut self, backbuffer_pass: vk::RenderPass) -> Result<()>;
}
