/// Offscreen render target - color and depth attachments behind one
/// pass-compatible `vk::Framebuffer`
///
/// Framebuffers are immutable after creation and shared as
/// `Arc<Framebuffer>`; the executor's layout tracker keys off `id()`, so
/// current-layout state never lives here. The backend factory (or a test
/// helper) builds these; the core never allocates images itself.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

/// Color format every offscreen framebuffer is created with, matching the
/// offscreen entries of the render pass cache
pub const OFFSCREEN_COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

static NEXT_FRAMEBUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// One attachment of a framebuffer
#[derive(Debug, Clone, Copy)]
pub struct Attachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// Offscreen render target with a color and a depth/stencil attachment
///
/// Depth is always allocated; the fixed two-attachment render pass table
/// requires both attachments to be present.
#[derive(Debug)]
pub struct Framebuffer {
    id: u64,
    pub width: u32,
    pub height: u32,
    pub vk_framebuffer: vk::Framebuffer,
    pub color: Attachment,
    pub depth: Attachment,
}

impl Framebuffer {
    /// Wrap already-created attachments; the caller guarantees the
    /// `vk::Framebuffer` is compatible with the offscreen pass table
    pub fn new(
        width: u32,
        height: u32,
        vk_framebuffer: vk::Framebuffer,
        color: Attachment,
        depth: Attachment,
    ) -> Self {
        Self {
            id: NEXT_FRAMEBUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            vk_framebuffer,
            color,
            depth,
        }
    }

    /// Process-wide unique identity, used for layout tracking
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Full-extent rectangle, used as render area and transfer bound
    pub fn rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }

    /// True when `rect` lies fully inside this framebuffer
    pub fn contains_rect(&self, rect: &vk::Rect2D) -> bool {
        rect.offset.x >= 0
            && rect.offset.y >= 0
            && rect.offset.x as u32 + rect.extent.width <= self.width
            && rect.offset.y as u32 + rect.extent.height <= self.height
    }
}
