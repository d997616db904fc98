/// Step data model - the recorded units of GPU work
///
/// A frame is recorded as an ordered log of `Step`s. Render steps carry their
/// target, load actions, merged clear values, and an ordered list of
/// `RenderCommand` sub-entries captured by value. Copy/blit/readback steps
/// force a pass boundary. Steps are owned by the recorder until handed to the
/// executor, then discarded.

use std::sync::Arc;

use ash::vk;

use super::framebuffer::Framebuffer;

/// Maximum dynamic uniform offsets captured per draw
pub const MAX_DYNAMIC_OFFSETS: usize = 3;

// ============================================================================
// Load actions
// ============================================================================

/// How an attachment's prior contents are treated on render pass entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadAction {
    /// Clear to the step's clear value
    Clear,
    /// Load the previous contents
    Keep,
    /// Previous contents are undefined
    DontCare,
}

impl LoadAction {
    /// Table index used by the render pass cache (3 entries per axis)
    pub fn index(self) -> usize {
        match self {
            LoadAction::Clear => 0,
            LoadAction::Keep => 1,
            LoadAction::DontCare => 2,
        }
    }

    pub fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadAction::Keep => vk::AttachmentLoadOp::LOAD,
            LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

// ============================================================================
// Render target
// ============================================================================

/// What a render step draws into
///
/// Equality is identity: the backbuffer sentinel, or the same framebuffer
/// object. Two framebuffers with identical dimensions are still distinct
/// targets.
#[derive(Debug, Clone)]
pub enum RenderTarget {
    /// The swapchain image acquired for the current frame
    Backbuffer,
    /// An offscreen framebuffer
    Offscreen(Arc<Framebuffer>),
}

impl PartialEq for RenderTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RenderTarget::Backbuffer, RenderTarget::Backbuffer) => true,
            (RenderTarget::Offscreen(a), RenderTarget::Offscreen(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for RenderTarget {}

// ============================================================================
// Render commands
// ============================================================================

/// One draw-state sub-entry inside a render step, captured by value
#[derive(Debug, Clone)]
pub enum RenderCommand {
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SetBlendConstants([f32; 4]),
    SetStencilState {
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    },
    Draw {
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
        dynamic_offsets: [u32; MAX_DYNAMIC_OFFSETS],
        dynamic_offset_count: u32,
        vertex_buffer: vk::Buffer,
        vertex_offset: vk::DeviceSize,
        vertex_count: u32,
    },
    DrawIndexed {
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
        dynamic_offsets: [u32; MAX_DYNAMIC_OFFSETS],
        dynamic_offset_count: u32,
        vertex_buffer: vk::Buffer,
        vertex_offset: vk::DeviceSize,
        index_buffer: vk::Buffer,
        index_offset: vk::DeviceSize,
        index_type: vk::IndexType,
        index_count: u32,
        instance_count: u32,
    },
    /// Mid-pass clear, used when a clear arrives after the first draw
    Clear {
        color: u32,
        depth: f32,
        stencil: u32,
        aspects: vk::ImageAspectFlags,
    },
}

// ============================================================================
// Steps
// ============================================================================

/// One render pass worth of work
#[derive(Debug, Clone)]
pub struct RenderStep {
    pub target: RenderTarget,
    pub color_action: LoadAction,
    pub depth_action: LoadAction,
    /// Packed RGBA8, red in the low byte
    pub clear_color: u32,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    /// Draws merged so far; load actions are frozen once this is nonzero
    pub num_draws: u32,
    /// Layout the color attachment must be in after the pass closes;
    /// `UNDEFINED` until a later texture bind marks it
    pub final_color_layout: vk::ImageLayout,
    pub commands: Vec<RenderCommand>,
}

/// 1:1 region copy between two framebuffers
#[derive(Debug, Clone)]
pub struct CopyStep {
    pub src: Arc<Framebuffer>,
    pub dst: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst_pos: vk::Offset2D,
    pub aspects: vk::ImageAspectFlags,
}

/// Scaled region blit between two framebuffers
#[derive(Debug, Clone)]
pub struct BlitStep {
    pub src: Arc<Framebuffer>,
    pub dst: Arc<Framebuffer>,
    pub src_rect: vk::Rect2D,
    pub dst_rect: vk::Rect2D,
    pub aspects: vk::ImageAspectFlags,
    pub filter: vk::Filter,
}

/// Reserved readback request (deferred capability, executes as a no-op)
#[derive(Debug, Clone)]
pub struct ReadbackStep {
    pub src: Arc<Framebuffer>,
    pub rect: vk::Rect2D,
    pub aspects: vk::ImageAspectFlags,
}

/// One recorded unit of GPU work, executed strictly in log order
#[derive(Debug, Clone)]
pub enum Step {
    Render(RenderStep),
    Copy(CopyStep),
    Blit(BlitStep),
    Readback(ReadbackStep),
}

/// Unpack a packed RGBA8 clear color into normalized floats
pub fn unpack_clear_color(packed: u32) -> [f32; 4] {
    [
        (packed & 0xFF) as f32 / 255.0,
        ((packed >> 8) & 0xFF) as f32 / 255.0,
        ((packed >> 16) & 0xFF) as f32 / 255.0,
        ((packed >> 24) & 0xFF) as f32 / 255.0,
    ]
}
