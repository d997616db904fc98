/// GraphicsDevice trait - low-level command emission consumed by the executor
///
/// Everything the scheduler needs from the graphics context collaborator:
/// command buffers, fences, render passes, draw-state calls, barriers,
/// transfers, and queue submission. Parameters are plain data (handles and
/// POD structs), which keeps the trait object-safe and lets the mock
/// implementation log calls without touching a driver.

use ash::vk;
use crate::error::Result;
use crate::render::step::LoadAction;

/// One image layout transition, batched into a pipeline barrier
///
/// The executor computes these from tracked layouts; implementations expand
/// them into backend barrier structures.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspects: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Static description of a render pass for the cache
///
/// Load actions select the 3x3 table entry; `for_backbuffer` selects the
/// distinct surface pass. Attachment layouts are attachment-optimal on both
/// ends: the executor moves images with explicit barriers, never through
/// pass edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDescriptor {
    pub color_load: LoadAction,
    pub depth_load: LoadAction,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub for_backbuffer: bool,
}

/// One region of an image copy, restricted to a single aspect group
/// (color, or combined depth+stencil)
#[derive(Debug, Clone, Copy)]
pub struct ImageCopyRegion {
    pub aspects: vk::ImageAspectFlags,
    pub src_offset: vk::Offset2D,
    pub dst_offset: vk::Offset2D,
    pub extent: vk::Extent2D,
}

/// Semaphore wait attached to a frame submission
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// Low-level graphics device operations
///
/// Implemented by the Vulkan backend for real execution and by `MockDevice`
/// for GPU-free tests. All command-recording methods target an explicit
/// command buffer; the implementation must not keep recording state of its
/// own.
pub trait GraphicsDevice: Send + Sync {
    // ===== COMMAND POOLS / BUFFERS =====

    /// Create a command pool allowing per-buffer reset
    fn create_command_pool(&self) -> Result<vk::CommandPool>;

    /// Allocate primary command buffers from a pool
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32)
        -> Result<Vec<vk::CommandBuffer>>;

    /// Reset a whole pool, recycling every buffer allocated from it
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;

    /// Reset a single command buffer back to the initial state
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Begin recording (one-time-submit)
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    // ===== SYNCHRONIZATION =====

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// Block until the fence signals
    ///
    /// # Errors
    ///
    /// `Error::DeviceLost` if `timeout_ns` expires; waits are always bounded.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn destroy_fence(&self, fence: vk::Fence);

    // ===== RENDER PASSES =====

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> Result<vk::RenderPass>;

    fn destroy_render_pass(&self, pass: vk::RenderPass);

    /// Begin a render pass instance
    ///
    /// Clear values apply to attachments whose load action is Clear; both
    /// entries are always passed (extra entries are ignored by the driver).
    fn begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    );

    fn end_render_pass(&self, cmd: vk::CommandBuffer);

    // ===== DYNAMIC STATE =====

    fn set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);

    fn set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);

    fn set_blend_constants(&self, cmd: vk::CommandBuffer, constants: [f32; 4]);

    /// Front-and-back stencil write mask, compare mask, and reference
    fn set_stencil_state(
        &self,
        cmd: vk::CommandBuffer,
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    );

    // ===== BINDS AND DRAWS =====

    fn bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);

    fn bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    );

    fn bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize);

    fn bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );

    fn draw(&self, cmd: vk::CommandBuffer, vertex_count: u32);

    fn draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32);

    /// Mid-pass clear of the bound attachments selected by `aspects`
    fn clear_attachments(
        &self,
        cmd: vk::CommandBuffer,
        aspects: vk::ImageAspectFlags,
        color: [f32; 4],
        depth: f32,
        stencil: u32,
        rect: vk::Rect2D,
    );

    // ===== BARRIERS AND TRANSFERS =====

    /// Record all transitions in one barrier command
    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        transitions: &[ImageTransition],
    );

    /// Copy between transfer-src and transfer-dst optimal images
    fn copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &ImageCopyRegion,
    );

    /// Scaled blit between transfer-src and transfer-dst optimal images
    fn blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_rect: vk::Rect2D,
        dst_rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
        filter: vk::Filter,
    );

    // ===== SUBMISSION =====

    /// Submit the frame's command buffers as one batch
    ///
    /// `cmds` is ordered (init buffer first when present). The wait, if any,
    /// gates execution at the given stage; the fence signals completion of
    /// the whole batch.
    fn submit_frame(
        &self,
        cmds: &[vk::CommandBuffer],
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Block until the device is idle (shutdown path)
    fn wait_idle(&self) -> Result<()>;
}
