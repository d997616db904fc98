/// VulkanDevice - GraphicsDevice implementation over a caller-provided queue

use ash::vk;

use nebula_render_queue::nebula::device::{
    GraphicsDevice, ImageCopyRegion, ImageTransition, RenderPassDescriptor, SemaphoreWait,
};
use nebula_render_queue::nebula::render::LoadAction;
use nebula_render_queue::nebula::{Error, Result};
use nebula_render_queue::{nebula_debug, nebula_error};

const LOG_SOURCE: &str = "nebula::vulkan";

/// Translate a raw Vulkan error code into the scheduler's error kinds
///
/// Memory exhaustion and device loss keep their identity so the frame loop
/// can react; everything else becomes a backend error carrying the context
/// string and the raw code.
pub(crate) fn map_vk_result(context: &str, code: vk::Result) -> Error {
    match code {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            Error::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost(context.to_string()),
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
            Error::SurfaceOutOfDate
        }
        other => Error::BackendError(format!("{}: {:?}", context, other)),
    }
}

/// Log a failed driver call and produce the mapped error
pub(crate) fn vk_err(source: &str, context: &str, code: vk::Result) -> Error {
    nebula_error!(source, "{}: {:?}", context, code);
    map_vk_result(context, code)
}

fn load_op_to_vk(action: LoadAction) -> vk::AttachmentLoadOp {
    match action {
        LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadAction::Keep => vk::AttachmentLoadOp::LOAD,
        LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

/// Create a color+depth render pass matching a cache descriptor
///
/// Attachment layouts never change across the pass; the executor moves
/// images with explicit barriers. The backbuffer depth attachment is
/// transient per frame, so its initial layout is undefined and its
/// contents are not stored.
pub(crate) fn build_render_pass(
    device: &ash::Device,
    source: &str,
    desc: &RenderPassDescriptor,
) -> Result<vk::RenderPass> {
    unsafe {
        let color_attachment = vk::AttachmentDescription::default()
            .format(desc.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op_to_vk(desc.color_load))
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let (depth_initial, depth_store) = if desc.for_backbuffer {
            (vk::ImageLayout::UNDEFINED, vk::AttachmentStoreOp::DONT_CARE)
        } else {
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AttachmentStoreOp::STORE,
            )
        };

        let depth_attachment = vk::AttachmentDescription::default()
            .format(desc.depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op_to_vk(desc.depth_load))
            .store_op(depth_store)
            .stencil_load_op(load_op_to_vk(desc.depth_load))
            .stencil_store_op(depth_store)
            .initial_layout(depth_initial)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let attachments = [color_attachment, depth_attachment];

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref))
            .depth_stencil_attachment(&depth_ref);

        let stage_mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stage_mask)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stage_mask)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        device
            .create_render_pass(&render_pass_info, None)
            .map_err(|e| vk_err(source, "Failed to create render pass", e))
    }
}

/// Vulkan graphics device implementation
///
/// Wraps a logical device and graphics queue the application already
/// created. Instance and device setup stay outside this crate; every
/// `unsafe` driver call the scheduler needs lives here. Queue submission
/// is not internally synchronized, matching the scheduler's single
/// execution thread.
pub struct VulkanDevice {
    /// Vulkan logical device handle
    device: ash::Device,
    /// Graphics queue used for frame submission
    queue: vk::Queue,
    /// Family index the command pools allocate against
    queue_family_index: u32,
}

impl VulkanDevice {
    /// Wrap an existing device and queue
    pub fn new(device: ash::Device, queue: vk::Queue, queue_family_index: u32) -> Self {
        nebula_debug!(
            LOG_SOURCE,
            "graphics device ready (queue family {})",
            queue_family_index
        );
        Self {
            device,
            queue,
            queue_family_index,
        }
    }

    /// The wrapped `ash` device, for building the swapchain and factory
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }
}

impl GraphicsDevice for VulkanDevice {
    // ===== COMMAND POOLS / BUFFERS =====

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family_index);

        unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to create command pool", e))
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to allocate command buffers", e))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| vk_err(LOG_SOURCE, "Failed to reset command pool", e))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .map_err(|e| vk_err(LOG_SOURCE, "Failed to reset command buffer", e))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to begin command buffer", e))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to end command buffer", e))
    }

    // ===== SYNCHRONIZATION =====

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        unsafe { self.device.create_fence(&create_info, None) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to create fence", e))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                nebula_error!(LOG_SOURCE, "Fence wait timed out after {} ns", timeout_ns);
                Err(Error::DeviceLost(format!(
                    "fence wait timed out after {} ns",
                    timeout_ns
                )))
            }
            Err(e) => Err(vk_err(LOG_SOURCE, "Failed to wait for fence", e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to reset fence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    // ===== RENDER PASSES =====

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> Result<vk::RenderPass> {
        build_render_pass(&self.device, LOG_SOURCE, desc)
    }

    fn destroy_render_pass(&self, pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(pass, None) };
    }

    fn begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    ) {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: clear_depth,
                    stencil: clear_stencil,
                },
            },
        ];

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE)
        };
    }

    fn end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    // ===== DYNAMIC STATE =====

    fn set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn set_blend_constants(&self, cmd: vk::CommandBuffer, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(cmd, &constants) };
    }

    fn set_stencil_state(
        &self,
        cmd: vk::CommandBuffer,
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    ) {
        unsafe {
            self.device.cmd_set_stencil_write_mask(
                cmd,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                write_mask,
            );
            self.device.cmd_set_stencil_compare_mask(
                cmd,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                compare_mask,
            );
            self.device.cmd_set_stencil_reference(
                cmd,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
        }
    }

    // ===== BINDS AND DRAWS =====

    fn bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        };
    }

    fn bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                dynamic_offsets,
            )
        };
    }

    fn bind_vertex_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset]) };
    }

    fn bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device.cmd_bind_index_buffer(cmd, buffer, offset, index_type) };
    }

    fn draw(&self, cmd: vk::CommandBuffer, vertex_count: u32) {
        unsafe { self.device.cmd_draw(cmd, vertex_count, 1, 0, 0) };
    }

    fn draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw_indexed(cmd, index_count, instance_count, 0, 0, 0) };
    }

    fn clear_attachments(
        &self,
        cmd: vk::CommandBuffer,
        aspects: vk::ImageAspectFlags,
        color: [f32; 4],
        depth: f32,
        stencil: u32,
        rect: vk::Rect2D,
    ) {
        let mut clears: Vec<vk::ClearAttachment> = Vec::with_capacity(2);

        if aspects.contains(vk::ImageAspectFlags::COLOR) {
            clears.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32: color },
                },
            });
        }

        let depth_aspects =
            aspects & (vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);
        if !depth_aspects.is_empty() {
            clears.push(vk::ClearAttachment {
                aspect_mask: depth_aspects,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                },
            });
        }

        if clears.is_empty() {
            return;
        }

        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };

        unsafe { self.device.cmd_clear_attachments(cmd, &clears, &[clear_rect]) };
    }

    // ===== BARRIERS AND TRANSFERS =====

    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        transitions: &[ImageTransition],
    ) {
        if transitions.is_empty() {
            return;
        }

        let barriers: Vec<_> = transitions
            .iter()
            .map(|t| {
                vk::ImageMemoryBarrier::default()
                    .old_layout(t.old_layout)
                    .new_layout(t.new_layout)
                    .src_access_mask(t.src_access)
                    .dst_access_mask(t.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(t.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: t.aspects,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
            })
            .collect();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            )
        };
    }

    fn copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &ImageCopyRegion,
    ) {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: region.aspects,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };

        let copy = vk::ImageCopy {
            src_subresource: layers,
            src_offset: vk::Offset3D {
                x: region.src_offset.x,
                y: region.src_offset.y,
                z: 0,
            },
            dst_subresource: layers,
            dst_offset: vk::Offset3D {
                x: region.dst_offset.x,
                y: region.dst_offset.y,
                z: 0,
            },
            extent: vk::Extent3D {
                width: region.extent.width,
                height: region.extent.height,
                depth: 1,
            },
        };

        unsafe {
            self.device.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            )
        };
    }

    fn blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_rect: vk::Rect2D,
        dst_rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: aspects,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };

        let region = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [
                vk::Offset3D {
                    x: src_rect.offset.x,
                    y: src_rect.offset.y,
                    z: 0,
                },
                vk::Offset3D {
                    x: src_rect.offset.x + src_rect.extent.width as i32,
                    y: src_rect.offset.y + src_rect.extent.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: layers,
            dst_offsets: [
                vk::Offset3D {
                    x: dst_rect.offset.x,
                    y: dst_rect.offset.y,
                    z: 0,
                },
                vk::Offset3D {
                    x: dst_rect.offset.x + dst_rect.extent.width as i32,
                    y: dst_rect.offset.y + dst_rect.extent.height as i32,
                    z: 1,
                },
            ],
        };

        unsafe {
            self.device.cmd_blit_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            )
        };
    }

    // ===== SUBMISSION =====

    fn submit_frame(
        &self,
        cmds: &[vk::CommandBuffer],
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = wait.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = wait.iter().map(|w| w.stage).collect();
        let signal_semaphores: Vec<vk::Semaphore> = signal.into_iter().collect();

        let mut submit_info = vk::SubmitInfo::default().command_buffers(cmds);
        if !wait_semaphores.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }
        if !signal_semaphores.is_empty() {
            submit_info = submit_info.signal_semaphores(&signal_semaphores);
        }

        unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to submit frame", e))
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| vk_err(LOG_SOURCE, "Failed to wait for device idle", e))
    }
}

#[cfg(test)]
#[path = "vulkan_device_tests.rs"]
mod tests;
