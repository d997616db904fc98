/// Step recorder - accumulates the frame's step log
///
/// Pure data accumulation: nothing here touches the device. Draw-state calls
/// append to the currently active render step; clears merge into its load
/// actions while no draw has landed; copy/blit/readback force a pass
/// boundary. The finished log is handed off by value with `take_steps`.

use std::mem;
use std::sync::Arc;

use ash::vk;

use crate::error::{Error, Result};
use crate::nebula_error;
use super::framebuffer::Framebuffer;
use super::step::{
    BlitStep, CopyStep, LoadAction, ReadbackStep, RenderCommand, RenderStep, RenderTarget, Step,
    MAX_DYNAMIC_OFFSETS,
};

/// Builds the ordered step log for one frame
pub struct StepRecorder {
    steps: Vec<Step>,
    /// Index of the open render step; draw-state calls fail without one
    active_render_step: Option<usize>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            active_render_step: None,
        }
    }

    /// Recorded steps so far (the open render step included)
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Hand the finished log off by value, leaving the recorder empty
    pub fn take_steps(&mut self) -> Vec<Step> {
        self.active_render_step = None;
        mem::take(&mut self.steps)
    }

    // ===== RENDER STEPS =====

    /// Open a new render step targeting `target` and make it current
    ///
    /// Rebinding the already-active target with both actions `Keep` is a
    /// no-op; the open step absorbs the subsequent calls. Any other bind
    /// pushes a fresh step, since load actions are frozen per step.
    pub fn begin_render_pass(
        &mut self,
        target: RenderTarget,
        color_action: LoadAction,
        depth_action: LoadAction,
        clear_color: u32,
        clear_depth: f32,
        clear_stencil: u32,
    ) {
        if let Some(idx) = self.active_render_step {
            if let Step::Render(step) = &self.steps[idx] {
                if step.target == target
                    && color_action == LoadAction::Keep
                    && depth_action == LoadAction::Keep
                {
                    return;
                }
            }
        }
        self.steps.push(Step::Render(RenderStep {
            target,
            color_action,
            depth_action,
            clear_color,
            clear_depth,
            clear_stencil,
            num_draws: 0,
            final_color_layout: vk::ImageLayout::UNDEFINED,
            commands: Vec::new(),
        }));
        self.active_render_step = Some(self.steps.len() - 1);
    }

    /// Clear the selected aspects of the active render target
    ///
    /// Before the first draw the clear folds into the step's load actions
    /// (zero-cost clear); afterwards it becomes an explicit mid-pass
    /// clear command.
    pub fn clear(
        &mut self,
        aspects: vk::ImageAspectFlags,
        color: u32,
        depth: f32,
        stencil: u32,
    ) -> Result<()> {
        let step = self.active_step_mut("clear")?;
        if step.num_draws == 0 {
            if aspects.contains(vk::ImageAspectFlags::COLOR) {
                step.color_action = LoadAction::Clear;
                step.clear_color = color;
            }
            if aspects
                .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
            {
                step.depth_action = LoadAction::Clear;
                step.clear_depth = depth;
                step.clear_stencil = stencil;
            }
        } else {
            step.commands.push(RenderCommand::Clear {
                color,
                depth,
                stencil,
                aspects,
            });
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()> {
        let step = self.active_step_mut("set_viewport")?;
        step.commands.push(RenderCommand::SetViewport(viewport));
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> Result<()> {
        let step = self.active_step_mut("set_scissor")?;
        step.commands.push(RenderCommand::SetScissor(scissor));
        Ok(())
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) -> Result<()> {
        let step = self.active_step_mut("set_blend_constants")?;
        step.commands
            .push(RenderCommand::SetBlendConstants(constants));
        Ok(())
    }

    pub fn set_stencil_state(
        &mut self,
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    ) -> Result<()> {
        let step = self.active_step_mut("set_stencil_state")?;
        step.commands.push(RenderCommand::SetStencilState {
            write_mask,
            compare_mask,
            reference,
        });
        Ok(())
    }

    /// Append a draw, capturing all bindings by value
    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &mut self,
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
        vertex_buffer: vk::Buffer,
        vertex_offset: vk::DeviceSize,
        vertex_count: u32,
    ) -> Result<()> {
        let offsets = pack_dynamic_offsets(dynamic_offsets)?;
        let step = self.active_step_mut("draw")?;
        step.commands.push(RenderCommand::Draw {
            pipeline,
            pipeline_layout,
            descriptor_set,
            dynamic_offsets: offsets,
            dynamic_offset_count: dynamic_offsets.len() as u32,
            vertex_buffer,
            vertex_offset,
            vertex_count,
        });
        step.num_draws += 1;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
        vertex_buffer: vk::Buffer,
        vertex_offset: vk::DeviceSize,
        index_buffer: vk::Buffer,
        index_offset: vk::DeviceSize,
        index_type: vk::IndexType,
        index_count: u32,
        instance_count: u32,
    ) -> Result<()> {
        let offsets = pack_dynamic_offsets(dynamic_offsets)?;
        let step = self.active_step_mut("draw_indexed")?;
        step.commands.push(RenderCommand::DrawIndexed {
            pipeline,
            pipeline_layout,
            descriptor_set,
            dynamic_offsets: offsets,
            dynamic_offset_count: dynamic_offsets.len() as u32,
            vertex_buffer,
            vertex_offset,
            index_buffer,
            index_offset,
            index_type,
            index_count,
            instance_count,
        });
        step.num_draws += 1;
        Ok(())
    }

    // ===== TRANSFER STEPS =====

    /// Record a 1:1 copy; closes the conceptually open render pass
    pub fn copy_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspects: vk::ImageAspectFlags,
    ) -> Result<()> {
        self.check_transfer_pair("copy_framebuffer", src, dst)?;
        if !src.contains_rect(&src_rect) {
            nebula_error!(
                "nebula::recorder",
                "copy_framebuffer: source rect exceeds framebuffer {} ({}x{})",
                src.id(),
                src.width,
                src.height
            );
            return Err(Error::InvalidResource(
                "copy source rect out of bounds".to_string(),
            ));
        }
        let dst_rect = vk::Rect2D {
            offset: dst_pos,
            extent: src_rect.extent,
        };
        if !dst.contains_rect(&dst_rect) {
            nebula_error!(
                "nebula::recorder",
                "copy_framebuffer: destination rect exceeds framebuffer {} ({}x{})",
                dst.id(),
                dst.width,
                dst.height
            );
            return Err(Error::InvalidResource(
                "copy destination rect out of bounds".to_string(),
            ));
        }
        self.steps.push(Step::Copy(CopyStep {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            src_rect,
            dst_pos,
            aspects,
        }));
        self.active_render_step = None;
        Ok(())
    }

    /// Record a scaled blit; closes the conceptually open render pass
    pub fn blit_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) -> Result<()> {
        self.check_transfer_pair("blit_framebuffer", src, dst)?;
        if !src.contains_rect(&src_rect) || !dst.contains_rect(&dst_rect) {
            nebula_error!(
                "nebula::recorder",
                "blit_framebuffer: rect out of bounds (src fb {}, dst fb {})",
                src.id(),
                dst.id()
            );
            return Err(Error::InvalidResource(
                "blit rect out of bounds".to_string(),
            ));
        }
        self.steps.push(Step::Blit(BlitStep {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            src_rect,
            dst_rect,
            aspects,
            filter,
        }));
        self.active_render_step = None;
        Ok(())
    }

    /// Record a readback request; closes the conceptually open render pass
    pub fn readback_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
    ) -> Result<()> {
        if !src.contains_rect(&rect) {
            return Err(Error::InvalidResource(
                "readback rect out of bounds".to_string(),
            ));
        }
        self.steps.push(Step::Readback(ReadbackStep {
            src: Arc::clone(src),
            rect,
            aspects,
        }));
        self.active_render_step = None;
        Ok(())
    }

    // ===== TEXTURE BINDS =====

    /// Bind a framebuffer's color attachment for sampling and return its view
    ///
    /// Does not emit a step. Marks the most recent still-pending render step
    /// targeting `fb` so the executor transitions the attachment to
    /// shader-read when that pass closes.
    ///
    /// # Errors
    ///
    /// `Error::ConflictingFramebufferBinding` when more than one pending
    /// step targets `fb`; the write order would be ambiguous.
    pub fn bind_framebuffer_as_texture(
        &mut self,
        fb: &Arc<Framebuffer>,
        binding: u32,
        aspects: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        if aspects != vk::ImageAspectFlags::COLOR {
            return Err(Error::InvalidResource(format!(
                "bind_framebuffer_as_texture: only the color aspect can be sampled (requested {:?})",
                aspects
            )));
        }

        let mut pending_writers = 0usize;
        let mut most_recent: Option<usize> = None;
        for (idx, step) in self.steps.iter().enumerate() {
            if let Step::Render(render) = step {
                if let RenderTarget::Offscreen(target) = &render.target {
                    if Arc::ptr_eq(target, fb) {
                        pending_writers += 1;
                        most_recent = Some(idx);
                    }
                }
            }
        }

        if pending_writers > 1 {
            nebula_error!(
                "nebula::recorder",
                "framebuffer {} bound as texture at binding {} while {} pending steps target it",
                fb.id(),
                binding,
                pending_writers
            );
            return Err(Error::ConflictingFramebufferBinding(format!(
                "framebuffer {} has {} pending render steps",
                fb.id(),
                pending_writers
            )));
        }

        if let Some(idx) = most_recent {
            if let Step::Render(render) = &mut self.steps[idx] {
                render.final_color_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            }
        }
        Ok(fb.color.view)
    }

    // ===== INTERNAL =====

    /// The open render step, or a loud failure when there is none
    fn active_step_mut(&mut self, what: &str) -> Result<&mut RenderStep> {
        let idx = match self.active_render_step {
            Some(idx) => idx,
            None => {
                nebula_error!("nebula::recorder", "{} issued with no open render pass", what);
                return Err(Error::InvalidPassState(format!(
                    "{} issued with no open render pass",
                    what
                )));
            }
        };
        match &mut self.steps[idx] {
            Step::Render(step) => Ok(step),
            _ => Err(Error::InternalConsistency(format!(
                "active step index {} does not refer to a render step",
                idx
            ))),
        }
    }

    fn check_transfer_pair(
        &self,
        what: &str,
        src: &Arc<Framebuffer>,
        dst: &Arc<Framebuffer>,
    ) -> Result<()> {
        if Arc::ptr_eq(src, dst) {
            nebula_error!(
                "nebula::recorder",
                "{}: source and destination are the same framebuffer ({})",
                what,
                src.id()
            );
            return Err(Error::InvalidResource(format!(
                "{} within a single framebuffer is not supported",
                what
            )));
        }
        Ok(())
    }
}

impl Default for StepRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn pack_dynamic_offsets(dynamic_offsets: &[u32]) -> Result<[u32; MAX_DYNAMIC_OFFSETS]> {
    if dynamic_offsets.len() > MAX_DYNAMIC_OFFSETS {
        return Err(Error::InvalidResource(format!(
            "too many dynamic offsets: {} (max {})",
            dynamic_offsets.len(),
            MAX_DYNAMIC_OFFSETS
        )));
    }
    let mut offsets = [0u32; MAX_DYNAMIC_OFFSETS];
    offsets[..dynamic_offsets.len()].copy_from_slice(dynamic_offsets);
    Ok(offsets)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "recorder_tests.rs"]
mod tests;
