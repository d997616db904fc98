/// FrameExecutor - replays recorded steps into real device commands
///
/// One executor owns the presentation surface and the per-frame layout
/// tracking state. It consumes the step log produced by the recorder and
/// turns it into render passes, barriers and transfer commands on the
/// frame slot's command buffer, then submits and presents.

use std::sync::Arc;

use ash::vk;

use crate::device::{
    BackbufferImage, GraphicsDevice, ImageCopyRegion, ImageTransition, PresentSurface,
    SemaphoreWait,
};
use crate::error::{Error, Result};
use crate::{nebula_debug, nebula_error, nebula_info, nebula_trace, nebula_warn};

use super::frame_pool::FrameSlotPool;
use super::framebuffer::OFFSCREEN_COLOR_FORMAT;
use super::layout_tracker::{BarrierBatch, LayoutTracker};
use super::pass_cache::RenderPassCache;
use super::step::{
    unpack_clear_color, BlitStep, CopyStep, LoadAction, ReadbackStep, RenderCommand, RenderStep,
    RenderTarget, Step,
};

const LOG_SOURCE: &str = "nebula::executor";

/// Replays step logs against a device and a presentation surface
pub struct FrameExecutor {
    device: Arc<dyn GraphicsDevice>,
    surface: Box<dyn PresentSurface>,
    pool: Arc<FrameSlotPool>,
    pass_cache: RenderPassCache,
    tracker: LayoutTracker,
}

impl FrameExecutor {
    /// Creates an executor and builds the render pass cache from the
    /// surface's formats.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails to create the cached passes.
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        surface: Box<dyn PresentSurface>,
        pool: Arc<FrameSlotPool>,
    ) -> Result<Self> {
        let pass_cache = RenderPassCache::new(
            Arc::clone(&device),
            OFFSCREEN_COLOR_FORMAT,
            surface.depth_format(),
            surface.color_format(),
        )?;

        Ok(Self {
            device,
            surface,
            pool,
            pass_cache,
            tracker: LayoutTracker::new(),
        })
    }

    // ===== FRAME EXECUTION =====

    /// Runs one frame: acquire, replay, submit, present.
    ///
    /// The steps are replayed in order. Consecutive render steps that
    /// target the same framebuffer share a single render pass; any other
    /// step closes the open pass first.
    ///
    /// # Errors
    ///
    /// Returns `SurfaceOutOfDate` when the surface must be recreated. The
    /// frame slot is still paced with an empty submission in that case, so
    /// the caller can retry after recreating without starving the fence.
    pub fn run_frame(&mut self, frame_index: u64, steps: Vec<Step>) -> Result<()> {
        let acquired = match self.surface.acquire_image() {
            Ok(acquired) => acquired,
            Err(err) => {
                if let Err(pace_err) = self.submit_abandoned_frame(frame_index) {
                    nebula_error!(
                        LOG_SOURCE,
                        "failed to pace abandoned frame {}: {}",
                        frame_index,
                        pace_err
                    );
                }
                return Err(err);
            }
        };
        if acquired.suboptimal {
            nebula_warn!(
                LOG_SOURCE,
                "surface is suboptimal, rendering frame {} anyway",
                frame_index
            );
        }

        let backbuffer = self.surface.backbuffer(acquired.image_index)?;
        let cmd = self.pool.main_command_buffer(frame_index);
        self.device.begin_command_buffer(cmd)?;

        // The backbuffer comes back from presentation with undefined
        // contents; move it to attachment layout before any step runs.
        self.device.pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            &[ImageTransition {
                image: backbuffer.image,
                aspects: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            }],
        );

        for step in &steps {
            match step {
                Step::Render(render) => self.execute_render_step(cmd, render, &backbuffer)?,
                Step::Copy(copy) => self.execute_copy_step(cmd, copy),
                Step::Blit(blit) => self.execute_blit_step(cmd, blit),
                Step::Readback(readback) => self.execute_readback_step(cmd, readback),
            }
        }
        self.close_open_pass(cmd);

        self.device.pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[ImageTransition {
                image: backbuffer.image,
                aspects: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access: vk::AccessFlags::empty(),
            }],
        );

        self.pool.end_frame(
            frame_index,
            Some(SemaphoreWait {
                semaphore: acquired.acquire_semaphore,
                stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            }),
            Some(acquired.render_complete_semaphore),
        )?;
        self.surface.present(acquired.image_index)?;

        nebula_trace!(
            LOG_SOURCE,
            "frame {} executed ({} steps, image {})",
            frame_index,
            steps.len(),
            acquired.image_index
        );
        Ok(())
    }

    /// Recreates the surface, rebuilding the pass cache if the depth
    /// format changed with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be drained or the surface
    /// cannot be rebuilt.
    pub fn recreate_surface(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.surface.recreate(self.pass_cache.backbuffer_pass())?;
        if self.surface.depth_format() != self.pass_cache.depth_format() {
            let depth_format = self.surface.depth_format();
            self.pass_cache.rebuild(depth_format)?;
            // Backbuffer framebuffers must match the rebuilt pass.
            self.surface.recreate(self.pass_cache.backbuffer_pass())?;
        }
        let extent = self.surface.extent();
        nebula_info!(
            LOG_SOURCE,
            "surface recreated at {}x{}",
            extent.width,
            extent.height
        );
        Ok(())
    }

    // ===== STEP REPLAY =====

    fn execute_render_step(
        &mut self,
        cmd: vk::CommandBuffer,
        step: &RenderStep,
        backbuffer: &BackbufferImage,
    ) -> Result<()> {
        let same_target = self
            .tracker
            .bound_target()
            .is_some_and(|bound| *bound == step.target);

        if same_target {
            if let RenderTarget::Offscreen(fb) = &step.target {
                let tracked = self.tracker.color_layout(fb);
                if tracked != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                    nebula_error!(
                        LOG_SOURCE,
                        "framebuffer {} is the open pass target but tracked as {:?}",
                        fb.id(),
                        tracked
                    );
                    return Err(Error::InternalConsistency(format!(
                        "open pass target framebuffer {} tracked in layout {:?}",
                        fb.id(),
                        tracked
                    )));
                }
            }

            // The pass stays open, so load actions degrade to in-pass clears.
            let mut clear_aspects = vk::ImageAspectFlags::empty();
            if step.color_action == LoadAction::Clear {
                clear_aspects |= vk::ImageAspectFlags::COLOR;
            }
            if step.depth_action == LoadAction::Clear {
                clear_aspects |= vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
            }
            if !clear_aspects.is_empty() {
                let rect = self.target_rect(&step.target);
                self.device.clear_attachments(
                    cmd,
                    clear_aspects,
                    unpack_clear_color(step.clear_color),
                    step.clear_depth,
                    step.clear_stencil,
                    rect,
                );
            }
        } else {
            self.close_open_pass(cmd);

            let (pass, framebuffer) = match &step.target {
                RenderTarget::Backbuffer => {
                    (self.pass_cache.backbuffer_pass(), backbuffer.framebuffer)
                }
                RenderTarget::Offscreen(fb) => {
                    let mut batch = BarrierBatch::new();
                    self.tracker.require_color_layout(
                        fb,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        &mut batch,
                    );
                    self.tracker.require_depth_layout(
                        fb,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        &mut batch,
                    );
                    self.emit_barriers(cmd, batch);
                    (
                        self.pass_cache.select(step.color_action, step.depth_action),
                        fb.vk_framebuffer,
                    )
                }
            };

            let rect = self.target_rect(&step.target);
            self.device.begin_render_pass(
                cmd,
                pass,
                framebuffer,
                rect,
                unpack_clear_color(step.clear_color),
                step.clear_depth,
                step.clear_stencil,
            );
            self.tracker.bind(step.target.clone());
        }

        if step.final_color_layout != vk::ImageLayout::UNDEFINED {
            if let RenderTarget::Offscreen(fb) = &step.target {
                self.tracker
                    .set_pending_final(Arc::clone(fb), step.final_color_layout);
            }
        }

        self.play_commands(cmd, step);
        Ok(())
    }

    fn play_commands(&mut self, cmd: vk::CommandBuffer, step: &RenderStep) {
        for command in &step.commands {
            match command {
                RenderCommand::SetViewport(viewport) => self.device.set_viewport(cmd, *viewport),
                RenderCommand::SetScissor(scissor) => self.device.set_scissor(cmd, *scissor),
                RenderCommand::SetBlendConstants(constants) => {
                    self.device.set_blend_constants(cmd, *constants);
                }
                RenderCommand::SetStencilState {
                    write_mask,
                    compare_mask,
                    reference,
                } => {
                    self.device
                        .set_stencil_state(cmd, *write_mask, *compare_mask, *reference);
                }
                RenderCommand::Draw {
                    pipeline,
                    pipeline_layout,
                    descriptor_set,
                    dynamic_offsets,
                    dynamic_offset_count,
                    vertex_buffer,
                    vertex_offset,
                    vertex_count,
                } => {
                    self.device.bind_pipeline(cmd, *pipeline);
                    self.device.bind_descriptor_set(
                        cmd,
                        *pipeline_layout,
                        *descriptor_set,
                        &dynamic_offsets[..*dynamic_offset_count as usize],
                    );
                    self.device
                        .bind_vertex_buffer(cmd, *vertex_buffer, *vertex_offset);
                    self.device.draw(cmd, *vertex_count);
                }
                RenderCommand::DrawIndexed {
                    pipeline,
                    pipeline_layout,
                    descriptor_set,
                    dynamic_offsets,
                    dynamic_offset_count,
                    vertex_buffer,
                    vertex_offset,
                    index_buffer,
                    index_offset,
                    index_type,
                    index_count,
                    instance_count,
                } => {
                    self.device.bind_pipeline(cmd, *pipeline);
                    self.device.bind_descriptor_set(
                        cmd,
                        *pipeline_layout,
                        *descriptor_set,
                        &dynamic_offsets[..*dynamic_offset_count as usize],
                    );
                    self.device
                        .bind_vertex_buffer(cmd, *vertex_buffer, *vertex_offset);
                    self.device
                        .bind_index_buffer(cmd, *index_buffer, *index_offset, *index_type);
                    self.device.draw_indexed(cmd, *index_count, *instance_count);
                }
                RenderCommand::Clear {
                    color,
                    depth,
                    stencil,
                    aspects,
                } => {
                    let rect = self.target_rect(&step.target);
                    self.device.clear_attachments(
                        cmd,
                        *aspects,
                        unpack_clear_color(*color),
                        *depth,
                        *stencil,
                        rect,
                    );
                }
            }
        }
    }

    fn execute_copy_step(&mut self, cmd: vk::CommandBuffer, step: &CopyStep) {
        self.close_open_pass(cmd);

        let wants_color = step.aspects.contains(vk::ImageAspectFlags::COLOR);
        let wants_depth = step
            .aspects
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);

        let mut batch = BarrierBatch::new();
        if wants_color {
            self.tracker.require_color_layout(
                &step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &mut batch,
            );
            self.tracker.require_color_layout(
                &step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &mut batch,
            );
        }
        if wants_depth {
            self.tracker.require_depth_layout(
                &step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &mut batch,
            );
            self.tracker.require_depth_layout(
                &step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &mut batch,
            );
        }
        self.emit_barriers(cmd, batch);

        if wants_color {
            self.device.copy_image(
                cmd,
                step.src.color.image,
                step.dst.color.image,
                &ImageCopyRegion {
                    aspects: vk::ImageAspectFlags::COLOR,
                    src_offset: step.src_rect.offset,
                    dst_offset: step.dst_pos,
                    extent: step.src_rect.extent,
                },
            );
        }
        if wants_depth {
            // Depth and stencil live in one image and move together.
            self.device.copy_image(
                cmd,
                step.src.depth.image,
                step.dst.depth.image,
                &ImageCopyRegion {
                    aspects: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                    src_offset: step.src_rect.offset,
                    dst_offset: step.dst_pos,
                    extent: step.src_rect.extent,
                },
            );
        }
    }

    fn execute_blit_step(&mut self, cmd: vk::CommandBuffer, step: &BlitStep) {
        self.close_open_pass(cmd);

        let wants_color = step.aspects.contains(vk::ImageAspectFlags::COLOR);
        let wants_depth = step
            .aspects
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);

        let mut batch = BarrierBatch::new();
        if wants_color {
            self.tracker.require_color_layout(
                &step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &mut batch,
            );
            self.tracker.require_color_layout(
                &step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &mut batch,
            );
        }
        if wants_depth {
            self.tracker.require_depth_layout(
                &step.src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                &mut batch,
            );
            self.tracker.require_depth_layout(
                &step.dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &mut batch,
            );
        }
        self.emit_barriers(cmd, batch);

        if wants_color {
            self.device.blit_image(
                cmd,
                step.src.color.image,
                step.dst.color.image,
                step.src_rect,
                step.dst_rect,
                vk::ImageAspectFlags::COLOR,
                step.filter,
            );
        }
        if wants_depth {
            // Depth blits must not interpolate.
            self.device.blit_image(
                cmd,
                step.src.depth.image,
                step.dst.depth.image,
                step.src_rect,
                step.dst_rect,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                vk::Filter::NEAREST,
            );
        }
    }

    fn execute_readback_step(&mut self, cmd: vk::CommandBuffer, step: &ReadbackStep) {
        self.close_open_pass(cmd);
        nebula_debug!(
            LOG_SOURCE,
            "readback of framebuffer {} ({:?}) recorded without a staging path, skipping",
            step.src.id(),
            step.aspects
        );
    }

    // ===== PASS AND BARRIER PLUMBING =====

    /// Ends the open render pass, if any, and applies the recorded final
    /// layout of its target.
    fn close_open_pass(&mut self, cmd: vk::CommandBuffer) {
        if self.tracker.unbind().is_none() {
            return;
        }
        self.device.end_render_pass(cmd);

        if let Some((fb, layout)) = self.tracker.take_pending_final() {
            let mut batch = BarrierBatch::new();
            self.tracker.require_color_layout(&fb, layout, &mut batch);
            self.emit_barriers(cmd, batch);
        }
    }

    fn emit_barriers(&self, cmd: vk::CommandBuffer, batch: BarrierBatch) {
        if batch.is_empty() {
            return;
        }
        self.device
            .pipeline_barrier(cmd, batch.src_stages, batch.dst_stages, &batch.transitions);
    }

    fn target_rect(&self, target: &RenderTarget) -> vk::Rect2D {
        match target {
            RenderTarget::Backbuffer => vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.surface.extent(),
            },
            RenderTarget::Offscreen(fb) => fb.rect(),
        }
    }

    /// Submits an empty frame so the slot fence still signals when the
    /// image acquire failed.
    fn submit_abandoned_frame(&mut self, frame_index: u64) -> Result<()> {
        let cmd = self.pool.main_command_buffer(frame_index);
        self.device.begin_command_buffer(cmd)?;
        self.pool.end_frame(frame_index, None, None)
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
