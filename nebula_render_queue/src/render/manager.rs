/// RenderQueue - immediate-style recording facade over deferred execution
///
/// The facade owns the recorder, the frame slot pool, and the execution
/// backend (render thread or inline executor). Callers bracket work with
/// `begin_frame` / `end_frame`, record passes and draws in between, and the
/// queue turns each frame's step log into device commands one frame behind
/// when the render thread is enabled.

use std::sync::Arc;

use ash::vk;

use crate::device::{GraphicsDevice, PresentSurface};
use crate::error::{Error, Result};
use crate::{nebula_error, nebula_info};

use super::executor::FrameExecutor;
use super::frame_pool::FrameSlotPool;
use super::framebuffer::Framebuffer;
use super::handoff::RenderWorker;
use super::recorder::StepRecorder;
use super::step::{LoadAction, RenderTarget};

const LOG_SOURCE: &str = "nebula::queue";

/// Tuning knobs for the queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Frame slots rotating in flight; 1 serializes CPU and GPU
    pub inflight_frames: usize,
    /// Execute on a dedicated render thread instead of inline in `flush`
    pub use_render_thread: bool,
    /// Upper bound on any single fence wait before the device is declared
    /// lost
    pub fence_timeout_ns: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inflight_frames: 2,
            use_render_thread: true,
            fence_timeout_ns: 5_000_000_000,
        }
    }
}

enum ExecutionBackend {
    Threaded(RenderWorker),
    Immediate(FrameExecutor),
}

/// The deferred rendering queue
pub struct RenderQueue {
    device: Arc<dyn GraphicsDevice>,
    pool: Arc<FrameSlotPool>,
    recorder: StepRecorder,
    backend: ExecutionBackend,
    frame_index: u64,
    frame_open: bool,
    flushed_this_frame: bool,
    shut_down: bool,
}

impl RenderQueue {
    // ===== LIFECYCLE =====

    /// Builds the queue over a device and a presentation surface.
    ///
    /// # Errors
    ///
    /// Returns an error if slot allocation, pass creation, or render
    /// thread spawning fails.
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        surface: Box<dyn PresentSurface>,
        config: QueueConfig,
    ) -> Result<Self> {
        let pool = Arc::new(FrameSlotPool::new(
            Arc::clone(&device),
            config.inflight_frames,
            config.fence_timeout_ns,
        )?);
        let executor = FrameExecutor::new(Arc::clone(&device), surface, Arc::clone(&pool))?;
        let backend = if config.use_render_thread {
            ExecutionBackend::Threaded(RenderWorker::spawn(executor)?)
        } else {
            ExecutionBackend::Immediate(executor)
        };
        nebula_info!(
            LOG_SOURCE,
            "render queue ready ({} frames in flight, {})",
            config.inflight_frames,
            match backend {
                ExecutionBackend::Threaded(_) => "threaded",
                ExecutionBackend::Immediate(_) => "immediate",
            }
        );
        Ok(Self {
            device,
            pool,
            recorder: StepRecorder::new(),
            backend,
            frame_index: 0,
            frame_open: false,
            flushed_this_frame: false,
            shut_down: false,
        })
    }

    /// Claims the next frame slot, blocking while the GPU is still using it.
    ///
    /// Surfaces any error the render thread parked since the last frame, so
    /// execution failures land on the thread that can react to them.
    ///
    /// # Errors
    ///
    /// `InvalidPassState` when a frame is already open, `DeviceLost` when
    /// the slot fence never signals, or a parked execution error.
    pub fn begin_frame(&mut self) -> Result<()> {
        if self.frame_open {
            nebula_error!(LOG_SOURCE, "begin_frame called while a frame is open");
            return Err(Error::InvalidPassState(
                "begin_frame called while a frame is open".to_string(),
            ));
        }
        if let ExecutionBackend::Threaded(worker) = &self.backend {
            if let Some(err) = worker.take_error() {
                return Err(err);
            }
        }
        self.pool.begin_frame(self.frame_index)?;
        self.frame_open = true;
        self.flushed_this_frame = false;
        Ok(())
    }

    /// Hands the recorded steps to the execution backend.
    ///
    /// The step log is consumed even if execution fails, so a failed frame
    /// is abandoned rather than replayed.
    ///
    /// # Errors
    ///
    /// `InvalidPassState` outside an open frame or when called twice in one
    /// frame; otherwise whatever execution reports.
    pub fn flush(&mut self) -> Result<()> {
        if !self.frame_open {
            nebula_error!(LOG_SOURCE, "flush called outside an open frame");
            return Err(Error::InvalidPassState(
                "flush called outside an open frame".to_string(),
            ));
        }
        if self.flushed_this_frame {
            nebula_error!(LOG_SOURCE, "flush called twice in frame {}", self.frame_index);
            return Err(Error::InvalidPassState(
                "flush already called this frame".to_string(),
            ));
        }
        self.flushed_this_frame = true;
        let steps = self.recorder.take_steps();
        match &mut self.backend {
            ExecutionBackend::Threaded(worker) => worker.submit(self.frame_index, steps),
            ExecutionBackend::Immediate(executor) => executor.run_frame(self.frame_index, steps),
        }
    }

    /// Closes the frame, flushing implicitly when the caller has not.
    ///
    /// # Errors
    ///
    /// `InvalidPassState` when no frame is open; otherwise the implicit
    /// flush result. The frame counter advances either way.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.frame_open {
            nebula_error!(LOG_SOURCE, "end_frame called without begin_frame");
            return Err(Error::InvalidPassState(
                "end_frame called without begin_frame".to_string(),
            ));
        }
        let result = if self.flushed_this_frame {
            Ok(())
        } else {
            self.flush()
        };
        self.frame_open = false;
        self.frame_index += 1;
        result
    }

    /// Rebuilds the presentation surface; only legal between frames.
    ///
    /// # Errors
    ///
    /// `InvalidPassState` mid-frame, or the rebuild error.
    pub fn recreate_surface(&mut self) -> Result<()> {
        if self.frame_open {
            return Err(Error::InvalidPassState(
                "recreate_surface must be called between frames".to_string(),
            ));
        }
        match &mut self.backend {
            ExecutionBackend::Threaded(worker) => worker.recreate_surface(),
            ExecutionBackend::Immediate(executor) => executor.recreate_surface(),
        }
    }

    /// Stops the render thread and drains the device; safe to call twice.
    ///
    /// # Errors
    ///
    /// `BackendError` if the render thread panicked, or the device drain
    /// error.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        if let ExecutionBackend::Threaded(worker) = &mut self.backend {
            worker.shutdown()?;
        }
        self.device.wait_idle()
    }

    /// Frames completed or in flight so far
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    // ===== RECORDING =====

    /// Opens a render pass on `target`, keeping existing contents
    pub fn begin_render_pass(&mut self, target: RenderTarget) -> Result<()> {
        self.begin_render_pass_with(target, LoadAction::Keep, LoadAction::Keep, 0, 1.0, 0)
    }

    /// Opens a render pass with explicit load actions and clear values
    pub fn begin_render_pass_with(
        &mut self,
        target: RenderTarget,
        color_action: LoadAction,
        depth_action: LoadAction,
        clear_color: u32,
        clear_depth: f32,
        clear_stencil: u32,
    ) -> Result<()> {
        self.open_recorder("begin_render_pass")?.begin_render_pass(
            target,
            color_action,
            depth_action,
            clear_color,
            clear_depth,
            clear_stencil,
        );
        Ok(())
    }

    /// Clears the active target, folding into the pass's load actions when
    /// nothing has been drawn yet
    pub fn clear(
        &mut self,
        aspects: vk::ImageAspectFlags,
        color: u32,
        depth: f32,
        stencil: u32,
    ) -> Result<()> {
        self.open_recorder("clear")?.clear(aspects, color, depth, stencil)
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<()> {
        self.open_recorder("set_viewport")?.set_viewport(viewport)
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> Result<()> {
        self.open_recorder("set_scissor")?.set_scissor(scissor)
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) -> Result<()> {
        self.open_recorder("set_blend_constants")?
            .set_blend_constants(constants)
    }

    pub fn set_stencil_state(
        &mut self,
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    ) -> Result<()> {
        self.open_recorder("set_stencil_state")?
            .set_stencil_state(write_mask, compare_mask, reference)
    }

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
        self.open_recorder("draw")?.draw(
            pipeline,
            pipeline_layout,
            descriptor_set,
            dynamic_offsets,
            vertex_buffer,
            vertex_offset,
            vertex_count,
        )
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
        self.open_recorder("draw_indexed")?.draw_indexed(
            pipeline,
            pipeline_layout,
            descriptor_set,
            dynamic_offsets,
            vertex_buffer,
            vertex_offset,
            index_buffer,
            index_offset,
            index_type,
            index_count,
            instance_count,
        )
    }

    /// Records a 1:1 region copy between two offscreen framebuffers
    pub fn copy_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_pos: vk::Offset2D,
        aspects: vk::ImageAspectFlags,
    ) -> Result<()> {
        self.open_recorder("copy_framebuffer")?
            .copy_framebuffer(src, src_rect, dst, dst_pos, aspects)
    }

    /// Records a scaled blit between two offscreen framebuffers
    #[allow(clippy::too_many_arguments)]
    pub fn blit_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        src_rect: vk::Rect2D,
        dst: &Arc<Framebuffer>,
        dst_rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) -> Result<()> {
        self.open_recorder("blit_framebuffer")?
            .blit_framebuffer(src, src_rect, dst, dst_rect, aspects, filter)
    }

    /// Records a readback request for `src`
    pub fn readback_framebuffer(
        &mut self,
        src: &Arc<Framebuffer>,
        rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
    ) -> Result<()> {
        self.open_recorder("readback_framebuffer")?
            .readback_framebuffer(src, rect, aspects)
    }

    /// Binds `fb`'s color attachment for sampling and returns its view
    pub fn bind_framebuffer_as_texture(
        &mut self,
        fb: &Arc<Framebuffer>,
        binding: u32,
        aspects: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        self.open_recorder("bind_framebuffer_as_texture")?
            .bind_framebuffer_as_texture(fb, binding, aspects)
    }

    /// Command buffer for resource uploads that must land before this
    /// frame's rendering; usable before the first `begin_frame`
    pub fn init_command_buffer(&self) -> Result<vk::CommandBuffer> {
        self.pool.init_command_buffer(self.frame_index)
    }

    // ===== INTERNAL =====

    fn open_recorder(&mut self, what: &str) -> Result<&mut StepRecorder> {
        if !self.frame_open {
            nebula_error!(LOG_SOURCE, "{} called outside an open frame", what);
            return Err(Error::InvalidPassState(format!(
                "{} called outside an open frame",
                what
            )));
        }
        Ok(&mut self.recorder)
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            nebula_error!(LOG_SOURCE, "shutdown during drop failed: {}", err);
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
