/// Mock device and surface for unit tests (no GPU required)
///
/// `MockDevice` records every call as a formatted string in a shared
/// operation log and fabricates raw Vulkan handles from a counter, so tests
/// can assert call ordering and handle identity across the whole frame.
/// `MockSurface` shares the same log, which makes acquire / submit / present
/// ordering visible in one place. Fences are real blocking objects backed by
/// a condvar: by default a submit signals its fence immediately, and tests
/// that need backpressure can switch to manual signaling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use rustc_hash::FxHashMap;

use crate::device::graphics_device::{
    GraphicsDevice, ImageCopyRegion, ImageTransition, RenderPassDescriptor, SemaphoreWait,
};
use crate::device::present_surface::{AcquiredImage, BackbufferImage, PresentSurface};
use crate::error::{Error, Result};
use crate::render::framebuffer::{Attachment, Framebuffer};

// ============================================================================
// Mock Device
// ============================================================================

/// Mock GraphicsDevice that logs calls and fabricates handles
#[derive(Debug)]
pub struct MockDevice {
    /// Shared operation log, also written to by `MockSurface`
    ops: Arc<Mutex<Vec<String>>>,
    next_handle: AtomicU64,
    /// Fence handle -> signaled
    fences: Mutex<FxHashMap<u64, bool>>,
    fence_cv: Condvar,
    /// When true (the default), `submit_frame` signals its fence immediately
    auto_signal_fences: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            next_handle: AtomicU64::new(1),
            fences: Mutex::new(FxHashMap::default()),
            fence_cv: Condvar::new(),
            auto_signal_fences: AtomicBool::new(true),
        }
    }

    /// Get a snapshot of the operation log
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Clear the operation log (useful between frames in a test)
    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Disable or re-enable automatic fence signaling on submit
    pub fn set_auto_signal_fences(&self, auto: bool) {
        self.auto_signal_fences.store(auto, Ordering::SeqCst);
    }

    /// Signal a fence manually and wake any waiter
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.log(format!("signal_fence(fence={})", fence.as_raw()));
        let mut fences = self.fences.lock().unwrap();
        fences.insert(fence.as_raw(), true);
        self.fence_cv.notify_all();
    }

    /// Build an offscreen framebuffer from fabricated handles
    pub fn make_framebuffer(&self, width: u32, height: u32) -> Arc<Framebuffer> {
        let color = Attachment {
            image: vk::Image::from_raw(self.alloc_handle()),
            view: vk::ImageView::from_raw(self.alloc_handle()),
            format: vk::Format::R8G8B8A8_UNORM,
        };
        let depth = Attachment {
            image: vk::Image::from_raw(self.alloc_handle()),
            view: vk::ImageView::from_raw(self.alloc_handle()),
            format: vk::Format::D24_UNORM_S8_UINT,
        };
        Arc::new(Framebuffer::new(
            width,
            height,
            vk::Framebuffer::from_raw(self.alloc_handle()),
            color,
            depth,
        ))
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl GraphicsDevice for MockDevice {
    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let raw = self.alloc_handle();
        self.log(format!("create_command_pool() -> {}", raw));
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let raws: Vec<u64> = (0..count).map(|_| self.alloc_handle()).collect();
        self.log(format!(
            "allocate_command_buffers(pool={}, count={}) -> {:?}",
            pool.as_raw(),
            count,
            raws
        ));
        Ok(raws.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.log(format!("reset_command_pool(pool={})", pool.as_raw()));
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.log(format!("reset_command_buffer(cmd={})", cmd.as_raw()));
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.log(format!("destroy_command_pool(pool={})", pool.as_raw()));
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.log(format!("begin_command_buffer(cmd={})", cmd.as_raw()));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.log(format!("end_command_buffer(cmd={})", cmd.as_raw()));
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let raw = self.alloc_handle();
        self.log(format!("create_fence(signaled={}) -> {}", signaled, raw));
        self.fences.lock().unwrap().insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        self.log(format!("wait_for_fence(fence={})", fence.as_raw()));
        let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
        let mut fences = self.fences.lock().unwrap();
        loop {
            match fences.get(&fence.as_raw()).copied() {
                Some(true) => return Ok(()),
                Some(false) => {}
                None => {
                    return Err(Error::InvalidResource(format!(
                        "wait on unknown fence {}",
                        fence.as_raw()
                    )));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeviceLost(format!(
                    "fence {} not signaled within {} ns",
                    fence.as_raw(),
                    timeout_ns
                )));
            }
            let (guard, _) = self.fence_cv.wait_timeout(fences, deadline - now).unwrap();
            fences = guard;
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.log(format!("reset_fence(fence={})", fence.as_raw()));
        self.fences.lock().unwrap().insert(fence.as_raw(), false);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.log(format!("destroy_fence(fence={})", fence.as_raw()));
        self.fences.lock().unwrap().remove(&fence.as_raw());
    }

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> Result<vk::RenderPass> {
        let raw = self.alloc_handle();
        self.log(format!(
            "create_render_pass(color={:?}, depth={:?}, backbuffer={}) -> {}",
            desc.color_load, desc.depth_load, desc.for_backbuffer, raw
        ));
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, pass: vk::RenderPass) {
        self.log(format!("destroy_render_pass(pass={})", pass.as_raw()));
    }

    fn begin_render_pass(
        &self,
        _cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _render_area: vk::Rect2D,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    ) {
        self.log(format!(
            "begin_render_pass(pass={}, fb={}, clear_color={:?}, clear_depth={}, clear_stencil={})",
            pass.as_raw(),
            framebuffer.as_raw(),
            clear_color,
            clear_depth,
            clear_stencil
        ));
    }

    fn end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.log("end_render_pass()".to_string());
    }

    fn set_viewport(&self, _cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.log(format!(
            "set_viewport(w={}, h={})",
            viewport.width, viewport.height
        ));
    }

    fn set_scissor(&self, _cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.log(format!(
            "set_scissor(x={}, y={}, w={}, h={})",
            scissor.offset.x, scissor.offset.y, scissor.extent.width, scissor.extent.height
        ));
    }

    fn set_blend_constants(&self, _cmd: vk::CommandBuffer, constants: [f32; 4]) {
        self.log(format!("set_blend_constants({:?})", constants));
    }

    fn set_stencil_state(
        &self,
        _cmd: vk::CommandBuffer,
        write_mask: u32,
        compare_mask: u32,
        reference: u32,
    ) {
        self.log(format!(
            "set_stencil_state(write={}, compare={}, ref={})",
            write_mask, compare_mask, reference
        ));
    }

    fn bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.log(format!("bind_pipeline(pipeline={})", pipeline.as_raw()));
    }

    fn bind_descriptor_set(
        &self,
        _cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    ) {
        self.log(format!(
            "bind_descriptor_set(set={}, dynamic_offsets={:?})",
            set.as_raw(),
            dynamic_offsets
        ));
    }

    fn bind_vertex_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.log(format!(
            "bind_vertex_buffer(buffer={}, offset={})",
            buffer.as_raw(),
            offset
        ));
    }

    fn bind_index_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.log(format!(
            "bind_index_buffer(buffer={}, offset={}, type={:?})",
            buffer.as_raw(),
            offset,
            index_type
        ));
    }

    fn draw(&self, _cmd: vk::CommandBuffer, vertex_count: u32) {
        self.log(format!("draw(vertices={})", vertex_count));
    }

    fn draw_indexed(&self, _cmd: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        self.log(format!(
            "draw_indexed(indices={}, instances={})",
            index_count, instance_count
        ));
    }

    fn clear_attachments(
        &self,
        _cmd: vk::CommandBuffer,
        aspects: vk::ImageAspectFlags,
        color: [f32; 4],
        depth: f32,
        stencil: u32,
        _rect: vk::Rect2D,
    ) {
        self.log(format!(
            "clear_attachments(aspects={:?}, color={:?}, depth={}, stencil={})",
            aspects, color, depth, stencil
        ));
    }

    fn pipeline_barrier(
        &self,
        _cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        transitions: &[ImageTransition],
    ) {
        let entries: Vec<String> = transitions
            .iter()
            .map(|t| {
                format!(
                    "(image={}, {:?} -> {:?})",
                    t.image.as_raw(),
                    t.old_layout,
                    t.new_layout
                )
            })
            .collect();
        self.log(format!(
            "pipeline_barrier(transitions=[{}])",
            entries.join(", ")
        ));
    }

    fn copy_image(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &ImageCopyRegion,
    ) {
        self.log(format!(
            "copy_image(src={}, dst={}, aspects={:?})",
            src.as_raw(),
            dst.as_raw(),
            region.aspects
        ));
    }

    fn blit_image(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        _src_rect: vk::Rect2D,
        _dst_rect: vk::Rect2D,
        aspects: vk::ImageAspectFlags,
        filter: vk::Filter,
    ) {
        self.log(format!(
            "blit_image(src={}, dst={}, aspects={:?}, filter={:?})",
            src.as_raw(),
            dst.as_raw(),
            aspects,
            filter
        ));
    }

    fn submit_frame(
        &self,
        cmds: &[vk::CommandBuffer],
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> Result<()> {
        let cmd_raws: Vec<u64> = cmds.iter().map(|c| c.as_raw()).collect();
        let wait_desc = wait.map_or("none".to_string(), |w| w.semaphore.as_raw().to_string());
        let signal_desc = signal.map_or("none".to_string(), |s| s.as_raw().to_string());
        self.log(format!(
            "submit(cmds={:?}, wait_sem={}, signal_sem={}, fence={})",
            cmd_raws,
            wait_desc,
            signal_desc,
            fence.as_raw()
        ));
        if self.auto_signal_fences.load(Ordering::SeqCst) {
            let mut fences = self.fences.lock().unwrap();
            fences.insert(fence.as_raw(), true);
            self.fence_cv.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.log("wait_idle()".to_string());
        Ok(())
    }
}

// ============================================================================
// Mock Surface
// ============================================================================

/// Mock PresentSurface sharing the device's operation log
///
/// Images are handed out round-robin. The failure flags are `Arc`s so a test
/// can keep a clone and arm an out-of-date error after the surface has moved
/// to the render thread.
#[derive(Debug)]
pub struct MockSurface {
    ops: Arc<Mutex<Vec<String>>>,
    extent: vk::Extent2D,
    images: Vec<BackbufferImage>,
    acquire_semaphores: Vec<vk::Semaphore>,
    render_complete_semaphores: Vec<vk::Semaphore>,
    next_image: usize,
    pub fail_acquire: Arc<AtomicBool>,
    pub fail_present: Arc<AtomicBool>,
}

impl MockSurface {
    /// Create a surface with three backbuffer images, fabricating handles
    /// from the device's counter so they stay unique across the test
    pub fn new(device: &MockDevice, width: u32, height: u32) -> Self {
        const IMAGE_COUNT: usize = 3;
        let mut images = Vec::with_capacity(IMAGE_COUNT);
        let mut acquire_semaphores = Vec::with_capacity(IMAGE_COUNT);
        let mut render_complete_semaphores = Vec::with_capacity(IMAGE_COUNT);
        for _ in 0..IMAGE_COUNT {
            images.push(BackbufferImage {
                image: vk::Image::from_raw(device.alloc_handle()),
                view: vk::ImageView::from_raw(device.alloc_handle()),
                framebuffer: vk::Framebuffer::from_raw(device.alloc_handle()),
            });
            acquire_semaphores.push(vk::Semaphore::from_raw(device.alloc_handle()));
            render_complete_semaphores.push(vk::Semaphore::from_raw(device.alloc_handle()));
        }
        Self {
            ops: device.ops.clone(),
            extent: vk::Extent2D { width, height },
            images,
            acquire_semaphores,
            render_complete_semaphores,
            next_image: 0,
            fail_acquire: Arc::new(AtomicBool::new(false)),
            fail_present: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Semaphore pair for one image slot, for asserting submit wiring
    pub fn image_semaphores(&self, image_index: u32) -> (vk::Semaphore, vk::Semaphore) {
        let idx = image_index as usize;
        (
            self.acquire_semaphores[idx],
            self.render_complete_semaphores[idx],
        )
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl PresentSurface for MockSurface {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn color_format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_UNORM
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D24_UNORM_S8_UINT
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn backbuffer(&self, image_index: u32) -> Result<BackbufferImage> {
        self.images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| {
                Error::InvalidResource(format!(
                    "backbuffer index {} out of range ({} images)",
                    image_index,
                    self.images.len()
                ))
            })
    }

    fn acquire_image(&mut self) -> Result<AcquiredImage> {
        if self.fail_acquire.swap(false, Ordering::SeqCst) {
            self.log("acquire_image() -> out of date".to_string());
            return Err(Error::SurfaceOutOfDate);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images.len();
        self.log(format!("acquire_image() -> {}", index));
        Ok(AcquiredImage {
            image_index: index as u32,
            acquire_semaphore: self.acquire_semaphores[index],
            render_complete_semaphore: self.render_complete_semaphores[index],
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32) -> Result<()> {
        if self.fail_present.swap(false, Ordering::SeqCst) {
            self.log(format!("present(image={}) -> out of date", image_index));
            return Err(Error::SurfaceOutOfDate);
        }
        self.log(format!("present(image={})", image_index));
        Ok(())
    }

    fn recreate(&mut self, backbuffer_pass: vk::RenderPass) -> Result<()> {
        self.log(format!("recreate(pass={})", backbuffer_pass.as_raw()));
        self.next_image = 0;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "mock_device_tests.rs"]
mod tests;
