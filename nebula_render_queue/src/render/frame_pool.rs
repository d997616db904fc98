/// Frame slot pool - rotating per-frame command buffers and fences
///
/// N slots, one per in-flight frame; slot index is frame index mod N. The
/// fence wait in `begin_frame` is the sole backpressure bounding how far the
/// CPU runs ahead of the GPU. Fences start signaled so the first pass through
/// each slot does not block. The fence wait happens without the slot lock
/// held, so an executor submitting the previous frame on the same slot can
/// make progress.

use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::device::graphics_device::{GraphicsDevice, SemaphoreWait};
use crate::error::{Error, Result};
use crate::nebula_trace;

struct FrameSlot {
    pool: vk::CommandPool,
    init_cmd: vk::CommandBuffer,
    main_cmd: vk::CommandBuffer,
    fence: vk::Fence,
    /// Init buffer holds recorded work awaiting submission
    has_init_commands: bool,
}

/// Owns the N frame slots and their device resources
pub struct FrameSlotPool {
    device: Arc<dyn GraphicsDevice>,
    slots: Vec<Mutex<FrameSlot>>,
    fence_timeout_ns: u64,
}

impl std::fmt::Debug for FrameSlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSlotPool")
            .field("slot_count", &self.slots.len())
            .field("fence_timeout_ns", &self.fence_timeout_ns)
            .finish_non_exhaustive()
    }
}

impl FrameSlotPool {
    /// Allocate command pools, buffers, and signaled fences for every slot
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        inflight_frames: usize,
        fence_timeout_ns: u64,
    ) -> Result<Self> {
        if inflight_frames == 0 {
            return Err(Error::InitializationFailed(
                "inflight_frames must be at least 1".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(inflight_frames);
        for _ in 0..inflight_frames {
            let pool = device.create_command_pool()?;
            let buffers = device.allocate_command_buffers(pool, 2)?;
            let fence = device.create_fence(true)?;
            slots.push(Mutex::new(FrameSlot {
                pool,
                init_cmd: buffers[0],
                main_cmd: buffers[1],
                fence,
                has_init_commands: false,
            }));
        }
        Ok(Self {
            device,
            slots,
            fence_timeout_ns,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Claim the slot for `frame_index`
    ///
    /// Blocks until the slot's previous use has signaled its fence, then
    /// resets the fence and recycles the command buffers. Init commands
    /// carried over from before the frame loop started survive the recycle;
    /// only the main buffer is reset in that case.
    ///
    /// # Errors
    ///
    /// `Error::DeviceLost` when the fence wait exceeds the configured
    /// timeout.
    pub fn begin_frame(&self, frame_index: u64) -> Result<()> {
        let fence = self.lock_slot(frame_index).fence;
        self.device.wait_for_fence(fence, self.fence_timeout_ns)?;

        let slot = self.lock_slot(frame_index);
        self.device.reset_fence(slot.fence)?;
        if slot.has_init_commands {
            self.device.reset_command_buffer(slot.main_cmd)?;
        } else {
            self.device.reset_command_pool(slot.pool)?;
        }
        nebula_trace!(
            "nebula::queue",
            "frame {} claimed slot {}",
            frame_index,
            frame_index as usize % self.slots.len()
        );
        Ok(())
    }

    /// The main command buffer for `frame_index`'s slot
    pub fn main_command_buffer(&self, frame_index: u64) -> vk::CommandBuffer {
        self.lock_slot(frame_index).main_cmd
    }

    /// The init command buffer, begun lazily on first use
    ///
    /// Callable before the first `begin_frame`, so startup uploads recorded
    /// ahead of the frame loop ride along with the first submission.
    pub fn init_command_buffer(&self, frame_index: u64) -> Result<vk::CommandBuffer> {
        let mut slot = self.lock_slot(frame_index);
        if !slot.has_init_commands {
            self.device.begin_command_buffer(slot.init_cmd)?;
            slot.has_init_commands = true;
        }
        Ok(slot.init_cmd)
    }

    /// Finalize and submit the frame's command buffers as one submission
    ///
    /// The init buffer goes first when populated. The slot's fence signals
    /// completion of the whole batch; the init flag clears under the same
    /// lock, so `begin_frame` never observes a half-submitted slot.
    pub fn end_frame(
        &self,
        frame_index: u64,
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
    ) -> Result<()> {
        let mut slot = self.lock_slot(frame_index);
        let mut cmds: Vec<vk::CommandBuffer> = Vec::with_capacity(2);
        if slot.has_init_commands {
            self.device.end_command_buffer(slot.init_cmd)?;
            cmds.push(slot.init_cmd);
        }
        self.device.end_command_buffer(slot.main_cmd)?;
        cmds.push(slot.main_cmd);
        self.device.submit_frame(&cmds, wait, signal, slot.fence)?;
        slot.has_init_commands = false;
        Ok(())
    }

    fn lock_slot(&self, frame_index: u64) -> MutexGuard<'_, FrameSlot> {
        let idx = frame_index as usize % self.slots.len();
        self.slots[idx].lock().unwrap()
    }
}

impl Drop for FrameSlotPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let slot = slot.lock().unwrap();
            self.device.destroy_fence(slot.fence);
            self.device.destroy_command_pool(slot.pool);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "frame_pool_tests.rs"]
mod tests;
