/// Render pass cache - the fixed 3x3 table plus the backbuffer pass
///
/// Built once at startup and read-only afterwards; selection is a pure index
/// into the table. Offscreen passes keep their attachments in
/// attachment-optimal layout on both ends, so every layout movement stays in
/// the executor's explicit barriers.

use std::sync::Arc;

use ash::vk;

use crate::device::graphics_device::{GraphicsDevice, RenderPassDescriptor};
use crate::error::Result;
use crate::nebula_debug;
use super::step::LoadAction;

const ACTIONS: [LoadAction; 3] = [LoadAction::Clear, LoadAction::Keep, LoadAction::DontCare];

/// Owns one render pass per {color load} x {depth load} combination and the
/// distinct fixed Clear/Clear pass for the backbuffer path
pub struct RenderPassCache {
    device: Arc<dyn GraphicsDevice>,
    passes: [vk::RenderPass; 9],
    backbuffer_pass: vk::RenderPass,
    color_format: vk::Format,
    depth_format: vk::Format,
    backbuffer_color_format: vk::Format,
}

impl RenderPassCache {
    /// Eagerly create all ten passes
    ///
    /// # Errors
    ///
    /// Creation failures are startup-fatal; there is no partial cache.
    pub fn new(
        device: Arc<dyn GraphicsDevice>,
        color_format: vk::Format,
        depth_format: vk::Format,
        backbuffer_color_format: vk::Format,
    ) -> Result<Self> {
        let passes = Self::build_table(device.as_ref(), color_format, depth_format)?;
        let backbuffer_pass =
            Self::build_backbuffer_pass(device.as_ref(), backbuffer_color_format, depth_format)?;
        nebula_debug!(
            "nebula::queue",
            "render pass cache built ({} offscreen passes + backbuffer pass)",
            passes.len()
        );
        Ok(Self {
            device,
            passes,
            backbuffer_pass,
            color_format,
            depth_format,
            backbuffer_color_format,
        })
    }

    /// Look up the offscreen pass for a load-action pair
    ///
    /// Pure function of the two actions; the same pair always returns the
    /// same handle.
    pub fn select(&self, color: LoadAction, depth: LoadAction) -> vk::RenderPass {
        self.passes[depth.index() * 3 + color.index()]
    }

    /// The fixed Clear/Clear pass used when the target is the backbuffer
    pub fn backbuffer_pass(&self) -> vk::RenderPass {
        self.backbuffer_pass
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Recreate every pass after a depth/stencil format change
    pub fn rebuild(&mut self, depth_format: vk::Format) -> Result<()> {
        self.destroy_passes();
        self.depth_format = depth_format;
        self.passes =
            Self::build_table(self.device.as_ref(), self.color_format, depth_format)?;
        self.backbuffer_pass = Self::build_backbuffer_pass(
            self.device.as_ref(),
            self.backbuffer_color_format,
            depth_format,
        )?;
        nebula_debug!(
            "nebula::queue",
            "render pass cache rebuilt for depth format {:?}",
            depth_format
        );
        Ok(())
    }

    fn build_table(
        device: &dyn GraphicsDevice,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<[vk::RenderPass; 9]> {
        let mut passes = [vk::RenderPass::null(); 9];
        for depth_action in ACTIONS {
            for color_action in ACTIONS {
                let desc = RenderPassDescriptor {
                    color_load: color_action,
                    depth_load: depth_action,
                    color_format,
                    depth_format,
                    for_backbuffer: false,
                };
                passes[depth_action.index() * 3 + color_action.index()] =
                    device.create_render_pass(&desc)?;
            }
        }
        Ok(passes)
    }

    fn build_backbuffer_pass(
        device: &dyn GraphicsDevice,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<vk::RenderPass> {
        device.create_render_pass(&RenderPassDescriptor {
            color_load: LoadAction::Clear,
            depth_load: LoadAction::Clear,
            color_format,
            depth_format,
            for_backbuffer: true,
        })
    }

    fn destroy_passes(&mut self) {
        for pass in &mut self.passes {
            if *pass != vk::RenderPass::null() {
                self.device.destroy_render_pass(*pass);
                *pass = vk::RenderPass::null();
            }
        }
        if self.backbuffer_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.backbuffer_pass);
            self.backbuffer_pass = vk::RenderPass::null();
        }
    }
}

impl Drop for RenderPassCache {
    fn drop(&mut self) {
        self.destroy_passes();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "pass_cache_tests.rs"]
mod tests;
