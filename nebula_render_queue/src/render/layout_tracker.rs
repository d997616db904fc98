/// Framebuffer layout tracker - executor-side barrier bookkeeping
///
/// Tracks, per framebuffer id, the layout each attachment will be in after
/// all barriers emitted so far execute. The value is forward-looking and
/// authoritative: `require_*` compares against it, appends a transition only
/// on mismatch, and advances it immediately. Also remembers which target the
/// open render pass is bound to and the pending final-layout transition a
/// texture bind attached to that pass.

use ash::vk;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::device::graphics_device::ImageTransition;
use super::framebuffer::Framebuffer;
use super::step::RenderTarget;

/// Forward-looking layouts for one framebuffer's attachments
#[derive(Debug, Clone, Copy)]
pub struct AttachmentLayouts {
    pub color: vk::ImageLayout,
    pub depth: vk::ImageLayout,
}

impl Default for AttachmentLayouts {
    fn default() -> Self {
        Self {
            color: vk::ImageLayout::UNDEFINED,
            depth: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// Accumulates transitions destined for a single barrier command
#[derive(Debug, Default)]
pub struct BarrierBatch {
    pub src_stages: vk::PipelineStageFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub transitions: Vec<ImageTransition>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Per-target layout state, mutated only by the executor during flush
pub struct LayoutTracker {
    layouts: FxHashMap<u64, AttachmentLayouts>,
    bound_target: Option<RenderTarget>,
    pending_final: Option<(Arc<Framebuffer>, vk::ImageLayout)>,
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self {
            layouts: FxHashMap::default(),
            bound_target: None,
            pending_final: None,
        }
    }

    pub fn color_layout(&self, fb: &Framebuffer) -> vk::ImageLayout {
        self.layouts
            .get(&fb.id())
            .map_or(vk::ImageLayout::UNDEFINED, |l| l.color)
    }

    pub fn depth_layout(&self, fb: &Framebuffer) -> vk::ImageLayout {
        self.layouts
            .get(&fb.id())
            .map_or(vk::ImageLayout::UNDEFINED, |l| l.depth)
    }

    /// Queue a color transition if the tracked layout differs, and advance
    /// the tracked layout to `new_layout`
    pub fn require_color_layout(
        &mut self,
        fb: &Framebuffer,
        new_layout: vk::ImageLayout,
        batch: &mut BarrierBatch,
    ) {
        let entry = self.layouts.entry(fb.id()).or_default();
        if entry.color == new_layout {
            return;
        }
        push_transition(
            batch,
            fb.color.image,
            vk::ImageAspectFlags::COLOR,
            entry.color,
            new_layout,
        );
        entry.color = new_layout;
    }

    /// Queue a depth/stencil transition if the tracked layout differs
    ///
    /// Depth and stencil share one image and always move together.
    pub fn require_depth_layout(
        &mut self,
        fb: &Framebuffer,
        new_layout: vk::ImageLayout,
        batch: &mut BarrierBatch,
    ) {
        let entry = self.layouts.entry(fb.id()).or_default();
        if entry.depth == new_layout {
            return;
        }
        push_transition(
            batch,
            fb.depth.image,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            entry.depth,
            new_layout,
        );
        entry.depth = new_layout;
    }

    // ===== OPEN PASS STATE =====

    pub fn bound_target(&self) -> Option<&RenderTarget> {
        self.bound_target.as_ref()
    }

    pub fn bind(&mut self, target: RenderTarget) {
        self.bound_target = Some(target);
    }

    /// Clear the bound target, returning it if a pass was open
    pub fn unbind(&mut self) -> Option<RenderTarget> {
        self.bound_target.take()
    }

    /// Remember the layout the open pass must leave its color attachment in
    pub fn set_pending_final(&mut self, fb: Arc<Framebuffer>, layout: vk::ImageLayout) {
        self.pending_final = Some((fb, layout));
    }

    pub fn take_pending_final(&mut self) -> Option<(Arc<Framebuffer>, vk::ImageLayout)> {
        self.pending_final.take()
    }
}

impl Default for LayoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_transition(
    batch: &mut BarrierBatch,
    image: vk::Image,
    aspects: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let (src_access, src_stage) = layout_source(old_layout);
    let (dst_access, dst_stage) = layout_destination(new_layout);
    batch.transitions.push(ImageTransition {
        image,
        aspects,
        old_layout,
        new_layout,
        src_access,
        dst_access,
    });
    batch.src_stages |= src_stage;
    batch.dst_stages |= dst_stage;
}

/// Access and stage that must complete before leaving `layout`
fn layout_source(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        _ => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
    }
}

/// Access and stage gated until the transition into `layout` completes
fn layout_destination(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[path = "layout_tracker_tests.rs"]
mod tests;
