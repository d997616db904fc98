/// Unit tests for the step recorder

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use super::*;
use crate::render::framebuffer::Attachment;

fn make_framebuffer(width: u32, height: u32) -> Arc<Framebuffer> {
    static NEXT: AtomicU64 = AtomicU64::new(1000);
    let color = Attachment {
        image: vk::Image::from_raw(NEXT.fetch_add(1, Ordering::Relaxed)),
        view: vk::ImageView::from_raw(NEXT.fetch_add(1, Ordering::Relaxed)),
        format: vk::Format::R8G8B8A8_UNORM,
    };
    let depth = Attachment {
        image: vk::Image::from_raw(NEXT.fetch_add(1, Ordering::Relaxed)),
        view: vk::ImageView::from_raw(NEXT.fetch_add(1, Ordering::Relaxed)),
        format: vk::Format::D24_UNORM_S8_UINT,
    };
    Arc::new(Framebuffer::new(
        width,
        height,
        vk::Framebuffer::from_raw(NEXT.fetch_add(1, Ordering::Relaxed)),
        color,
        depth,
    ))
}

fn render_step(recorder: &StepRecorder, index: usize) -> &RenderStep {
    match &recorder.steps()[index] {
        Step::Render(step) => step,
        other => panic!("expected render step at {}, got {:?}", index, other),
    }
}

fn record_draw(recorder: &mut StepRecorder) {
    recorder
        .draw(
            vk::Pipeline::from_raw(1),
            vk::PipelineLayout::from_raw(2),
            vk::DescriptorSet::from_raw(3),
            &[0],
            vk::Buffer::from_raw(4),
            0,
            3,
        )
        .unwrap();
}

fn full_rect(width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    }
}

// ============================================================================
// Clear merging
// ============================================================================

#[test]
fn test_clear_before_draw_folds_into_load_actions() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .clear(
            vk::ImageAspectFlags::COLOR | vk::ImageAspectFlags::DEPTH,
            0xFF0000FF,
            1.0,
            0,
        )
        .unwrap();

    let step = render_step(&recorder, 0);
    assert_eq!(step.color_action, LoadAction::Clear);
    assert_eq!(step.depth_action, LoadAction::Clear);
    assert_eq!(step.clear_color, 0xFF0000FF);
    assert_eq!(step.clear_depth, 1.0);
    assert_eq!(step.clear_stencil, 0);
    assert!(step.commands.is_empty());
}

#[test]
fn test_repeated_clears_before_draw_merge_idempotently() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    for packed in [0x11111111u32, 0x22222222, 0x33333333] {
        recorder
            .clear(vk::ImageAspectFlags::COLOR, packed, 0.0, 0)
            .unwrap();
    }

    assert_eq!(recorder.steps().len(), 1);
    let step = render_step(&recorder, 0);
    assert_eq!(step.color_action, LoadAction::Clear);
    assert_eq!(step.clear_color, 0x33333333);
    assert!(step.commands.is_empty());
}

#[test]
fn test_clear_color_only_leaves_depth_action_untouched() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .clear(vk::ImageAspectFlags::COLOR, 0xAABBCCDD, 1.0, 7)
        .unwrap();

    let step = render_step(&recorder, 0);
    assert_eq!(step.color_action, LoadAction::Clear);
    assert_eq!(step.depth_action, LoadAction::Keep);
    assert_eq!(step.clear_color, 0xAABBCCDD);
}

#[test]
fn test_depth_only_clear_sets_both_depth_and_stencil_values() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .clear(vk::ImageAspectFlags::DEPTH, 0, 0.5, 3)
        .unwrap();

    let step = render_step(&recorder, 0);
    assert_eq!(step.color_action, LoadAction::Keep);
    assert_eq!(step.depth_action, LoadAction::Clear);
    assert_eq!(step.clear_depth, 0.5);
    assert_eq!(step.clear_stencil, 3);
}

#[test]
fn test_clear_after_draw_becomes_mid_pass_command() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);
    recorder
        .clear(vk::ImageAspectFlags::COLOR, 0xFF00FF00, 0.0, 0)
        .unwrap();

    let step = render_step(&recorder, 0);
    assert_eq!(step.color_action, LoadAction::Keep);
    assert_eq!(step.num_draws, 1);
    assert!(matches!(
        step.commands.last(),
        Some(RenderCommand::Clear { color: 0xFF00FF00, .. })
    ));
}

// ============================================================================
// Pass bracketing and rebinds
// ============================================================================

#[test]
fn test_draw_state_without_open_pass_is_invalid_pass_state() {
    let mut recorder = StepRecorder::new();

    let viewport = vk::Viewport::default();
    assert!(matches!(
        recorder.set_viewport(viewport),
        Err(Error::InvalidPassState(_))
    ));
    assert!(matches!(
        recorder.clear(vk::ImageAspectFlags::COLOR, 0, 0.0, 0),
        Err(Error::InvalidPassState(_))
    ));
    assert!(matches!(
        recorder.set_blend_constants([1.0; 4]),
        Err(Error::InvalidPassState(_))
    ));
}

#[test]
fn test_rebind_of_active_target_with_keep_actions_is_deduped() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);

    assert_eq!(recorder.steps().len(), 1);
    assert_eq!(render_step(&recorder, 0).num_draws, 2);
}

#[test]
fn test_rebind_with_clear_action_starts_a_new_step() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Clear,
        LoadAction::Keep,
        0xFFFFFFFF,
        0.0,
        0,
    );

    assert_eq!(recorder.steps().len(), 2);
    assert_eq!(render_step(&recorder, 1).color_action, LoadAction::Clear);
}

#[test]
fn test_rebind_of_a_different_target_starts_a_new_step() {
    let fb_a = make_framebuffer(64, 64);
    let fb_b = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb_a)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb_b)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );

    assert_eq!(recorder.steps().len(), 2);
}

#[test]
fn test_load_actions_capture_initial_clear_values() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Clear,
        LoadAction::Clear,
        0x80402010,
        0.25,
        9,
    );

    let step = render_step(&recorder, 0);
    assert_eq!(step.clear_color, 0x80402010);
    assert_eq!(step.clear_depth, 0.25);
    assert_eq!(step.clear_stencil, 9);
}

// ============================================================================
// Transfer steps
// ============================================================================

#[test]
fn test_copy_closes_the_open_pass() {
    let src = make_framebuffer(64, 64);
    let dst = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&src)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .copy_framebuffer(
            &src,
            full_rect(64, 64),
            &dst,
            vk::Offset2D { x: 0, y: 0 },
            vk::ImageAspectFlags::COLOR,
        )
        .unwrap();

    assert_eq!(recorder.steps().len(), 2);
    assert!(matches!(recorder.steps()[1], Step::Copy(_)));
    assert!(matches!(
        recorder.set_viewport(vk::Viewport::default()),
        Err(Error::InvalidPassState(_))
    ));
}

#[test]
fn test_blit_and_readback_close_the_open_pass() {
    let src = make_framebuffer(64, 64);
    let dst = make_framebuffer(128, 128);
    let mut recorder = StepRecorder::new();

    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .blit_framebuffer(
            &src,
            full_rect(64, 64),
            &dst,
            full_rect(128, 128),
            vk::ImageAspectFlags::COLOR,
            vk::Filter::LINEAR,
        )
        .unwrap();
    assert!(matches!(
        recorder.set_viewport(vk::Viewport::default()),
        Err(Error::InvalidPassState(_))
    ));

    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .readback_framebuffer(&src, full_rect(64, 64), vk::ImageAspectFlags::COLOR)
        .unwrap();
    assert!(matches!(
        recorder.set_viewport(vk::Viewport::default()),
        Err(Error::InvalidPassState(_))
    ));

    assert_eq!(recorder.steps().len(), 4);
}

#[test]
fn test_copy_rejects_out_of_bounds_rects() {
    let src = make_framebuffer(64, 64);
    let dst = make_framebuffer(32, 32);
    let mut recorder = StepRecorder::new();

    assert!(matches!(
        recorder.copy_framebuffer(
            &src,
            full_rect(65, 64),
            &dst,
            vk::Offset2D { x: 0, y: 0 },
            vk::ImageAspectFlags::COLOR,
        ),
        Err(Error::InvalidResource(_))
    ));
    // Fits in the source but lands outside the smaller destination.
    assert!(matches!(
        recorder.copy_framebuffer(
            &src,
            full_rect(64, 64),
            &dst,
            vk::Offset2D { x: 0, y: 0 },
            vk::ImageAspectFlags::COLOR,
        ),
        Err(Error::InvalidResource(_))
    ));
    assert!(recorder.is_empty());
}

#[test]
fn test_transfer_rejects_same_framebuffer() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();

    assert!(matches!(
        recorder.copy_framebuffer(
            &fb,
            full_rect(32, 32),
            &fb,
            vk::Offset2D { x: 32, y: 32 },
            vk::ImageAspectFlags::COLOR,
        ),
        Err(Error::InvalidResource(_))
    ));
    assert!(matches!(
        recorder.blit_framebuffer(
            &fb,
            full_rect(32, 32),
            &fb,
            full_rect(64, 64),
            vk::ImageAspectFlags::COLOR,
            vk::Filter::NEAREST,
        ),
        Err(Error::InvalidResource(_))
    ));
}

// ============================================================================
// Texture binds
// ============================================================================

#[test]
fn test_bind_as_texture_marks_the_most_recent_pending_step() {
    let fb = make_framebuffer(64, 64);
    let other_src = make_framebuffer(64, 64);
    let other_dst = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Clear,
        LoadAction::Clear,
        0,
        1.0,
        0,
    );
    record_draw(&mut recorder);
    // Close the pass so the marked step is pending but no longer active.
    recorder
        .copy_framebuffer(
            &other_src,
            full_rect(64, 64),
            &other_dst,
            vk::Offset2D { x: 0, y: 0 },
            vk::ImageAspectFlags::COLOR,
        )
        .unwrap();

    let view = recorder
        .bind_framebuffer_as_texture(&fb, 0, vk::ImageAspectFlags::COLOR)
        .unwrap();
    assert_eq!(view, fb.color.view);
    assert_eq!(
        render_step(&recorder, 0).final_color_layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
}

#[test]
fn test_bind_as_texture_is_idempotent() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb)),
        LoadAction::Clear,
        LoadAction::Clear,
        0,
        1.0,
        0,
    );

    recorder
        .bind_framebuffer_as_texture(&fb, 0, vk::ImageAspectFlags::COLOR)
        .unwrap();
    recorder
        .bind_framebuffer_as_texture(&fb, 1, vk::ImageAspectFlags::COLOR)
        .unwrap();
    assert_eq!(
        render_step(&recorder, 0).final_color_layout,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    );
}

#[test]
fn test_bind_as_texture_with_two_pending_writers_is_a_conflict() {
    let fb_a = make_framebuffer(64, 64);
    let fb_b = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb_a)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb_b)),
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder.begin_render_pass(
        RenderTarget::Offscreen(Arc::clone(&fb_a)),
        LoadAction::Clear,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    record_draw(&mut recorder);

    assert!(matches!(
        recorder.bind_framebuffer_as_texture(&fb_a, 0, vk::ImageAspectFlags::COLOR),
        Err(Error::ConflictingFramebufferBinding(_))
    ));
}

#[test]
fn test_bind_as_texture_with_no_pending_steps_returns_view_unmarked() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();

    let view = recorder
        .bind_framebuffer_as_texture(&fb, 2, vk::ImageAspectFlags::COLOR)
        .unwrap();
    assert_eq!(view, fb.color.view);
    assert!(recorder.is_empty());
}

#[test]
fn test_bind_as_texture_rejects_depth_aspect() {
    let fb = make_framebuffer(64, 64);
    let mut recorder = StepRecorder::new();

    assert!(matches!(
        recorder.bind_framebuffer_as_texture(&fb, 0, vk::ImageAspectFlags::DEPTH),
        Err(Error::InvalidResource(_))
    ));
}

// ============================================================================
// Handoff and capture
// ============================================================================

#[test]
fn test_take_steps_leaves_the_recorder_empty() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Clear,
        LoadAction::Clear,
        0,
        1.0,
        0,
    );
    record_draw(&mut recorder);

    let steps = recorder.take_steps();
    assert_eq!(steps.len(), 1);
    assert!(recorder.is_empty());
    assert!(matches!(
        recorder.set_viewport(vk::Viewport::default()),
        Err(Error::InvalidPassState(_))
    ));
}

#[test]
fn test_draw_captures_bindings_by_value() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );
    recorder
        .draw_indexed(
            vk::Pipeline::from_raw(11),
            vk::PipelineLayout::from_raw(12),
            vk::DescriptorSet::from_raw(13),
            &[64, 128],
            vk::Buffer::from_raw(14),
            256,
            vk::Buffer::from_raw(15),
            512,
            vk::IndexType::UINT16,
            36,
            2,
        )
        .unwrap();

    let step = render_step(&recorder, 0);
    assert_eq!(step.num_draws, 1);
    match &step.commands[0] {
        RenderCommand::DrawIndexed {
            pipeline,
            descriptor_set,
            dynamic_offsets,
            dynamic_offset_count,
            index_buffer,
            index_offset,
            index_type,
            index_count,
            instance_count,
            ..
        } => {
            assert_eq!(pipeline.as_raw(), 11);
            assert_eq!(descriptor_set.as_raw(), 13);
            assert_eq!(&dynamic_offsets[..2], &[64, 128]);
            assert_eq!(*dynamic_offset_count, 2);
            assert_eq!(index_buffer.as_raw(), 15);
            assert_eq!(*index_offset, 512);
            assert_eq!(*index_type, vk::IndexType::UINT16);
            assert_eq!(*index_count, 36);
            assert_eq!(*instance_count, 2);
        }
        other => panic!("expected draw_indexed, got {:?}", other),
    }
}

#[test]
fn test_draw_rejects_too_many_dynamic_offsets() {
    let mut recorder = StepRecorder::new();
    recorder.begin_render_pass(
        RenderTarget::Backbuffer,
        LoadAction::Keep,
        LoadAction::Keep,
        0,
        0.0,
        0,
    );

    assert!(matches!(
        recorder.draw(
            vk::Pipeline::from_raw(1),
            vk::PipelineLayout::from_raw(2),
            vk::DescriptorSet::from_raw(3),
            &[0, 1, 2, 3],
            vk::Buffer::from_raw(4),
            0,
            3,
        ),
        Err(Error::InvalidResource(_))
    ));
    assert_eq!(render_step(&recorder, 0).num_draws, 0);
}
