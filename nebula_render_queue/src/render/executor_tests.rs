/// Unit tests for the frame executor, driven through the mock device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use super::*;
use crate::device::{MockDevice, MockSurface};
use crate::render::framebuffer::Framebuffer;

struct Harness {
    device: Arc<MockDevice>,
    executor: FrameExecutor,
    pool: Arc<FrameSlotPool>,
    fail_acquire: Arc<AtomicBool>,
    fail_present: Arc<AtomicBool>,
    semaphores: Vec<(vk::Semaphore, vk::Semaphore)>,
    backbuffer_framebuffers: Vec<vk::Framebuffer>,
    backbuffer_pass: u64,
}

fn harness() -> Harness {
    let device = Arc::new(MockDevice::new());
    let surface = MockSurface::new(&device, 320, 240);
    let fail_acquire = Arc::clone(&surface.fail_acquire);
    let fail_present = Arc::clone(&surface.fail_present);
    let semaphores = (0..3).map(|i| surface.image_semaphores(i)).collect();
    let backbuffer_framebuffers = (0..3)
        .map(|i| surface.backbuffer(i).unwrap().framebuffer)
        .collect();

    let pool = Arc::new(
        FrameSlotPool::new(
            Arc::clone(&device) as Arc<dyn GraphicsDevice>,
            2,
            1_000_000_000,
        )
        .unwrap(),
    );
    let executor = FrameExecutor::new(
        Arc::clone(&device) as Arc<dyn GraphicsDevice>,
        Box::new(surface),
        Arc::clone(&pool),
    )
    .unwrap();

    let backbuffer_pass = device
        .ops()
        .iter()
        .find(|op| op.contains("backbuffer=true"))
        .and_then(|op| op.rsplit("-> ").next())
        .and_then(|raw| raw.parse::<u64>().ok())
        .expect("backbuffer pass creation op");
    device.clear_ops();

    Harness {
        device,
        executor,
        pool,
        fail_acquire,
        fail_present,
        semaphores,
        backbuffer_framebuffers,
        backbuffer_pass,
    }
}

fn run(h: &mut Harness, frame_index: u64, steps: Vec<Step>) -> crate::error::Result<()> {
    h.pool.begin_frame(frame_index)?;
    h.executor.run_frame(frame_index, steps)
}

fn render_step(target: RenderTarget, color: LoadAction, depth: LoadAction) -> RenderStep {
    RenderStep {
        target,
        color_action: color,
        depth_action: depth,
        clear_color: 0,
        clear_depth: 1.0,
        clear_stencil: 0,
        num_draws: 0,
        final_color_layout: vk::ImageLayout::UNDEFINED,
        commands: Vec::new(),
    }
}

fn offscreen(fb: &Arc<Framebuffer>) -> RenderTarget {
    RenderTarget::Offscreen(Arc::clone(fb))
}

fn position(ops: &[String], needle: &str) -> usize {
    ops.iter()
        .position(|op| op.contains(needle))
        .unwrap_or_else(|| panic!("no op containing '{}' in {:#?}", needle, ops))
}

fn count(ops: &[String], needle: &str) -> usize {
    ops.iter().filter(|op| op.contains(needle)).count()
}

#[test]
fn test_empty_step_log_still_submits_and_presents() {
    let mut h = harness();
    run(&mut h, 0, Vec::new()).unwrap();

    let ops = h.device.ops();
    assert_eq!(count(&ops, "begin_render_pass("), 0);
    // Only the presentation layout round trip.
    assert_eq!(count(&ops, "pipeline_barrier("), 2);
    assert!(position(&ops, "acquire_image(") < position(&ops, "submit("));
    assert!(position(&ops, "submit(") < position(&ops, "present("));
}

#[test]
fn test_consecutive_steps_on_one_target_share_a_pass() {
    let mut h = harness();
    let fb = h.device.make_framebuffer(64, 64);
    let first = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    let mut second = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Keep);
    second.clear_color = 0xFF00FF00;
    run(&mut h, 0, vec![Step::Render(first), Step::Render(second)]).unwrap();

    let ops = h.device.ops();
    assert_eq!(count(&ops, "begin_render_pass("), 1);
    assert_eq!(count(&ops, "end_render_pass("), 1);
    // The second step's load actions degrade to an in-pass clear.
    assert_eq!(count(&ops, "clear_attachments("), 1);
    let clear = &ops[position(&ops, "clear_attachments(")];
    assert!(clear.contains("aspects=COLOR"), "{}", clear);
    assert!(clear.contains("color=[0.0, 1.0, 0.0, 1.0]"), "{}", clear);
}

#[test]
fn test_same_target_clear_of_both_actions_covers_all_aspects() {
    let mut h = harness();
    let fb = h.device.make_framebuffer(64, 64);
    let first = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    let second = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    run(&mut h, 0, vec![Step::Render(first), Step::Render(second)]).unwrap();

    let ops = h.device.ops();
    let clear = &ops[position(&ops, "clear_attachments(")];
    assert!(clear.contains("COLOR | DEPTH | STENCIL"), "{}", clear);
}

#[test]
fn test_copy_closes_the_open_pass() {
    let mut h = harness();
    let src = h.device.make_framebuffer(64, 64);
    let dst = h.device.make_framebuffer(64, 64);
    let step = render_step(offscreen(&src), LoadAction::Clear, LoadAction::Clear);
    let copy = CopyStep {
        src: Arc::clone(&src),
        dst: Arc::clone(&dst),
        src_rect: src.rect(),
        dst_pos: vk::Offset2D { x: 0, y: 0 },
        aspects: vk::ImageAspectFlags::COLOR,
    };
    run(&mut h, 0, vec![Step::Render(step), Step::Copy(copy)]).unwrap();

    let ops = h.device.ops();
    assert!(position(&ops, "end_render_pass(") < position(&ops, "copy_image("));
    assert_eq!(count(&ops, "begin_render_pass("), 1);
}

#[test]
fn test_transfer_barriers_batch_into_one_command() {
    let mut h = harness();
    let src = h.device.make_framebuffer(64, 64);
    let dst = h.device.make_framebuffer(64, 64);
    let step = render_step(offscreen(&src), LoadAction::Clear, LoadAction::Clear);
    let copy = CopyStep {
        src: Arc::clone(&src),
        dst: Arc::clone(&dst),
        src_rect: src.rect(),
        dst_pos: vk::Offset2D { x: 0, y: 0 },
        aspects: vk::ImageAspectFlags::COLOR,
    };
    run(&mut h, 0, vec![Step::Render(step), Step::Copy(copy)]).unwrap();

    let ops = h.device.ops();
    let barrier = ops
        .iter()
        .find(|op| op.contains("TRANSFER_SRC_OPTIMAL"))
        .expect("transfer barrier");
    assert!(
        barrier.contains(&format!(
            "image={}, COLOR_ATTACHMENT_OPTIMAL -> TRANSFER_SRC_OPTIMAL",
            src.color.image.as_raw()
        )),
        "{}",
        barrier
    );
    assert!(
        barrier.contains(&format!(
            "image={}, UNDEFINED -> TRANSFER_DST_OPTIMAL",
            dst.color.image.as_raw()
        )),
        "{}",
        barrier
    );
}

#[test]
fn test_copy_with_both_aspect_groups_issues_two_copies() {
    let mut h = harness();
    let src = h.device.make_framebuffer(64, 64);
    let dst = h.device.make_framebuffer(64, 64);
    let copy = CopyStep {
        src: Arc::clone(&src),
        dst: Arc::clone(&dst),
        src_rect: src.rect(),
        dst_pos: vk::Offset2D { x: 0, y: 0 },
        aspects: vk::ImageAspectFlags::COLOR
            | vk::ImageAspectFlags::DEPTH
            | vk::ImageAspectFlags::STENCIL,
    };
    run(&mut h, 0, vec![Step::Copy(copy)]).unwrap();

    let ops = h.device.ops();
    let copies: Vec<&String> = ops.iter().filter(|op| op.contains("copy_image(")).collect();
    assert_eq!(copies.len(), 2);
    assert!(copies[0].contains(&format!("src={}", src.color.image.as_raw())));
    assert!(copies[0].contains("aspects=COLOR"), "{}", copies[0]);
    assert!(copies[1].contains(&format!("src={}", src.depth.image.as_raw())));
    assert!(copies[1].contains("DEPTH | STENCIL"), "{}", copies[1]);
}

#[test]
fn test_blit_depth_group_forces_nearest_filtering() {
    let mut h = harness();
    let src = h.device.make_framebuffer(64, 64);
    let dst = h.device.make_framebuffer(128, 128);
    let blit = BlitStep {
        src: Arc::clone(&src),
        dst: Arc::clone(&dst),
        src_rect: src.rect(),
        dst_rect: dst.rect(),
        aspects: vk::ImageAspectFlags::COLOR
            | vk::ImageAspectFlags::DEPTH
            | vk::ImageAspectFlags::STENCIL,
        filter: vk::Filter::LINEAR,
    };
    run(&mut h, 0, vec![Step::Blit(blit)]).unwrap();

    let ops = h.device.ops();
    let blits: Vec<&String> = ops.iter().filter(|op| op.contains("blit_image(")).collect();
    assert_eq!(blits.len(), 2);
    assert!(blits[0].contains("filter=LINEAR"), "{}", blits[0]);
    assert!(blits[1].contains("filter=NEAREST"), "{}", blits[1]);
}

#[test]
fn test_pass_close_applies_marked_final_layout() {
    let mut h = harness();
    let fb = h.device.make_framebuffer(64, 64);
    let mut scene = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    scene.final_color_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    let present = render_step(RenderTarget::Backbuffer, LoadAction::Clear, LoadAction::Clear);
    run(&mut h, 0, vec![Step::Render(scene), Step::Render(present)]).unwrap();

    let ops = h.device.ops();
    let transition = position(
        &ops,
        &format!(
            "image={}, COLOR_ATTACHMENT_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL",
            fb.color.image.as_raw()
        ),
    );
    let begins: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.contains("begin_render_pass("))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(begins.len(), 2);
    let first_end = position(&ops, "end_render_pass(");
    assert!(first_end < transition);
    assert!(transition < begins[1]);
}

#[test]
fn test_backbuffer_step_uses_the_backbuffer_pass() {
    let mut h = harness();
    let step = render_step(RenderTarget::Backbuffer, LoadAction::Clear, LoadAction::Clear);
    run(&mut h, 0, vec![Step::Render(step)]).unwrap();

    let ops = h.device.ops();
    let begin = &ops[position(&ops, "begin_render_pass(")];
    assert!(
        begin.contains(&format!(
            "pass={}, fb={},",
            h.backbuffer_pass,
            h.backbuffer_framebuffers[0].as_raw()
        )),
        "{}",
        begin
    );
}

#[test]
fn test_submit_waits_acquire_and_signals_render_complete() {
    let mut h = harness();
    run(&mut h, 0, Vec::new()).unwrap();

    let (acquire, render_complete) = h.semaphores[0];
    let ops = h.device.ops();
    let submit = &ops[position(&ops, "submit(")];
    assert!(
        submit.contains(&format!("wait_sem={}", acquire.as_raw())),
        "{}",
        submit
    );
    assert!(
        submit.contains(&format!("signal_sem={}", render_complete.as_raw())),
        "{}",
        submit
    );
}

#[test]
fn test_init_commands_precede_main_in_submission() {
    let mut h = harness();
    h.pool.begin_frame(0).unwrap();
    let init = h.pool.init_command_buffer(0).unwrap();
    let main = h.pool.main_command_buffer(0);
    h.executor.run_frame(0, Vec::new()).unwrap();

    let ops = h.device.ops();
    let submit = &ops[position(&ops, "submit(")];
    assert!(
        submit.contains(&format!("cmds=[{}, {}]", init.as_raw(), main.as_raw())),
        "{}",
        submit
    );
}

#[test]
fn test_acquire_failure_paces_the_slot_and_propagates() {
    let mut h = harness();
    h.fail_acquire.store(true, Ordering::SeqCst);
    let err = run(&mut h, 0, Vec::new()).unwrap_err();
    assert!(matches!(err, Error::SurfaceOutOfDate));

    let ops = h.device.ops();
    assert_eq!(count(&ops, "submit("), 1);
    assert_eq!(count(&ops, "present(image="), 0);
    let submit = &ops[position(&ops, "submit(")];
    assert!(submit.contains("wait_sem=none"), "{}", submit);

    // The empty submission signaled the slot fence, so the slot can be
    // reused without tripping the fence timeout.
    run(&mut h, 1, Vec::new()).unwrap();
    run(&mut h, 2, Vec::new()).unwrap();
}

#[test]
fn test_present_failure_propagates_after_submit() {
    let mut h = harness();
    h.fail_present.store(true, Ordering::SeqCst);
    let err = run(&mut h, 0, Vec::new()).unwrap_err();
    assert!(matches!(err, Error::SurfaceOutOfDate));

    let ops = h.device.ops();
    assert_eq!(count(&ops, "submit("), 1);
}

#[test]
fn test_recreate_drains_the_device_first() {
    let mut h = harness();
    h.executor.recreate_surface().unwrap();

    let ops = h.device.ops();
    assert!(position(&ops, "wait_idle()") < position(&ops, "recreate(pass="));
    let recreate = &ops[position(&ops, "recreate(pass=")];
    assert_eq!(recreate, &format!("recreate(pass={})", h.backbuffer_pass));
}

#[test]
fn test_offscreen_pass_prepares_both_attachments_in_one_barrier() {
    let mut h = harness();
    let fb = h.device.make_framebuffer(64, 64);
    let step = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    run(&mut h, 0, vec![Step::Render(step)]).unwrap();

    let ops = h.device.ops();
    let barrier = ops
        .iter()
        .find(|op| op.contains("DEPTH_STENCIL_ATTACHMENT_OPTIMAL"))
        .expect("attachment prep barrier");
    assert!(
        barrier.contains(&format!(
            "image={}, UNDEFINED -> COLOR_ATTACHMENT_OPTIMAL",
            fb.color.image.as_raw()
        )),
        "{}",
        barrier
    );
    assert!(
        barrier.contains(&format!(
            "image={}, UNDEFINED -> DEPTH_STENCIL_ATTACHMENT_OPTIMAL",
            fb.depth.image.as_raw()
        )),
        "{}",
        barrier
    );
    assert!(position(&ops, "DEPTH_STENCIL_ATTACHMENT_OPTIMAL") < position(&ops, "begin_render_pass("));
}

#[test]
fn test_draw_commands_replay_in_recorded_order() {
    let mut h = harness();
    let fb = h.device.make_framebuffer(64, 64);
    let mut step = render_step(offscreen(&fb), LoadAction::Clear, LoadAction::Clear);
    step.num_draws = 1;
    step.commands.push(RenderCommand::SetViewport(vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: 64.0,
        height: 64.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }));
    step.commands.push(RenderCommand::Draw {
        pipeline: vk::Pipeline::from_raw(900),
        pipeline_layout: vk::PipelineLayout::from_raw(901),
        descriptor_set: vk::DescriptorSet::from_raw(902),
        dynamic_offsets: [256, 0, 0],
        dynamic_offset_count: 1,
        vertex_buffer: vk::Buffer::from_raw(903),
        vertex_offset: 0,
        vertex_count: 3,
    });
    run(&mut h, 0, vec![Step::Render(step)]).unwrap();

    let ops = h.device.ops();
    let begin = position(&ops, "begin_render_pass(");
    let viewport = position(&ops, "set_viewport(");
    let pipeline = position(&ops, "bind_pipeline(pipeline=900)");
    let descriptors = position(&ops, "bind_descriptor_set(set=902, dynamic_offsets=[256])");
    let draw = position(&ops, "draw(vertices=3)");
    assert!(begin < viewport);
    assert!(viewport < pipeline);
    assert!(pipeline < descriptors);
    assert!(descriptors < draw);
    assert!(draw < position(&ops, "end_render_pass("));
}
