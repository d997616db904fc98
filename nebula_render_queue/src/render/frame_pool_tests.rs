/// Unit tests for the frame slot pool

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;

use super::*;
use crate::device::MockDevice;

const TIMEOUT_NS: u64 = 1_000_000_000;

fn make_pool(device: &Arc<MockDevice>, inflight_frames: usize) -> FrameSlotPool {
    FrameSlotPool::new(
        Arc::clone(device) as Arc<dyn GraphicsDevice>,
        inflight_frames,
        TIMEOUT_NS,
    )
    .unwrap()
}

fn submit_fence(ops: &[String]) -> vk::Fence {
    let op = ops
        .iter()
        .rev()
        .find(|op| op.contains("submit("))
        .expect("submit op");
    let raw = op
        .rsplit("fence=")
        .next()
        .unwrap()
        .trim_end_matches(')')
        .parse::<u64>()
        .unwrap();
    vk::Fence::from_raw(raw)
}

#[test]
fn test_zero_slots_is_rejected() {
    let device = Arc::new(MockDevice::new());
    let err = FrameSlotPool::new(device as Arc<dyn GraphicsDevice>, 0, TIMEOUT_NS).unwrap_err();
    assert!(matches!(err, Error::InitializationFailed(_)));
}

#[test]
fn test_first_pass_through_every_slot_does_not_block() {
    let device = Arc::new(MockDevice::new());
    // No submissions have happened, so only the initial signaled state
    // lets these pass.
    device.set_auto_signal_fences(false);
    let pool = make_pool(&device, 2);
    pool.begin_frame(0).unwrap();
    pool.begin_frame(1).unwrap();
}

#[test]
fn test_slot_rotation_is_frame_index_mod_slot_count() {
    let device = Arc::new(MockDevice::new());
    let pool = make_pool(&device, 2);
    assert_eq!(pool.slot_count(), 2);
    assert_eq!(pool.main_command_buffer(0), pool.main_command_buffer(2));
    assert_ne!(pool.main_command_buffer(0), pool.main_command_buffer(1));
}

#[test]
fn test_begin_frame_blocks_until_the_fence_signals() {
    let device = Arc::new(MockDevice::new());
    device.set_auto_signal_fences(false);
    let pool = Arc::new(make_pool(&device, 2));

    pool.begin_frame(0).unwrap();
    pool.end_frame(0, None, None).unwrap();
    let fence = submit_fence(&device.ops());

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.begin_frame(2))
    };
    thread::sleep(Duration::from_millis(50));
    device.signal_fence(fence);
    waiter.join().unwrap().unwrap();

    let ops = device.ops();
    let signal = ops
        .iter()
        .position(|op| op.contains("signal_fence("))
        .unwrap();
    let reset = ops
        .iter()
        .rposition(|op| op.contains("reset_fence("))
        .unwrap();
    assert!(signal < reset, "slot recycled before its fence signaled");
}

#[test]
fn test_fence_wait_timeout_is_device_lost() {
    let device = Arc::new(MockDevice::new());
    device.set_auto_signal_fences(false);
    let pool = FrameSlotPool::new(
        Arc::clone(&device) as Arc<dyn GraphicsDevice>,
        2,
        50_000_000, // 50ms
    )
    .unwrap();

    pool.begin_frame(0).unwrap();
    pool.end_frame(0, None, None).unwrap();
    let err = pool.begin_frame(2).unwrap_err();
    assert!(matches!(err, Error::DeviceLost(_)));
}

#[test]
fn test_recycle_without_init_commands_resets_the_whole_pool() {
    let device = Arc::new(MockDevice::new());
    let pool = make_pool(&device, 2);

    pool.begin_frame(0).unwrap();
    pool.end_frame(0, None, None).unwrap();
    device.clear_ops();

    pool.begin_frame(2).unwrap();
    let ops = device.ops();
    assert!(ops.iter().any(|op| op.contains("reset_command_pool(")));
    assert!(!ops.iter().any(|op| op.contains("reset_command_buffer(")));
}

#[test]
fn test_init_carryover_survives_the_slot_recycle() {
    let device = Arc::new(MockDevice::new());
    let pool = make_pool(&device, 2);

    // Startup uploads recorded before the frame loop starts.
    let init = pool.init_command_buffer(0).unwrap();
    let main = pool.main_command_buffer(0);
    device.clear_ops();

    pool.begin_frame(0).unwrap();
    let ops = device.ops();
    let buffer_reset = format!("reset_command_buffer(cmd={})", main.as_raw());
    assert!(
        ops.iter().any(|op| op.contains(&buffer_reset)),
        "only the main buffer should be recycled: {:#?}",
        ops
    );
    assert!(!ops.iter().any(|op| op.contains("reset_command_pool(")));

    pool.end_frame(0, None, None).unwrap();
    let ops = device.ops();
    let submit = ops.iter().rev().find(|op| op.contains("submit(")).unwrap();
    assert!(
        submit.contains(&format!("cmds=[{}, {}]", init.as_raw(), main.as_raw())),
        "{}",
        submit
    );

    // The carryover was consumed, so the next recycle resets the pool.
    device.clear_ops();
    pool.begin_frame(2).unwrap();
    assert!(device
        .ops()
        .iter()
        .any(|op| op.contains("reset_command_pool(")));
}

#[test]
fn test_repeated_init_requests_reuse_one_buffer() {
    let device = Arc::new(MockDevice::new());
    let pool = make_pool(&device, 2);

    let first = pool.init_command_buffer(0).unwrap();
    let second = pool.init_command_buffer(0).unwrap();
    assert_eq!(first, second);

    let begins = device
        .ops()
        .iter()
        .filter(|op| op.contains("begin_command_buffer("))
        .count();
    assert_eq!(begins, 1);
}

#[test]
fn test_end_frame_without_init_submits_main_only() {
    let device = Arc::new(MockDevice::new());
    let pool = make_pool(&device, 2);

    pool.begin_frame(0).unwrap();
    pool.end_frame(0, None, None).unwrap();

    let ops = device.ops();
    let submit = ops.iter().rev().find(|op| op.contains("submit(")).unwrap();
    assert!(
        submit.contains(&format!(
            "cmds=[{}]",
            pool.main_command_buffer(0).as_raw()
        )),
        "{}",
        submit
    );
}

#[test]
fn test_drop_destroys_every_slot() {
    let device = Arc::new(MockDevice::new());
    {
        let _pool = make_pool(&device, 2);
        device.clear_ops();
    }
    let ops = device.ops();
    let fences = ops.iter().filter(|op| op.contains("destroy_fence(")).count();
    let pools = ops
        .iter()
        .filter(|op| op.contains("destroy_command_pool("))
        .count();
    assert_eq!(fences, 2);
    assert_eq!(pools, 2);
}
