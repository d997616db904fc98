//! Unit tests for the driver-free parts of the Vulkan device
//!
//! Error-code mapping and load-op translation are pure functions and run
//! without a GPU; everything touching the driver is covered by the core
//! crate's mock-device tests instead.

use super::*;

// ============================================================================
// ERROR MAPPING TESTS
// ============================================================================

#[test]
fn test_memory_exhaustion_codes_map_to_out_of_memory() {
    assert!(matches!(
        map_vk_result("create image", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
        Error::OutOfMemory
    ));
    assert!(matches!(
        map_vk_result("create image", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
        Error::OutOfMemory
    ));
}

#[test]
fn test_device_lost_keeps_the_context_string() {
    match map_vk_result("submit frame", vk::Result::ERROR_DEVICE_LOST) {
        Error::DeviceLost(context) => assert_eq!(context, "submit frame"),
        other => panic!("expected DeviceLost, got {:?}", other),
    }
}

#[test]
fn test_stale_surface_codes_map_to_surface_out_of_date() {
    assert!(map_vk_result("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR).is_surface_stale());
    assert!(map_vk_result("acquire", vk::Result::ERROR_SURFACE_LOST_KHR).is_surface_stale());
}

#[test]
fn test_unrecognized_codes_become_backend_errors() {
    match map_vk_result("reset fence", vk::Result::ERROR_UNKNOWN) {
        Error::BackendError(message) => {
            assert!(message.contains("reset fence"));
            assert!(message.contains("ERROR_UNKNOWN"));
        }
        other => panic!("expected BackendError, got {:?}", other),
    }
}

// ============================================================================
// LOAD OP TRANSLATION TESTS
// ============================================================================

#[test]
fn test_load_actions_translate_to_vulkan_load_ops() {
    assert_eq!(load_op_to_vk(LoadAction::Clear), vk::AttachmentLoadOp::CLEAR);
    assert_eq!(load_op_to_vk(LoadAction::Keep), vk::AttachmentLoadOp::LOAD);
    assert_eq!(
        load_op_to_vk(LoadAction::DontCare),
        vk::AttachmentLoadOp::DONT_CARE
    );
}
