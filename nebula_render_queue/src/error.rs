//! Error types for the Nebula render queue
//!
//! This module defines the error types used throughout the queue:
//! recording preconditions, executor bookkeeping, frame pacing, and
//! backend/device failures.

use std::fmt;

/// Result type for render queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Render queue errors
#[derive(Debug, Clone)]
pub enum Error {
    /// Initialization failed (pass cache, frame pool, swapchain bootstrap)
    InitializationFailed(String),

    /// Backend-specific error (Vulkan call failed)
    BackendError(String),

    /// Out of GPU memory
    OutOfMemory,

    /// Invalid resource (framebuffer dimensions, bad handle, etc.)
    InvalidResource(String),

    /// Usage error: a recording or frame-bracket call arrived in the wrong
    /// state (draw with no open render pass, unmatched begin/end frame,
    /// double flush)
    InvalidPassState(String),

    /// Usage error: a framebuffer was bound as a texture while more than one
    /// pending render step still targets it
    ConflictingFramebufferBinding(String),

    /// Executor bookkeeping disagrees with the recorded state; continuing
    /// would risk GPU-visible corruption
    InternalConsistency(String),

    /// The swapchain no longer matches the surface; retryable after the
    /// owner recreates the surface
    SurfaceOutOfDate,

    /// A bounded wait expired or the device was lost
    DeviceLost(String),
}

impl Error {
    /// True for the retryable surface condition: the caller should recreate
    /// the swapchain surface and retry the frame instead of failing.
    pub fn is_surface_stale(&self) -> bool {
        matches!(self, Error::SurfaceOutOfDate)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InitializationFailed(msg) => write!(f, "Initialization failed: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::OutOfMemory => write!(f, "Out of GPU memory"),
            Error::InvalidResource(msg) => write!(f, "Invalid resource: {}", msg),
            Error::InvalidPassState(msg) => write!(f, "Invalid pass state: {}", msg),
            Error::ConflictingFramebufferBinding(msg) => {
                write!(f, "Conflicting framebuffer binding: {}", msg)
            }
            Error::InternalConsistency(msg) => write!(f, "Internal consistency error: {}", msg),
            Error::SurfaceOutOfDate => write!(f, "Surface out of date (recreate the swapchain)"),
            Error::DeviceLost(msg) => write!(f, "Device lost: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ===== ERROR MACROS =====

/// Log an error and produce it as an `Error::BackendError` value
///
/// Expression-position companion to `nebula_bail!`, for use in
/// `.map_err(...)` chains and explicit `Err(...)` returns.
///
/// # Example
///
/// ```ignore
/// device.wait_idle()
///     .map_err(|e| nebula_err!("nebula::vulkan", "Failed to wait idle: {:?}", e))?;
/// ```
#[macro_export]
macro_rules! nebula_err {
    ($source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log::dispatch_detailed(
            $crate::log::LogSeverity::Error,
            $source,
            message.clone(),
            file!(),
            line!(),
        );
        $crate::nebula::Error::BackendError(message)
    }};
}

/// Log an error and return it from the enclosing function
///
/// # Example
///
/// ```ignore
/// if image_index as usize >= self.image_count() {
///     nebula_bail!("nebula::swapchain", "image_index {} out of range", image_index);
/// }
/// ```
#[macro_export]
macro_rules! nebula_bail {
    ($source:expr, $($arg:tt)*) => {
        return Err($crate::nebula_err!($source, $($arg)*))
    };
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
