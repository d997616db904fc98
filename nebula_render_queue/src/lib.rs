/*!
# Nebula Render Queue

Deferred command recording and execution scheduler between an
immediate-style rendering API and the explicit Vulkan queue model.

During a frame the recording thread describes work through the
`RenderQueue` facade: render passes, draws, clears, inter-framebuffer
transfers. Nothing reaches the driver at that point; the queue records
typed steps, merges compatible passes, and folds early clears into pass
load actions. On flush the finished step log is handed to a render thread
(or replayed inline) that turns it into command buffers, image barriers,
and one queue submission per frame, running one frame behind the recorder.

## Architecture

- **RenderQueue**: recording facade and frame lifecycle
- **StepRecorder**: typed step log with pass merging and clear folding
- **RenderPassCache**: render passes keyed by load-action pair
- **FrameSlotPool**: rotating command buffers and fences (CPU/GPU pacing)
- **FrameExecutor**: step replay, layout tracking, submit and present
- **GraphicsDevice / PresentSurface**: the backend trait boundary

Backend implementations provide the device traits;
`nebula_render_queue_vulkan` is the ash-based one.
*/

// Internal modules
mod error;
pub mod device;
pub mod log;
pub mod render;

// Main nebula namespace module
pub mod nebula {
    // Error types
    pub use crate::error::{Error, Result};

    // Queue facade
    pub use crate::render::manager::{QueueConfig, RenderQueue};

    // Logging sub-module (types and logger control, NOT the macros; the
    // nebula_* macros live at the crate root via #[macro_export])
    pub mod log {
        pub use crate::log::{
            reset_logger, set_logger, DefaultLogger, LogEntry, LogSeverity, Logger,
        };
    }

    // Device boundary sub-module
    pub mod device {
        pub use crate::device::*;
    }

    // Render sub-module with the step model and scheduling types
    pub mod render {
        pub use crate::render::*;
    }
}
