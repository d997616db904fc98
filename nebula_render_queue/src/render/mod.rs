/// Render module - deferred step recording, pass caching, and frame execution

// Module declarations
pub mod step;
pub mod framebuffer;
pub mod recorder;
pub mod pass_cache;
pub mod frame_pool;
pub mod layout_tracker;
pub mod executor;
pub mod handoff;
pub mod manager;

// Re-export the step model and framebuffer types
pub use step::*;
pub use framebuffer::*;

// Re-export from the scheduling modules
pub use recorder::*;
pub use pass_cache::*;
pub use frame_pool::*;
pub use layout_tracker::*;
pub use executor::*;
pub use handoff::*;
pub use manager::*;
