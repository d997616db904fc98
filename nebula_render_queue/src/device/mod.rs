/// Device module - the graphics context boundary consumed by the scheduler

// Module declarations
pub mod graphics_device;
pub mod present_surface;
pub mod mock_device;

// Re-export the trait surface
pub use graphics_device::*;
pub use present_surface::*;
pub use mock_device::*;
