//! Memory Portal - Shared Memory Module
//!
//! Host graphics context built on anonymous POSIX shared memory objects.
//! It needs no GPU, so the whole export/import/visibility path can run on
//! any Unix machine.

pub mod context;
pub mod platform;

pub use context::*;

/// Re-export platform-specific implementations
pub use platform::{MemoryBarriers, PlatformCapabilities, PlatformUtils};
