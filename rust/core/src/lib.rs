//! Memory Portal - Core Module
//!
//! Export/import of device memory through OS handles, host mapping of the
//! shared region, and the flush/invalidate protocol that brackets every
//! cross-process handoff. Graphics backends plug in through
//! [`GraphicsContext`].

pub mod context;
pub mod error;
pub mod handle;
pub mod memory;
pub mod region;
pub mod sync;

#[cfg(test)]
mod mock;

pub use context::*;
pub use error::*;
pub use handle::*;
pub use memory::*;
pub use region::*;
pub use sync::*;

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
