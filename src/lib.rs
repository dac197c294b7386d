//! Memory Portal
//!
//! Share one block of GPU memory between two processes. The producer
//! allocates exportable memory and passes its descriptor over a Unix socket;
//! the consumer imports it, and both map the same physical pages. Writes
//! become visible through an explicit flush on one side and invalidate on
//! the other.

pub mod cli;
pub mod config;
pub mod demo;
pub mod logging;
pub mod session;

pub use config::{BackendKind, PortalConfig};
pub use demo::{run_demo, DemoReport};
pub use session::{ConsumerReport, ConsumerSession, ProducerReport, ProducerSession, SessionOptions};

pub use memory_portal_core;
pub use memory_portal_network;
pub use memory_portal_shared_memory;
#[cfg(feature = "vulkan")]
pub use memory_portal_vulkan;

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
