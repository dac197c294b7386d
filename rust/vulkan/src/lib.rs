//! Memory Portal - Vulkan Module
//!
//! Graphics context for real GPUs. Memory is exported and imported as
//! opaque file descriptors through `VK_KHR_external_memory_fd`.

pub mod context;
pub mod debug;
pub mod error;

pub use context::{VulkanConfig, VulkanContext, VulkanMemory};
pub use debug::VALIDATION_LAYER;
pub use error::VulkanError;
