//! Vulkan backend errors

use ash::vk;
use memory_portal_core::MemoryError;
use thiserror::Error;

/// Context creation errors
#[derive(Error, Debug)]
pub enum VulkanError {
    /// The Vulkan loader could not be found
    #[error("Vulkan library not found: {0}")]
    LibraryNotFound(#[from] ash::LoadingError),

    /// Instance version below 1.1
    #[error("Vulkan 1.1+ required, found {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    /// Requested layer not installed
    #[error("Layer {0} not available")]
    MissingLayer(String),

    /// No physical device supports exporting memory as a descriptor
    #[error("No GPU supports VK_KHR_external_memory_fd")]
    NoCompatibleDevice,

    /// Any other failed call
    #[error("{call} failed: {result:?}")]
    Call {
        call: &'static str,
        result: vk::Result,
    },
}

impl VulkanError {
    pub(crate) fn call(call: &'static str) -> impl Fn(vk::Result) -> VulkanError {
        move |result| VulkanError::Call { call, result }
    }
}

/// Describe a failed allocation call
pub(crate) fn allocation_failed(call: &str, result: vk::Result) -> MemoryError {
    MemoryError::AllocationFailed(format!("{} failed: {:?}", call, result))
}

/// Describe a failed import; an invalid handle gets its own reason
pub(crate) fn import_failed(call: &str, result: vk::Result) -> MemoryError {
    match result {
        vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => {
            MemoryError::ImportFailed("driver rejected the external memory handle".to_string())
        }
        _ => MemoryError::ImportFailed(format!("{} failed: {:?}", call, result)),
    }
}
