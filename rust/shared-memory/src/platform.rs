//! Platform-specific helpers for the host context

use memory_portal_core::MemoryError;
use nix::sys::mman::{msync, MsFlags};
use std::ptr::NonNull;

/// Platform capabilities
pub struct PlatformCapabilities {
    /// Maximum region size accepted by the host context
    pub max_region_size: u64,
    /// Default page size
    pub page_size: usize,
}

impl PlatformCapabilities {
    /// Get platform capabilities
    pub fn get() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as usize } else { 4096 };

        Self {
            max_region_size: 1024 * 1024 * 1024, // 1GB default
            page_size,
        }
    }
}

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Generate a unique shared memory object name
    pub fn generate_region_name(prefix: &str) -> String {
        let unique = uuid::Uuid::new_v4().simple().to_string();

        cfg_if::cfg_if! {
            if #[cfg(target_vendor = "apple")] {
                // PSHMNAMLEN is 31 on Darwin
                format!("/{}_{}", prefix, &unique[..16])
                    .chars()
                    .take(31)
                    .collect()
            } else {
                format!("/{}_{}_{}", prefix, Self::get_process_id(), unique)
            }
        }
    }
}

/// Memory barrier utilities for cross-process synchronization
pub struct MemoryBarriers;

impl MemoryBarriers {
    /// Acquire barrier
    pub fn acquire_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
    }

    /// Release barrier
    pub fn release_barrier() {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }
}

/// `msync` a byte range of a mapping, widened to page boundaries
pub(crate) fn sync_range(base: NonNull<u8>, offset: u64, len: u64, flags: MsFlags) -> Result<(), MemoryError> {
    if len == 0 {
        return Ok(());
    }

    let page_size = PlatformCapabilities::get().page_size as u64;
    let start = offset - offset % page_size;
    let end = offset + len;

    unsafe {
        msync(
            base.as_ptr().add(start as usize) as *mut std::ffi::c_void,
            (end - start) as usize,
            flags,
        )
    }
    .map_err(|e| MemoryError::MapFailed(format!("msync failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_capabilities() {
        let capabilities = PlatformCapabilities::get();
        assert!(capabilities.page_size > 0);
        assert!(capabilities.page_size.is_power_of_two());
        assert!(capabilities.max_region_size > 0);
    }

    #[test]
    fn test_region_names_are_unique() {
        let a = PlatformUtils::generate_region_name("portal");
        let b = PlatformUtils::generate_region_name("portal");

        assert!(a.starts_with("/portal_"));
        assert_ne!(a, b);
        assert!(!a[1..].contains('/'));
    }
}
