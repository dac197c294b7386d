//! Host graphics context backed by POSIX shared memory
//!
//! Every allocation is an anonymous shared memory object: it is created
//! under a unique name and unlinked immediately, so the descriptor is the
//! only way to reach it. Exporting duplicates that descriptor and importing
//! maps the received one, which gives two memory objects aliasing the same
//! physical pages, exactly like a driver-backed external memory import.

use crate::platform::{sync_range, MemoryBarriers, PlatformCapabilities, PlatformUtils};
use memory_portal_core::{GraphicsContext, MemoryError, MemoryPropertyFlags, MemoryRequirements, MemoryType};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, MsFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use std::cell::Cell;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Memory object of the host context
#[derive(Debug)]
pub struct HostMemory {
    fd: OwnedFd,
    size: u64,
    memory_type: MemoryType,
    mapping: Cell<Option<NonNull<u8>>>,
}

// Safety: the mapping pointer is only dereferenced through the core's
// single view per allocation
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn is_coherent(&self) -> bool {
        self.memory_type.property_flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    fn mapped_ptr(&self) -> Result<NonNull<u8>, MemoryError> {
        self.mapping
            .get()
            .ok_or_else(|| MemoryError::MapFailed("memory is not mapped".to_string()))
    }

    fn release_mapping(&self) {
        if let Some(ptr) = self.mapping.take() {
            if let Err(e) = unsafe { munmap(ptr.as_ptr() as *mut std::ffi::c_void, self.size as usize) } {
                warn!("munmap failed: {}", e);
            }
        }
    }
}

/// Host context configuration
#[derive(Debug, Clone)]
pub struct HostContextConfig {
    /// Memory types advertised to the core
    pub memory_types: Vec<MemoryType>,
    /// Flush/invalidate granularity
    pub non_coherent_atom_size: u64,
    /// Prefix of the shared memory object names
    pub name_prefix: String,
}

impl Default for HostContextConfig {
    fn default() -> Self {
        Self {
            memory_types: vec![
                MemoryType { index: 0, property_flags: MemoryPropertyFlags::DEVICE_LOCAL },
                MemoryType {
                    index: 1,
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                },
                MemoryType {
                    index: 2,
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                },
                MemoryType {
                    index: 3,
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                },
            ],
            non_coherent_atom_size: 64,
            name_prefix: "memory_portal".to_string(),
        }
    }
}

/// Shared-memory implementation of [`GraphicsContext`]
#[derive(Debug)]
pub struct HostContext {
    config: HostContextConfig,
    max_region_size: u64,
    allocations: AtomicU64,
    imports: AtomicU64,
}

impl HostContext {
    /// Create a context with the default memory types
    pub fn new() -> Self {
        Self::with_config(HostContextConfig::default())
    }

    /// Create a context with explicit configuration
    pub fn with_config(config: HostContextConfig) -> Self {
        Self {
            config,
            max_region_size: PlatformCapabilities::get().max_region_size,
            allocations: AtomicU64::new(0),
            imports: AtomicU64::new(0),
        }
    }

    /// Number of allocations made by this context
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of imports made by this context
    pub fn import_count(&self) -> u64 {
        self.imports.load(Ordering::Relaxed)
    }

    fn memory_type(&self, index: u32) -> Option<MemoryType> {
        self.config.memory_types.iter().copied().find(|t| t.index == index)
    }

    fn all_type_bits(&self) -> u32 {
        self.config
            .memory_types
            .iter()
            .filter(|t| t.index < 32)
            .fold(0, |bits, t| bits | (1 << t.index))
    }

    fn create_object(&self, size: u64) -> Result<OwnedFd, MemoryError> {
        let name = PlatformUtils::generate_region_name(&self.config.name_prefix);

        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| MemoryError::AllocationFailed(format!("shm_open failed: {}", e)))?;

        // Nothing but the descriptor names the object from here on
        if let Err(e) = shm_unlink(name.as_str()) {
            warn!("shm_unlink {} failed: {}", name, e);
        }

        nix::unistd::ftruncate(&fd, size as i64)
            .map_err(|e| MemoryError::AllocationFailed(format!("ftruncate failed: {}", e)))?;

        Ok(fd)
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsContext for HostContext {
    type Memory = HostMemory;

    fn memory_types(&self) -> Vec<MemoryType> {
        self.config.memory_types.clone()
    }

    fn memory_requirements(&self, size: u64, _external: bool) -> Result<MemoryRequirements, MemoryError> {
        if size == 0 || size > self.max_region_size {
            return Err(MemoryError::AllocationFailed(format!(
                "invalid region size {}, must be between 1 and {}",
                size, self.max_region_size
            )));
        }

        Ok(MemoryRequirements {
            size,
            alignment: PlatformCapabilities::get().page_size as u64,
            memory_type_bits: self.all_type_bits(),
        })
    }

    fn non_coherent_atom_size(&self) -> u64 {
        self.config.non_coherent_atom_size
    }

    fn allocate(&self, size: u64, memory_type_index: u32, exportable: bool) -> Result<HostMemory, MemoryError> {
        let memory_type = self.memory_type(memory_type_index).ok_or_else(|| {
            MemoryError::AllocationFailed(format!("unknown memory type {}", memory_type_index))
        })?;

        let fd = self.create_object(size)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Created {} byte shared memory object (fd {}, exportable: {})",
            size,
            fd.as_raw_fd(),
            exportable
        );

        Ok(HostMemory {
            fd,
            size,
            memory_type,
            mapping: Cell::new(None),
        })
    }

    fn export(&self, memory: &HostMemory) -> Result<OwnedFd, MemoryError> {
        memory
            .fd
            .try_clone()
            .map_err(|e| MemoryError::ExportFailed(format!("dup failed: {}", e)))
    }

    fn import(&self, fd: OwnedFd, size: u64, memory_type_index: u32) -> Result<HostMemory, MemoryError> {
        // On every error path below `fd` is dropped, which closes it
        let memory_type = self.memory_type(memory_type_index).ok_or_else(|| {
            MemoryError::ImportFailed(format!("unknown memory type {}", memory_type_index))
        })?;

        let stat = fstat(fd.as_raw_fd()).map_err(|e| MemoryError::ImportFailed(format!("fstat failed: {}", e)))?;
        let object_size = stat.st_size as u64;
        if object_size < size {
            return Err(MemoryError::ImportFailed(format!(
                "descriptor names {} bytes, import requested {}",
                object_size, size
            )));
        }

        self.imports.fetch_add(1, Ordering::Relaxed);
        debug!("Imported shared memory object (fd {}, {} bytes)", fd.as_raw_fd(), size);

        Ok(HostMemory {
            fd,
            size,
            memory_type,
            mapping: Cell::new(None),
        })
    }

    fn map(&self, memory: &HostMemory, size: u64) -> Result<NonNull<u8>, MemoryError> {
        if memory.mapping.get().is_some() {
            return Err(MemoryError::MapFailed("memory is already mapped".to_string()));
        }
        let length = NonZeroUsize::new(size.min(memory.size) as usize)
            .ok_or_else(|| MemoryError::MapFailed("cannot map zero bytes".to_string()))?;

        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                Some(&memory.fd),
                0,
            )
        }
        .map_err(|e| MemoryError::MapFailed(format!("mmap failed: {}", e)))?;

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| MemoryError::MapFailed("mmap returned null".to_string()))?;
        memory.mapping.set(Some(ptr));
        Ok(ptr)
    }

    fn unmap(&self, memory: &HostMemory) {
        memory.release_mapping();
    }

    fn flush(&self, memory: &HostMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        MemoryBarriers::release_barrier();
        if !memory.is_coherent() {
            sync_range(memory.mapped_ptr()?, offset, size, MsFlags::MS_SYNC)?;
        }
        Ok(())
    }

    fn invalidate(&self, memory: &HostMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        if !memory.is_coherent() {
            sync_range(memory.mapped_ptr()?, offset, size, MsFlags::MS_INVALIDATE)?;
        }
        MemoryBarriers::acquire_barrier();
        Ok(())
    }

    fn free(&self, memory: HostMemory) {
        memory.release_mapping();
        debug!("Closing shared memory object (fd {})", memory.fd.as_raw_fd());
    }
}
