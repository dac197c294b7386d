//! Graphics context capability consumed by the core
//!
//! Instance/device bootstrap lives outside the core. A backend only has to
//! expose the raw memory operations below; memory-type selection, size
//! agreement and mapping discipline are handled by [`crate::memory`] and
//! [`crate::region`].

use crate::MemoryError;
use bitflags::bitflags;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

bitflags! {
    /// Memory property flags (bit values match `VkMemoryPropertyFlagBits`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x1;
        const HOST_VISIBLE = 0x2;
        const HOST_COHERENT = 0x4;
        const HOST_CACHED = 0x8;
    }
}

impl MemoryPropertyFlags {
    /// Flags required for a region both processes read and write from the host
    pub fn shareable() -> Self {
        Self::HOST_VISIBLE | Self::HOST_COHERENT
    }
}

/// One memory type advertised by a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Index used when allocating
    pub index: u32,
    /// Properties of this type
    pub property_flags: MemoryPropertyFlags,
}

/// Allocation requirements for a region of a given size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Allocation size the backend will use (at least the requested size)
    pub size: u64,
    /// Required alignment
    pub alignment: u64,
    /// Bit `i` set when memory type `i` may back the region
    pub memory_type_bits: u32,
}

/// Raw device-memory capability of a graphics context.
///
/// Implementations are not required to track mapping state; the core never
/// maps the same memory twice and never unmaps memory it has not mapped.
pub trait GraphicsContext {
    /// Backend memory object
    type Memory;

    /// Memory types of the device, in index order
    fn memory_types(&self) -> Vec<MemoryType>;

    /// Requirements for a region of `size` bytes. `external` selects
    /// requirements for memory that is exported or imported.
    fn memory_requirements(&self, size: u64, external: bool) -> Result<MemoryRequirements, MemoryError>;

    /// Granularity of flush/invalidate ranges on non-coherent memory
    fn non_coherent_atom_size(&self) -> u64 {
        1
    }

    /// Allocate `size` bytes from `memory_type_index`. Export capability must
    /// be declared here; it cannot be added after allocation.
    fn allocate(&self, size: u64, memory_type_index: u32, exportable: bool) -> Result<Self::Memory, MemoryError>;

    /// Produce an OS descriptor naming `memory`
    fn export(&self, memory: &Self::Memory) -> Result<OwnedFd, MemoryError>;

    /// Create a new memory object aliasing the memory named by `fd`.
    ///
    /// The descriptor is consumed whatever the outcome: on success the backend
    /// owns it, on failure the backend must close it before returning.
    fn import(&self, fd: OwnedFd, size: u64, memory_type_index: u32) -> Result<Self::Memory, MemoryError>;

    /// Map `size` bytes of `memory` into the host address space
    fn map(&self, memory: &Self::Memory, size: u64) -> Result<NonNull<u8>, MemoryError>;

    /// Release the host mapping of `memory`
    fn unmap(&self, memory: &Self::Memory);

    /// Make host writes in the range visible to the device and other importers
    fn flush(&self, memory: &Self::Memory, offset: u64, size: u64) -> Result<(), MemoryError>;

    /// Discard stale host cache lines in the range before reading
    fn invalidate(&self, memory: &Self::Memory, offset: u64, size: u64) -> Result<(), MemoryError>;

    /// Free `memory`
    fn free(&self, memory: Self::Memory);
}
