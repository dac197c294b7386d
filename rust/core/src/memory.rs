//! Device memory allocation, export and import

use crate::{
    ExternalMemoryHandle, GraphicsContext, MemoryError, MemoryPropertyFlags, MemoryRequirements, MemoryType,
    ProtocolViolation, Result,
};
use std::cell::Cell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing::{debug, info};

/// How an allocation came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOrigin {
    /// Allocated in this process (producer side)
    Allocated,
    /// Imported from an external handle (consumer side)
    Imported,
}

/// One block of device memory owned by a graphics context.
///
/// Dropping the allocation frees the backend memory. Views returned by
/// [`DeviceMemoryAllocation::map`] borrow the allocation, so it can never be
/// freed while mapped.
pub struct DeviceMemoryAllocation<C: GraphicsContext> {
    context: Arc<C>,
    memory: ManuallyDrop<C::Memory>,
    size: u64,
    requested_size: u64,
    memory_type: MemoryType,
    exportable: bool,
    origin: AllocationOrigin,
    pub(crate) mapped: Cell<bool>,
}

impl<C: GraphicsContext> DeviceMemoryAllocation<C> {
    /// Allocation size in bytes, as reported by the backend
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size the allocation was asked for. This is what travels with an
    /// exported handle and what an importer must agree on.
    pub fn requested_size(&self) -> u64 {
        self.requested_size
    }

    /// Memory type backing the allocation
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Property flags of the backing memory type
    pub fn property_flags(&self) -> MemoryPropertyFlags {
        self.memory_type.property_flags
    }

    /// Whether the allocation was created with export capability
    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn origin(&self) -> AllocationOrigin {
        self.origin
    }

    /// Whether a view is currently alive
    pub fn is_mapped(&self) -> bool {
        self.mapped.get()
    }

    /// Owning context
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    pub(crate) fn raw(&self) -> &C::Memory {
        &self.memory
    }

    /// Free the allocation explicitly
    pub fn free(self) {
        drop(self);
    }
}

impl<C: GraphicsContext> Drop for DeviceMemoryAllocation<C> {
    fn drop(&mut self) {
        debug!("Freeing {} byte allocation ({:?})", self.size, self.origin);
        // Taken exactly once, here
        let memory = unsafe { ManuallyDrop::take(&mut self.memory) };
        self.context.free(memory);
    }
}

impl<C: GraphicsContext> fmt::Debug for DeviceMemoryAllocation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemoryAllocation")
            .field("size", &self.size)
            .field("requested_size", &self.requested_size)
            .field("memory_type", &self.memory_type)
            .field("exportable", &self.exportable)
            .field("origin", &self.origin)
            .field("mapped", &self.mapped.get())
            .finish()
    }
}

/// Pick the first memory type allowed by `type_bits` whose flags contain `required`
pub fn select_memory_type(
    memory_types: &[MemoryType],
    type_bits: u32,
    required: MemoryPropertyFlags,
) -> Option<MemoryType> {
    memory_types
        .iter()
        .copied()
        .filter(|memory_type| memory_type.index < 32)
        .find(|memory_type| {
            type_bits & (1 << memory_type.index) != 0 && memory_type.property_flags.contains(required)
        })
}

fn find_memory_type<C: GraphicsContext>(
    context: &C,
    type_bits: u32,
    required: MemoryPropertyFlags,
) -> std::result::Result<MemoryType, MemoryError> {
    let memory_type = select_memory_type(&context.memory_types(), type_bits, required).ok_or_else(|| {
        MemoryError::NoSuitableMemoryType {
            type_bits,
            required: format!("{:?}", required),
        }
    })?;

    debug!(
        "Found suitable memory type {} with properties {:?}",
        memory_type.index, memory_type.property_flags
    );
    Ok(memory_type)
}

/// Backend requirements for `size` bytes, checked for usability
fn requirements_for<C: GraphicsContext>(
    context: &C,
    size: u64,
    external: bool,
) -> std::result::Result<MemoryRequirements, MemoryError> {
    let requirements = context.memory_requirements(size, external)?;
    debug!(
        "Memory requirements size: {}, alignment: {}, type bits: {:#b}",
        requirements.size, requirements.alignment, requirements.memory_type_bits
    );

    if requirements.size < size {
        return Err(MemoryError::AllocationFailed(format!(
            "backend reported {} bytes for a {} byte region",
            requirements.size, size
        )));
    }
    if !requirements.alignment.is_power_of_two() {
        return Err(MemoryError::AllocationFailed(format!(
            "backend reported invalid alignment {}",
            requirements.alignment
        )));
    }
    Ok(requirements)
}

/// Allocate `size` bytes with `required` properties.
///
/// `exportable` declares export capability; it must be decided here because
/// it cannot be added to an existing allocation.
pub fn allocate<C: GraphicsContext>(
    context: &Arc<C>,
    size: u64,
    required: MemoryPropertyFlags,
    exportable: bool,
) -> Result<DeviceMemoryAllocation<C>> {
    if size == 0 {
        return Err(MemoryError::AllocationFailed("zero-sized allocation".to_string()).into());
    }

    let requirements = requirements_for(context.as_ref(), size, exportable)?;

    let memory_type = find_memory_type(context.as_ref(), requirements.memory_type_bits, required)?;
    let memory = context.allocate(requirements.size, memory_type.index, exportable)?;

    info!(
        "Allocated {} bytes from memory type {} (exportable: {})",
        requirements.size, memory_type.index, exportable
    );

    Ok(DeviceMemoryAllocation {
        context: Arc::clone(context),
        memory: ManuallyDrop::new(memory),
        size: requirements.size,
        requested_size: size,
        memory_type,
        exportable,
        origin: AllocationOrigin::Allocated,
        mapped: Cell::new(false),
    })
}

/// Export a handle naming `allocation`.
///
/// The handle stays valid until it is imported or the allocation is freed.
pub fn export_handle<C: GraphicsContext>(allocation: &DeviceMemoryAllocation<C>) -> Result<ExternalMemoryHandle> {
    if !allocation.exportable {
        return Err(MemoryError::NotExportable.into());
    }

    let fd = allocation.context.export(allocation.raw())?;
    debug!(
        "Exported {} byte allocation ({} bytes requested)",
        allocation.size, allocation.requested_size
    );

    Ok(ExternalMemoryHandle::new(fd, allocation.requested_size))
}

/// Import `handle` into `context` as a new allocation aliasing the exporter's memory.
///
/// The handle is consumed on every path. `size` must equal the size the
/// exporter asked for, byte for byte; a disagreement is a caller-contract
/// violation and is rejected before the backend sees the descriptor.
pub fn import_handle<C: GraphicsContext>(
    context: &Arc<C>,
    handle: ExternalMemoryHandle,
    size: u64,
    required: MemoryPropertyFlags,
) -> Result<DeviceMemoryAllocation<C>> {
    if size != handle.allocation_size() {
        return Err(ProtocolViolation::SizeMismatch {
            declared: handle.allocation_size(),
            requested: size,
        }
        .into());
    }

    let requirements = requirements_for(context.as_ref(), size, true)?;
    let memory_type = find_memory_type(context.as_ref(), requirements.memory_type_bits, required)?;
    let memory = context.import(handle.into_fd(), requirements.size, memory_type.index)?;

    info!(
        "Imported {} bytes into memory type {}",
        requirements.size, memory_type.index
    );

    Ok(DeviceMemoryAllocation {
        context: Arc::clone(context),
        memory: ManuallyDrop::new(memory),
        size: requirements.size,
        requested_size: size,
        memory_type,
        exportable: false,
        origin: AllocationOrigin::Imported,
        mapped: Cell::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContext;
    use crate::PortalError;

    fn types() -> Vec<MemoryType> {
        vec![
            MemoryType { index: 0, property_flags: MemoryPropertyFlags::DEVICE_LOCAL },
            MemoryType { index: 1, property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT },
            MemoryType { index: 2, property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED },
        ]
    }

    #[test]
    fn test_select_memory_type() {
        let types = types();

        let found = select_memory_type(&types, 0b111, MemoryPropertyFlags::shareable()).unwrap();
        assert_eq!(found.index, 1);

        let found = select_memory_type(&types, 0b111, MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(found.index, 1);

        // Bitmask excludes the coherent type
        let found = select_memory_type(&types, 0b101, MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(found.index, 2);

        assert!(select_memory_type(&types, 0b101, MemoryPropertyFlags::shareable()).is_none());
        assert!(select_memory_type(&types, 0, MemoryPropertyFlags::empty()).is_none());
    }

    #[test]
    fn test_allocate_and_export() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1000, MemoryPropertyFlags::shareable(), true).unwrap();

        assert_eq!(allocation.size(), 1024);
        assert_eq!(allocation.requested_size(), 1000);
        assert_eq!(allocation.origin(), AllocationOrigin::Allocated);
        assert_eq!(allocation.memory_type().index, 1);

        let handle = export_handle(&allocation).unwrap();
        assert_eq!(handle.allocation_size(), 1000);

        allocation.free();
        assert_eq!(context.live_allocations(), 0);
    }

    #[test]
    fn test_export_requires_capability() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), false).unwrap();

        let err = export_handle(&allocation).unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::NotExportable)));
    }

    #[test]
    fn test_no_suitable_memory_type() {
        let context = Arc::new(MockContext::new());
        let err = allocate(&context, 1024, MemoryPropertyFlags::all(), true).unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::NoSuitableMemoryType { .. })));
        assert_eq!(context.live_allocations(), 0);
    }

    #[test]
    fn test_import_rejects_size_mismatch() {
        let context = Arc::new(MockContext::new());
        let exporter = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let handle = export_handle(&exporter).unwrap();

        let err = import_handle(&context, handle, 4096, MemoryPropertyFlags::shareable()).unwrap_err();
        assert!(matches!(
            err,
            PortalError::Protocol(ProtocolViolation::SizeMismatch { declared: 1024, requested: 4096 })
        ));
        assert_eq!(context.imports(), 0);
    }

    #[test]
    fn test_import_rejects_mismatch_within_rounding() {
        // 1000 and 1020 both round up to 1024 in the backend
        let context = Arc::new(MockContext::new());
        let exporter = allocate(&context, 1000, MemoryPropertyFlags::shareable(), true).unwrap();
        let handle = export_handle(&exporter).unwrap();

        let err = import_handle(&context, handle, 1020, MemoryPropertyFlags::shareable()).unwrap_err();
        assert!(matches!(
            err,
            PortalError::Protocol(ProtocolViolation::SizeMismatch { declared: 1000, requested: 1020 })
        ));
        assert_eq!(context.imports(), 0);

        let handle = export_handle(&exporter).unwrap();
        let imported = import_handle(&context, handle, 1000, MemoryPropertyFlags::shareable()).unwrap();
        assert_eq!(imported.size(), 1024);
        assert_eq!(imported.requested_size(), 1000);
    }

    #[test]
    fn test_import_creates_new_allocation() {
        let context = Arc::new(MockContext::new());
        let exporter = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let handle = export_handle(&exporter).unwrap();

        let imported = import_handle(&context, handle, 1024, MemoryPropertyFlags::shareable()).unwrap();
        assert_eq!(imported.origin(), AllocationOrigin::Imported);
        assert!(!imported.is_exportable());
        assert_eq!(context.imports(), 1);
        assert_eq!(context.live_allocations(), 2);

        drop(imported);
        drop(exporter);
        assert_eq!(context.live_allocations(), 0);
    }

    #[test]
    fn test_unusable_requirements_rejected() {
        let context = Arc::new(MockContext::new());
        context.alignment.set(48);

        let err = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::AllocationFailed(_))));
        assert_eq!(context.live_allocations(), 0);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let context = Arc::new(MockContext::new());
        assert!(allocate(&context, 0, MemoryPropertyFlags::shareable(), true).is_err());
    }
}
