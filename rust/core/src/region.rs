//! Host mapping of a device memory allocation

use crate::{DeviceMemoryAllocation, GraphicsContext, MemoryError, MemoryPropertyFlags, Result};
use std::fmt;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Host-addressable view of an allocation's bytes.
///
/// At most one view exists per allocation. The view borrows the allocation,
/// so the memory outlives every pointer handed out here. Writes are tracked
/// so [`SharedRegionView::flush`] can publish exactly what changed.
pub struct SharedRegionView<'a, C: GraphicsContext> {
    allocation: &'a DeviceMemoryAllocation<C>,
    ptr: NonNull<u8>,
    len: u64,
    /// Written but not yet flushed, as `[start, end)`
    dirty: Option<(u64, u64)>,
}

impl<C: GraphicsContext> DeviceMemoryAllocation<C> {
    /// Map the whole allocation into the host address space.
    ///
    /// Fails with `MapFailed` if the memory type is not host-visible or the
    /// allocation is already mapped.
    pub fn map(&self) -> Result<SharedRegionView<'_, C>> {
        if !self.property_flags().contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(MemoryError::MapFailed(format!(
                "memory type {} is not host visible",
                self.memory_type().index
            ))
            .into());
        }
        if self.mapped.get() {
            return Err(MemoryError::MapFailed("allocation is already mapped".to_string()).into());
        }

        let ptr = self.context().map(self.raw(), self.size())?;
        self.mapped.set(true);
        debug!("Mapped {} bytes at {:p}", self.size(), ptr);

        Ok(SharedRegionView {
            allocation: self,
            ptr,
            len: self.size(),
            dirty: None,
        })
    }
}

impl<'a, C: GraphicsContext> SharedRegionView<'a, C> {
    /// Mapped length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocation this view maps
    pub fn allocation(&self) -> &'a DeviceMemoryAllocation<C> {
        self.allocation
    }

    /// Whether writes are waiting for a flush
    pub fn has_unflushed_writes(&self) -> bool {
        self.dirty.is_some()
    }

    /// Get a slice view of the mapped memory
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize) }
    }

    /// Get a mutable slice view of the mapped memory. The whole region is
    /// considered written.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mark_dirty(0, self.len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len as usize) }
    }

    /// Copy `data` into the region at `offset`
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset as usize), data.len());
        }
        self.mark_dirty(offset, data.len() as u64);
        Ok(())
    }

    /// Copy bytes at `offset` into `out`
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, out.len() as u64)?;
        if out.is_empty() {
            return Ok(());
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    /// Flush everything written since the last flush
    pub fn flush(&mut self) -> Result<()> {
        match self.dirty {
            Some((start, end)) => self.flush_range(start, end - start),
            None => Ok(()),
        }
    }

    /// Flush an explicit byte range. An empty range is a no-op.
    pub fn flush_range(&mut self, offset: u64, len: u64) -> Result<()> {
        self.check_bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (start, size) = self.atom_range(offset, len);
        self.allocation.context().flush(self.allocation.raw(), start, size)?;
        debug!("Flushed {} bytes at offset {}", size, start);

        // Drop the dirty range once it is fully covered
        if let Some((dirty_start, dirty_end)) = self.dirty {
            if start <= dirty_start && dirty_end <= start + size {
                self.dirty = None;
            }
        }
        Ok(())
    }

    /// Invalidate the whole region
    pub fn invalidate(&self) -> Result<()> {
        self.invalidate_range(0, self.len)
    }

    /// Invalidate an explicit byte range before reading it. An empty range
    /// is a no-op.
    pub fn invalidate_range(&self, offset: u64, len: u64) -> Result<()> {
        self.check_bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let (start, size) = self.atom_range(offset, len);
        self.allocation.context().invalidate(self.allocation.raw(), start, size)?;
        debug!("Invalidated {} bytes at offset {}", size, start);
        Ok(())
    }

    /// Release the mapping.
    ///
    /// The view is consumed, so a second unmap of the same view does not
    /// compile:
    ///
    /// ```compile_fail
    /// use memory_portal_core::{DeviceMemoryAllocation, GraphicsContext};
    ///
    /// fn unmap_twice<C: GraphicsContext>(allocation: &DeviceMemoryAllocation<C>) {
    ///     let view = allocation.map().unwrap();
    ///     view.unmap();
    ///     view.unmap();
    /// }
    /// ```
    pub fn unmap(self) {
        drop(self);
    }

    fn check_bounds(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(MemoryError::OutOfBounds { offset, len, size: self.len }.into()),
        }
    }

    fn atom_range(&self, offset: u64, len: u64) -> (u64, u64) {
        aligned_range(offset, len, self.allocation.context().non_coherent_atom_size(), self.len)
    }

    fn mark_dirty(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = offset + len;
        self.dirty = Some(match self.dirty {
            Some((start, old_end)) => (start.min(offset), old_end.max(end)),
            None => (offset, end),
        });
    }
}

impl<C: GraphicsContext> Drop for SharedRegionView<'_, C> {
    fn drop(&mut self) {
        if let Some((start, end)) = self.dirty {
            warn!("Unmapping region with {} unflushed bytes at offset {}", end - start, start);
        }
        self.allocation.context().unmap(self.allocation.raw());
        self.allocation.mapped.set(false);
        debug!("Unmapped {} bytes", self.len);
    }
}

impl<C: GraphicsContext> fmt::Debug for SharedRegionView<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegionView")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Widen `[offset, offset + len)` to `atom` boundaries, clamped to `size`
pub(crate) fn aligned_range(offset: u64, len: u64, atom: u64, size: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = offset - offset % atom;
    let end = ((offset + len + atom - 1) / atom * atom).min(size);
    (start, end.saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocate;
    use crate::mock::MockContext;
    use crate::PortalError;
    use std::sync::Arc;

    #[test]
    fn test_aligned_range() {
        assert_eq!(aligned_range(0, 5, 64, 1024), (0, 64));
        assert_eq!(aligned_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(aligned_range(60, 10, 64, 1024), (0, 128));
        assert_eq!(aligned_range(1000, 24, 64, 1024), (960, 64));
        assert_eq!(aligned_range(1000, 24, 256, 1000 + 24), (768, 256));
        assert_eq!(aligned_range(3, 4, 1, 16), (3, 4));
    }

    #[test]
    fn test_map_twice_fails() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();

        let view = allocation.map().unwrap();
        assert!(allocation.is_mapped());

        let err = allocation.map().unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::MapFailed(_))));

        view.unmap();
        assert!(!allocation.is_mapped());
        assert_eq!(context.unmaps.get(), 1);

        // Remap after unmap is allowed
        let view = allocation.map().unwrap();
        drop(view);
        assert_eq!(context.unmaps.get(), 2);
    }

    #[test]
    fn test_map_device_local_fails() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::DEVICE_LOCAL, false).unwrap();

        let err = allocation.map().unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::MapFailed(_))));
        assert!(!allocation.is_mapped());
    }

    #[test]
    fn test_write_read_and_bounds() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let mut view = allocation.map().unwrap();

        view.write(10, &[7, 8, 9]).unwrap();
        let mut out = [0u8; 3];
        view.read(10, &mut out).unwrap();
        assert_eq!(out, [7, 8, 9]);

        let err = view.write(1022, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, PortalError::Memory(MemoryError::OutOfBounds { offset: 1022, len: 3, size: 1024 })));
        assert!(view.read(u64::MAX, &mut out).is_err());

        view.flush().unwrap();
    }

    #[test]
    fn test_flush_covers_dirty_range() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let mut view = allocation.map().unwrap();

        // Clean views flush nothing
        view.flush().unwrap();
        assert!(context.flushes.borrow().is_empty());

        view.write(100, &[1; 10]).unwrap();
        view.write(300, &[2; 4]).unwrap();
        assert!(view.has_unflushed_writes());

        view.flush().unwrap();
        assert!(!view.has_unflushed_writes());
        assert_eq!(context.flushes.borrow().as_slice(), &[(64, 256)]);
    }

    #[test]
    fn test_partial_flush_keeps_dirty() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let mut view = allocation.map().unwrap();

        view.write(0, &[1; 200]).unwrap();
        view.flush_range(0, 64).unwrap();
        assert!(view.has_unflushed_writes());

        view.flush_range(0, 200).unwrap();
        assert!(!view.has_unflushed_writes());
    }

    #[test]
    fn test_invalidate_is_atom_aligned() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let view = allocation.map().unwrap();

        view.invalidate_range(5, 5).unwrap();
        view.invalidate().unwrap();
        assert_eq!(context.invalidations.borrow().as_slice(), &[(0, 64), (0, 1024)]);
    }

    #[test]
    fn test_empty_ranges_reach_no_backend() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();
        let mut view = allocation.map().unwrap();

        view.flush_range(1024, 0).unwrap();
        view.invalidate_range(512, 0).unwrap();
        assert!(context.flushes.borrow().is_empty());
        assert!(context.invalidations.borrow().is_empty());

        assert!(view.flush_range(1025, 0).is_err());
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_drop_with_unflushed_writes_still_unmaps() {
        let context = Arc::new(MockContext::new());
        let allocation = allocate(&context, 1024, MemoryPropertyFlags::shareable(), true).unwrap();

        {
            let mut view = allocation.map().unwrap();
            view.as_mut_slice()[0] = 42;
        }

        assert!(!allocation.is_mapped());
        assert_eq!(context.unmaps.get(), 1);
        assert!(logs_contain("unflushed bytes"));
    }
}
