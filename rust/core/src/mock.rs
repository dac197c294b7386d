//! In-process context used by the unit tests

use crate::{GraphicsContext, MemoryError, MemoryPropertyFlags, MemoryRequirements, MemoryType};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

pub(crate) struct MockMemory {
    ptr: NonNull<u8>,
    len: usize,
}

/// Heap-backed context; imports do not alias the exporter
pub(crate) struct MockContext {
    live: Cell<usize>,
    imports: Cell<usize>,
    pub(crate) flushes: RefCell<Vec<(u64, u64)>>,
    pub(crate) invalidations: RefCell<Vec<(u64, u64)>>,
    pub(crate) unmaps: Cell<usize>,
    pub(crate) alignment: Cell<u64>,
}

impl MockContext {
    pub(crate) const ATOM: u64 = 64;

    pub(crate) fn new() -> Self {
        Self {
            live: Cell::new(0),
            imports: Cell::new(0),
            flushes: RefCell::new(Vec::new()),
            invalidations: RefCell::new(Vec::new()),
            unmaps: Cell::new(0),
            alignment: Cell::new(256),
        }
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.live.get()
    }

    pub(crate) fn imports(&self) -> usize {
        self.imports.get()
    }

    fn new_memory(&self, size: u64) -> MockMemory {
        let boxed = vec![0u8; size as usize].into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::new(Box::into_raw(boxed) as *mut u8).unwrap();
        self.live.set(self.live.get() + 1);
        MockMemory { ptr, len }
    }
}

impl GraphicsContext for MockContext {
    type Memory = MockMemory;

    fn memory_types(&self) -> Vec<MemoryType> {
        vec![
            MemoryType { index: 0, property_flags: MemoryPropertyFlags::DEVICE_LOCAL },
            MemoryType { index: 1, property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT },
            MemoryType { index: 2, property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED },
        ]
    }

    fn memory_requirements(&self, size: u64, _external: bool) -> Result<MemoryRequirements, MemoryError> {
        Ok(MemoryRequirements {
            size: (size + 255) & !255,
            alignment: self.alignment.get(),
            memory_type_bits: 0b111,
        })
    }

    fn non_coherent_atom_size(&self) -> u64 {
        Self::ATOM
    }

    fn allocate(&self, size: u64, _memory_type_index: u32, _exportable: bool) -> Result<MockMemory, MemoryError> {
        Ok(self.new_memory(size))
    }

    fn export(&self, _memory: &MockMemory) -> Result<OwnedFd, MemoryError> {
        File::open("/dev/null")
            .map(OwnedFd::from)
            .map_err(|e| MemoryError::ExportFailed(e.to_string()))
    }

    fn import(&self, _fd: OwnedFd, size: u64, _memory_type_index: u32) -> Result<MockMemory, MemoryError> {
        self.imports.set(self.imports.get() + 1);
        Ok(self.new_memory(size))
    }

    fn map(&self, memory: &MockMemory, _size: u64) -> Result<NonNull<u8>, MemoryError> {
        Ok(memory.ptr)
    }

    fn unmap(&self, _memory: &MockMemory) {
        self.unmaps.set(self.unmaps.get() + 1);
    }

    fn flush(&self, _memory: &MockMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        self.flushes.borrow_mut().push((offset, size));
        Ok(())
    }

    fn invalidate(&self, _memory: &MockMemory, offset: u64, size: u64) -> Result<(), MemoryError> {
        self.invalidations.borrow_mut().push((offset, size));
        Ok(())
    }

    fn free(&self, memory: MockMemory) {
        let slice = std::ptr::slice_from_raw_parts_mut(memory.ptr.as_ptr(), memory.len);
        drop(unsafe { Box::from_raw(slice) });
        self.live.set(self.live.get() - 1);
    }
}
