//! External memory handle

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// OS descriptor naming a device memory allocation outside the driver.
///
/// The handle owns its descriptor. Importing consumes it; dropping an
/// unimported handle closes the descriptor but never frees the memory,
/// which stays alive until the exporting allocation is freed.
#[derive(Debug)]
pub struct ExternalMemoryHandle {
    fd: OwnedFd,
    allocation_size: u64,
}

impl ExternalMemoryHandle {
    /// Wrap a descriptor together with the exporter's allocation size
    pub fn new(fd: OwnedFd, allocation_size: u64) -> Self {
        Self { fd, allocation_size }
    }

    /// Size the exporter asked for when allocating
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    /// Give up the descriptor
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for ExternalMemoryHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ExternalMemoryHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_handle_keeps_size_and_fd() {
        let fd: OwnedFd = File::open("/dev/null").unwrap().into();
        let raw = fd.as_raw_fd();

        let handle = ExternalMemoryHandle::new(fd, 4096);
        assert_eq!(handle.allocation_size(), 4096);
        assert_eq!(handle.as_raw_fd(), raw);
        assert_eq!(handle.into_fd().as_raw_fd(), raw);
    }
}
