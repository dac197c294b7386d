//! Write-then-share and read-after-receive visibility protocol
//!
//! Both halves of every cross-process handoff go through here: the producer
//! writes and flushes before announcing the range, the consumer invalidates
//! before reading it. The checksum travels with the announcement so a reader
//! that observes stale bytes fails loudly instead of returning them.

use crate::{GraphicsContext, ProtocolViolation, Result, SharedRegionView};
use tracing::debug;

/// A byte range the producer has written and flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushedRange {
    /// Start of the range
    pub offset: u64,
    /// Length of the range
    pub len: u64,
    /// CRC32 of the bytes in the range
    pub checksum: u32,
}

/// Producer side: write `data` at `offset`, then flush it.
///
/// The returned range is what the consumer must be told about; it is only
/// valid to announce once this function has returned.
pub fn publish<C: GraphicsContext>(view: &mut SharedRegionView<'_, C>, offset: u64, data: &[u8]) -> Result<FlushedRange> {
    view.write(offset, data)?;
    view.flush_range(offset, data.len() as u64)?;

    let range = FlushedRange {
        offset,
        len: data.len() as u64,
        checksum: crc32fast::hash(data),
    };
    debug!("Published {} bytes at offset {} (crc {:#010x})", range.len, range.offset, range.checksum);
    Ok(range)
}

/// Consumer side: invalidate `range`, read it and verify its checksum
pub fn acquire<C: GraphicsContext>(view: &SharedRegionView<'_, C>, range: &FlushedRange) -> Result<Vec<u8>> {
    view.invalidate_range(range.offset, range.len)?;

    let mut data = vec![0u8; range.len as usize];
    view.read(range.offset, &mut data)?;

    let actual = crc32fast::hash(&data);
    if actual != range.checksum {
        return Err(ProtocolViolation::ChecksumMismatch {
            expected: range.checksum,
            actual,
        }
        .into());
    }

    debug!("Acquired {} bytes at offset {}", range.len, range.offset);
    Ok(data)
}
