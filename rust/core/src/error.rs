//! Error types for Memory Portal

use std::path::PathBuf;
use thiserror::Error;

/// Rendezvous channel errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The rendezvous path could not be bound
    #[error("Failed to bind rendezvous path {path:?}: {source}")]
    BindFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No server is listening at the rendezvous path
    #[error("Failed to connect to rendezvous path {path:?}: {source}")]
    ConnectFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The handle (or a follow-up signal) was not delivered
    #[error("Transfer failed: {0}")]
    TransferFailed(#[from] TransferFault),
}

/// Reason a transfer over an established connection failed
#[derive(Error, Debug)]
pub enum TransferFault {
    /// Fewer payload bytes than the message requires
    #[error("short message: expected {expected} bytes, got {actual}")]
    ShortMessage { expected: usize, actual: usize },

    /// The kernel dropped ancillary data because the control buffer was too small
    #[error("ancillary data truncated")]
    ControlTruncated,

    /// Peer closed the connection before the message arrived
    #[error("connection closed by peer")]
    Closed,

    /// A configured accept or I/O bound elapsed
    #[error("timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// The peer broke the wire protocol
    #[error("{0}")]
    Violation(#[from] ProtocolViolation),

    /// Socket level failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device memory errors
#[derive(Error, Debug)]
pub enum MemoryError {
    /// No memory type satisfies both the type bitmask and the property flags
    #[error("No suitable memory type (type bits {type_bits:#b}, required {required})")]
    NoSuitableMemoryType { type_bits: u32, required: String },

    /// Mapping refused or failed
    #[error("Memory mapping failed: {0}")]
    MapFailed(String),

    /// Backend allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Backend refused the imported handle
    #[error("Import failed: {0}")]
    ImportFailed(String),

    /// Backend could not produce an external handle
    #[error("Export failed: {0}")]
    ExportFailed(String),

    /// Export requested on an allocation created without export capability
    #[error("Allocation was not created with export capability")]
    NotExportable,

    /// Access outside the mapped region
    #[error("Range {offset}+{len} outside region of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
}

/// Broken agreement between producer and consumer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A handle message must carry exactly one descriptor
    #[error("expected exactly 1 descriptor, received {received}")]
    DescriptorCount { received: usize },

    /// Importer and exporter disagree on the allocation size
    #[error("size mismatch: exporter declared {declared} bytes, importer requested {requested}")]
    SizeMismatch { declared: u64, requested: u64 },

    /// Bytes read after invalidate do not match what the producer flushed
    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Signal received out of order
    #[error("unexpected signal: expected {expected}, received {received}")]
    UnexpectedSignal { expected: String, received: String },

    /// Signal frame failed validation
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Top-level error for a sharing session
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, PortalError>;

impl From<TransferFault> for PortalError {
    fn from(fault: TransferFault) -> Self {
        PortalError::Channel(ChannelError::TransferFailed(fault))
    }
}

impl PortalError {
    /// Whether the surrounding application may start a fresh session.
    ///
    /// Nothing inside the core retries; this only tells the caller whether
    /// rebinding or reconnecting can plausibly succeed.
    pub fn is_session_retryable(&self) -> bool {
        match self {
            PortalError::Channel(ChannelError::BindFailed { .. }) => true,
            PortalError::Channel(ChannelError::ConnectFailed { .. }) => true,
            PortalError::Channel(ChannelError::TransferFailed(TransferFault::TimedOut { .. })) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            PortalError::Channel(ChannelError::BindFailed { .. }) => ErrorCategory::Rendezvous,
            PortalError::Channel(ChannelError::ConnectFailed { .. }) => ErrorCategory::Rendezvous,
            PortalError::Channel(ChannelError::TransferFailed(TransferFault::TimedOut { .. })) => {
                ErrorCategory::Timeout
            }
            PortalError::Channel(ChannelError::TransferFailed(TransferFault::Violation(_))) => {
                ErrorCategory::Protocol
            }
            PortalError::Channel(ChannelError::TransferFailed(_)) => ErrorCategory::Transfer,
            PortalError::Memory(_) => ErrorCategory::Memory,
            PortalError::Protocol(_) => ErrorCategory::Protocol,
        }
    }
}

/// Error categories for logging and handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Rendezvous,
    Transfer,
    Memory,
    Protocol,
    Timeout,
}
