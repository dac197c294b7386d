//! Readiness signals exchanged after the handle transfer
//!
//! Every signal is one fixed 32-byte little-endian frame:
//!
//! | bytes  | field                         |
//! |--------|-------------------------------|
//! | 0..4   | magic `"MPSG"`                |
//! | 4      | version                       |
//! | 5      | kind                          |
//! | 6..8   | sequence number               |
//! | 8..16  | range offset                  |
//! | 16..24 | range length                  |
//! | 24..28 | CRC-32 of the range bytes     |
//! | 28..32 | CRC-32 of bytes 0..28         |

use memory_portal_core::{FlushedRange, ProtocolViolation, Result, TransferFault};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::debug;

/// Frame magic
pub const SIGNAL_MAGIC: [u8; 4] = *b"MPSG";

/// Frame version
pub const SIGNAL_VERSION: u8 = 1;

/// Encoded frame length
pub const SIGNAL_FRAME_LEN: usize = 32;

/// Signal discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalKind {
    /// Consumer has imported and mapped the region
    Mapped = 1,
    /// Producer has written and flushed a range
    Ready = 2,
    /// Consumer has finished reading
    ReadComplete = 3,
}

impl SignalKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SignalKind::Mapped),
            2 => Some(SignalKind::Ready),
            3 => Some(SignalKind::ReadComplete),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Mapped => "Mapped",
            SignalKind::Ready => "Ready",
            SignalKind::ReadComplete => "ReadComplete",
        };
        f.write_str(name)
    }
}

/// A readiness signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Mapped,
    Ready(FlushedRange),
    ReadComplete,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Mapped => SignalKind::Mapped,
            Signal::Ready(_) => SignalKind::Ready,
            Signal::ReadComplete => SignalKind::ReadComplete,
        }
    }
}

/// Encode `signal` as frame number `sequence`
pub fn encode_frame(signal: &Signal, sequence: u16) -> [u8; SIGNAL_FRAME_LEN] {
    let mut frame = [0u8; SIGNAL_FRAME_LEN];
    frame[0..4].copy_from_slice(&SIGNAL_MAGIC);
    frame[4] = SIGNAL_VERSION;
    frame[5] = signal.kind() as u8;
    frame[6..8].copy_from_slice(&sequence.to_le_bytes());

    if let Signal::Ready(range) = signal {
        frame[8..16].copy_from_slice(&range.offset.to_le_bytes());
        frame[16..24].copy_from_slice(&range.len.to_le_bytes());
        frame[24..28].copy_from_slice(&range.checksum.to_le_bytes());
    }

    let header_crc = crc32fast::hash(&frame[0..28]);
    frame[28..32].copy_from_slice(&header_crc.to_le_bytes());
    frame
}

/// Validate and decode a frame, returning its sequence number and signal
pub fn decode_frame(frame: &[u8; SIGNAL_FRAME_LEN]) -> std::result::Result<(u16, Signal), ProtocolViolation> {
    if frame[0..4] != SIGNAL_MAGIC {
        return Err(ProtocolViolation::MalformedFrame(format!("bad magic {:02x?}", &frame[0..4])));
    }
    if frame[4] != SIGNAL_VERSION {
        return Err(ProtocolViolation::MalformedFrame(format!("unsupported version {}", frame[4])));
    }

    let expected = u32::from_le_bytes([frame[28], frame[29], frame[30], frame[31]]);
    let actual = crc32fast::hash(&frame[0..28]);
    if expected != actual {
        return Err(ProtocolViolation::MalformedFrame(format!(
            "header checksum {:#010x} does not match {:#010x}",
            actual, expected
        )));
    }

    let kind = SignalKind::from_u8(frame[5])
        .ok_or_else(|| ProtocolViolation::MalformedFrame(format!("unknown signal kind {}", frame[5])))?;
    let sequence = u16::from_le_bytes([frame[6], frame[7]]);

    let signal = match kind {
        SignalKind::Mapped => Signal::Mapped,
        SignalKind::ReadComplete => Signal::ReadComplete,
        SignalKind::Ready => {
            let mut offset = [0u8; 8];
            let mut len = [0u8; 8];
            let mut checksum = [0u8; 4];
            offset.copy_from_slice(&frame[8..16]);
            len.copy_from_slice(&frame[16..24]);
            checksum.copy_from_slice(&frame[24..28]);
            Signal::Ready(FlushedRange {
                offset: u64::from_le_bytes(offset),
                len: u64::from_le_bytes(len),
                checksum: u32::from_le_bytes(checksum),
            })
        }
    };

    Ok((sequence, signal))
}

/// Signal exchange over the connection that carried the handle
#[derive(Debug)]
pub struct SignalLink {
    stream: UnixStream,
    io_timeout: Option<Duration>,
    sent: u16,
    received: u16,
}

impl SignalLink {
    pub(crate) fn new(stream: UnixStream, io_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            io_timeout,
            sent: 0,
            received: 0,
        }
    }

    /// Send one signal
    pub fn send(&mut self, signal: Signal) -> Result<()> {
        let frame = encode_frame(&signal, self.sent);
        self.stream.write_all(&frame).map_err(|e| self.fault(e))?;
        self.sent = self.sent.wrapping_add(1);

        debug!("Sent {} signal", signal.kind());
        Ok(())
    }

    /// Receive the next signal, whatever its kind
    pub fn receive(&mut self) -> Result<Signal> {
        let mut frame = [0u8; SIGNAL_FRAME_LEN];
        self.stream.read_exact(&mut frame).map_err(|e| self.fault(e))?;

        let (sequence, signal) = decode_frame(&frame)?;
        if sequence != self.received {
            return Err(ProtocolViolation::MalformedFrame(format!(
                "out of sequence frame {} (expected {})",
                sequence, self.received
            ))
            .into());
        }
        self.received = self.received.wrapping_add(1);

        debug!("Received {} signal", signal.kind());
        Ok(signal)
    }

    /// Receive the next signal and require it to be of `kind`
    pub fn expect(&mut self, kind: SignalKind) -> Result<Signal> {
        let signal = self.receive()?;
        if signal.kind() != kind {
            return Err(ProtocolViolation::UnexpectedSignal {
                expected: kind.to_string(),
                received: signal.kind().to_string(),
            }
            .into());
        }
        Ok(signal)
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> UnixStream {
        self.stream
    }

    fn fault(&self, error: std::io::Error) -> TransferFault {
        match error.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => TransferFault::Closed,
            ErrorKind::WouldBlock | ErrorKind::TimedOut => match self.io_timeout {
                Some(timeout) => TransferFault::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                },
                None => TransferFault::Io(error),
            },
            _ => TransferFault::Io(error),
        }
    }
}
