//! Memory Portal - Network Module
//!
//! Unix socket rendezvous that hands one external memory descriptor from
//! producer to consumer, plus the readiness signals exchanged afterwards.

pub mod descriptor;
pub mod handshake;
pub mod signal;

pub use descriptor::{receive_descriptor, send_descriptor, send_with_descriptors};
pub use handshake::*;
pub use signal::*;

/// Default rendezvous path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/memory_portal.sock";
