//! One-shot rendezvous that moves an external memory handle between processes
//!
//! The server binds a Unix socket path, accepts a single client and sends it
//! one message: the exporter's allocation size as a little-endian `u64` with
//! the memory descriptor attached. The same connection can then carry
//! readiness signals.

use crate::descriptor::{receive_descriptor, send_descriptor};
use crate::signal::SignalLink;
use memory_portal_core::{ChannelError, ExternalMemoryHandle, ProtocolViolation, TransferFault};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat::{fstat, stat};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Payload length of the handle message
pub const HANDLE_MESSAGE_LEN: usize = 8;

/// Attempts at locking a lock file that keeps being replaced underneath us
const LOCK_ATTEMPTS: usize = 4;

/// Timeouts for the handshake. `None` blocks indefinitely.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Bound on waiting for a client
    pub accept_timeout: Option<Duration>,
    /// Bound on each send or receive once connected
    pub io_timeout: Option<Duration>,
    /// Polling period of a bounded accept
    pub poll_interval: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            accept_timeout: None,
            io_timeout: None,
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl HandshakeOptions {
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_os_string();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// Whether `lock` is still the file at `lock_path`. A previous owner unlinks
/// the lock file on drop, so a descriptor opened before that may lock an
/// orphaned inode nobody else will ever look at.
fn lock_is_current(lock: &File, lock_path: &Path) -> io::Result<bool> {
    let held = fstat(lock.as_raw_fd())?;
    match stat(lock_path) {
        Ok(current) => Ok(held.st_dev == current.st_dev && held.st_ino == current.st_ino),
        Err(Errno::ENOENT) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// Open and exclusively lock `lock_path`, without waiting
fn acquire_lock(lock_path: &Path) -> io::Result<File> {
    for _ in 0..LOCK_ATTEMPTS {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)?;

        flock(lock.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|errno| {
            io::Error::new(
                ErrorKind::AddrInUse,
                format!("path is owned by a live server ({})", errno),
            )
        })?;

        if lock_is_current(&lock, lock_path)? {
            return Ok(lock);
        }
        debug!("Lock file {:?} was replaced while locking, retrying", lock_path);
    }

    Err(io::Error::new(
        ErrorKind::AddrInUse,
        "lock file keeps being replaced by other servers",
    ))
}

fn timed_out(timeout: Duration) -> TransferFault {
    TransferFault::TimedOut {
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// Bound rendezvous endpoint, exclusive owner of its path
#[derive(Debug)]
pub struct HandshakeServer {
    listener: UnixListener,
    path: PathBuf,
    lock_path: PathBuf,
    _lock: File,
}

impl HandshakeServer {
    /// Bind `path`.
    ///
    /// Fails with `BindFailed` if another live server owns the path or the
    /// path exists and is not a socket. A socket file left behind by a dead
    /// server is removed first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        let bind_failed = |source: io::Error| ChannelError::BindFailed {
            path: path.clone(),
            source,
        };

        let lock_path = lock_path_for(&path);
        let lock = acquire_lock(&lock_path).map_err(bind_failed)?;

        match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                warn!("Removing stale socket file {:?}", path);
                fs::remove_file(&path).map_err(bind_failed)?;
            }
            Ok(_) => {
                return Err(bind_failed(io::Error::new(
                    ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(bind_failed(e)),
        }

        let listener = UnixListener::bind(&path).map_err(bind_failed)?;
        info!("Handshake server listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            lock_path,
            _lock: lock,
        })
    }

    /// Rendezvous path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for one client
    pub fn accept(&self, options: &HandshakeOptions) -> Result<HandshakeConnection, ChannelError> {
        let stream = match options.accept_timeout {
            None => {
                self.listener.set_nonblocking(false).map_err(TransferFault::Io)?;
                let (stream, _) = self.listener.accept().map_err(TransferFault::Io)?;
                stream
            }
            Some(timeout) => self.accept_until(Instant::now() + timeout, timeout, options.poll_interval)?,
        };

        // Accepted sockets inherit O_NONBLOCK on some platforms
        stream.set_nonblocking(false).map_err(TransferFault::Io)?;
        debug!("Accepted client on {:?}", self.path);

        HandshakeConnection::from_stream(stream, options)
    }

    fn accept_until(&self, deadline: Instant, timeout: Duration, poll_interval: Duration) -> Result<UnixStream, TransferFault> {
        self.listener.set_nonblocking(true)?;

        loop {
            match self.listener.accept() {
                Ok((stream, _)) => return Ok(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("No client connected to {:?} within {:?}", self.path, timeout);
                        return Err(timed_out(timeout));
                    }
                    std::thread::sleep(poll_interval.min(deadline - now));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferFault::Io(e)),
            }
        }
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove socket file {:?}: {}", self.path, e);
            }
        }
        // Removed while the lock is still held; the lock itself goes with `_lock`
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove lock file {:?}: {}", self.lock_path, e);
            }
        }
        debug!("Handshake server on {:?} closed", self.path);
    }
}

/// Established handshake connection, either side
#[derive(Debug)]
pub struct HandshakeConnection {
    stream: UnixStream,
    io_timeout: Option<Duration>,
}

impl HandshakeConnection {
    /// Connect to a server. No retry is attempted.
    pub fn connect(path: impl AsRef<Path>, options: &HandshakeOptions) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ChannelError::ConnectFailed {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Connected to {:?}", path);

        Self::from_stream(stream, options)
    }

    fn from_stream(stream: UnixStream, options: &HandshakeOptions) -> Result<Self, ChannelError> {
        stream.set_read_timeout(options.io_timeout).map_err(TransferFault::Io)?;
        stream.set_write_timeout(options.io_timeout).map_err(TransferFault::Io)?;

        Ok(Self {
            stream,
            io_timeout: options.io_timeout,
        })
    }

    /// Underlying socket
    pub fn as_stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Send `handle` to the peer. The local descriptor is closed afterwards;
    /// the peer holds its own duplicate.
    pub fn send_handle(&self, handle: ExternalMemoryHandle) -> Result<(), ChannelError> {
        let payload = handle.allocation_size().to_le_bytes();
        send_descriptor(&self.stream, handle.as_fd(), &payload).map_err(|fault| self.classify(fault))?;

        info!("Sent memory handle ({} bytes)", handle.allocation_size());
        Ok(())
    }

    /// Receive exactly one handle from the peer
    pub fn receive_handle(&self) -> Result<ExternalMemoryHandle, ChannelError> {
        let mut payload = [0u8; HANDLE_MESSAGE_LEN];
        let (received, mut fds) =
            receive_descriptor(&self.stream, &mut payload).map_err(|fault| self.classify(fault))?;

        if received == 0 && fds.is_empty() {
            return Err(TransferFault::Closed.into());
        }
        if fds.len() != 1 {
            // Dropping the vector closes whatever did arrive
            let count = fds.len();
            drop(fds);
            return Err(TransferFault::Violation(ProtocolViolation::DescriptorCount { received: count }).into());
        }

        if received < HANDLE_MESSAGE_LEN {
            (&self.stream).read_exact(&mut payload[received..]).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => TransferFault::ShortMessage {
                    expected: HANDLE_MESSAGE_LEN,
                    actual: received,
                },
                _ => self.classify(TransferFault::Io(e)),
            })?;
        }

        let allocation_size = u64::from_le_bytes(payload);
        if allocation_size == 0 {
            return Err(TransferFault::Violation(ProtocolViolation::MalformedFrame(
                "handle declares a zero-sized allocation".to_string(),
            ))
            .into());
        }

        let fd = fds.pop().ok_or(TransferFault::Closed)?;
        info!("Received memory handle ({} bytes)", allocation_size);
        Ok(ExternalMemoryHandle::new(fd, allocation_size))
    }

    /// Keep the connection for readiness signals
    pub fn into_signal_link(self) -> SignalLink {
        SignalLink::new(self.stream, self.io_timeout)
    }

    fn classify(&self, fault: TransferFault) -> TransferFault {
        if let (TransferFault::Io(e), Some(timeout)) = (&fault, self.io_timeout) {
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                return timed_out(timeout);
            }
        }
        fault
    }
}

/// Serve `handle` to a single client at `path`, then tear the endpoint down
pub fn run_server(path: impl AsRef<Path>, handle: ExternalMemoryHandle, options: &HandshakeOptions) -> Result<(), ChannelError> {
    let server = HandshakeServer::bind(path)?;
    let connection = server.accept(options)?;
    connection.send_handle(handle)
}

/// Connect to `path` and receive exactly one handle
pub fn run_client(path: impl AsRef<Path>, options: &HandshakeOptions) -> Result<ExternalMemoryHandle, ChannelError> {
    let connection = HandshakeConnection::connect(path, options)?;
    connection.receive_handle()
}
