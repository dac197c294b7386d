//! `SCM_RIGHTS` descriptor passing over a Unix stream socket

use memory_portal_core::TransferFault;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::debug;

/// Most descriptors accepted in one message. The control buffer is sized
/// for this many so surplus descriptors are received and closed rather
/// than silently truncated.
pub const MAX_DESCRIPTORS: usize = 8;

fn send_flags() -> MsgFlags {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        MsgFlags::MSG_NOSIGNAL
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        MsgFlags::empty()
    }
}

fn receive_flags() -> MsgFlags {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        MsgFlags::MSG_CMSG_CLOEXEC
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        MsgFlags::empty()
    }
}

/// Send `payload` with exactly one descriptor attached
pub fn send_descriptor(stream: &UnixStream, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<(), TransferFault> {
    send_with_descriptors(stream, payload, &[fd])
}

/// Send `payload` with any number of descriptors attached (including none)
pub fn send_with_descriptors(
    stream: &UnixStream,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<(), TransferFault> {
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
    let iov = [IoSlice::new(payload)];

    let sent = loop {
        match sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, cmsgs, send_flags(), None) {
            Ok(sent) => break sent,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(TransferFault::Io(errno.into())),
        }
    };

    if sent != payload.len() {
        return Err(TransferFault::ShortMessage {
            expected: payload.len(),
            actual: sent,
        });
    }

    debug!("Sent {} byte message with {} descriptor(s)", sent, raw.len());
    Ok(())
}

/// Receive one message into `buf`.
///
/// Returns the number of payload bytes and every descriptor that arrived.
/// The descriptors are owned from the moment they are received, so callers
/// that reject them only have to drop them.
pub fn receive_descriptor(stream: &UnixStream, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>), TransferFault> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);

    let (bytes, flags, fds) = loop {
        let mut iov = [IoSliceMut::new(&mut *buf)];
        match recvmsg::<UnixAddr>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), receive_flags()) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                }
                break (msg.bytes, msg.flags, fds);
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(TransferFault::Io(errno.into())),
        }
    };

    if flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(TransferFault::ControlTruncated);
    }

    debug!("Received {} byte message with {} descriptor(s)", bytes, fds.len());
    Ok((bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    #[test]
    fn test_descriptor_round_trip() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"descriptor").unwrap();

        send_descriptor(&left, file.as_fd(), &42u64.to_le_bytes()).unwrap();

        let mut buf = [0u8; 8];
        let (bytes, mut fds) = receive_descriptor(&right, &mut buf).unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(u64::from_le_bytes(buf), 42);
        assert_eq!(fds.len(), 1);

        // The received descriptor names the same open file
        let mut received = File::from(fds.pop().unwrap());
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "descriptor");
    }

    #[test]
    fn test_multiple_and_zero_descriptors() {
        let (left, right) = UnixStream::pair().unwrap();
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();

        send_with_descriptors(&left, &[1, 2, 3, 4, 5, 6, 7, 8], &[a.as_fd(), b.as_fd()]).unwrap();
        let mut buf = [0u8; 8];
        let (_, fds) = receive_descriptor(&right, &mut buf).unwrap();
        assert_eq!(fds.len(), 2);

        send_with_descriptors(&left, &[0; 8], &[]).unwrap();
        let (bytes, fds) = receive_descriptor(&right, &mut buf).unwrap();
        assert_eq!(bytes, 8);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_receive_after_peer_closed() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);

        let mut buf = [0u8; 8];
        let (bytes, fds) = receive_descriptor(&right, &mut buf).unwrap();
        assert_eq!(bytes, 0);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_send_to_closed_peer() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);

        let file = tempfile::tempfile().unwrap();
        let err = send_descriptor(&left, file.as_fd(), &[0; 8]).unwrap_err();
        assert!(matches!(err, TransferFault::Io(_)));
    }
}
