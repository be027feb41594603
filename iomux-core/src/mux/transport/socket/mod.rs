//! Unix socket setup and receives `std` has no API for.
//!
//! `std` can't create `SOCK_SEQPACKET` sockets, and its `UnixStream::connect`
//! can't bind the client side to a path first. Senders need a path so the mux
//! can tell which tag an accepted connection belongs to. Receives go through
//! `recvmsg` so a message cut short by the read buffer is noticed.

use std::{
    io::{self, ErrorKind, IoSliceMut},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::socket::{self, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr},
};

const BACKLOG: i32 = 128;

/// Create a socket of type `ty`, bind it to `path` and start listening.
pub(crate) fn listen(ty: SockType, path: &Path) -> io::Result<OwnedFd> {
    let fd = open(ty)?;
    socket::bind(fd.as_raw_fd(), &addr(path)?)?;
    socket::listen(&fd, Backlog::new(BACKLOG)?)?;
    Ok(fd)
}

/// Create a socket of type `ty` bound to `local` and connect it to `remote`.
pub(crate) fn connect(ty: SockType, local: &Path, remote: &Path) -> io::Result<OwnedFd> {
    let fd = open(ty)?;
    socket::bind(fd.as_raw_fd(), &addr(local)?)?;
    let remote = addr(remote)?;
    loop {
        match socket::connect(fd.as_raw_fd(), &remote) {
            Ok(()) => return Ok(fd),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One message, or up to `buf.len()` bytes of a stream.
#[derive(Debug)]
pub(crate) struct Received {
    pub(crate) len: usize,
    /// The message didn't fit in the buffer and its tail was discarded.
    pub(crate) truncated: bool,
    /// The sender's bound path, for datagram sockets.
    pub(crate) peer: Option<PathBuf>,
}

/// Receive into `buf` without blocking past what the socket already allows.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    let mut iov = [IoSliceMut::new(buf)];
    let msg = socket::recvmsg::<UnixAddr>(fd, &mut iov, None, MsgFlags::empty())?;
    Ok(Received {
        len: msg.bytes,
        truncated: msg.flags.contains(MsgFlags::MSG_TRUNC),
        peer: msg
            .address
            .as_ref()
            .and_then(UnixAddr::path)
            .map(Path::to_path_buf),
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open(ty: SockType) -> io::Result<OwnedFd> {
    Ok(socket::socket(
        AddressFamily::Unix,
        ty,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

// no SOCK_CLOEXEC here; the flag is set straight after creation
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open(ty: SockType) -> io::Result<OwnedFd> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let fd = socket::socket(AddressFamily::Unix, ty, SockFlag::empty(), None)?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(fd)
}

fn addr(path: &Path) -> io::Result<UnixAddr> {
    UnixAddr::new(path).map_err(|e| match e {
        Errno::ENAMETOOLONG => io::Error::new(
            ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ),
        e => e.into(),
    })
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::unix::net as std_net};

    use super::*;

    #[test]
    fn long_paths_are_rejected() {
        let long = "x".repeat(200);
        let err = addr(Path::new(&long)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn stream_connect_binds_the_local_path() {
        let dir = tempfile::tempdir().unwrap();
        let recv = dir.path().join("recv.sock");
        let send = dir.path().join("send_1.sock");
        let listener = std_net::UnixListener::from(listen(SockType::Stream, &recv).unwrap());
        let _sender = connect(SockType::Stream, &send, &recv).unwrap();
        let (_conn, addr) = listener.accept().unwrap();
        assert_eq!(addr.as_pathname(), Some(send.as_path()));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn sockets_are_close_on_exec() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let fd = open(SockType::Stream).unwrap();
        let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn recv_reports_the_sender_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let recv_path = dir.path().join("recv.sock");
        let send_path = dir.path().join("send_1.sock");
        let receiver = std_net::UnixDatagram::bind(&recv_path).unwrap();
        let sender = std_net::UnixDatagram::bind(&send_path).unwrap();
        sender.connect(&recv_path).unwrap();

        let mut buf = [0; 8];
        sender.send(b"short").unwrap();
        let received = recv(receiver.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(received.len, 5);
        assert!(!received.truncated);
        assert_eq!(received.peer.as_deref(), Some(send_path.as_path()));

        sender.send(b"far too long for eight").unwrap();
        let received = recv(receiver.as_raw_fd(), &mut buf).unwrap();
        assert!(received.truncated);
    }

    #[test]
    fn recv_on_a_stream_never_truncates() {
        let (ours, mut theirs) = std_net::UnixStream::pair().unwrap();
        theirs.write_all(b"0123456789").unwrap();
        let mut buf = [0; 4];
        let received = recv(ours.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(received.len, 4);
        assert!(!received.truncated);
    }
}
