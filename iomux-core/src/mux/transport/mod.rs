pub(crate) mod socket;

use std::{
    fs,
    io::{self, ErrorKind},
    net::Shutdown,
    os::{fd::OwnedFd, unix::net as std_net},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use mio::{
    net::{UnixDatagram, UnixListener, UnixStream},
    Events, Interest, Poll, Token,
};
use nix::sys::socket::SockType;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{Error, Result};

/// The unix domain socket flavour a mux is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// `SOCK_DGRAM`: one receive socket, every write arrives atomically and in
    /// order, so cross-tag ordering is exact. A message larger than the read
    /// buffer fails the read instead of being cut short.
    Datagram,
    /// `SOCK_STREAM`: one accepted connection per tag. No message boundaries,
    /// cross-tag ordering is best effort.
    Stream,
    /// `SOCK_SEQPACKET`: one accepted connection per tag with message
    /// boundaries. Not available on every platform.
    SeqPacket,
}

impl Transport {
    /// Datagram on Linux, Stream everywhere else.
    ///
    /// macOS and the BSDs reject datagrams above roughly 2KiB with
    /// `EMSGSIZE`, which writers we don't control will run into.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "linux") {
            Transport::Datagram
        } else {
            Transport::Stream
        }
    }

    /// Whether every tag gets its own accepted connection.
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, Transport::Datagram)
    }

    /// Size of the per-connection read buffer.
    ///
    /// Message oriented transports can't split a message across reads, so
    /// they get the largest message the platform allows. Stream reads are kept
    /// small; long writes come back in several chunks and are stitched
    /// together again by the session.
    pub(crate) fn buffer_size(self) -> usize {
        match self {
            Transport::Datagram | Transport::SeqPacket => DATAGRAM_BUFFER_SIZE,
            Transport::Stream => STREAM_BUFFER_SIZE,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::platform_default()
    }
}

#[cfg(target_os = "macos")]
const DATAGRAM_BUFFER_SIZE: usize = 2048;
#[cfg(not(target_os = "macos"))]
const DATAGRAM_BUFFER_SIZE: usize = 65536;

pub(crate) const STREAM_BUFFER_SIZE: usize = 128;

pub(crate) const RECV_SOCKET: &str = "recv.sock";

const LISTENER: Token = Token(0);

/// The directory holding a mux's sockets.
#[derive(Debug)]
pub(crate) enum Workdir {
    /// Created by the mux and removed entirely on close.
    Temp(TempDir),
    /// Supplied by the caller. Only the sockets the mux created are removed.
    Custom(PathBuf),
}

impl Workdir {
    pub(crate) fn create(dir: Option<PathBuf>) -> io::Result<Self> {
        match dir {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(Workdir::Custom(dir))
            }
            None => Ok(Workdir::Temp(
                tempfile::Builder::new().prefix("mux").tempdir()?,
            )),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        match self {
            Workdir::Temp(dir) => dir.path(),
            Workdir::Custom(dir) => dir,
        }
    }

    pub(crate) fn remove(self, sockets: &[PathBuf]) -> io::Result<()> {
        match self {
            Workdir::Temp(dir) => dir.close(),
            Workdir::Custom(_) => {
                let mut result = Ok(());
                for socket in sockets {
                    match fs::remove_file(socket) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(path = %socket.display(), error = %e, "failed to remove socket");
                            result = Err(e);
                        }
                    }
                }
                result
            }
        }
    }
}

/// The bound receive side of a mux.
pub(crate) enum Receiver {
    /// The single socket every sender writes to.
    Datagram(UnixDatagram),
    /// A listener that accepts one connection per tag.
    Listener(Acceptor),
}

/// Bind the receive endpoint at `path`.
pub(crate) fn bind(transport: Transport, path: &Path, deadline: Duration) -> io::Result<Receiver> {
    let receiver = match transport {
        Transport::Datagram => {
            let sock = UnixDatagram::bind(path)?;
            let _ = sock.shutdown(Shutdown::Write);
            Receiver::Datagram(sock)
        }
        Transport::Stream => {
            Receiver::Listener(Acceptor::new(UnixListener::bind(path)?, deadline)?)
        }
        Transport::SeqPacket => {
            let listener = std_net::UnixListener::from(socket::listen(SockType::SeqPacket, path)?);
            listener.set_nonblocking(true)?;
            Receiver::Listener(Acceptor::new(UnixListener::from_std(listener), deadline)?)
        }
    };
    debug!(?transport, path = %path.display(), "bound receiver");
    Ok(receiver)
}

/// Connect a sender bound at `local` to the receiver at `remote`.
///
/// The returned descriptor is blocking and its read half is shut down; data
/// only ever flows from the sender to the mux.
pub(crate) fn dial(transport: Transport, local: &Path, remote: &Path) -> io::Result<OwnedFd> {
    match transport {
        Transport::Datagram => {
            let sock = std_net::UnixDatagram::bind(local)?;
            sock.connect(remote)?;
            let _ = sock.shutdown(Shutdown::Read);
            Ok(sock.into())
        }
        Transport::Stream | Transport::SeqPacket => {
            let ty = if transport == Transport::Stream {
                SockType::Stream
            } else {
                SockType::SeqPacket
            };
            let stream = std_net::UnixStream::from(socket::connect(ty, local, remote)?);
            let _ = stream.shutdown(Shutdown::Read);
            Ok(stream.into())
        }
    }
}

/// Accepts the connection for one new tag within a bounded deadline.
pub(crate) struct Acceptor {
    listener: UnixListener,
    poll: Poll,
    events: Events,
    deadline: Duration,
}

impl Acceptor {
    fn new(mut listener: UnixListener, deadline: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(8),
            deadline,
        })
    }

    /// Accept the connection dialed from `expected`.
    pub(crate) fn accept(&mut self, expected: &Path) -> Result<UnixStream> {
        let started = Instant::now();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let accepted = addr.as_pathname();
                    if accepted != Some(expected) {
                        return Err(Error::UnexpectedPeer {
                            expected: expected.to_path_buf(),
                            accepted: accepted.map(Path::to_path_buf),
                        });
                    }
                    let _ = stream.shutdown(Shutdown::Write);
                    return Ok(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let remaining = self.deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(Error::AcceptTimeout(expected.to_path_buf()));
            }
            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
