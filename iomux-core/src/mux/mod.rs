pub(crate) mod fanin;
pub(crate) mod reassemble;
pub(crate) mod registry;
pub(crate) mod session;
pub(crate) mod transport;

use std::{
    fs::File,
    hash::Hash,
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

use self::fanin::{FanIn, Next, Source};
use self::registry::Registry;
use self::session::Scope;
use self::transport::{Acceptor, Receiver, Transport, Workdir, RECV_SOCKET};
use crate::{Error, Result};

/// How long a single connection read waits before checking for cancellation.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(100);

/// A chunk of bytes written under one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedData<T> {
    pub tag: T,
    pub data: Vec<u8>,
}

/// One receiving end and any number of tagged sending ends, over unix domain
/// sockets.
///
/// Closed on drop. Once closed, every operation returns [`Error::Closed`].
pub struct Mux<T> {
    inner: Option<Inner<T>>,
}

struct Inner<T> {
    transport: Transport,
    workdir: Workdir,
    recv_path: PathBuf,
    acceptor: Option<Acceptor>,
    fanin: FanIn,
    registry: Registry<T>,
    buffer_size: usize,
}

impl<T: Clone + Eq + Hash> Mux<T> {
    /// Create a mux on the platform's default transport.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn with_transport(transport: Transport) -> Result<Self> {
        Self::builder().transport(transport).build()
    }

    pub fn builder() -> Builder<T> {
        Builder::new()
    }

    /// A writable handle whose data is read back tagged with `tag`.
    ///
    /// The first call for a tag connects a new sender; later calls hand out
    /// another handle to the same one. If connecting fails the whole mux is
    /// closed, since the receive side can't be trusted after a half finished
    /// handshake.
    pub fn tag(&mut self, tag: T) -> Result<File> {
        let inner = self.inner.as_mut().ok_or(Error::Closed)?;
        if !inner.registry.contains(&tag) {
            if let Err(err) = inner.register(tag.clone()) {
                warn!(error = %err, "failed to connect sender, closing mux");
                let _ = self.close();
                return Err(err);
            }
        }
        let inner = self.inner.as_ref().ok_or(Error::Closed)?;
        Ok(inner.registry.handle(&tag)?)
    }

    /// Read the next chunk from any sender.
    ///
    /// Blocks until a chunk arrives, or returns `Ok(None)` once `scope` has
    /// been cancelled and every connection has stayed quiet for a full
    /// deadline afterwards.
    pub fn read(&mut self, scope: &Scope) -> Result<Option<TaggedData<T>>> {
        let inner = self.inner.as_mut().ok_or(Error::Closed)?;
        if inner.registry.is_empty() {
            return Err(Error::NoConnections);
        }
        loop {
            match inner.fanin.next(scope)? {
                Next::End => return Ok(None),
                Next::Chunk(data, origin) => match inner.registry.resolve(&origin) {
                    Some(tag) => {
                        return Ok(Some(TaggedData {
                            tag: tag.clone(),
                            data,
                        }))
                    }
                    None => warn!(?origin, len = data.len(), "dropping chunk from unknown sender"),
                },
            }
        }
    }

    /// Close every socket and remove the socket directory.
    ///
    /// Doesn't wait for reads in progress. Closing twice returns
    /// [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let inner = self.inner.take().ok_or(Error::Closed)?;
        debug!(dir = %inner.workdir.path().display(), "closing mux");
        inner.close()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn transport(&self) -> Result<Transport> {
        Ok(self.inner.as_ref().ok_or(Error::Closed)?.transport)
    }

    /// The directory holding this mux's sockets.
    pub fn dir(&self) -> Result<&Path> {
        Ok(self.inner.as_ref().ok_or(Error::Closed)?.workdir.path())
    }
}

impl<T> Drop for Mux<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(err) = inner.close() {
                warn!(error = %err, "failed to clean up mux");
            }
        }
    }
}

impl<T: Clone + Eq + Hash> Inner<T> {
    fn register(&mut self, tag: T) -> Result<()> {
        let local = self.registry.next_path(self.workdir.path());
        let (fd, accepted) =
            registry::handshake(self.transport, self.acceptor.as_mut(), &local, &self.recv_path)?;
        debug!(path = %local.display(), "connected sender");
        let index = self.registry.insert(tag, local, fd);
        if let Some(stream) = accepted {
            self.fanin
                .add(Source::Stream(stream, index), self.buffer_size)?;
        }
        Ok(())
    }
}

impl<T> Inner<T> {
    fn close(self) -> std::io::Result<()> {
        let Inner {
            workdir,
            recv_path,
            acceptor,
            fanin,
            registry,
            ..
        } = self;
        drop(fanin);
        drop(acceptor);
        let mut sockets = registry.into_paths();
        sockets.push(recv_path);
        workdir.remove(&sockets)
    }
}

/// Configures a [`Mux`] before its receive socket is bound.
pub struct Builder<T> {
    transport: Transport,
    dir: Option<PathBuf>,
    deadline: Duration,
    buffer_size: Option<usize>,
    _tag: PhantomData<fn() -> T>,
}

impl<T: Clone + Eq + Hash> Builder<T> {
    pub fn new() -> Self {
        Self {
            transport: Transport::platform_default(),
            dir: None,
            deadline: DEFAULT_DEADLINE,
            buffer_size: None,
            _tag: PhantomData,
        }
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Put the sockets in `dir` instead of a fresh temporary directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// How long a single connection read waits; also how long every
    /// connection must stay quiet after cancellation before end of stream.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Override the transport's per-connection read buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Create the socket directory and bind the receive socket.
    pub fn build(self) -> Result<Mux<T>> {
        let workdir = Workdir::create(self.dir)?;
        let recv_path = workdir.path().join(RECV_SOCKET);
        let buffer_size = self
            .buffer_size
            .unwrap_or_else(|| self.transport.buffer_size());
        let mut fanin = FanIn::new(self.deadline)?;
        let acceptor = match transport::bind(self.transport, &recv_path, self.deadline)? {
            Receiver::Datagram(sock) => {
                fanin.add(Source::Datagram(sock), buffer_size)?;
                None
            }
            Receiver::Listener(acceptor) => Some(acceptor),
        };
        Ok(Mux {
            inner: Some(Inner {
                transport: self.transport,
                workdir,
                recv_path,
                acceptor,
                fanin,
                registry: Registry::new(),
                buffer_size,
            }),
        })
    }
}

impl<T: Clone + Eq + Hash> Default for Builder<T> {
    fn default() -> Self {
        Self::new()
    }
}
