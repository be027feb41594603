use std::{
    collections::HashMap,
    fs::File,
    hash::Hash,
    io::{self, ErrorKind},
    os::fd::OwnedFd,
    panic,
    path::{Path, PathBuf},
    thread,
};

use mio::net::UnixStream;

use super::fanin::Origin;
use super::transport::{self, Acceptor, Transport};
use crate::Result;

/// The sending end of one tag's connection.
#[derive(Debug)]
struct Sender<T> {
    tag: T,
    path: PathBuf,
    fd: OwnedFd,
}

/// Maps tags to their sender and inbound chunks back to tags.
///
/// Append only: a tag keeps its sender for the lifetime of the mux.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    senders: Vec<Sender<T>>,
    by_tag: HashMap<T, usize>,
    by_path: HashMap<PathBuf, usize>,
}

impl<T: Clone + Eq + Hash> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Vec::new(),
            by_tag: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub(crate) fn contains(&self, tag: &T) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Path for the next sender, numbered from 1 in registration order.
    pub(crate) fn next_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("send_{}.sock", self.senders.len() + 1))
    }

    /// Record a connected sender and return its index.
    pub(crate) fn insert(&mut self, tag: T, path: PathBuf, fd: OwnedFd) -> usize {
        let index = self.senders.len();
        self.by_tag.insert(tag.clone(), index);
        self.by_path.insert(path.clone(), index);
        self.senders.push(Sender { tag, path, fd });
        index
    }

    /// A fresh writable handle for `tag`'s sender.
    pub(crate) fn handle(&self, tag: &T) -> io::Result<File> {
        let index = self
            .by_tag
            .get(tag)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "tag has no sender"))?;
        let fd = self.senders[*index].fd.try_clone()?;
        Ok(File::from(fd))
    }

    /// The tag a chunk came from, if it came from one of our senders.
    pub(crate) fn resolve(&self, origin: &Origin) -> Option<&T> {
        let index = match origin {
            Origin::Peer(Some(path)) => *self.by_path.get(path)?,
            Origin::Peer(None) => return None,
            Origin::Owner(index) => *index,
        };
        self.senders.get(index).map(|sender| &sender.tag)
    }
}

impl<T> Registry<T> {
    /// Close every sender, returning the socket paths they were bound to.
    pub(crate) fn into_paths(self) -> Vec<PathBuf> {
        self.senders.into_iter().map(|sender| sender.path).collect()
    }
}

/// Connect a new sender at `local` to the receiver at `remote`.
///
/// Accepting and dialing run at the same time: on connection oriented
/// transports each side can block until the other shows up.
pub(crate) fn handshake(
    transport: Transport,
    acceptor: Option<&mut Acceptor>,
    local: &Path,
    remote: &Path,
) -> Result<(OwnedFd, Option<UnixStream>)> {
    thread::scope(|s| {
        let accepting = acceptor.map(|acceptor| s.spawn(move || acceptor.accept(local)));
        let dialed = transport::dial(transport, local, remote);
        let accepted = match accepting {
            Some(handle) => Some(
                handle
                    .join()
                    .unwrap_or_else(|payload| panic::resume_unwind(payload))?,
            ),
            None => None,
        };
        Ok((dialed?, accepted))
    })
}
