use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
    time::{Duration, Instant},
};

use mio::{
    event::Source as _,
    net::{UnixDatagram, UnixStream},
    Events, Interest, Poll, Token,
};
use slab::Slab;
use tracing::{debug, trace, warn};

use super::session::{Scope, ScopeWatch};
use super::transport::socket;

/// First wait of a read that finds nothing ready; doubles up to the deadline.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// A receive connection.
#[derive(Debug)]
pub(crate) enum Source {
    /// The shared datagram socket; each message carries its sender's address.
    Datagram(UnixDatagram),
    /// An accepted connection owned by the sender with this index.
    Stream(UnixStream, usize),
}

impl AsRawFd for Source {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Source::Datagram(sock) => sock.as_raw_fd(),
            Source::Stream(stream, _) => stream.as_raw_fd(),
        }
    }
}

/// Where a chunk came from, before it is resolved to a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    /// The address a datagram was sent from.
    Peer(Option<PathBuf>),
    /// The index of the sender owning the connection.
    Owner(usize),
}

pub(crate) enum Next {
    Chunk(Vec<u8>, Origin),
    End,
}

#[derive(Debug)]
struct Endpoint {
    source: Source,
    buf: Vec<u8>,
    // Readiness is edge triggered, so remember it until a read would block.
    readable: bool,
}

impl Endpoint {
    /// Read one chunk if one is available without blocking.
    ///
    /// A message too large for the buffer is consumed and reported as
    /// `InvalidData`; its tail is already lost.
    fn read_chunk(&mut self) -> io::Result<Option<(Vec<u8>, Origin)>> {
        loop {
            let received = match socket::recv(self.source.as_raw_fd(), &mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.readable = false;
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if received.truncated {
                warn!(buffer_size = self.buf.len(), "message larger than the read buffer");
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "message truncated to the {} byte read buffer",
                        self.buf.len()
                    ),
                ));
            }
            let origin = match (&self.source, received.len) {
                (Source::Stream(_, owner), 0) => {
                    // hung up, nothing more will arrive
                    trace!(owner, "connection closed by sender");
                    self.readable = false;
                    return Ok(None);
                }
                // an empty datagram carries nothing worth reporting
                (Source::Datagram(_), 0) => continue,
                (Source::Stream(_, owner), _) => Origin::Owner(*owner),
                (Source::Datagram(_), _) => Origin::Peer(received.peer),
            };
            return Ok(Some((self.buf[..received.len].to_vec(), origin)));
        }
    }

    fn register(&mut self, registry: &mio::Registry, token: Token) -> io::Result<()> {
        match &mut self.source {
            Source::Datagram(sock) => sock.register(registry, token, Interest::READABLE),
            Source::Stream(stream, _) => stream.register(registry, token, Interest::READABLE),
        }
    }
}

/// Per scope, per connection progress towards end of stream.
#[derive(Debug, Default)]
struct Quiet {
    /// When this connection was first seen silent after the scope was cancelled.
    since: Option<Instant>,
    eof: bool,
}

/// Capped doubling wait between polls.
#[derive(Debug)]
struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(cap: Duration) -> Self {
        Self {
            next: INITIAL_BACKOFF.min(cap),
            cap,
        }
    }

    fn next(&mut self) -> Duration {
        let wait = self.next;
        self.next = (self.next * 2).min(self.cap);
        wait
    }
}

/// Reads from every receive connection through a single readiness poller.
///
/// A connection is only ever read from inside [`FanIn::next`], one chunk at a
/// time, so there is never more than one read in flight per connection.
pub(crate) struct FanIn {
    poll: Poll,
    events: Events,
    endpoints: Slab<Endpoint>,
    scopes: HashMap<(u64, usize), Quiet>,
    // scopes with state above, so it can go once a scope is dropped
    watched: HashMap<u64, ScopeWatch>,
    // where the next scan starts, one past the connection read from last
    cursor: usize,
    deadline: Duration,
}

impl FanIn {
    pub(crate) fn new(deadline: Duration) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            endpoints: Slab::new(),
            scopes: HashMap::new(),
            watched: HashMap::new(),
            cursor: 0,
            deadline,
        })
    }

    pub(crate) fn add(&mut self, source: Source, buffer_size: usize) -> io::Result<()> {
        let entry = self.endpoints.vacant_entry();
        let mut endpoint = Endpoint {
            source,
            buf: vec![0; buffer_size],
            // data may have arrived before registration
            readable: true,
        };
        endpoint.register(self.poll.registry(), Token(entry.key()))?;
        debug!(connection = entry.key(), buffer_size, "registered receive connection");
        entry.insert(endpoint);
        Ok(())
    }

    /// The next chunk from any connection, or [`Next::End`] once `scope` is
    /// cancelled and every connection has stayed silent for a full deadline.
    pub(crate) fn next(&mut self, scope: &Scope) -> io::Result<Next> {
        self.forget_dropped();
        self.watched
            .entry(scope.id())
            .or_insert_with(|| scope.watch());
        let mut backoff = Backoff::new(self.deadline);
        loop {
            if let Some((data, origin)) = self.read_ready(scope)? {
                return Ok(Next::Chunk(data, origin));
            }
            if scope.is_cancelled() && self.drained(scope) {
                self.forget(scope);
                debug!(scope = scope.id(), "end of stream");
                return Ok(Next::End);
            }
            self.wait(backoff.next())?;
        }
    }

    /// Drop everything kept for `scope`.
    pub(crate) fn forget(&mut self, scope: &Scope) {
        let id = scope.id();
        self.watched.remove(&id);
        self.scopes.retain(|(scope, _), _| *scope != id);
    }

    fn forget_dropped(&mut self) {
        let before = self.watched.len();
        self.watched.retain(|_, watch| !watch.is_dropped());
        if self.watched.len() != before {
            let watched = &self.watched;
            self.scopes.retain(|(scope, _), _| watched.contains_key(scope));
            trace!(scopes = watched.len(), "forgot dropped scopes");
        }
    }

    /// Read from the first ready connection, scanning round robin so a busy
    /// connection can't starve the others.
    fn read_ready(&mut self, scope: &Scope) -> io::Result<Option<(Vec<u8>, Origin)>> {
        let n = self.endpoints.len();
        for i in 0..n {
            let key = (self.cursor + i) % n;
            let quiet = self.scopes.entry((scope.id(), key)).or_default();
            if quiet.eof {
                continue;
            }
            let endpoint = &mut self.endpoints[key];
            if !endpoint.readable {
                continue;
            }
            if let Some((data, origin)) = endpoint.read_chunk()? {
                quiet.since = None;
                self.cursor = (key + 1) % n;
                trace!(connection = key, len = data.len(), "read chunk");
                return Ok(Some((data, origin)));
            }
        }
        Ok(None)
    }

    /// Whether every connection has been silent for a deadline since `scope`
    /// was cancelled.
    fn drained(&mut self, scope: &Scope) -> bool {
        let now = Instant::now();
        let mut drained = true;
        for key in 0..self.endpoints.len() {
            let quiet = self.scopes.entry((scope.id(), key)).or_default();
            if quiet.eof {
                continue;
            }
            let since = *quiet.since.get_or_insert(now);
            if now.duration_since(since) >= self.deadline {
                trace!(scope = scope.id(), connection = key, "connection drained");
                quiet.eof = true;
            } else {
                drained = false;
            }
        }
        drained
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            if let Some(endpoint) = self.endpoints.get_mut(event.token().0) {
                endpoint.readable = true;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn scope_entries(&self) -> usize {
        self.scopes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net as std_net;

    #[test]
    fn backoff_doubles_up_to_the_deadline() {
        let mut backoff = Backoff::new(Duration::from_millis(100));
        let waits: Vec<u64> = (0..10).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(waits, [1, 2, 4, 8, 16, 32, 64, 100, 100, 100]);
    }

    #[test]
    fn backoff_never_exceeds_a_tiny_deadline() {
        let mut backoff = Backoff::new(Duration::from_micros(500));
        assert_eq!(backoff.next(), Duration::from_micros(500));
        assert_eq!(backoff.next(), Duration::from_micros(500));
    }

    fn stream_pair(owner: usize) -> (Source, std_net::UnixStream) {
        let (ours, theirs) = std_net::UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (Source::Stream(UnixStream::from_std(ours), owner), theirs)
    }

    #[test]
    fn reads_from_every_connection_then_ends() {
        use std::io::Write;

        let mut fanin = FanIn::new(Duration::from_millis(20)).unwrap();
        let (a, mut a_writer) = stream_pair(0);
        let (b, mut b_writer) = stream_pair(1);
        fanin.add(a, 128).unwrap();
        fanin.add(b, 128).unwrap();

        let scope = Scope::new();
        a_writer.write_all(b"from a").unwrap();
        match fanin.next(&scope).unwrap() {
            Next::Chunk(data, origin) => {
                assert_eq!(data, b"from a");
                assert_eq!(origin, Origin::Owner(0));
            }
            Next::End => panic!("expected a chunk"),
        }
        b_writer.write_all(b"from b").unwrap();
        match fanin.next(&scope).unwrap() {
            Next::Chunk(data, origin) => {
                assert_eq!(data, b"from b");
                assert_eq!(origin, Origin::Owner(1));
            }
            Next::End => panic!("expected a chunk"),
        }

        scope.cancel();
        assert!(matches!(fanin.next(&scope).unwrap(), Next::End));
        assert_eq!(fanin.scope_entries(), 0);
    }

    fn datagram_pair() -> (Source, std_net::UnixDatagram) {
        let (ours, theirs) = std_net::UnixDatagram::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (Source::Datagram(UnixDatagram::from_std(ours)), theirs)
    }

    fn data(next: Next) -> Vec<u8> {
        match next {
            Next::Chunk(data, _) => data,
            Next::End => panic!("expected a chunk"),
        }
    }

    #[test]
    fn queued_connections_are_read_in_turn() {
        let mut fanin = FanIn::new(Duration::from_millis(20)).unwrap();
        let (a, a_writer) = datagram_pair();
        let (b, b_writer) = datagram_pair();
        fanin.add(a, 64).unwrap();
        fanin.add(b, 64).unwrap();

        a_writer.send(b"a1").unwrap();
        a_writer.send(b"a2").unwrap();
        a_writer.send(b"a3").unwrap();
        b_writer.send(b"b1").unwrap();

        let scope = Scope::new();
        let reads: Vec<Vec<u8>> = (0..4).map(|_| data(fanin.next(&scope).unwrap())).collect();
        assert_eq!(reads, [&b"a1"[..], b"b1", b"a2", b"a3"]);
    }

    #[test]
    fn dropped_scopes_are_forgotten() {
        let mut fanin = FanIn::new(Duration::from_millis(20)).unwrap();
        let (a, a_writer) = datagram_pair();
        let (b, _b_writer) = datagram_pair();
        fanin.add(a, 64).unwrap();
        fanin.add(b, 64).unwrap();

        for _ in 0..100 {
            a_writer.send(b"tick").unwrap();
            // never cancelled, dropped right after the read
            let scope = Scope::new();
            assert_eq!(data(fanin.next(&scope).unwrap()), b"tick");
        }
        // only the last scope's entries, one per connection
        assert!(fanin.scope_entries() <= 2);

        let kept = Scope::new();
        a_writer.send(b"tick").unwrap();
        fanin.next(&kept).unwrap();
        fanin.forget(&kept);
        assert_eq!(fanin.scope_entries(), 0);
    }

    #[test]
    fn oversized_messages_are_an_error() {
        let mut fanin = FanIn::new(Duration::from_millis(20)).unwrap();
        let (a, a_writer) = datagram_pair();
        fanin.add(a, 8).unwrap();

        a_writer.send(b"longer than eight").unwrap();
        a_writer.send(b"fits").unwrap();
        let scope = Scope::new();
        let err = fanin.next(&scope).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(data(fanin.next(&scope).unwrap()), b"fits");
    }

    #[test]
    fn cancelled_scope_waits_for_a_full_deadline_of_silence() {
        let deadline = Duration::from_millis(50);
        let mut fanin = FanIn::new(deadline).unwrap();
        let (a, _a_writer) = stream_pair(0);
        fanin.add(a, 128).unwrap();

        let scope = Scope::new();
        scope.cancel();
        let started = Instant::now();
        assert!(matches!(fanin.next(&scope).unwrap(), Next::End));
        assert!(started.elapsed() >= deadline);
    }
}
