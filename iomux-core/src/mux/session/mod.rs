use std::{
    hash::Hash,
    panic,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread,
};

use tracing::debug;

use super::{reassemble, Mux, TaggedData};
use crate::{Error, Result};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// A cancellation scope delimiting a read session.
///
/// Cancelling a scope doesn't interrupt a read. It lets reads under it finish
/// with end of stream once every connection has gone quiet. Each scope keeps
/// its own end of stream bookkeeping, so scopes never affect one another.
/// Clones share the same cancellation state. The bookkeeping is dropped along
/// with the last clone.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    id: u64,
    cancelled: AtomicBool,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn watch(&self) -> ScopeWatch {
        ScopeWatch(Arc::downgrade(&self.inner))
    }
}

/// Tells whether every clone of a scope has been dropped.
#[derive(Debug)]
pub(crate) struct ScopeWatch(Weak<ScopeInner>);

impl ScopeWatch {
    pub(crate) fn is_dropped(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels its scope when dropped, including while unwinding.
struct CancelOnDrop(Scope);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl<T: Clone + Eq + Hash> Mux<T> {
    /// Read until `scope` reaches end of stream.
    ///
    /// Consecutive chunks with the same tag are joined into one. Any error
    /// other than end of stream discards everything read so far.
    pub fn read_until(&mut self, scope: &Scope) -> Result<Vec<TaggedData<T>>> {
        let mut session: Vec<TaggedData<T>> = Vec::new();
        loop {
            let chunk = match self.read(scope) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    self.forget(scope);
                    return Err(err);
                }
            };
            match session.last_mut() {
                Some(previous) if previous.tag == chunk.tag => {
                    previous.data.extend_from_slice(&chunk.data)
                }
                _ => session.push(chunk),
            }
        }
        debug!(chunks = session.len(), "session finished");
        Ok(session)
    }

    /// Read while `op` runs on another thread.
    ///
    /// The session ends once `op` has returned and the senders have gone
    /// quiet. Returns what was read along with `op`'s own result, so output can
    /// be matched up with, say, a child's exit status. Doesn't return before
    /// `op` does, even when reading fails. If `op` panics, the panic resumes
    /// here once the session has ended.
    pub fn read_while<R, F>(&mut self, op: F) -> Result<(Vec<TaggedData<T>>, R)>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let scope = Scope::new();
        thread::scope(|s| {
            let cancel = CancelOnDrop(scope.clone());
            let running = s.spawn(move || {
                let _cancel = cancel;
                op()
            });
            let session = self.read_until(&scope);
            let outcome = running
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload));
            Ok((session?, outcome))
        })
    }

    /// Like [`Mux::read_until`], with lines split apart by a connection
    /// oriented transport put back together afterwards.
    ///
    /// Datagram sessions are returned as read.
    pub fn read_lines_until(&mut self, scope: &Scope) -> Result<Vec<TaggedData<T>>> {
        let session = self.read_until(scope)?;
        Ok(self.reassemble(session))
    }

    /// Like [`Mux::read_while`], with lines split apart by a connection
    /// oriented transport put back together afterwards.
    pub fn read_lines_while<R, F>(&mut self, op: F) -> Result<(Vec<TaggedData<T>>, R)>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let (session, outcome) = self.read_while(op)?;
        Ok((self.reassemble(session), outcome))
    }

    fn forget(&mut self, scope: &Scope) {
        if let Some(inner) = self.inner.as_mut() {
            inner.fanin.forget(scope);
        }
    }

    fn reassemble(&self, session: Vec<TaggedData<T>>) -> Vec<TaggedData<T>> {
        match &self.inner {
            Some(inner) if inner.transport.is_connection_oriented() => {
                reassemble::lines(session, inner.registry.len())
            }
            _ => session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_distinct() {
        let a = Scope::new();
        let b = Scope::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn clones_share_cancellation() {
        let scope = Scope::new();
        let clone = scope.clone();
        assert!(!scope.is_cancelled());
        clone.cancel();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn cancel_on_drop_survives_a_panic() {
        let scope = Scope::new();
        let guard = CancelOnDrop(scope.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("op failed");
        }));
        assert!(result.is_err());
        assert!(scope.is_cancelled());
    }

    #[test]
    fn watch_sees_the_last_clone_dropped() {
        let scope = Scope::new();
        let clone = scope.clone();
        let watch = scope.watch();
        drop(scope);
        assert!(!watch.is_dropped());
        drop(clone);
        assert!(watch.is_dropped());
    }
}
