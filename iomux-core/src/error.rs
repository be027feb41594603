use std::{io, path::PathBuf};

use thiserror::Error;

/// Result type alias using the mux [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a [`Mux`](crate::Mux).
#[derive(Debug, Error)]
pub enum Error {
    /// Every operation after [`Mux::close`](crate::Mux::close) returns this.
    #[error("mux has been closed")]
    Closed,

    /// `read` was called before any tag was registered.
    #[error("no senders have been connected")]
    NoConnections,

    /// No sender connected within the accept deadline while registering a tag.
    #[error("timed out waiting for sender {} to connect", .0.display())]
    AcceptTimeout(PathBuf),

    /// The accepted connection did not come from the sender that was dialed.
    #[error("expected a connection from {}, accepted one from {accepted:?}", .expected.display())]
    UnexpectedPeer {
        expected: PathBuf,
        accepted: Option<PathBuf>,
    },

    /// Transport errors other than an expired deadline, unmodified.
    #[error(transparent)]
    Io(#[from] io::Error),
}
