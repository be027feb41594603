//! Multiplex several OS-level writers into one ordered stream of tagged chunks.
//!
//! Every tag registered with a [`Mux`] gets its own unix domain socket whose
//! sending end is handed out as a plain [`std::fs::File`], ready to become a
//! child process's stdout or stderr. The mux owns the receiving end and reads
//! chunks back in the order they were produced, as closely as the chosen
//! [`Transport`] allows.
//!
//! ```no_run
//! use std::process::{Command, Stdio};
//! use iomux_core::Mux;
//!
//! # fn main() -> iomux_core::Result<()> {
//! let mut mux = Mux::new()?;
//! let stdout = mux.tag("stdout")?;
//! let stderr = mux.tag("stderr")?;
//! let mut cmd = Command::new("sh");
//! cmd.args(["-c", "echo out1 && echo err1 1>&2 && echo out2"])
//!     .stdout(Stdio::from(stdout))
//!     .stderr(Stdio::from(stderr));
//! let (chunks, status) = mux.read_while(move || cmd.status())?;
//! for chunk in chunks {
//!     print!("{}: {}", chunk.tag, String::from_utf8_lossy(&chunk.data));
//! }
//! # let _ = status;
//! # Ok(())
//! # }
//! ```
pub mod error;
pub(crate) mod mux;

pub use error::{Error, Result};
pub use mux::session::Scope;
pub use mux::transport::Transport;
pub use mux::{Builder, Mux, TaggedData, DEFAULT_DEADLINE};
