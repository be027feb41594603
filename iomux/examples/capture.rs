//! Run a shell command, capture its output in order, then replay it with
//! stderr highlighted.
//!
//! ```text
//! cargo run -p iomux --example capture -- 'echo out1 && echo err1 1>&2 && echo out2'
//! ```
use std::{
    env,
    process::{exit, Command},
};

use iomux::{Capture, PrintInfo};
use tracing_subscriber::EnvFilter;

fn main() -> iomux::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let script = env::args()
        .nth(1)
        .unwrap_or_else(|| "echo out1 && echo err1 1>&2 && echo out2".to_string());
    let mut cmd = Command::new("sh");
    cmd.args(["-c", &script]);

    let mut capture = Capture::new()?;
    capture.line_buffered(true).add_hook(PrintInfo::new());
    let captured = capture.run(cmd)?;
    capture.close()?;

    if let Some(code) = captured.status.code() {
        exit(code);
    }
    Ok(())
}
