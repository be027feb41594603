use std::{
    io::{self, stderr, stdout, LineWriter, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use console::Style;
pub use iomux_core::{Builder, Mux, Scope, TaggedData, Transport};
use thiserror::Error;
use tracing::debug;

/// Which of a child's output streams a chunk was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTag {
    Stdout,
    Stderr,
}

pub trait CaptureHook {
    fn before_spawn(&mut self, _command: &Command) -> io::Result<()> {
        Ok(())
    }

    /// Called for every chunk once the child has finished, in capture order.
    fn on_chunk(&mut self, _chunk: &TaggedData<OutputTag>) -> io::Result<()> {
        Ok(())
    }
}

/// Runs commands with stdout and stderr captured through one [`Mux`].
pub struct Capture {
    mux: Mux<OutputTag>,
    hooks: Vec<Box<dyn CaptureHook>>,
    lines: bool,
}

impl Capture {
    /// Capture over the platform's default transport.
    pub fn new() -> Result<Self> {
        Ok(Self::with_mux(Mux::new()?))
    }

    pub fn with_mux(mux: Mux<OutputTag>) -> Self {
        Capture {
            mux,
            hooks: Vec::new(),
            lines: false,
        }
    }

    pub fn add_hook<T: CaptureHook + 'static>(&mut self, hook: T) {
        self.hooks.push(Box::new(hook));
    }

    /// Rejoin lines split apart by connection oriented transports.
    pub fn line_buffered(&mut self, lines: bool) -> &mut Self {
        self.lines = lines;
        self
    }

    /// Run `cmd` to completion, capturing its stdout and stderr in the order
    /// they were written.
    ///
    /// A command that runs but exits unsuccessfully is not an error; check
    /// [`Captured::status`].
    pub fn run(&mut self, mut cmd: Command) -> Result<Captured> {
        let prog_path = PathBuf::from(cmd.get_program());
        cmd.stdout(Stdio::from(self.mux.tag(OutputTag::Stdout)?));
        cmd.stderr(Stdio::from(self.mux.tag(OutputTag::Stderr)?));

        for hook in self.hooks.iter_mut() {
            hook.before_spawn(&cmd)?;
        }

        debug!(program = %prog_path.display(), "running");
        let (chunks, status) = if self.lines {
            self.mux.read_lines_while(move || cmd.status())?
        } else {
            self.mux.read_while(move || cmd.status())?
        };
        let status = status.map_err(|source| Error::Spawn {
            prog_path: prog_path.clone(),
            source,
        })?;
        debug!(program = %prog_path.display(), %status, chunks = chunks.len(), "finished");

        for chunk in chunks.iter() {
            for hook in self.hooks.iter_mut() {
                hook.on_chunk(chunk)?;
            }
        }

        Ok(Captured {
            prog_path,
            chunks,
            status,
        })
    }

    /// Close the underlying mux, removing its sockets.
    pub fn close(mut self) -> Result<()> {
        self.mux.close()?;
        Ok(())
    }
}

/// The output and exit status of one captured run.
#[derive(Debug)]
pub struct Captured {
    prog_path: PathBuf,
    pub chunks: Vec<TaggedData<OutputTag>>,
    pub status: ExitStatus,
}

impl Captured {
    pub fn program(&self) -> &Path {
        &self.prog_path
    }

    /// Everything written to stdout.
    pub fn stdout(&self) -> Vec<u8> {
        self.collect(OutputTag::Stdout)
    }

    /// Everything written to stderr.
    pub fn stderr(&self) -> Vec<u8> {
        self.collect(OutputTag::Stderr)
    }

    fn collect(&self, tag: OutputTag) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.tag == tag)
            .flat_map(|chunk| chunk.data.iter().copied())
            .collect()
    }

    /// Write every chunk back out to `stdout` or `stderr`, in capture order.
    pub fn replay<O: Write, E: Write>(&self, stdout: &mut O, stderr: &mut E) -> io::Result<()> {
        for chunk in self.chunks.iter() {
            match chunk.tag {
                OutputTag::Stdout => stdout.write_all(&chunk.data)?,
                OutputTag::Stderr => stderr.write_all(&chunk.data)?,
            }
        }
        stdout.flush()?;
        stderr.flush()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Mux(#[from] iomux_core::Error),
    #[error("failed to run {}: {source}", .prog_path.display())]
    Spawn {
        prog_path: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<A> = std::result::Result<A, Error>;

/// A hook forwarding captured output to the terminal.
pub struct PrintInfo<Stdout: Write, Stderr: Write> {
    pub stdout: Stdout,
    pub stderr: Stderr,
    pub info_style: Style,
    pub stdout_style: Style,
    pub stderr_style: Style,
}

impl PrintInfo<LineWriter<io::Stdout>, LineWriter<io::Stderr>> {
    pub fn new() -> Self {
        Self::with_writers(LineWriter::new(stdout()), LineWriter::new(stderr()))
    }
}

impl Default for PrintInfo<LineWriter<io::Stdout>, LineWriter<io::Stderr>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Stdout: Write, Stderr: Write> PrintInfo<Stdout, Stderr> {
    /// Stderr is highlighted in red.
    pub fn with_writers(stdout: Stdout, stderr: Stderr) -> Self {
        Self {
            stdout,
            stderr,
            info_style: Style::new().green(),
            stdout_style: Style::new().white(),
            stderr_style: Style::new().red(),
        }
    }
}

impl<Stdout: Write, Stderr: Write> CaptureHook for PrintInfo<Stdout, Stderr> {
    fn before_spawn(&mut self, cmd: &Command) -> io::Result<()> {
        let prog_path: &Path = Path::new(cmd.get_program());
        writeln!(
            &mut self.stdout,
            "{} {}{}",
            self.info_style.apply_to("[Running"),
            self.info_style.apply_to(prog_path.display()),
            self.info_style.apply_to("]")
        )
    }

    fn on_chunk(&mut self, chunk: &TaggedData<OutputTag>) -> io::Result<()> {
        let text = String::from_utf8_lossy(&chunk.data);
        match chunk.tag {
            OutputTag::Stdout => write!(&mut self.stdout, "{}", self.stdout_style.apply_to(text)),
            OutputTag::Stderr => write!(&mut self.stderr, "{}", self.stderr_style.apply_to(text)),
        }
    }
}
