//! Step lifecycle notifications

use crate::error::GantryError;
use crate::exec::{ExitStatus, VersionInfo};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Shared, cloneable output sink
///
/// Clones write to the same underlying writer; [`Sink::same_as`] tells
/// whether two sinks are clones of one another.
#[derive(Clone)]
pub struct Sink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    /// Wrap a writer
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink writing to the process's stdout
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Sink writing to the process's stderr
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Sink discarding everything
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// Write all bytes and flush
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(buf)?;
        writer.flush()
    }

    /// Write one line, appending a newline
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Whether both sinks share the same writer
    pub fn same_as(&self, other: &Sink) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("writer", &Arc::as_ptr(&self.writer))
            .finish()
    }
}

/// Receiver of a get step's lifecycle notifications
///
/// Callbacks are invoked synchronously from within the running step, before
/// its process completes. Exactly one of `completed` or `failed` fires per run.
pub trait GetDelegate: Send + Sync {
    /// Sink for the fetch's standard output and informational messages
    fn stdout(&self) -> Sink;

    /// Sink for the fetch's standard error
    fn stderr(&self) -> Sink;

    /// The step finished; `info` is absent when the resource script failed
    fn completed(&self, status: ExitStatus, info: Option<&VersionInfo>);

    /// The step failed with an infrastructure error
    fn failed(&self, err: &GantryError);
}
