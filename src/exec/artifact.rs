//! Artifact sources and tar streaming
//!
//! An artifact is a step's output filesystem, exchanged as a tar stream.
//! Whole trees go through [`ArtifactSource::stream_to`]; single files are
//! pulled out of a scoped archive by scanning headers until the first entry,
//! without buffering the archive.

use crate::error::{GantryError, GantryResult};
use crate::resource::VersionedSource;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tracing::debug;

/// Tar header and padding block size
const BLOCK_SIZE: u64 = 512;

/// Readable byte stream that must be closed when the reader is done
pub trait ByteStream: AsyncRead + Send + Unpin {
    /// Release the stream's resources
    fn close(&mut self) -> io::Result<()>;
}

impl<T: ByteStream + ?Sized> ByteStream for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// In-memory byte stream
#[derive(Debug)]
pub struct MemoryStream {
    cursor: io::Cursor<Vec<u8>>,
    closed: bool,
}

impl MemoryStream {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            cursor: io::Cursor::new(bytes),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read from closed stream",
            )));
        }
        Pin::new(&mut self.cursor).poll_read(cx, buf)
    }
}

impl ByteStream for MemoryStream {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Reader over a single archive entry
///
/// Closing it closes the archive stream it was cut from, exactly once.
pub struct FileStream {
    inner: Take<Box<dyn ByteStream>>,
    closed: bool,
}

impl FileStream {
    fn new(archive: Box<dyn ByteStream>, size: u64) -> Self {
        Self {
            inner: archive.take(size),
            closed: false,
        }
    }

    /// Bytes left in the entry
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl AsyncRead for FileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl ByteStream for FileStream {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.get_mut().close()
    }
}

/// Read one header block; `Ok(false)` on a clean end of stream
async fn read_block(stream: &mut Box<dyn ByteStream>, block: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < block.len() {
        let n = stream.read(&mut block[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated tar header",
            ));
        }
        filled += n;
    }
    Ok(true)
}

fn padded(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Cut the first entry out of a tar stream
///
/// PAX and GNU long-name records are skipped. An archive with no entries
/// yields `FileNotFound` for `path`, after closing the stream.
pub async fn first_entry(mut archive: Box<dyn ByteStream>, path: &str) -> GantryResult<FileStream> {
    let mut block = [0u8; BLOCK_SIZE as usize];

    loop {
        let found = match read_block(&mut archive, &mut block).await {
            Ok(found) => found && block.iter().any(|b| *b != 0),
            Err(e) => {
                let _ = archive.close();
                return Err(GantryError::Stream(e.to_string()));
            }
        };

        if !found {
            let _ = archive.close();
            return Err(GantryError::FileNotFound {
                path: path.to_string(),
            });
        }

        let mut header = tar::Header::new_old();
        header.as_mut_bytes().copy_from_slice(&block);

        let size = match header.entry_size() {
            Ok(size) => size,
            Err(e) => {
                let _ = archive.close();
                return Err(GantryError::Stream(format!("invalid tar header: {}", e)));
            }
        };

        match header.entry_type() {
            tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
            | tar::EntryType::GNULongName
            | tar::EntryType::GNULongLink => {
                let mut skip = (&mut archive).take(padded(size));
                if let Err(e) = tokio::io::copy(&mut skip, &mut tokio::io::sink()).await {
                    let _ = archive.close();
                    return Err(GantryError::Stream(e.to_string()));
                }
            }
            _ => {
                debug!("Streaming {} bytes of {}", size, path);
                return Ok(FileStream::new(archive, size));
            }
        }
    }
}

/// A step output that can be streamed elsewhere
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Stream the whole output into `destination` at its root
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> GantryResult<()>;

    /// Stream a single file out of the output
    async fn stream_file(&self, path: &str) -> GantryResult<Box<dyn ByteStream>>;
}

/// Something that can ingest a tar stream
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    /// Unpack `source` under `path`
    async fn stream_in(&self, path: &str, source: Box<dyn ByteStream>) -> GantryResult<()>;
}

/// Artifact backed by a fetched resource
pub struct VersionedArtifact {
    source: Arc<dyn VersionedSource>,
}

impl VersionedArtifact {
    pub fn new(source: Arc<dyn VersionedSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ArtifactSource for VersionedArtifact {
    async fn stream_to(&self, destination: &dyn ArtifactDestination) -> GantryResult<()> {
        let out = self.source.stream_out(".").await?;
        destination.stream_in(".", out).await
    }

    async fn stream_file(&self, path: &str) -> GantryResult<Box<dyn ByteStream>> {
        let archive = self.source.stream_out(path).await?;
        let file = first_entry(archive, path).await?;
        Ok(Box::new(file))
    }
}

/// Read a stream to the end and close it
pub async fn read_all(mut stream: Box<dyn ByteStream>) -> GantryResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let read = stream.read_to_end(&mut bytes).await;
    let closed = stream.close();
    read.map_err(|e| GantryError::Stream(e.to_string()))?;
    closed.map_err(|e| GantryError::Stream(e.to_string()))?;
    Ok(bytes)
}
