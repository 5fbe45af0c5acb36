//! Re-readable capture of a request body.
//!
//! # Responsibilities
//! - Drain an inbound byte stream exactly once
//! - Keep it in memory or in a scratch file depending on its declared size
//! - Hand out any number of independent cursors starting at offset zero
//! - Release the scratch area when the request is done

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::body::scratch::ScratchArea;

/// Default size below which a body with a known length is kept in memory.
pub const DEFAULT_MEMORY_THRESHOLD: u64 = 1024 * 1024;

/// Name of the file holding a disk-backed body inside its scratch area.
const BODY_FILE: &str = "body";

/// An owned, readable cursor over a captured body.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while capturing a body.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The body did not carry the number of bytes its headers announced.
    #[error("declared content length {declared} but received {received} bytes")]
    LengthMismatch { declared: u64, received: u64 },

    /// The inbound stream failed mid-read.
    #[error("failed to read request body: {0}")]
    Read(#[source] BoxError),

    /// The body could not be written to (or read back from) local storage.
    #[error("failed to save request body: {0}")]
    Io(#[from] io::Error),
}

enum Backing {
    Memory(Bytes),
    Disk { scratch: ScratchArea, path: PathBuf },
}

/// A captured request body.
///
/// Content is immutable once captured. Disk-backed stores remove their
/// scratch area on [`BodyStore::release`], or on drop if release is skipped.
pub struct BodyStore {
    backing: Backing,
    content_length: u64,
}

impl BodyStore {
    /// Capture `input` using the OS temp dir for disk spillover.
    pub async fn capture<S, E>(
        input: S,
        declared_length: Option<u64>,
        memory_threshold: u64,
    ) -> Result<Self, CaptureError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<BoxError>,
    {
        Self::capture_in(None, input, declared_length, memory_threshold).await
    }

    /// Capture `input`, spilling to a scratch area below `scratch_root`.
    ///
    /// A declared length of zero, an unknown length, or one above
    /// `memory_threshold` goes to disk and records the bytes actually copied.
    /// Otherwise exactly `declared_length` bytes must be available.
    pub async fn capture_in<S, E>(
        scratch_root: Option<&Path>,
        input: S,
        declared_length: Option<u64>,
        memory_threshold: u64,
    ) -> Result<Self, CaptureError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<BoxError>,
    {
        let input = std::pin::pin!(input);
        match declared_length {
            Some(declared) if declared > 0 && declared <= memory_threshold => {
                let bytes = read_exact(input, declared).await?;
                Ok(Self {
                    content_length: declared,
                    backing: Backing::Memory(bytes),
                })
            }
            _ => {
                let scratch = ScratchArea::new(scratch_root)?;
                let path = scratch.file_path(BODY_FILE);
                let content_length = copy_to_file(input, &path).await?;
                tracing::debug!(
                    path = %path.display(),
                    bytes = content_length,
                    "Request body saved to scratch file"
                );
                Ok(Self {
                    content_length,
                    backing: Backing::Disk { scratch, path },
                })
            }
        }
    }

    /// Number of bytes captured.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Whether the body spilled to a scratch file.
    pub fn is_disk_backed(&self) -> bool {
        matches!(self.backing, Backing::Disk { .. })
    }

    /// Open a fresh cursor positioned at the start of the body.
    pub async fn open_cursor(&self) -> io::Result<BodyStream> {
        match &self.backing {
            Backing::Memory(bytes) => {
                let bytes = bytes.clone();
                Ok(stream::once(async move { Ok(bytes) }).boxed())
            }
            Backing::Disk { path, .. } => {
                let file = File::open(path).await?;
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }

    /// Release the backing storage. A no-op for memory-backed bodies.
    pub fn release(self) -> io::Result<()> {
        match self.backing {
            Backing::Memory(_) => Ok(()),
            Backing::Disk { scratch, .. } => scratch.cleanup(),
        }
    }
}

impl std::fmt::Debug for BodyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStore")
            .field("content_length", &self.content_length)
            .field("disk_backed", &self.is_disk_backed())
            .finish()
    }
}

async fn read_exact<S, E>(mut input: S, declared: u64) -> Result<Bytes, CaptureError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    let mut buffer = BytesMut::with_capacity(declared as usize);
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(|e| CaptureError::Read(e.into()))?;
        let received = (buffer.len() + chunk.len()) as u64;
        if received > declared {
            return Err(CaptureError::LengthMismatch { declared, received });
        }
        buffer.extend_from_slice(&chunk);
    }

    let received = buffer.len() as u64;
    if received != declared {
        return Err(CaptureError::LengthMismatch { declared, received });
    }
    Ok(buffer.freeze())
}

async fn copy_to_file<S, E>(mut input: S, path: &Path) -> Result<u64, CaptureError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    let mut file = File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = input.next().await {
        let chunk = chunk.map_err(|e| CaptureError::Read(e.into()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
