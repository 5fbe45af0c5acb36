//! Scratch directories for disk-backed captures.
//!
//! # Responsibilities
//! - Create a uniquely named temporary directory per capture
//! - Hand out paths for files inside it
//! - Remove the whole directory on cleanup (or on drop)

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Prefix of every scratch directory name.
pub const SCRATCH_PREFIX: &str = "clammit";

/// A private temporary directory, removed with all its contents when
/// cleaned up or dropped.
#[derive(Debug)]
pub struct ScratchArea {
    dir: TempDir,
}

impl ScratchArea {
    /// Create a scratch area below `root`, or below the OS temp dir.
    pub fn new(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        tracing::trace!(path = %dir.path().display(), "Scratch area created");
        Ok(Self { dir })
    }

    /// Directory backing this scratch area.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file named `name` inside the scratch area.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the scratch area, reporting any failure.
    pub fn cleanup(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::trace!(path = %path.display(), "Scratch area removed");
        Ok(())
    }
}
