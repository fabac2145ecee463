//! Scoped ownership of temporary files

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Temporary file that is deleted when this guard goes out of scope
///
/// The guard may be created before the file itself, so that partially written
/// files are cleaned up as well. Failure to delete the file is logged and
/// otherwise ignored.
#[derive(Debug)]
pub struct TempFile(PathBuf);
//
impl TempFile {
    /// Take ownership of a (possibly not yet existing) file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.0
    }
}
//
impl Drop for TempFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => log::debug!("Deleted temporary file {}", self.0.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to delete temporary file {}: {e}", self.0.display()),
        }
    }
}
