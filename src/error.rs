//! Error types for the package engine.
//!
//! Extraction and packaging failures never leave a session partially
//! mutated: callers either get the prior consistent state or no session
//! at all. Watch failures live in [`crate::watcher::WatchError`] and are
//! non-fatal.

use std::path::PathBuf;
use thiserror::Error;

/// Errors opening a container. Fatal to `open`; no session is created.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Cannot read container {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container {path} is not a readable ZIP archive: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Failed to create temp mirror directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("Failed to materialize entry {entry}: {source}")]
    Materialize {
        entry: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors looking up sessions or entries. Recoverable; the caller decides.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("No open session for {0}")]
    SessionNotFound(PathBuf),

    #[error("No entry named {entry} in {path}")]
    NotFound { path: PathBuf, entry: String },
}

/// Errors from the atomic save path.
///
/// Every variant except [`SaveError::RestoreFailed`] means the original
/// container was left (or restored) byte-identical to its pre-save state
/// and the modified set is untouched, so a retry is safe.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("No open session for {0}")]
    SessionNotFound(PathBuf),

    #[error("Failed to back up {path} before saving: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to repackage {path}: {details} (original untouched)")]
    Package { path: PathBuf, details: String },

    #[error("Failed to replace {path} with the repackaged archive: {source} (original restored)")]
    Replace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worst outcome: the save failed and the backup could not be
    /// copied back. The container on disk may be missing or truncated.
    #[error(
        "Save of {path} failed ({save_error}) and restoring the backup also failed ({restore_error}); the container may be corrupted, a .backup copy may remain next to it"
    )]
    RestoreFailed {
        path: PathBuf,
        save_error: String,
        restore_error: String,
    },
}
