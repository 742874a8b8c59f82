//! Per-container session state.
//!
//! One [`PackageSession`] exists per opened container. All mutation goes
//! through the single `tokio::sync::Mutex` around [`SessionState`], which
//! serializes sync-backs, saves and reloads for the session; waiters
//! queue, so a reload requested mid-save applies after the save.
//!
//! Invariants maintained by the mutators:
//! - every key of `temp_files` is a key of `entries`
//! - `modified` is a subset of `entries`' key set
//! - the temp mirror directory is exclusive to this session

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempDir;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::OpenError;
use crate::extract::{self, Extracted};

/// Handle to one opened container. Cheap to clone via `Arc`.
pub struct PackageSession {
    /// Canonicalized container path; the session's identity key.
    pub(crate) original_path: PathBuf,
    pub(crate) state: Mutex<SessionState>,
}

impl PackageSession {
    /// The canonical path of the container this session virtualizes.
    pub fn path(&self) -> &Path {
        &self.original_path
    }
}

/// The authoritative in-memory image of the container plus the
/// materialized temp-file bookkeeping.
pub struct SessionState {
    pub(crate) original_path: PathBuf,
    /// `Some` while the session is open; taken on close.
    temp_dir: Option<TempDir>,
    /// internal path -> uncompressed bytes, for every file entry.
    pub(crate) entries: HashMap<String, Vec<u8>>,
    /// Materialized subset: internal path -> temp file path.
    pub(crate) temp_files: HashMap<String, PathBuf>,
    /// Reverse map for routing watcher events.
    temp_lookup: HashMap<PathBuf, String>,
    /// Entries whose in-memory bytes differ from the last durable save.
    pub(crate) modified: HashSet<String>,
    /// Container mtime at the last point our view matched disk. Used to
    /// tell self-inflicted saves apart from external modification.
    pub(crate) last_known_mtime: SystemTime,
}

impl SessionState {
    pub(crate) fn new(
        original_path: PathBuf,
        temp_dir: TempDir,
        extracted: Extracted,
        mtime: SystemTime,
    ) -> Self {
        let temp_lookup = reverse_map(&extracted.temp_files);
        Self {
            original_path,
            temp_dir: Some(temp_dir),
            entries: extracted.entries,
            temp_files: extracted.temp_files,
            temp_lookup,
            modified: HashSet::new(),
            last_known_mtime: mtime,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.temp_dir.is_some()
    }

    pub(crate) fn take_temp_dir(&mut self) -> Option<TempDir> {
        self.temp_dir.take()
    }

    /// Internal path for a temp-file path, if it is one of ours.
    pub(crate) fn entry_for_temp(&self, temp_path: &Path) -> Option<&str> {
        self.temp_lookup.get(temp_path).map(String::as_str)
    }

    pub(crate) fn has_unsaved(&self) -> bool {
        !self.modified.is_empty()
    }

    pub(crate) fn list_modified(&self) -> Vec<String> {
        let mut list: Vec<String> = self.modified.iter().cloned().collect();
        list.sort();
        list
    }

    /// Re-read one materialized entry from disk and fold any divergence
    /// into `entries`/`modified`.
    ///
    /// Returns `Ok(true)` if the in-memory bytes changed. A byte-identical
    /// read is a no-op, which is what breaks save-triggered self-loops.
    pub(crate) fn fold_temp_file(&mut self, entry: &str) -> io::Result<bool> {
        let Some(temp_path) = self.temp_files.get(entry) else {
            return Ok(false);
        };
        let content = fs::read(temp_path)?;
        match self.entries.get(entry) {
            Some(current) if *current == content => Ok(false),
            Some(_) => {
                self.entries.insert(entry.to_string(), content);
                self.modified.insert(entry.to_string());
                Ok(true)
            }
            // temp_files ⊆ entries holds, but stay total regardless.
            None => {
                self.entries.insert(entry.to_string(), content);
                self.modified.insert(entry.to_string());
                Ok(true)
            }
        }
    }

    /// Fold every materialized entry whose on-disk content diverged.
    ///
    /// Closes the race where a very recent edit has not yet fired its
    /// debounced watcher when a save starts. Unreadable temp files are
    /// logged and skipped; the watch for them is degraded, not the save.
    pub(crate) fn flush_temp_files(&mut self) -> usize {
        let entries: Vec<String> = self.temp_files.keys().cloned().collect();
        let mut folded = 0;
        for entry in entries {
            match self.fold_temp_file(&entry) {
                Ok(true) => folded += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("[flush] cannot read temp file for {entry}: {e}");
                }
            }
        }
        folded
    }

    /// Replace the whole in-memory image with a fresh extraction of the
    /// container. Built off to the side and swapped in, so concurrent
    /// readers (queued on the state lock) see either the old or the new
    /// image, never a mix.
    pub(crate) fn reload(&mut self, config: &EngineConfig) -> Result<(), OpenError> {
        let temp_root = match &self.temp_dir {
            Some(dir) => dir.path().to_path_buf(),
            // Session already closed; nothing to reload into.
            None => return Ok(()),
        };

        // Drop the stale mirror files before re-materializing.
        for path in self.temp_files.values() {
            let _ = fs::remove_file(path);
        }

        let extracted = extract::extract_package(&self.original_path, &temp_root, config)?;
        let mtime = container_mtime(&self.original_path)?;

        self.temp_lookup = reverse_map(&extracted.temp_files);
        self.entries = extracted.entries;
        self.temp_files = extracted.temp_files;
        self.modified.clear();
        self.last_known_mtime = mtime;

        crate::log_event!(
            "session",
            "reloaded",
            "{} ({} entries)",
            self.original_path.display(),
            self.entries.len()
        );
        Ok(())
    }
}

pub(crate) fn container_mtime(path: &Path) -> Result<SystemTime, OpenError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| OpenError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

fn reverse_map(temp_files: &HashMap<String, PathBuf>) -> HashMap<PathBuf, String> {
    temp_files
        .iter()
        .map(|(entry, path)| (path.clone(), entry.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_entry(content: &[u8]) -> (SessionState, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let temp_path = temp_dir.path().join("doc.xml");
        fs::write(&temp_path, content).unwrap();

        let mut extracted = Extracted::default();
        extracted.entries.insert("doc.xml".to_string(), content.to_vec());
        extracted
            .temp_files
            .insert("doc.xml".to_string(), temp_path.clone());

        let state = SessionState::new(
            PathBuf::from("/nonexistent/test.docx"),
            temp_dir,
            extracted,
            SystemTime::now(),
        );
        (state, temp_path)
    }

    #[test]
    fn fold_is_noop_for_identical_content() {
        let (mut state, _path) = state_with_entry(b"<a/>");
        assert!(!state.fold_temp_file("doc.xml").unwrap());
        assert!(!state.has_unsaved());
    }

    #[test]
    fn fold_records_divergence() {
        let (mut state, path) = state_with_entry(b"<a/>");
        fs::write(&path, b"<b/>").unwrap();
        assert!(state.fold_temp_file("doc.xml").unwrap());
        assert_eq!(state.entries["doc.xml"], b"<b/>");
        assert_eq!(state.list_modified(), vec!["doc.xml".to_string()]);
        // Folding again with no further edits is a no-op.
        assert!(!state.fold_temp_file("doc.xml").unwrap());
    }

    #[test]
    fn flush_counts_only_divergent_entries() {
        let (mut state, path) = state_with_entry(b"<a/>");
        assert_eq!(state.flush_temp_files(), 0);
        fs::write(&path, b"<c/>").unwrap();
        assert_eq!(state.flush_temp_files(), 1);
        assert_eq!(state.flush_temp_files(), 0);
    }
}
