//! Atomic repackaging of session state back into the container.
//!
//! The rename in step three is the only operation that makes new content
//! visible under the original name, so a crash mid-save leaves either
//! the old container or the new one, never a truncated hybrid. A
//! `.backup` sibling exists for the duration of the save and is removed
//! on success or used for restoration on failure.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::SaveError;
use crate::session::SessionState;

/// Repackage and atomically replace the container.
///
/// Returns `Ok(false)` when there was nothing to save (after folding any
/// not-yet-synced temp-file edits), `Ok(true)` on a committed save. On
/// failure the original is left (or restored) byte-identical to its
/// pre-save state and `modified` is untouched so a retry is possible.
pub(crate) fn save_state(state: &mut SessionState) -> Result<bool, SaveError> {
    let folded = state.flush_temp_files();
    if folded > 0 {
        crate::debug_event!("save", "force-flush", "folded {folded} pending edits");
    }
    if !state.has_unsaved() {
        crate::debug_event!("save", "clean", "nothing to repackage");
        return Ok(false);
    }

    let original = state.original_path.clone();
    let backup = sibling(&original, ".backup");
    let staging = sibling(&original, ".tmp");

    fs::copy(&original, &backup).map_err(|e| SaveError::Backup {
        path: original.clone(),
        source: e,
    })?;

    match commit(&original, &staging, &state.entries) {
        Ok(mtime) => {
            // Update bookkeeping before anything can observe the new
            // file, so the source watcher treats this mtime as ours.
            state.last_known_mtime = mtime;
            state.modified.clear();
            if let Err(e) = fs::remove_file(&backup) {
                tracing::warn!("[save] could not remove backup {}: {e}", backup.display());
            }
            crate::log_event!("save", "committed", "{}", original.display());
            Ok(true)
        }
        Err(save_error) => {
            let _ = fs::remove_file(&staging);
            Err(recover(state, &original, &backup, save_error))
        }
    }
}

/// Write the full entry image to `staging`, then swap it in.
fn commit(
    original: &Path,
    staging: &Path,
    entries: &HashMap<String, Vec<u8>>,
) -> Result<SystemTime, SaveError> {
    write_archive(staging, entries).map_err(|details| SaveError::Package {
        path: original.to_path_buf(),
        details,
    })?;

    fs::remove_file(original).map_err(|e| SaveError::Replace {
        path: original.to_path_buf(),
        source: e,
    })?;
    fs::rename(staging, original).map_err(|e| SaveError::Replace {
        path: original.to_path_buf(),
        source: e,
    })?;

    fs::metadata(original)
        .and_then(|m| m.modified())
        .map_err(|e| SaveError::Replace {
            path: original.to_path_buf(),
            source: e,
        })
}

/// Build a ZIP holding every entry. The full image is always the source
/// of truth; write order and compression details are unspecified.
fn write_archive(dest: &Path, entries: &HashMap<String, Vec<u8>>) -> Result<(), String> {
    let file = File::create(dest).map_err(|e| e.to_string())?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| e.to_string())?;
        writer.write_all(bytes).map_err(|e| e.to_string())?;
    }

    writer
        .finish()
        .map_err(|e| e.to_string())?
        .flush()
        .map_err(|e| e.to_string())
}

/// Clean up after a failed save. A repackaging failure never touched
/// the original, so only the replace step needs the backup copied back.
/// Either way the container's mtime afterwards is our doing, not an
/// external edit, and is folded into `last_known_mtime` so the source
/// watcher stays quiet. If the restore copy itself fails the returned
/// error says so explicitly; a silently corrupted container is the one
/// outcome this path must never produce.
fn recover(
    state: &mut SessionState,
    original: &Path,
    backup: &Path,
    save_error: SaveError,
) -> SaveError {
    if matches!(save_error, SaveError::Package { .. }) {
        let _ = fs::remove_file(backup);
        return save_error;
    }

    match fs::copy(backup, original) {
        Ok(_) => {
            let _ = fs::remove_file(backup);
            if let Ok(mtime) = fs::metadata(original).and_then(|m| m.modified()) {
                state.last_known_mtime = mtime;
            }
            tracing::warn!(
                "[save] failed, original restored from backup: {}",
                original.display()
            );
            save_error
        }
        Err(restore_error) => SaveError::RestoreFailed {
            path: original.to_path_buf(),
            save_error: save_error.to_string(),
            restore_error: restore_error.to_string(),
        },
    }
}

/// `<path><suffix>`, e.g. `report.docx.backup`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/x/report.docx"), ".backup"),
            PathBuf::from("/x/report.docx.backup")
        );
    }

    #[test]
    fn archive_round_trips_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("out.zip");

        let mut entries = HashMap::new();
        entries.insert("word/document.xml".to_string(), b"<w:document/>".to_vec());
        entries.insert("media/blob.bin".to_string(), vec![0u8, 159, 146, 150]);
        write_archive(&dest, &entries).unwrap();

        let file = File::open(&dest).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 2);
        for name in ["word/document.xml", "media/blob.bin"] {
            let mut entry = archive.by_name(name).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            assert_eq!(bytes, entries[name]);
        }
    }
}
