//! Streaming extraction of a ZIP container into session state.
//!
//! [`EntryReader`] exposes the archive as a lazy sequence of
//! `(name, bytes)` pairs so extraction reads as a plain loop. Directory
//! placeholder entries (names ending in `/`) are skipped; internal paths
//! are kept `/`-separated exactly as stored in the central directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use zip::ZipArchive;
use zip::result::ZipError;

use crate::config::EngineConfig;
use crate::error::OpenError;

/// Coarse classification of an internal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    /// Materialized as an editable temp file (`.xml`, `.rels`, ...).
    Text,
    /// Memory-only; media and other binary parts.
    Binary,
}

/// Lazy iterator over the file entries of a ZIP archive.
///
/// Yields `(name, uncompressed bytes)`; finite, not restartable.
pub struct EntryReader<R: Read + Seek> {
    archive: ZipArchive<R>,
    index: usize,
}

impl<R: Read + Seek> EntryReader<R> {
    pub fn new(reader: R) -> Result<Self, ZipError> {
        let archive = ZipArchive::new(reader)?;
        Ok(Self { archive, index: 0 })
    }

    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }
}

impl<R: Read + Seek> Iterator for EntryReader<R> {
    type Item = Result<(String, Vec<u8>), ZipError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.index >= self.archive.len() {
                return None;
            }
            let idx = self.index;
            self.index += 1;

            let mut file = match self.archive.by_index(idx) {
                Ok(f) => f,
                Err(e) => return Some(Err(e)),
            };

            // Directory placeholders carry no payload.
            if file.is_dir() {
                continue;
            }

            let name = file.name().to_string();
            let mut bytes = Vec::with_capacity(file.size() as usize);
            if let Err(e) = file.read_to_end(&mut bytes) {
                return Some(Err(ZipError::Io(e)));
            }
            return Some(Ok((name, bytes)));
        }
    }
}

/// Entry maps produced by one extraction pass, built off to the side so
/// a failed extraction never installs a half-populated session.
#[derive(Debug, Default)]
pub struct Extracted {
    pub entries: HashMap<String, Vec<u8>>,
    pub temp_files: HashMap<String, PathBuf>,
}

/// Whether an internal path gets a temp-file mirror.
pub fn is_text_entry(name: &str, text_extensions: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    text_extensions
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

pub fn classify(name: &str, text_extensions: &[String]) -> EntryKind {
    if is_text_entry(name, text_extensions) {
        EntryKind::Text
    } else {
        EntryKind::Binary
    }
}

/// Extract every entry of `container` into memory, materializing
/// text-like entries under `temp_root`.
///
/// Internal paths are validated against the temp root: an entry whose
/// name escapes it (`../`) fails the whole extraction.
pub fn extract_package(
    container: &Path,
    temp_root: &Path,
    config: &EngineConfig,
) -> Result<Extracted, OpenError> {
    let file = File::open(container).map_err(|e| OpenError::Io {
        path: container.to_path_buf(),
        source: e,
    })?;
    let reader = EntryReader::new(BufReader::new(file)).map_err(|e| OpenError::Malformed {
        path: container.to_path_buf(),
        details: e.to_string(),
    })?;

    let mut extracted = Extracted {
        entries: HashMap::with_capacity(reader.len()),
        temp_files: HashMap::new(),
    };
    for item in reader {
        let (name, bytes) = item.map_err(|e| OpenError::Malformed {
            path: container.to_path_buf(),
            details: e.to_string(),
        })?;

        if is_text_entry(&name, &config.text_extensions) {
            let dest = safe_join(temp_root, &name).ok_or_else(|| OpenError::Malformed {
                path: container.to_path_buf(),
                details: format!("entry name escapes the archive root: {name}"),
            })?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| OpenError::Materialize {
                    entry: name.clone(),
                    source: e,
                })?;
            }
            fs::write(&dest, &bytes).map_err(|e| OpenError::Materialize {
                entry: name.clone(),
                source: e,
            })?;
            extracted.temp_files.insert(name.clone(), dest);
        }

        extracted.entries.insert(name, bytes);
    }

    crate::debug_event!(
        "extract",
        "loaded",
        "{} entries, {} materialized from {}",
        extracted.entries.len(),
        extracted.temp_files.len(),
        container.display()
    );

    Ok(extracted)
}

/// Join a `/`-separated internal path onto `root`, rejecting absolute
/// paths and parent-directory components.
fn safe_join(root: &Path, name: &str) -> Option<PathBuf> {
    let mut dest = root.to_path_buf();
    for part in name.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." || part.contains('\\') || part.ends_with(':') {
            return None;
        }
        dest.push(part);
    }
    if dest == root { None } else { Some(dest) }
}
