//! The package engine: session registry and caller-facing API.
//!
//! One engine instance owns all of its sessions; nothing is process
//! global, so tests (and embedders) can run several engines side by
//! side. Sessions are keyed by canonicalized container path and a second
//! `open` of the same container returns the running session instead of
//! creating a duplicate.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{EntryError, OpenError, SaveError};
use crate::events::{DeclineConflicts, EventBroadcaster, PackageEvent, ResolveConflict};
use crate::extract::{self, EntryKind};
use crate::package;
use crate::session::{PackageSession, SessionState, container_mtime};
use crate::watcher::SessionWatcher;

struct SessionSlot {
    session: Arc<PackageSession>,
    cancel: CancellationToken,
    /// `None` when the watcher could not be set up; the session is
    /// degraded (no sync-back) but usable.
    task: Option<JoinHandle<()>>,
}

/// Engine over any number of open containers.
pub struct PackageEngine {
    settings: Arc<Settings>,
    sessions: DashMap<PathBuf, SessionSlot>,
    events: EventBroadcaster,
    resolver: Arc<dyn ResolveConflict>,
}

impl PackageEngine {
    /// Engine with default settings and the decline-everything resolver.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> PackageEngineBuilder {
        PackageEngineBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PackageEvent> {
        self.events.subscribe()
    }

    /// Open a container, extracting it into a fresh session.
    ///
    /// Opening an already-open container returns the existing session.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<Arc<PackageSession>, OpenError> {
        let key = canonical_key(path.as_ref()).map_err(|e| OpenError::Io {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;

        if let Some(slot) = self.sessions.get(&key) {
            crate::debug_event!("engine", "open coalesced", "{}", key.display());
            return Ok(slot.session.clone());
        }

        let temp_dir = tempfile::Builder::new()
            .prefix(&self.settings.engine.temp_prefix)
            .tempdir()
            .map_err(OpenError::TempDir)?;
        let temp_root = temp_dir.path().to_path_buf();

        let extracted = extract::extract_package(&key, &temp_root, &self.settings.engine)?;
        let mtime = container_mtime(&key)?;

        let state = SessionState::new(key.clone(), temp_dir, extracted, mtime);
        let session = Arc::new(PackageSession {
            original_path: key.clone(),
            state: tokio::sync::Mutex::new(state),
        });

        let cancel = CancellationToken::new();
        let task = match SessionWatcher::spawn(
            session.clone(),
            temp_root,
            self.settings.clone(),
            self.events.clone(),
            self.resolver.clone(),
            cancel.clone(),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                // Degraded session: readable and saveable, no sync-back.
                tracing::warn!("[engine] watcher setup failed for {}: {e}", key.display());
                None
            }
        };

        match self.sessions.entry(key.clone()) {
            Entry::Occupied(existing) => {
                // Lost a race with a concurrent open of the same path;
                // tear ours down and reuse the winner.
                cancel.cancel();
                Ok(existing.get().session.clone())
            }
            Entry::Vacant(slot) => {
                crate::log_event!("engine", "opened", "{}", key.display());
                slot.insert(SessionSlot {
                    session: session.clone(),
                    cancel,
                    task,
                });
                Ok(session)
            }
        }
    }

    /// Close a session: stop its watcher, delete its temp mirror,
    /// forget it. Idempotent; unsaved changes are discarded.
    pub async fn close(&self, path: impl AsRef<Path>) {
        let key = lookup_key(path.as_ref());
        let Some((_, slot)) = self.sessions.remove(&key) else {
            return;
        };

        // Cancel timers and the watch task before touching the temp
        // directory, so no callback can fire against freed resources.
        slot.cancel.cancel();
        if let Some(task) = slot.task {
            let _ = task.await;
        }

        let mut state = slot.session.state.lock().await;
        if let Some(temp_dir) = state.take_temp_dir() {
            if let Err(e) = temp_dir.close() {
                tracing::warn!("[engine] temp mirror cleanup failed: {e}");
            }
        }
        crate::log_event!("engine", "closed", "{}", key.display());
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let keys: Vec<PathBuf> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close(&key).await;
        }
    }

    /// Manually trigger a save. A no-op (still `Ok`) when nothing
    /// changed after folding pending temp-file edits.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), SaveError> {
        let session = self
            .get(path.as_ref())
            .ok_or_else(|| SaveError::SessionNotFound(path.as_ref().to_path_buf()))?;

        let mut state = session.state.lock().await;
        match package::save_state(&mut state) {
            Ok(true) => {
                drop(state);
                self.events.send(PackageEvent::Saved {
                    path: session.original_path.clone(),
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                drop(state);
                self.events.send(PackageEvent::SaveFailed {
                    path: session.original_path.clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Current bytes of one internal entry.
    pub async fn read_entry(
        &self,
        path: impl AsRef<Path>,
        entry: &str,
    ) -> Result<Vec<u8>, EntryError> {
        let session = self
            .get(path.as_ref())
            .ok_or_else(|| EntryError::SessionNotFound(path.as_ref().to_path_buf()))?;
        let state = session.state.lock().await;
        state
            .entries
            .get(entry)
            .cloned()
            .ok_or_else(|| EntryError::NotFound {
                path: session.original_path.clone(),
                entry: entry.to_string(),
            })
    }

    /// Temp-file path for a materialized text entry, if any.
    pub async fn temp_file_path(&self, path: impl AsRef<Path>, entry: &str) -> Option<PathBuf> {
        let session = self.get(path.as_ref())?;
        let state = session.state.lock().await;
        state.temp_files.get(entry).cloned()
    }

    pub async fn has_unsaved_changes(&self, path: impl AsRef<Path>) -> bool {
        match self.get(path.as_ref()) {
            Some(session) => session.state.lock().await.has_unsaved(),
            None => false,
        }
    }

    pub async fn list_modified(&self, path: impl AsRef<Path>) -> Vec<String> {
        match self.get(path.as_ref()) {
            Some(session) => session.state.lock().await.list_modified(),
            None => Vec::new(),
        }
    }

    /// Every internal path with its text/binary classification, sorted.
    pub async fn list_entries(&self, path: impl AsRef<Path>) -> Vec<(String, EntryKind)> {
        let Some(session) = self.get(path.as_ref()) else {
            return Vec::new();
        };
        let state = session.state.lock().await;
        let mut listing: Vec<(String, EntryKind)> = state
            .entries
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    extract::classify(name, &self.settings.engine.text_extensions),
                )
            })
            .collect();
        listing.sort();
        listing
    }

    pub fn is_open(&self, path: impl AsRef<Path>) -> bool {
        self.sessions.contains_key(&lookup_key(path.as_ref()))
    }

    fn get(&self, path: &Path) -> Option<Arc<PackageSession>> {
        self.sessions
            .get(&lookup_key(path))
            .map(|slot| slot.session.clone())
    }
}

impl Default for PackageEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring an engine.
pub struct PackageEngineBuilder {
    settings: Option<Settings>,
    resolver: Option<Arc<dyn ResolveConflict>>,
}

impl PackageEngineBuilder {
    pub fn new() -> Self {
        Self {
            settings: None,
            resolver: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Install the conflict policy. Without one, external changes that
    /// collide with local edits are declined (state unchanged).
    pub fn resolver(mut self, resolver: Arc<dyn ResolveConflict>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> PackageEngine {
        let settings = Arc::new(self.settings.unwrap_or_default());
        let events = EventBroadcaster::new(settings.engine.event_capacity);
        PackageEngine {
            settings,
            sessions: DashMap::new(),
            events,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(DeclineConflicts)),
        }
    }
}

impl Default for PackageEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical registry key for a container path. Backslash-separated
/// input resolves to the same key as the native spelling.
fn canonical_key(path: &Path) -> io::Result<PathBuf> {
    normalize_separators(path).canonicalize()
}

/// Best-effort key for lookups: canonicalization may fail once the
/// container is gone, and close/queries must still find the session.
fn lookup_key(path: &Path) -> PathBuf {
    let normalized = normalize_separators(path);
    fs::canonicalize(&normalized).unwrap_or(normalized)
}

fn normalize_separators(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text.contains('\\') {
        PathBuf::from(text.replace('\\', "/"))
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_normalization_unifies_keys() {
        let forward = normalize_separators(Path::new("reports/q3/final.docx"));
        let backward = normalize_separators(Path::new("reports\\q3\\final.docx"));
        assert_eq!(forward, backward);
    }
}
