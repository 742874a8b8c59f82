//! The per-session watch loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use super::{Deadline, Debouncer, WatchError};
use crate::config::Settings;
use crate::events::{EventBroadcaster, PackageEvent, Resolution, ResolveConflict};
use crate::package;
use crate::session::PackageSession;

/// Watches one session's temp mirror and its container, syncing edits
/// back and driving auto-save and conflict resolution.
///
/// All state mutation happens under the session's state lock, taken
/// briefly per operation; the resolver is awaited with the lock
/// released so a slow UI prompt cannot stall reads.
pub(crate) struct SessionWatcher {
    session: Arc<PackageSession>,
    temp_root: PathBuf,
    settings: Arc<Settings>,
    events: EventBroadcaster,
    resolver: Arc<dyn ResolveConflict>,
    event_rx: mpsc::Receiver<notify::Result<Event>>,
    /// Kept alive by ownership; dropping it stops event delivery.
    _watcher: notify::RecommendedWatcher,
    cancel: CancellationToken,
    debouncer: Debouncer,
    autosave: Deadline,
}

impl SessionWatcher {
    /// Set up watches and spawn the loop task.
    pub(crate) fn spawn(
        session: Arc<PackageSession>,
        temp_root: PathBuf,
        settings: Arc<Settings>,
        events: EventBroadcaster,
        resolver: Arc<dyn ResolveConflict>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, WatchError> {
        let (tx, rx) = mpsc::channel(settings.engine.event_capacity);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        })?;

        watcher
            .watch(&temp_root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: temp_root.clone(),
                reason: e.to_string(),
            })?;

        // The container is watched through its parent directory so the
        // delete-and-rename save sequence keeps the watch alive.
        match session.path().parent() {
            Some(parent) => {
                if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                    tracing::warn!(
                        "[watcher] cannot watch container directory {}: {e}",
                        parent.display()
                    );
                }
            }
            None => {
                tracing::warn!(
                    "[watcher] container {} has no parent directory, external changes will not be seen",
                    session.path().display()
                );
            }
        }

        let debounce = settings.engine.debounce();
        let this = Self {
            session,
            temp_root,
            settings,
            events,
            resolver,
            event_rx: rx,
            _watcher: watcher,
            cancel,
            debouncer: Debouncer::new(debounce),
            autosave: Deadline::new(),
        };

        crate::debug_event!("watcher", "started", "{}", this.session.path().display());
        Ok(tokio::spawn(this.run()))
    }

    async fn run(mut self) {
        loop {
            // Periodic check for settled debounce entries and the
            // auto-save deadline.
            let tick = sleep(Duration::from_millis(100));
            tokio::pin!(tick);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    crate::debug_event!("watcher", "stopped", "{}", self.session.path().display());
                    return;
                }

                Some(res) = self.event_rx.recv() => {
                    match res {
                        Ok(event) => self.route_event(event),
                        Err(e) => {
                            tracing::warn!("[watcher] event error: {e}");
                        }
                    }
                }

                _ = &mut tick => {
                    for path in self.debouncer.take_ready() {
                        if path == self.session.original_path {
                            self.handle_source_change().await;
                        } else {
                            self.handle_temp_change(&path).await;
                        }
                    }
                    if self.autosave.take_due() {
                        self.autosave_now().await;
                    }
                }
            }
        }
    }

    /// Feed raw notify events into the debounce table.
    fn route_event(&mut self, event: Event) {
        for path in event.paths {
            if path == self.session.original_path {
                // Deletions settle too: existence is checked when the
                // event is processed, not when it arrives.
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                        self.debouncer.record(path);
                    }
                    _ => {}
                }
            } else if path.starts_with(&self.temp_root) {
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        self.debouncer.record(path);
                    }
                    EventKind::Remove(_) => {
                        // Editor atomic-save replace; a create event for
                        // the new file follows if content is coming back.
                        self.debouncer.remove(&path);
                        crate::debug_event!("watcher", "temp removed", "{}", path.display());
                    }
                    _ => {}
                }
            } else {
                // Sibling files in the container's directory (including
                // our own .tmp/.backup artifacts) are not ours to track.
                crate::debug_event!("watcher", "unmatched", "{}", path.display());
            }
        }
    }

    /// Fold a settled temp-file edit into the in-memory image.
    async fn handle_temp_change(&mut self, path: &Path) {
        let mut state = self.session.state.lock().await;
        let Some(entry) = state.entry_for_temp(path).map(str::to_string) else {
            crate::debug_event!("sync", "not a tracked temp file", "{}", path.display());
            return;
        };

        if !path.exists() {
            // Spurious event, e.g. from an editor's save-replace dance.
            crate::log_event!("sync", "temp file vanished", "{entry}");
            return;
        }

        // Ignore stale watcher replay: the file must have been touched
        // recently for the edit to be worth folding.
        match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let age = SystemTime::now()
                    .duration_since(mtime)
                    .unwrap_or_default();
                if age > self.settings.engine.stale_after() {
                    crate::debug_event!("sync", "stale event skipped", "{entry} ({age:?} old)");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("[sync] cannot stat {}: {e}", path.display());
                return;
            }
        }

        match state.fold_temp_file(&entry) {
            Ok(true) => {
                drop(state);
                crate::log_event!("sync", "folded", "{entry}");
                self.events.send(PackageEvent::EntrySynced {
                    path: self.session.original_path.clone(),
                    entry,
                });
                // Batch rapid multi-file edits into one repackage.
                self.autosave.arm(self.settings.engine.autosave_delay());
            }
            Ok(false) => {
                crate::debug_event!("sync", "no-op", "{entry} unchanged");
            }
            Err(e) => {
                // Degraded: this entry stops syncing until the next
                // reload, the session itself stays usable.
                tracing::warn!("[sync] failed to read temp file for {entry}: {e}");
            }
        }
    }

    /// Repackage after the batching delay elapsed.
    async fn autosave_now(&mut self) {
        let mut state = self.session.state.lock().await;
        if !state.is_open() {
            return;
        }
        match package::save_state(&mut state) {
            Ok(true) => {
                drop(state);
                self.events.send(PackageEvent::Saved {
                    path: self.session.original_path.clone(),
                });
            }
            Ok(false) => {}
            Err(e) => {
                drop(state);
                tracing::error!("[save] auto-save failed: {e}");
                self.events.send(PackageEvent::SaveFailed {
                    path: self.session.original_path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// A settled change event for the container itself.
    async fn handle_source_change(&mut self) {
        let path = self.session.original_path.clone();

        if !path.exists() {
            crate::log_event!("conflict", "container deleted", "{}", path.display());
            self.events.send(PackageEvent::SourceDeleted { path });
            return;
        }

        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("[conflict] cannot stat {}: {e}", path.display());
                return;
            }
        };

        let modified_list = {
            let state = self.session.state.lock().await;
            if !state.is_open() {
                return;
            }
            // Not strictly newer means this is our own save (or event
            // replay), not an external edit.
            if mtime <= state.last_known_mtime {
                crate::debug_event!("conflict", "self-inflicted change ignored");
                return;
            }
            state.list_modified()
        };

        if modified_list.is_empty() {
            self.events.send(PackageEvent::ExternalChange { path: path.clone() });
            self.reload_now("updated externally").await;
            return;
        }

        crate::log_event!(
            "conflict",
            "external change with local edits",
            "{} ({} entries modified)",
            path.display(),
            modified_list.len()
        );

        // The resolver typically prompts a user; await it without the
        // state lock, and bail out if the session is closed meanwhile.
        let resolution = tokio::select! {
            _ = self.cancel.cancelled() => return,
            resolution = self.resolver.resolve(&path, modified_list) => resolution,
        };

        self.events.send(PackageEvent::ConflictResolved {
            path: path.clone(),
            resolution,
        });

        match resolution {
            Resolution::Decline => {
                crate::debug_event!("conflict", "declined, state unchanged");
            }
            Resolution::Keep => {
                let mut state = self.session.state.lock().await;
                if state.is_open() && mtime > state.last_known_mtime {
                    state.last_known_mtime = mtime;
                }
                crate::log_event!("conflict", "kept local state");
            }
            Resolution::Reload => {
                if self.still_newer(mtime).await {
                    self.reload_now("reloaded over local edits").await;
                } else {
                    crate::debug_event!("conflict", "reload skipped, already current");
                }
            }
            Resolution::SaveThenReload => {
                // Last-writer-wins on the container as a whole: the
                // reload reads back the image this save just wrote.
                let mut state = self.session.state.lock().await;
                if !state.is_open() || mtime <= state.last_known_mtime {
                    return;
                }
                match package::save_state(&mut state) {
                    Ok(_) => {
                        drop(state);
                        self.events.send(PackageEvent::Saved { path: path.clone() });
                        self.reload_now("saved then reloaded").await;
                    }
                    Err(e) => {
                        drop(state);
                        tracing::error!("[conflict] save-then-reload save failed: {e}");
                        self.events.send(PackageEvent::SaveFailed {
                            path,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// The resolver ran without the state lock; a save or reload may
    /// have caught up with the external change in the meantime.
    async fn still_newer(&self, mtime: SystemTime) -> bool {
        let state = self.session.state.lock().await;
        state.is_open() && mtime > state.last_known_mtime
    }

    /// Reload under the state lock, then reset loop-side timers so
    /// replayed events from the old mirror cannot settle later.
    async fn reload_now(&mut self, why: &str) {
        let path = self.session.original_path.clone();
        let mut state = self.session.state.lock().await;
        if !state.is_open() {
            return;
        }
        match state.reload(&self.settings.engine) {
            Ok(()) => {
                drop(state);
                self.debouncer.clear();
                self.autosave.cancel();
                crate::debug_event!("watcher", "reload", "{why}");
                self.events.send(PackageEvent::Reloaded { path });
            }
            Err(e) => {
                tracing::error!("[watcher] reload of {} failed: {e}", path.display());
            }
        }
    }
}
