//! Engine event broadcasting and the conflict-resolution seam.
//!
//! Events are notifications, not state transfer: receivers re-query the
//! engine for current contents. Lagging receivers lose old events, which
//! is acceptable for UI refresh signals.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Outcome of an external-modification conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Discard local changes and reload from disk.
    Reload,
    /// Accept the new on-disk timestamp but keep in-memory state,
    /// effectively ignoring the external edit.
    Keep,
    /// Commit local changes first, then reload. Last-writer-wins on the
    /// container as a whole; the external edit survives only if it
    /// touched disjoint entries and landed in the saved image.
    SaveThenReload,
    /// Leave everything exactly as it was.
    Decline,
}

/// Policy consulted when the container changed on disk while unsaved
/// local edits exist. Implemented by the embedding layer, typically by
/// prompting the user.
#[async_trait]
pub trait ResolveConflict: Send + Sync {
    /// `modified` lists the internal paths with unsaved local edits.
    async fn resolve(&self, path: &Path, modified: Vec<String>) -> Resolution;
}

/// Default policy: never touch local state implicitly.
pub struct DeclineConflicts;

#[async_trait]
impl ResolveConflict for DeclineConflicts {
    async fn resolve(&self, _path: &Path, _modified: Vec<String>) -> Resolution {
        Resolution::Decline
    }
}

/// Notifications emitted by the engine and its watch loops.
#[derive(Debug, Clone)]
pub enum PackageEvent {
    /// A temp-file edit was folded into the in-memory entry.
    EntrySynced { path: PathBuf, entry: String },
    /// The container was repackaged successfully.
    Saved { path: PathBuf },
    /// Repackaging failed; the original was restored.
    SaveFailed { path: PathBuf, message: String },
    /// The session was reloaded from disk.
    Reloaded { path: PathBuf },
    /// The container changed on disk with no local edits pending;
    /// an unconditional reload follows.
    ExternalChange { path: PathBuf },
    /// The container disappeared from disk. The engine does not
    /// self-heal; the caller decides what to do.
    SourceDeleted { path: PathBuf },
    /// A conflict was surfaced and resolved (possibly by declining).
    ConflictResolved {
        path: PathBuf,
        resolution: Resolution,
    },
}

/// Fan-out of [`PackageEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<PackageEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers. Having no subscribers is fine.
    pub fn send(&self, event: PackageEvent) {
        match self.sender.send(event.clone()) {
            Ok(count) => {
                crate::debug_event!("events", "sent", "{event:?} to {count} subscribers");
            }
            Err(_) => {
                crate::debug_event!("events", "dropped", "no subscribers for {event:?}");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PackageEvent> {
        self.sender.subscribe()
    }
}
