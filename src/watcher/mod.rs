//! Per-session filesystem watching.
//!
//! Each open session owns one `notify::RecommendedWatcher` covering its
//! temp mirror tree (recursive) and the container's parent directory
//! (non-recursive, filtered to the container path). Events flow through
//! a channel into a `tokio::select!` loop that debounces temp-file
//! edits, syncs them back, arms the auto-save deadline and arbitrates
//! external changes to the container.

mod debouncer;
mod error;
mod session_watcher;

pub use debouncer::{Deadline, Debouncer};
pub use error::WatchError;
pub(crate) use session_watcher::SessionWatcher;
