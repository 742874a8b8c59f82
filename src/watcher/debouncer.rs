//! Debounce table and auto-save deadline.
//!
//! Both timers live inside the session's watch loop and are polled on
//! its tick, so there is exactly one debounce entry per path and one
//! auto-save deadline per session; re-arming replaces rather than
//! stacking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Collapses bursts of change events per path.
///
/// A path becomes ready once it has been quiet for the configured
/// window; recording it again restarts the window.
#[derive(Debug)]
pub struct Debouncer {
    /// path -> last change timestamp.
    pending: HashMap<PathBuf, Instant>,
    quiet: Duration,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            quiet,
        }
    }

    /// Record a change event, restarting the quiet window for the path.
    pub fn record(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Forget a path (e.g. its file was deleted).
    pub fn remove(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    /// Drop everything pending. Used after a reload so replayed events
    /// from the old mirror content cannot settle later.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Take all paths whose quiet window has elapsed.
    pub fn take_ready(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let mut ready = Vec::new();
        self.pending.retain(|path, last_change| {
            if now.duration_since(*last_change) >= self.quiet {
                ready.push(path.clone());
                false
            } else {
                true
            }
        });
        ready
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// One-shot deadline with cancel-and-replace semantics.
///
/// Arming while armed moves the deadline; there is never more than one
/// outstanding firing.
#[derive(Debug, Default)]
pub struct Deadline {
    due: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self { due: None }
    }

    /// Arm (or re-arm) the deadline `delay` from now.
    pub fn arm(&mut self, delay: Duration) {
        self.due = Some(Instant::now() + delay);
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    /// If the deadline has passed, disarm it and return true.
    pub fn take_due(&mut self) -> bool {
        match self.due {
            Some(due) if Instant::now() >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn burst_collapses_to_one_ready_path() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let path = PathBuf::from("/mirror/word/document.xml");

        for _ in 0..5 {
            debouncer.record(path.clone());
        }
        assert!(debouncer.take_ready().is_empty());
        assert!(debouncer.has_pending());

        sleep(Duration::from_millis(60));
        assert_eq!(debouncer.take_ready(), vec![path]);
        assert!(!debouncer.has_pending());
    }

    #[test]
    fn recording_restarts_the_quiet_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let path = PathBuf::from("/mirror/word/styles.xml");

        debouncer.record(path.clone());
        sleep(Duration::from_millis(30));
        debouncer.record(path.clone());
        sleep(Duration::from_millis(30));
        // 60ms since the first event, 30ms since the last: not ready.
        assert!(debouncer.take_ready().is_empty());

        sleep(Duration::from_millis(30));
        assert_eq!(debouncer.take_ready().len(), 1);
    }

    #[test]
    fn paths_settle_independently() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let first = PathBuf::from("/mirror/a.xml");
        let second = PathBuf::from("/mirror/b.xml");

        debouncer.record(first.clone());
        sleep(Duration::from_millis(30));
        debouncer.record(second.clone());
        sleep(Duration::from_millis(25));

        assert_eq!(debouncer.take_ready(), vec![first]);
        assert!(debouncer.has_pending());

        sleep(Duration::from_millis(30));
        assert_eq!(debouncer.take_ready(), vec![second]);
    }

    #[test]
    fn clear_drops_pending() {
        let mut debouncer = Debouncer::new(Duration::from_millis(10));
        debouncer.record(PathBuf::from("/mirror/a.xml"));
        debouncer.clear();
        sleep(Duration::from_millis(20));
        assert!(debouncer.take_ready().is_empty());
    }

    #[test]
    fn deadline_rearm_replaces() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_millis(30));
        sleep(Duration::from_millis(20));
        deadline.arm(Duration::from_millis(30));
        sleep(Duration::from_millis(20));
        // 40ms after the first arm, but only 20ms after the re-arm.
        assert!(!deadline.take_due());
        sleep(Duration::from_millis(15));
        assert!(deadline.take_due());
        // Firing disarms.
        assert!(!deadline.take_due());
        assert!(!deadline.is_armed());
    }
}
