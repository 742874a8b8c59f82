//! oxpack: edit the XML parts of ZIP-packaged Office documents as
//! plain files.
//!
//! The engine extracts an OpenXML container (.docx/.xlsx/.pptx) into an
//! in-memory entry set, materializes text-like entries (`.xml`,
//! `.rels`) as real temp files for external tools to edit, watches
//! those files and folds edits back with debouncing, watches the
//! container itself for external modification with a three-way conflict
//! policy, and repackages atomically with backup and rollback.
//!
//! ```no_run
//! use oxpack::{PackageEngine, PackageEvent};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = PackageEngine::new();
//! let mut events = engine.subscribe();
//!
//! engine.open("report.docx").await?;
//! let doc = engine
//!     .temp_file_path("report.docx", "word/document.xml")
//!     .await
//!     .expect("materialized entry");
//! // ... point any editor at `doc`; edits sync back and auto-save ...
//!
//! while let Ok(event) = events.recv().await {
//!     if let PackageEvent::Saved { path } = event {
//!         println!("repacked {}", path.display());
//!     }
//! }
//! engine.close("report.docx").await;
//! # Ok(())
//! # }
//! ```
//!
//! A loosely-coupled lexical pretty-printer, [`format_xml`], reformats
//! XML text without being schema-aware.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod extract;
pub mod format;
pub mod logging;
pub mod package;
pub mod session;
pub mod watcher;

pub use config::Settings;
pub use engine::{PackageEngine, PackageEngineBuilder};
pub use error::{EntryError, OpenError, SaveError};
pub use events::{DeclineConflicts, PackageEvent, Resolution, ResolveConflict};
pub use extract::EntryKind;
pub use format::{FormatOptions, format_xml};
pub use session::PackageSession;
pub use watcher::WatchError;
