//! Tracing setup and event logging macros.
//!
//! Quiet by default (`warn`); levels come from the `[logging]` config
//! section with per-module overrides, and `RUST_LOG` takes precedence
//! over both:
//!
//! ```bash
//! RUST_LOG=oxpack=debug my-app
//! RUST_LOG=oxpack::watcher=trace my-app
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// HH:MM:SS.mmm local time, compact enough for interactive use.
struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Initialize the global subscriber from config.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            let mut directives = config.default.clone();
            for (module, level) in &config.modules {
                directives.push_str(&format!(",{module}={level}"));
            }
            EnvFilter::new(&directives)
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_timer(ClockTime)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Initialize with default levels (`warn`).
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Info-level event with a component tag.
///
/// # Examples
/// ```ignore
/// log_event!("sync", "folded", "{}", entry);
/// log_event!("save", "committed");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug-level event with a component tag.
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}
