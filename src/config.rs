//! Configuration for the package engine.
//!
//! Layered configuration with three sources, later ones winning:
//! - Built-in defaults
//! - `oxpack.toml` (searched from the current directory upward)
//! - Environment variables prefixed with `OXPACK_`
//!
//! Environment variables use double underscores to separate nested levels:
//! - `OXPACK_ENGINE__DEBOUNCE_MS=250` sets `engine.debounce_ms`
//! - `OXPACK_FORMATTER__INDENT_WIDTH=4` sets `formatter.indent_width`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    /// Sync engine timing and materialization settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// XML reformatter settings.
    #[serde(default)]
    pub formatter: FormatterConfig,

    /// Logging levels.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Quiet window for temp-file change events, in milliseconds.
    /// A burst of change notifications within this window collapses
    /// into a single sync-back.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Delay between a sync-back and the automatic repackage, in
    /// milliseconds. Re-armed by every further sync so rapid multi-file
    /// edits batch into one save.
    #[serde(default = "default_autosave_delay_ms")]
    pub autosave_delay_ms: u64,

    /// A settled change event for a temp file whose mtime is older than
    /// this window is treated as stale watcher replay and skipped.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Extensions (without the dot) of entries that get materialized as
    /// editable temp files. Everything else stays memory-only.
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,

    /// Prefix for per-session temp mirror directories.
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,

    /// Capacity of the broadcast channel for engine events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FormatterConfig {
    /// Spaces per indent level.
    #[serde(default = "default_indent_width")]
    pub indent_width: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `watcher = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_debounce_ms() -> u64 {
    500
}
fn default_autosave_delay_ms() -> u64 {
    2000
}
fn default_stale_after_secs() -> u64 {
    10
}
fn default_text_extensions() -> Vec<String> {
    vec!["xml".to_string(), "rels".to_string()]
}
fn default_temp_prefix() -> String {
    "oxpack-".to_string()
}
fn default_event_capacity() -> usize {
    100
}
fn default_indent_width() -> usize {
    2
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            autosave_delay_ms: default_autosave_delay_ms(),
            stale_after_secs: default_stale_after_secs(),
            text_extensions: default_text_extensions(),
            temp_prefix: default_temp_prefix(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            indent_width: default_indent_width(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Settings {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_config_file().unwrap_or_else(|| PathBuf::from("oxpack.toml"));

        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore becomes a dot so OXPACK_ENGINE__DEBOUNCE_MS
            // addresses engine.debounce_ms; single underscores stay as-is
            // within field names.
            .merge(
                Env::prefixed("OXPACK_")
                    .map(|key| key.as_str().to_lowercase().replace("__", ".").into()),
            )
            .extract()
            .map_err(Box::new)
    }

    /// Search from the current directory upward for an `oxpack.toml`.
    fn find_config_file() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        for ancestor in current.ancestors() {
            let candidate = ancestor.join("oxpack.toml");
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let settings = Settings::default();
        assert_eq!(settings.engine.debounce_ms, 500);
        assert_eq!(settings.engine.autosave_delay_ms, 2000);
        assert_eq!(settings.engine.stale_after_secs, 10);
        assert_eq!(settings.engine.text_extensions, vec!["xml", "rels"]);
        assert_eq!(settings.formatter.indent_width, 2);
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn env_overrides_nested_fields() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OXPACK_ENGINE__DEBOUNCE_MS", "250");
            jail.set_env("OXPACK_FORMATTER__INDENT_WIDTH", "4");
            let settings = Settings::load().expect("load settings");
            assert_eq!(settings.engine.debounce_ms, 250);
            assert_eq!(settings.formatter.indent_width, 4);
            Ok(())
        });
    }

    #[test]
    fn toml_file_layers_under_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "oxpack.toml",
                r#"
                [engine]
                autosave_delay_ms = 5000

                [formatter]
                indent_width = 8
                "#,
            )?;
            jail.set_env("OXPACK_FORMATTER__INDENT_WIDTH", "3");
            let settings = Settings::load().expect("load settings");
            assert_eq!(settings.engine.autosave_delay_ms, 5000);
            // Env wins over the file.
            assert_eq!(settings.formatter.indent_width, 3);
            Ok(())
        });
    }
}
