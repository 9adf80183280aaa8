//! Orchestrator configuration.
//!
//! Loaded via the `config` crate from environment variables prefixed with
//! `CHORUS_` (nested keys use `__`, e.g. `CHORUS_PRESETS__CAT`).

use crate::key::{GroupMode, ScopingDefaults, UserMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Limits and defaults for conversation handling.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Longest accepted user input, in characters.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Longest string content kept in history, in characters.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,

    /// Upper bound on messages sent per request (system messages always kept).
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Tokens kept free below the model limit before summarizing.
    #[serde(default = "default_summary_reserve_tokens")]
    pub summary_reserve_tokens: u64,

    /// Whether to insert an hourly time marker into history.
    #[serde(default = "default_time_marker")]
    pub time_marker: bool,

    /// Per-call tool execution limit, in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Delay between a scoping change and its flush, in milliseconds.
    #[serde(default = "default_scoping_flush_debounce_ms")]
    pub scoping_flush_debounce_ms: u64,

    /// Group mode for groups without explicit configuration.
    #[serde(default)]
    pub default_group_mode: GroupMode,

    /// User mode for members without explicit configuration.
    #[serde(default)]
    pub default_user_mode: UserMode,

    /// Named presets (name -> system prompt).
    #[serde(default)]
    pub presets: HashMap<String, String>,

    /// Preset applied to new conversations.
    #[serde(default)]
    pub default_preset: Option<String>,
}

fn default_max_input_chars() -> usize {
    4000
}

fn default_max_content_chars() -> usize {
    8000
}

fn default_max_history_messages() -> usize {
    64
}

fn default_summary_reserve_tokens() -> u64 {
    512
}

fn default_time_marker() -> bool {
    true
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_scoping_flush_debounce_ms() -> u64 {
    2000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_input_chars: default_max_input_chars(),
            max_content_chars: default_max_content_chars(),
            max_history_messages: default_max_history_messages(),
            summary_reserve_tokens: default_summary_reserve_tokens(),
            time_marker: default_time_marker(),
            tool_timeout_secs: default_tool_timeout_secs(),
            scoping_flush_debounce_ms: default_scoping_flush_debounce_ms(),
            default_group_mode: GroupMode::default(),
            default_user_mode: UserMode::default(),
            presets: HashMap::new(),
            default_preset: None,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CHORUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Returns the scoping fallbacks.
    #[must_use]
    pub fn scoping_defaults(&self) -> ScopingDefaults {
        ScopingDefaults {
            group_mode: self.default_group_mode,
            user_mode: self.default_user_mode,
        }
    }

    /// Returns the per-call tool limit.
    #[must_use]
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Returns the scoping flush delay.
    #[must_use]
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.scoping_flush_debounce_ms)
    }
}
