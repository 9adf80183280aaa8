//! Console configuration.
//!
//! Conversation limits are read by
//! [`OrchestratorConfig::from_env`](chorus_conversation::OrchestratorConfig::from_env);
//! this module only holds what the console itself needs.

use serde::Deserialize;
use std::path::PathBuf;

/// Console settings, loaded from `CHORUS_*` environment variables.
#[derive(Debug, Default, Deserialize)]
pub struct ConsoleConfig {
    /// JSON file holding group and member modes. In-memory when unset.
    #[serde(default)]
    pub scoping_file: Option<PathBuf>,
}

impl ConsoleConfig {
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
}
