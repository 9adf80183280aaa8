//! System-prompt presets.

use crate::config::OrchestratorConfig;
use crate::error::ConversationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a conversation's preset came from the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetMode {
    /// A catalog preset, or none at all.
    #[default]
    Default,
    /// A prompt supplied by the user.
    Custom,
}

/// A system prompt prepended to every request of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Catalog name; `None` for custom prompts.
    pub name: Option<String>,
    /// The system prompt.
    pub prompt: String,
}

impl Preset {
    /// Creates a named preset.
    #[must_use]
    pub fn named(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            prompt: prompt.into(),
        }
    }

    /// Creates a custom preset.
    #[must_use]
    pub fn custom(prompt: impl Into<String>) -> Self {
        Self {
            name: None,
            prompt: prompt.into(),
        }
    }
}

/// How a caller picks a preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetSelection {
    /// Look the name up in the catalog.
    Named(String),
    /// Use this prompt as is.
    Custom(String),
}

/// The configured presets.
#[derive(Debug, Clone, Default)]
pub struct PresetCatalog {
    presets: BTreeMap<String, String>,
    default: Option<String>,
}

impl PresetCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the catalog from configuration.
    ///
    /// A configured default that names no preset is ignored.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let presets: BTreeMap<_, _> = config
            .presets
            .iter()
            .map(|(name, prompt)| (name.clone(), prompt.clone()))
            .collect();
        let default = config
            .default_preset
            .clone()
            .filter(|name| presets.contains_key(name));
        Self { presets, default }
    }

    /// Adds a preset.
    #[must_use]
    pub fn with_preset(mut self, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.presets.insert(name.into(), prompt.into());
        self
    }

    /// Sets the default preset.
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    /// Returns a preset by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets
            .get(name)
            .map(|prompt| Preset::named(name, prompt.clone()))
    }

    /// Returns the preset applied to new conversations.
    #[must_use]
    pub fn default_preset(&self) -> Option<Preset> {
        self.default.as_deref().and_then(|name| self.get(name))
    }

    /// Returns the preset names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    /// Turns a selection into a preset and its mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConversationError::UnknownPreset`] for an unknown name and
    /// [`ConversationError::InvalidInput`] for a blank custom prompt.
    pub fn select(
        &self,
        selection: &PresetSelection,
    ) -> Result<(Preset, PresetMode), ConversationError> {
        match selection {
            PresetSelection::Named(name) => self
                .get(name)
                .map(|preset| (preset, PresetMode::Default))
                .ok_or_else(|| ConversationError::UnknownPreset { name: name.clone() }),
            PresetSelection::Custom(prompt) if prompt.trim().is_empty() => {
                Err(ConversationError::InvalidInput {
                    reason: "the preset prompt is empty".to_string(),
                })
            }
            PresetSelection::Custom(prompt) => {
                Ok((Preset::custom(prompt.clone()), PresetMode::Custom))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PresetCatalog {
        PresetCatalog::new()
            .with_preset("cat", "You are a cat.")
            .with_preset("pirate", "Talk like a pirate.")
            .with_default("cat")
    }

    #[test]
    fn named_selection() {
        let (preset, mode) = catalog()
            .select(&PresetSelection::Named("pirate".to_string()))
            .expect("select");
        assert_eq!(preset, Preset::named("pirate", "Talk like a pirate."));
        assert_eq!(mode, PresetMode::Default);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = catalog()
            .select(&PresetSelection::Named("dog".to_string()))
            .expect_err("unknown");
        assert_eq!(
            err,
            ConversationError::UnknownPreset {
                name: "dog".to_string()
            }
        );
    }

    #[test]
    fn custom_selection() {
        let (preset, mode) = catalog()
            .select(&PresetSelection::Custom("Be brief.".to_string()))
            .expect("select");
        assert_eq!(preset.name, None);
        assert_eq!(mode, PresetMode::Custom);
        assert!(
            catalog()
                .select(&PresetSelection::Custom("  ".to_string()))
                .is_err()
        );
    }

    #[test]
    fn default_from_config_must_exist() {
        let mut config = OrchestratorConfig::default();
        config
            .presets
            .insert("cat".to_string(), "You are a cat.".to_string());
        config.default_preset = Some("dog".to_string());
        assert!(PresetCatalog::from_config(&config).default_preset().is_none());

        config.default_preset = Some("cat".to_string());
        let catalog = PresetCatalog::from_config(&config);
        assert_eq!(
            catalog.default_preset().and_then(|p| p.name),
            Some("cat".to_string())
        );
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["cat"]);
    }
}
