/// Game configuration, read from a RON file.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::schema::entity::EntityId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid entity '{entry}' in new_game_stack: {message}")]
    InvalidEntity { entry: String, message: String },
}

/// Every field is optional in the file; missing ones take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub story_dir: PathBuf,
    pub save_dir: PathBuf,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Stack a new player starts with, bottom first, as `kind:name`.
    pub new_game_stack: Vec<String>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Send logs here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            story_dir: PathBuf::from("story"),
            save_dir: PathBuf::from("saves"),
            seed: None,
            new_game_stack: vec![
                "location:berk_square".to_string(),
                "init:prologue".to_string(),
            ],
            log_filter: "warn".to_string(),
            log_file: None,
        }
    }
}

impl GameConfig {
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.is_file() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn new_game_stack(&self) -> Result<Vec<EntityId>, ConfigError> {
        self.new_game_stack
            .iter()
            .map(|entry| {
                entry.parse::<EntityId>().map_err(|message| ConfigError::InvalidEntity {
                    entry: entry.clone(),
                    message,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let config = GameConfig::from_ron_str("()").unwrap();
        assert_eq!(config, GameConfig::default());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config = GameConfig::from_ron_str(
            r#"(
                story_dir: "content/story",
                seed: Some(99),
                new_game_stack: ["location:cove"],
            )"#,
        )
        .unwrap();
        assert_eq!(config.story_dir, PathBuf::from("content/story"));
        assert_eq!(config.save_dir, PathBuf::from("saves"));
        assert_eq!(config.seed, Some(99));
        assert_eq!(
            config.new_game_stack().unwrap(),
            vec![EntityId::location("cove")]
        );
    }

    #[test]
    fn bad_stack_entry_is_rejected() {
        let config = GameConfig::from_ron_str(r#"(new_game_stack: ["cove"])"#).unwrap();
        assert!(matches!(
            config.new_game_stack(),
            Err(ConfigError::InvalidEntity { .. })
        ));
    }

    #[test]
    fn malformed_ron_is_an_error() {
        assert!(matches!(
            GameConfig::from_ron_str("(seed: \"many\")"),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GameConfig::load_or_default(&dir.path().join("game.ron")).unwrap();
        assert_eq!(config, GameConfig::default());
    }
}
