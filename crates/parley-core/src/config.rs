//! Service configuration: catalog locations, flow settings and per-call tuning.
//!
//! Precedence: environment (`PARLEY_` prefix, `__` between section and key) > TOML file named by
//! `PARLEY_CONFIG` (default `config/parley.toml`, optional) > built-in defaults.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_CATALOGS__GOALS_PATH | config/goals.json | Goal catalog |
//! | PARLEY_CATALOGS__DIALOGUE_MAP_PATH | config/dialogue_flow.json | Dialogue map |
//! | PARLEY_CALL__START_STATE | start_greeting | State greeted with at call start |
//! | PARLEY_CALL__INBOUND_BUFFER_CAPACITY | 100 | Audio chunks buffered before the producer blocks |
//! | PARLEY_CALL__RECOGNITION_ERROR_LIMIT | 5 | Consecutive recognizer errors before the call fails |

use crate::catalog::{DialogueMap, GoalCatalog};
use crate::error::CoreResult;
use crate::flow::FlowSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG_PATH: &str = "config/parley.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogPaths {
    pub goals_path: PathBuf,
    pub dialogue_map_path: PathBuf,
}

impl Default for CatalogPaths {
    fn default() -> Self {
        Self {
            goals_path: PathBuf::from("config/goals.json"),
            dialogue_map_path: PathBuf::from("config/dialogue_flow.json"),
        }
    }
}

/// Both catalogs, shared read-only across calls.
#[derive(Debug, Clone)]
pub struct Catalogs {
    pub goals: Arc<GoalCatalog>,
    pub dialogue: Arc<DialogueMap>,
}

impl CatalogPaths {
    pub fn load(&self) -> CoreResult<Catalogs> {
        Ok(Catalogs {
            goals: Arc::new(GoalCatalog::load(&self.goals_path)?),
            dialogue: Arc::new(DialogueMap::load(&self.dialogue_map_path)?),
        })
    }
}

/// Per-call tuning for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub start_state: String,
    /// Cached response played whenever synthesis is unavailable or generation is unsafe.
    pub fallback_cache_key: String,
    pub inbound_buffer_capacity: usize,
    pub recognition_error_limit: u32,
    pub classifier_max_attempts: u32,
    pub classifier_backoff_ms: u64,
    /// Chunks buffered per playlist item ahead of the writer.
    pub lane_capacity: usize,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            start_state: "start_greeting".to_string(),
            fallback_cache_key: "non_secure_response".to_string(),
            inbound_buffer_capacity: 100,
            recognition_error_limit: 5,
            classifier_max_attempts: 2,
            classifier_backoff_ms: 50,
            lane_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub catalogs: CatalogPaths,
    pub flow: FlowSettings,
    pub call: CallSettings,
}

impl ParleyConfig {
    /// Load from `PARLEY_CONFIG` (or the default path) and the environment.
    pub fn load() -> CoreResult<Self> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file (skipped when absent) and the environment.
    pub fn load_from(path: &Path) -> CoreResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> CoreResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ParleyConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.call.inbound_buffer_capacity, 100);
        assert_eq!(config.flow.summary_state, "summary_single");
    }

    #[test]
    fn file_overrides_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.toml");

        let mut config = ParleyConfig::default();
        config.call.start_state = "hello".into();
        config.flow.guide_back_depth = 4;
        config.save_to_path(&path).unwrap();

        let loaded = ParleyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.call.start_state, "hello");
        assert_eq!(loaded.flow.guide_back_depth, 4);
        assert_eq!(loaded.call.fallback_cache_key, "non_secure_response");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        fs::write(&path, "[call]\nrecognition_error_limit = 9\n").unwrap();

        let loaded = ParleyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.call.recognition_error_limit, 9);
        assert_eq!(loaded.call.classifier_max_attempts, 2);
        assert_eq!(loaded.catalogs, CatalogPaths::default());
    }

    #[test]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        fs::write(&path, "[call]\nlane_capacity = 8\n").unwrap();

        std::env::set_var("PARLEY_CALL__LANE_CAPACITY", "64");
        let loaded = ParleyConfig::load_from(&path);
        std::env::remove_var("PARLEY_CALL__LANE_CAPACITY");

        let loaded = loaded.unwrap();
        assert_eq!(loaded.call.lane_capacity, 64);
        assert_eq!(loaded.call.start_state, CallSettings::default().start_state);
    }
}
