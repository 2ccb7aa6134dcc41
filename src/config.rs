//! Layered configuration for the symbol database.
//!
//! Sources are merged in order: built-in defaults, then a TOML file, then
//! environment variables.
//!
//! # Environment Variables
//!
//! Variables are prefixed with `TOKENDEX_` and use double underscores to
//! separate nested levels:
//! - `TOKENDEX_CASE_SENSITIVE_SEARCH=false` sets `case_sensitive_search`
//! - `TOKENDEX_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the persisted tree image.
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Default case sensitivity for name searches.
    #[serde(default = "default_true")]
    pub case_sensitive_search: bool,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level: error, warn, info, debug or trace.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides, e.g. `tree = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}
fn default_index_path() -> PathBuf {
    PathBuf::from(".tokendex/index")
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_path: default_index_path(),
            case_sensitive_search: true,
            logging: LoggingConfig::default(),
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

impl Settings {
    /// Load configuration from all sources, starting at
    /// `.tokendex/settings.toml` in the current directory.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from(PathBuf::from(".tokendex/settings.toml"))
    }

    /// Load configuration with a specific TOML file layered over the
    /// defaults and under the environment.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            // Double underscore separates nested levels; single
            // underscores stay inside field names.
            .merge(Env::prefixed("TOKENDEX_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Save the current configuration as pretty TOML.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert!(settings.case_sensitive_search);
        assert_eq!(settings.index_path, PathBuf::from(".tokendex/index"));
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        std::fs::write(
            &config_path,
            r#"
case_sensitive_search = false

[logging]
default = "debug"

[logging.modules]
tree = "trace"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert!(!settings.case_sensitive_search);
        assert_eq!(settings.logging.default, "debug");
        assert_eq!(settings.logging.modules["tree"], "trace");
        // Untouched keys keep their defaults.
        assert_eq!(settings.version, 1);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("/nonexistent/settings.toml").unwrap();
        assert!(settings.case_sensitive_search);
    }

    #[test]
    fn test_save_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested/settings.toml");

        let mut settings = Settings::default();
        settings.case_sensitive_search = false;
        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert!(!loaded.case_sensitive_search);
    }
}
