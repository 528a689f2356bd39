//! File configuration for the runwarden binary.
//!
//! An optional TOML file supplies defaults; CLI flags override single fields.
//!
//! ```toml
//! log_level = "info"
//!
//! [controller]
//! workers = 4
//! timeout_secs = 1800
//! namespace = "ci"
//! ```

use std::path::{Path, PathBuf};

use runwarden_reconciler::ControllerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] runwarden_reconciler::Error),
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Engine settings shared by every controller.
    pub controller: ControllerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            controller: ControllerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load `path`, or the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns `Read` if the file cannot be read and `Parse` if it is not
    /// valid TOML.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply the CLI's global overrides.
    #[must_use]
    pub fn with_cli_overrides(mut self, cli: &Cli) -> Self {
        if let Some(workers) = cli.workers {
            self.controller.workers = workers;
        }
        if let Some(namespace) = &cli.namespace {
            self.controller.namespace = Some(namespace.clone());
        }
        if let Some(timeout) = cli.timeout_secs {
            self.controller.timeout_secs = timeout;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        self
    }

    /// Check the engine settings.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` with the engine's reason.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        Ok(())
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns `Render` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use clap::Parser;

    #[test]
    fn test_missing_path_gives_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            log_level = "debug"

            [controller]
            workers = 8
            namespace = "ci"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.controller.workers, 8);
        assert_eq!(config.controller.namespace.as_deref(), Some("ci"));
        assert_eq!(config.controller.timeout_secs, 3600);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let result = AppConfig::from_toml_str("workers = [");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unreadable_file_names_path() {
        let path = Path::new("/nonexistent/runwarden.toml");
        let err = AppConfig::load(Some(path)).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/runwarden.toml"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::try_parse_from([
            "runwarden",
            "--workers",
            "6",
            "--log-level",
            "trace",
            "config",
        ])
        .unwrap();
        let config = AppConfig::from_toml_str("[controller]\nworkers = 2\ntimeout_secs = 60")
            .unwrap()
            .with_cli_overrides(&cli);

        assert_eq!(config.controller.workers, 6);
        assert_eq!(config.controller.timeout_secs, 60);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_workers_invalid() {
        let config = AppConfig::from_toml_str("[controller]\nworkers = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_render_parses_back() {
        let mut config = AppConfig::default();
        config.controller.namespace = Some("ci".to_string());
        let text = config.to_toml_string().unwrap();
        assert_eq!(AppConfig::from_toml_str(&text).unwrap(), config);
    }
}
