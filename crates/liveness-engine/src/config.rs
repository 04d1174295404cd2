//! Engine configuration.
//!
//! Loaded via the `config` crate from an optional file, then environment
//! variables prefixed `LIVENESS__` (e.g. `LIVENESS__LOOKAHEAD_MINUTES=2`).
//! Later sources override earlier ones; anything unset keeps its default.

use std::path::Path;

use chrono::Duration;
use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Settings for periodic and event-driven passes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// How often the external scheduler runs the periodic pass.
    #[serde(default = "default_cadence_minutes")]
    pub cadence_minutes: i64,

    /// How far ahead of the wall clock a periodic pass evaluates, so
    /// occurrences starting on a tick boundary activate early rather than late.
    #[serde(default = "default_lookahead_minutes")]
    pub lookahead_minutes: i64,

    /// Days either side of `now` whose occurrences are reconciliation candidates.
    #[serde(default = "default_candidate_radius_days")]
    pub candidate_radius_days: i64,
}

fn default_cadence_minutes() -> i64 {
    15
}

fn default_lookahead_minutes() -> i64 {
    1
}

fn default_candidate_radius_days() -> i64 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cadence_minutes: default_cadence_minutes(),
            lookahead_minutes: default_lookahead_minutes(),
            candidate_radius_days: default_candidate_radius_days(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (if given) and the environment, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the file cannot be read,
    /// a value has the wrong type, or [`validate`](Self::validate) fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded: Self = builder
            .add_source(
                config::Environment::with_prefix("LIVENESS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] unless `cadence >= 1`,
    /// `0 <= lookahead < cadence` and `radius >= 1`.
    pub fn validate(&self) -> Result<()> {
        if self.cadence_minutes < 1 {
            return Err(EngineError::Configuration(format!(
                "cadence_minutes must be at least 1, got {}",
                self.cadence_minutes
            )));
        }
        if !(0..self.cadence_minutes).contains(&self.lookahead_minutes) {
            return Err(EngineError::Configuration(format!(
                "lookahead_minutes must be in 0..{}, got {}",
                self.cadence_minutes, self.lookahead_minutes
            )));
        }
        if self.candidate_radius_days < 1 {
            return Err(EngineError::Configuration(format!(
                "candidate_radius_days must be at least 1, got {}",
                self.candidate_radius_days
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn lookahead(&self) -> Duration {
        Duration::minutes(self.lookahead_minutes)
    }

    #[must_use]
    pub fn candidate_radius(&self) -> Duration {
        Duration::days(self.candidate_radius_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cadence_minutes, 15);
        assert_eq!(config.lookahead_minutes, 1);
        assert_eq!(config.candidate_radius_days, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "lookahead_minutes = 3").unwrap();
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lookahead_minutes, 3);
        assert_eq!(config.cadence_minutes, 15);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "cadence_minutes = 5\nlookahead_minutes = 5").unwrap();
        assert!(matches!(
            EngineConfig::load(Some(file.path())),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = EngineConfig::load(Some(Path::new("/nonexistent/liveness.toml")));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
