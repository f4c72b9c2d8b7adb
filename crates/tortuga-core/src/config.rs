//! Store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::{StoreError, StoreResult};

/// Default bound on short-code regeneration attempts.
pub const DEFAULT_SHORT_CODE_ATTEMPTS: u32 = 5;

/// Per-device configuration for the embedded store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file backing the store
    pub database_path: PathBuf,
    /// Identity written to `originTablet` on every record created here
    pub tablet_id: String,
    /// Letter(s) embedded in patient ids, e.g. `A` in `PT-A-001`
    pub tablet_prefix: String,
    /// How many short codes to try before giving up on a visit
    pub short_code_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("la_tortuga.db"),
            tablet_id: "tablet-A".to_string(),
            tablet_prefix: "A".to_string(),
            short_code_attempts: DEFAULT_SHORT_CODE_ATTEMPTS,
        }
    }
}

impl StoreConfig {
    pub fn new(
        database_path: impl Into<PathBuf>,
        tablet_id: impl Into<String>,
        tablet_prefix: impl Into<String>,
    ) -> Self {
        Self {
            database_path: database_path.into(),
            tablet_id: tablet_id.into(),
            tablet_prefix: tablet_prefix.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(contents: &str) -> StoreResult<Self> {
        let config: StoreConfig =
            toml::from_str(contents).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations that would produce unattributable or malformed
    /// records.
    pub fn validate(&self) -> StoreResult<()> {
        if self.tablet_id.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "tablet_id must not be empty".into(),
            ));
        }
        if self.tablet_prefix.is_empty()
            || !self.tablet_prefix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(StoreError::InvalidArgument(format!(
                "tablet_prefix must be non-empty and alphanumeric, got {:?}",
                self.tablet_prefix
            )));
        }
        if self.short_code_attempts == 0 {
            return Err(StoreError::InvalidArgument(
                "short_code_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.database_path, PathBuf::from("la_tortuga.db"));
        assert_eq!(config.short_code_attempts, DEFAULT_SHORT_CODE_ATTEMPTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = StoreConfig::from_toml_str(
            r#"
            database_path = "/data/intake.db"
            tablet_id = "tablet-C"
            tablet_prefix = "C"
            "#,
        )
        .unwrap();
        assert_eq!(config.tablet_id, "tablet-C");
        assert_eq!(config.tablet_prefix, "C");
        assert_eq!(config.short_code_attempts, DEFAULT_SHORT_CODE_ATTEMPTS);
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let result = StoreConfig::from_toml_str(r#"tablet_prefix = "A-1""#);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let result = StoreConfig::from_toml_str("tablet_id = ");
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tortuga.toml");
        std::fs::write(&path, "tablet_id = \"tablet-Z\"\nshort_code_attempts = 3\n").unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.tablet_id, "tablet-Z");
        assert_eq!(config.short_code_attempts, 3);

        assert!(matches!(
            StoreConfig::load(&dir.path().join("missing.toml")),
            Err(StoreError::Config(_))
        ));
    }
}
