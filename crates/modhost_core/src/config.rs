//! Host configuration.
//!
//! # Responsibility
//! - Load `HostConfig` from JSON text or a file.
//! - Validate values before any store or logger is opened.
//!
//! # Invariants
//! - A validated config has an absolute `log_dir` (when set), a supported
//!   `log_level` and a well-formed `profile` id (when set).

use crate::logging::LogLevel;
use crate::model::extension::{validate_extension_id, ModelValidationError};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    InvalidProfile(ModelValidationError),
    InvalidLogLevel(String),
    RelativeLogDir(PathBuf),
    EmptyDescriptorRoot,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::InvalidProfile(err) => write!(f, "invalid profile: {err}"),
            Self::InvalidLogLevel(level) => write!(
                f,
                "unsupported log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::RelativeLogDir(path) => {
                write!(f, "log_dir must be an absolute path, got `{}`", path.display())
            }
            Self::EmptyDescriptorRoot => write!(f, "descriptor_root cannot be empty"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::InvalidProfile(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Settings of one `ExtensionHost`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Active installation profile id.
    pub profile: Option<String>,
    /// SQLite file for extension records; in-memory when absent.
    pub database_path: Option<PathBuf>,
    /// Directory scanned recursively for `*.info` descriptors.
    pub descriptor_root: PathBuf,
    pub log_level: String,
    /// Logging stays off when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            profile: None,
            database_path: None,
            descriptor_root: PathBuf::from("extensions"),
            log_level: LogLevel::for_build().as_str().to_string(),
            log_dir: None,
        }
    }
}

impl HostConfig {
    /// Parses and validates JSON config text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    ///
    /// Relative `database_path` and `descriptor_root` values are resolved
    /// against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&text)?;

        if let Some(base) = path.parent() {
            if config.descriptor_root.is_relative() {
                config.descriptor_root = base.join(&config.descriptor_root);
            }
            if let Some(database_path) = config.database_path.as_mut() {
                if database_path.is_relative() {
                    *database_path = base.join(&*database_path);
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(profile) = self.profile.as_deref() {
            validate_extension_id(profile).map_err(ConfigError::InvalidProfile)?;
        }

        if LogLevel::parse(&self.log_level).is_none() {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        if let Some(log_dir) = self.log_dir.as_ref() {
            if !log_dir.is_absolute() {
                return Err(ConfigError::RelativeLogDir(log_dir.clone()));
            }
        }

        if self.descriptor_root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDescriptorRoot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, HostConfig};
    use std::path::PathBuf;

    #[test]
    fn missing_fields_take_defaults() {
        let config = HostConfig::from_json_str("{}").expect("empty object is valid");
        assert_eq!(config, HostConfig::default());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(matches!(
            HostConfig::from_json_str(r#"{"modules": []}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            HostConfig::from_json_str(r#"{"profile": "Bad Profile"}"#),
            Err(ConfigError::InvalidProfile(_))
        ));
        assert!(matches!(
            HostConfig::from_json_str(r#"{"log_level": "loud"}"#),
            Err(ConfigError::InvalidLogLevel(_))
        ));
        assert!(matches!(
            HostConfig::from_json_str(r#"{"log_dir": "logs"}"#),
            Err(ConfigError::RelativeLogDir(_))
        ));
    }

    #[test]
    fn from_file_resolves_relative_paths_against_config_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{"profile": "standard", "database_path": "data/registry.sqlite3", "descriptor_root": "ext"}"#,
        )
        .expect("write config");

        let config = HostConfig::from_file(&path).expect("config should load");
        assert_eq!(config.profile.as_deref(), Some("standard"));
        assert_eq!(config.descriptor_root, dir.path().join("ext"));
        assert_eq!(
            config.database_path,
            Some(dir.path().join(PathBuf::from("data/registry.sqlite3")))
        );
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = HostConfig::from_file(dir.path().join("missing.json"))
            .expect_err("missing file must fail");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
