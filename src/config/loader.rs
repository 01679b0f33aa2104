//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/mgtd/config.toml`
//! 3. User config: `~/.config/mgtd/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! Missing system and user files are skipped. A missing `--config` file is
//! an error.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/mgtd/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "mgtd";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources, then validate it.
    pub fn load(&self, extra: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(path) = extra {
            match self.load_file(path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::DigestKind;
    use tempfile::tempdir;

    #[test]
    fn test_missing_files_use_defaults() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_paths(
            dir.path().join("nonexistent_system.toml"),
            dir.path().join("nonexistent_user.toml"),
        );

        let config = loader.load(None).unwrap();
        assert_eq!(config.control.auth_failure_limit(), 3);
        assert!(config.params.is_empty());
    }

    #[test]
    fn test_user_config_overrides_system() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("system.toml"),
            "[control]\nauth_failure_limit = 10\ndigest = \"newline-framed\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("user.toml"),
            "[control]\nauth_failure_limit = 2\n",
        )
        .unwrap();

        let loader =
            ConfigLoader::with_paths(dir.path().join("system.toml"), dir.path().join("user.toml"));
        let config = loader.load(None).unwrap();

        assert_eq!(config.control.auth_failure_limit(), 2);
        assert_eq!(config.control.digest(), DigestKind::NewlineFramed);
    }

    #[test]
    fn test_cli_config_has_last_word() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[params]\ndefault_ttl = 10\n").unwrap();
        let extra = dir.path().join("extra.toml");
        fs::write(&extra, "[params]\ndefault_ttl = 20\n").unwrap();

        let loader =
            ConfigLoader::with_paths(dir.path().join("none.toml"), dir.path().join("user.toml"));
        let config = loader.load(Some(&extra)).unwrap();

        assert_eq!(config.params["default_ttl"].to_string(), "20");
    }

    #[test]
    fn test_missing_cli_config_is_error() {
        let dir = tempdir().unwrap();
        let loader =
            ConfigLoader::with_paths(dir.path().join("a.toml"), dir.path().join("b.toml"));
        let err = loader.load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("user.toml"), "[control\n").unwrap();
        let loader =
            ConfigLoader::with_paths(dir.path().join("none.toml"), dir.path().join("user.toml"));
        assert!(matches!(loader.load(None), Err(ConfigError::Parse { .. })));
    }
}
