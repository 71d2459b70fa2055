//! Runner configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `HARNESS_*` environment variables. Command-line flags are applied last by
//! the runner binary itself.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),
}

/// Settings for the runner binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Glob matching bundle executables.
    pub bundle_glob: String,
    /// Directory receiving run results.
    pub out_dir: PathBuf,
    /// Root of per-package data directories.
    pub data_dir: PathBuf,
    /// SIGTERM other runner instances before starting.
    pub kill_stale_runners: bool,
    /// Overrides every test's grace period after its timeout, when set.
    #[serde(with = "opt_duration", skip_serializing_if = "Option::is_none")]
    pub exit_timeout: Option<Duration>,
    /// Skip tests whose software dependencies are unavailable.
    pub check_test_deps: bool,
    pub available_software_features: Vec<String>,
    pub unavailable_software_features: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let data_root = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("harness");
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("harness");
        Self {
            bundle_glob: data_root.join("bundles").join("*").to_string_lossy().into_owned(),
            out_dir: cache_root.join("results"),
            data_dir: data_root.join("data"),
            kill_stale_runners: false,
            exit_timeout: None,
            check_test_deps: false,
            available_software_features: Vec::new(),
            unavailable_software_features: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Default config file location, `<config dir>/harness/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("harness").join("config.toml"))
    }

    /// Load from `path` (or the default location if it exists), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        let mut config = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded runner config");
        Ok(config)
    }

    /// Apply `HARNESS_*` overrides, reporting every bad variable at once.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        self.bundle_glob = parser.get_string("BUNDLE_GLOB", &self.bundle_glob).value;
        self.out_dir = parser.get_path("OUT_DIR", self.out_dir.clone(), false).value;
        self.data_dir = parser.get_path("DATA_DIR", self.data_dir.clone(), false).value;
        self.kill_stale_runners = parser.get_bool("KILL_STALE", self.kill_stale_runners).value;
        self.check_test_deps = parser.get_bool("CHECK_DEPS", self.check_test_deps).value;
        let exit_timeout = parser.get_duration("EXIT_TIMEOUT", self.exit_timeout.unwrap_or_default());
        if exit_timeout.is_from_env() {
            self.exit_timeout = Some(exit_timeout.value);
        }
        self.available_software_features = parser
            .get_string_list("AVAILABLE_FEATURES", self.available_software_features.clone())
            .value;
        self.unavailable_software_features = parser
            .get_string_list("UNAVAILABLE_FEATURES", self.unavailable_software_features.clone())
            .value;

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }
}

mod opt_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let _guard = env_test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
bundle_glob = "/opt/bundles/*"
exit_timeout = "45s"
available_software_features = ["chrome"]
"#,
        )
        .unwrap();

        let config = RunnerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bundle_glob, "/opt/bundles/*");
        assert_eq!(config.exit_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.available_software_features, vec!["chrome"]);
        assert_eq!(config.data_dir, RunnerConfig::default().data_dir);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let _guard = env_test_lock();
        let err = RunnerConfig::load(Some(Path::new("/no/such/harness.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_duration_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "exit_timeout = \"eventually\"\n").unwrap();
        assert!(matches!(
            RunnerConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides_file_and_collects_errors() {
        let _guard = env_test_lock();
        // SAFETY: env access in tests is serialized by env_test_lock
        unsafe {
            std::env::set_var("HARNESS_BUNDLE_GLOB", "/env/*");
            std::env::set_var("HARNESS_KILL_STALE", "yes");
        }
        let mut config = RunnerConfig::default();
        config.apply_env().unwrap();
        assert_eq!(config.bundle_glob, "/env/*");
        assert!(config.kill_stale_runners);

        // SAFETY: as above
        unsafe {
            std::env::set_var("HARNESS_CHECK_DEPS", "perhaps");
            std::env::set_var("HARNESS_EXIT_TIMEOUT", "later");
        }
        let err = RunnerConfig::default().apply_env().unwrap_err();
        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {other}"),
        }

        // SAFETY: as above
        unsafe {
            for var in [
                "HARNESS_BUNDLE_GLOB",
                "HARNESS_KILL_STALE",
                "HARNESS_CHECK_DEPS",
                "HARNESS_EXIT_TIMEOUT",
            ] {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_serializes_back_to_toml() {
        let config = RunnerConfig {
            exit_timeout: Some(Duration::from_secs(90)),
            ..RunnerConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("exit_timeout = \"1m 30s\""));
        let back: RunnerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
