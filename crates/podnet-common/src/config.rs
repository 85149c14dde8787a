//! Global configuration model for the podnet runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{PodnetError, Result};

/// Root configuration for the podnet runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodnetConfig {
    /// Base directory for podnet state and data.
    pub data_dir: PathBuf,
    /// Directory holding `*.conf` network definitions.
    pub net_conf_dir: PathBuf,
    /// Directories searched for plugin binaries, in order.
    pub plugin_dirs: Vec<PathBuf>,
    /// Deadline for a single plugin invocation, in milliseconds.
    pub plugin_timeout_ms: u64,
    /// Explicit path to `iptables`; looked up on `PATH` when unset.
    pub iptables_path: Option<PathBuf>,
}

impl Default for PodnetConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            net_conf_dir: PathBuf::from(constants::DEFAULT_NET_CONF_DIR),
            plugin_dirs: constants::DEFAULT_PLUGIN_DIRS
                .iter()
                .map(PathBuf::from)
                .collect(),
            plugin_timeout_ms: constants::DEFAULT_PLUGIN_TIMEOUT_MS,
            iptables_path: None,
        }
    }
}

impl PodnetConfig {
    /// Loads configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON, or
    /// if the resulting configuration fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| PodnetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin timeout is zero or no plugin
    /// directory is configured.
    pub fn validate(&self) -> Result<()> {
        if self.plugin_timeout_ms == 0 {
            return Err(PodnetError::Config {
                message: "plugin_timeout_ms must be greater than zero".into(),
            });
        }
        if self.plugin_dirs.is_empty() {
            return Err(PodnetError::Config {
                message: "at least one plugin directory is required".into(),
            });
        }
        Ok(())
    }

    /// Directory holding persisted setup records.
    #[must_use]
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join(constants::RECORDS_DIR_NAME)
    }

    /// Plugin deadline as a [`Duration`].
    #[must_use]
    pub const fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("podnet.json");
        std::fs::write(&path, r#"{"data_dir": "/tmp/pn", "plugin_timeout_ms": 500}"#)
            .expect("write");

        let config = PodnetConfig::load(&path).expect("load");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pn"));
        assert_eq!(config.plugin_timeout(), Duration::from_millis(500));
        assert_eq!(
            config.net_conf_dir,
            PathBuf::from(constants::DEFAULT_NET_CONF_DIR)
        );
        assert_eq!(config.records_dir(), PathBuf::from("/tmp/pn/netrecords"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = PodnetConfig {
            plugin_timeout_ms: 0,
            ..PodnetConfig::default()
        };
        assert!(matches!(config.validate(), Err(PodnetError::Config { .. })));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PodnetConfig::load(Path::new("/nonexistent/podnet.json")).unwrap_err();
        assert!(matches!(err, PodnetError::Io { .. }));
    }
}
