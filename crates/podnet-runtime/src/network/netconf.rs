//! Network definitions.
//!
//! A network is a JSON document with at least `name` and `type` (the
//! plugin binary). The whole document is handed to the plugin unchanged,
//! apart from `name` which is forced to the network name.

use std::path::Path;

use podnet_common::constants::{DEFAULT_NETWORK, DEFAULT_RESTRICTED_NETWORK, NET_CONF_EXTENSION};
use podnet_common::error::PodnetError;
use serde::Deserialize;
use serde_json::{Value, json};

use super::error::{NetworkError, Result};

/// A parsed network definition.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConf {
    name: String,
    plugin_type: String,
    ip_masq: bool,
    raw: Value,
}

#[derive(Deserialize)]
struct ConfHeader {
    name: Option<String>,
    #[serde(rename = "type")]
    plugin_type: String,
    #[serde(default, rename = "ipMasq")]
    ip_masq: bool,
}

impl NetworkConf {
    /// Parses a definition whose `name` must be present.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the document is not an object, lacks `name`
    /// or `type`, or names an empty plugin type.
    pub fn from_value(raw: Value) -> Result<Self> {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NetworkError::validation("network definition has no \"name\""))?
            .to_string();
        Self::named(&name, raw)
    }

    /// Parses a definition for network `name`.
    ///
    /// A `name` field inside the document is optional but must match.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the document is malformed or names a
    /// different network.
    pub fn named(name: &str, mut raw: Value) -> Result<Self> {
        if name.is_empty() {
            return Err(NetworkError::validation("network name is empty"));
        }
        let header: ConfHeader = serde_json::from_value(raw.clone()).map_err(|e| {
            NetworkError::validation(format!("network {name:?}: invalid definition: {e}"))
        })?;
        if let Some(inner) = header.name.as_deref() {
            if inner != name {
                return Err(NetworkError::validation(format!(
                    "network {name:?}: definition is named {inner:?}"
                )));
            }
        }
        if header.plugin_type.is_empty() || header.plugin_type.contains('/') {
            return Err(NetworkError::validation(format!(
                "network {name:?}: invalid plugin type {:?}",
                header.plugin_type
            )));
        }
        if let Some(object) = raw.as_object_mut() {
            let _ = object.insert("name".into(), Value::String(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            plugin_type: header.plugin_type,
            ip_masq: header.ip_masq,
            raw,
        })
    }

    /// Built-in definitions available without any configuration files.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        let (ip_masq, subnet) = match name {
            DEFAULT_NETWORK => (true, "172.16.28.0/24"),
            DEFAULT_RESTRICTED_NETWORK => (false, "172.17.0.0/16"),
            _ => return None,
        };
        let raw = json!({
            "name": name,
            "type": "ptp",
            "ipMasq": ip_masq,
            "ipam": {
                "type": "host-local",
                "subnet": subnet,
                "routes": [{"dst": "0.0.0.0/0"}],
            },
        });
        Self::named(name, raw).ok()
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin binary name.
    #[must_use]
    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    /// Whether the network masquerades guest egress.
    #[must_use]
    pub const fn ip_masq(&self) -> bool {
        self.ip_masq
    }

    /// Document passed to the plugin on standard input.
    #[must_use]
    pub const fn plugin_config(&self) -> &Value {
        &self.raw
    }
}

/// Network definitions loaded from a directory, plus the built-ins.
#[derive(Debug, Clone, Default)]
pub struct NetConfCatalog {
    confs: Vec<NetworkConf>,
}

impl NetConfCatalog {
    /// Loads every `*.conf` file in `dir`, in lexical filename order.
    ///
    /// A missing directory yields an empty catalog. When two files define
    /// the same network, the first one wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a file cannot be read, or a
    /// file is not a valid network definition.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "network configuration directory absent");
            return Ok(Self::default());
        }
        let io_err = |e| PodnetError::Io {
            path: dir.to_path_buf(),
            source: e,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == NET_CONF_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut catalog = Self::default();
        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|e| PodnetError::Io {
                path: path.clone(),
                source: e,
            })?;
            let raw: Value = serde_json::from_str(&content).map_err(|e| {
                NetworkError::validation(format!("{}: invalid JSON: {e}", path.display()))
            })?;
            let conf = NetworkConf::from_value(raw)?;
            if catalog.confs.iter().any(|c| c.name == conf.name) {
                tracing::warn!(
                    network = %conf.name,
                    path = %path.display(),
                    "duplicate network definition ignored"
                );
                continue;
            }
            tracing::debug!(network = %conf.name, plugin = %conf.plugin_type, "loaded network definition");
            catalog.confs.push(conf);
        }
        Ok(catalog)
    }

    /// Looks a network up by name, falling back to the built-ins.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if no such network is defined.
    pub fn get(&self, name: &str) -> Result<NetworkConf> {
        self.confs
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .or_else(|| NetworkConf::builtin(name))
            .ok_or_else(|| NetworkError::validation(format!("unknown network {name:?}")))
    }

    /// Networks defined by files, in load order.
    #[must_use]
    pub fn networks(&self) -> &[NetworkConf] {
        &self.confs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_forces_name_into_plugin_config() {
        let conf = NetworkConf::named("lan", json!({"type": "bridge", "ipMasq": true})).unwrap();
        assert_eq!(conf.plugin_type(), "bridge");
        assert!(conf.ip_masq());
        assert_eq!(conf.plugin_config()["name"], "lan");
    }

    #[test]
    fn mismatched_inner_name_is_rejected() {
        let err = NetworkConf::named("lan", json!({"name": "wan", "type": "bridge"})).unwrap_err();
        assert!(matches!(err, NetworkError::Validation { .. }));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(NetworkConf::named("lan", json!({"name": "lan"})).is_err());
        assert!(NetworkConf::named("lan", json!({"type": "../evil"})).is_err());
        assert!(NetworkConf::from_value(json!({"type": "ptp"})).is_err());
    }

    #[test]
    fn builtins_cover_default_networks() {
        let default = NetworkConf::builtin("default").unwrap();
        assert!(default.ip_masq());
        assert_eq!(default.plugin_type(), "ptp");
        let restricted = NetworkConf::builtin("default-restricted").unwrap();
        assert!(!restricted.ip_masq());
        assert!(NetworkConf::builtin("other").is_none());
    }

    #[test]
    fn catalog_loads_in_lexical_order_first_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("20-lan.conf"),
            r#"{"name": "lan", "type": "macvlan"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10-lan.conf"),
            r#"{"name": "lan", "type": "bridge"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README"), "ignored").unwrap();

        let catalog = NetConfCatalog::load(dir.path()).expect("load");
        assert_eq!(catalog.networks().len(), 1);
        assert_eq!(catalog.get("lan").unwrap().plugin_type(), "bridge");
        assert!(catalog.get("default").is_ok());
        assert!(catalog.get("missing").is_err());
    }

    #[test]
    fn catalog_of_missing_dir_is_empty() {
        let catalog = NetConfCatalog::load(Path::new("/nonexistent/net.d")).expect("load");
        assert!(catalog.networks().is_empty());
    }

    #[test]
    fn file_definitions_override_builtins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("default.conf"),
            r#"{"name": "default", "type": "bridge"}"#,
        )
        .unwrap();
        let catalog = NetConfCatalog::load(dir.path()).expect("load");
        assert_eq!(catalog.get("default").unwrap().plugin_type(), "bridge");
    }
}
