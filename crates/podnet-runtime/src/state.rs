//! Persistent setup records.
//!
//! Every pod with live networking has one JSON record under the records
//! directory. The record is an ordered log of what setup did, written
//! before each step takes effect, so teardown can replay it backwards
//! after a crash. Records are always replaced atomically.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use podnet_common::error::{PodnetError, Result};
use podnet_common::types::{Pod, PodId, PodNetState};
use podnet_core::masquerade::MasqRule;
use podnet_core::namespace::NetnsHandle;
use serde::{Deserialize, Serialize};

use crate::network::descriptor::NetworkDescriptor;
use crate::network::result::PluginResult;

const RECORD_EXTENSION: &str = "json";

/// Isolation backend a record was written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Network namespace configured by plugins.
    Namespace,
    /// Virtual machine configured by hypervisor arguments.
    Kvm,
}

/// One configured network attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachOp {
    /// Network name.
    pub network: String,
    /// Plugin that was invoked; `None` for KVM attachments.
    pub plugin: Option<String>,
    /// Host-side interface name.
    pub if_name: String,
    /// Guest-side device name (`eth<i>`).
    pub container_if: String,
    /// Configuration passed to the plugin.
    pub config: serde_json::Value,
    /// Plugin result; `None` while the ADD is still in flight.
    pub result: Option<PluginResult>,
    /// Resulting descriptor; `None` while the ADD is still in flight.
    pub descriptor: Option<NetworkDescriptor>,
}

impl AttachOp {
    /// Whether the attachment completed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.descriptor.is_some()
    }
}

/// One masquerade rule installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasqueradeOp {
    /// Network the rule belongs to.
    pub network: String,
    /// The rule.
    pub rule: MasqRule,
    /// Whether installation completed.
    pub installed: bool,
}

/// A step recorded by setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RecordOp {
    /// A network attachment.
    Attach(AttachOp),
    /// A masquerade rule.
    Masquerade(MasqueradeOp),
}

/// The persisted setup log of one pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRecord {
    /// Pod the record belongs to.
    pub pod: Pod,
    /// Backend the pod runs on.
    pub backend: BackendKind,
    /// Network namespace, for the namespace backend.
    pub netns: Option<NetnsHandle>,
    /// Lifecycle state.
    pub state: PodNetState,
    /// When setup began.
    pub created_at: DateTime<Utc>,
    /// Steps in the order they were taken.
    pub ops: Vec<RecordOp>,
}

impl SetupRecord {
    /// Starts an empty, active record.
    #[must_use]
    pub fn new(pod: Pod, backend: BackendKind, netns: Option<NetnsHandle>) -> Self {
        Self {
            pod,
            backend,
            netns,
            state: PodNetState::Active,
            created_at: Utc::now(),
            ops: Vec::new(),
        }
    }

    /// Attachments in setup order.
    pub fn attachments(&self) -> impl Iterator<Item = &AttachOp> {
        self.ops.iter().filter_map(|op| match op {
            RecordOp::Attach(attach) => Some(attach),
            RecordOp::Masquerade(_) => None,
        })
    }

    /// Descriptors of completed attachments, in setup order.
    #[must_use]
    pub fn descriptors(&self) -> Vec<NetworkDescriptor> {
        self.attachments()
            .filter_map(|a| a.descriptor.clone())
            .collect()
    }
}

/// Directory of setup records, one file per pod.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Opens the store, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| PodnetError::Io {
            path: dir.clone(),
            source: e,
        })?;
        tracing::debug!(dir = %dir.display(), "opened setup record store");
        Ok(Self { dir })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `pod_id`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pod ID cannot be used as a
    /// file name.
    pub fn path_for(&self, pod_id: &PodId) -> Result<PathBuf> {
        let id = pod_id.as_str();
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PodnetError::Config {
                message: format!("pod id {id:?} is not usable as a record name"),
            });
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Loads the record for `pod_id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, pod_id: &PodId) -> Result<Option<SetupRecord>> {
        let path = self.path_for(pod_id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PodnetError::Io { path, source: e }),
        }
    }

    /// Writes a new record, failing if the pod already has one.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a record already exists, or an I/O
    /// error if the write fails.
    pub fn create(&self, record: &SetupRecord) -> Result<()> {
        let path = self.path_for(&record.pod.id)?;
        let tmp = self.write_temp(record)?;
        let _ = tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                PodnetError::AlreadyExists {
                    kind: "setup record",
                    id: record.pod.id.to_string(),
                }
            } else {
                PodnetError::Io {
                    path: path.clone(),
                    source: e.error,
                }
            }
        })?;
        self.sync_dir();
        tracing::debug!(pod = %record.pod.id, "setup record created");
        Ok(())
    }

    /// Atomically replaces the record for `record.pod`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn save(&self, record: &SetupRecord) -> Result<()> {
        let path = self.path_for(&record.pod.id)?;
        let tmp = self.write_temp(record)?;
        let _ = tmp.persist(&path).map_err(|e| PodnetError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        self.sync_dir();
        tracing::debug!(pod = %record.pod.id, ops = record.ops.len(), "setup record saved");
        Ok(())
    }

    /// Deletes the record for `pod_id`. Returns `false` if none existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, pod_id: &PodId) -> Result<bool> {
        let path = self.path_for(pod_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.sync_dir();
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PodnetError::Io { path, source: e }),
        }
    }

    /// Loads every record in the store, sorted by pod ID.
    ///
    /// Unreadable records are skipped with a warning so that one corrupt
    /// file cannot block recovery of the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<SetupRecord>> {
        let io_err = |e| PodnetError::Io {
            path: self.dir.clone(),
            source: e,
        };
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_none_or(|ext| ext != RECORD_EXTENSION) {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(|e| PodnetError::Io {
                    path: path.clone(),
                    source: e,
                })
                .and_then(|bytes| Ok(serde_json::from_slice::<SetupRecord>(&bytes)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable setup record");
                }
            }
        }
        records.sort_by(|a, b| a.pod.id.cmp(&b.pod.id));
        Ok(records)
    }

    fn write_temp(&self, record: &SetupRecord) -> Result<tempfile::NamedTempFile> {
        let io_err = |e| PodnetError::Io {
            path: self.dir.clone(),
            source: e,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush().map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        Ok(tmp)
    }

    /// Makes the rename itself durable.
    fn sync_dir(&self) {
        if let Err(e) = File::open(&self.dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %self.dir.display(), error = %e, "directory sync failed");
        }
    }
}
