//! Network namespace handles.
//!
//! A handle is just the filesystem path of the namespace (a bind mount
//! under `/var/run/netns` or `/proc/<pid>/ns/net`). Plugins enter it
//! themselves.

use std::path::{Path, PathBuf};

use podnet_common::error::{PodnetError, Result};
use serde::{Deserialize, Serialize};

/// Handle to a pod's network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetnsHandle {
    path: PathBuf,
}

impl NetnsHandle {
    /// Handle to the network namespace of a running process.
    #[must_use]
    pub fn for_pid(pid: u32) -> Self {
        Self {
            path: PathBuf::from(format!("/proc/{pid}/ns/net")),
        }
    }

    /// Wraps a namespace path without checking it.
    ///
    /// Used when replaying a persisted record, where the namespace may
    /// already be gone.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens a handle to a namespace path that must exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing exists at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(PodnetError::NotFound {
                kind: "network namespace",
                id: path.display().to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "opened network namespace handle");
        Ok(Self { path })
    }

    /// Filesystem path of the namespace.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the namespace still exists on the host.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
