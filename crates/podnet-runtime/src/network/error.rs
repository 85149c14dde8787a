//! Error taxonomy for network provisioning.

use std::time::Duration;

use podnet_common::error::PodnetError;
use podnet_common::types::PodId;
use thiserror::Error;

/// Errors raised while provisioning or tearing down pod networking.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Input was malformed or incomplete. Nothing on the host was touched.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The (pod, network) pair is already leased.
    #[error("lease conflict: pod {pod} already holds network {network:?}")]
    LeaseConflict {
        /// Pod that requested the lease.
        pod: PodId,
        /// Network name of the contested lease.
        network: String,
    },

    /// The plugin could not be run or exited unsuccessfully.
    #[error("plugin {plugin:?} failed for network {network:?}: {message}")]
    PluginExecution {
        /// Plugin type (binary name).
        plugin: String,
        /// Network the plugin was invoked for.
        network: String,
        /// Process exit code, if it exited normally.
        exit_code: Option<i32>,
        /// Error code from the plugin's error payload, if any.
        plugin_code: Option<u32>,
        /// Human-readable failure description.
        message: String,
    },

    /// The plugin succeeded but its result payload was malformed.
    #[error("plugin {plugin:?} returned an unparsable result for network {network:?}: {message}")]
    PluginResultParse {
        /// Plugin type (binary name).
        plugin: String,
        /// Network the plugin was invoked for.
        network: String,
        /// Parse failure description.
        message: String,
    },

    /// The plugin did not finish before its deadline and was killed.
    #[error("plugin {plugin:?} timed out after {timeout:?} for network {network:?}")]
    Timeout {
        /// Plugin type (binary name).
        plugin: String,
        /// Network the plugin was invoked for.
        network: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("network setup cancelled for pod {pod}")]
    Cancelled {
        /// Pod whose setup was cancelled.
        pod: PodId,
    },

    /// Installing or removing a masquerade rule failed.
    #[error("masquerade for network {network:?} failed: {source}")]
    Masquerade {
        /// Network the rule belongs to.
        network: String,
        /// Underlying host error.
        source: PodnetError,
    },

    /// A host-level operation (I/O, serialization, locking) failed.
    #[error(transparent)]
    Host(#[from] PodnetError),
}

impl NetworkError {
    /// Whether this error belongs to the plugin-failure class: execution
    /// failure, unparsable result, or timeout.
    #[must_use]
    pub const fn is_plugin_failure(&self) -> bool {
        matches!(
            self,
            Self::PluginExecution { .. } | Self::PluginResultParse { .. } | Self::Timeout { .. }
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Result alias for network provisioning.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// A failed setup, after rollback has completed.
///
/// `source` is the error that aborted setup. Errors hit while undoing
/// already-completed work are kept in `rollback_errors`; they never
/// replace the original cause.
#[derive(Debug, Error)]
#[error(
    "network setup for pod {pod} failed{}: {source}{}",
    attachment_suffix(.attachment),
    rollback_suffix(.rollback_errors)
)]
pub struct SetupFailure {
    /// Pod whose setup failed.
    pub pod: PodId,
    /// Network attachment being processed when the failure happened.
    pub attachment: Option<String>,
    /// Original cause.
    #[source]
    pub source: NetworkError,
    /// Secondary failures encountered during rollback.
    pub rollback_errors: Vec<NetworkError>,
}

impl SetupFailure {
    /// A failure that needed no rollback.
    #[must_use]
    pub const fn new(pod: PodId, attachment: Option<String>, source: NetworkError) -> Self {
        Self {
            pod,
            attachment,
            source,
            rollback_errors: Vec::new(),
        }
    }
}

#[allow(clippy::ref_option)]
fn attachment_suffix(attachment: &Option<String>) -> String {
    attachment
        .as_ref()
        .map(|a| format!(" at {a:?}"))
        .unwrap_or_default()
}

fn rollback_suffix(errors: &[NetworkError]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" ({} rollback error(s))", errors.len())
    }
}
