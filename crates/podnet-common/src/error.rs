//! Unified error types for the podnet workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that wraps
//! these common variants when appropriate.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PodnetError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource that must be unique already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the existing resource.
        kind: &'static str,
        /// Identifier of the existing resource.
        id: String,
    },

    /// A thread panicked while holding a shared lock.
    #[error("{what} lock poisoned")]
    LockPoisoned {
        /// The guarded resource.
        what: &'static str,
    },

    /// A host command ran but exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        /// Program that was executed.
        program: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PodnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display_includes_program_and_stderr() {
        let err = PodnetError::CommandFailed {
            program: "iptables".into(),
            code: Some(1),
            stderr: "Bad rule".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("iptables"));
        assert!(msg.contains("Bad rule"));
    }

    #[test]
    fn already_exists_names_kind_and_id() {
        let err = PodnetError::AlreadyExists {
            kind: "setup record",
            id: "pod-1".into(),
        };
        assert_eq!(err.to_string(), "setup record already exists: pod-1");
    }

    #[test]
    fn serde_error_converts_via_from() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: PodnetError = parse.unwrap_err().into();
        assert!(matches!(err, PodnetError::Serialization { .. }));
    }
}
