//! Domain primitive types used across the podnet workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodId(String);

impl PodId {
    /// Creates a new pod ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random pod ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pod as seen by the network core: its identity plus the PID of the
/// process that owns its isolation boundary.
///
/// The PID is what orphan detection checks against the process table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pod {
    /// Pod identity, the first half of every lease key.
    pub id: PodId,
    /// PID of the pod's owning process.
    pub pid: u32,
}

impl Pod {
    /// Creates a pod reference.
    #[must_use]
    pub fn new(id: PodId, pid: u32) -> Self {
        Self { id, pid }
    }
}

/// Network lifecycle state of a pod.
///
/// Transitions are `Active -> TearingDown -> Torn`; teardown may only be
/// entered from `Active` or resumed from `TearingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PodNetState {
    /// Networking is set up and the setup record is live.
    Active,
    /// Teardown started and may have been interrupted.
    TearingDown,
    /// All attachments were reversed and the record deleted.
    Torn,
}

impl fmt::Display for PodNetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::TearingDown => write!(f, "tearing-down"),
            Self::Torn => write!(f, "torn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pod_ids_are_unique() {
        assert_ne!(PodId::generate(), PodId::generate());
    }

    #[test]
    fn pod_state_serializes_kebab_case() {
        let json = serde_json::to_string(&PodNetState::TearingDown).unwrap();
        assert_eq!(json, "\"tearing-down\"");
        assert_eq!(PodNetState::TearingDown.to_string(), "tearing-down");
    }
}
