//! Linux namespace handles used by network provisioning.
//!
//! The runtime never creates namespaces itself; it receives a handle to
//! the pod's network namespace from the isolation layer and passes the
//! path on to network plugins.

pub mod network;

pub use network::NetnsHandle;
