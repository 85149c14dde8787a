//! Pod network provisioning.
//!
//! Descriptors describe one attachment independent of the backend. The
//! namespace backend produces them by running plugins ([`plugin`]) under
//! [`setup::NetworkSetup`]; the KVM backend receives them ready-made and
//! turns them into hypervisor and kernel arguments ([`kvm`]). Leases
//! ([`lease`]) guard against double allocation, and
//! [`teardown::TeardownCoordinator`] reverses setup from the persisted
//! record.

pub mod cancel;
pub mod descriptor;
pub mod error;
pub mod kvm;
pub mod lease;
pub mod netconf;
pub mod plugin;
pub mod result;
pub mod setup;
pub mod teardown;
#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use descriptor::{NetDescriber, NetworkDescriptor};
pub use error::{NetworkError, SetupFailure};
pub use kvm::{KvmNetArgs, kvm_net_args};
pub use lease::{Lease, LeaseKey, LeaseStore, LivenessCheck};
pub use netconf::{NetConfCatalog, NetworkConf};
pub use plugin::{ExecPluginInvoker, PluginInvoker};
pub use setup::{AttachmentRequest, NetworkSetup};
pub use teardown::{TeardownCoordinator, TeardownReport};
