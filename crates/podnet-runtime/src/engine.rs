//! Runtime engine that provisions and reclaims pod networking.

use std::collections::BTreeSet;
use std::sync::Arc;

use podnet_common::config::PodnetConfig;
use podnet_common::types::{Pod, PodId, PodNetState};
use podnet_core::interface::derive_host_if_name;
use podnet_core::masquerade::{IptablesMasquerader, Masquerader};
use podnet_core::namespace::NetnsHandle;

use crate::network::descriptor::NetworkDescriptor;
use crate::network::error::{Result, SetupFailure};
use crate::network::kvm::KvmNetArgs;
use crate::network::lease::{Allocation, HostProcessTable, Lease, LeaseKey, LeaseStore, LivenessCheck};
use crate::network::netconf::NetConfCatalog;
use crate::network::plugin::{ExecPluginInvoker, PluginInvoker};
use crate::network::setup::{AttachmentRequest, NetworkSetup};
use crate::network::teardown::{TeardownCoordinator, TeardownReport};
use crate::network::CancelToken;
use crate::state::{RecordStore, SetupRecord};

/// How a pod is isolated, with the network input that backend needs.
#[derive(Debug, Clone)]
pub enum PodNetworkBackend {
    /// Plugins configure attachments inside a network namespace.
    Namespace {
        /// The pod's network namespace.
        netns: NetnsHandle,
        /// Attachments, in guest device order.
        requests: Vec<AttachmentRequest>,
    },
    /// Attachments are passed to a virtual machine on its command line.
    Kvm {
        /// Statically configured descriptors, in guest device order.
        descriptors: Vec<NetworkDescriptor>,
    },
}

/// Networking of a successfully provisioned pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionedNetwork {
    /// Namespace pod; the descriptors reflect what the plugins assigned.
    Namespace {
        /// One descriptor per attachment.
        descriptors: Vec<NetworkDescriptor>,
    },
    /// KVM pod; `args` go to the hypervisor and guest kernel.
    Kvm {
        /// One descriptor per attachment.
        descriptors: Vec<NetworkDescriptor>,
        /// Hypervisor and kernel arguments.
        args: KvmNetArgs,
    },
}

impl ProvisionedNetwork {
    /// Descriptors in guest device order.
    #[must_use]
    pub fn descriptors(&self) -> &[NetworkDescriptor] {
        match self {
            Self::Namespace { descriptors } | Self::Kvm { descriptors, .. } => descriptors,
        }
    }

    /// KVM arguments, for KVM pods.
    #[must_use]
    pub const fn kvm_args(&self) -> Option<&KvmNetArgs> {
        match self {
            Self::Namespace { .. } => None,
            Self::Kvm { args, .. } => Some(args),
        }
    }
}

/// Outcome of the startup scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Leases restored from setup records.
    pub restored: usize,
    /// Pods whose owner had exited, torn down.
    pub reclaimed: Vec<TeardownReport>,
    /// Pods whose teardown could not complete, with the reason.
    pub failed: Vec<(PodId, String)>,
}

/// The runtime engine that coordinates pod network operations.
///
/// Holds the lease table shared by every pod in this process. The engine
/// is `Sync`; concurrent pods can be provisioned from different threads.
pub struct NetworkEngine {
    leases: Arc<LeaseStore>,
    records: RecordStore,
    catalog: NetConfCatalog,
    invoker: Box<dyn PluginInvoker>,
    masquerader: Box<dyn Masquerader>,
    liveness: Box<dyn LivenessCheck>,
}

impl NetworkEngine {
    /// Creates an engine wired to real plugins, `iptables` and the host
    /// process table.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be created or a
    /// network definition cannot be loaded.
    pub fn from_config(config: &PodnetConfig) -> Result<Self> {
        let records = RecordStore::open(config.records_dir())?;
        let catalog = NetConfCatalog::load(&config.net_conf_dir)?;
        let masquerader = IptablesMasquerader::locate(config.iptables_path.as_deref())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "iptables not found on PATH, masquerading will fail");
                IptablesMasquerader::with_binary("iptables")
            });
        tracing::debug!(
            records = %records.dir().display(),
            networks = catalog.networks().len(),
            "network engine configured"
        );
        Ok(Self::with_parts(
            Arc::new(LeaseStore::new()),
            records,
            Box::new(ExecPluginInvoker::from_config(config)),
            Box::new(masquerader),
            Box::new(HostProcessTable),
        )
        .with_catalog(catalog))
    }

    /// Creates an engine from explicit collaborators.
    #[must_use]
    pub fn with_parts(
        leases: Arc<LeaseStore>,
        records: RecordStore,
        invoker: Box<dyn PluginInvoker>,
        masquerader: Box<dyn Masquerader>,
        liveness: Box<dyn LivenessCheck>,
    ) -> Self {
        Self {
            leases,
            records,
            catalog: NetConfCatalog::default(),
            invoker,
            masquerader,
            liveness,
        }
    }

    /// Replaces the network definitions used by [`Self::attachment_request`].
    #[must_use]
    pub fn with_catalog(mut self, catalog: NetConfCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// The lease table.
    #[must_use]
    pub const fn leases(&self) -> &Arc<LeaseStore> {
        &self.leases
    }

    /// The setup record store.
    #[must_use]
    pub const fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Loaded network definitions.
    #[must_use]
    pub const fn catalog(&self) -> &NetConfCatalog {
        &self.catalog
    }

    /// Builds a namespace attachment request for a defined network.
    ///
    /// Without an explicit `if_name`, a stable name is derived from the
    /// pod and network.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the network is not defined.
    pub fn attachment_request(
        &self,
        pod_id: &PodId,
        network: &str,
        if_name: Option<&str>,
    ) -> Result<AttachmentRequest> {
        let conf = self.catalog.get(network)?;
        let if_name = if_name.map_or_else(
            || derive_host_if_name(pod_id.as_str(), network),
            ToString::to_string,
        );
        Ok(AttachmentRequest::from_conf(&conf, if_name))
    }

    /// Sets up networking for `pod` on the given backend.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupFailure`] after rolling back everything this call
    /// did.
    pub fn provision(
        &self,
        pod: &Pod,
        backend: PodNetworkBackend,
        cancel: &CancelToken,
    ) -> std::result::Result<ProvisionedNetwork, SetupFailure> {
        let setup = NetworkSetup::new(
            &self.leases,
            &self.records,
            self.invoker.as_ref(),
            self.masquerader.as_ref(),
        );
        match backend {
            PodNetworkBackend::Namespace { netns, requests } => {
                let descriptors = setup.run_namespace(pod, &netns, &requests, cancel)?;
                Ok(ProvisionedNetwork::Namespace { descriptors })
            }
            PodNetworkBackend::Kvm { descriptors } => {
                let args = setup.run_kvm(pod, &descriptors, cancel)?;
                Ok(ProvisionedNetwork::Kvm { descriptors, args })
            }
        }
    }

    /// Tears down networking for `pod_id`. A pod with nothing set up is
    /// reported as torn.
    ///
    /// Leases named by the setup record are restored first, so a process
    /// that did not run the setup still reports what it released.
    ///
    /// # Errors
    ///
    /// Returns an error only if the setup record cannot be read or
    /// deleted.
    pub fn teardown(&self, pod_id: &PodId) -> Result<TeardownReport> {
        if let Some(record) = self.records.load(pod_id)? {
            for lease in leases_from_record(&record) {
                let _ = self.leases.restore(lease)?;
            }
        }
        TeardownCoordinator::new(
            &self.leases,
            &self.records,
            self.invoker.as_ref(),
            self.masquerader.as_ref(),
        )
        .teardown(pod_id)
    }

    /// Startup scan: restores leases from setup records, then tears down
    /// every pod whose owner process is gone or whose teardown was
    /// interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the records directory cannot be listed or the
    /// lease table is unusable.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let records = self.records.list()?;
        let mut report = RecoveryReport::default();
        for record in &records {
            for lease in leases_from_record(record) {
                if self.leases.restore(lease)? {
                    report.restored += 1;
                }
            }
        }

        let mut stale: BTreeSet<PodId> = self
            .leases
            .scan_orphans(self.liveness.as_ref())?
            .into_iter()
            .map(|lease| lease.key.pod_id)
            .collect();
        for record in &records {
            if record.state == PodNetState::TearingDown || !self.liveness.is_alive(record.pod.pid) {
                let _ = stale.insert(record.pod.id.clone());
            }
        }

        for pod_id in stale {
            match self.teardown(&pod_id) {
                Ok(torn) => report.reclaimed.push(torn),
                Err(e) => {
                    tracing::error!(pod = %pod_id, error = %e, "failed to reclaim pod networking");
                    report.failed.push((pod_id, e.to_string()));
                }
            }
        }
        tracing::info!(
            restored = report.restored,
            reclaimed = report.reclaimed.len(),
            failed = report.failed.len(),
            "network recovery finished"
        );
        Ok(report)
    }
}

fn leases_from_record(record: &SetupRecord) -> impl Iterator<Item = Lease> + '_ {
    record.attachments().map(move |attach| {
        let routes = attach
            .result
            .as_ref()
            .map(|r| r.routes.clone())
            .unwrap_or_default();
        Lease {
            key: LeaseKey::new(record.pod.id.clone(), &attach.network),
            owner_pid: record.pod.pid,
            allocation: attach
                .descriptor
                .as_ref()
                .and_then(|d| Allocation::from_descriptor(d, routes)),
            acquired_at: record.created_at,
        }
    })
}
