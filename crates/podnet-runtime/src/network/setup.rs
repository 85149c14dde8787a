//! Pod network setup.
//!
//! Setup is all-or-nothing. Every step is appended to the pod's setup
//! record before it takes effect; if any step fails, or the caller
//! cancels, the steps already taken are undone in reverse and the
//! original error is returned.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use podnet_common::error::PodnetError;
use podnet_common::types::Pod;
use podnet_core::interface::{guest_device_name, validate_if_name};
use podnet_core::masquerade::{MasqRule, Masquerader};
use podnet_core::namespace::NetnsHandle;
use serde_json::Value;

use super::cancel::CancelToken;
use super::descriptor::{NetDescriber, NetworkDescriptor};
use super::error::{NetworkError, Result, SetupFailure};
use super::kvm::{KvmNetArgs, kvm_net_args};
use super::lease::{Allocation, LeaseKey, LeaseStore};
use super::netconf::NetworkConf;
use super::plugin::{PluginInvoker, PluginRequest};
use super::result::Route;
use super::teardown::{undo_attach, undo_masquerade};
use crate::state::{AttachOp, BackendKind, MasqueradeOp, RecordOp, RecordStore, SetupRecord};

/// One network a namespace pod asks to join.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRequest {
    /// Network name; also the lease key.
    pub network_name: String,
    /// Host-side interface name, assigned upstream.
    pub if_name: String,
    /// Plugin configuration for the network.
    pub config: Value,
}

impl AttachmentRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(network_name: impl Into<String>, if_name: impl Into<String>, config: Value) -> Self {
        Self {
            network_name: network_name.into(),
            if_name: if_name.into(),
            config,
        }
    }

    /// Request for a loaded network definition.
    #[must_use]
    pub fn from_conf(conf: &NetworkConf, if_name: impl Into<String>) -> Self {
        Self::new(conf.name(), if_name, conf.plugin_config().clone())
    }
}

/// Runs setup for one pod at a time against shared runtime state.
pub struct NetworkSetup<'a> {
    leases: &'a LeaseStore,
    records: &'a RecordStore,
    invoker: &'a dyn PluginInvoker,
    masquerader: &'a dyn Masquerader,
}

impl<'a> NetworkSetup<'a> {
    /// Creates a setup runner.
    #[must_use]
    pub const fn new(
        leases: &'a LeaseStore,
        records: &'a RecordStore,
        invoker: &'a dyn PluginInvoker,
        masquerader: &'a dyn Masquerader,
    ) -> Self {
        Self {
            leases,
            records,
            invoker,
            masquerader,
        }
    }

    /// Configures `requests` inside `netns`, in order.
    ///
    /// The attachment at index `i` becomes `eth<i>` in the pod. Returns
    /// one descriptor per request, in request order.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupFailure`] carrying the original cause after every
    /// completed step has been undone.
    pub fn run_namespace(
        &self,
        pod: &Pod,
        netns: &NetnsHandle,
        requests: &[AttachmentRequest],
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<NetworkDescriptor>, SetupFailure> {
        let fail = |e| SetupFailure::new(pod.id.clone(), None, e);
        let confs = validate_requests(requests).map_err(fail)?;
        let mut txn = self
            .begin(
                pod,
                BackendKind::Namespace,
                Some(netns.clone()),
                &requests[0].network_name,
            )
            .map_err(fail)?;
        tracing::info!(
            pod = %pod.id,
            netns = %netns.path().display(),
            networks = requests.len(),
            "namespace network setup started"
        );

        for (ordinal, (request, conf)) in requests.iter().zip(&confs).enumerate() {
            if let Err(err) = txn.attach_plugin(ordinal, request, conf, netns, cancel) {
                return Err(txn.rollback(Some(request.network_name.clone()), err));
            }
        }
        txn.finish(cancel)
    }

    /// Records and leases statically configured KVM attachments.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupFailure`] if the descriptors are invalid, a lease
    /// is already held, a masquerade rule fails, or setup is cancelled.
    pub fn run_kvm(
        &self,
        pod: &Pod,
        descriptors: &[NetworkDescriptor],
        cancel: &CancelToken,
    ) -> std::result::Result<KvmNetArgs, SetupFailure> {
        let fail = |e| SetupFailure::new(pod.id.clone(), None, e);
        let args = validate_descriptors(descriptors).map_err(fail)?;
        let mut txn = self
            .begin(
                pod,
                BackendKind::Kvm,
                None,
                descriptors[0].network_name(),
            )
            .map_err(fail)?;
        tracing::info!(pod = %pod.id, networks = descriptors.len(), "kvm network setup started");

        for (ordinal, descriptor) in descriptors.iter().enumerate() {
            if let Err(err) = txn.attach_static(ordinal, descriptor, cancel) {
                return Err(txn.rollback(Some(descriptor.network_name().to_string()), err));
            }
        }
        let _ = txn.finish(cancel)?;
        Ok(args)
    }

    fn begin<'s>(
        &'s self,
        pod: &'s Pod,
        backend: BackendKind,
        netns: Option<NetnsHandle>,
        first_network: &str,
    ) -> Result<Transaction<'s, 'a>> {
        let record = SetupRecord::new(pod.clone(), backend, netns);
        match self.records.create(&record) {
            Ok(()) => {}
            Err(PodnetError::AlreadyExists { .. }) => {
                return Err(NetworkError::LeaseConflict {
                    pod: pod.id.clone(),
                    network: first_network.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Transaction {
            setup: self,
            pod,
            record,
            acquired: Vec::new(),
            descriptors: Vec::new(),
        })
    }
}

/// In-progress setup of one pod.
struct Transaction<'s, 'a> {
    setup: &'s NetworkSetup<'a>,
    pod: &'s Pod,
    record: SetupRecord,
    acquired: Vec<String>,
    descriptors: Vec<NetworkDescriptor>,
}

impl Transaction<'_, '_> {
    fn check_cancelled(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(NetworkError::Cancelled {
                pod: self.pod.id.clone(),
            });
        }
        Ok(())
    }

    fn acquire(&mut self, network: &str) -> Result<()> {
        let _ = self.setup.leases.acquire(self.pod, network)?;
        self.acquired.push(network.to_string());
        Ok(())
    }

    fn save(&self) -> Result<()> {
        Ok(self.setup.records.save(&self.record)?)
    }

    /// Appends `op` to the record and persists it. Returns its index.
    fn push(&mut self, op: RecordOp) -> Result<usize> {
        self.record.ops.push(op);
        self.save()?;
        Ok(self.record.ops.len() - 1)
    }

    fn attach_plugin(
        &mut self,
        ordinal: usize,
        request: &AttachmentRequest,
        conf: &NetworkConf,
        netns: &NetnsHandle,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.check_cancelled(cancel)?;
        self.acquire(&request.network_name)?;
        let container_if = guest_device_name(ordinal);
        let index = self.push(RecordOp::Attach(AttachOp {
            network: request.network_name.clone(),
            plugin: Some(conf.plugin_type().to_string()),
            if_name: request.if_name.clone(),
            container_if: container_if.clone(),
            config: conf.plugin_config().clone(),
            result: None,
            descriptor: None,
        }))?;

        let result = self.setup.invoker.add(&PluginRequest {
            pod_id: &self.pod.id,
            network: conf,
            netns,
            container_if: &container_if,
            host_if: &request.if_name,
        })?;
        let descriptor = NetworkDescriptor::from_plugin_result(
            &request.network_name,
            &request.if_name,
            conf.ip_masq(),
            &result,
        );
        let routes = result.routes.clone();
        if let Some(RecordOp::Attach(op)) = self.record.ops.get_mut(index) {
            op.result = Some(result);
            op.descriptor = Some(descriptor.clone());
        }
        self.save()?;
        self.bind(descriptor, routes)
    }

    fn attach_static(
        &mut self,
        ordinal: usize,
        descriptor: &NetworkDescriptor,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.check_cancelled(cancel)?;
        self.acquire(descriptor.network_name())?;
        let _ = self.push(RecordOp::Attach(AttachOp {
            network: descriptor.network_name().to_string(),
            plugin: None,
            if_name: descriptor.if_name().to_string(),
            container_if: guest_device_name(ordinal),
            config: descriptor.extra().clone(),
            result: None,
            descriptor: Some(descriptor.clone()),
        }))?;
        self.bind(descriptor.clone(), Vec::new())
    }

    fn bind(&mut self, descriptor: NetworkDescriptor, routes: Vec<Route>) -> Result<()> {
        let network = descriptor.network_name().to_string();
        let Some(allocation) = Allocation::from_descriptor(&descriptor, routes) else {
            return Err(NetworkError::validation(format!(
                "network {network:?} was configured without a guest address"
            )));
        };
        if self
            .descriptors
            .iter()
            .any(|d| d.guest_ip() == Some(allocation.guest_ip))
        {
            return Err(NetworkError::validation(format!(
                "network {network:?} assigned guest address {} already used by this pod",
                allocation.guest_ip
            )));
        }
        tracing::debug!(
            pod = %self.pod.id,
            network = %network,
            ifname = descriptor.if_name(),
            guest_ip = %allocation.guest_ip,
            "attachment configured"
        );
        let _ = self
            .setup
            .leases
            .bind(&LeaseKey::new(self.pod.id.clone(), &network), allocation)?;
        self.descriptors.push(descriptor);
        Ok(())
    }

    fn masquerade(&mut self, descriptor: &NetworkDescriptor) -> Result<()> {
        let network = descriptor.network_name();
        let (Some(guest_ip), Some(_)) = (descriptor.guest_ip(), descriptor.host_ip()) else {
            return Err(NetworkError::validation(format!(
                "network {network:?} masquerades but has no host address"
            )));
        };
        let subnet = descriptor.subnet().ok_or_else(|| {
            NetworkError::validation(format!("network {network:?} has an invalid subnet mask"))
        })?;
        let rule = MasqRule::new(self.pod.id.as_str(), network, guest_ip, subnet);
        let index = self.push(RecordOp::Masquerade(MasqueradeOp {
            network: network.to_string(),
            rule: rule.clone(),
            installed: false,
        }))?;
        self.setup
            .masquerader
            .install(&rule)
            .map_err(|source| NetworkError::Masquerade {
                network: network.to_string(),
                source,
            })?;
        if let Some(RecordOp::Masquerade(op)) = self.record.ops.get_mut(index) {
            op.installed = true;
        }
        self.save()?;
        tracing::debug!(pod = %self.pod.id, network, chain = %rule.chain, "masquerade installed");
        Ok(())
    }

    /// Installs masquerade rules once every attachment is up.
    fn finish(
        mut self,
        cancel: &CancelToken,
    ) -> std::result::Result<Vec<NetworkDescriptor>, SetupFailure> {
        let masquerading: Vec<NetworkDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.ip_masq())
            .cloned()
            .collect();
        for descriptor in &masquerading {
            let installed = self
                .check_cancelled(cancel)
                .and_then(|()| self.masquerade(descriptor));
            if let Err(err) = installed {
                return Err(self.rollback(Some(descriptor.network_name().to_string()), err));
            }
        }
        tracing::info!(
            pod = %self.pod.id,
            networks = self.descriptors.len(),
            masqueraded = masquerading.len(),
            "network setup complete"
        );
        Ok(self.descriptors)
    }

    /// Undoes every step taken so far and wraps `source` with what went
    /// wrong along the way.
    fn rollback(self, attachment: Option<String>, source: NetworkError) -> SetupFailure {
        let pod_id = &self.pod.id;
        tracing::warn!(
            pod = %pod_id,
            attachment = attachment.as_deref().unwrap_or("-"),
            error = %source,
            "network setup failed, rolling back"
        );
        let mut errors = Vec::new();
        for op in self.record.ops.iter().rev() {
            let undone = match op {
                RecordOp::Attach(attach) if attach.is_complete() => undo_attach(
                    self.setup.invoker,
                    pod_id,
                    self.record.netns.as_ref(),
                    attach,
                ),
                RecordOp::Attach(_) => Ok(()),
                RecordOp::Masquerade(masq) => undo_masquerade(self.setup.masquerader, masq),
            };
            if let Err(e) = undone {
                errors.push(e);
            }
        }
        for network in self.acquired.iter().rev() {
            if let Err(e) = self.setup.leases.release(pod_id, network) {
                errors.push(e);
            }
        }
        if let Err(e) = self.setup.records.remove(pod_id) {
            errors.push(e.into());
        }
        for err in &errors {
            tracing::error!(pod = %pod_id, error = %err, "rollback step failed");
        }
        SetupFailure {
            pod: pod_id.clone(),
            attachment,
            source,
            rollback_errors: errors,
        }
    }
}

fn check_if_name(name: &str) -> Result<()> {
    validate_if_name(name).map_err(|e| NetworkError::validation(e.to_string()))
}

/// Tracks names that must be unique within one pod.
#[derive(Default)]
struct UniqueNames<'n> {
    networks: HashSet<&'n str>,
    if_names: HashSet<&'n str>,
    guest_ips: HashSet<Ipv4Addr>,
}

impl<'n> UniqueNames<'n> {
    fn check(&mut self, network: &'n str, if_name: &'n str, guest_ip: Option<Ipv4Addr>) -> Result<()> {
        if !self.networks.insert(network) {
            return Err(NetworkError::validation(format!(
                "network {network:?} requested more than once"
            )));
        }
        if !self.if_names.insert(if_name) {
            return Err(NetworkError::validation(format!(
                "interface name {if_name:?} used more than once"
            )));
        }
        if let Some(ip) = guest_ip {
            if !self.guest_ips.insert(ip) {
                return Err(NetworkError::validation(format!(
                    "guest address {ip} used more than once"
                )));
            }
        }
        Ok(())
    }
}

fn validate_requests(requests: &[AttachmentRequest]) -> Result<Vec<NetworkConf>> {
    if requests.is_empty() {
        return Err(NetworkError::validation("no networks"));
    }
    let mut seen = UniqueNames::default();
    requests
        .iter()
        .map(|request| {
            check_if_name(&request.if_name)?;
            seen.check(&request.network_name, &request.if_name, None)?;
            NetworkConf::named(&request.network_name, request.config.clone())
        })
        .collect()
}

fn validate_descriptors(descriptors: &[NetworkDescriptor]) -> Result<KvmNetArgs> {
    let args = kvm_net_args(descriptors)?;
    let mut seen = UniqueNames::default();
    for descriptor in descriptors {
        check_if_name(descriptor.if_name())?;
        seen.check(
            descriptor.network_name(),
            descriptor.if_name(),
            descriptor.guest_ip(),
        )?;
        if descriptor.ip_masq() && descriptor.host_ip().is_none() {
            return Err(NetworkError::validation(format!(
                "network {:?} masquerades but has no host address",
                descriptor.network_name()
            )));
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::testing::{Call, FakeInvoker, FakeMasquerader};

    fn stores() -> (tempfile::TempDir, LeaseStore, RecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = RecordStore::open(dir.path().join("records")).expect("records");
        (dir, LeaseStore::new(), records)
    }

    fn request(network: &str, if_name: &str, masq: bool) -> AttachmentRequest {
        AttachmentRequest::new(network, if_name, json!({"type": "fake", "ipMasq": masq}))
    }

    fn pod() -> Pod {
        Pod::new(podnet_common::types::PodId::new("pod-a"), 4242)
    }

    #[test]
    fn attachments_map_to_guest_devices_in_order() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::default();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let netns = NetnsHandle::from_path("/run/netns/pod-a");

        let descriptors = setup
            .run_namespace(
                &pod(),
                &netns,
                &[request("lan", "pnlan", false), request("wan", "pnwan", true)],
                &CancelToken::new(),
            )
            .expect("setup");

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].network_name(), "lan");
        assert_eq!(descriptors[1].if_name(), "pnwan");
        assert_eq!(
            invoker.calls(),
            vec![
                Call::add("lan", "eth0"),
                Call::add("wan", "eth1"),
            ]
        );
        assert_eq!(masq.installed().len(), 1);
        assert_eq!(leases.len().unwrap(), 2);
        assert!(leases.leases_for(&pod().id).unwrap().iter().all(|l| l.is_bound()));

        let record = records.load(&pod().id).unwrap().expect("record");
        assert_eq!(record.ops.len(), 3);
        assert!(record.attachments().all(AttachOp::is_complete));
    }

    #[test]
    fn rollback_failures_are_kept_beside_the_original_cause() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::failing_del().fail_add_on("n3");
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);

        let failure = setup
            .run_namespace(
                &pod(),
                &NetnsHandle::from_path("/run/netns/pod-a"),
                &[
                    request("n1", "pn1", false),
                    request("n2", "pn2", false),
                    request("n3", "pn3", false),
                    request("n4", "pn4", false),
                ],
                &CancelToken::new(),
            )
            .unwrap_err();

        assert!(matches!(failure.source, NetworkError::PluginExecution { .. }));
        assert!(failure.source.to_string().contains("link already exists"));
        assert_eq!(failure.attachment.as_deref(), Some("n3"));
        assert_eq!(failure.rollback_errors.len(), 2);
        assert!(failure
            .rollback_errors
            .iter()
            .all(|e| e.to_string().contains("device busy")));
        assert_eq!(
            &invoker.calls()[3..],
            &[Call::del("n2", "eth1"), Call::del("n1", "eth0")]
        );
        assert!(leases.is_empty().unwrap());
        assert!(records.load(&pod().id).unwrap().is_none());
    }

    #[test]
    fn invalid_requests_touch_nothing() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::default();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let netns = NetnsHandle::from_path("/run/netns/pod-a");

        for requests in [
            vec![],
            vec![request("lan", "pn0", false), request("lan", "pn1", false)],
            vec![request("lan", "pn0", false), request("wan", "pn0", false)],
            vec![request("lan", "this-name-is-too-long", false)],
            vec![AttachmentRequest::new("lan", "pn0", json!({"name": "lan"}))],
        ] {
            let failure = setup
                .run_namespace(&pod(), &netns, &requests, &CancelToken::new())
                .unwrap_err();
            assert!(matches!(failure.source, NetworkError::Validation { .. }));
        }
        assert!(invoker.calls().is_empty());
        assert!(leases.is_empty().unwrap());
        assert!(records.list().unwrap().is_empty());
    }

    #[test]
    fn duplicate_guest_address_rolls_back() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::with_fixed_ip();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let netns = NetnsHandle::from_path("/run/netns/pod-a");

        let failure = setup
            .run_namespace(
                &pod(),
                &netns,
                &[request("lan", "pn0", false), request("wan", "pn1", false)],
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(failure.source, NetworkError::Validation { .. }));
        assert_eq!(failure.attachment.as_deref(), Some("wan"));
        assert_eq!(
            invoker.calls(),
            vec![
                Call::add("lan", "eth0"),
                Call::add("wan", "eth1"),
                Call::del("wan", "eth1"),
                Call::del("lan", "eth0"),
            ]
        );
        assert!(leases.is_empty().unwrap());
        assert!(records.load(&pod().id).unwrap().is_none());
    }

    #[test]
    fn second_setup_of_same_pod_conflicts_without_rollback() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::default();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let netns = NetnsHandle::from_path("/run/netns/pod-a");
        let requests = [request("lan", "pn0", false)];

        let _ = setup
            .run_namespace(&pod(), &netns, &requests, &CancelToken::new())
            .expect("first");
        let failure = setup
            .run_namespace(&pod(), &netns, &requests, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(failure.source, NetworkError::LeaseConflict { .. }));
        assert!(failure.rollback_errors.is_empty());
        assert_eq!(invoker.calls().len(), 1);
        assert_eq!(leases.len().unwrap(), 1);
        assert!(records.load(&pod().id).unwrap().is_some());
    }

    #[test]
    fn kvm_descriptors_are_leased_and_recorded() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::default();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let descriptors = vec![
            NetworkDescriptor::new("default", "tap0")
                .with_guest(Ipv4Addr::new(172, 16, 28, 2), Ipv4Addr::new(255, 255, 255, 0))
                .with_host_ip(Ipv4Addr::new(172, 16, 28, 1))
                .with_ip_masq(true),
        ];

        let args = setup
            .run_kvm(&pod(), &descriptors, &CancelToken::new())
            .expect("kvm setup");
        assert_eq!(
            args.kernel,
            vec!["ip=172.16.28.2::172.16.28.1:255.255.255.0::eth0:::"]
        );
        assert!(invoker.calls().is_empty());
        assert_eq!(masq.installed().len(), 1);
        assert_eq!(masq.installed()[0].subnet.to_string(), "172.16.28.0/24");
        assert_eq!(leases.len().unwrap(), 1);
    }

    #[test]
    fn kvm_masquerade_without_host_address_is_invalid() {
        let (_dir, leases, records) = stores();
        let invoker = FakeInvoker::default();
        let masq = FakeMasquerader::default();
        let setup = NetworkSetup::new(&leases, &records, &invoker, &masq);
        let descriptors = vec![
            NetworkDescriptor::new("default", "tap0")
                .with_guest(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 255, 255, 0))
                .with_ip_masq(true),
        ];
        let failure = setup
            .run_kvm(&pod(), &descriptors, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(failure.source, NetworkError::Validation { .. }));
        assert!(leases.is_empty().unwrap());
    }
}
