//! Reversal of pod network setup.
//!
//! Teardown replays the persisted setup record backwards. It is safe to
//! run any number of times: every undo step is idempotent, the record is
//! deleted only after everything else, and a pod without a record is
//! already torn.

use podnet_common::types::{PodId, PodNetState};
use podnet_core::masquerade::Masquerader;
use podnet_core::namespace::NetnsHandle;

use super::error::{NetworkError, Result};
use super::lease::LeaseStore;
use super::netconf::NetworkConf;
use super::plugin::{PluginInvoker, PluginRequest};
use crate::state::{AttachOp, MasqueradeOp, RecordOp, RecordStore};

/// Outcome of tearing down one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Pod that was torn down.
    pub pod_id: PodId,
    /// Final state; always `Torn` when returned.
    pub state: PodNetState,
    /// Number of recorded steps that were replayed.
    pub replayed: usize,
    /// Networks whose leases were released, in release order.
    pub released: Vec<String>,
    /// Non-fatal failures, such as a plugin DEL that kept failing.
    pub warnings: Vec<String>,
}

impl TeardownReport {
    fn torn(pod_id: PodId) -> Self {
        Self {
            pod_id,
            state: PodNetState::Torn,
            replayed: 0,
            released: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Tears pods down from their setup records.
pub struct TeardownCoordinator<'a> {
    leases: &'a LeaseStore,
    records: &'a RecordStore,
    invoker: &'a dyn PluginInvoker,
    masquerader: &'a dyn Masquerader,
}

impl<'a> TeardownCoordinator<'a> {
    /// Creates a coordinator over shared runtime state.
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

    /// Tears down all networking of `pod_id`.
    ///
    /// Undo failures are collected as warnings and never stop the
    /// remaining steps. Every lease named by the record is released.
    ///
    /// # Errors
    ///
    /// Returns an error only if the setup record cannot be read or
    /// deleted; running teardown again resumes where this one stopped.
    pub fn teardown(&self, pod_id: &PodId) -> Result<TeardownReport> {
        let Some(mut record) = self.records.load(pod_id)? else {
            tracing::debug!(pod = %pod_id, "no setup record, already torn");
            return Ok(TeardownReport::torn(pod_id.clone()));
        };
        let mut report = TeardownReport::torn(pod_id.clone());

        if record.state == PodNetState::Active {
            record.state = PodNetState::TearingDown;
            if let Err(e) = self.records.save(&record) {
                report
                    .warnings
                    .push(format!("failed to mark record tearing-down: {e}"));
            }
        } else {
            tracing::info!(pod = %pod_id, "resuming interrupted teardown");
        }
        tracing::info!(pod = %pod_id, ops = record.ops.len(), "network teardown started");

        for op in record.ops.iter().rev() {
            report.replayed += 1;
            match op {
                RecordOp::Masquerade(masq) => {
                    if let Err(e) = undo_masquerade(self.masquerader, masq) {
                        warn(&mut report, &masq.network, &e);
                    }
                }
                RecordOp::Attach(attach) => {
                    if let Err(e) =
                        undo_attach(self.invoker, pod_id, record.netns.as_ref(), attach)
                    {
                        warn(&mut report, &attach.network, &e);
                    }
                    match self.leases.release(pod_id, &attach.network) {
                        Ok(Some(_)) => report.released.push(attach.network.clone()),
                        Ok(None) => {}
                        Err(e) => warn(&mut report, &attach.network, &e),
                    }
                }
            }
        }

        let _ = self.records.remove(pod_id)?;
        tracing::info!(
            pod = %pod_id,
            released = report.released.len(),
            warnings = report.warnings.len(),
            "network teardown finished"
        );
        Ok(report)
    }
}

fn warn(report: &mut TeardownReport, network: &str, err: &NetworkError) {
    tracing::warn!(pod = %report.pod_id, network, error = %err, "teardown step failed, continuing");
    report.warnings.push(format!("{network}: {err}"));
}

/// Runs the plugin DEL for a recorded attachment.
///
/// Attachments configured without a plugin (KVM) have nothing to undo.
pub(crate) fn undo_attach(
    invoker: &dyn PluginInvoker,
    pod_id: &PodId,
    netns: Option<&NetnsHandle>,
    op: &AttachOp,
) -> Result<()> {
    if op.plugin.is_none() {
        return Ok(());
    }
    let Some(netns) = netns else {
        return Err(NetworkError::validation(format!(
            "attachment {:?} has no network namespace recorded",
            op.network
        )));
    };
    let conf = NetworkConf::named(&op.network, op.config.clone())?;
    invoker.del(&PluginRequest {
        pod_id,
        network: &conf,
        netns,
        container_if: &op.container_if,
        host_if: &op.if_name,
    })
}

/// Removes a recorded masquerade rule, installed or not.
pub(crate) fn undo_masquerade(masquerader: &dyn Masquerader, op: &MasqueradeOp) -> Result<()> {
    masquerader
        .remove(&op.rule)
        .map_err(|source| NetworkError::Masquerade {
            network: op.network.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use podnet_common::types::Pod;
    use serde_json::json;

    use super::*;
    use crate::network::cancel::CancelToken;
    use crate::network::setup::{AttachmentRequest, NetworkSetup};
    use crate::network::testing::{Call, FakeInvoker, FakeMasquerader};

    struct Harness {
        _dir: tempfile::TempDir,
        leases: LeaseStore,
        records: RecordStore,
        invoker: FakeInvoker,
        masq: FakeMasquerader,
        pod: Pod,
    }

    impl Harness {
        fn new(invoker: FakeInvoker) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let records = RecordStore::open(dir.path()).expect("records");
            Self {
                _dir: dir,
                leases: LeaseStore::new(),
                records,
                invoker,
                masq: FakeMasquerader::default(),
                pod: Pod::new(PodId::new("pod-t"), 77),
            }
        }

        fn set_up(&self) {
            let requests = [
                AttachmentRequest::new("lan", "pn0", json!({"type": "fake"})),
                AttachmentRequest::new("wan", "pn1", json!({"type": "fake", "ipMasq": true})),
            ];
            let _ = NetworkSetup::new(&self.leases, &self.records, &self.invoker, &self.masq)
                .run_namespace(
                    &self.pod,
                    &NetnsHandle::from_path("/run/netns/pod-t"),
                    &requests,
                    &CancelToken::new(),
                )
                .expect("setup");
        }

        fn coordinator(&self) -> TeardownCoordinator<'_> {
            TeardownCoordinator::new(&self.leases, &self.records, &self.invoker, &self.masq)
        }
    }

    #[test]
    fn teardown_replays_record_in_reverse() {
        let h = Harness::new(FakeInvoker::default());
        h.set_up();
        assert_eq!(h.masq.installed().len(), 1);

        let report = h.coordinator().teardown(&h.pod.id).expect("teardown");
        assert!(report.is_clean());
        assert_eq!(report.state, PodNetState::Torn);
        assert_eq!(report.replayed, 3);
        assert_eq!(report.released, vec!["wan".to_string(), "lan".to_string()]);
        assert_eq!(
            &h.invoker.calls()[2..],
            &[Call::del("wan", "eth1"), Call::del("lan", "eth0")]
        );
        assert!(h.masq.installed().is_empty());
        assert!(h.leases.is_empty().unwrap());
        assert!(h.records.load(&h.pod.id).unwrap().is_none());
    }

    #[test]
    fn second_teardown_is_a_no_op() {
        let h = Harness::new(FakeInvoker::default());
        h.set_up();
        let _ = h.coordinator().teardown(&h.pod.id).expect("first");
        let calls = h.invoker.calls().len();

        let report = h.coordinator().teardown(&h.pod.id).expect("second");
        assert_eq!(report.replayed, 0);
        assert!(report.released.is_empty());
        assert_eq!(h.invoker.calls().len(), calls);
    }

    #[test]
    fn failed_del_is_a_warning_and_lease_is_still_released() {
        let h = Harness::new(FakeInvoker::failing_del());
        h.set_up();

        let report = h.coordinator().teardown(&h.pod.id).expect("teardown");
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("device busy"));
        assert_eq!(report.released.len(), 2);
        assert!(h.leases.is_empty().unwrap());
        assert!(h.records.load(&h.pod.id).unwrap().is_none());
    }

    #[test]
    fn attachment_caught_mid_add_is_deleted() {
        let h = Harness::new(FakeInvoker::default());
        h.set_up();
        let mut record = h.records.load(&h.pod.id).unwrap().unwrap();
        record.ops.push(RecordOp::Attach(AttachOp {
            network: "dmz".into(),
            plugin: Some("fake".into()),
            if_name: "pn2".into(),
            container_if: "eth2".into(),
            config: json!({"type": "fake"}),
            result: None,
            descriptor: None,
        }));
        h.records.save(&record).unwrap();
        let _ = h.leases.acquire(&h.pod, "dmz").unwrap();

        let report = h.coordinator().teardown(&h.pod.id).expect("teardown");
        assert!(report.is_clean());
        assert_eq!(h.invoker.calls()[2], Call::del("dmz", "eth2"));
        assert_eq!(report.released[0], "dmz");
        assert!(h.leases.is_empty().unwrap());
        assert!(h.records.load(&h.pod.id).unwrap().is_none());
    }

    #[test]
    fn interrupted_teardown_resumes_from_record() {
        let h = Harness::new(FakeInvoker::default());
        h.set_up();
        let mut record = h.records.load(&h.pod.id).unwrap().unwrap();
        record.state = PodNetState::TearingDown;
        h.records.save(&record).unwrap();
        let _ = h.leases.release(&h.pod.id, "wan").unwrap();

        let report = h.coordinator().teardown(&h.pod.id).expect("teardown");
        assert!(report.is_clean());
        assert_eq!(report.released, vec!["lan".to_string()]);
        assert!(h.leases.is_empty().unwrap());
    }
}
