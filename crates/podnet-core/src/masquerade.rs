//! Masquerade (source NAT) rules for pod egress.
//!
//! Each masquerading attachment gets its own chain in the `nat` table:
//!
//! ```text
//! POSTROUTING -s <guest> -j PODNET-<hash>
//! PODNET-<hash> -d <subnet> -j ACCEPT
//! PODNET-<hash> ! -d 224.0.0.0/4 -j MASQUERADE
//! ```
//!
//! Installation and removal are both idempotent so that rollback and
//! crash-recovery replay can run them any number of times.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;

use ipnet::Ipv4Net;
use podnet_common::constants::MASQ_CHAIN_PREFIX;
use podnet_common::error::{PodnetError, Result};
use serde::{Deserialize, Serialize};

/// iptables limits chain names to 28 characters.
const CHAIN_HASH_LEN: usize = 20;

const MULTICAST_NET: &str = "224.0.0.0/4";

/// One masquerade rule set, scoped to a single guest address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasqRule {
    /// Dedicated chain in the `nat` table.
    pub chain: String,
    /// Source address whose egress is rewritten.
    pub guest_ip: Ipv4Addr,
    /// Local subnet exempted from rewriting.
    pub subnet: Ipv4Net,
}

impl MasqRule {
    /// Builds the rule for a (pod, network) pair.
    #[must_use]
    pub fn new(pod_id: &str, network: &str, guest_ip: Ipv4Addr, subnet: Ipv4Net) -> Self {
        Self {
            chain: chain_name(pod_id, network),
            guest_ip,
            subnet: subnet.trunc(),
        }
    }

    fn jump_spec(&self) -> Vec<String> {
        vec![
            "-s".into(),
            self.guest_ip.to_string(),
            "-j".into(),
            self.chain.clone(),
        ]
    }

    fn accept_spec(&self) -> Vec<String> {
        vec![
            "-d".into(),
            self.subnet.to_string(),
            "-j".into(),
            "ACCEPT".into(),
        ]
    }

    fn masquerade_spec() -> Vec<String> {
        vec![
            "!".into(),
            "-d".into(),
            MULTICAST_NET.into(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }
}

/// Deterministic chain name for a (pod, network) pair.
#[must_use]
pub fn chain_name(pod_id: &str, network: &str) -> String {
    let hash = crate::digest::short_hex(&format!("{pod_id}/{network}"), CHAIN_HASH_LEN);
    format!("{MASQ_CHAIN_PREFIX}{hash}")
}

/// Installs and removes masquerade rules on the host.
pub trait Masquerader: Send + Sync {
    /// Installs `rule`. Succeeds if it is already fully installed.
    ///
    /// # Errors
    ///
    /// Returns an error if the host firewall rejects any part of the rule.
    fn install(&self, rule: &MasqRule) -> Result<()>;

    /// Removes `rule`. Succeeds if it is already absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the host firewall fails for a reason other than
    /// the rule or chain not existing.
    fn remove(&self, rule: &MasqRule) -> Result<()>;
}

/// [`Masquerader`] backed by the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesMasquerader {
    binary: PathBuf,
}

impl IptablesMasquerader {
    /// Uses `explicit` when given, otherwise looks `iptables` up on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no `iptables` binary can be located.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Ok(Self::with_binary(path));
        }
        let binary = which::which("iptables").map_err(|_| PodnetError::NotFound {
            kind: "iptables binary",
            id: "iptables".into(),
        })?;
        Ok(Self { binary })
    }

    /// Uses the given binary without checking it.
    #[must_use]
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            binary: path.into(),
        }
    }

    fn nat(&self, args: &[&str], rule: &[String]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(["-w", "-t", "nat"])
            .args(args)
            .args(rule)
            .output()
            .map_err(|e| PodnetError::Io {
                path: self.binary.clone(),
                source: e,
            })
    }

    fn check(&self, output: &std::process::Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        Err(PodnetError::CommandFailed {
            program: self.binary.display().to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn ensure_rule(&self, chain: &str, rule: &[String]) -> Result<()> {
        if self.nat(&["-C", chain], rule)?.status.success() {
            tracing::debug!(chain, ?rule, "rule already present");
            return Ok(());
        }
        let output = self.nat(&["-A", chain], rule)?;
        self.check(&output)
    }

    fn tolerate_missing(&self, output: &std::process::Output) -> Result<()> {
        if is_missing(&String::from_utf8_lossy(&output.stderr)) {
            return Ok(());
        }
        self.check(output)
    }
}

impl Masquerader for IptablesMasquerader {
    fn install(&self, rule: &MasqRule) -> Result<()> {
        tracing::debug!(chain = %rule.chain, guest = %rule.guest_ip, subnet = %rule.subnet, "installing masquerade");
        let created = self.nat(&["-N", &rule.chain], &[])?;
        if !String::from_utf8_lossy(&created.stderr).contains("already exists") {
            self.check(&created)?;
        }
        self.ensure_rule(&rule.chain, &rule.accept_spec())?;
        self.ensure_rule(&rule.chain, &MasqRule::masquerade_spec())?;
        self.ensure_rule("POSTROUTING", &rule.jump_spec())?;
        tracing::info!(chain = %rule.chain, guest = %rule.guest_ip, "masquerade installed");
        Ok(())
    }

    fn remove(&self, rule: &MasqRule) -> Result<()> {
        let output = self.nat(&["-D", "POSTROUTING"], &rule.jump_spec())?;
        self.tolerate_missing(&output)?;
        let output = self.nat(&["-F", &rule.chain], &[])?;
        self.tolerate_missing(&output)?;
        let output = self.nat(&["-X", &rule.chain], &[])?;
        self.tolerate_missing(&output)?;
        tracing::info!(chain = %rule.chain, guest = %rule.guest_ip, "masquerade removed");
        Ok(())
    }
}

/// Whether iptables complained that the rule or chain does not exist.
///
/// Covers the legacy backend, which reports a jump to a deleted chain as
/// an unloadable target, and the nf_tables backend.
fn is_missing(stderr: &str) -> bool {
    const MARKERS: [&str; 5] = [
        "No chain/target/match",
        "does a matching rule exist",
        "doesn't exist",
        "does not exist",
        "Couldn't load target",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> MasqRule {
        MasqRule::new(
            "pod-1",
            "default",
            Ipv4Addr::new(172, 16, 28, 5),
            "172.16.28.1/24".parse().expect("net"),
        )
    }

    #[test]
    fn chain_name_fits_iptables_limit() {
        let name = chain_name("a-very-long-pod-identifier-0123456789", "network");
        assert!(name.starts_with(MASQ_CHAIN_PREFIX));
        assert!(name.len() <= 28);
    }

    #[test]
    fn rule_subnet_is_truncated_to_network() {
        assert_eq!(rule().subnet.to_string(), "172.16.28.0/24");
    }

    #[test]
    fn missing_rule_messages_are_recognized() {
        assert!(is_missing(
            "iptables: No chain/target/match by that name."
        ));
        assert!(is_missing(
            "iptables: Bad rule (does a matching rule exist in that chain?)."
        ));
        assert!(is_missing(
            "iptables v1.8.7 (legacy): Couldn't load target `PODNET-1A2B':No such file or directory"
        ));
        assert!(is_missing(
            "iptables v1.8.9 (nf_tables): Chain 'PODNET-1A2B' does not exist"
        ));
        assert!(!is_missing("iptables: Permission denied."));
    }

    #[cfg(unix)]
    fn fake_iptables(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("iptables");
        let log = dir.join("calls.log");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> {}\n{body}\n",
            log.display()
        );
        std::fs::write(&path, script).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn install_appends_rules_missing_from_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_iptables(dir.path(), "case \"$*\" in *\" -C \"*) exit 1;; esac\nexit 0");
        let masq = IptablesMasquerader::with_binary(&bin);

        masq.install(&rule()).expect("install");

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).expect("log");
        let appends: Vec<&str> = calls.lines().filter(|l| l.contains(" -A ")).collect();
        assert_eq!(appends.len(), 3);
        assert!(appends[0].contains("-d 172.16.28.0/24 -j ACCEPT"));
        assert!(appends[1].contains("! -d 224.0.0.0/4 -j MASQUERADE"));
        assert!(appends[2].contains("-A POSTROUTING -s 172.16.28.5 -j PODNET-"));
    }

    #[cfg(unix)]
    #[test]
    fn install_skips_rules_already_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_iptables(
            dir.path(),
            "case \"$*\" in *\" -N \"*) echo 'iptables: Chain already exists.' >&2; exit 1;; esac\nexit 0",
        );
        let masq = IptablesMasquerader::with_binary(&bin);

        masq.install(&rule()).expect("install");

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).expect("log");
        assert!(!calls.contains(" -A "));
    }

    #[cfg(unix)]
    #[test]
    fn remove_tolerates_missing_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_iptables(
            dir.path(),
            "echo 'iptables: No chain/target/match by that name.' >&2\nexit 1",
        );
        let masq = IptablesMasquerader::with_binary(&bin);
        masq.remove(&rule()).expect("remove is idempotent");
    }

    #[cfg(unix)]
    #[test]
    fn remove_tolerates_jump_to_deleted_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_iptables(
            dir.path(),
            r#"case "$*" in
*" -D POSTROUTING "*) echo "iptables v1.8.7 (legacy): Couldn't load target PODNET-X:No such file or directory" >&2; exit 2;;
*) echo "iptables v1.8.9 (nf_tables): Chain 'PODNET-X' does not exist" >&2; exit 1;;
esac"#,
        );
        let masq = IptablesMasquerader::with_binary(&bin);
        masq.remove(&rule()).expect("remove is idempotent");
    }

    #[cfg(unix)]
    #[test]
    fn install_failure_surfaces_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = fake_iptables(dir.path(), "echo 'Permission denied' >&2\nexit 4");
        let masq = IptablesMasquerader::with_binary(&bin);

        let err = masq.install(&rule()).unwrap_err();
        match err {
            PodnetError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "Permission denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
