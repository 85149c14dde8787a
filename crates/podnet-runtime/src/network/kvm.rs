//! Hypervisor and guest-kernel network arguments for KVM pods.
//!
//! Pure translation: the same descriptors always yield the same strings
//! in the same order. Nothing here touches the host.

use std::fmt::Write as _;

use podnet_core::interface::guest_device_name;

use super::descriptor::NetDescriber;
use super::error::{NetworkError, Result};

/// Arguments derived from a pod's network descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvmNetArgs {
    /// Hypervisor arguments, two per descriptor (`--network`, value).
    pub hypervisor: Vec<String>,
    /// Guest kernel `ip=` parameters, one per descriptor.
    pub kernel: Vec<String>,
}

/// Builds hypervisor and kernel arguments for `nets`.
///
/// The descriptor at index `i` becomes guest device `eth<i>`, so input
/// order is preserved end to end.
///
/// # Errors
///
/// Returns `Validation` if `nets` is empty or any descriptor lacks a
/// guest address or mask. No output is produced in that case.
pub fn kvm_net_args<D: NetDescriber>(nets: &[D]) -> Result<KvmNetArgs> {
    if nets.is_empty() {
        return Err(NetworkError::validation("no networks"));
    }

    let mut args = KvmNetArgs {
        hypervisor: Vec::with_capacity(nets.len() * 2),
        kernel: Vec::with_capacity(nets.len()),
    };
    for (ordinal, net) in nets.iter().enumerate() {
        let (Some(guest_ip), Some(mask)) = (net.guest_ip(), net.mask()) else {
            return Err(NetworkError::validation(format!(
                "incomplete descriptor {:?} at position {ordinal}",
                net.if_name()
            )));
        };

        let mut value = format!("mode=tap,tapif={}", net.if_name());
        if let Some(host_ip) = net.host_ip() {
            let _ = write!(value, ",host_ip={host_ip}");
        }
        let _ = write!(value, ",guest_ip={guest_ip}");
        args.hypervisor.push("--network".into());
        args.hypervisor.push(value);

        // ip=<client>:<server>:<gw>:<netmask>:<hostname>:<device>:<autoconf>:<dns0>:<dns1>
        let gateway = if net.ip_masq() {
            net.host_ip().map(|ip| ip.to_string()).unwrap_or_default()
        } else {
            String::new()
        };
        let device = guest_device_name(ordinal);
        args.kernel
            .push(format!("ip={guest_ip}::{gateway}:{mask}::{device}:::"));
    }

    tracing::debug!(
        networks = nets.len(),
        kernel = ?args.kernel,
        "built KVM network arguments"
    );
    Ok(args)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    struct TestNet {
        host_ip: Option<Ipv4Addr>,
        guest_ip: Option<Ipv4Addr>,
        mask: Option<Ipv4Addr>,
        if_name: &'static str,
        ip_masq: bool,
    }

    impl NetDescriber for TestNet {
        fn host_ip(&self) -> Option<Ipv4Addr> {
            self.host_ip
        }
        fn guest_ip(&self) -> Option<Ipv4Addr> {
            self.guest_ip
        }
        fn mask(&self) -> Option<Ipv4Addr> {
            self.mask
        }
        fn if_name(&self) -> &str {
            self.if_name
        }
        fn ip_masq(&self) -> bool {
            self.ip_masq
        }
    }

    fn net(if_name: &'static str, ip_masq: bool) -> TestNet {
        TestNet {
            host_ip: Some(Ipv4Addr::new(1, 1, 1, 1)),
            guest_ip: Some(Ipv4Addr::new(2, 2, 2, 2)),
            mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            if_name,
            ip_masq,
        }
    }

    #[test]
    fn table_of_known_outputs() {
        let cases: Vec<(Vec<TestNet>, Vec<&str>, Vec<&str>)> = vec![
            // without masquerading no gateway is passed to the kernel
            (
                vec![net("fooInt", false)],
                vec!["--network", "mode=tap,tapif=fooInt,host_ip=1.1.1.1,guest_ip=2.2.2.2"],
                vec!["ip=2.2.2.2:::255.255.255.0::eth0:::"],
            ),
            // masquerading puts the host in the gateway position
            (
                vec![net("barInt", true)],
                vec!["--network", "mode=tap,tapif=barInt,host_ip=1.1.1.1,guest_ip=2.2.2.2"],
                vec!["ip=2.2.2.2::1.1.1.1:255.255.255.0::eth0:::"],
            ),
            (
                vec![net("fooInt", false), net("barInt", true)],
                vec![
                    "--network",
                    "mode=tap,tapif=fooInt,host_ip=1.1.1.1,guest_ip=2.2.2.2",
                    "--network",
                    "mode=tap,tapif=barInt,host_ip=1.1.1.1,guest_ip=2.2.2.2",
                ],
                vec![
                    "ip=2.2.2.2:::255.255.255.0::eth0:::",
                    "ip=2.2.2.2::1.1.1.1:255.255.255.0::eth1:::",
                ],
            ),
        ];

        for (i, (nets, hypervisor, kernel)) in cases.iter().enumerate() {
            let args = kvm_net_args(nets).unwrap_or_else(|e| panic!("#{i}: {e}"));
            assert_eq!(args.hypervisor, *hypervisor, "#{i} hypervisor");
            assert_eq!(args.kernel, *kernel, "#{i} kernel");
        }
    }

    #[test]
    fn missing_host_ip_drops_only_the_host_term() {
        let mut n = net("tap0", false);
        n.host_ip = None;
        let args = kvm_net_args(&[n]).expect("args");
        assert_eq!(
            args.hypervisor,
            vec!["--network", "mode=tap,tapif=tap0,guest_ip=2.2.2.2"]
        );
    }

    #[test]
    fn masquerade_without_host_ip_leaves_gateway_empty() {
        let mut n = net("tap0", true);
        n.host_ip = None;
        let args = kvm_net_args(&[n]).expect("args");
        assert_eq!(args.kernel, vec!["ip=2.2.2.2:::255.255.255.0::eth0:::"]);
    }

    #[test]
    fn output_lengths_follow_input_length() {
        for count in 1..=5 {
            let nets: Vec<TestNet> = (0..count).map(|_| net("tap", count % 2 == 0)).collect();
            let args = kvm_net_args(&nets).expect("args");
            assert_eq!(args.hypervisor.len(), 2 * count);
            assert_eq!(args.kernel.len(), count);
            for (i, param) in args.kernel.iter().enumerate() {
                assert!(param.ends_with(&format!("::eth{i}:::")), "{param}");
                assert_eq!(param.matches(':').count(), 8);
            }
        }
    }

    #[test]
    fn empty_input_is_a_validation_error() {
        let nets: Vec<TestNet> = Vec::new();
        assert!(matches!(
            kvm_net_args(&nets),
            Err(NetworkError::Validation { message }) if message == "no networks"
        ));
    }

    #[test]
    fn incomplete_descriptors_are_rejected() {
        let mut no_guest = net("tap0", false);
        no_guest.guest_ip = None;
        let mut no_mask = net("tap1", false);
        no_mask.mask = None;

        for bad in [no_guest, no_mask] {
            let err = kvm_net_args(&[net("ok", false), bad]).unwrap_err();
            assert!(matches!(err, NetworkError::Validation { .. }));
            assert!(err.to_string().contains("incomplete descriptor"));
        }
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let nets = [net("a", true), net("b", false)];
        assert_eq!(kvm_net_args(&nets).unwrap(), kvm_net_args(&nets).unwrap());
    }

    #[test]
    fn accepts_trait_objects() {
        let a = net("a", false);
        let b = net("b", true);
        let nets: Vec<&dyn NetDescriber> = vec![&a, &b];
        let args = kvm_net_args(&nets).expect("args");
        assert_eq!(args.kernel.len(), 2);
    }
}
