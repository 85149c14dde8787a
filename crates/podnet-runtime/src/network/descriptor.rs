//! Backend-agnostic description of one network attachment.
//!
//! Builders downstream of setup only ever see the [`NetDescriber`]
//! capability set, so plugin-produced descriptors and statically
//! configured KVM descriptors are interchangeable.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::result::PluginResult;

/// Read-only view of one attachment's addressing.
pub trait NetDescriber {
    /// Host-side address, used as the guest's gateway when masquerading.
    fn host_ip(&self) -> Option<Ipv4Addr>;
    /// Address assigned to the guest interface.
    fn guest_ip(&self) -> Option<Ipv4Addr>;
    /// Subnet mask of the guest interface.
    fn mask(&self) -> Option<Ipv4Addr>;
    /// Host-side interface name.
    fn if_name(&self) -> &str;
    /// Whether egress from the guest is masqueraded behind the host.
    fn ip_masq(&self) -> bool;
}

impl<T: NetDescriber + ?Sized> NetDescriber for &T {
    fn host_ip(&self) -> Option<Ipv4Addr> {
        (**self).host_ip()
    }

    fn guest_ip(&self) -> Option<Ipv4Addr> {
        (**self).guest_ip()
    }

    fn mask(&self) -> Option<Ipv4Addr> {
        (**self).mask()
    }

    fn if_name(&self) -> &str {
        (**self).if_name()
    }

    fn ip_masq(&self) -> bool {
        (**self).ip_masq()
    }
}

/// Concrete, immutable network descriptor.
///
/// Constructed once through the `with_*` methods and never modified
/// after it is handed to setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    network_name: String,
    if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    guest_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_ip: Option<Ipv4Addr>,
    #[serde(default)]
    ip_masq: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    extra: serde_json::Value,
}

impl NetworkDescriptor {
    /// Creates a descriptor with no addresses assigned yet.
    #[must_use]
    pub fn new(network_name: impl Into<String>, if_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            if_name: if_name.into(),
            guest_ip: None,
            mask: None,
            host_ip: None,
            ip_masq: false,
            extra: serde_json::Value::Null,
        }
    }

    /// Sets the guest address and its subnet mask.
    #[must_use]
    pub const fn with_guest(mut self, guest_ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        self.guest_ip = Some(guest_ip);
        self.mask = Some(mask);
        self
    }

    /// Sets the host-side address.
    #[must_use]
    pub const fn with_host_ip(mut self, host_ip: Ipv4Addr) -> Self {
        self.host_ip = Some(host_ip);
        self
    }

    /// Enables or disables masquerading.
    #[must_use]
    pub const fn with_ip_masq(mut self, ip_masq: bool) -> Self {
        self.ip_masq = ip_masq;
        self
    }

    /// Attaches backend-specific configuration.
    #[must_use]
    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }

    /// Builds the descriptor for a completed plugin ADD.
    ///
    /// The plugin's gateway is the host end of the link.
    #[must_use]
    pub fn from_plugin_result(
        network_name: &str,
        if_name: &str,
        ip_masq: bool,
        result: &PluginResult,
    ) -> Self {
        Self {
            network_name: network_name.to_string(),
            if_name: if_name.to_string(),
            guest_ip: Some(result.ip.addr()),
            mask: Some(result.ip.netmask()),
            host_ip: result.gateway,
            ip_masq,
            extra: serde_json::Value::Null,
        }
    }

    /// Logical network name; the second half of the lease key.
    #[must_use]
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Backend-specific configuration, `Null` when absent.
    #[must_use]
    pub const fn extra(&self) -> &serde_json::Value {
        &self.extra
    }

    /// Subnet the host side sits on: `host_ip` (or `guest_ip`) under `mask`.
    #[must_use]
    pub fn subnet(&self) -> Option<Ipv4Net> {
        let addr = self.host_ip.or(self.guest_ip)?;
        let prefix = mask_prefix_len(self.mask?)?;
        Ipv4Net::new(addr, prefix).ok().map(|net| net.trunc())
    }
}

impl NetDescriber for NetworkDescriptor {
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
        &self.if_name
    }

    fn ip_masq(&self) -> bool {
        self.ip_masq
    }
}

/// Converts a dotted netmask to a prefix length.
///
/// Returns `None` for non-contiguous masks such as `255.0.255.0`.
#[must_use]
pub fn mask_prefix_len(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.count_ones() != ones {
        return None;
    }
    u8::try_from(ones).ok()
}
