//! Plugin result protocol.
//!
//! A successful ADD prints a JSON document on standard output. Two shapes
//! are accepted:
//!
//! ```json
//! {"ip4": {"ip": "10.1.0.5/24", "gateway": "10.1.0.1", "routes": [{"dst": "0.0.0.0/0"}]}}
//! {"cniVersion": "1.0.0", "ips": [{"address": "10.1.0.5/24", "gateway": "10.1.0.1"}], "routes": []}
//! ```
//!
//! Only IPv4 is consumed; IPv6 entries are skipped. A failing plugin may
//! print `{"code": N, "msg": "...", "details": "..."}` instead.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

/// A route the plugin installed for the attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network.
    pub dst: Ipv4Net,
    /// Next hop; the attachment's gateway when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// DNS settings reported by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dns {
    /// Nameserver addresses.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// Local domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Search domains.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    /// Resolver options.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Normalized result of a successful plugin ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResult {
    /// Assigned guest address with its prefix.
    pub ip: Ipv4Net,
    /// Gateway (host end of the link), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Routes installed in the guest namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// DNS settings.
    #[serde(default)]
    pub dns: Dns,
}

#[derive(Deserialize)]
struct WireResult {
    ip4: Option<WireLegacyIp>,
    ips: Option<Vec<WireIp>>,
    #[serde(default)]
    routes: Vec<WireRoute>,
    #[serde(default)]
    dns: Dns,
}

#[derive(Deserialize)]
struct WireLegacyIp {
    ip: String,
    gateway: Option<String>,
    #[serde(default)]
    routes: Vec<WireRoute>,
}

#[derive(Deserialize)]
struct WireIp {
    address: String,
    gateway: Option<String>,
}

#[derive(Deserialize)]
struct WireRoute {
    dst: String,
    gw: Option<String>,
}

impl PluginResult {
    /// Parses a plugin's standard output.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the payload is not JSON,
    /// carries no IPv4 address, or contains an unparsable address.
    pub fn parse(stdout: &[u8]) -> Result<Self, String> {
        let wire: WireResult =
            serde_json::from_slice(stdout).map_err(|e| format!("invalid result JSON: {e}"))?;

        let (ip, gateway, mut raw_routes) = if let Some(legacy) = wire.ip4 {
            let ip = parse_v4_net(&legacy.ip)?
                .ok_or_else(|| format!("ip4.ip {:?} is not IPv4", legacy.ip))?;
            (ip, legacy.gateway, legacy.routes)
        } else {
            let mut found = None;
            for entry in wire.ips.unwrap_or_default() {
                if let Some(net) = parse_v4_net(&entry.address)? {
                    found = Some((net, entry.gateway));
                    break;
                }
            }
            let (ip, gateway) = found.ok_or("result carries no IPv4 address")?;
            (ip, gateway, Vec::new())
        };

        let gateway = gateway
            .map(|gw| parse_v4_addr(&gw))
            .transpose()?
            .flatten();
        raw_routes.extend(wire.routes);
        let mut routes = Vec::with_capacity(raw_routes.len());
        for route in raw_routes {
            if let Some(route) = parse_route(&route)? {
                routes.push(route);
            }
        }

        Ok(Self {
            ip,
            gateway,
            routes,
            dns: wire.dns,
        })
    }
}

/// Returns `Ok(None)` for valid IPv6 networks.
fn parse_v4_net(raw: &str) -> Result<Option<Ipv4Net>, String> {
    match raw.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(Some(net)),
        Ok(IpNet::V6(_)) => Ok(None),
        Err(e) => Err(format!("invalid address {raw:?}: {e}")),
    }
}

/// Returns `Ok(None)` for valid IPv6 addresses.
fn parse_v4_addr(raw: &str) -> Result<Option<Ipv4Addr>, String> {
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(Some(addr)),
        Ok(IpAddr::V6(_)) => Ok(None),
        Err(e) => Err(format!("invalid address {raw:?}: {e}")),
    }
}

fn parse_route(route: &WireRoute) -> Result<Option<Route>, String> {
    let Some(dst) = parse_v4_net(&route.dst)? else {
        return Ok(None);
    };
    let gw = match &route.gw {
        Some(raw) => match parse_v4_addr(raw)? {
            Some(gw) => Some(gw),
            None => return Ok(None),
        },
        None => None,
    };
    Ok(Some(Route { dst, gw }))
}

/// Error payload printed by a failing plugin.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginErrorPayload {
    /// Plugin error code.
    pub code: u32,
    /// Short message.
    #[serde(default)]
    pub msg: String,
    /// Longer details.
    #[serde(default)]
    pub details: Option<String>,
}

impl PluginErrorPayload {
    /// Plugin code for "container unknown or does not exist".
    pub const UNKNOWN_CONTAINER: u32 = 3;

    /// Parses an error payload, returning `None` if `stdout` is not one.
    #[must_use]
    pub fn parse(stdout: &[u8]) -> Option<Self> {
        serde_json::from_slice(stdout).ok()
    }
}

impl fmt::Display for PluginErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.msg)?;
        if let Some(details) = self.details.as_deref().filter(|d| !d.is_empty()) {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
