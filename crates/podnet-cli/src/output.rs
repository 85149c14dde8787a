//! Formatted output helpers for CLI commands.
//!
//! Renders descriptors and setup records as aligned plain-text tables.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

use podnet_runtime::network::{NetDescriber, NetworkDescriptor};
use podnet_runtime::state::{BackendKind, SetupRecord};

/// Renders rows under `headers` with columns padded to their widest cell.
#[must_use]
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &widths, headers.iter().copied());
    for row in rows {
        push_line(&mut out, &widths, row.iter().map(String::as_str));
    }
    out
}

fn push_line<'c>(out: &mut String, widths: &[usize], cells: impl Iterator<Item = &'c str>) {
    let mut text = String::new();
    for (cell, &width) in cells.zip(widths) {
        let _ = write!(text, "{cell:<width$}  ");
    }
    out.push_str(text.trim_end());
    out.push('\n');
}

fn addr(ip: Option<Ipv4Addr>) -> String {
    ip.map_or_else(|| "-".to_string(), |ip| ip.to_string())
}

/// One row per descriptor, in guest device order.
#[must_use]
pub fn descriptor_table(descriptors: &[NetworkDescriptor]) -> String {
    let rows: Vec<Vec<String>> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| {
            vec![
                format!("eth{i}"),
                d.network_name().to_string(),
                d.if_name().to_string(),
                addr(d.guest_ip()),
                addr(d.mask()),
                addr(d.host_ip()),
                if d.ip_masq() { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    render_table(
        &["DEVICE", "NETWORK", "IFNAME", "GUEST", "MASK", "HOST", "MASQ"],
        &rows,
    )
}

/// One row per persisted setup record.
#[must_use]
pub fn record_table(records: &[SetupRecord]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            let networks: Vec<&str> = r.attachments().map(|a| a.network.as_str()).collect();
            let addresses: Vec<String> = r
                .descriptors()
                .iter()
                .map(|d| addr(d.guest_ip()))
                .collect();
            vec![
                r.pod.id.to_string(),
                r.pod.pid.to_string(),
                match r.backend {
                    BackendKind::Namespace => "namespace",
                    BackendKind::Kvm => "kvm",
                }
                .to_string(),
                r.state.to_string(),
                networks.join(","),
                if addresses.is_empty() {
                    "-".to_string()
                } else {
                    addresses.join(",")
                },
                r.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    render_table(
        &["POD", "PID", "BACKEND", "STATE", "NETWORKS", "ADDRESSES", "CREATED"],
        &rows,
    )
}
