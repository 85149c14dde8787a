//! Network interface naming.
//!
//! Host-side interface names are global kernel resources, bounded by
//! `IFNAMSIZ` including the trailing NUL.

use podnet_common::error::{PodnetError, Result};

#[cfg(target_os = "linux")]
const IFNAMSIZ: usize = libc::IFNAMSIZ;
#[cfg(not(target_os = "linux"))]
const IFNAMSIZ: usize = 16;

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = IFNAMSIZ - 1;

/// Prefix of derived host-side interface names.
const HOST_IFNAME_PREFIX: &str = "pn";

/// Checks that `name` is usable as a kernel interface name.
///
/// # Errors
///
/// Returns a configuration error if the name is empty, longer than
/// [`MAX_IFNAME_LEN`], equal to `.` or `..`, or contains `/`, `:` or
/// whitespace.
pub fn validate_if_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| PodnetError::Config {
        message: format!("invalid interface name {name:?}: {reason}"),
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(invalid(&format!("longer than {MAX_IFNAME_LEN} bytes")));
    }
    if name == "." || name == ".." {
        return Err(invalid("reserved name"));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(invalid("contains '/', ':' or whitespace"));
    }
    Ok(())
}

/// Name of the guest-side device for the attachment at `ordinal`.
#[must_use]
pub fn guest_device_name(ordinal: usize) -> String {
    format!("eth{ordinal}")
}

/// Derives a stable host-side interface name for a (pod, network) pair.
///
/// Used when the caller does not assign one explicitly.
#[must_use]
pub fn derive_host_if_name(pod_id: &str, network: &str) -> String {
    let hash_len = MAX_IFNAME_LEN - HOST_IFNAME_PREFIX.len();
    let hash = crate::digest::short_hex(&format!("{pod_id}/{network}"), hash_len);
    format!("{HOST_IFNAME_PREFIX}{hash}")
}
