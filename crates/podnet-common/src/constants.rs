//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for podnet data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/podnet";

/// Returns the data directory, preferring `$HOME/.podnet` for non-root
/// environments, falling back to `/var/lib/podnet`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".podnet");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Directory holding network definition files.
pub const DEFAULT_NET_CONF_DIR: &str = "/etc/podnet/net.d";

/// Directories searched for network plugin binaries, in order.
pub const DEFAULT_PLUGIN_DIRS: &[&str] = &["/usr/lib/podnet/plugins", "/opt/cni/bin"];

/// Subdirectory of the data directory holding persisted setup records.
pub const RECORDS_DIR_NAME: &str = "netrecords";

/// Extension of network definition files.
pub const NET_CONF_EXTENSION: &str = "conf";

/// Default deadline for a single plugin invocation.
pub const DEFAULT_PLUGIN_TIMEOUT_MS: u64 = 30_000;

/// Name of the built-in masquerading network.
pub const DEFAULT_NETWORK: &str = "default";

/// Name of the built-in non-masquerading network.
pub const DEFAULT_RESTRICTED_NETWORK: &str = "default-restricted";

/// Prefix of per-attachment iptables chains.
pub const MASQ_CHAIN_PREFIX: &str = "PODNET-";
