//! Process-wide lease table.
//!
//! A lease marks a (pod, network) pair as taken. It is reserved before
//! the attachment is configured and bound to the allocated addresses
//! once configuration succeeds. Every access goes through one mutex, so
//! two concurrent acquisitions of the same key cannot both succeed.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use podnet_common::error::PodnetError;
use podnet_common::types::{Pod, PodId};
use serde::{Deserialize, Serialize};

use super::descriptor::{NetDescriber, NetworkDescriptor};
use super::error::{NetworkError, Result};
use super::result::Route;

/// Identity of a lease: which pod holds which network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseKey {
    /// Owning pod.
    pub pod_id: PodId,
    /// Network name.
    pub network: String,
}

impl LeaseKey {
    /// Builds a key.
    #[must_use]
    pub fn new(pod_id: PodId, network: impl Into<String>) -> Self {
        Self {
            pod_id,
            network: network.into(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.network)
    }
}

/// Resources allocated to a bound lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Guest address.
    pub guest_ip: Ipv4Addr,
    /// Host-side address, if any.
    pub host_ip: Option<Ipv4Addr>,
    /// Host-side interface name.
    pub if_name: String,
    /// Routes the plugin installed.
    pub routes: Vec<Route>,
}

impl Allocation {
    /// Allocation described by a configured descriptor.
    ///
    /// Returns `None` if the descriptor has no guest address.
    #[must_use]
    pub fn from_descriptor(descriptor: &NetworkDescriptor, routes: Vec<Route>) -> Option<Self> {
        Some(Self {
            guest_ip: descriptor.guest_ip()?,
            host_ip: descriptor.host_ip(),
            if_name: descriptor.if_name().to_string(),
            routes,
        })
    }
}

/// An exclusively held (pod, network) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease identity.
    pub key: LeaseKey,
    /// PID of the pod process that owns the lease.
    pub owner_pid: u32,
    /// Allocated resources; `None` while the attachment is being set up.
    pub allocation: Option<Allocation>,
    /// When the lease was first acquired.
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the attachment behind this lease finished setup.
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.allocation.is_some()
    }
}

/// Answers whether a process still exists.
pub trait LivenessCheck: Send + Sync {
    /// Returns `true` if `pid` is a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// [`LivenessCheck`] backed by the host process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcessTable;

impl LivenessCheck for HostProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        podnet_core::process::is_process_alive(pid)
    }
}

/// The lease table. Share it between pods with an `Arc`.
#[derive(Debug, Default)]
pub struct LeaseStore {
    table: Mutex<HashMap<LeaseKey, Lease>>,
}

impl LeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<LeaseKey, Lease>>> {
        self.table.lock().map_err(|_| {
            NetworkError::Host(PodnetError::LockPoisoned {
                what: "lease table",
            })
        })
    }

    /// Reserves `(pod, network)` for `pod`.
    ///
    /// # Errors
    ///
    /// Returns `LeaseConflict` if the pair is already leased.
    pub fn acquire(&self, pod: &Pod, network: &str) -> Result<Lease> {
        let key = LeaseKey::new(pod.id.clone(), network);
        let mut table = self.lock()?;
        if table.contains_key(&key) {
            tracing::debug!(lease = %key, "lease conflict");
            return Err(NetworkError::LeaseConflict {
                pod: pod.id.clone(),
                network: network.to_string(),
            });
        }
        let lease = Lease {
            key: key.clone(),
            owner_pid: pod.pid,
            allocation: None,
            acquired_at: Utc::now(),
        };
        let _ = table.insert(key, lease.clone());
        drop(table);
        tracing::debug!(lease = %lease.key, owner = pod.pid, "lease acquired");
        Ok(lease)
    }

    /// Replaces a reservation with a lease bound to `allocation`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `key` is not leased.
    pub fn bind(&self, key: &LeaseKey, allocation: Allocation) -> Result<Lease> {
        let mut table = self.lock()?;
        let Some(previous) = table.get(key) else {
            return Err(NetworkError::Host(PodnetError::NotFound {
                kind: "lease",
                id: key.to_string(),
            }));
        };
        let bound = Lease {
            key: key.clone(),
            owner_pid: previous.owner_pid,
            allocation: Some(allocation),
            acquired_at: previous.acquired_at,
        };
        let _ = table.insert(key.clone(), bound.clone());
        Ok(bound)
    }

    /// Removes the lease for `(pod_id, network)`, returning it if present.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn release(&self, pod_id: &PodId, network: &str) -> Result<Option<Lease>> {
        let key = LeaseKey::new(pod_id.clone(), network);
        let released = self.lock()?.remove(&key);
        if released.is_some() {
            tracing::debug!(lease = %key, "lease released");
        }
        Ok(released)
    }

    /// Re-inserts a lease found in a persisted setup record.
    ///
    /// Returns `false` if the key is already leased in this process.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn restore(&self, lease: Lease) -> Result<bool> {
        let mut table = self.lock()?;
        if table.contains_key(&lease.key) {
            return Ok(false);
        }
        let _ = table.insert(lease.key.clone(), lease);
        Ok(true)
    }

    /// Looks a lease up.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn get(&self, key: &LeaseKey) -> Result<Option<Lease>> {
        Ok(self.lock()?.get(key).cloned())
    }

    /// All leases held by `pod_id`, sorted by network name.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn leases_for(&self, pod_id: &PodId) -> Result<Vec<Lease>> {
        let mut leases: Vec<Lease> = self
            .lock()?
            .values()
            .filter(|l| &l.key.pod_id == pod_id)
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(leases)
    }

    /// Number of leases held.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether no leases are held.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Leases whose owning process no longer exists, sorted by key.
    ///
    /// Leases are reported, not removed; reclaiming them is the job of
    /// teardown, which also undoes the host-side configuration.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lease table lock is poisoned.
    pub fn scan_orphans(&self, liveness: &dyn LivenessCheck) -> Result<Vec<Lease>> {
        let mut orphans: Vec<Lease> = self
            .lock()?
            .values()
            .filter(|l| !liveness.is_alive(l.owner_pid))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.key.cmp(&b.key));
        for lease in &orphans {
            tracing::warn!(lease = %lease.key, owner = lease.owner_pid, "orphaned lease");
        }
        Ok(orphans)
    }
}
