//! Proxy lease persistence
//!
//! A lease is recorded under two indices: forward (service name to proxy)
//! and reverse (proxy address to owning service and expiry). Blacklisted
//! addresses are kept separately and make any lease on them invalid.

pub mod file;
pub mod memory;

pub use file::FileLeaseStore;
pub use memory::MemoryLeaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{FetchError, Result};
use crate::models::{is_valid_proxy_address, Lease, SweepReport};

/// Result of an atomic create-if-absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lease was recorded
    Claimed,
    /// Another holder already has a valid lease for the service
    Held(Lease),
    /// The address is under a live lease of another service
    AddressTaken { service_name: String },
}

/// How leases and blacklist entries age
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub ttl: Duration,
    /// Treat expired leases as absent on lookup
    pub enforce_ttl: bool,
    /// `None` keeps blacklist entries forever
    pub blacklist_retention: Option<Duration>,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(30),
            enforce_ttl: true,
            blacklist_retention: None,
        }
    }
}

/// Storage for leases and the blacklist
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current valid lease for a service.
    ///
    /// Malformed records, blacklisted addresses and (when the policy enforces
    /// it) expired leases are all reported as absent.
    async fn lookup(&self, service_name: &str) -> Result<Option<Lease>>;

    /// Write both records for a lease, replacing whatever the service held
    async fn store(&self, lease: &Lease) -> Result<()>;

    /// Record the lease only if the service holds no valid lease yet
    async fn claim(&self, lease: &Lease) -> Result<ClaimOutcome>;

    /// Drop the lease on an address.
    ///
    /// Returns the service that held it, or `None` when there was no record.
    async fn release(&self, address: &str) -> Result<Option<String>>;

    /// Release the address and exclude it from future leases
    async fn blacklist(&self, address: &str) -> Result<()>;

    async fn is_blacklisted(&self, address: &str) -> Result<bool>;

    /// Remove expired leases and blacklist entries past retention
    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport>;

    fn policy(&self) -> &LeasePolicy;
}

/// Service names become file names, so path separators and dot segments
/// are refused.
pub fn validate_service_name(service_name: &str) -> Result<()> {
    let invalid = service_name.trim().is_empty()
        || service_name.contains(['/', '\\', '\0'])
        || service_name == "."
        || service_name.contains("..")
        || service_name.starts_with('.');
    if invalid {
        return Err(FetchError::Store(format!(
            "invalid service name: {:?}",
            service_name
        )));
    }
    Ok(())
}

pub fn validate_address(address: &str) -> Result<()> {
    if is_valid_proxy_address(address) && address == address.trim() {
        Ok(())
    } else {
        Err(FetchError::InvalidProxyAddress(address.to_string()))
    }
}

/// Whether a recorded lease may be handed out
pub(crate) fn is_usable(lease: &Lease, policy: &LeasePolicy, now: DateTime<Utc>) -> bool {
    lease.proxy.is_valid() && !(policy.enforce_ttl && lease.is_expired_at(now))
}
