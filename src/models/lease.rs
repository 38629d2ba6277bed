use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ProxyDescriptor;

/// Time-bounded claim by one service name on one proxy address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub service_name: String,
    pub proxy: ProxyDescriptor,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(service_name: impl Into<String>, proxy: ProxyDescriptor, ttl: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            proxy,
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn address(&self) -> &str {
        &self.proxy.address
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Same lease with its expiry pushed `ttl` past now
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            service_name: self.service_name.clone(),
            proxy: self.proxy.clone(),
            expires_at: Utc::now() + ttl,
        }
    }
}

/// Permanent (or retention-bounded) exclusion of a proxy address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub address: String,
    pub blacklisted_at: DateTime<Utc>,
}

impl BlacklistEntry {
    /// Whether the entry still applies under the given retention.
    /// `None` retention means entries never lapse.
    pub fn is_active_at(&self, now: DateTime<Utc>, retention: Option<Duration>) -> bool {
        match retention {
            Some(retention) => now < self.blacklisted_at + retention,
            None => true,
        }
    }
}

/// Counts of records removed by a store sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub lapsed_blacklist: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyProtocol;

    fn proxy() -> ProxyDescriptor {
        ProxyDescriptor::new("10.1.1.1:8080", ProxyProtocol::Http, "ua").unwrap()
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new("svc", proxy(), Duration::seconds(30));
        assert!(!lease.is_expired());
        assert!(lease.is_expired_at(lease.expires_at));
        assert!(lease.is_expired_at(lease.expires_at + Duration::seconds(1)));
        assert_eq!(lease.address(), "10.1.1.1:8080");
    }

    #[test]
    fn test_lease_renewal_extends_expiry() {
        let mut lease = Lease::new("svc", proxy(), Duration::seconds(30));
        lease.expires_at = Utc::now() - Duration::seconds(5);
        assert!(lease.is_expired());

        let renewed = lease.renewed(Duration::seconds(30));
        assert!(!renewed.is_expired());
        assert_eq!(renewed.service_name, "svc");
        assert_eq!(renewed.proxy, lease.proxy);
    }

    #[test]
    fn test_blacklist_retention() {
        let now = Utc::now();
        let entry = BlacklistEntry {
            address: "10.1.1.1:8080".to_string(),
            blacklisted_at: now - Duration::hours(2),
        };

        assert!(entry.is_active_at(now, None));
        assert!(entry.is_active_at(now, Some(Duration::hours(3))));
        assert!(!entry.is_active_at(now, Some(Duration::hours(1))));
    }
}
