//! In-process lease store
//!
//! Same semantics as the file store for a single process; useful for tests
//! and for embedding where leases need not outlive the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    is_usable, validate_address, validate_service_name, ClaimOutcome, LeasePolicy, LeaseStore,
};
use crate::error::Result;
use crate::models::{BlacklistEntry, Lease, SweepReport};

#[derive(Default)]
struct Tables {
    /// service name -> lease
    by_service: HashMap<String, Lease>,
    /// address -> owning service
    by_address: HashMap<String, String>,
}

impl Tables {
    fn insert(&mut self, lease: &Lease) {
        if let Some(previous) = self.by_service.get(&lease.service_name) {
            if previous.address() != lease.address()
                && self.by_address.get(previous.address()) == Some(&lease.service_name)
            {
                let address = previous.address().to_string();
                self.by_address.remove(&address);
            }
        }
        self.by_address
            .insert(lease.address().to_string(), lease.service_name.clone());
        self.by_service
            .insert(lease.service_name.clone(), lease.clone());
    }

    fn remove_address(&mut self, address: &str) -> Option<String> {
        let service_name = self.by_address.remove(address)?;
        if self
            .by_service
            .get(&service_name)
            .is_some_and(|lease| lease.address() == address)
        {
            self.by_service.remove(&service_name);
        }
        Some(service_name)
    }
}

pub struct MemoryLeaseStore {
    tables: Mutex<Tables>,
    blacklist: DashMap<String, BlacklistEntry>,
    policy: LeasePolicy,
}

impl MemoryLeaseStore {
    pub fn new(policy: LeasePolicy) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            blacklist: DashMap::new(),
            policy,
        }
    }

    fn blacklisted_at(&self, address: &str, now: DateTime<Utc>) -> bool {
        self.blacklist
            .get(address)
            .is_some_and(|entry| entry.is_active_at(now, self.policy.blacklist_retention))
    }

    fn valid_lease(&self, tables: &Tables, service_name: &str, now: DateTime<Utc>) -> Option<Lease> {
        let lease = tables.by_service.get(service_name)?;
        let owned = tables.by_address.get(lease.address()).map(String::as_str) == Some(service_name);
        (owned && is_usable(lease, &self.policy, now) && !self.blacklisted_at(lease.address(), now))
            .then(|| lease.clone())
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new(LeasePolicy::default())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn lookup(&self, service_name: &str) -> Result<Option<Lease>> {
        validate_service_name(service_name)?;
        let tables = self.tables.lock();
        Ok(self.valid_lease(&tables, service_name, Utc::now()))
    }

    async fn store(&self, lease: &Lease) -> Result<()> {
        validate_service_name(&lease.service_name)?;
        validate_address(lease.address())?;
        self.tables.lock().insert(lease);
        debug!(service = %lease.service_name, proxy = %lease.address(), "Lease stored");
        Ok(())
    }

    async fn claim(&self, lease: &Lease) -> Result<ClaimOutcome> {
        validate_service_name(&lease.service_name)?;
        validate_address(lease.address())?;

        let now = Utc::now();
        let mut tables = self.tables.lock();
        if let Some(holder) = tables.by_address.get(lease.address()) {
            let live = *holder != lease.service_name
                && tables
                    .by_service
                    .get(holder)
                    .is_some_and(|held| held.address() == lease.address() && !held.is_expired_at(now));
            if live {
                return Ok(ClaimOutcome::AddressTaken {
                    service_name: holder.clone(),
                });
            }
        }

        match self.valid_lease(&tables, &lease.service_name, now) {
            Some(existing) if existing.proxy != lease.proxy => Ok(ClaimOutcome::Held(existing)),
            _ => {
                tables.insert(lease);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn release(&self, address: &str) -> Result<Option<String>> {
        validate_address(address)?;
        let released = self.tables.lock().remove_address(address);
        debug!(proxy = %address, service = ?released, "Lease released");
        Ok(released)
    }

    async fn blacklist(&self, address: &str) -> Result<()> {
        self.release(address).await?;
        self.blacklist.insert(
            address.to_string(),
            BlacklistEntry {
                address: address.to_string(),
                blacklisted_at: Utc::now(),
            },
        );
        info!(proxy = %address, "Proxy blacklisted");
        Ok(())
    }

    async fn is_blacklisted(&self, address: &str) -> Result<bool> {
        Ok(self.blacklisted_at(address, Utc::now()))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        {
            let mut tables = self.tables.lock();
            let expired: Vec<String> = tables
                .by_service
                .values()
                .filter(|lease| lease.is_expired_at(now))
                .map(|lease| lease.address().to_string())
                .collect();
            for address in expired {
                if tables.remove_address(&address).is_some() {
                    report.expired_leases += 1;
                }
            }
        }

        let before = self.blacklist.len();
        self.blacklist
            .retain(|_, entry| entry.is_active_at(now, self.policy.blacklist_retention));
        report.lapsed_blacklist = before - self.blacklist.len();

        Ok(report)
    }

    fn policy(&self) -> &LeasePolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProxyDescriptor, ProxyProtocol};
    use chrono::Duration;

    fn lease(service: &str, address: &str) -> Lease {
        let proxy = ProxyDescriptor::new(address, ProxyProtocol::Http, "ua").unwrap();
        Lease::new(service, proxy, Duration::seconds(30))
    }

    #[tokio::test]
    async fn test_store_lookup_release() {
        let store = MemoryLeaseStore::default();
        store.store(&lease("svc", "10.0.0.1:80")).await.unwrap();

        assert_eq!(
            store.lookup("svc").await.unwrap().unwrap().address(),
            "10.0.0.1:80"
        );
        assert_eq!(
            store.release("10.0.0.1:80").await.unwrap(),
            Some("svc".to_string())
        );
        assert!(store.lookup("svc").await.unwrap().is_none());
        assert_eq!(store.release("10.0.0.1:80").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repointing_frees_previous_address() {
        let store = MemoryLeaseStore::default();
        store.store(&lease("svc", "10.0.0.1:80")).await.unwrap();
        store.store(&lease("svc", "10.0.0.2:80")).await.unwrap();

        assert_eq!(store.release("10.0.0.1:80").await.unwrap(), None);
        assert!(store.lookup("svc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_blacklist_and_claim() {
        let store = MemoryLeaseStore::default();
        assert_eq!(
            store.claim(&lease("svc", "10.0.0.1:80")).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert!(matches!(
            store.claim(&lease("svc", "10.0.0.2:80")).await.unwrap(),
            ClaimOutcome::Held(_)
        ));

        store.blacklist("10.0.0.1:80").await.unwrap();
        assert!(store.is_blacklisted("10.0.0.1:80").await.unwrap());
        assert!(store.lookup("svc").await.unwrap().is_none());
        assert_eq!(
            store.claim(&lease("svc", "10.0.0.2:80")).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_claim_refuses_address_of_other_service() {
        let store = MemoryLeaseStore::default();
        store.store(&lease("alpha", "10.0.0.6:80")).await.unwrap();

        assert_eq!(
            store.claim(&lease("beta", "10.0.0.6:80")).await.unwrap(),
            ClaimOutcome::AddressTaken {
                service_name: "alpha".to_string()
            }
        );
        assert_eq!(
            store.lookup("alpha").await.unwrap().unwrap().address(),
            "10.0.0.6:80"
        );
        assert!(store.lookup("beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep() {
        let store = MemoryLeaseStore::new(LeasePolicy {
            blacklist_retention: Some(Duration::minutes(10)),
            ..LeasePolicy::default()
        });
        let mut stale = lease("old", "10.0.0.3:80");
        stale.expires_at = Utc::now() - Duration::seconds(1);
        store.store(&stale).await.unwrap();
        store.store(&lease("new", "10.0.0.4:80")).await.unwrap();
        store.blacklist("10.0.0.5:80").await.unwrap();

        let report = store
            .sweep(Utc::now() + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(report.lapsed_blacklist, 1);
        assert_eq!(report.expired_leases, 2);

        let report = store.sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
