//! Directory-backed lease store
//!
//! ```text
//! {root}/lock/services/{service}   {"proxy":..,"proxytype":..,"uagent":..}
//! {root}/lock/proxies/{address}    "{service}\n{expires_at unix}"
//! {root}/blacklist/{address}       "{blacklisted_at unix}"
//! ```
//!
//! Records are written to a hidden temporary file first and renamed into
//! place, so readers never see partial content. `claim` links the temporary
//! file instead of renaming it, which fails when the record already exists.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    is_usable, validate_address, validate_service_name, ClaimOutcome, LeasePolicy, LeaseStore,
};
use crate::error::{FetchError, Result};
use crate::models::{BlacklistEntry, Lease, ProxyDescriptor, SweepReport};

/// Reverse record: who holds an address and until when
#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    service_name: String,
    expires_at: DateTime<Utc>,
}

impl Holder {
    fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let service_name = lines.next()?.trim().to_string();
        let expires_at = parse_timestamp(lines.next()?)?;
        (!service_name.is_empty()).then_some(Self {
            service_name,
            expires_at,
        })
    }

    fn render(&self) -> String {
        format!("{}\n{}", self.service_name, self.expires_at.timestamp())
    }
}

#[derive(Clone)]
pub struct FileLeaseStore {
    root: PathBuf,
    policy: LeasePolicy,
}

impl FileLeaseStore {
    /// Open a store rooted at `root`, creating its directories
    pub async fn open(root: impl Into<PathBuf>, policy: LeasePolicy) -> Result<Self> {
        let store = Self {
            root: root.into(),
            policy,
        };
        for dir in [store.services_dir(), store.proxies_dir(), store.blacklist_dir()] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                FetchError::Store(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        debug!(root = %store.root.display(), "Lease store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn services_dir(&self) -> PathBuf {
        self.root.join("lock").join("services")
    }

    fn proxies_dir(&self) -> PathBuf {
        self.root.join("lock").join("proxies")
    }

    fn blacklist_dir(&self) -> PathBuf {
        self.root.join("blacklist")
    }

    fn service_path(&self, service_name: &str) -> PathBuf {
        self.services_dir().join(service_name)
    }

    fn proxy_path(&self, address: &str) -> PathBuf {
        self.proxies_dir().join(address)
    }

    fn blacklist_path(&self, address: &str) -> PathBuf {
        self.blacklist_dir().join(address)
    }

    async fn read_forward(&self, service_name: &str) -> Result<Option<ProxyDescriptor>> {
        let Some(content) = read_optional(&self.service_path(service_name)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<ProxyDescriptor>(&content) {
            Ok(proxy) => Ok(Some(proxy)),
            Err(e) => {
                warn!(service = %service_name, "Ignoring malformed lease record: {}", e);
                Ok(None)
            }
        }
    }

    async fn read_holder(&self, address: &str) -> Result<Option<Holder>> {
        let Some(content) = read_optional(&self.proxy_path(address)).await? else {
            return Ok(None);
        };
        let holder = Holder::parse(&content);
        if holder.is_none() {
            warn!(proxy = %address, "Ignoring malformed reverse record");
        }
        Ok(holder)
    }

    async fn read_blacklist(&self, address: &str) -> Result<Option<BlacklistEntry>> {
        let Some(content) = read_optional(&self.blacklist_path(address)).await? else {
            return Ok(None);
        };
        // An unreadable timestamp still excludes the address
        let blacklisted_at = parse_timestamp(&content).unwrap_or_else(Utc::now);
        Ok(Some(BlacklistEntry {
            address: address.to_string(),
            blacklisted_at,
        }))
    }

    /// Resolve the forward record of a service into a lease, without
    /// validity checks
    async fn recorded_lease(&self, service_name: &str) -> Result<Option<Lease>> {
        let Some(proxy) = self.read_forward(service_name).await? else {
            return Ok(None);
        };
        if !proxy.is_valid() {
            return Ok(None);
        }

        let expires_at = match self.read_holder(&proxy.address).await? {
            Some(holder) if holder.service_name == service_name => holder.expires_at,
            // Address has since been leased to someone else
            Some(_) => return Ok(None),
            None if self.policy.enforce_ttl => return Ok(None),
            None => Utc::now(),
        };

        Ok(Some(Lease {
            service_name: service_name.to_string(),
            proxy,
            expires_at,
        }))
    }

    /// Remove the forward record of `service_name` if it points at `address`
    async fn remove_forward_if(&self, service_name: &str, address: &str) -> Result<()> {
        if validate_service_name(service_name).is_err() {
            return Ok(());
        }
        if let Some(proxy) = self.read_forward(service_name).await? {
            if proxy.address == address {
                remove_optional(&self.service_path(service_name)).await?;
            }
        }
        Ok(())
    }

    /// Drop the reverse record of the address the service currently points
    /// at, when it is about to point somewhere else
    async fn detach_previous(&self, lease: &Lease) -> Result<()> {
        let Some(previous) = self.read_forward(&lease.service_name).await? else {
            return Ok(());
        };
        if previous.address == lease.proxy.address || validate_address(&previous.address).is_err()
        {
            return Ok(());
        }
        if let Some(holder) = self.read_holder(&previous.address).await? {
            if holder.service_name == lease.service_name {
                remove_optional(&self.proxy_path(&previous.address)).await?;
            }
        }
        Ok(())
    }

    async fn write_holder(&self, lease: &Lease) -> Result<()> {
        let holder = Holder {
            service_name: lease.service_name.clone(),
            expires_at: lease.expires_at,
        };
        write_atomic(&self.proxy_path(lease.address()), holder.render().as_bytes()).await
    }

    /// Service other than the lease's own holding a live reverse record on
    /// its address
    async fn foreign_holder(&self, lease: &Lease) -> Result<Option<String>> {
        Ok(self
            .read_holder(lease.address())
            .await?
            .filter(|h| h.service_name != lease.service_name && Utc::now() < h.expires_at)
            .map(|h| h.service_name))
    }

    async fn remove_holder_if(&self, address: &str, service_name: &str) -> Result<()> {
        let ours = self
            .read_holder(address)
            .await?
            .is_some_and(|h| h.service_name == service_name);
        if ours {
            remove_optional(&self.proxy_path(address)).await?;
        }
        Ok(())
    }

    /// Link a fresh forward record into place; `false` if one exists
    async fn link_forward(&self, lease: &Lease) -> Result<bool> {
        let path = self.service_path(&lease.service_name);
        let content = serde_json::to_vec(&lease.proxy)?;
        let tmp = temp_path(&path);
        write_file(&tmp, &content).await?;

        let linked = fs::hard_link(&tmp, &path).await;
        remove_optional(&tmp).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(store_error("link", &path, e)),
        }
    }

    /// Move a stale forward record out of the way. Renaming onto a unique
    /// name means only one contender gets to remove a given record; if the
    /// record moved turns out to be a fresh one, it is linked back.
    async fn evict_forward(
        &self,
        service_name: &str,
        stale: Option<&ProxyDescriptor>,
    ) -> Result<()> {
        let path = self.service_path(service_name);
        let tombstone = self
            .services_dir()
            .join(format!(".{}.{}.stale", service_name, Uuid::new_v4().simple()));
        match fs::rename(&path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(store_error("evict", &path, e)),
        }

        let moved = read_optional(&tombstone)
            .await?
            .and_then(|content| serde_json::from_str::<ProxyDescriptor>(&content).ok());
        let replaced_meanwhile =
            matches!((stale, &moved), (Some(stale), Some(moved)) if stale != moved);
        if replaced_meanwhile {
            match fs::hard_link(&tombstone, &path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => warn!(service = %service_name, "Could not restore lease record: {}", e),
            }
        }
        remove_optional(&tombstone).await
    }

    async fn list_records(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| store_error("list", dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_error("list", dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn lookup(&self, service_name: &str) -> Result<Option<Lease>> {
        validate_service_name(service_name)?;

        let Some(lease) = self.recorded_lease(service_name).await? else {
            return Ok(None);
        };
        if !is_usable(&lease, &self.policy, Utc::now()) {
            debug!(service = %service_name, proxy = %lease.address(), "Recorded lease expired");
            return Ok(None);
        }
        if self.is_blacklisted(lease.address()).await? {
            debug!(service = %service_name, proxy = %lease.address(), "Recorded lease is blacklisted");
            return Ok(None);
        }
        Ok(Some(lease))
    }

    async fn store(&self, lease: &Lease) -> Result<()> {
        validate_service_name(&lease.service_name)?;
        validate_address(lease.address())?;

        self.detach_previous(lease).await?;
        self.write_holder(lease).await?;
        let content = serde_json::to_vec(&lease.proxy)?;
        write_atomic(&self.service_path(&lease.service_name), &content).await?;

        debug!(
            service = %lease.service_name,
            proxy = %lease.address(),
            expires_at = %lease.expires_at,
            "Lease stored"
        );
        Ok(())
    }

    async fn claim(&self, lease: &Lease) -> Result<ClaimOutcome> {
        validate_service_name(&lease.service_name)?;
        validate_address(lease.address())?;

        for _ in 0..2 {
            if let Some(service_name) = self.foreign_holder(lease).await? {
                debug!(proxy = %lease.address(), holder = %service_name, "Address leased elsewhere");
                return Ok(ClaimOutcome::AddressTaken { service_name });
            }

            // The reverse record goes first so a linked forward record is
            // always complete for other readers
            self.write_holder(lease).await?;
            if self.link_forward(lease).await? {
                debug!(service = %lease.service_name, proxy = %lease.address(), "Lease claimed");
                return Ok(ClaimOutcome::Claimed);
            }

            match self.lookup(&lease.service_name).await? {
                Some(existing) if existing.proxy == lease.proxy => {
                    self.store(lease).await?;
                    return Ok(ClaimOutcome::Claimed);
                }
                Some(existing) => {
                    self.remove_holder_if(lease.address(), &lease.service_name)
                        .await?;
                    return Ok(ClaimOutcome::Held(existing));
                }
                None => {
                    let stale = self.read_forward(&lease.service_name).await?;
                    self.evict_forward(&lease.service_name, stale.as_ref())
                        .await?;
                }
            }
        }

        self.remove_holder_if(lease.address(), &lease.service_name)
            .await?;

        match self.lookup(&lease.service_name).await? {
            Some(existing) => Ok(ClaimOutcome::Held(existing)),
            None => Err(FetchError::Store(format!(
                "lease for {} is contended",
                lease.service_name
            ))),
        }
    }

    async fn release(&self, address: &str) -> Result<Option<String>> {
        validate_address(address)?;

        let path = self.proxy_path(address);
        let Some(content) = read_optional(&path).await? else {
            debug!(proxy = %address, "No lease to release");
            return Ok(None);
        };
        remove_optional(&path).await?;

        let Some(holder) = Holder::parse(&content) else {
            warn!(proxy = %address, "Released malformed reverse record");
            return Ok(None);
        };
        self.remove_forward_if(&holder.service_name, address).await?;

        debug!(proxy = %address, service = %holder.service_name, "Lease released");
        Ok(Some(holder.service_name))
    }

    async fn blacklist(&self, address: &str) -> Result<()> {
        self.release(address).await?;
        let stamp = Utc::now().timestamp().to_string();
        write_atomic(&self.blacklist_path(address), stamp.as_bytes()).await?;
        info!(proxy = %address, "Proxy blacklisted");
        Ok(())
    }

    async fn is_blacklisted(&self, address: &str) -> Result<bool> {
        if validate_address(address).is_err() {
            return Ok(false);
        }
        Ok(self
            .read_blacklist(address)
            .await?
            .is_some_and(|entry| entry.is_active_at(Utc::now(), self.policy.blacklist_retention)))
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for address in Self::list_records(&self.proxies_dir()).await? {
            let Some(holder) = self.read_holder(&address).await? else {
                continue;
            };
            if now >= holder.expires_at {
                remove_optional(&self.proxy_path(&address)).await?;
                self.remove_forward_if(&holder.service_name, &address).await?;
                report.expired_leases += 1;
            }
        }

        if self.policy.blacklist_retention.is_some() {
            for address in Self::list_records(&self.blacklist_dir()).await? {
                let Some(entry) = self.read_blacklist(&address).await? else {
                    continue;
                };
                if !entry.is_active_at(now, self.policy.blacklist_retention) {
                    remove_optional(&self.blacklist_path(&address)).await?;
                    report.lapsed_blacklist += 1;
                }
            }
        }

        info!(
            expired_leases = report.expired_leases,
            lapsed_blacklist = report.lapsed_blacklist,
            "Lease store swept"
        );
        Ok(report)
    }

    fn policy(&self) -> &LeasePolicy {
        &self.policy
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let secs = value.trim().parse::<i64>().ok()?;
    DateTime::from_timestamp(secs, 0)
}

fn store_error(action: &str, path: &Path, e: std::io::Error) -> FetchError {
    FetchError::Store(format!("{} {}: {}", action, path.display(), e))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(store_error("read", path, e)),
    }
}

async fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(store_error("remove", path, e)),
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .await
        .map_err(|e| store_error("write", path, e))
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    write_file(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(store_error("rename", path, e));
    }
    Ok(())
}
