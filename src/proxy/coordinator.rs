//! Retry coordinator
//!
//! Drives one logical fetch through as many proxies as it takes:
//! acquire a lease, execute through it, evaluate the answer, and either
//! return, retry on the same lease, or rotate to a fresh one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use tracing::{debug, info, instrument, warn};

use crate::client::HttpSession;
use crate::error::{FetchError, Result};
use crate::models::{Lease, ProxyDescriptor};
use crate::proxy::allocator::AllocatorClient;
use crate::proxy::ban::BanDetector;
use crate::repository::{ClaimOutcome, LeaseStore};

/// What a single attempt amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(Bytes),
    /// Ban page, or any status other than 200/404/none
    Banned,
    /// No HTTP response at all
    NoResponse,
    NotFound,
}

impl AttemptOutcome {
    pub fn evaluate(status: u16, body: Bytes, detector: &BanDetector) -> Self {
        match status {
            404 => AttemptOutcome::NotFound,
            0 => AttemptOutcome::NoResponse,
            200 if detector.is_banned(&body) => AttemptOutcome::Banned,
            200 => AttemptOutcome::Success(body),
            _ => AttemptOutcome::Banned,
        }
    }
}

/// A page obtained through a proxy
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub proxy: ProxyDescriptor,
    /// Requests issued for this fetch, including the successful one
    pub attempts: u32,
}

/// Result of a fetch that did not fail
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Content(FetchedPage),
    /// The source answered 404; a valid answer, not an error
    NotFound,
}

impl FetchOutcome {
    pub fn into_body(self) -> Option<Bytes> {
        match self {
            FetchOutcome::Content(page) => Some(page.body),
            FetchOutcome::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchOutcome::NotFound)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Name the lease is recorded under
    pub service_name: String,
    pub lease_ttl: chrono::Duration,
    /// Consecutive no-response attempts tolerated on one lease
    pub no_response_threshold: u32,
    /// Overall bound on one fetch
    pub deadline: Option<Duration>,
    pub max_attempts: Option<u32>,
    /// Allocations tried per acquisition when the allocator keeps offering
    /// blacklisted proxies or ones leased to another service
    pub max_allocation_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            lease_ttl: chrono::Duration::seconds(30),
            no_response_threshold: 2,
            deadline: Some(Duration::from_secs(600)),
            max_attempts: None,
            max_allocation_rounds: 8,
        }
    }
}

pub struct RetryCoordinator {
    store: Arc<dyn LeaseStore>,
    allocator: Arc<dyn AllocatorClient>,
    detector: BanDetector,
    config: CoordinatorConfig,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        allocator: Arc<dyn AllocatorClient>,
        detector: BanDetector,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            allocator,
            detector,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Fetch the session's current request through leased proxies.
    ///
    /// Proxy-level failures are absorbed by rotating; only allocator
    /// exhaustion, store failures and the configured bounds surface as
    /// errors.
    #[instrument(
        skip(self, session),
        fields(service = %self.config.service_name, url = %session.request().url)
    )]
    pub async fn fetch(&self, session: &mut HttpSession, method: Method) -> Result<FetchOutcome> {
        let started = Instant::now();
        match self.config.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.run(session, method))
                .await
                .map_err(|_| {
                    warn!(elapsed_ms = started.elapsed().as_millis() as u64, "Fetch deadline reached");
                    FetchError::DeadlineExceeded {
                        elapsed_secs: started.elapsed().as_secs(),
                    }
                })?,
            None => self.run(session, method).await,
        }
    }

    async fn run(&self, session: &mut HttpSession, method: Method) -> Result<FetchOutcome> {
        let base = session.settings().clone();
        let mut current: Option<Lease> = None;
        let mut no_response = 0u32;
        let mut attempts = 0u32;

        loop {
            let lease = match current.take() {
                Some(lease) => lease,
                None => {
                    no_response = 0;
                    self.acquire().await?
                }
            };

            if let Some(max) = self.config.max_attempts {
                if attempts >= max {
                    warn!(attempts, "Giving up on fetch");
                    return Err(FetchError::AttemptsExhausted { attempts });
                }
            }
            attempts += 1;

            if let Err(e) = session.configure(base.with_proxy(&lease.proxy)) {
                warn!(proxy = %lease.address(), "Cannot route through proxy: {}", e);
                self.bad(&lease.proxy).await?;
                continue;
            }
            session.reset();
            session.execute(method.clone(), 1).await?;

            let (status, body) = session
                .last_response()
                .map(|r| (r.status, r.body.clone()))
                .unwrap_or_default();

            match AttemptOutcome::evaluate(status, body, &self.detector) {
                AttemptOutcome::Success(body) => {
                    let renewed = lease.renewed(self.config.lease_ttl);
                    self.store.store(&renewed).await?;
                    info!(proxy = %lease.address(), attempts, bytes = body.len(), "Fetch succeeded");
                    return Ok(FetchOutcome::Content(FetchedPage {
                        body,
                        status,
                        headers: session.last_headers().to_vec(),
                        proxy: renewed.proxy,
                        attempts,
                    }));
                }
                AttemptOutcome::NotFound => {
                    info!(proxy = %lease.address(), attempts, "Source answered not found");
                    return Ok(FetchOutcome::NotFound);
                }
                AttemptOutcome::Banned => {
                    warn!(proxy = %lease.address(), status, attempt = attempts, "Proxy rejected by source");
                    self.bad(&lease.proxy).await?;
                }
                AttemptOutcome::NoResponse => {
                    no_response += 1;
                    if no_response >= self.config.no_response_threshold {
                        warn!(
                            proxy = %lease.address(),
                            consecutive = no_response,
                            "Proxy unreachable, rotating"
                        );
                        self.fail(&lease.proxy).await?;
                    } else {
                        debug!(
                            proxy = %lease.address(),
                            consecutive = no_response,
                            "No response, retrying on the same proxy"
                        );
                        // None leaves the next round to acquire afresh
                        if let Some(refreshed) = self.refresh(&lease).await? {
                            if refreshed.proxy != lease.proxy {
                                no_response = 0;
                            }
                            current = Some(refreshed);
                        }
                    }
                }
            }
        }
    }

    /// Reuse the service's valid lease, or allocate and claim a new one
    async fn acquire(&self) -> Result<Lease> {
        let service_name = &self.config.service_name;
        let ttl = self.config.lease_ttl;

        if let Some(existing) = self.store.lookup(service_name).await? {
            let lease = existing.renewed(ttl);
            self.store.store(&lease).await?;
            debug!(proxy = %lease.address(), "Reusing leased proxy");
            return Ok(lease);
        }

        for round in 1..=self.config.max_allocation_rounds.max(1) {
            let proxy = self.allocator.allocate(service_name).await?;

            if self.store.is_blacklisted(&proxy.address).await? {
                warn!(proxy = %proxy.address, round, "Allocator offered a blacklisted proxy");
                self.deallocate_quietly(&proxy).await;
                continue;
            }

            let lease = Lease::new(service_name.as_str(), proxy, ttl);
            match self.store.claim(&lease).await? {
                ClaimOutcome::Claimed => {
                    info!(proxy = %lease.address(), "Leased new proxy");
                    return Ok(lease);
                }
                ClaimOutcome::Held(theirs) => {
                    debug!(
                        proxy = %theirs.address(),
                        "Service already holds a proxy, returning ours"
                    );
                    self.deallocate_quietly(&lease.proxy).await;
                    let renewed = theirs.renewed(ttl);
                    self.store.store(&renewed).await?;
                    return Ok(renewed);
                }
                ClaimOutcome::AddressTaken { service_name } => {
                    warn!(
                        proxy = %lease.address(),
                        holder = %service_name,
                        round,
                        "Allocator offered a proxy leased to another service"
                    );
                }
            }
        }

        warn!(
            rounds = self.config.max_allocation_rounds,
            "Allocator offered no usable proxy"
        );
        Err(FetchError::AllocationExhausted)
    }

    /// Re-assert a lease before retrying on it. The record may have lapsed
    /// during a slow attempt; if another fetch took the service over in the
    /// meantime, its proxy is adopted and ours is handed back. `None` when
    /// the address has since been leased to another service.
    async fn refresh(&self, lease: &Lease) -> Result<Option<Lease>> {
        let ttl = self.config.lease_ttl;
        let renewed = lease.renewed(ttl);

        let still_ours = self
            .store
            .lookup(&lease.service_name)
            .await?
            .is_some_and(|existing| existing.proxy == lease.proxy);
        if still_ours {
            self.store.store(&renewed).await?;
            return Ok(Some(renewed));
        }

        match self.store.claim(&renewed).await? {
            ClaimOutcome::Claimed => {
                debug!(proxy = %renewed.address(), "Lapsed lease reclaimed");
                Ok(Some(renewed))
            }
            ClaimOutcome::Held(theirs) => {
                warn!(
                    ours = %lease.address(),
                    theirs = %theirs.address(),
                    "Lease taken over during retry, switching proxy"
                );
                self.deallocate_quietly(&lease.proxy).await;
                let adopted = theirs.renewed(ttl);
                self.store.store(&adopted).await?;
                Ok(Some(adopted))
            }
            ClaimOutcome::AddressTaken { service_name } => {
                warn!(
                    proxy = %lease.address(),
                    holder = %service_name,
                    "Lapsed lease went to another service"
                );
                Ok(None)
            }
        }
    }

    /// Give up on a proxy that may only be unreachable for now: hand it back
    /// and drop the lease, without blacklisting
    pub async fn fail(&self, proxy: &ProxyDescriptor) -> Result<()> {
        self.deallocate_quietly(proxy).await;
        self.store.release(&proxy.address).await?;
        Ok(())
    }

    /// Give up on a proxy for good: hand it back and blacklist it
    pub async fn bad(&self, proxy: &ProxyDescriptor) -> Result<()> {
        self.deallocate_quietly(proxy).await;
        self.store.blacklist(&proxy.address).await
    }

    async fn deallocate_quietly(&self, proxy: &ProxyDescriptor) {
        if let Err(e) = self.allocator.deallocate(proxy).await {
            warn!(proxy = %proxy.address, "Failed to hand proxy back: {}", e);
        }
    }
}
