#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use rota_fetch::client::{
    HttpSession, Transport, TransportFactory, TransportRequest, TransportResponse,
    TransportSettings,
};
use rota_fetch::error::{FetchError, Result};
use rota_fetch::models::{Headers, Params, ProxyDescriptor, ProxyProtocol};
use rota_fetch::proxy::{AllocatorClient, BanDetector, CoordinatorConfig, RetryCoordinator};
use rota_fetch::repository::{FileLeaseStore, LeasePolicy, LeaseStore};

/// Unique scratch directory removed on drop
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("rota-fetch-it-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    NoResponse,
    Page(u16, Bytes),
    Slow(Duration),
}

impl Reply {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Reply::Page(200, body.into())
    }
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Reply>>,
    fallback: HashMap<String, Reply>,
}

/// Transport factory answering per proxy address.
///
/// Queued replies are used first, then the address's fallback, then 200
/// with an empty body. Every request is logged with the proxy it went
/// through.
#[derive(Clone, Default)]
pub struct ProxyScript {
    script: Arc<Mutex<Script>>,
    log: Arc<Mutex<Vec<(String, TransportRequest)>>>,
}

impl ProxyScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(self, address: &str, reply: Reply) -> Self {
        self.script
            .lock()
            .fallback
            .insert(address.to_string(), reply);
        self
    }

    pub fn then(self, address: &str, reply: Reply) -> Self {
        self.script
            .lock()
            .queued
            .entry(address.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Requests sent through `address`
    pub fn requests_via(&self, address: &str) -> Vec<TransportRequest> {
        self.log
            .lock()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn total_requests(&self) -> usize {
        self.log.lock().len()
    }

    fn next(&self, address: &str) -> Reply {
        let mut script = self.script.lock();
        if let Some(reply) = script.queued.get_mut(address).and_then(VecDeque::pop_front) {
            return reply;
        }
        script
            .fallback
            .get(address)
            .cloned()
            .unwrap_or(Reply::Page(200, Bytes::new()))
    }
}

struct ScriptedTransport {
    address: String,
    script: ProxyScript,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse> {
        self.script
            .log
            .lock()
            .push((self.address.clone(), request.clone()));

        match self.script.next(&self.address) {
            Reply::NoResponse => Ok(TransportResponse::no_response("connection refused")),
            Reply::Page(status, body) => Ok(TransportResponse {
                status,
                headers: vec![("Content-Type".to_string(), "text/html".to_string())],
                body,
                error: None,
            }),
            Reply::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(TransportResponse::no_response("timed out"))
            }
        }
    }
}

impl TransportFactory for ProxyScript {
    fn build(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        let address = settings
            .proxy
            .as_ref()
            .map(|p| p.address.clone())
            .unwrap_or_else(|| "direct".to_string());
        Ok(Arc::new(ScriptedTransport {
            address,
            script: self.clone(),
        }))
    }
}

/// Allocator handing out a fixed sequence of offers
#[derive(Default)]
pub struct OfferAllocator {
    offers: Mutex<VecDeque<String>>,
    pub allocations: Mutex<u32>,
    pub deallocated: Mutex<Vec<String>>,
}

impl OfferAllocator {
    pub fn new(offers: &[&str]) -> Self {
        Self {
            offers: Mutex::new(offers.iter().map(|s| s.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn allocation_count(&self) -> u32 {
        *self.allocations.lock()
    }

    pub fn deallocated(&self) -> Vec<String> {
        self.deallocated.lock().clone()
    }
}

#[async_trait]
impl AllocatorClient for OfferAllocator {
    async fn allocate(&self, _service_name: &str) -> Result<ProxyDescriptor> {
        *self.allocations.lock() += 1;
        let address = self
            .offers
            .lock()
            .pop_front()
            .ok_or(FetchError::AllocationExhausted)?;
        ProxyDescriptor::new(address, ProxyProtocol::Http, "TestAgent/1.0")
    }

    async fn deallocate(&self, proxy: &ProxyDescriptor) -> Result<()> {
        self.deallocated.lock().push(proxy.address.clone());
        Ok(())
    }
}

pub async fn file_store(dir: &TempDir) -> Arc<FileLeaseStore> {
    Arc::new(
        FileLeaseStore::open(&dir.0, LeasePolicy::default())
            .await
            .unwrap(),
    )
}

pub fn coordinator(
    store: Arc<dyn LeaseStore>,
    allocator: Arc<OfferAllocator>,
    config: CoordinatorConfig,
) -> RetryCoordinator {
    RetryCoordinator::new(store, allocator, BanDetector::default(), config)
}

pub fn session(url: &str, script: &ProxyScript) -> HttpSession {
    HttpSession::new(
        url,
        Params::new(),
        Headers::new(),
        TransportSettings::default(),
        Arc::new(script.clone()),
    )
    .unwrap()
}
