//! Remote proxy allocator client
//!
//! The allocator hands out proxies on `get.json` and takes them back on
//! `del.json`. Both calls are form posts authenticated with the SHA-1 hex
//! digest of a shared secret.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::{debug, info, instrument, warn};

use crate::client::{HttpSession, TransportFactory, TransportSettings};
use crate::error::{FetchError, Result};
use crate::models::{is_valid_proxy_address, Headers, Params, ProxyDescriptor, ProxyProtocol};
use crate::proxy::user_agents::UserAgentPool;

/// Source of proxies
#[async_trait]
pub trait AllocatorClient: Send + Sync {
    /// Obtain a proxy for a service.
    ///
    /// `AllocationExhausted` means the allocator answered but had nothing
    /// to offer; `AllocationFailed` means it could not be asked.
    async fn allocate(&self, service_name: &str) -> Result<ProxyDescriptor>;

    /// Hand a proxy back for recycling
    async fn deallocate(&self, proxy: &ProxyDescriptor) -> Result<()>;
}

/// SHA-1 hex digest sent as the `data` credential
pub fn credential_hash(secret: &str) -> String {
    hex::encode(Sha1::digest(secret.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct AllocationReply {
    proxy: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteAllocatorConfig {
    /// Base URL; `get.json` and `del.json` live directly under it
    pub base_url: String,
    pub secret: String,
    /// Transport attempts per call while the allocator does not answer
    pub attempts: u32,
}

pub struct RemoteAllocator {
    config: RemoteAllocatorConfig,
    credential: String,
    agents: UserAgentPool,
    settings: TransportSettings,
    factory: Arc<dyn TransportFactory>,
}

impl RemoteAllocator {
    /// `settings` are used as given, minus any proxy: the allocator is
    /// always reached directly
    pub fn new(
        config: RemoteAllocatorConfig,
        agents: UserAgentPool,
        settings: TransportSettings,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let credential = credential_hash(&config.secret);
        Self {
            config,
            credential,
            agents,
            settings: settings.direct(),
            factory,
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), name)
    }

    /// Post a form to an endpoint and return the body of a 2xx answer
    async fn call(&self, endpoint: &str, params: Params) -> Result<String> {
        let url = self.endpoint(endpoint);
        let mut session = HttpSession::new(
            &url,
            params,
            Headers::new().with("Accept", "application/json"),
            self.settings.clone(),
            self.factory.clone(),
        )?;

        let body = session
            .post(self.config.attempts)
            .await?
            .ok_or_else(|| FetchError::AllocationFailed(format!("{} did not respond", url)))?;

        let status = session.last_status().unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(FetchError::AllocationFailed(format!(
                "{} answered with status {}",
                url, status
            )));
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl AllocatorClient for RemoteAllocator {
    #[instrument(skip(self))]
    async fn allocate(&self, service_name: &str) -> Result<ProxyDescriptor> {
        let params = Params::new().with("data", self.credential.as_str());
        let body = self.call("get.json", params).await?;

        let reply: AllocationReply = serde_json::from_str(&body).map_err(|e| {
            FetchError::AllocationFailed(format!("malformed allocator reply: {}", e))
        })?;

        let address = match reply.proxy.as_deref().map(str::trim) {
            Some(address) if is_valid_proxy_address(address) => address.to_string(),
            other => {
                warn!(service = %service_name, reply = ?other, "Allocator offered no usable proxy");
                return Err(FetchError::AllocationExhausted);
            }
        };

        let kind = reply.kind.unwrap_or_default();
        let protocol = ProxyProtocol::from_str(&kind)
            .ok_or_else(|| FetchError::UnsupportedProtocol(kind.clone()))?;

        let proxy = ProxyDescriptor::new(address, protocol, self.agents.choose())?;
        info!(service = %service_name, proxy = %proxy.address, protocol = %protocol, "Proxy allocated");
        Ok(proxy)
    }

    #[instrument(skip(self, proxy), fields(proxy = %proxy.address))]
    async fn deallocate(&self, proxy: &ProxyDescriptor) -> Result<()> {
        let proxydata = serde_json::json!({ "ip": proxy.address }).to_string();
        let params = Params::new()
            .with("data", self.credential.as_str())
            .with("proxydata", proxydata);

        self.call("del.json", params).await?;
        debug!("Proxy handed back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::params::decode;
    use crate::client::transport::{RequestBody, Transport, TransportRequest, TransportResponse};
    use bytes::Bytes;
    use parking_lot::Mutex;

    struct Canned {
        status: u16,
        body: &'static str,
        seen: Arc<Mutex<Vec<TransportRequest>>>,
    }

    #[async_trait]
    impl Transport for Canned {
        async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse> {
            self.seen.lock().push(request.clone());
            Ok(TransportResponse {
                status: self.status,
                headers: Vec::new(),
                body: Bytes::from_static(self.body.as_bytes()),
                error: None,
            })
        }
    }

    struct CannedFactory {
        status: u16,
        body: &'static str,
        seen: Arc<Mutex<Vec<TransportRequest>>>,
    }

    impl TransportFactory for CannedFactory {
        fn build(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
            assert!(settings.proxy.is_none());
            Ok(Arc::new(Canned {
                status: self.status,
                body: self.body,
                seen: self.seen.clone(),
            }))
        }
    }

    fn canned_allocator(
        status: u16,
        body: &'static str,
    ) -> (RemoteAllocator, Arc<Mutex<Vec<TransportRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(CannedFactory {
            status,
            body,
            seen: seen.clone(),
        });
        let allocator = RemoteAllocator::new(
            RemoteAllocatorConfig {
                base_url: "https://allocator.example/proxy/".to_string(),
                secret: "abc".to_string(),
                attempts: 1,
            },
            UserAgentPool::from_list(["Agent/1"]),
            TransportSettings::default(),
            factory,
        );
        (allocator, seen)
    }

    fn form(request: &TransportRequest) -> Vec<(String, String)> {
        match &request.body {
            RequestBody::Text(body) => decode(body),
            other => panic!("expected a form body, got {:?}", other),
        }
    }

    #[test]
    fn test_credential_hash() {
        assert_eq!(
            credential_hash("abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[tokio::test]
    async fn test_allocate_parses_reply() {
        let (allocator, seen) = canned_allocator(200, r#"{"proxy":" 10.0.0.1:3128 ","type":"socks5"}"#);

        let proxy = allocator.allocate("svc").await.unwrap();
        assert_eq!(proxy.address, "10.0.0.1:3128");
        assert_eq!(proxy.protocol, ProxyProtocol::Socks5);
        assert_eq!(proxy.user_agent, "Agent/1");

        let seen = seen.lock();
        assert_eq!(seen[0].url, "https://allocator.example/proxy/get.json");
        assert_eq!(seen[0].method, http::Method::POST);
        assert_eq!(
            form(&seen[0]),
            vec![(
                "data".to_string(),
                "a9993e364706816aba3e25717850c26c9cd0d89d".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_allocate_without_proxy_is_exhausted() {
        let (allocator, _) = canned_allocator(200, r#"{"error":"empty pool"}"#);
        assert!(matches!(
            allocator.allocate("svc").await,
            Err(FetchError::AllocationExhausted)
        ));

        let (allocator, _) = canned_allocator(200, r#"{"proxy":"localhost:80","type":"HTTP"}"#);
        assert!(matches!(
            allocator.allocate("svc").await,
            Err(FetchError::AllocationExhausted)
        ));
    }

    #[tokio::test]
    async fn test_allocate_failures() {
        let (allocator, _) = canned_allocator(200, r#"{"proxy":"10.0.0.1:80","type":"FTP"}"#);
        assert!(matches!(
            allocator.allocate("svc").await,
            Err(FetchError::UnsupportedProtocol(_))
        ));

        let (allocator, _) = canned_allocator(502, "bad gateway");
        assert!(matches!(
            allocator.allocate("svc").await,
            Err(FetchError::AllocationFailed(_))
        ));

        let (allocator, _) = canned_allocator(200, "<html>");
        assert!(matches!(
            allocator.allocate("svc").await,
            Err(FetchError::AllocationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_deallocate_posts_proxydata() {
        let (allocator, seen) = canned_allocator(200, r#"{"ok":true}"#);
        let proxy = ProxyDescriptor::new("10.0.0.9:8080", ProxyProtocol::Http, "ua").unwrap();

        allocator.deallocate(&proxy).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen[0].url, "https://allocator.example/proxy/del.json");
        let fields = form(&seen[0]);
        assert_eq!(fields[1].0, "proxydata");
        assert_eq!(fields[1].1, r#"{"ip":"10.0.0.9:8080"}"#);
    }
}
