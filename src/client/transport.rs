//! HTTP transport
//!
//! One transport value executes requests for one configuration: proxy,
//! user agent, timeouts and redirect policy are fixed at construction. A
//! configuration change means building a new transport, which also starts
//! a fresh cookie jar.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use tracing::{debug, instrument};

use crate::client::params::MultipartField;
use crate::error::{FetchError, Result};
use crate::models::{ProxyDescriptor, ProxyProtocol};

/// User agent used when nothing more specific is configured
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows; U; Windows NT 5.1; en-US; rv:1.9.2.12) Gecko/20101026 Firefox/3.6.12 GTB7.1 ( .NET CLR 3.5.30729; .NET4.0E)";

/// Upstream proxy a transport sends its requests through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub address: String,
    pub protocol: ProxyProtocol,
}

impl ProxySettings {
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.address)
    }
}

/// Everything a transport is configured with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub proxy: Option<ProxySettings>,
    pub user_agent: String,
    pub timeout: Duration,
    pub verbose: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub keep_alive: bool,
    pub accept_invalid_certs: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            verbose: false,
            follow_redirects: true,
            max_redirects: 10,
            keep_alive: true,
            accept_invalid_certs: false,
        }
    }
}

impl TransportSettings {
    /// Same settings routed through `proxy`, with the proxy's user agent
    pub fn with_proxy(&self, proxy: &ProxyDescriptor) -> Self {
        let mut settings = self.clone();
        settings.proxy = Some(ProxySettings {
            address: proxy.address.clone(),
            protocol: proxy.protocol,
        });
        if !proxy.user_agent.trim().is_empty() {
            settings.user_agent = proxy.user_agent.clone();
        }
        settings
    }

    /// Same settings without an upstream proxy
    pub fn direct(&self) -> Self {
        let mut settings = self.clone();
        settings.proxy = None;
        settings
    }
}

/// Request body as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// Form-encoded or raw string payload
    Text(String),
    Multipart(Vec<(String, MultipartField)>),
}

/// A fully prepared request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

/// What came back. Status 0 means no HTTP response was received at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub error: Option<String>,
}

impl TransportResponse {
    pub fn no_response(error: impl Into<String>) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_no_response(&self) -> bool {
        self.status == 0
    }

    /// Header value by case-insensitive name, trimmed; the last occurrence wins
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }
}

/// Executes one HTTP request.
///
/// Network-level failures are reported as a status-0 response, never as an
/// error. `Err` is reserved for requests that cannot be issued at all.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse>;
}

/// Builds transports for a given configuration
pub trait TransportFactory: Send + Sync {
    fn build(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>>;
}

/// Transport backed by a `reqwest::Client`
pub struct ReqwestTransport {
    client: reqwest::Client,
    settings: TransportSettings,
}

impl ReqwestTransport {
    pub fn new(settings: TransportSettings) -> Result<Self> {
        let redirect = if settings.follow_redirects {
            Policy::limited(settings.max_redirects)
        } else {
            Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout)
            .redirect(redirect)
            .cookie_store(true)
            .connection_verbose(settings.verbose)
            .danger_accept_invalid_certs(settings.accept_invalid_certs);

        if !settings.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }

        if let Some(proxy) = &settings.proxy {
            let upstream = reqwest::Proxy::all(proxy.url()).map_err(|e| {
                FetchError::InvalidProxyAddress(format!("{}: {}", proxy.address, e))
            })?;
            builder = builder.proxy(upstream);
        }

        let client = builder.build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Text(body) => {
                let has_content_type = request
                    .headers
                    .iter()
                    .any(|(n, _)| n.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
                if !has_content_type {
                    builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                }
                builder.body(body.clone())
            }
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields).await?),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(FetchError::InvalidRequest(e.to_string()));
            }
            Err(e) => {
                debug!("No response: {}", e);
                return Ok(TransportResponse::no_response(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        match response.bytes().await {
            Ok(body) => {
                debug!(status, bytes = body.len(), "Response received");
                Ok(TransportResponse {
                    status,
                    headers,
                    body,
                    error: None,
                })
            }
            Err(e) => {
                debug!(status, "Response body lost: {}", e);
                Ok(TransportResponse::no_response(e.to_string()))
            }
        }
    }
}

async fn build_form(fields: &[(String, MultipartField)]) -> Result<Form> {
    let mut form = Form::new();
    for (name, field) in fields {
        form = match field {
            MultipartField::Text(value) => form.text(name.clone(), value.clone()),
            MultipartField::File(file) => {
                let data = tokio::fs::read(&file.path).await.map_err(|e| {
                    FetchError::InvalidRequest(format!(
                        "cannot read attachment {}: {}",
                        file.path.display(),
                        e
                    ))
                })?;
                let mut part = Part::bytes(data).file_name(file.file_name());
                if let Some(mime) = &file.mime {
                    part = part.mime_str(mime).map_err(|e| {
                        FetchError::InvalidRequest(format!("invalid mime type {}: {}", mime, e))
                    })?;
                }
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

/// Factory producing `ReqwestTransport`s
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransportFactory;

impl TransportFactory for ReqwestTransportFactory {
    fn build(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(ReqwestTransport::new(settings.clone())?))
    }
}
