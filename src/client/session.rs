//! Per-session HTTP client
//!
//! Holds the current request, the transport configuration and the live
//! transport built from it. Transports are only ever rebuilt through
//! [`HttpSession::configure`] or [`HttpSession::reconnect`].

use std::sync::Arc;

use bytes::Bytes;
use http::Method;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::client::params::{self, Payload};
use crate::client::transport::{
    RequestBody, Transport, TransportFactory, TransportRequest, TransportResponse,
    TransportSettings,
};
use crate::error::Result;
use crate::models::{FileAttachment, Headers, Params, RequestSpec};

pub struct HttpSession {
    id: Uuid,
    request: RequestSpec,
    settings: TransportSettings,
    factory: Arc<dyn TransportFactory>,
    transport: Arc<dyn Transport>,
    last: Option<(Method, TransportResponse)>,
}

impl HttpSession {
    pub fn new(
        url: &str,
        params: Params,
        headers: Headers,
        settings: TransportSettings,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let transport = factory.build(&settings)?;
        Ok(Self {
            id: Uuid::new_v4(),
            request: RequestSpec::new(url, params, headers),
            settings,
            factory,
            transport,
            last: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Replace the request. The URL is resolved against the previous one.
    pub fn set_request(
        &mut self,
        url: &str,
        params: Params,
        headers: Headers,
        files: Vec<(String, FileAttachment)>,
    ) {
        self.request.set_request(url, params, headers, files);
        self.reset();
    }

    /// Apply new transport settings; rebuilds the transport only on change
    pub fn configure(&mut self, settings: TransportSettings) -> Result<()> {
        if settings == self.settings {
            return Ok(());
        }
        self.settings = settings;
        self.reconnect()
    }

    /// Build a fresh transport (and cookie jar) from the current settings
    pub fn reconnect(&mut self) -> Result<()> {
        self.transport = self.factory.build(&self.settings)?;
        self.reset();
        debug!(session = %self.id, proxy = ?self.settings.proxy, "Transport rebuilt");
        Ok(())
    }

    /// Forget the cached response so the next call hits the network
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub async fn get(&mut self, retries: u32) -> Result<Option<Bytes>> {
        self.execute(Method::GET, retries).await
    }

    pub async fn post(&mut self, retries: u32) -> Result<Option<Bytes>> {
        self.execute(Method::POST, retries).await
    }

    pub async fn put(&mut self, retries: u32) -> Result<Option<Bytes>> {
        self.execute(Method::PUT, retries).await
    }

    pub async fn delete(&mut self, retries: u32) -> Result<Option<Bytes>> {
        self.execute(Method::DELETE, retries).await
    }

    /// Execute the current request, making up to `retries` attempts while no
    /// response arrives. Returns `None` when every attempt went unanswered.
    /// A received response is cached and returned again for the same method
    /// until the request changes or the session is reset.
    #[instrument(skip(self), fields(session = %self.id, url = %self.request.url))]
    pub async fn execute(&mut self, method: Method, retries: u32) -> Result<Option<Bytes>> {
        if let Some((last_method, last)) = &self.last {
            if *last_method == method && !last.is_no_response() {
                return Ok(Some(last.body.clone()));
            }
        }

        let request = self.prepare(&method);
        let attempts = retries.max(1);
        let mut response = TransportResponse::no_response("not attempted");

        for attempt in 1..=attempts {
            response = self.transport.execute(&request).await?;
            if !response.is_no_response() {
                break;
            }
            debug!(attempt, attempts, error = ?response.error, "No response");
        }

        let body = (!response.is_no_response()).then(|| response.body.clone());
        self.last = Some((method, response));
        Ok(body)
    }

    /// Turn the current request into what the transport sends.
    ///
    /// GET and DELETE carry a string payload in the query; other methods
    /// send it as the body. Multipart payloads are only sent as a body.
    pub fn prepare(&self, method: &Method) -> TransportRequest {
        let payload = params::serialize(&self.request.params);
        let headers = params::header_lines(&self.request.headers);
        let in_query = *method == Method::GET || *method == Method::DELETE;

        let (url, body) = match payload {
            Payload::Raw(text) | Payload::Query(text) if in_query => {
                let url = if text.is_empty() {
                    self.request.url.clone()
                } else {
                    format!("{}?{}", self.request.url, text)
                };
                (url, RequestBody::Empty)
            }
            Payload::Multipart(_) if in_query => (self.request.url.clone(), RequestBody::Empty),
            Payload::Raw(text) | Payload::Query(text) => {
                (self.request.url.clone(), RequestBody::Text(text))
            }
            Payload::Multipart(fields) => (self.request.url.clone(), RequestBody::Multipart(fields)),
        };

        TransportRequest {
            method: method.clone(),
            url,
            headers,
            body,
        }
    }

    pub fn last_response(&self) -> Option<&TransportResponse> {
        self.last.as_ref().map(|(_, response)| response)
    }

    /// Status of the last call; 0 when nothing answered
    pub fn last_status(&self) -> Option<u16> {
        self.last_response().map(|r| r.status)
    }

    pub fn last_headers(&self) -> &[(String, String)] {
        self.last_response()
            .map(|r| r.headers.as_slice())
            .unwrap_or(&[])
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.last_response().and_then(|r| r.header(name))
    }
}
