//! Upstream backends and ordered failover
//!
//! Each [`Backend`] owns its own forwarding engine (a [`Transport`]) and a
//! handle to the response processor. The [`Upstream`] walks its backends in
//! configured order, driven by a per-request [`RetryContext`].

use crate::error::{ProxyError, Result};
use crate::processor::ResponseProcessor;
use crate::response::InboundRequest;
use crate::retry::{RetryContext, RetryStep, RETRY_BACKOFF, RETRY_WITH_SAME_BACKEND_TIMES};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Headers that only make sense on a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A request as it leaves for a backend
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A completed backend round trip
#[derive(Debug, Clone)]
pub struct UpstreamExchange {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL the response was received from
    pub url: Url,
}

impl UpstreamExchange {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One HTTP round trip. Errors returned here are transport errors and feed
/// the retry/failover state machine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: OutboundRequest) -> Result<UpstreamExchange>;
}

/// Settings for the reqwest-based transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub insecure_skip_verify: bool,
    pub outbound_proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-exchange limit; `None` leaves it to the client
    pub timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            insecure_skip_verify: true,
            outbound_proxy: None,
            connect_timeout: Duration::from_secs(10),
            timeout: None,
        }
    }
}

impl TransportOptions {
    pub fn from_config(config: &config::ProxyConfig) -> Self {
        Self {
            insecure_skip_verify: config.insecure_skip_verify,
            outbound_proxy: config.outbound_proxy.clone(),
            connect_timeout: Duration::from_secs(config.timeouts.connect),
            timeout: (config.timeouts.read > 0).then(|| Duration::from_secs(config.timeouts.read)),
        }
    }
}

/// Transport backed by a dedicated `reqwest::Client`
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .connect_timeout(options.connect_timeout);

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(proxy) = &options.outbound_proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ProxyError::ConfigError(format!("Invalid outbound proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: OutboundRequest) -> Result<UpstreamExchange> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        // A reset while streaming the body is still a transport error
        let body = response.bytes().await?;

        Ok(UpstreamExchange {
            status,
            headers,
            body,
            url,
        })
    }
}

/// A single upstream target
pub struct Backend {
    url: Url,
    transport: Arc<dyn Transport>,
    processor: Arc<dyn ResponseProcessor>,
}

impl Backend {
    pub fn new(url: Url, transport: Arc<dyn Transport>, processor: Arc<dyn ResponseProcessor>) -> Self {
        Self {
            url,
            transport,
            processor,
        }
    }

    /// Backend with its own reqwest transport
    pub fn http(url: Url, options: &TransportOptions, processor: Arc<dyn ResponseProcessor>) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(options)?);
        Ok(Self::new(url, transport, processor))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host[:port]` of the backend, used as the outbound Host header
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Target URL for an inbound path and query
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.url.clone();
        url.set_path(&join_url_path(self.url.path(), path));

        let query = match (self.url.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(req)) => Some(format!("{}&{}", base, req)),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(req)) => Some(req.to_string()),
            (None, None) => None,
        };
        url.set_query(query.as_deref());
        url
    }

    /// Rewrite an inbound request for this backend
    pub fn outbound_request(&self, request: &InboundRequest) -> OutboundRequest {
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if name == HOST || HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Ok(host) = HeaderValue::from_str(&self.authority()) {
            headers.insert(HOST, host);
        }

        if let Some(client_ip) = &request.client_ip {
            let forwarded = match request.header("x-forwarded-for") {
                Some(existing) => format!("{}, {}", existing, client_ip),
                None => client_ip.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        if let Some(host) = request.header("host") {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(HeaderName::from_static("x-forwarded-host"), value);
            }
        }

        OutboundRequest {
            method: request.method.clone(),
            url: self.target_url(&request.path, request.query.as_deref()),
            headers,
            body: request.body.clone(),
        }
    }

    /// Forward one attempt and hand a successful exchange to the processor
    pub async fn forward(&self, request: &InboundRequest) -> Result<UpstreamExchange> {
        let outbound = self.outbound_request(request);
        debug!(upstream = %self.url, url = %outbound.url, "Forwarding to upstream");

        let exchange = self.transport.round_trip(outbound).await?;
        info!(status = exchange.status.as_u16(), url = %exchange.url, "upstream proxy");

        self.processor.process(request, exchange).await
    }
}

/// Join a base path and a request path with exactly one slash between them
fn join_url_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Retry behaviour for one Upstream
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub same_backend_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            same_backend_retries: RETRY_WITH_SAME_BACKEND_TIMES,
            backoff: RETRY_BACKOFF,
        }
    }
}

/// Ordered backends; index 0 is where every fresh request starts
#[derive(Default)]
pub struct Upstream {
    backends: Vec<Backend>,
    policy: RetryPolicy,
}

impl Upstream {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            backends: Vec::new(),
            policy,
        }
    }

    pub fn add_backend(&mut self, backend: Backend) {
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn backend(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Serve a fresh request through the first backend
    pub async fn serve_first(&self, request: &InboundRequest) -> Result<UpstreamExchange> {
        self.serve_with(RetryContext::default(), request).await
    }

    /// Serve through the backend at `index`, failing over to later ones
    pub async fn serve_at(&self, index: usize, request: &InboundRequest) -> Result<UpstreamExchange> {
        self.serve_with(RetryContext::at(index), request).await
    }

    async fn serve_with(&self, start: RetryContext, request: &InboundRequest) -> Result<UpstreamExchange> {
        let mut retry = start;
        let mut attempts = 0;

        loop {
            let Some(backend) = self.backend(retry.backend_index()) else {
                warn!(path = %request.path, attempts, "No upstream left to try");
                return Err(ProxyError::UpstreamsExhausted { attempts });
            };

            attempts += 1;
            let err = match backend.forward(request).await {
                Ok(exchange) => return Ok(exchange),
                Err(e) if e.is_transport() => e,
                Err(e) => {
                    warn!(path = %request.path, upstream = %backend.url(), error = %e, "Upstream response processing failed");
                    return Err(e);
                }
            };

            if retry.same_backend_retries() == 0 {
                warn!(
                    path = %request.path,
                    upstream = %backend.url(),
                    error = %err,
                    retries = self.policy.same_backend_retries,
                    "Proxy error, will retry"
                );
            }

            match retry.after_transport_error(self.backends.len(), self.policy.same_backend_retries) {
                RetryStep::RetrySame(next) => {
                    tokio::time::sleep(self.policy.backoff).await;
                    retry = next;
                }
                RetryStep::Failover(next) => {
                    warn!(
                        path = %request.path,
                        upstream = %backend.url(),
                        error = %err,
                        index = next.backend_index(),
                        "Request still fails after retrying, sending to next backend"
                    );
                    retry = next;
                }
                RetryStep::Exhausted => {
                    warn!(path = %request.path, attempts, error = %err, "All upstreams failed");
                    return Err(ProxyError::UpstreamsExhausted { attempts });
                }
            }
        }
    }
}
