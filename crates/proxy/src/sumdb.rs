//! Checksum database pass-through
//!
//! Handles `/sumdb/<db>/...`. `supported` probes are answered locally; every
//! other path is fetched from the database host and relayed.

use crate::error::{ProxyError, Result};
use crate::file_server::LocalHandler;
use crate::response::{GatewayResponse, InboundRequest};
use crate::upstream::TransportOptions;
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use reqwest::Url;
use std::collections::HashMap;
use tracing::{debug, warn};

const SUMDB_PREFIX: &str = "/sumdb/";

pub struct SumdbProxy {
    endpoints: HashMap<String, Url>,
    client: reqwest::Client,
}

impl SumdbProxy {
    /// Proxy for the named databases, each reached at `https://<name>/`
    pub fn new<S: AsRef<str>>(supported: &[S], options: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(options.insecure_skip_verify);

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
            .map_err(|e| ProxyError::ConfigError(format!("Failed to build sumdb client: {}", e)))?;

        let mut endpoints = HashMap::new();
        for name in supported {
            let name = name.as_ref();
            let url = Url::parse(&format!("https://{}/", name))
                .map_err(|e| ProxyError::ConfigError(format!("Invalid sumdb name {:?}: {}", name, e)))?;
            endpoints.insert(name.to_string(), url);
        }

        Ok(Self { endpoints, client })
    }

    /// Point a database name at a different base URL
    pub fn with_endpoint(mut self, name: &str, url: Url) -> Self {
        self.endpoints.insert(name.to_string(), url);
        self
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    async fn relay(&self, base: &Url, rest: &str, query: Option<&str>) -> Result<GatewayResponse> {
        let mut target = base
            .join(rest)
            .map_err(|e| ProxyError::NotFound(format!("invalid sumdb path: {}", e)))?;
        target.set_query(query);

        debug!(url = %target, "Fetching from checksum database");
        let response = self.client.get(target).send().await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await?;

        Ok(GatewayResponse::new(status, &content_type, body))
    }
}

#[async_trait]
impl LocalHandler for SumdbProxy {
    async fn handle(&self, request: &InboundRequest) -> GatewayResponse {
        let Some(rest) = request.path.strip_prefix(SUMDB_PREFIX) else {
            return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found");
        };
        let (name, rest) = rest.split_once('/').unwrap_or((rest, ""));

        let Some(base) = self.endpoints.get(name) else {
            debug!(sumdb = %name, "Unsupported checksum database");
            return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found");
        };

        if rest == "supported" {
            return GatewayResponse::new(StatusCode::OK, "text/plain; charset=utf-8", "");
        }

        if rest.is_empty() || rest.split('/').any(|s| s == "..") {
            return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found");
        }

        match self.relay(base, rest, request.query.as_deref()).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(sumdb = %name, path = %request.path, error = %e, "Checksum database request failed");
                GatewayResponse::from_error(&e)
            }
        }
    }
}
