//! Post-processing of upstream exchanges
//!
//! Every exchange that made it back from a backend without a transport error
//! goes through a [`ResponseProcessor`] before the client sees it.

use crate::cache::DiskCache;
use crate::compression::normalize_gzip;
use crate::error::{ProxyError, Result};
use crate::response::InboundRequest;
use crate::upstream::{TransportOptions, UpstreamExchange};
use async_trait::async_trait;
use http::header::LOCATION;
use http::{Method, StatusCode};
use reqwest::Url;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hook applied to each successful backend exchange
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    /// `request` is the client request that produced `exchange`. Errors
    /// returned here are never retried.
    async fn process(&self, request: &InboundRequest, exchange: UpstreamExchange) -> Result<UpstreamExchange>;
}

/// Gzip-normalizes bodies, caches `200 OK` artifacts and resolves redirects.
///
/// Only GET exchanges are rewritten or cached. A HEAD response has no body,
/// so it is handed through with its upstream headers intact.
pub struct ArtifactProcessor {
    cache: Arc<DiskCache>,
    client: reqwest::Client,
}

impl ArtifactProcessor {
    /// The redirect client shares the proxy and timeouts in `options` but
    /// always verifies certificates: redirect targets are arbitrary hosts,
    /// not configured backends.
    pub fn new(cache: Arc<DiskCache>, options: &TransportOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .no_gzip()
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
            .map_err(|e| ProxyError::ConfigError(format!("Failed to build redirect client: {}", e)))?;

        Ok(Self { cache, client })
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Fetch the redirect target and cache it under the original request path
    async fn resolve_redirect(&self, request_path: &str, exchange: &UpstreamExchange) -> Result<()> {
        let location = exchange
            .header(LOCATION.as_str())
            .ok_or(ProxyError::MissingLocation(exchange.status.as_u16()))?;

        let target = exchange
            .url
            .join(location)
            .map_err(|e| ProxyError::InvalidLocation {
                location: location.to_string(),
                reason: e.to_string(),
            })?;

        self.fetch_and_cache(request_path, target).await
    }

    async fn fetch_and_cache(&self, request_path: &str, target: Url) -> Result<()> {
        let redirect_error = |e: reqwest::Error| ProxyError::RedirectFetch {
            url: target.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .get(target.clone())
            .send()
            .await
            .map_err(redirect_error)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        let body = response.bytes().await.map_err(redirect_error)?;

        if status != StatusCode::OK {
            warn!(
                path = %request_path,
                url = %target,
                status = status.as_u16(),
                "Redirect target did not return 200, not caching"
            );
            return Ok(());
        }

        let body = normalize_gzip(&mut headers, body)?;
        let path = self.cache.store(request_path, body).await?;
        info!(path = %request_path, url = %target, file = ?path, "Cached redirect target");
        Ok(())
    }
}

#[async_trait]
impl ResponseProcessor for ArtifactProcessor {
    async fn process(&self, request: &InboundRequest, mut exchange: UpstreamExchange) -> Result<UpstreamExchange> {
        let request_path = request.path.as_str();
        if request.method != Method::GET {
            debug!(path = %request_path, method = %request.method, "Not caching non-GET response");
            return Ok(exchange);
        }

        exchange.body = normalize_gzip(&mut exchange.headers, exchange.body)?;

        match exchange.status {
            StatusCode::OK => {
                let path = self.cache.store(request_path, exchange.body.clone()).await?;
                debug!(path = %request_path, file = ?path, "Cached upstream response");
            }
            StatusCode::FOUND => {
                self.resolve_redirect(request_path, &exchange).await?;
            }
            status => {
                debug!(path = %request_path, status = status.as_u16(), "Not caching upstream response");
            }
        }

        Ok(exchange)
    }
}

/// Hands exchanges through untouched
#[cfg(test)]
pub(crate) struct PassThrough;

#[cfg(test)]
#[async_trait]
impl ResponseProcessor for PassThrough {
    async fn process(&self, _request: &InboundRequest, exchange: UpstreamExchange) -> Result<UpstreamExchange> {
        Ok(exchange)
    }
}
