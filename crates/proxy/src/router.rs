//! Request dispatch: sumdb, direct, cached or proxied

use crate::cache::{CacheLookup, CachedEntry, DiskCache};
use crate::error::{ProxyError, Result};
use crate::file_server::{LocalHandler, LocalModuleServer};
use crate::globs::globs_match_path;
use crate::processor::ArtifactProcessor;
use crate::response::{GatewayResponse, InboundRequest};
use crate::sumdb::SumdbProxy;
use crate::upstream::{Backend, RetryPolicy, TransportOptions, Upstream, UpstreamExchange};
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Headers from an upstream response that are not relayed to the client
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "content-length"];

/// Per-request routing decision
#[derive(Debug)]
pub enum Route {
    Sumdb,
    Direct,
    Cached(CachedEntry),
    Proxy,
    NotFound(ProxyError),
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Route::Sumdb => "sumdb",
            Route::Direct => "direct",
            Route::Cached(_) => "cached",
            Route::Proxy => "proxy",
            Route::NotFound(_) => "not_found",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct Router {
    upstream: Upstream,
    exclude: String,
    cache: Arc<DiskCache>,
    local: Arc<dyn LocalHandler>,
    sumdb: Arc<dyn LocalHandler>,
}

impl Router {
    pub fn new(
        upstream: Upstream,
        exclude: impl Into<String>,
        cache: Arc<DiskCache>,
        local: Arc<dyn LocalHandler>,
        sumdb: Arc<dyn LocalHandler>,
    ) -> Self {
        Self {
            upstream,
            exclude: exclude.into(),
            cache,
            local,
            sumdb,
        }
    }

    /// Build the router with every collaborator described by `config`
    pub fn from_config(config: &config::Config) -> Result<Self> {
        let options = TransportOptions::from_config(&config.proxy);
        let cache = Arc::new(
            DiskCache::new(&config.proxy.cache_dir)
                .with_list_expire(Duration::from_secs(config.proxy.list_expire_secs)),
        );
        let processor = Arc::new(ArtifactProcessor::new(cache.clone(), &options)?);

        let mut upstream = Upstream::new(RetryPolicy {
            same_backend_retries: config.proxy.same_backend_retries,
            backoff: Duration::from_millis(config.proxy.retry_backoff_ms),
        });

        for raw in &config.proxy.upstreams {
            let url = Url::parse(raw)
                .map_err(|e| ProxyError::ConfigError(format!("Invalid upstream URL {:?}: {}", raw, e)))?;
            info!(upstream = %url, "Adding upstream backend");
            upstream.add_backend(Backend::http(url, &options, processor.clone())?);
        }

        let local = Arc::new(LocalModuleServer::new(&config.local.root));
        let sumdb = Arc::new(SumdbProxy::new(&config.sumdb.supported, &options)?);

        Ok(Self::new(upstream, config.proxy.exclude.clone(), cache, local, sumdb))
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Whether `path` (without its leading slash) is served locally
    pub fn is_direct(&self, path: &str) -> bool {
        if self.exclude.is_empty() {
            return false;
        }
        globs_match_path(&self.exclude, path)
    }

    /// Decide where a request path goes
    pub async fn route(&self, path: &str) -> Route {
        if path.starts_with("/sumdb/") {
            return Route::Sumdb;
        }

        if self.upstream.is_empty() || self.is_direct(path.trim_start_matches('/')) {
            return Route::Direct;
        }

        match self.cache.lookup(path).await {
            CacheLookup::Hit(entry) => Route::Cached(entry),
            CacheLookup::Unrecognized(e) => Route::NotFound(e),
            CacheLookup::Stale | CacheLookup::Miss => Route::Proxy,
        }
    }

    /// Answer one client request
    pub async fn dispatch(&self, request: &InboundRequest) -> (Route, GatewayResponse) {
        let route = self.route(&request.path).await;

        if !matches!(route, Route::Sumdb | Route::NotFound(_)) {
            info!(path = %request.path, route = route.name(), "Routing request");
        }

        let response = match &route {
            Route::Sumdb => self.sumdb.handle(request).await,
            Route::Direct => self.local.handle(request).await,
            Route::Cached(entry) => match entry.serve(request).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(path = %request.path, error = %e, "Failed to serve cached file");
                    GatewayResponse::from_error(&e)
                }
            },
            Route::Proxy => match self.upstream.serve_first(request).await {
                Ok(exchange) => relay(exchange, request.is_head()),
                Err(e) => {
                    warn!(path = %request.path, error = %e, backends = self.upstream.len(), "Upstream request failed");
                    GatewayResponse::from_error(&e)
                }
            },
            Route::NotFound(e) => GatewayResponse::from_error(e),
        };

        (route, response)
    }
}

/// Client response for a processed upstream exchange.
///
/// A HEAD exchange carries no body, so its upstream `content-length` is the
/// only length the client can get and is kept.
fn relay(exchange: UpstreamExchange, head: bool) -> GatewayResponse {
    let headers = exchange
        .headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !SKIPPED_RESPONSE_HEADERS.contains(&name) || (head && name == "content-length")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    GatewayResponse {
        status: exchange.status,
        headers,
        body: exchange.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::PassThrough;
    use crate::upstream::tests::{ok, ScriptedTransport};
    use async_trait::async_trait;
    use http::StatusCode;
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct Named(&'static str);

    #[async_trait]
    impl LocalHandler for Named {
        async fn handle(&self, _request: &InboundRequest) -> GatewayResponse {
            GatewayResponse::new(StatusCode::OK, "text/plain", self.0)
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            same_backend_retries: 1,
            backoff: Duration::from_millis(1),
        }
    }

    fn router_with(dir: &TempDir, transports: Vec<Arc<ScriptedTransport>>, exclude: &str, caching: bool) -> Router {
        let cache = Arc::new(DiskCache::new(dir.path()));
        let mut upstream = Upstream::new(fast_policy());
        for (i, transport) in transports.into_iter().enumerate() {
            let url = Url::parse(&format!("http://backend{}.test", i)).unwrap();
            let processor: Arc<dyn crate::processor::ResponseProcessor> = if caching {
                Arc::new(ArtifactProcessor::new(cache.clone(), &TransportOptions::default()).unwrap())
            } else {
                Arc::new(PassThrough)
            };
            upstream.add_backend(Backend::new(url, transport, processor));
        }
        Router::new(upstream, exclude, cache, Arc::new(Named("local")), Arc::new(Named("sumdb")))
    }

    fn write_cached(dir: &TempDir, rel: &str, data: &[u8], age: Duration) {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_sumdb_prefix_goes_to_sumdb_handler() {
        let dir = TempDir::new().unwrap();
        let router = router_with(&dir, vec![ScriptedTransport::always_failing()], "", false);

        let (route, resp) = router.dispatch(&InboundRequest::get("/sumdb/sum.golang.org/supported")).await;
        assert!(matches!(route, Route::Sumdb));
        assert_eq!(resp.body.as_ref(), b"sumdb");
    }

    #[tokio::test]
    async fn test_no_backends_is_direct() {
        let dir = TempDir::new().unwrap();
        let router = router_with(&dir, vec![], "", false);

        let (route, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@v/list")).await;
        assert!(matches!(route, Route::Direct));
        assert_eq!(resp.body.as_ref(), b"local");
    }

    #[tokio::test]
    async fn test_excluded_pattern_is_direct() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::always_failing();
        let router = router_with(&dir, vec![transport.clone()], "corp.example/*,private.io", false);

        let (route, _) = router.dispatch(&InboundRequest::get("/corp.example/lib/@v/list")).await;
        assert!(matches!(route, Route::Direct));
        let (route, _) = router.dispatch(&InboundRequest::get("/private.io/x/@latest")).await;
        assert!(matches!(route, Route::Direct));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_fresh_latest_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::always_failing();
        let router = router_with(&dir, vec![transport.clone()], "", false);
        write_cached(&dir, "example.com/m/@latest", br#"{"Version":"v1.0.0"}"#, Duration::from_secs(60));

        let (route, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@latest")).await;

        assert!(matches!(route, Route::Cached(_)));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.header("content-type"), Some("text/plain; charset=UTF-8"));
        assert_eq!(resp.body.as_ref(), br#"{"Version":"v1.0.0"}"#);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_latest_is_proxied() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![], ok(StatusCode::OK, br#"{"Version":"v1.1.0"}"#));
        let router = router_with(&dir, vec![transport.clone()], "", true);
        write_cached(&dir, "example.com/m/@latest", br#"{"Version":"v1.0.0"}"#, Duration::from_secs(6 * 60));

        let (route, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@latest")).await;

        assert!(matches!(route, Route::Proxy));
        assert_eq!(resp.body.as_ref(), br#"{"Version":"v1.1.0"}"#);
        assert_eq!(transport.calls(), 1);
        let cached = std::fs::read(dir.path().join("example.com/m/@latest")).unwrap();
        assert_eq!(cached, br#"{"Version":"v1.1.0"}"#);
    }

    #[tokio::test]
    async fn test_artifact_served_from_cache_after_backend_dies() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![ok(StatusCode::OK, b"PK\x03\x04")], Err("connection refused"));
        let router = router_with(&dir, vec![transport.clone()], "", true);
        let request = InboundRequest::get("/example.com/m/@v/v1.0.0.zip");

        let (route, first) = router.dispatch(&request).await;
        assert!(matches!(route, Route::Proxy));
        assert_eq!(first.status, StatusCode::OK);

        let (route, second) = router.dispatch(&request).await;
        assert!(matches!(route, Route::Cached(_)));
        assert_eq!(second.body.as_ref(), b"PK\x03\x04");
        assert_eq!(second.header("content-type"), Some("application/octet-stream"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_unrecognized_suffix_is_not_found() {
        let dir = TempDir::new().unwrap();
        let router = router_with(&dir, vec![ScriptedTransport::always_failing()], "", false);
        write_cached(&dir, "example.com/m/@v/v1.0.0.tgz", b"x", Duration::ZERO);
        write_cached(&dir, "example.com/m/README", b"x", Duration::ZERO);

        let (_, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@v/v1.0.0.tgz")).await;
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.body.as_ref(), b"404 request not recognized");

        let (_, resp) = router.dispatch(&InboundRequest::get("/example.com/m/README")).await;
        assert_eq!(resp.body.as_ref(), b"404 no such path");
    }

    #[tokio::test]
    async fn test_exhausted_upstreams_answer_bad_gateway() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::always_failing();
        let router = router_with(&dir, vec![transport.clone()], "", true);

        let (route, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@v/list")).await;

        assert!(matches!(route, Route::Proxy));
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.body.as_ref(), b"502 Bad Gateway");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_traversal_is_not_found() {
        let dir = TempDir::new().unwrap();
        let router = router_with(&dir, vec![ScriptedTransport::always_failing()], "", false);

        let route = router.route("/../etc/passwd").await;
        assert!(matches!(route, Route::NotFound(ProxyError::NotFound(_))));
    }

    #[test]
    fn test_relay_drops_framing_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());

        headers.insert("content-length", "2".parse().unwrap());

        let resp = relay(
            UpstreamExchange {
                status: StatusCode::OK,
                headers,
                body: bytes::Bytes::from_static(b"{}"),
                url: Url::parse("http://backend.test/m/@v/v1.0.0.info").unwrap(),
            },
            false,
        );

        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert!(resp.header("transfer-encoding").is_none());
        assert!(resp.header("content-length").is_none());
    }

    #[test]
    fn test_relay_keeps_upstream_length_for_head() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-length", "1234".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());

        let resp = relay(
            UpstreamExchange {
                status: StatusCode::OK,
                headers,
                body: bytes::Bytes::new(),
                url: Url::parse("http://backend.test/m/@v/v1.0.0.zip").unwrap(),
            },
            true,
        );

        assert_eq!(resp.header("content-length"), Some("1234"));
        assert!(resp.header("connection").is_none());
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_head_does_not_cache_artifact() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(
            vec![ok(StatusCode::OK, b""), ok(StatusCode::OK, b"PK\x03\x04")],
            Err("connection refused"),
        );
        let router = router_with(&dir, vec![transport.clone()], "", true);
        let path = "/example.com/m/@v/v1.0.0.zip";
        let mut head = InboundRequest::get(path);
        head.method = http::Method::HEAD;

        let (route, resp) = router.dispatch(&head).await;
        assert!(matches!(route, Route::Proxy));
        assert_eq!(resp.status, StatusCode::OK);
        assert!(!dir.path().join("example.com/m/@v/v1.0.0.zip").exists());

        let (route, resp) = router.dispatch(&InboundRequest::get(path)).await;
        assert!(matches!(route, Route::Proxy));
        assert_eq!(resp.body.as_ref(), b"PK\x03\x04");
        assert_eq!(transport.calls(), 2);

        let (route, resp) = router.dispatch(&InboundRequest::get(path)).await;
        assert!(matches!(route, Route::Cached(_)));
        assert_eq!(resp.body.as_ref(), b"PK\x03\x04");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_write_failure_answers_bad_gateway() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("example.com")).unwrap();
        std::fs::write(dir.path().join("example.com/m"), b"not a directory").unwrap();
        let transport = ScriptedTransport::new(vec![], ok(StatusCode::OK, b"module m\n"));
        let router = router_with(&dir, vec![transport.clone()], "", true);

        let (route, resp) = router.dispatch(&InboundRequest::get("/example.com/m/@v/v1.0.0.mod")).await;

        assert!(matches!(route, Route::Proxy));
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(resp.body.as_ref(), b"502 Bad Gateway");
        assert_eq!(transport.calls(), 1);
    }
}
