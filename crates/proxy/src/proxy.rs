//! Pingora front end
//!
//! Every request is answered inside `request_filter`; the router and the
//! per-backend transports do the upstream work, so Pingora's own peer
//! selection is never reached.

use crate::response::{GatewayResponse, InboundRequest};
use crate::router::Router;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::HeaderName;
use pingora::prelude::*;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "modproxy";

/// Per-request context
pub struct RequestCtx {
    pub request_start: Instant,
    /// Route name chosen by the router, for the completion log line
    pub route: Option<&'static str>,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self {
            request_start: Instant::now(),
            route: None,
        }
    }
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Pingora service implementation for the module gateway
#[derive(Clone)]
pub struct ModProxy {
    router: Arc<Router>,
}

impl ModProxy {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Collect the client request into a transport-neutral value
    async fn read_request(&self, session: &mut Session) -> Result<InboundRequest> {
        let header = session.req_header();
        let method = header.method.clone();
        let path = header.uri.path().to_string();
        let query = header.uri.query().map(str::to_string);
        let headers = header.headers.clone();

        let client_ip = session
            .client_addr()
            .and_then(|a| a.as_inet())
            .map(|a| a.ip().to_string());

        let mut body = BytesMut::new();
        while let Some(chunk) = session.read_request_body().await? {
            body.extend_from_slice(&chunk);
        }

        Ok(InboundRequest {
            method,
            path,
            query,
            headers,
            body: body.freeze(),
            client_ip,
        })
    }

    async fn write_response(
        &self,
        session: &mut Session,
        response: GatewayResponse,
        head_only: bool,
    ) -> Result<()> {
        let mut header = ResponseHeader::build(response.status, None)?;

        for (name, value) in &response.headers {
            match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => {
                    header.append_header(name, value.as_str())?;
                }
                Err(e) => debug!(header = %name, error = %e, "Skipping invalid response header"),
            }
        }

        if response.header("content-length").is_none() {
            header.insert_header("Content-Length", response.body.len().to_string())?;
        }
        header.insert_header("Server", SERVER_NAME)?;

        let body: Option<Bytes> = if head_only || response.body.is_empty() {
            None
        } else {
            Some(response.body)
        };

        session.write_response_header(Box::new(header), body.is_none()).await?;
        if body.is_some() {
            session.write_response_body(body, true).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for ModProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let request = self.read_request(session).await?;
        let (route, response) = self.router.dispatch(&request).await;
        ctx.route = Some(route.name());

        if response.status.is_server_error() {
            warn!(
                path = %request.path,
                route = route.name(),
                status = response.status.as_u16(),
                "Request failed"
            );
        }

        self.write_response(session, response, request.is_head()).await?;
        Ok(true)
    }

    async fn upstream_peer(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        warn!(path = %session.req_header().uri.path(), "Request reached upstream peer selection");
        Err(pingora_core::Error::explain(
            pingora_core::ErrorType::InternalError,
            "modproxy answers every request in request_filter",
        ))
    }

    async fn logging(&self, session: &mut Session, e: Option<&pingora_core::Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let route = ctx.route.unwrap_or("-");
        let duration_ms = ctx.request_start.elapsed().as_millis() as u64;

        if let Some(e) = e {
            warn!(method = %method, path = %path, error = %e, "Request aborted");
        }

        info!(
            method = %method,
            path = %path,
            status = %status,
            route = %route,
            duration_ms = %duration_ms,
            "Request completed"
        );
    }
}
