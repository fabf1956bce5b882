//! Transport-neutral request and response values shared by all handlers

use crate::error::ProxyError;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

/// A client request as seen by the router
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
}

impl InboundRequest {
    /// Bodiless GET for `path`
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// Response produced by the router, the cache or a local handler
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    /// Plain-text error response in the "<code> <message>" form
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::new(
            status,
            "text/plain; charset=utf-8",
            format!("{} {}", status.as_u16(), message),
        )
    }

    /// Client-facing response for a failed request. Only not-found reasons
    /// are echoed; everything else gets the canonical status text.
    pub fn from_error(err: &ProxyError) -> Self {
        let status = err.status();
        match err {
            ProxyError::NotFound(reason) => Self::error(status, reason),
            _ => Self::error(status, status.canonical_reason().unwrap_or("Error")),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
