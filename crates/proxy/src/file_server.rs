//! Local module server for direct traffic

use crate::cache::{CachedEntry, QueryKind};
use crate::response::{GatewayResponse, InboundRequest};
use async_trait::async_trait;
use http::{Method, StatusCode};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

/// Allowed HTTP methods for module files
const ALLOWED_METHODS: &str = "GET, HEAD";

/// Opaque handler for requests that never reach an upstream
#[async_trait]
pub trait LocalHandler: Send + Sync {
    async fn handle(&self, request: &InboundRequest) -> GatewayResponse;
}

/// Serves module files from a directory laid out like the download cache
pub struct LocalModuleServer {
    root: PathBuf,
}

impl LocalModuleServer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve(&self, request: &InboundRequest) -> GatewayResponse {
        let sanitized = sanitize_path(&request.path);

        if sanitized.split('/').any(|s| s == "..") || is_hidden_path(&sanitized) {
            return GatewayResponse::error(StatusCode::FORBIDDEN, "Forbidden");
        }

        let full_path = self.root.join(&sanitized);

        // Resolve symlinks so a link cannot point outside the module root
        let canonical_root = match self.root.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                warn!(root = ?self.root, error = %e, "Local module root unavailable");
                return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found");
            }
        };

        let canonical_path = match full_path.canonicalize() {
            Ok(p) => p,
            Err(_) => return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found"),
        };

        if !canonical_path.starts_with(&canonical_root) {
            return GatewayResponse::error(StatusCode::FORBIDDEN, "Forbidden");
        }

        if !canonical_path.is_file() {
            return GatewayResponse::error(StatusCode::NOT_FOUND, "Not Found");
        }

        let kind = match QueryKind::parse(&request.path) {
            Ok(kind) => kind,
            Err(e) => return GatewayResponse::from_error(&e),
        };

        self.serve_file(request, canonical_path, kind).await
    }

    async fn serve_file(&self, request: &InboundRequest, path: PathBuf, kind: QueryKind) -> GatewayResponse {
        let metadata = match fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return GatewayResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "Metadata error"),
        };

        debug!(path = ?path, content_type = kind.content_type(), "Serving local module file");

        let entry = CachedEntry {
            path,
            kind,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: metadata.len(),
        };

        match entry.serve(request).await {
            Ok(resp) => resp,
            Err(_) => GatewayResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "Read error"),
        }
    }
}

#[async_trait]
impl LocalHandler for LocalModuleServer {
    async fn handle(&self, request: &InboundRequest) -> GatewayResponse {
        if request.method != Method::GET && request.method != Method::HEAD {
            return GatewayResponse::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
                .with_header("Allow", ALLOWED_METHODS);
        }

        self.serve(request).await
    }
}

fn sanitize_path(path: &str) -> String {
    let path = path.trim_start_matches('/');
    path.replace("//", "/")
}

fn is_hidden_path(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}
