//! On-disk artifact cache
//!
//! Cache files live under a root directory at the request's URL path. Listing
//! queries (`@latest`, `@v/list`) expire after a fixed window; versioned
//! artifacts (`.info`, `.mod`, `.zip`) never do.

use crate::error::{ProxyError, Result};
use crate::response::{GatewayResponse, InboundRequest};
use bytes::Bytes;
use http::StatusCode;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// How long a cached listing stays fresh
pub const LIST_EXPIRE: Duration = Duration::from_secs(5 * 60);

/// Permission bits for cache files
pub const CACHE_FILE_MODE: u32 = 0o666;

const TEXT_PLAIN: &str = "text/plain; charset=UTF-8";

/// Module proxy query, recognized by path suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Latest,
    List,
    Info,
    Mod,
    Zip,
}

impl QueryKind {
    /// Classify a request path. Errors carry the client-facing reason.
    pub fn parse(path: &str) -> Result<Self> {
        if path.ends_with("/@latest") {
            return Ok(QueryKind::Latest);
        }

        let what = match path.find("/@v/") {
            Some(i) => &path[i + "/@v/".len()..],
            None => return Err(ProxyError::NotFound("no such path".to_string())),
        };

        if what == "list" {
            return Ok(QueryKind::List);
        }

        match Path::new(what).extension().and_then(|e| e.to_str()) {
            Some("info") => Ok(QueryKind::Info),
            Some("mod") => Ok(QueryKind::Mod),
            Some("zip") => Ok(QueryKind::Zip),
            _ => Err(ProxyError::NotFound("request not recognized".to_string())),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            QueryKind::Latest | QueryKind::List | QueryKind::Mod => TEXT_PLAIN,
            QueryKind::Info => "application/json",
            QueryKind::Zip => "application/octet-stream",
        }
    }

    /// Listings change as new versions are published; artifacts never do
    pub fn is_listing(&self) -> bool {
        matches!(self, QueryKind::Latest | QueryKind::List)
    }
}

/// Outcome of looking a request path up in the cache
#[derive(Debug)]
pub enum CacheLookup {
    /// Nothing cached for this path
    Miss,
    /// A listing older than the expiry window
    Stale,
    /// A servable entry
    Hit(CachedEntry),
    /// Something is cached here but the path is not a module query
    Unrecognized(ProxyError),
}

/// A cache file that can be served
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub path: PathBuf,
    pub kind: QueryKind,
    pub modified: SystemTime,
    pub len: u64,
}

impl CachedEntry {
    /// Entity tag derived from file size and modification time
    pub fn etag(&self) -> String {
        let secs = self
            .modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("\"{:x}-{:x}\"", self.len, secs)
    }

    pub fn last_modified(&self) -> Option<String> {
        let duration = self.modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
        let datetime =
            chrono::DateTime::<chrono::Utc>::from_timestamp(duration.as_secs() as i64, 0)?;
        Some(datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    }

    /// RFC 7232 conditional evaluation; If-None-Match takes precedence
    pub fn is_not_modified(&self, request: &InboundRequest) -> bool {
        if let Some(if_none_match) = request.header("if-none-match") {
            let etag = self.etag();
            return if_none_match
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate == etag || candidate.trim_start_matches("W/") == etag);
        }

        let Some(since) = request
            .header("if-modified-since")
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        else {
            return false;
        };

        let modified_secs = self
            .modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        modified_secs <= since.timestamp()
    }

    /// Build the client response for this entry
    pub async fn serve(&self, request: &InboundRequest) -> Result<GatewayResponse> {
        let etag = self.etag();
        let last_modified = self.last_modified();

        if self.is_not_modified(request) {
            let mut resp = GatewayResponse {
                status: StatusCode::NOT_MODIFIED,
                headers: vec![("ETag".to_string(), etag)],
                body: Bytes::new(),
            };
            if let Some(lm) = last_modified {
                resp.headers.push(("Last-Modified".to_string(), lm));
            }
            return Ok(resp);
        }

        let body = if request.is_head() {
            Bytes::new()
        } else {
            Bytes::from(tokio::fs::read(&self.path).await?)
        };
        let len = if request.is_head() { self.len } else { body.len() as u64 };

        debug!(path = ?self.path, kind = ?self.kind, size = len, "Serving cached file");

        let mut resp = GatewayResponse::new(StatusCode::OK, self.kind.content_type(), body)
            .with_header("Content-Length", len.to_string())
            .with_header("ETag", etag);
        if let Some(lm) = last_modified {
            resp = resp.with_header("Last-Modified", lm);
        }
        Ok(resp)
    }
}

/// Artifact cache rooted at a download directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    list_expire: Duration,
}

impl DiskCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            list_expire: LIST_EXPIRE,
        }
    }

    pub fn with_list_expire(mut self, list_expire: Duration) -> Self {
        self.list_expire = list_expire;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache file for a request path, or `None` if the path tries to leave the root
    pub fn path_for(&self, url_path: &str) -> Option<PathBuf> {
        let relative = Path::new(url_path.trim_start_matches('/'));
        let mut path = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }

        Some(path)
    }

    /// Look up the cache entry for `url_path`, applying listing freshness
    pub async fn lookup(&self, url_path: &str) -> CacheLookup {
        let Some(path) = self.path_for(url_path) else {
            return CacheLookup::Unrecognized(ProxyError::NotFound("no such path".to_string()));
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return CacheLookup::Miss,
        };

        let kind = match QueryKind::parse(url_path) {
            Ok(kind) => kind,
            Err(e) => return CacheLookup::Unrecognized(e),
        };

        if !metadata.is_file() {
            return CacheLookup::Miss;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if kind.is_listing() && self.is_expired(modified) {
            debug!(path = ?path, "Cached listing expired");
            return CacheLookup::Stale;
        }

        CacheLookup::Hit(CachedEntry {
            path,
            kind,
            modified,
            len: metadata.len(),
        })
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        age >= self.list_expire
    }

    /// Atomically replace the cache file for `url_path` with `body`
    pub async fn store(&self, url_path: &str, body: Bytes) -> Result<PathBuf> {
        let path = self
            .path_for(url_path)
            .ok_or_else(|| ProxyError::NotFound("no such path".to_string()))?;

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            atomic_write(&target, &body, CACHE_FILE_MODE)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))
        .and_then(|r| r);

        match written {
            Ok(()) => {
                debug!(path = ?path, "Cache file written");
                Ok(path)
            }
            Err(source) => Err(ProxyError::CacheWrite { path, source }),
        }
    }
}

/// Replace `path` with `data` so that readers see either the old or the new
/// content in full. Parent directories are created as needed.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent directory")
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn set_age(path: &Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_query_kind_parse() {
        assert_eq!(QueryKind::parse("/example.com/m/@latest").unwrap(), QueryKind::Latest);
        assert_eq!(QueryKind::parse("/example.com/m/@v/list").unwrap(), QueryKind::List);
        assert_eq!(QueryKind::parse("/example.com/m/@v/v1.0.0.info").unwrap(), QueryKind::Info);
        assert_eq!(QueryKind::parse("/example.com/m/@v/v1.0.0.mod").unwrap(), QueryKind::Mod);
        assert_eq!(QueryKind::parse("/example.com/m/@v/v1.0.0.zip").unwrap(), QueryKind::Zip);
        assert!(matches!(
            QueryKind::parse("/example.com/m/@v/v1.0.0.tar"),
            Err(ProxyError::NotFound(reason)) if reason == "request not recognized"
        ));
        assert!(matches!(
            QueryKind::parse("/example.com/m"),
            Err(ProxyError::NotFound(reason)) if reason == "no such path"
        ));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(QueryKind::Latest.content_type(), "text/plain; charset=UTF-8");
        assert_eq!(QueryKind::List.content_type(), "text/plain; charset=UTF-8");
        assert_eq!(QueryKind::Mod.content_type(), "text/plain; charset=UTF-8");
        assert_eq!(QueryKind::Info.content_type(), "application/json");
        assert_eq!(QueryKind::Zip.content_type(), "application/octet-stream");
        assert!(QueryKind::List.is_listing());
        assert!(!QueryKind::Zip.is_listing());
    }

    #[test]
    fn test_path_for_rejects_traversal() {
        let cache = DiskCache::new("/var/cache/modproxy");
        assert_eq!(
            cache.path_for("/example.com/m/@v/list"),
            Some(PathBuf::from("/var/cache/modproxy/example.com/m/@v/list"))
        );
        assert_eq!(cache.path_for("/../etc/passwd"), None);
        assert_eq!(cache.path_for("/a/../../b"), None);
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        assert!(matches!(cache.lookup("/example.com/m/@v/v1.0.0.zip").await, CacheLookup::Miss));
    }

    #[tokio::test]
    async fn test_fresh_latest_is_hit() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.store("/example.com/m/@latest", Bytes::from_static(b"{\"Version\":\"v1.2.0\"}")).await.unwrap();

        match cache.lookup("/example.com/m/@latest").await {
            CacheLookup::Hit(entry) => assert_eq!(entry.kind, QueryKind::Latest),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_old_listing_is_stale() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let path = cache.store("/example.com/m/@v/list", Bytes::from_static(b"v1.0.0\n")).await.unwrap();
        set_age(&path, Duration::from_secs(6 * 60));

        assert!(matches!(cache.lookup("/example.com/m/@v/list").await, CacheLookup::Stale));
    }

    #[tokio::test]
    async fn test_old_artifact_never_expires() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let path = cache.store("/example.com/m/@v/v1.0.0.mod", Bytes::from_static(b"module m\n")).await.unwrap();
        set_age(&path, Duration::from_secs(30 * 24 * 3600));

        assert!(matches!(cache.lookup("/example.com/m/@v/v1.0.0.mod").await, CacheLookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_unrecognized_suffix() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.store("/example.com/m/@v/v1.0.0.txt", Bytes::from_static(b"x")).await.unwrap();

        assert!(matches!(
            cache.lookup("/example.com/m/@v/v1.0.0.txt").await,
            CacheLookup::Unrecognized(ProxyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_with_conditional_request() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.store("/example.com/m/@v/v1.0.0.info", Bytes::from_static(b"{}")).await.unwrap();

        let CacheLookup::Hit(entry) = cache.lookup("/example.com/m/@v/v1.0.0.info").await else {
            panic!("expected hit");
        };

        let request = InboundRequest::get("/example.com/m/@v/v1.0.0.info");
        let resp = entry.serve(&request).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body.as_ref(), b"{}");
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        let etag = resp.header("ETag").unwrap().to_string();
        let last_modified = resp.header("Last-Modified").unwrap().to_string();

        let mut by_etag = request.clone();
        by_etag.headers.insert("if-none-match", etag.parse().unwrap());
        assert_eq!(entry.serve(&by_etag).await.unwrap().status, StatusCode::NOT_MODIFIED);

        let mut by_date = request.clone();
        by_date.headers.insert("if-modified-since", last_modified.parse().unwrap());
        assert_eq!(entry.serve(&by_date).await.unwrap().status, StatusCode::NOT_MODIFIED);

        let mut stale_date = request;
        stale_date
            .headers
            .insert("if-modified-since", "Mon, 01 Jan 2001 00:00:00 GMT".parse().unwrap());
        assert_eq!(entry.serve(&stale_date).await.unwrap().status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_head_has_length_without_body() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.store("/example.com/m/@v/v1.0.0.zip", Bytes::from_static(b"PK\x03\x04zip")).await.unwrap();

        let CacheLookup::Hit(entry) = cache.lookup("/example.com/m/@v/v1.0.0.zip").await else {
            panic!("expected hit");
        };

        let mut request = InboundRequest::get("/example.com/m/@v/v1.0.0.zip");
        request.method = http::Method::HEAD;
        let resp = entry.serve(&request).await.unwrap();
        assert!(resp.body.is_empty());
        assert_eq!(resp.header("Content-Length"), Some("7"));
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/@v/list");
        atomic_write(&path, b"v1.0.0\n", CACHE_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"v1.0.0\n");
    }

    #[test]
    fn test_atomic_replace_keeps_open_reader_consistent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m/@v/v1.0.0.zip");
        let old = vec![b'o'; 64 * 1024];
        let new = vec![b'n'; 96 * 1024];

        atomic_write(&path, &old, CACHE_FILE_MODE).unwrap();
        let mut reader = fs::File::open(&path).unwrap();
        let mut first = vec![0u8; 1024];
        reader.read_exact(&mut first).unwrap();

        atomic_write(&path, &new, CACHE_FILE_MODE).unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        first.extend_from_slice(&rest);
        assert_eq!(first, old);
        assert_eq!(fs::read(&path).unwrap(), new);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
