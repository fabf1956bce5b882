//! modproxy-proxy: caching gateway for module proxy servers
//!
//! This crate provides the routing, upstream failover, response processing
//! and disk cache behind the modproxy binary, plus the Pingora service that
//! fronts them.

pub mod cache;
pub mod compression;
pub mod error;
pub mod file_server;
pub mod globs;
pub mod processor;
pub mod proxy;
pub mod response;
pub mod retry;
pub mod router;
pub mod sumdb;
pub mod upstream;

pub use cache::{atomic_write, CacheLookup, CachedEntry, DiskCache, QueryKind};
pub use error::*;
pub use file_server::{LocalHandler, LocalModuleServer};
pub use globs::globs_match_path;
pub use processor::{ArtifactProcessor, ResponseProcessor};
pub use proxy::ModProxy;
pub use response::{GatewayResponse, InboundRequest};
pub use retry::{RetryContext, RetryStep};
pub use router::{Route, Router};
pub use sumdb::SumdbProxy;
pub use upstream::{Backend, HttpTransport, RetryPolicy, Transport, TransportOptions, Upstream};
