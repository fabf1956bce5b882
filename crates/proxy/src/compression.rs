//! Gzip normalization of upstream bodies
//!
//! Artifacts are cached and served decompressed, so a gzip-encoded upstream
//! body is inflated in full before anything else looks at it.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue};
use std::io::Read;
use tracing::debug;

/// Check whether a Content-Encoding value includes gzip
/// (the header is a comma-separated list per RFC 7231 Section 3.1.2.2)
pub fn is_gzip_encoded(content_encoding: Option<&str>) -> bool {
    let ce = match content_encoding {
        Some(ce) => ce,
        None => return false,
    };

    ce.split(',').any(|encoding| {
        let encoding = encoding.trim().to_lowercase();
        encoding == "gzip" || encoding == "x-gzip"
    })
}

/// Inflate a complete gzip stream
pub fn decompress_gzip(data: &[u8]) -> std::result::Result<Bytes, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len().saturating_mul(2));
    decoder.read_to_end(&mut out)?;

    debug!(
        compressed_size = data.len(),
        decompressed_size = out.len(),
        "Gzip decompression"
    );

    Ok(Bytes::from(out))
}

/// Decompress `body` when `headers` declare gzip, then drop Content-Encoding
/// and set Content-Length to the decompressed size. Other bodies are returned
/// unchanged.
pub fn normalize_gzip(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());

    if !is_gzip_encoded(encoding) {
        return Ok(body);
    }

    let decompressed = decompress_gzip(&body).map_err(ProxyError::Decompress)?;
    headers.remove(CONTENT_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(decompressed.len()));

    Ok(decompressed)
}

#[cfg(test)]
pub(crate) fn compress_gzip(data: &[u8]) -> Bytes {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(data).unwrap();
    Bytes::from(encoder.finish().unwrap())
}
