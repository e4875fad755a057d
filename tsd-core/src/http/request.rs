//! Request signatures and cache keys

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// A cacheable GET request
///
/// Only the headers in `headers` take part in the signature. Credentials and
/// other per-client headers are added by the transport and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl CacheRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: normalize_url(&url.into()),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Canonical text form: method, url, then sorted `name:value` lines
    pub fn signature(&self) -> String {
        let mut sig = format!("{}\n{}\n", self.method.to_ascii_uppercase(), self.url);
        for (name, value) in &self.headers {
            sig.push_str(name);
            sig.push(':');
            sig.push_str(value);
            sig.push('\n');
        }
        sig
    }

    /// Lowercase hex SHA-256 of the signature
    pub fn key(&self) -> String {
        hex::encode(Sha256::digest(self.signature().as_bytes()))
    }
}

/// Drop fragments and an empty query; scheme, host and default ports are
/// canonicalized by the URL parser
fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    url.into()
}

/// Outgoing request as handed to a transport
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    /// Signature headers plus validators for conditional requests
    pub headers: BTreeMap<String, String>,
}

/// Response as seen by the cache
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// SHA-256 checksum in the `sha256:<hex>` form used on disk
pub fn checksum(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
