//! Key fingerprinting for rate limiting.
//!
//! A rate limit key identifies *who* is being counted. Callers describe the
//! key with a [`KeySource`] (a literal string, a list of named selectors,
//! or a custom function) and the facade reduces it to a canonical,
//! bounded-length fingerprint. Two sources that canonically reduce to the
//! same bytes always yield the same fingerprint.

use crate::error::{RateLimitError, RateLimitResult};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;

/// Fingerprints longer than this are replaced by a SHA-256 digest.
const MAX_KEY_BYTES: usize = 200;

/// Information about an incoming request used for key extraction.
///
/// Hosts populate whichever fields their framework knows about; selectors
/// that reference an absent field fall back or fail depending on the
/// selector.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    ip: Option<IpAddr>,
    path: String,
    method: String,
    user_id: Option<String>,
    api_key: Option<String>,
    tenant_id: Option<String>,
    headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// Create request info for a path and method.
    pub fn new(path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    /// Set the client address.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Set the authenticated principal.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the API key presented by the client.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the tenant identifier.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Client address, if known.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Authenticated principal, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A named selector extracting one canonical segment from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// Client address, as `ip:<addr>`. `ip:unknown` when absent.
    ClientIp,
    /// Authenticated principal as `user:<id>`, falling back to the client
    /// address for anonymous requests.
    User,
    /// API key as `apikey:<key>`. Fails extraction when absent.
    ApiKey,
    /// Tenant as `tenant:<id>`. Fails extraction when absent.
    Tenant,
    /// Request path as `path:<path>`.
    Path,
    /// Request method as `method:<METHOD>`.
    Method,
    /// Arbitrary header as `hdr:<name>:<value>`. Fails extraction when the
    /// header is absent.
    Header(String),
}

impl KeySelector {
    /// Parse a selector name as it appears in host configuration.
    pub fn from_name(name: &str) -> RateLimitResult<Self> {
        match name {
            "client-address" | "ip" => Ok(Self::ClientIp),
            "authenticated-principal" | "user" => Ok(Self::User),
            "api-key" => Ok(Self::ApiKey),
            "tenant" => Ok(Self::Tenant),
            "path" => Ok(Self::Path),
            "method" => Ok(Self::Method),
            other => {
                if let Some(header) = other.strip_prefix("header:") {
                    if header.is_empty() {
                        return Err(RateLimitError::key_extraction("empty header selector"));
                    }
                    Ok(Self::Header(header.to_string()))
                } else {
                    Err(RateLimitError::key_extraction(format!(
                        "unknown key selector: {other:?}"
                    )))
                }
            }
        }
    }

    fn segment(&self, info: &RequestInfo) -> RateLimitResult<String> {
        match self {
            Self::ClientIp => Ok(ip_segment(info)),
            Self::User => Ok(match info.user_id() {
                Some(id) => format!("user:{id}"),
                None => ip_segment(info),
            }),
            Self::ApiKey => info
                .api_key
                .as_deref()
                .map(|k| format!("apikey:{k}"))
                .ok_or_else(|| RateLimitError::key_extraction("request carries no API key")),
            Self::Tenant => info
                .tenant_id
                .as_deref()
                .map(|t| format!("tenant:{t}"))
                .ok_or_else(|| RateLimitError::key_extraction("request carries no tenant id")),
            Self::Path => Ok(format!("path:{}", info.path())),
            Self::Method => Ok(format!("method:{}", info.method())),
            Self::Header(name) => info
                .header(name)
                .map(|v| format!("hdr:{name}:{v}"))
                .ok_or_else(|| {
                    RateLimitError::key_extraction(format!("missing header {name:?}"))
                }),
        }
    }
}

fn ip_segment(info: &RequestInfo) -> String {
    match info.ip() {
        Some(ip) => format!("ip:{ip}"),
        None => "ip:unknown".to_string(),
    }
}

/// Function-valued key source.
pub type KeyFn = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// Describes how to derive a rate limit key from a request.
#[derive(Clone)]
pub enum KeySource {
    /// A literal key, used as-is.
    Literal(String),
    /// Named selectors composed in order, joined with `:`.
    Selectors(Vec<KeySelector>),
    /// A caller-supplied function.
    Custom(KeyFn),
}

impl KeySource {
    /// A literal key.
    pub fn literal(key: impl Into<String>) -> Self {
        Self::Literal(key.into())
    }

    /// Key by client address.
    pub fn client_ip() -> Self {
        Self::Selectors(vec![KeySelector::ClientIp])
    }

    /// Key by authenticated principal, falling back to the address.
    pub fn user() -> Self {
        Self::Selectors(vec![KeySelector::User])
    }

    /// Compose selectors by configuration name, e.g.
    /// `["client-address", "path"]`.
    pub fn from_names<I, S>(names: I) -> RateLimitResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let selectors = names
            .into_iter()
            .map(|n| KeySelector::from_name(n.as_ref()))
            .collect::<RateLimitResult<Vec<_>>>()?;
        if selectors.is_empty() {
            return Err(RateLimitError::key_extraction("empty selector list"));
        }
        Ok(Self::Selectors(selectors))
    }

    /// A custom key function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Reduce this source to its canonical fingerprint for a request.
    ///
    /// The raw canonical string is the literal, the `:`-joined selector
    /// segments, or the custom function's output. Anything longer than 200
    /// bytes is replaced by `"h:" + hex(sha256(raw))`, keeping keys bounded
    /// and printable.
    pub fn fingerprint(&self, info: &RequestInfo) -> RateLimitResult<String> {
        let raw = match self {
            Self::Literal(key) => key.clone(),
            Self::Selectors(selectors) => {
                let segments = selectors
                    .iter()
                    .map(|s| s.segment(info))
                    .collect::<RateLimitResult<Vec<_>>>()?;
                segments.join(":")
            }
            Self::Custom(f) => f(info),
        };

        if raw.is_empty() {
            return Err(RateLimitError::key_extraction("derived key is empty"));
        }

        Ok(compact(&raw))
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            Self::Selectors(sel) => f.debug_tuple("Selectors").field(sel).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Replace over-long or non-printable keys with a hex SHA-256 digest.
fn compact(raw: &str) -> String {
    let printable = raw.bytes().all(|b| (0x20..0x7f).contains(&b));
    if raw.len() <= MAX_KEY_BYTES && printable {
        return raw.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("h:{}", hex::encode(hasher.finalize()))
}
