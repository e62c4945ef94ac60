//! Request descriptors and the serializer that builds them.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::method::HttpMethod;
use crate::error::{RequestSerializationError, Result};
use crate::params::{EncodeOptions, Params, encode};

/// Characters escaped when re-encoding a whole URL. Reserved delimiters are
/// kept so the URL structure survives.
const URL_UNSAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";

/// How a request may use locally cached responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Follow the protocol's caching rules.
    #[default]
    UseProtocolCachePolicy,
    /// Always load from the origin.
    ReloadIgnoringLocalCacheData,
    /// Use cached data of any age, loading only when nothing is cached.
    ReturnCacheDataElseLoad,
    /// Use cached data only; never load.
    ReturnCacheDataDontLoad,
}

/// How parameters destined for a body are encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    /// `application/x-www-form-urlencoded` via the parameter codec.
    #[default]
    Form,
    /// `application/json`.
    Json,
}

/// The body of a request descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    /// No body.
    #[default]
    None,
    /// Raw bytes, sent as-is.
    Bytes(Bytes),
    /// Parameters encoded into text.
    Params(String),
    /// A file streamed from disk.
    File(PathBuf),
}

impl RequestBody {
    /// Check whether there is no body.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// A fully built request. Immutable once built.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    url: Url,
    method: HttpMethod,
    headers: HeaderMap,
    body: RequestBody,
    cache_policy: CachePolicy,
    timeout: Duration,
    allows_metered_network: bool,
}

impl RequestDescriptor {
    /// The target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The HTTP method.
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a header value as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request body.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// The cache policy.
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// The request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the request may use a metered network.
    pub fn allows_metered_network(&self) -> bool {
        self.allows_metered_network
    }

    /// Copy this descriptor with one header replaced.
    pub fn with_header(&self, name: &str, value: &str) -> Result<Self> {
        let (name, value) = header_pair(name, value)?;
        let mut copy = self.clone();
        copy.headers.insert(name, value);
        Ok(copy)
    }
}

/// Request defaults and the builder entry point.
///
/// # Example
///
/// ```ignore
/// use courier::http::{HttpMethod, RequestSerializer};
/// use courier::params::Params;
///
/// let serializer = RequestSerializer::new().basic_auth("user", "secret");
/// let request = serializer
///     .request(HttpMethod::Post, "https://api.test/items")
///     .params(Params::new().insert("name", "widget"))
///     .build()?;
/// assert_eq!(request.header("content-type"), Some("application/x-www-form-urlencoded"));
/// ```
#[derive(Clone, Debug)]
pub struct RequestSerializer {
    headers: HeaderMap,
    credentials: Option<(String, String)>,
    cache_policy: CachePolicy,
    timeout: Duration,
    allows_metered_network: bool,
    encode_options: EncodeOptions,
    body_encoding: BodyEncoding,
    uri_methods: Vec<HttpMethod>,
}

impl Default for RequestSerializer {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            credentials: None,
            cache_policy: CachePolicy::default(),
            timeout: Duration::from_secs(60),
            allows_metered_network: true,
            encode_options: EncodeOptions::default(),
            body_encoding: BodyEncoding::default(),
            uri_methods: vec![HttpMethod::Get, HttpMethod::Head, HttpMethod::Delete],
        }
    }
}

impl RequestSerializer {
    /// Create a serializer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every request.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let (name, value) = header_pair(name, value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Send Basic credentials with every request.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Set the default cache policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Set the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow or forbid metered networks.
    pub fn allows_metered_network(mut self, allowed: bool) -> Self {
        self.allows_metered_network = allowed;
        self
    }

    /// Set the parameter encoding options.
    pub fn encode_options(mut self, options: EncodeOptions) -> Self {
        self.encode_options = options;
        self
    }

    /// Set how body parameters are encoded.
    pub fn body_encoding(mut self, encoding: BodyEncoding) -> Self {
        self.body_encoding = encoding;
        self
    }

    /// Set the methods whose parameters go into the URL query.
    pub fn uri_methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.uri_methods = methods.into_iter().collect();
        self
    }

    /// Check whether parameters for `method` are encoded into the URL.
    pub fn encodes_params_in_uri(&self, method: HttpMethod) -> bool {
        self.uri_methods.contains(&method)
    }

    /// Build a descriptor with no parameters or body.
    pub fn build(&self, url: &str, method: HttpMethod) -> Result<RequestDescriptor> {
        self.request(method, url).build()
    }

    /// Start building a request.
    pub fn request(&self, method: HttpMethod, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            serializer: self,
            method,
            url: url.into(),
            query: None,
            params: None,
            body: None,
            file: None,
            boundary: None,
            headers: Vec::new(),
            timeout: None,
            cache_policy: None,
        }
    }
}

/// Builder for a single [`RequestDescriptor`].
#[must_use = "call build() to produce the request"]
pub struct RequestBuilder<'a> {
    serializer: &'a RequestSerializer,
    method: HttpMethod,
    url: String,
    query: Option<Params>,
    params: Option<Params>,
    body: Option<Bytes>,
    file: Option<PathBuf>,
    boundary: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    cache_policy: Option<CachePolicy>,
}

impl RequestBuilder<'_> {
    /// Parameters always appended to the URL query.
    pub fn query(mut self, params: impl Into<Params>) -> Self {
        self.query = Some(params.into());
        self
    }

    /// Parameters placed in the URL or the body depending on the method.
    pub fn params(mut self, params: impl Into<Params>) -> Self {
        self.params = Some(params.into());
        self
    }

    /// Optional variant of [`params`](Self::params).
    pub fn params_opt(mut self, params: Option<Params>) -> Self {
        self.params = params;
        self
    }

    /// A raw body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// A body streamed from a file.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// A multipart boundary token. Marks the request as an upload.
    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    /// Add a header for this request only.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the cache policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Build the descriptor.
    pub fn build(self) -> Result<RequestDescriptor> {
        let serializer = self.serializer;
        if self.url.trim().is_empty() {
            return Err(RequestSerializationError::BadUrl { url: self.url }.into());
        }

        // An explicit body or file leaves no room for params, so they move to the query.
        let body_given = self.body.is_some() || self.file.is_some();
        let mut in_uri = serializer.encodes_params_in_uri(self.method);
        if body_given && !in_uri {
            if self.params.is_some() {
                tracing::debug!(target: "courier::request", "Moving {} params to the query", self.method);
            }
            in_uri = true;
        }
        let mut query = Vec::new();
        for params in [Some(&self.query), in_uri.then_some(&self.params)]
            .into_iter()
            .flatten()
            .flatten()
        {
            if params.is_empty() {
                continue;
            }
            match encode(params, &serializer.encode_options) {
                Some(encoded) => query.push(encoded),
                None => {
                    return Err(RequestSerializationError::CannotEncodeUrl { url: self.url }.into());
                }
            }
        }

        let encoded = encode_url(&self.url, &query.join("&"))?;
        let url = Url::parse(&encoded).map_err(|e| {
            tracing::debug!(target: "courier::request", "Failed to parse '{}': {}", encoded, e);
            RequestSerializationError::BadUrl {
                url: self.url.clone(),
            }
        })?;

        let mut headers = serializer.headers.clone();
        if let Some((username, password)) = &serializer.credentials {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}")).map_err(|_| {
                RequestSerializationError::InvalidHeader {
                    name: AUTHORIZATION.to_string(),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.headers {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }

        // A boundary marks an upload, so its content type wins over any body default.
        if let Some(boundary) = &self.boundary
            && !headers.contains_key(CONTENT_TYPE)
        {
            let value = format!("multipart/form-data; boundary={boundary}");
            let (name, value) = header_pair(CONTENT_TYPE.as_str(), &value)?;
            headers.insert(name, value);
        }

        let body = if let Some(bytes) = self.body {
            if bytes.is_empty() {
                return Err(RequestSerializationError::CannotEncodeBody.into());
            }
            set_default_content_type(&mut headers, FORM_URLENCODED);
            RequestBody::Bytes(bytes)
        } else if let Some(params) = self.params.as_ref().filter(|_| !in_uri) {
            let (encoded, content_type) = match serializer.body_encoding {
                BodyEncoding::Form => (encode(params, &serializer.encode_options), FORM_URLENCODED),
                BodyEncoding::Json => (params.to_json(), APPLICATION_JSON),
            };
            let encoded = encoded.ok_or(RequestSerializationError::CannotEncodeBody)?;
            set_default_content_type(&mut headers, content_type);
            RequestBody::Params(encoded)
        } else if let Some(path) = self.file {
            RequestBody::File(path)
        } else {
            RequestBody::None
        };

        Ok(RequestDescriptor {
            url,
            method: self.method,
            headers,
            body,
            cache_policy: self.cache_policy.unwrap_or(serializer.cache_policy),
            timeout: self.timeout.unwrap_or(serializer.timeout),
            allows_metered_network: serializer.allows_metered_network,
        })
    }
}

fn set_default_content_type(headers: &mut HeaderMap, content_type: &'static str) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let invalid = || RequestSerializationError::InvalidHeader {
        name: name.to_string(),
    };
    let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
    let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
    Ok((header_name, header_value))
}

/// Decode then re-encode `raw` so existing escapes are not doubled, and
/// append `query` before any fragment.
fn encode_url(raw: &str, query: &str) -> Result<String> {
    let decoded = percent_decode_str(raw.trim()).decode_utf8().map_err(|_| {
        RequestSerializationError::CannotEncodeUrl {
            url: raw.to_string(),
        }
    })?;
    let encoded = utf8_percent_encode(&decoded, URL_UNSAFE).to_string();

    if query.is_empty() {
        return Ok(encoded);
    }

    let (base, fragment) = match encoded.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (encoded.as_str(), None),
    };
    let separator = match base.find('?') {
        None => "?",
        Some(_) if base.ends_with('?') || base.ends_with('&') => "",
        Some(_) => "&",
    };
    let mut out = format!("{base}{separator}{query}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    Ok(out)
}
