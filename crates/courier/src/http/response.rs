//! Response metadata and the serializer that validates and decodes bodies.

use std::any::Any;
use std::borrow::Cow;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Cause, DataParseError, ResponseParseError, Result, TransportError};

/// Metadata of a received HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: u16,
    url: Url,
    headers: HeaderMap,
    mime_type: Option<String>,
    text_encoding: Option<String>,
    expected_content_length: Option<u64>,
}

impl HttpResponse {
    /// Create response metadata from a status line and headers.
    pub fn new(status: u16, url: Url, headers: HeaderMap) -> Self {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<mime::Mime>().ok());
        let mime_type = content_type
            .as_ref()
            .map(|m| m.essence_str().to_string());
        let text_encoding = content_type
            .as_ref()
            .and_then(|m| m.get_param(mime::CHARSET))
            .map(|charset| charset.as_str().to_string());
        let expected_content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        Self {
            status,
            url,
            headers,
            mime_type,
            text_encoding,
            expected_content_length,
        }
    }

    /// Create from a reqwest response.
    pub(crate) fn from_reqwest(response: &reqwest::Response) -> Self {
        Self::new(
            response.status().as_u16(),
            response.url().clone(),
            response.headers().clone(),
        )
    }

    /// Get the HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Get the final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// The declared MIME type without parameters, lowercased.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// The declared `charset` parameter.
    pub fn text_encoding(&self) -> Option<&str> {
        self.text_encoding.as_deref()
    }

    /// The `Content-Length` header value.
    pub fn expected_content_length(&self) -> Option<u64> {
        self.expected_content_length
    }

    /// Complete length from a `Content-Range: bytes a-b/total` header.
    pub fn content_range_total(&self) -> Option<u64> {
        let value = self.headers.get(CONTENT_RANGE)?.to_str().ok()?;
        let (_, total) = value.trim().strip_prefix("bytes")?.rsplit_once('/')?;
        total.trim().parse().ok()
    }

    /// Check if the response indicates success (2xx status).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One token of a decoded XML document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlToken {
    /// An opening tag. Self-closing tags produce a start and an end token.
    StartElement {
        /// Element name.
        name: String,
        /// Attributes in document order.
        attributes: Vec<(String, String)>,
    },
    /// A closing tag.
    EndElement {
        /// Element name.
        name: String,
    },
    /// Unescaped text content.
    Text(String),
    /// A CDATA section.
    CData(String),
}

/// A decoded response body.
#[derive(Clone, Debug)]
pub enum Decoded {
    /// The raw body.
    Bytes(Bytes),
    /// A JSON value.
    Json(serde_json::Value),
    /// Decoded text.
    Text(String),
    /// An XML token stream.
    Xml(Vec<XmlToken>),
    /// A property list.
    PropertyList(plist::Value),
    /// A file on disk holding the body.
    File(PathBuf),
    /// The value produced by a custom decoder.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl Decoded {
    /// Get the raw body.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Get the JSON value.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Get the decoded text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Get the file location.
    pub fn as_file(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            _ => None,
        }
    }

    /// Downcast a custom decoder's value.
    pub fn downcast_custom<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Self::Custom(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

/// How response bodies are decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decoding {
    /// Return the body bytes unchanged.
    #[default]
    Raw,
    /// Parse JSON.
    Json,
    /// Decode text.
    Text,
    /// Build an XML token stream.
    Xml,
    /// Parse a property list.
    PropertyList,
}

/// A caller-supplied body decoder. Returning `None` means the body could not
/// be decoded.
pub type CustomDecoder = Arc<dyn Fn(&HttpResponse, &Bytes) -> Option<Decoded> + Send + Sync>;

/// Validates responses and decodes their bodies.
#[derive(Clone)]
pub struct ResponseSerializer {
    acceptable_status_codes: Vec<RangeInclusive<u16>>,
    acceptable_content_types: Vec<String>,
    decoding: Decoding,
    string_encoding: Option<String>,
    allow_json_fragments: bool,
    custom_decoder: Option<CustomDecoder>,
}

impl Default for ResponseSerializer {
    fn default() -> Self {
        Self {
            acceptable_status_codes: vec![200..=299],
            acceptable_content_types: Vec::new(),
            decoding: Decoding::Raw,
            string_encoding: None,
            allow_json_fragments: false,
            custom_decoder: None,
        }
    }
}

impl std::fmt::Debug for ResponseSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSerializer")
            .field("acceptable_status_codes", &self.acceptable_status_codes)
            .field("acceptable_content_types", &self.acceptable_content_types)
            .field("decoding", &self.decoding)
            .field("string_encoding", &self.string_encoding)
            .field("allow_json_fragments", &self.allow_json_fragments)
            .field("custom_decoder", &self.custom_decoder.is_some())
            .finish()
    }
}

impl ResponseSerializer {
    /// Create a serializer that accepts 2xx responses and returns raw bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a serializer that decodes JSON.
    pub fn json() -> Self {
        Self::default().decoding(Decoding::Json)
    }

    /// Replace the acceptable status code ranges.
    pub fn acceptable_status_codes(
        mut self,
        ranges: impl IntoIterator<Item = RangeInclusive<u16>>,
    ) -> Self {
        self.acceptable_status_codes = ranges.into_iter().collect();
        self
    }

    /// Require one of these content types.
    pub fn acceptable_content_types<S: Into<String>>(
        mut self,
        types: impl IntoIterator<Item = S>,
    ) -> Self {
        self.acceptable_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the body decoding.
    pub fn decoding(mut self, decoding: Decoding) -> Self {
        self.decoding = decoding;
        self
    }

    /// Decode text with a fixed encoding label instead of the declared charset.
    pub fn string_encoding(mut self, label: Option<String>) -> Self {
        self.string_encoding = label;
        self
    }

    /// Accept JSON documents whose top level is not an object or array.
    pub fn allow_json_fragments(mut self, allow: bool) -> Self {
        self.allow_json_fragments = allow;
        self
    }

    /// Decode bodies with a custom function.
    pub fn custom_decoder<F>(mut self, decoder: F) -> Self
    where
        F: Fn(&HttpResponse, &Bytes) -> Option<Decoded> + Send + Sync + 'static,
    {
        self.custom_decoder = Some(Arc::new(decoder));
        self
    }

    /// Check whether `status` is in the acceptable set.
    pub fn accepts_status(&self, status: u16) -> bool {
        self.acceptable_status_codes
            .iter()
            .any(|range| range.contains(&status))
    }

    /// Validate the response without looking at the body.
    pub fn validate<'r>(
        &self,
        response: Option<&'r HttpResponse>,
        error: Option<&TransportError>,
    ) -> Result<&'r HttpResponse> {
        if let Some(error) = error {
            return Err(ResponseParseError::UnderlyingError(Cause::from(error.clone())).into());
        }
        let Some(response) = response else {
            return Err(ResponseParseError::CannotParseResponse.into());
        };
        if !self.accepts_status(response.status()) {
            return Err(ResponseParseError::UnacceptedStatusCode(response.status()).into());
        }

        if !self.acceptable_content_types.is_empty() {
            let Some(mime_type) = response.mime_type() else {
                return Err(ResponseParseError::MissingMimeType.into());
            };
            let accepted = self
                .acceptable_content_types
                .iter()
                .any(|expected| mime_type.contains(canonical_mime(expected).as_ref()));
            if !accepted {
                return Err(ResponseParseError::UnacceptedContentType {
                    mime_type: mime_type.to_string(),
                    acceptable: self.acceptable_content_types.clone(),
                }
                .into());
            }
        }
        Ok(response)
    }

    /// Validate the response and decode its body.
    pub fn parse(
        &self,
        response: Option<&HttpResponse>,
        body: Option<&Bytes>,
        error: Option<&TransportError>,
    ) -> Result<Decoded> {
        let response = self.validate(response, error)?;

        if self.decoding == Decoding::Raw && self.custom_decoder.is_none() {
            return Ok(Decoded::Bytes(body.cloned().unwrap_or_default()));
        }

        let body = match body {
            Some(body) if !is_zero_byte(body) => body,
            _ => return Err(DataParseError::ZeroByteData.into()),
        };

        if let Some(decoder) = &self.custom_decoder {
            return decoder(response, body).ok_or_else(|| DataParseError::CannotDecodeData.into());
        }

        match self.decoding {
            Decoding::Raw => Ok(Decoded::Bytes(body.clone())),
            Decoding::Json => self.decode_json(body),
            Decoding::Text => self.decode_text(response, body).map(Decoded::Text),
            Decoding::Xml => decode_xml(body).map(Decoded::Xml),
            Decoding::PropertyList => plist::Value::from_reader(std::io::Cursor::new(body.as_ref()))
                .map(Decoded::PropertyList)
                .map_err(|e| DataParseError::UnderlyingError(Cause::new(e)).into()),
        }
    }

    fn decode_json(&self, body: &Bytes) -> Result<Decoded> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| DataParseError::UnderlyingError(Cause::new(e)))?;
        if !self.allow_json_fragments && !(value.is_object() || value.is_array()) {
            return Err(DataParseError::CannotDecodeData.into());
        }
        Ok(Decoded::Json(value))
    }

    fn decode_text(&self, response: &HttpResponse, body: &Bytes) -> Result<String> {
        let label = self
            .string_encoding
            .as_deref()
            .or(response.text_encoding())
            .unwrap_or("utf-8");
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or(DataParseError::CannotDecodeData)?;
        encoding
            .decode_without_bom_handling_and_without_replacement(body)
            .map(Cow::into_owned)
            .ok_or_else(|| DataParseError::CannotDecodeData.into())
    }
}

fn is_zero_byte(body: &Bytes) -> bool {
    body.is_empty() || body.as_ref() == b" "
}

fn canonical_mime(expected: &str) -> Cow<'_, str> {
    match expected.parse::<mime::Mime>() {
        Ok(parsed) => Cow::Owned(parsed.essence_str().to_string()),
        Err(_) => Cow::Owned(expected.trim().to_ascii_lowercase()),
    }
}

fn decode_xml(body: &Bytes) -> Result<Vec<XmlToken>> {
    let mut reader = Reader::from_reader(body.as_ref());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut tokens = Vec::new();
    let xml_error = |e: quick_xml::Error| DataParseError::UnderlyingError(Cause::new(e));

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Eof => break,
            Event::Start(start) => tokens.push(start_token(&start)?),
            Event::Empty(empty) => {
                let name = element_name(&empty);
                tokens.push(start_token(&empty)?);
                tokens.push(XmlToken::EndElement { name });
            }
            Event::End(end) => tokens.push(XmlToken::EndElement {
                name: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
            }),
            Event::Text(text) => {
                let content = text.unescape().map_err(xml_error)?;
                tokens.push(XmlToken::Text(content.into_owned()));
            }
            Event::CData(cdata) => {
                tokens.push(XmlToken::CData(String::from_utf8_lossy(&cdata).into_owned()));
            }
            _ => {}
        }
    }

    if tokens.is_empty() {
        return Err(DataParseError::CannotDecodeData.into());
    }
    Ok(tokens)
}

fn element_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn start_token(start: &BytesStart<'_>) -> Result<XmlToken> {
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| DataParseError::UnderlyingError(Cause::new(e)))?;
        attributes.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        ));
    }
    Ok(XmlToken::StartElement {
        name: element_name(start),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use http::HeaderValue;

    fn response(status: u16, content_type: Option<&str>) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        HttpResponse::new(status, Url::parse("https://api.test/x").unwrap(), headers)
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=iso-8859-1"),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("500"));
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 1000-1499/1500"));
        let response = HttpResponse::new(206, Url::parse("https://api.test/f").unwrap(), headers);

        assert_eq!(response.mime_type(), Some("text/html"));
        assert_eq!(response.text_encoding(), Some("iso-8859-1"));
        assert_eq!(response.expected_content_length(), Some(500));
        assert_eq!(response.content_range_total(), Some(1500));
        assert!(response.is_success());
    }

    #[test]
    fn test_transport_error_wins() {
        let err = ResponseSerializer::new()
            .parse(
                Some(&response(200, None)),
                Some(&Bytes::from_static(b"ok")),
                Some(&TransportError::Cancelled),
            )
            .unwrap_err();
        assert_eq!(err.code(), 2001);
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_missing_response() {
        let err = ResponseSerializer::new().parse(None, None, None).unwrap_err();
        assert!(matches!(
            err,
            HttpError::ResponseParse(ResponseParseError::CannotParseResponse)
        ));
    }

    #[test]
    fn test_unaccepted_status_skips_decoding() {
        let serializer = ResponseSerializer::new().custom_decoder(|_, _| {
            panic!("decoder must not run for rejected statuses");
        });
        let err = serializer
            .parse(Some(&response(404, None)), Some(&Bytes::from_static(b"{}")), None)
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn test_content_type_validation() {
        let serializer = ResponseSerializer::new().acceptable_content_types(["application/json"]);
        let body = Bytes::from_static(b"{}");

        let err = serializer
            .parse(Some(&response(200, None)), Some(&body), None)
            .unwrap_err();
        assert_eq!(err.code(), 2004);

        let err = serializer
            .parse(Some(&response(200, Some("text/html"))), Some(&body), None)
            .unwrap_err();
        assert_eq!(err.code(), 2005);

        let ok = serializer.parse(
            Some(&response(200, Some("application/json; charset=utf-8"))),
            Some(&body),
            None,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_raw_passthrough_allows_empty_body() {
        let decoded = ResponseSerializer::new()
            .parse(Some(&response(204, None)), None, None)
            .unwrap();
        assert_eq!(decoded.as_bytes().map(Bytes::len), Some(0));
    }

    #[test]
    fn test_zero_byte_data() {
        let serializer = ResponseSerializer::json();
        for body in [Bytes::new(), Bytes::from_static(b" ")] {
            let err = serializer
                .parse(Some(&response(200, None)), Some(&body), None)
                .unwrap_err();
            assert_eq!(err.code(), 3001);
        }
    }

    #[test]
    fn test_json_decoding() {
        let serializer = ResponseSerializer::json();
        let decoded = serializer
            .parse(
                Some(&response(200, Some("application/json"))),
                Some(&Bytes::from_static(br#"{"name":"widget"}"#)),
                None,
            )
            .unwrap();
        assert_eq!(decoded.as_json().unwrap()["name"], "widget");

        let err = serializer
            .parse(Some(&response(200, None)), Some(&Bytes::from_static(b"{oops")), None)
            .unwrap_err();
        assert_eq!(err.code(), 3003);
        assert!(err.underlying_cause().is_some());
    }

    #[test]
    fn test_json_fragments() {
        let body = Bytes::from_static(b"42");
        let err = ResponseSerializer::json()
            .parse(Some(&response(200, None)), Some(&body), None)
            .unwrap_err();
        assert_eq!(err.code(), 3002);

        let decoded = ResponseSerializer::json()
            .allow_json_fragments(true)
            .parse(Some(&response(200, None)), Some(&body), None)
            .unwrap();
        assert_eq!(decoded.as_json(), Some(&serde_json::json!(42)));
    }

    #[test]
    fn test_text_uses_declared_then_fixed_encoding() {
        let latin1 = Bytes::from_static(b"caf\xe9");
        let serializer = ResponseSerializer::new().decoding(Decoding::Text);

        let decoded = serializer
            .parse(
                Some(&response(200, Some("text/plain; charset=iso-8859-1"))),
                Some(&latin1),
                None,
            )
            .unwrap();
        assert_eq!(decoded.as_text(), Some("café"));

        let err = serializer
            .parse(Some(&response(200, Some("text/plain"))), Some(&latin1), None)
            .unwrap_err();
        assert_eq!(err.code(), 3002);

        let decoded = serializer
            .string_encoding(Some("windows-1252".to_string()))
            .parse(Some(&response(200, Some("text/plain"))), Some(&latin1), None)
            .unwrap();
        assert_eq!(decoded.as_text(), Some("café"));
    }

    #[test]
    fn test_xml_token_stream() {
        let body = Bytes::from_static(br#"<feed lang="en"><item id="1">A &amp; B</item><empty/></feed>"#);
        let decoded = ResponseSerializer::new()
            .decoding(Decoding::Xml)
            .parse(Some(&response(200, Some("application/xml"))), Some(&body), None)
            .unwrap();
        let Decoded::Xml(tokens) = decoded else {
            panic!("expected XML tokens");
        };
        assert_eq!(
            tokens,
            vec![
                XmlToken::StartElement {
                    name: "feed".into(),
                    attributes: vec![("lang".into(), "en".into())],
                },
                XmlToken::StartElement {
                    name: "item".into(),
                    attributes: vec![("id".into(), "1".into())],
                },
                XmlToken::Text("A & B".into()),
                XmlToken::EndElement { name: "item".into() },
                XmlToken::StartElement {
                    name: "empty".into(),
                    attributes: vec![],
                },
                XmlToken::EndElement { name: "empty".into() },
                XmlToken::EndElement { name: "feed".into() },
            ]
        );
    }

    #[test]
    fn test_property_list() {
        let body = Bytes::from_static(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>count</key><integer>3</integer></dict></plist>"#,
        );
        let decoded = ResponseSerializer::new()
            .decoding(Decoding::PropertyList)
            .parse(Some(&response(200, None)), Some(&body), None)
            .unwrap();
        let Decoded::PropertyList(value) = decoded else {
            panic!("expected a property list");
        };
        let count = value
            .as_dictionary()
            .and_then(|dict| dict.get("count"))
            .and_then(|v| v.as_signed_integer());
        assert_eq!(count, Some(3));
    }

    #[test]
    fn test_custom_decoder() {
        let serializer = ResponseSerializer::new().custom_decoder(|_, body| {
            if body.starts_with(b"v=") {
                Some(Decoded::Custom(Arc::new(body.len())))
            } else {
                None
            }
        });
        let decoded = serializer
            .parse(Some(&response(200, None)), Some(&Bytes::from_static(b"v=12")), None)
            .unwrap();
        assert_eq!(decoded.downcast_custom::<usize>(), Some(&4));

        let err = serializer
            .parse(Some(&response(200, None)), Some(&Bytes::from_static(b"nope")), None)
            .unwrap_err();
        assert_eq!(err.code(), 3002);
    }
}
