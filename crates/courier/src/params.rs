//! Parameter encoding for query strings and form bodies.
//!
//! A [`Params`] bag is either a pre-built raw string or an ordered list of
//! key/value pairs whose values are JSON values. [`encode`] turns pairs into a
//! `field=value&field=value` string, percent-encoding fields, values, both
//! or neither as selected by [`EncodeOptions`]. Arrays and objects are sent
//! as their JSON text.
//!
//! A raw string is already formatted by the caller, so its `&` and `=` are
//! kept and only bytes that cannot appear in a query are escaped.
//!
//! ```ignore
//! use courier::params::{encode, EncodeOptions, Params};
//!
//! let params = Params::new().insert("q", "rust lang").insert("page", 2);
//! assert_eq!(encode(&params, &EncodeOptions::default()).as_deref(), Some("q=rust%20lang&page=2"));
//! ```

use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Characters left unencoded inside a query component.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b'?');

/// Bytes escaped in a caller-formatted raw string. `%` is kept so existing
/// escapes survive.
const RAW_QUERY: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Maximum number of bytes encoded in one pass.
const BATCH_SIZE: usize = 50;

/// Delimiters that are encoded even in segments left raw.
pub const DEFAULT_ALWAYS_ENCODE: &str = "&=#";

/// Which parts of each pair receive percent-encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamEncoding {
    /// Encode both fields and values.
    #[default]
    All,
    /// Encode fields only.
    FieldOnly,
    /// Encode values only.
    ValueOnly,
    /// Encode neither; only the always-encode delimiters are escaped.
    None,
}

impl ParamEncoding {
    fn encodes_field(self) -> bool {
        matches!(self, Self::All | Self::FieldOnly)
    }

    fn encodes_value(self) -> bool {
        matches!(self, Self::All | Self::ValueOnly)
    }
}

/// Options for [`encode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Which segments are percent-encoded.
    pub parts: ParamEncoding,
    /// ASCII delimiters escaped in every field and value, encoded or not.
    pub always_encode: String,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            parts: ParamEncoding::All,
            always_encode: DEFAULT_ALWAYS_ENCODE.to_string(),
        }
    }
}

impl EncodeOptions {
    /// Create options with the given part selection and the default delimiters.
    pub fn new(parts: ParamEncoding) -> Self {
        Self {
            parts,
            ..Self::default()
        }
    }

    /// Replace the always-encode delimiter set.
    pub fn always_encode(mut self, delimiters: impl Into<String>) -> Self {
        self.always_encode = delimiters.into();
        self
    }
}

/// A parameter bag.
#[derive(Clone, Debug, PartialEq)]
pub enum Params {
    /// A raw, caller-formatted string.
    Raw(String),
    /// Ordered key/value pairs.
    Pairs(Vec<(String, Value)>),
}

impl Default for Params {
    fn default() -> Self {
        Self::Pairs(Vec::new())
    }
}

impl Params {
    /// Create an empty pair list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair. A raw bag is converted to an empty pair list first.
    pub fn insert(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        match &mut self {
            Self::Pairs(pairs) => pairs.push((field.into(), value.into())),
            Self::Raw(_) => self = Self::Pairs(vec![(field.into(), value.into())]),
        }
        self
    }

    /// Check whether the bag has nothing to encode.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Raw(raw) => raw.is_empty(),
            Self::Pairs(pairs) => pairs.is_empty(),
        }
    }

    /// Render the bag as a JSON document.
    ///
    /// Pairs become an object; a raw string is returned as-is when it already
    /// holds JSON text.
    pub fn to_json(&self) -> Option<String> {
        match self {
            Self::Raw(raw) if raw.is_empty() => None,
            Self::Raw(raw) => Some(raw.clone()),
            Self::Pairs(pairs) if pairs.is_empty() => None,
            Self::Pairs(pairs) => {
                let object: serde_json::Map<String, Value> = pairs.iter().cloned().collect();
                serde_json::to_string(&Value::Object(object)).ok()
            }
        }
    }
}

impl From<&str> for Params {
    fn from(raw: &str) -> Self {
        Self::Raw(raw.to_string())
    }
}

impl From<String> for Params {
    fn from(raw: String) -> Self {
        Self::Raw(raw)
    }
}

impl From<Vec<(String, Value)>> for Params {
    fn from(pairs: Vec<(String, Value)>) -> Self {
        Self::Pairs(pairs)
    }
}

/// Objects become pairs in key order, strings become raw bags, and any other
/// value becomes an empty bag.
impl From<Value> for Params {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Pairs(map.into_iter().collect()),
            Value::String(raw) => Self::Raw(raw),
            _ => Self::default(),
        }
    }
}

/// Encode a parameter bag.
///
/// Returns `None` when the bag is empty or nothing in it could be encoded.
/// Raw strings pass through with only query-unsafe bytes escaped.
pub fn encode(params: &Params, options: &EncodeOptions) -> Option<String> {
    let encoded = match params {
        Params::Raw(raw) => batches(raw, BATCH_SIZE)
            .flat_map(|batch| utf8_percent_encode(batch, RAW_QUERY))
            .collect::<String>(),
        Params::Pairs(pairs) => {
            let encode_set = encode_set(&options.always_encode);
            pairs
                .iter()
                .filter_map(|(field, value)| encode_pair(field, value, options, &encode_set))
                .collect::<Vec<_>>()
                .join("&")
        }
    };

    if encoded.is_empty() {
        None
    } else {
        Some(encoded)
    }
}

/// The query-component set widened by the always-encode delimiters.
fn encode_set(always_encode: &str) -> AsciiSet {
    always_encode
        .bytes()
        .filter(u8::is_ascii)
        .fold(QUERY_COMPONENT.add(b'%'), |set, byte| set.add(byte))
}

fn encode_pair(
    field: &str,
    value: &Value,
    options: &EncodeOptions,
    encode_set: &AsciiSet,
) -> Option<String> {
    if field.is_empty() {
        tracing::trace!(target: "courier::request", "Skipping parameter with empty field name");
        return None;
    }
    let field = encode_segment(field, options.parts.encodes_field(), options, encode_set);
    match value_text(value) {
        Some(text) => {
            let value = encode_segment(&text, options.parts.encodes_value(), options, encode_set);
            Some(format!("{field}={value}"))
        }
        None => Some(field),
    }
}

/// Text for a parameter value. `None` means the field is emitted alone.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(if *flag { "1" } else { "0" }.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) => Some(text.clone()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn encode_segment(
    segment: &str,
    percent_encode: bool,
    options: &EncodeOptions,
    encode_set: &AsciiSet,
) -> String {
    let mut out = String::with_capacity(segment.len());
    for batch in batches(segment, BATCH_SIZE) {
        if percent_encode {
            out.extend(utf8_percent_encode(batch, encode_set));
        } else {
            escape_reserved(batch, &options.always_encode, &mut out);
        }
    }
    out
}

/// Escape control characters and the always-encode delimiters, leaving
/// everything else untouched.
fn escape_reserved(batch: &str, always_encode: &str, out: &mut String) {
    for ch in batch.chars() {
        if ch.is_ascii() && (ch.is_ascii_control() || always_encode.contains(ch)) {
            out.push_str(percent_encoding::percent_encode_byte(ch as u8));
        } else {
            out.push(ch);
        }
    }
}

/// Split `text` into slices of at most `size` bytes without splitting a
/// character.
fn batches(text: &str, size: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        rest = tail;
        Some(head)
    })
}
