//! HTTP request and response types.
//!
//! [`RequestSerializer`] turns a URL, method and parameters into an
//! immutable [`RequestDescriptor`]. [`ResponseSerializer`] validates an
//! [`HttpResponse`] and decodes its body into a [`Decoded`] value.
//!
//! # Example
//!
//! ```ignore
//! use courier::http::{HttpMethod, RequestSerializer, ResponseSerializer};
//! use courier::params::Params;
//!
//! let serializer = RequestSerializer::new().basic_auth("demo", "secret");
//! let request = serializer
//!     .request(HttpMethod::Get, "https://api.example.com/users")
//!     .query(Params::new().insert("page", 2))
//!     .build()?;
//!
//! let parser = ResponseSerializer::json().acceptable_content_types(["application/json"]);
//! ```

mod method;
mod multipart;
mod request;
mod response;

pub use method::HttpMethod;
pub use multipart::MultipartFormData;
pub use request::{
    BodyEncoding, CachePolicy, RequestBody, RequestBuilder, RequestDescriptor, RequestSerializer,
};
pub use response::{
    CustomDecoder, Decoded, Decoding, HttpResponse, ResponseSerializer, XmlToken,
};
