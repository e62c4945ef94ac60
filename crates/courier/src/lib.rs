//! HTTP session runtime.
//!
//! Courier builds HTTP requests, runs them as tasks on a shared transport,
//! and hands each task's result to a completion handler:
//!
//! - **Parameters**: [`params`] encodes key/value pairs into query strings
//!   and form bodies. Array and object values are sent as JSON text.
//! - **Requests**: [`http::RequestSerializer`] turns a URL, method and
//!   parameters into an immutable [`http::RequestDescriptor`].
//! - **Responses**: [`http::ResponseSerializer`] validates status and content
//!   type, then decodes the body as bytes, JSON, text, XML tokens, a property
//!   list, or with a custom decoder.
//! - **Sessions**: [`session::Session`] tracks every live task, applies
//!   transport events to it in order, and runs handlers on a serial
//!   callback queue.
//! - **Downloads**: bodies can be staged and moved to a caller-chosen
//!   location, appended to a file with byte-range requests, or resumed from
//!   a token.
//!
//! # Example
//!
//! ```ignore
//! use courier::http::ResponseSerializer;
//! use courier::params::Params;
//! use courier::session::{Session, TaskHandlers};
//!
//! let session = Session::builder()
//!     .response_serializer(ResponseSerializer::json())
//!     .build()?;
//!
//! session.get(
//!     "https://api.example.com/users",
//!     Some(Params::new().insert("page", 2)),
//!     TaskHandlers::new()
//!         .on_download_progress(|p| println!("{:?}", p.snapshot().percent()))
//!         .on_completion(|result| match result {
//!             Ok(users) => println!("{:?}", users.as_json()),
//!             Err(e) => eprintln!("{}", e.debug_description()),
//!         }),
//! )?;
//! ```
//!
//! # Downloads
//!
//! ```ignore
//! use courier::http::HttpMethod;
//!
//! let request = session
//!     .request_serializer()
//!     .build("https://example.com/big.iso", HttpMethod::Get)?;
//!
//! // Continues from the file's current length.
//! let task = session.download_task_to_file(request, "big.iso", TaskHandlers::new())?;
//! task.resume();
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod params;
pub mod progress;
pub mod runtime;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::SessionConfig;
pub use error::{HttpError, Result};
pub use http::{Decoded, HttpMethod, RequestDescriptor, ResponseSerializer};
pub use params::Params;
pub use progress::{Progress, TransferProgress};
pub use session::{DownloadOptions, Session, Task, TaskHandlers};
pub use transport::{ReqwestTransport, TransportConfig};
