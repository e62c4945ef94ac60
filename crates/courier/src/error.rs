//! Error types for the session runtime.
//!
//! Every failure that reaches a caller is an [`HttpError`]. Lower-level
//! errors (I/O, decoders, the transport) never escape on their own; they are
//! wrapped as a [`Cause`] inside the variant that describes what was being
//! attempted when they happened.
//!
//! Each reason carries a stable numeric code, grouped by domain:
//!
//! | Domain               | Codes |
//! |----------------------|-------|
//! | request serialization | 1000s |
//! | response parsing      | 2000s |
//! | data parsing          | 3000s |
//! | upload                | 4000s |
//! | download              | 5000s |
//! | TLS challenge         | 6000s |
//! | configuration         | 7000s |

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A shared, cloneable wrapper around a lower-level error.
#[derive(Clone)]
pub struct Cause(Arc<dyn std::error::Error + Send + Sync>);

impl Cause {
    /// Wrap an error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Get the wrapped error.
    pub fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.0.as_ref()
    }

    /// Attempt to downcast the wrapped error to a concrete type.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Cause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<TransportError> for Cause {
    fn from(err: TransportError) -> Self {
        Self::new(err)
    }
}

/// Errors reported by the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The task was cancelled.
    #[error("task was cancelled")]
    Cancelled,
    /// The request timed out.
    #[error("request timed out")]
    TimedOut,
    /// The connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),
    /// The server trust challenge was rejected.
    #[error("server trust for '{host}' was rejected")]
    ServerTrustRejected {
        /// The challenged host.
        host: String,
    },
    /// Local I/O failed while sending or staging a body.
    #[error("I/O error: {0}")]
    Io(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimedOut
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Reasons a request descriptor could not be built.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestSerializationError {
    /// The URL is empty or could not be parsed.
    #[error("bad URL '{url}'")]
    BadUrl {
        /// The offending URL string.
        url: String,
    },
    /// The URL or its query parameters could not be percent-encoded.
    #[error("cannot encode URL '{url}'")]
    CannotEncodeUrl {
        /// The offending URL string.
        url: String,
    },
    /// The request body is empty or could not be encoded.
    #[error("cannot encode request body")]
    CannotEncodeBody,
    /// A header name or value is not valid HTTP.
    #[error("invalid header '{name}'")]
    InvalidHeader {
        /// The header name as supplied.
        name: String,
    },
}

/// Reasons a response failed validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResponseParseError {
    /// The transport reported an error before a response could be validated.
    #[error("underlying error: {0}")]
    UnderlyingError(Cause),
    /// No HTTP response was available.
    #[error("cannot parse response")]
    CannotParseResponse,
    /// The status code is outside the acceptable set.
    #[error("unaccepted status code {0}")]
    UnacceptedStatusCode(u16),
    /// Content types were expected but the response declared none.
    #[error("response has no MIME type")]
    MissingMimeType,
    /// The declared content type matches none of the expected types.
    #[error("unaccepted content type '{mime_type}' (expected one of {acceptable:?})")]
    UnacceptedContentType {
        /// The declared MIME type.
        mime_type: String,
        /// The configured acceptable types.
        acceptable: Vec<String>,
    },
}

/// Reasons a response body could not be decoded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DataParseError {
    /// The body is empty or a single space.
    #[error("zero byte data")]
    ZeroByteData,
    /// The decoder produced nothing.
    #[error("cannot decode data")]
    CannotDecodeData,
    /// The decoder failed.
    #[error("decoder error: {0}")]
    UnderlyingError(Cause),
}

/// Reasons an upload could not proceed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// The file to upload does not exist.
    #[error("upload file '{}' not found", path.display())]
    FileNotFound {
        /// The missing file.
        path: PathBuf,
    },
    /// The file to upload could not be read.
    #[error("cannot read upload file '{}': {cause}", path.display())]
    CannotReadFile {
        /// The unreadable file.
        path: PathBuf,
        /// The I/O error.
        cause: Cause,
    },
}

/// Reasons a download could not be written to its destination.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    /// The target file could not be opened or written, or the server refused
    /// to continue a partial file.
    #[error("cannot write to '{}'", path.display())]
    CannotWriteToFile {
        /// The target file.
        path: PathBuf,
        /// The I/O error, if any.
        cause: Option<Cause>,
    },
    /// A missing parent directory could not be created.
    #[error("cannot create directory '{}': {cause}", path.display())]
    CannotCreateDirectory {
        /// The directory.
        path: PathBuf,
        /// The I/O error.
        cause: Cause,
    },
    /// The staged file could not be moved into place.
    #[error("cannot move '{}' to '{}': {cause}", from.display(), to.display())]
    CannotMoveFile {
        /// The staged file.
        from: PathBuf,
        /// The destination.
        to: PathBuf,
        /// The I/O error.
        cause: Cause,
    },
    /// An existing file could not be removed.
    #[error("cannot remove '{}': {cause}", path.display())]
    CannotRemoveFile {
        /// The file.
        path: PathBuf,
        /// The I/O error.
        cause: Cause,
    },
    /// The destination is not a usable local file path.
    #[error("invalid destination '{}'", path.display())]
    InvalidDestination {
        /// The rejected destination.
        path: PathBuf,
    },
    /// The caller did not supply a destination.
    #[error("missing download destination")]
    MissingDestination,
    /// A resume token could not be read.
    #[error("invalid resume data")]
    InvalidResumeData(Option<Cause>),
}

/// Reasons a TLS trust challenge failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TlsChallengeError {
    /// The server trust evaluation for `host` failed.
    #[error("server trust evaluation failed for '{host}'")]
    UnderlyingError {
        /// The challenged host.
        host: String,
        /// The terminal transport error reported for the task, if any.
        cause: Option<Cause>,
    },
    /// Certificates or keys in the TLS configuration could not be used.
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
}

/// The closed set of errors surfaced by the session runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// The request could not be built.
    #[error("request serialization failed: {0}")]
    RequestSerialization(RequestSerializationError),
    /// The response failed validation.
    #[error("response validation failed: {0}")]
    ResponseParse(ResponseParseError),
    /// The response body could not be decoded.
    #[error("data parsing failed: {0}")]
    DataParse(DataParseError),
    /// The upload could not proceed.
    #[error("upload failed: {0}")]
    Upload(UploadError),
    /// The download could not be written.
    #[error("download failed: {0}")]
    Download(DownloadError),
    /// The TLS trust challenge failed.
    #[error("TLS challenge failed: {0}")]
    TlsChallenge(TlsChallengeError),
    /// A configuration file could not be read or parsed.
    #[error("invalid configuration{}: {cause}", path.as_ref().map(|p| format!(" '{}'", p.display())).unwrap_or_default())]
    Config {
        /// The file, when loaded from disk.
        path: Option<PathBuf>,
        /// The I/O or parse error.
        cause: Cause,
    },
    /// An application-defined error.
    #[error("{message} ({code})")]
    Custom {
        /// Application code.
        code: i64,
        /// Short message.
        message: String,
    },
}

impl HttpError {
    /// Create an application-defined error.
    pub fn custom(code: i64, message: impl Into<String>) -> Self {
        Self::Custom {
            code,
            message: message.into(),
        }
    }

    /// Stable numeric code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::RequestSerialization(reason) => match reason {
                RequestSerializationError::BadUrl { .. } => 1001,
                RequestSerializationError::CannotEncodeUrl { .. } => 1002,
                RequestSerializationError::CannotEncodeBody => 1003,
                RequestSerializationError::InvalidHeader { .. } => 1004,
            },
            Self::ResponseParse(reason) => match reason {
                ResponseParseError::UnderlyingError(_) => 2001,
                ResponseParseError::CannotParseResponse => 2002,
                ResponseParseError::UnacceptedStatusCode(_) => 2003,
                ResponseParseError::MissingMimeType => 2004,
                ResponseParseError::UnacceptedContentType { .. } => 2005,
            },
            Self::DataParse(reason) => match reason {
                DataParseError::ZeroByteData => 3001,
                DataParseError::CannotDecodeData => 3002,
                DataParseError::UnderlyingError(_) => 3003,
            },
            Self::Upload(reason) => match reason {
                UploadError::FileNotFound { .. } => 4001,
                UploadError::CannotReadFile { .. } => 4002,
            },
            Self::Download(reason) => match reason {
                DownloadError::CannotWriteToFile { .. } => 5001,
                DownloadError::CannotCreateDirectory { .. } => 5002,
                DownloadError::CannotMoveFile { .. } => 5003,
                DownloadError::CannotRemoveFile { .. } => 5004,
                DownloadError::InvalidDestination { .. } => 5005,
                DownloadError::MissingDestination => 5006,
                DownloadError::InvalidResumeData(_) => 5007,
            },
            Self::TlsChallenge(reason) => match reason {
                TlsChallengeError::UnderlyingError { .. } => 6001,
                TlsChallengeError::InvalidConfiguration(_) => 6002,
            },
            Self::Config { .. } => 7001,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Short user-facing phrase. Paths, hosts and status codes are left to
    /// [`debug_description`](Self::debug_description).
    pub fn message(&self) -> String {
        let phrase = match self {
            Self::RequestSerialization(reason) => match reason {
                RequestSerializationError::BadUrl { .. } => "The URL is not valid.",
                RequestSerializationError::CannotEncodeUrl { .. } => "The URL could not be encoded.",
                RequestSerializationError::CannotEncodeBody => "The request body could not be encoded.",
                RequestSerializationError::InvalidHeader { .. } => "A request header is not valid.",
            },
            Self::ResponseParse(reason) => match reason {
                ResponseParseError::UnderlyingError(_) => "The request could not be completed.",
                ResponseParseError::CannotParseResponse => "The server response could not be read.",
                ResponseParseError::UnacceptedStatusCode(_) => "The server returned an error.",
                ResponseParseError::MissingMimeType => "The server response has no content type.",
                ResponseParseError::UnacceptedContentType { .. } => {
                    "The server response has an unexpected content type."
                }
            },
            Self::DataParse(reason) => match reason {
                DataParseError::ZeroByteData => "The server returned no data.",
                DataParseError::CannotDecodeData | DataParseError::UnderlyingError(_) => {
                    "The server data could not be read."
                }
            },
            Self::Upload(reason) => match reason {
                UploadError::FileNotFound { .. } => "The file to upload was not found.",
                UploadError::CannotReadFile { .. } => "The file to upload could not be read.",
            },
            Self::Download(reason) => match reason {
                DownloadError::CannotWriteToFile { .. } => "The download could not be saved.",
                DownloadError::CannotCreateDirectory { .. } => "The download folder could not be created.",
                DownloadError::CannotMoveFile { .. } => "The download could not be moved into place.",
                DownloadError::CannotRemoveFile { .. } => "An existing file could not be replaced.",
                DownloadError::InvalidDestination { .. } => "The download destination is not valid.",
                DownloadError::MissingDestination => "No download destination was given.",
                DownloadError::InvalidResumeData(_) => "The download cannot be resumed.",
            },
            Self::TlsChallenge(reason) => match reason {
                TlsChallengeError::UnderlyingError { .. } => "The server could not be trusted.",
                TlsChallengeError::InvalidConfiguration(_) => "The secure connection settings are not valid.",
            },
            Self::Config { .. } => "The session configuration is not valid.",
            Self::Custom { message, .. } => return message.clone(),
        };
        phrase.to_string()
    }

    /// Detailed description for logs, including paths, hosts and status codes.
    pub fn debug_description(&self) -> String {
        match self.underlying_cause() {
            Some(cause) => format!("[{}] {} (caused by: {cause:?})", self.code(), self),
            None => format!("[{}] {}", self.code(), self),
        }
    }

    /// The wrapped lower-level error, if any.
    pub fn underlying_cause(&self) -> Option<&Cause> {
        match self {
            Self::ResponseParse(ResponseParseError::UnderlyingError(cause))
            | Self::DataParse(DataParseError::UnderlyingError(cause))
            | Self::Upload(UploadError::CannotReadFile { cause, .. })
            | Self::Download(DownloadError::CannotCreateDirectory { cause, .. })
            | Self::Download(DownloadError::CannotMoveFile { cause, .. })
            | Self::Download(DownloadError::CannotRemoveFile { cause, .. })
            | Self::Config { cause, .. } => Some(cause),
            Self::Download(DownloadError::CannotWriteToFile { cause, .. })
            | Self::Download(DownloadError::InvalidResumeData(cause))
            | Self::TlsChallenge(TlsChallengeError::UnderlyingError { cause, .. }) => {
                cause.as_ref()
            }
            _ => None,
        }
    }

    /// Check whether this error reports a cancelled task.
    pub fn is_cancelled(&self) -> bool {
        self.underlying_cause()
            .and_then(|cause| cause.downcast_ref::<TransportError>())
            .is_some_and(|err| *err == TransportError::Cancelled)
    }

    /// Check whether the request could not be built.
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Self::RequestSerialization(_))
    }

    /// Check whether the response failed validation or decoding.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::ResponseParse(_) | Self::DataParse(_))
    }

    /// Get the status code carried by an unaccepted-status error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ResponseParse(ResponseParseError::UnacceptedStatusCode(code)) => Some(*code),
            _ => None,
        }
    }
}

impl From<RequestSerializationError> for HttpError {
    fn from(reason: RequestSerializationError) -> Self {
        Self::RequestSerialization(reason)
    }
}

impl From<ResponseParseError> for HttpError {
    fn from(reason: ResponseParseError) -> Self {
        Self::ResponseParse(reason)
    }
}

impl From<DataParseError> for HttpError {
    fn from(reason: DataParseError) -> Self {
        Self::DataParse(reason)
    }
}

impl From<UploadError> for HttpError {
    fn from(reason: UploadError) -> Self {
        Self::Upload(reason)
    }
}

impl From<DownloadError> for HttpError {
    fn from(reason: DownloadError) -> Self {
        Self::Download(reason)
    }
}

impl From<TlsChallengeError> for HttpError {
    fn from(reason: TlsChallengeError) -> Self {
        Self::TlsChallenge(reason)
    }
}

/// Transport failures surface as the underlying error of a response parse.
impl From<TransportError> for HttpError {
    fn from(err: TransportError) -> Self {
        Self::ResponseParse(ResponseParseError::UnderlyingError(Cause::from(err)))
    }
}

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, HttpError>;
