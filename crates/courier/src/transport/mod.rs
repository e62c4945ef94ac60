//! The boundary between sessions and the code that moves bytes.
//!
//! A [`Transport`] creates tasks from a [`TaskSpec`] and reports everything
//! that happens to them as [`TransportEvent`]s on a [`TransportEvents`]
//! channel. Events for one task arrive in order: an optional challenge,
//! upload progress, the response, body data, then exactly one
//! [`TransportEvent::Completed`].
//!
//! [`ReqwestTransport`] is the production implementation.

mod client;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::{Cause, DownloadError, Result, TransportError};
use crate::http::{HttpResponse, RequestDescriptor};

pub use self::client::{ReqwestTransport, TransportConfig};

/// Identifier of a task, unique for the lifetime of its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Fetch a body into memory.
    Data,
    /// Send a body with upload progress.
    Upload,
    /// Download a body.
    Download,
    /// Continue a download from a resume token.
    Resume,
}

/// Where the transport delivers response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyDelivery {
    /// As [`TransportEvent::DataReceived`] chunks.
    #[default]
    Chunks,
    /// Into a transport-owned temporary file, announced by
    /// [`TransportEvent::FinishedDownloading`].
    TempFile,
}

/// The body of an upload task.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Bytes in memory.
    Bytes(Bytes),
    /// A file read when the task starts.
    File(PathBuf),
}

/// Everything a transport needs to create a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Identifier assigned by the session.
    pub id: TaskId,
    /// Task kind.
    pub kind: TaskKind,
    /// The request; absent only for tasks resumed from a token.
    pub request: Option<RequestDescriptor>,
    /// Body sent by upload tasks.
    pub upload: Option<UploadSource>,
    /// Resume state for [`TaskKind::Resume`].
    pub resume: Option<ResumeData>,
    /// Body delivery mode.
    pub delivery: BodyDelivery,
}

/// Answer to a server trust challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeDisposition {
    /// Proceed, trusting the presented chain.
    UseCredential,
    /// Let the connection layer decide.
    #[default]
    PerformDefaultHandling,
    /// Abort the task.
    Cancel,
}

/// Answer to a received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseDisposition {
    /// Continue receiving the body.
    #[default]
    Allow,
    /// Stop the task; it completes with [`TransportError::Cancelled`].
    Cancel,
}

/// A callback from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The server presented certificates for `host`.
    Challenge {
        /// Challenged host.
        host: String,
        /// DER certificates, leaf first.
        chain: Vec<Bytes>,
        /// Where the disposition goes.
        reply: oneshot::Sender<ChallengeDisposition>,
    },
    /// Part of the request body was sent.
    BodySent {
        /// Bytes in this step.
        bytes_sent: u64,
        /// Bytes sent so far.
        total_sent: u64,
        /// Full body length, if known.
        total_expected: Option<u64>,
    },
    /// The response head arrived.
    ResponseReceived {
        /// Response metadata.
        response: HttpResponse,
        /// Where the disposition goes.
        reply: oneshot::Sender<ResponseDisposition>,
    },
    /// A chunk of the body arrived.
    DataReceived(Bytes),
    /// Bytes were written to the temporary download file.
    DownloadProgress {
        /// Bytes in this step.
        bytes_written: u64,
        /// Bytes written so far, including any resume offset.
        total_written: u64,
        /// Expected final size, if known.
        total_expected: Option<u64>,
    },
    /// A resumed download continues from `offset`.
    DownloadResumed {
        /// Bytes already present.
        offset: u64,
        /// Expected final size, if known.
        total_expected: Option<u64>,
    },
    /// The body is complete in a temporary file.
    FinishedDownloading {
        /// Temporary file location. The receiver owns the file from here
        /// on and must move or remove it.
        location: PathBuf,
    },
    /// The task ended. Always the last event for a task.
    Completed {
        /// The transport failure, if any.
        error: Option<TransportError>,
    },
}

/// Sender half of the event channel, bound to one task.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    id: TaskId,
    tx: mpsc::UnboundedSender<(TaskId, TransportEvent)>,
}

impl TransportEvents {
    /// Bind `tx` to task `id`.
    pub fn new(id: TaskId, tx: mpsc::UnboundedSender<(TaskId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    /// The task these events belong to.
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Send an event. Returns `false` if the session is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }

    /// Send a trust challenge and wait for the disposition.
    pub async fn challenge(&self, host: String, chain: Vec<Bytes>) -> ChallengeDisposition {
        let (reply, rx) = oneshot::channel();
        if !self.send(TransportEvent::Challenge { host, chain, reply }) {
            return ChallengeDisposition::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Send the response head and wait for the disposition.
    pub async fn response(&self, response: HttpResponse) -> ResponseDisposition {
        let (reply, rx) = oneshot::channel();
        if !self.send(TransportEvent::ResponseReceived { response, reply }) {
            return ResponseDisposition::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Send the terminal event.
    pub fn complete(&self, error: Option<TransportError>) -> bool {
        self.send(TransportEvent::Completed { error })
    }
}

/// State needed to continue an interrupted download.
///
/// Serialized as JSON by [`ResumeData::to_bytes`], so it can be stored and
/// handed back as an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// URL of the interrupted request.
    pub url: Url,
    /// Request headers, in order.
    pub headers: Vec<(String, String)>,
    /// Partial body on disk.
    pub temp_path: PathBuf,
    /// Bytes already in `temp_path`.
    pub offset: u64,
    /// Validator sent as `If-Range`.
    pub etag: Option<String>,
    /// Fallback validator when there is no ETag.
    pub last_modified: Option<String>,
    /// Expected final size, if known.
    pub total_expected: Option<u64>,
}

impl ResumeData {
    /// Encode as a token.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DownloadError::InvalidResumeData(Some(Cause::new(e))).into())
    }

    /// Decode a token produced by [`ResumeData::to_bytes`].
    pub fn from_bytes(token: &[u8]) -> Result<Self> {
        if token.is_empty() {
            return Err(DownloadError::InvalidResumeData(None).into());
        }
        serde_json::from_slice(token)
            .map_err(|e| DownloadError::InvalidResumeData(Some(Cause::new(e))).into())
    }

    /// The `If-Range` validator, preferring the ETag.
    pub fn validator(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Creates tasks.
pub trait Transport: Send + Sync {
    /// Create a suspended task. Events for it go to `events`.
    fn create_task(&self, spec: TaskSpec, events: TransportEvents) -> Result<Arc<dyn TransportTask>>;
}

/// A task owned by a transport.
pub trait TransportTask: Send + Sync {
    /// Start the task. Calling it again has no effect.
    fn resume(&self);

    /// Cancel the task. It completes with [`TransportError::Cancelled`].
    fn cancel(&self);

    /// Cancel the task and keep its partial body for a later resume.
    ///
    /// Returns `None` if the task cannot be resumed.
    fn cancel_producing_resume_data(&self) -> Option<ResumeData>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resume_data() -> ResumeData {
        ResumeData {
            url: Url::parse("https://files.test/big.bin").unwrap(),
            headers: vec![("accept".into(), "*/*".into())],
            temp_path: PathBuf::from("/tmp/courier-part"),
            offset: 1000,
            etag: None,
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
            total_expected: Some(1500),
        }
    }

    #[test]
    fn test_resume_token() {
        let data = resume_data();
        let token = data.to_bytes().unwrap();
        assert_eq!(ResumeData::from_bytes(&token).unwrap(), data);
        assert_eq!(data.validator(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
    }

    #[test]
    fn test_bad_resume_token() {
        assert_eq!(ResumeData::from_bytes(b"").unwrap_err().code(), 5007);
        let err = ResumeData::from_bytes(b"garbage").unwrap_err();
        assert_eq!(err.code(), 5007);
        assert!(err.underlying_cause().is_some());
    }

    #[tokio::test]
    async fn test_dropped_reply_means_default() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(TaskId(3), tx);

        let waiter = tokio::spawn(async move {
            events
                .challenge("api.test".into(), vec![Bytes::from_static(b"leaf")])
                .await
        });
        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id, TaskId(3));
        drop(event);
        assert_eq!(waiter.await.unwrap(), ChallengeDisposition::PerformDefaultHandling);
    }

    #[tokio::test]
    async fn test_closed_channel_means_default() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let events = TransportEvents::new(TaskId(1), tx);
        let response = HttpResponse::new(
            200,
            Url::parse("https://api.test/").unwrap(),
            http::HeaderMap::new(),
        );
        assert_eq!(events.response(response).await, ResponseDisposition::Allow);
        assert!(!events.complete(None));
    }
}
