//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier::error::TransportError;
use courier::http::HttpResponse;
use courier::session::{CallbackQueue, Session, TaskHandlers};
use courier::transport::{
    ChallengeDisposition, ResponseDisposition, ResumeData, TaskSpec, Transport, TransportEvent,
    TransportEvents, TransportTask,
};
use courier::{Decoded, Result, SessionConfig};
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

/// One scripted transport callback.
#[derive(Debug, Clone)]
pub enum Step {
    Challenge { host: String, chain: Vec<Bytes> },
    BodySent { total_sent: u64, total_expected: u64 },
    Response(HttpResponse),
    Data(Bytes),
    Written { total_written: u64, total_expected: Option<u64> },
    Resumed { offset: u64, total_expected: Option<u64> },
    Finished(PathBuf),
    Fail(TransportError),
}

/// What the session answered while a script ran.
#[derive(Debug, Default)]
pub struct Replies {
    pub challenges: Vec<ChallengeDisposition>,
    pub responses: Vec<ResponseDisposition>,
}

/// A transport that plays back one script per created task.
///
/// Challenge dispositions are recorded but not acted on, so a script keeps
/// going after a rejected challenge. A cancelled response ends the script
/// with [`TransportError::Cancelled`].
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub specs: Mutex<Vec<TaskSpec>>,
    pub replies: Arc<Mutex<Replies>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }
}

impl Transport for ScriptedTransport {
    fn create_task(&self, spec: TaskSpec, events: TransportEvents) -> Result<Arc<dyn TransportTask>> {
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        self.specs.lock().push(spec);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        Ok(Arc::new(ScriptedTask {
            pending: Mutex::new(Some((script, cancel_rx))),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            events,
            replies: self.replies.clone(),
        }))
    }
}

struct ScriptedTask {
    pending: Mutex<Option<(Vec<Step>, oneshot::Receiver<()>)>>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    events: TransportEvents,
    replies: Arc<Mutex<Replies>>,
}

impl TransportTask for ScriptedTask {
    fn resume(&self) {
        let Some((script, cancel_rx)) = self.pending.lock().take() else {
            return;
        };
        let events = self.events.clone();
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let error = tokio::select! {
                error = play(script, &events, &replies) => error,
                Ok(()) = cancel_rx => Some(TransportError::Cancelled),
            };
            events.complete(error);
        });
    }

    fn cancel(&self) {
        if let Some(tx) = self.cancel_tx.lock().take() {
            let _ = tx.send(());
        }
        if self.pending.lock().take().is_some() {
            self.events.complete(Some(TransportError::Cancelled));
        }
    }

    fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        self.cancel();
        None
    }
}

async fn play(script: Vec<Step>, events: &TransportEvents, replies: &Mutex<Replies>) -> Option<TransportError> {
    for step in script {
        tokio::task::yield_now().await;
        match step {
            Step::Challenge { host, chain } => {
                let disposition = events.challenge(host, chain).await;
                replies.lock().challenges.push(disposition);
            }
            Step::BodySent {
                total_sent,
                total_expected,
            } => {
                events.send(TransportEvent::BodySent {
                    bytes_sent: 0,
                    total_sent,
                    total_expected: Some(total_expected),
                });
            }
            Step::Response(response) => {
                let disposition = events.response(response).await;
                replies.lock().responses.push(disposition);
                if disposition == ResponseDisposition::Cancel {
                    return Some(TransportError::Cancelled);
                }
            }
            Step::Data(chunk) => {
                events.send(TransportEvent::DataReceived(chunk));
            }
            Step::Written {
                total_written,
                total_expected,
            } => {
                events.send(TransportEvent::DownloadProgress {
                    bytes_written: 0,
                    total_written,
                    total_expected,
                });
            }
            Step::Resumed {
                offset,
                total_expected,
            } => {
                events.send(TransportEvent::DownloadResumed {
                    offset,
                    total_expected,
                });
            }
            Step::Finished(location) => {
                events.send(TransportEvent::FinishedDownloading { location });
            }
            Step::Fail(error) => return Some(error),
        }
    }
    None
}

/// Build a response head.
pub fn response(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse::new(status, Url::parse("https://files.test/data").unwrap(), map)
}

/// A session on `transport` with inline handlers.
pub fn session(transport: Arc<ScriptedTransport>, config: SessionConfig) -> Session {
    Session::builder()
        .transport(transport)
        .config(config)
        .callback_queue(CallbackQueue::Inline)
        .build()
        .expect("Failed to build session")
}

/// Handlers that forward the result to the returned receiver.
pub fn completion() -> (TaskHandlers, oneshot::Receiver<Result<Decoded>>) {
    let (tx, rx) = oneshot::channel();
    let handlers = TaskHandlers::new().on_completion(move |result| {
        let _ = tx.send(result);
    });
    (handlers, rx)
}

/// Wait for a completion, failing the test after a few seconds.
pub async fn finish(rx: oneshot::Receiver<Result<Decoded>>) -> Result<Decoded> {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("Timed out waiting for completion")
        .expect("Completion handler dropped")
}
