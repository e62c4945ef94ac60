//! Sessions own tasks, their proxies and the dispatcher that feeds them.
//!
//! A [`Session`] builds requests with its [`RequestSerializer`], creates
//! tasks on a [`Transport`], and keeps one [`TaskProxy`] per live task.
//! Transport events for all tasks travel over a single channel to one
//! dispatcher task, so callbacks for a task never run concurrently.
//! Progress and completion handlers then run on the session's
//! [`CallbackQueue`].
//!
//! # Example
//!
//! ```ignore
//! use courier::session::{Session, TaskHandlers};
//!
//! let session = Session::builder().build()?;
//! session.get(
//!     "https://api.example.com/status",
//!     None,
//!     TaskHandlers::new().on_completion(|result| println!("{result:?}")),
//! )?;
//! ```

mod proxy;
mod queue;
mod task;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub use self::proxy::{
    CompletionHandler, DownloadOptions, LocationHandler, ProgressHandler, TaskHandlers, TaskProxy,
};
pub use self::queue::{CallbackQueue, Job};
pub use self::task::{Task, TaskState};

use self::proxy::{ProxyContext, ProxyMode};
use crate::config::SessionConfig;
use crate::error::{Cause, Result, UploadError};
use crate::http::{
    HttpMethod, HttpResponse, MultipartFormData, RequestBody, RequestDescriptor,
    RequestSerializer, ResponseSerializer,
};
use crate::params::Params;
use crate::runtime;
use crate::tls::ServerTrustPolicy;
use crate::transport::{
    BodyDelivery, ReqwestTransport, ResumeData, TaskId, TaskKind, TaskSpec, Transport,
    TransportConfig, TransportEvent, TransportEvents, UploadSource,
};

type EventReceiver = mpsc::UnboundedReceiver<(TaskId, TransportEvent)>;

/// A shared, lockable proxy.
pub type SharedProxy = Arc<Mutex<TaskProxy>>;

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    transport_config: Option<TransportConfig>,
    request_serializer: Option<RequestSerializer>,
    response_serializer: Option<ResponseSerializer>,
    trust: ServerTrustPolicy,
    queue: Option<CallbackQueue>,
    handle: Option<Handle>,
}

impl SessionBuilder {
    /// Start from a configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of [`ReqwestTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configure the default [`ReqwestTransport`].
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    /// Replace the request serializer derived from the configuration.
    pub fn request_serializer(mut self, serializer: RequestSerializer) -> Self {
        self.request_serializer = Some(serializer);
        self
    }

    /// Replace the response serializer derived from the configuration.
    pub fn response_serializer(mut self, serializer: ResponseSerializer) -> Self {
        self.response_serializer = Some(serializer);
        self
    }

    /// Set the server trust policy.
    pub fn trust_policy(mut self, policy: ServerTrustPolicy) -> Self {
        self.trust = policy;
        self
    }

    /// Run handlers on `queue` instead of a serial queue.
    pub fn callback_queue(mut self, queue: CallbackQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Spawn the dispatcher on `handle` instead of the current or shared
    /// runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Build the session.
    pub fn build(self) -> Result<Session> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => runtime::handle()?,
        };
        let request_serializer = match self.request_serializer {
            Some(serializer) => serializer,
            None => self.config.request_serializer()?,
        };
        let serializer = self
            .response_serializer
            .unwrap_or_else(|| self.config.response_serializer());
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let mut config = self.transport_config.unwrap_or_default();
                if let Some(agent) = &self.config.request.user_agent {
                    config = config.user_agent(agent.clone());
                }
                Arc::new(ReqwestTransport::with_config(config)?)
            }
        };
        let queue = self
            .queue
            .unwrap_or_else(|| CallbackQueue::serial_on(&handle));

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            transport,
            request_serializer,
            context: ProxyContext {
                queue,
                serializer,
                options: self.config.download_options(),
                trust: Arc::new(self.trust),
            },
            proxies: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            creation: Mutex::new(()),
            next_id: AtomicU64::new(1),
            events,
        });
        handle.spawn(dispatch_events(Arc::downgrade(&inner), rx));
        tracing::debug!(target: "courier::session", options = ?inner.context.options, "Session created");
        Ok(Session { inner })
    }
}

/// A collection of tasks sharing a transport, serializers and callback
/// context.
///
/// Cloning is cheap; all clones share the same tasks. Dropping the last
/// clone stops event dispatch; tasks still running then complete without
/// calling their handlers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    request_serializer: RequestSerializer,
    context: ProxyContext,
    proxies: Mutex<HashMap<TaskId, SharedProxy>>,
    /// Task handles of live proxies, readable without taking a proxy lock.
    tasks: Mutex<HashMap<TaskId, Task>>,
    creation: Mutex<()>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<(TaskId, TransportEvent)>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tasks", &self.task_count())
            .field("options", &self.inner.context.options)
            .field("queue", &self.inner.context.queue)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Create a session on `transport` with `config`.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        Self::builder().transport(transport).config(config).build()
    }

    /// The serializer used by the convenience methods.
    pub fn request_serializer(&self) -> &RequestSerializer {
        &self.inner.request_serializer
    }

    /// The serializer applied to every response.
    pub fn response_serializer(&self) -> &ResponseSerializer {
        &self.inner.context.serializer
    }

    /// The download options.
    pub fn download_options(&self) -> DownloadOptions {
        self.inner.context.options
    }

    /// Send a GET request.
    pub fn get(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Get, url, params, handlers)
    }

    /// Send a HEAD request.
    pub fn head(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Head, url, params, handlers)
    }

    /// Send a DELETE request.
    pub fn delete(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Delete, url, params, handlers)
    }

    /// Send a POST request.
    pub fn post(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Post, url, params, handlers)
    }

    /// Send a PUT request.
    pub fn put(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Put, url, params, handlers)
    }

    /// Send a PATCH request.
    pub fn patch(&self, url: &str, params: Option<Params>, handlers: TaskHandlers) -> Result<Task> {
        self.send(HttpMethod::Patch, url, params, handlers)
    }

    /// POST a multipart form as an upload, reporting upload progress.
    pub fn post_multipart(
        &self,
        url: &str,
        params: Option<Params>,
        form: MultipartFormData,
        handlers: TaskHandlers,
    ) -> Result<Task> {
        let (boundary, body) = form.finish();
        let request = self
            .inner
            .request_serializer
            .request(HttpMethod::Post, url)
            .query(params.unwrap_or_default())
            .boundary(boundary)
            .body(body.clone())
            .build()?;
        let task = self.upload_task(request, UploadSource::Bytes(body), handlers)?;
        task.resume();
        Ok(task)
    }

    fn send(
        &self,
        method: HttpMethod,
        url: &str,
        params: Option<Params>,
        handlers: TaskHandlers,
    ) -> Result<Task> {
        let request = self
            .inner
            .request_serializer
            .request(method, url)
            .params_opt(params)
            .build()?;
        let task = self.data_task(request, handlers)?;
        task.resume();
        Ok(task)
    }

    /// Create a task that loads the response body into memory.
    pub fn data_task(&self, request: RequestDescriptor, handlers: TaskHandlers) -> Result<Task> {
        self.create_task(
            NewTask::new(TaskKind::Data, ProxyMode::Data).request(request),
            handlers,
        )
    }

    /// Create a task that sends `source` as the request body.
    pub fn upload_task(
        &self,
        request: RequestDescriptor,
        source: UploadSource,
        handlers: TaskHandlers,
    ) -> Result<Task> {
        let file = match &source {
            UploadSource::File(path) => Some(path.clone()),
            UploadSource::Bytes(_) => None,
        };
        let mut new_task = NewTask::new(TaskKind::Upload, ProxyMode::Upload { file }).request(request);
        new_task.upload = Some(source);
        self.create_task(new_task, handlers)
    }

    /// Create a download whose final location is chosen by `destination`.
    ///
    /// `destination` is first called with `(None, None)` before the task
    /// starts; an existing file there satisfies the download unless
    /// [`DownloadOptions::REMOVE_EXISTING_FILE`] is set. It is called again
    /// with the response and the staged file once the body is complete.
    pub fn download_task<F>(
        &self,
        request: RequestDescriptor,
        destination: F,
        handlers: TaskHandlers,
    ) -> Result<Task>
    where
        F: Fn(Option<&HttpResponse>, Option<&Path>) -> Option<PathBuf> + Send + Sync + 'static,
    {
        let mode = ProxyMode::Deferred {
            destination: Arc::new(destination),
        };
        let mut new_task = NewTask::new(TaskKind::Download, mode).request(request);
        new_task.delivery = BodyDelivery::TempFile;
        self.create_task(new_task, handlers)
    }

    /// Create a download appended to `path`, continuing from its current
    /// length with a byte-range request.
    pub fn download_task_to_file(
        &self,
        request: RequestDescriptor,
        path: impl Into<PathBuf>,
        handlers: TaskHandlers,
    ) -> Result<Task> {
        let path = path.into();
        let existing = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let request = if existing > 0 {
            request.with_header("range", &format!("bytes={existing}-"))?
        } else {
            request
        };
        tracing::debug!(
            target: "courier::session",
            path = %path.display(),
            existing,
            "Downloading to file"
        );
        self.create_task(
            NewTask::new(TaskKind::Download, ProxyMode::ExplicitFile { path }).request(request),
            handlers,
        )
    }

    /// Create a download continuing from a token produced by
    /// [`Task::cancel_by_producing_resume_data`].
    pub fn resume_download_task<F>(
        &self,
        resume_data: &[u8],
        destination: F,
        handlers: TaskHandlers,
    ) -> Result<Task>
    where
        F: Fn(Option<&HttpResponse>, Option<&Path>) -> Option<PathBuf> + Send + Sync + 'static,
    {
        let resume = ResumeData::from_bytes(resume_data)?;
        let mode = ProxyMode::Deferred {
            destination: Arc::new(destination),
        };
        let mut new_task = NewTask::new(TaskKind::Resume, mode);
        new_task.resume = Some(resume);
        new_task.delivery = BodyDelivery::TempFile;
        self.create_task(new_task, handlers)
    }

    fn create_task(&self, new_task: NewTask, handlers: TaskHandlers) -> Result<Task> {
        if let Some(path) = new_task.body_file() {
            check_upload_file(path)?;
        }
        let _creation = self.inner.creation.lock();
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let spec = TaskSpec {
            id,
            kind: new_task.kind,
            request: new_task.request.clone(),
            upload: new_task.upload,
            resume: new_task.resume,
            delivery: new_task.delivery,
        };
        let events = TransportEvents::new(id, self.inner.events.clone());
        let transport_task = self.inner.transport.create_task(spec, events)?;

        let task = Task::new(id, new_task.kind, new_task.request, transport_task);
        let proxy = TaskProxy::new(task.clone(), new_task.mode, handlers, self.inner.context.clone());
        self.set_proxy(proxy);
        tracing::debug!(target: "courier::session", task = %id, kind = ?task.kind(), "Task created");
        Ok(task)
    }

    /// Register `proxy` under its task id, replacing any previous entry.
    pub(crate) fn set_proxy(&self, proxy: TaskProxy) -> SharedProxy {
        let id = proxy.id();
        let task = proxy.task().clone();
        let shared = Arc::new(Mutex::new(proxy));
        self.inner.proxies.lock().insert(id, shared.clone());
        self.inner.tasks.lock().insert(id, task);
        shared
    }

    /// The proxy of a live task.
    pub fn proxy_for(&self, id: TaskId) -> Option<SharedProxy> {
        self.inner.proxy_for(id)
    }

    /// Forget a task's proxy. Has no effect if it is already gone.
    pub fn remove_proxy(&self, id: TaskId) -> Option<SharedProxy> {
        self.inner.remove_proxy(id)
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.inner.proxies.lock().len()
    }

    /// Cancel every live task. Each completes with a cancelled error.
    ///
    /// Safe to call from a progress or completion handler, which may run
    /// while its own proxy is locked.
    pub fn cancel_all_tasks(&self) {
        let tasks: Vec<Task> = self.inner.tasks.lock().values().cloned().collect();
        tracing::debug!(target: "courier::session", count = tasks.len(), "Cancelling all tasks");
        for task in tasks {
            task.cancel();
        }
    }
}

impl SessionInner {
    fn proxy_for(&self, id: TaskId) -> Option<SharedProxy> {
        self.proxies.lock().get(&id).cloned()
    }

    fn remove_proxy(&self, id: TaskId) -> Option<SharedProxy> {
        self.tasks.lock().remove(&id);
        self.proxies.lock().remove(&id)
    }

    fn handle_event(&self, id: TaskId, event: TransportEvent) {
        let Some(proxy) = self.proxy_for(id) else {
            // Replies are dropped, which means default handling.
            tracing::trace!(target: "courier::session", task = %id, "Event for unknown task");
            if let TransportEvent::FinishedDownloading { location } = event {
                let _ = std::fs::remove_file(location);
            }
            return;
        };

        match event {
            TransportEvent::Challenge { host, chain, reply } => {
                let disposition = proxy.lock().did_receive_challenge(&host, &chain);
                let _ = reply.send(disposition);
            }
            TransportEvent::BodySent {
                total_sent,
                total_expected,
                ..
            } => proxy.lock().did_send_body_data(total_sent, total_expected),
            TransportEvent::ResponseReceived { response, reply } => {
                let disposition = proxy.lock().did_receive_response(response);
                let _ = reply.send(disposition);
            }
            TransportEvent::DataReceived(chunk) => proxy.lock().did_receive_data(chunk),
            TransportEvent::DownloadProgress {
                total_written,
                total_expected,
                ..
            } => proxy.lock().did_write_data(total_written, total_expected),
            TransportEvent::DownloadResumed {
                offset,
                total_expected,
            } => proxy.lock().did_resume_at_offset(offset, total_expected),
            TransportEvent::FinishedDownloading { location } => {
                proxy.lock().did_finish_downloading(&location)
            }
            TransportEvent::Completed { error } => {
                self.remove_proxy(id);
                proxy.lock().did_complete(error);
            }
        }
    }
}

/// The serial callback context: applies transport events to proxies one at
/// a time, in arrival order.
async fn dispatch_events(session: Weak<SessionInner>, mut rx: EventReceiver) {
    while let Some((id, event)) = rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_event(id, event);
    }
    tracing::debug!(target: "courier::session", "Event dispatch stopped");
}

/// Parameters of a task about to be created.
struct NewTask {
    kind: TaskKind,
    mode: ProxyMode,
    request: Option<RequestDescriptor>,
    upload: Option<UploadSource>,
    resume: Option<ResumeData>,
    delivery: BodyDelivery,
}

impl NewTask {
    fn new(kind: TaskKind, mode: ProxyMode) -> Self {
        Self {
            kind,
            mode,
            request: None,
            upload: None,
            resume: None,
            delivery: BodyDelivery::Chunks,
        }
    }

    fn request(mut self, request: RequestDescriptor) -> Self {
        self.request = Some(request);
        self
    }

    /// The file the request body is read from, if any.
    fn body_file(&self) -> Option<&Path> {
        match (&self.upload, &self.request) {
            (Some(UploadSource::File(path)), _) => Some(path),
            (Some(UploadSource::Bytes(_)), _) => None,
            (None, Some(request)) => match request.body() {
                RequestBody::File(path) => Some(path),
                _ => None,
            },
            (None, None) => None,
        }
    }
}

/// Fail before the transport is involved when a body file is missing.
fn check_upload_file(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => Ok(()),
        Ok(_) => Err(UploadError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(UploadError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into()),
        Err(e) => Err(UploadError::CannotReadFile {
            path: path.to_path_buf(),
            cause: Cause::new(e),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportTask;

    /// Transport whose tasks do nothing until the test sends events.
    #[derive(Default)]
    struct SilentTransport {
        events: Mutex<Vec<TransportEvents>>,
    }

    struct SilentTask {
        events: TransportEvents,
    }

    impl TransportTask for SilentTask {
        fn resume(&self) {}

        fn cancel(&self) {
            self.events.complete(Some(TransportError::Cancelled));
        }

        fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
            self.cancel();
            None
        }
    }

    impl Transport for SilentTransport {
        fn create_task(
            &self,
            _spec: TaskSpec,
            events: TransportEvents,
        ) -> Result<Arc<dyn crate::transport::TransportTask>> {
            self.events.lock().push(events.clone());
            Ok(Arc::new(SilentTask { events }))
        }
    }

    fn session() -> (Session, Arc<SilentTransport>) {
        let transport = Arc::new(SilentTransport::default());
        let session = Session::builder()
            .transport(transport.clone())
            .callback_queue(CallbackQueue::Inline)
            .build()
            .unwrap();
        (session, transport)
    }

    #[tokio::test]
    async fn test_ids_increase_from_one() {
        let (session, _) = session();
        let first = session.get("https://api.test/a", None, TaskHandlers::new()).unwrap();
        let second = session.get("https://api.test/b", None, TaskHandlers::new()).unwrap();
        assert_eq!(first.id(), TaskId(1));
        assert_eq!(second.id(), TaskId(2));
        assert_eq!(first.state(), TaskState::Running);
        assert_eq!(session.task_count(), 2);
    }

    #[tokio::test]
    async fn test_builder_error_creates_no_task() {
        let (session, transport) = session();
        let err = session.get("", None, TaskHandlers::new()).unwrap_err();
        assert!(err.is_serialization_error());
        assert_eq!(session.task_count(), 0);
        assert!(transport.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remove_proxy_is_idempotent() {
        let (session, _) = session();
        let request = session
            .request_serializer()
            .build("https://api.test/a", HttpMethod::Get)
            .unwrap();
        let task = session.data_task(request, TaskHandlers::new()).unwrap();
        assert_eq!(task.state(), TaskState::Suspended);
        assert!(session.proxy_for(task.id()).is_some());
        assert!(session.remove_proxy(task.id()).is_some());
        assert!(session.remove_proxy(task.id()).is_none());
        assert!(session.proxy_for(task.id()).is_none());
    }

    #[tokio::test]
    async fn test_range_header_only_for_existing_bytes() {
        let (session, _) = session();
        let dir = tempfile::tempdir().unwrap();
        let request = session
            .request_serializer()
            .build("https://files.test/a.bin", HttpMethod::Get)
            .unwrap();

        let fresh = session
            .download_task_to_file(request.clone(), dir.path().join("new.bin"), TaskHandlers::new())
            .unwrap();
        assert_eq!(fresh.request().and_then(|r| r.header("range")), None);

        let partial = dir.path().join("partial.bin");
        std::fs::write(&partial, [0u8; 10]).unwrap();
        let resumed = session
            .download_task_to_file(request, &partial, TaskHandlers::new())
            .unwrap();
        assert_eq!(resumed.request().and_then(|r| r.header("range")), Some("bytes=10-"));
    }

    #[tokio::test]
    async fn test_bad_resume_token() {
        let (session, _) = session();
        let err = session
            .resume_download_task(b"not a token", |_, _| None, TaskHandlers::new())
            .unwrap_err();
        assert_eq!(err.code(), 5007);
        assert_eq!(session.task_count(), 0);
    }
}
