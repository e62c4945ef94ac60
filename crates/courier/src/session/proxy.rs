//! Per-task state between transport callbacks and the caller's handlers.
//!
//! A [`TaskProxy`] accumulates the body of data and upload tasks, writes
//! explicit-file downloads to disk (continuing partial files with byte
//! ranges), moves staged downloads to their final location, and turns the
//! task's end into one call of the completion handler.
//!
//! Completion picks the first of:
//! 1. a rejected server trust challenge,
//! 2. a recorded download error,
//! 3. a download found to be already complete,
//! 4. the response serializer's verdict.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::queue::CallbackQueue;
use super::task::Task;
use crate::error::{
    Cause, DownloadError, HttpError, Result, TlsChallengeError, TransportError, UploadError,
};
use crate::http::{Decoded, HttpResponse, ResponseSerializer};
use crate::progress::Progress;
use crate::tls::{ServerTrustPolicy, TrustEvaluation};
use crate::transport::{ChallengeDisposition, ResponseDisposition, TaskId};

bitflags::bitflags! {
    /// How downloads treat the file system.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DownloadOptions: u8 {
        /// Create missing parent directories of the destination.
        const CREATE_INTERMEDIATE_DIRECTORIES = 1 << 0;
        /// Replace an existing destination, and delete partial output of a
        /// failed download.
        const REMOVE_EXISTING_FILE = 1 << 1;
    }
}

/// Receives a task's progress.
pub type ProgressHandler = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Receives a task's result.
pub type CompletionHandler = Box<dyn FnOnce(Result<Decoded>) + Send>;

/// Chooses the final location of a downloaded file.
///
/// Called once before the download starts with `(None, None)`, and again
/// with the response and the staged file once the body is complete.
pub type LocationHandler =
    Arc<dyn Fn(Option<&HttpResponse>, Option<&Path>) -> Option<PathBuf> + Send + Sync>;

/// Caller callbacks for one task. Missing handlers are skipped.
#[derive(Default)]
pub struct TaskHandlers {
    upload_progress: Option<ProgressHandler>,
    download_progress: Option<ProgressHandler>,
    completion: Option<CompletionHandler>,
}

impl std::fmt::Debug for TaskHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlers")
            .field("upload_progress", &self.upload_progress.is_some())
            .field("download_progress", &self.download_progress.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl TaskHandlers {
    /// No handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called whenever body bytes are sent.
    pub fn on_upload_progress(mut self, handler: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.upload_progress = Some(Arc::new(handler));
        self
    }

    /// Called whenever body bytes are received or written.
    pub fn on_download_progress(mut self, handler: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.download_progress = Some(Arc::new(handler));
        self
    }

    /// Called once with the task's result.
    pub fn on_completion(mut self, handler: impl FnOnce(Result<Decoded>) + Send + 'static) -> Self {
        self.completion = Some(Box::new(handler));
        self
    }
}

/// What the proxy does with the response body.
#[derive(Clone)]
pub(crate) enum ProxyMode {
    /// Keep the body in memory; cleared when the response arrives.
    Data,
    /// Keep the response body in memory and report upload progress. `file`
    /// is the uploaded file, if the body comes from disk.
    Upload { file: Option<PathBuf> },
    /// Append to `path`, continuing from its current length.
    ExplicitFile { path: PathBuf },
    /// Move the transport's staged file to a location chosen by the caller.
    Deferred { destination: LocationHandler },
}

/// Session-wide settings each proxy works with.
#[derive(Clone)]
pub(crate) struct ProxyContext {
    pub queue: CallbackQueue,
    pub serializer: ResponseSerializer,
    pub options: DownloadOptions,
    pub trust: Arc<ServerTrustPolicy>,
}

/// The state of one in-flight task.
pub struct TaskProxy {
    task: Task,
    mode: ProxyMode,
    handlers: TaskHandlers,
    context: ProxyContext,
    buffer: BytesMut,
    response: Option<HttpResponse>,
    file: Option<File>,
    location: Option<PathBuf>,
    resume_offset: u64,
    resuming: bool,
    already_downloaded: bool,
    trust_failure: Option<String>,
    error: Option<HttpError>,
}

impl std::fmt::Debug for TaskProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProxy")
            .field("task", &self.task)
            .field("buffered", &self.buffer.len())
            .field("location", &self.location)
            .field("resume_offset", &self.resume_offset)
            .field("resuming", &self.resuming)
            .field("already_downloaded", &self.already_downloaded)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl TaskProxy {
    pub(crate) fn new(task: Task, mode: ProxyMode, handlers: TaskHandlers, context: ProxyContext) -> Self {
        let mut proxy = Self {
            task,
            mode,
            handlers,
            context,
            buffer: BytesMut::new(),
            response: None,
            file: None,
            location: None,
            resume_offset: 0,
            resuming: false,
            already_downloaded: false,
            trust_failure: None,
            error: None,
        };
        match &proxy.mode {
            ProxyMode::ExplicitFile { path } => proxy.location = Some(path.clone()),
            ProxyMode::Deferred { destination } => {
                if let Some(existing) = destination(None, None)
                    && existing.is_file()
                    && !proxy.context.options.contains(DownloadOptions::REMOVE_EXISTING_FILE)
                {
                    tracing::debug!(
                        target: "courier::proxy",
                        task = %proxy.task.id(),
                        path = %existing.display(),
                        "Destination already exists"
                    );
                    proxy.already_downloaded = true;
                    proxy.location = Some(existing);
                }
            }
            ProxyMode::Data | ProxyMode::Upload { .. } => {}
        }
        proxy
    }

    /// The task this proxy serves.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// The response head, once received.
    pub fn response(&self) -> Option<&HttpResponse> {
        self.response.as_ref()
    }

    /// Bytes held in memory.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// The file the download ends up in, once known.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Bytes that were already on disk when the download continued.
    pub fn resume_offset(&self) -> u64 {
        self.resume_offset
    }

    /// Whether a partial file is being continued.
    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    /// Whether the download turned out to be complete already.
    pub fn is_already_downloaded(&self) -> bool {
        self.already_downloaded
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<&HttpError> {
        self.error.as_ref()
    }

    pub(crate) fn did_receive_challenge(&mut self, host: &str, chain: &[Bytes]) -> ChallengeDisposition {
        match self.context.trust.evaluate(host, chain) {
            TrustEvaluation::Trusted => ChallengeDisposition::UseCredential,
            TrustEvaluation::Rejected(reason) => {
                tracing::debug!(
                    target: "courier::proxy",
                    task = %self.id(),
                    host,
                    %reason,
                    "Server trust rejected"
                );
                self.trust_failure = Some(host.to_string());
                ChallengeDisposition::Cancel
            }
        }
    }

    pub(crate) fn did_send_body_data(&mut self, total_sent: u64, total_expected: Option<u64>) {
        let progress = self.task.upload_progress();
        if total_expected.is_some() {
            progress.set_total(total_expected);
        }
        progress.advance_to(total_sent);
        self.notify(self.handlers.upload_progress.clone(), progress.clone());
    }

    pub(crate) fn did_receive_response(&mut self, response: HttpResponse) -> ResponseDisposition {
        tracing::debug!(
            target: "courier::proxy",
            task = %self.id(),
            status = response.status(),
            "Response received"
        );
        let disposition = match self.mode.clone() {
            ProxyMode::Data => {
                self.buffer.clear();
                self.task
                    .download_progress()
                    .set_total(response.expected_content_length());
                ResponseDisposition::Allow
            }
            ProxyMode::Upload { .. } => {
                self.task
                    .download_progress()
                    .set_total(response.expected_content_length());
                ResponseDisposition::Allow
            }
            ProxyMode::ExplicitFile { path } => self.open_destination(path, &response),
            ProxyMode::Deferred { .. } if self.already_downloaded => ResponseDisposition::Cancel,
            ProxyMode::Deferred { .. } => ResponseDisposition::Allow,
        };
        self.response = Some(response);
        disposition
    }

    /// Open the target file and decide from the status whether to continue.
    fn open_destination(&mut self, path: PathBuf, response: &HttpResponse) -> ResponseDisposition {
        let opened = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .and_then(|mut file| {
                let end = file.seek(SeekFrom::End(0))?;
                Ok((file, end))
            });
        let (file, offset) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.record_error(DownloadError::CannotWriteToFile {
                    path,
                    cause: Some(Cause::new(e)),
                });
                return ResponseDisposition::Cancel;
            }
        };

        self.resume_offset = offset;
        let progress = self.task.download_progress();
        match response.status() {
            206 => {
                let total = response
                    .content_range_total()
                    .or_else(|| response.expected_content_length().map(|len| offset + len));
                progress.set_total(total);
                progress.advance_to(offset);
                self.resuming = offset > 0;
                self.file = Some(file);
                tracing::debug!(target: "courier::proxy", task = %self.id(), offset, ?total, "Continuing partial file");
                ResponseDisposition::Allow
            }
            416 if offset > 0 => {
                progress.set_total(Some(offset));
                progress.advance_to(offset);
                self.already_downloaded = true;
                tracing::debug!(target: "courier::proxy", task = %self.id(), offset, "Range not satisfiable; file complete");
                ResponseDisposition::Cancel
            }
            200 if offset == 0 => {
                progress.set_total(response.expected_content_length());
                self.file = Some(file);
                ResponseDisposition::Allow
            }
            status => {
                tracing::debug!(target: "courier::proxy", task = %self.id(), status, offset, "Cannot continue file");
                self.record_error(DownloadError::CannotWriteToFile { path, cause: None });
                ResponseDisposition::Cancel
            }
        }
    }

    pub(crate) fn did_receive_data(&mut self, chunk: Bytes) {
        let len = chunk.len() as u64;
        match &self.mode {
            ProxyMode::ExplicitFile { path } => {
                if self.error.is_some() {
                    return;
                }
                let Some(file) = self.file.as_mut() else {
                    return;
                };
                if let Err(e) = file.write_all(&chunk) {
                    let path = path.clone();
                    self.file = None;
                    self.record_error(DownloadError::CannotWriteToFile {
                        path,
                        cause: Some(Cause::new(e)),
                    });
                    self.task.cancel();
                    return;
                }
            }
            ProxyMode::Data | ProxyMode::Upload { .. } => self.buffer.extend_from_slice(&chunk),
            ProxyMode::Deferred { .. } => {
                tracing::trace!(target: "courier::proxy", task = %self.id(), "Ignoring data for staged download");
                return;
            }
        }
        let progress = self.task.download_progress();
        progress.advance_by(len);
        self.notify(self.handlers.download_progress.clone(), progress.clone());
    }

    pub(crate) fn did_write_data(&mut self, total_written: u64, total_expected: Option<u64>) {
        let progress = self.task.download_progress();
        if total_expected.is_some() {
            progress.set_total(total_expected);
        }
        progress.advance_to(total_written);
        self.notify(self.handlers.download_progress.clone(), progress.clone());
    }

    pub(crate) fn did_resume_at_offset(&mut self, offset: u64, total_expected: Option<u64>) {
        self.resuming = true;
        self.resume_offset = offset;
        let progress = self.task.download_progress();
        if total_expected.is_some() {
            progress.set_total(total_expected);
        }
        progress.advance_to(offset);
        self.notify(self.handlers.download_progress.clone(), progress.clone());
    }

    pub(crate) fn did_finish_downloading(&mut self, staged: &Path) {
        let ProxyMode::Deferred { destination } = &self.mode else {
            return;
        };
        let target = destination(self.response.as_ref(), Some(staged));
        match self.place_file(staged, target) {
            Ok(path) => {
                tracing::debug!(target: "courier::proxy", task = %self.id(), path = %path.display(), "Download in place");
                self.location = Some(path);
            }
            Err(error) => {
                let _ = std::fs::remove_file(staged);
                self.record_error(error);
            }
        }
    }

    /// Move `staged` to `target` following the download options.
    fn place_file(&self, staged: &Path, target: Option<PathBuf>) -> std::result::Result<PathBuf, DownloadError> {
        let target = target.ok_or(DownloadError::MissingDestination)?;
        if target.as_os_str().is_empty() || target.is_dir() {
            return Err(DownloadError::InvalidDestination { path: target });
        }

        let options = self.context.options;
        if target.exists() {
            if !options.contains(DownloadOptions::REMOVE_EXISTING_FILE) {
                let _ = std::fs::remove_file(staged);
                return Ok(target);
            }
            std::fs::remove_file(&target).map_err(|e| DownloadError::CannotRemoveFile {
                path: target.clone(),
                cause: Cause::new(e),
            })?;
        }

        if options.contains(DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES)
            && let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| DownloadError::CannotCreateDirectory {
                path: parent.to_path_buf(),
                cause: Cause::new(e),
            })?;
        }

        std::fs::rename(staged, &target)
            .or_else(|_| std::fs::copy(staged, &target).and_then(|_| std::fs::remove_file(staged)))
            .map_err(|e| DownloadError::CannotMoveFile {
                from: staged.to_path_buf(),
                to: target.clone(),
                cause: Cause::new(e),
            })?;
        Ok(target)
    }

    pub(crate) fn did_complete(&mut self, error: Option<TransportError>) {
        self.file = None;
        let result = self.final_result(error);
        self.task.mark_completed();
        match &result {
            Ok(_) => tracing::debug!(target: "courier::proxy", task = %self.id(), "Task succeeded"),
            Err(e) => tracing::debug!(target: "courier::proxy", task = %self.id(), code = e.code(), "Task failed"),
        }
        if let Some(completion) = self.handlers.completion.take() {
            self.context.queue.dispatch(move || completion(result));
        }
    }

    fn final_result(&mut self, error: Option<TransportError>) -> Result<Decoded> {
        let result = self.outcome(error);
        if result.is_err()
            && self.context.options.contains(DownloadOptions::REMOVE_EXISTING_FILE)
            && let ProxyMode::ExplicitFile { path } = &self.mode
            && path.is_file()
        {
            tracing::debug!(target: "courier::proxy", task = %self.id(), path = %path.display(), "Removing partial file");
            let _ = std::fs::remove_file(path);
        }
        result
    }

    fn outcome(&mut self, error: Option<TransportError>) -> Result<Decoded> {
        if let Some(host) = self.trust_failure.take() {
            return Err(TlsChallengeError::UnderlyingError {
                host,
                cause: error.map(Cause::from),
            }
            .into());
        }

        if let Some(recorded) = self.error.take() {
            return Err(recorded);
        }

        // The body is read before anything is sent, so local I/O without a
        // response means the upload file went away.
        if let ProxyMode::Upload { file: Some(path) } = &self.mode
            && self.response.is_none()
            && let Some(io @ TransportError::Io(_)) = &error
        {
            return Err(UploadError::CannotReadFile {
                path: path.clone(),
                cause: io.clone().into(),
            }
            .into());
        }

        if self.already_downloaded
            && let Some(path) = &self.location
        {
            return Ok(Decoded::File(path.clone()));
        }

        let serializer = &self.context.serializer;
        match &self.mode {
            ProxyMode::Data | ProxyMode::Upload { .. } => {
                let body = self.buffer.split().freeze();
                serializer.parse(self.response.as_ref(), Some(&body), error.as_ref())
            }
            ProxyMode::ExplicitFile { path } => serializer
                .validate(self.response.as_ref(), error.as_ref())
                .map(|_| Decoded::File(path.clone())),
            ProxyMode::Deferred { .. } => {
                serializer.validate(self.response.as_ref(), error.as_ref())?;
                self.location
                    .clone()
                    .map(Decoded::File)
                    .ok_or_else(|| DownloadError::MissingDestination.into())
            }
        }
    }

    fn record_error(&mut self, error: impl Into<HttpError>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    fn notify(&self, handler: Option<ProgressHandler>, progress: Progress) {
        if let Some(handler) = handler {
            self.context.queue.dispatch(move || handler(&progress));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ResumeData, TaskKind, TransportTask};
    use http::HeaderMap;
    use http::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderValue};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    #[derive(Default)]
    struct StubTask {
        cancelled: AtomicUsize,
    }

    impl TransportTask for StubTask {
        fn resume(&self) {}

        fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
            None
        }
    }

    type Outcome = Arc<Mutex<Option<Result<Decoded>>>>;

    fn proxy_with(mode: ProxyMode, options: DownloadOptions, trust: ServerTrustPolicy) -> (TaskProxy, Outcome) {
        let task = Task::new(TaskId(1), TaskKind::Download, None, Arc::new(StubTask::default()));
        task.resume();
        let outcome: Outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let handlers = TaskHandlers::new().on_completion(move |result| *slot.lock() = Some(result));
        let context = ProxyContext {
            queue: CallbackQueue::Inline,
            serializer: ResponseSerializer::new(),
            options,
            trust: Arc::new(trust),
        };
        (TaskProxy::new(task, mode, handlers, context), outcome)
    }

    fn proxy(mode: ProxyMode) -> (TaskProxy, Outcome) {
        proxy_with(mode, DownloadOptions::empty(), ServerTrustPolicy::default())
    }

    fn response(status: u16, headers: &[(http::HeaderName, &str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        HttpResponse::new(status, Url::parse("https://files.test/big.bin").unwrap(), map)
    }

    fn take(outcome: &Outcome) -> Result<Decoded> {
        outcome.lock().take().expect("completion handler was not called")
    }

    #[test]
    fn test_data_task_buffers_body() {
        let (mut proxy, outcome) = proxy(ProxyMode::Data);
        proxy.did_receive_data(Bytes::from_static(b"stale"));
        assert_eq!(
            proxy.did_receive_response(response(200, &[(CONTENT_LENGTH, "5")])),
            ResponseDisposition::Allow
        );
        assert_eq!(proxy.buffered_len(), 0);
        proxy.did_receive_data(Bytes::from_static(b"he"));
        proxy.did_receive_data(Bytes::from_static(b"llo"));
        assert_eq!(proxy.task().download_progress().total(), Some(5));
        proxy.did_complete(None);

        let decoded = take(&outcome).unwrap();
        assert_eq!(decoded.as_bytes().map(|b| b.as_ref()), Some(&b"hello"[..]));
        assert_eq!(proxy.task().state(), crate::session::TaskState::Completed);
    }

    #[test]
    fn test_trust_failure_wins_over_success() {
        let trust = ServerTrustPolicy::new(crate::tls::TrustMode::pinned(["nope"]));
        let (mut proxy, outcome) = proxy_with(ProxyMode::Data, DownloadOptions::empty(), trust);
        assert_eq!(
            proxy.did_receive_challenge("api.test", &[Bytes::from_static(b"leaf")]),
            ChallengeDisposition::Cancel
        );
        proxy.did_receive_response(response(200, &[]));
        proxy.did_receive_data(Bytes::from_static(b"{}"));
        proxy.did_complete(None);

        let err = take(&outcome).unwrap_err();
        assert!(matches!(
            err,
            HttpError::TlsChallenge(TlsChallengeError::UnderlyingError { ref host, .. }) if host == "api.test"
        ));
    }

    #[test]
    fn test_explicit_file_resumes_with_206() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![1u8; 1000]).unwrap();

        let (mut proxy, outcome) = proxy(ProxyMode::ExplicitFile { path: path.clone() });
        let disposition = proxy.did_receive_response(response(
            206,
            &[(CONTENT_RANGE, "bytes 1000-1499/1500"), (CONTENT_LENGTH, "500")],
        ));
        assert_eq!(disposition, ResponseDisposition::Allow);
        assert!(proxy.is_resuming());
        let progress = proxy.task().download_progress().clone();
        assert_eq!(progress.total(), Some(1500));
        assert_eq!(progress.completed(), 1000);

        proxy.did_receive_data(Bytes::from(vec![2u8; 200]));
        proxy.did_receive_data(Bytes::from(vec![2u8; 300]));
        proxy.did_complete(None);

        assert_eq!(take(&outcome).unwrap().as_file(), Some(path.as_path()));
        assert_eq!(progress.completed(), 1500);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1500);
    }

    #[test]
    fn test_explicit_file_416_is_already_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        std::fs::write(&path, vec![9u8; 1000]).unwrap();

        let (mut proxy, outcome) = proxy(ProxyMode::ExplicitFile { path: path.clone() });
        assert_eq!(
            proxy.did_receive_response(response(416, &[])),
            ResponseDisposition::Cancel
        );
        assert!(proxy.is_already_downloaded());
        proxy.did_complete(Some(TransportError::Cancelled));

        assert_eq!(take(&outcome).unwrap().as_file(), Some(path.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), vec![9u8; 1000]);
    }

    #[test]
    fn test_explicit_file_rejects_full_body_over_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"partial").unwrap();

        let (mut proxy, outcome) = proxy_with(
            ProxyMode::ExplicitFile { path: path.clone() },
            DownloadOptions::REMOVE_EXISTING_FILE,
            ServerTrustPolicy::default(),
        );
        assert_eq!(
            proxy.did_receive_response(response(200, &[])),
            ResponseDisposition::Cancel
        );
        proxy.did_complete(Some(TransportError::Cancelled));

        assert_eq!(take(&outcome).unwrap_err().code(), 5001);
        assert!(!path.exists());
    }

    #[test]
    fn test_partial_file_kept_without_remove_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"partial").unwrap();

        let (mut proxy, outcome) = proxy(ProxyMode::ExplicitFile { path: path.clone() });
        proxy.did_receive_response(response(500, &[]));
        proxy.did_complete(Some(TransportError::Cancelled));

        assert_eq!(take(&outcome).unwrap_err().code(), 5001);
        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }

    fn deferred_with(
        destination: impl Fn(Option<&HttpResponse>, Option<&Path>) -> Option<PathBuf> + Send + Sync + 'static,
    ) -> ProxyMode {
        ProxyMode::Deferred {
            destination: Arc::new(destination),
        }
    }

    fn deferred(target: PathBuf) -> ProxyMode {
        deferred_with(move |_, _| Some(target.clone()))
    }

    fn staged_file(dir: &Path, contents: &[u8]) -> PathBuf {
        let staged = dir.join("staged.download");
        std::fs::write(&staged, contents).unwrap();
        staged
    }

    #[test]
    fn test_deferred_creates_directories_and_moves() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/report.pdf");
        let staged = staged_file(dir.path(), b"pdf");

        let (mut proxy, outcome) = proxy_with(
            deferred(target.clone()),
            DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES,
            ServerTrustPolicy::default(),
        );
        proxy.did_receive_response(response(200, &[]));
        proxy.did_write_data(3, Some(3));
        proxy.did_finish_downloading(&staged);
        proxy.did_complete(None);

        assert_eq!(take(&outcome).unwrap().as_file(), Some(target.as_path()));
        assert_eq!(std::fs::read(&target).unwrap(), b"pdf");
        assert!(!staged.exists());
    }

    #[test]
    fn test_deferred_missing_parent_without_option_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing/report.pdf");
        let staged = staged_file(dir.path(), b"pdf");

        let (mut proxy, outcome) = proxy(deferred(target));
        proxy.did_receive_response(response(200, &[]));
        proxy.did_finish_downloading(&staged);
        proxy.did_complete(None);

        assert_eq!(take(&outcome).unwrap_err().code(), 5003);
        assert!(!staged.exists());
    }

    #[test]
    fn test_deferred_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let staged = staged_file(dir.path(), b"x");
        let (mut proxy, outcome) = proxy(deferred_with(|_, _| None));
        proxy.did_receive_response(response(200, &[]));
        proxy.did_finish_downloading(&staged);
        proxy.did_complete(None);
        assert_eq!(take(&outcome).unwrap_err().code(), 5006);
    }

    #[test]
    fn test_deferred_preflight_adopts_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cached.bin");
        std::fs::write(&target, b"cached").unwrap();

        let (mut proxy, outcome) = proxy(deferred(target.clone()));
        assert!(proxy.is_already_downloaded());
        assert_eq!(
            proxy.did_receive_response(response(200, &[])),
            ResponseDisposition::Cancel
        );
        proxy.did_complete(Some(TransportError::Cancelled));

        assert_eq!(take(&outcome).unwrap().as_file(), Some(target.as_path()));
        assert_eq!(std::fs::read(&target).unwrap(), b"cached");
    }

    #[test]
    fn test_deferred_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cached.bin");
        std::fs::write(&target, b"old").unwrap();
        let staged = staged_file(dir.path(), b"new");

        let (mut proxy, outcome) = proxy_with(
            deferred(target.clone()),
            DownloadOptions::REMOVE_EXISTING_FILE,
            ServerTrustPolicy::default(),
        );
        assert!(!proxy.is_already_downloaded());
        proxy.did_receive_response(response(200, &[]));
        proxy.did_finish_downloading(&staged);
        proxy.did_complete(None);

        assert!(take(&outcome).is_ok());
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_upload_progress_reaches_total() {
        let (mut proxy, outcome) = proxy(ProxyMode::Upload { file: None });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        proxy.handlers.upload_progress = Some(Arc::new(move |p: &Progress| sink.lock().push(p.completed())));

        proxy.did_send_body_data(16_384, Some(20_000));
        proxy.did_send_body_data(20_000, Some(20_000));
        proxy.did_receive_response(response(201, &[]));
        proxy.did_complete(None);

        assert_eq!(*seen.lock(), vec![16_384, 20_000]);
        assert_eq!(proxy.task().upload_progress().total(), Some(20_000));
        assert!(take(&outcome).is_ok());
    }

    #[test]
    fn test_unreadable_upload_file_is_an_upload_error() {
        let (mut proxy, outcome) = proxy(ProxyMode::Upload {
            file: Some(PathBuf::from("/gone/photo.jpg")),
        });
        proxy.did_complete(Some(TransportError::Io("No such file or directory".into())));

        let err = take(&outcome).unwrap_err();
        assert_eq!(err.code(), 4002);
        assert!(matches!(
            err,
            HttpError::Upload(UploadError::CannotReadFile { ref path, .. }) if path == Path::new("/gone/photo.jpg")
        ));
    }

    #[test]
    fn test_cancelled_task_reports_cancellation() {
        let (mut proxy, outcome) = proxy(ProxyMode::Data);
        proxy.did_complete(Some(TransportError::Cancelled));
        assert!(take(&outcome).unwrap_err().is_cancelled());
    }
}
