//! Transport backed by a shared reqwest client.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_LENGTH, ETAG, IF_RANGE, LAST_MODIFIED, PRAGMA, RANGE};
use parking_lot::Mutex;
use reqwest::redirect::Policy;
use reqwest::tls::TlsInfo;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use url::Url;

use super::{
    BodyDelivery, ChallengeDisposition, ResponseDisposition, ResumeData, TaskId, TaskKind,
    TaskSpec, Transport, TransportEvent, TransportEvents, TransportTask, UploadSource,
};
use crate::error::{RequestSerializationError, Result, TransportError};
use crate::http::{CachePolicy, HttpResponse, RequestBody, RequestDescriptor};
use crate::runtime;
use crate::tls::TlsConfig;

/// Upload bodies are reported in steps of this many bytes.
const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Configuration for [`ReqwestTransport`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Client-wide timeout. Request descriptors carry their own timeout,
    /// which takes precedence.
    pub timeout: Option<Duration>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Whether to follow redirects.
    pub follow_redirects: bool,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Whether to enable cookie storage.
    pub cookies_enabled: bool,
    /// Default user agent.
    pub user_agent: Option<String>,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Directory for staged downloads. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            follow_redirects: true,
            max_redirects: 10,
            cookies_enabled: true,
            user_agent: Some(format!("courier/{} (Rust)", env!("CARGO_PKG_VERSION"))),
            proxy: None,
            tls: TlsConfig::default(),
            temp_dir: None,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client-wide timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable redirect following.
    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Set the maximum number of redirects to follow.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Disable cookie storage.
    pub fn no_cookies(mut self) -> Self {
        self.cookies_enabled = false;
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set a proxy URL.
    pub fn proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy = Some(proxy_url.into());
        self
    }

    /// Set the TLS configuration.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Stage downloads in `dir`.
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().tls_info(true);

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        builder = if self.follow_redirects {
            builder.redirect(Policy::limited(self.max_redirects))
        } else {
            builder.redirect(Policy::none())
        };
        if self.cookies_enabled {
            builder = builder.cookie_store(true);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(proxy_url) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|_| RequestSerializationError::BadUrl {
                url: proxy_url.clone(),
            })?;
            builder = builder.proxy(proxy);
        }
        builder = self.tls.apply(builder)?;

        builder
            .build()
            .map_err(|e| TransportError::from(e).into())
    }
}

/// A [`Transport`] that runs tasks on a shared reqwest client.
///
/// Clones share the connection pool.
#[derive(Clone)]
pub struct ReqwestTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    client: reqwest::Client,
    config: TransportConfig,
    handle: Handle,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    /// Create a transport with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(TransportConfig::default())
    }

    /// Create a transport with the given configuration.
    pub fn with_config(config: TransportConfig) -> Result<Self> {
        let client = config.build_client()?;
        let handle = runtime::handle()?;
        tracing::debug!(target: "courier::transport", ?config, "Created reqwest transport");
        Ok(Self {
            inner: Arc::new(TransportInner {
                client,
                config,
                handle,
            }),
        })
    }

    /// Get the transport's configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }
}

impl Transport for ReqwestTransport {
    fn create_task(&self, spec: TaskSpec, events: TransportEvents) -> Result<Arc<dyn TransportTask>> {
        let id = spec.id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let staging = Arc::new(Mutex::new(Staging::default()));
        let driver = Driver {
            client: self.inner.client.clone(),
            spec,
            events: events.clone(),
            staging: staging.clone(),
            temp_dir: self
                .inner
                .config
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        };
        tracing::trace!(target: "courier::transport", task = %id, "Created task");

        Ok(Arc::new(ReqwestTask {
            id,
            handle: self.inner.handle.clone(),
            pending: Mutex::new(Some((driver, cancel_rx))),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            staging,
            events,
        }))
    }
}

/// Download state shared between a running driver and its task handle.
#[derive(Default)]
struct Staging {
    url: Option<Url>,
    headers: Vec<(String, String)>,
    temp_path: Option<PathBuf>,
    offset: u64,
    etag: Option<String>,
    last_modified: Option<String>,
    total_expected: Option<u64>,
    finished: bool,
    keep_file: bool,
}

struct ReqwestTask {
    id: TaskId,
    handle: Handle,
    pending: Mutex<Option<(Driver, oneshot::Receiver<()>)>>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
    staging: Arc<Mutex<Staging>>,
    events: TransportEvents,
}

impl TransportTask for ReqwestTask {
    fn resume(&self) {
        let Some((driver, cancel_rx)) = self.pending.lock().take() else {
            return;
        };
        tracing::debug!(target: "courier::transport", task = %self.id, "Starting task");
        self.handle.spawn(driver.run(cancel_rx));
    }

    fn cancel(&self) {
        let never_started = self.pending.lock().take().is_some();
        if never_started {
            tracing::debug!(target: "courier::transport", task = %self.id, "Cancelled before start");
            self.events.complete(Some(TransportError::Cancelled));
            return;
        }
        if let Some(tx) = self.cancel_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    fn cancel_producing_resume_data(&self) -> Option<ResumeData> {
        let resume = {
            let mut staging = self.staging.lock();
            match (&staging.url, &staging.temp_path) {
                (Some(url), Some(temp_path)) if !staging.finished => {
                    let data = ResumeData {
                        url: url.clone(),
                        headers: staging.headers.clone(),
                        temp_path: temp_path.clone(),
                        offset: staging.offset,
                        etag: staging.etag.clone(),
                        last_modified: staging.last_modified.clone(),
                        total_expected: staging.total_expected,
                    };
                    staging.keep_file = true;
                    Some(data)
                }
                _ => None,
            }
        };
        self.cancel();
        resume
    }
}

struct Driver {
    client: reqwest::Client,
    spec: TaskSpec,
    events: TransportEvents,
    staging: Arc<Mutex<Staging>>,
    temp_dir: PathBuf,
}

impl Driver {
    async fn run(self, cancel_rx: oneshot::Receiver<()>) {
        let result = tokio::select! {
            result = self.execute() => result,
            Ok(()) = cancel_rx => Err(TransportError::Cancelled),
        };

        if let Err(error) = &result {
            tracing::debug!(target: "courier::transport", task = %self.spec.id, %error, "Task failed");
            self.discard_staging().await;
        }
        self.events.complete(result.err());
    }

    async fn execute(&self) -> std::result::Result<(), TransportError> {
        let request = self.build_request().await?;
        let mut response = request.send().await?;

        let peer_certificate = response
            .extensions()
            .get::<TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(Bytes::copy_from_slice);
        if let Some(certificate) = peer_certificate {
            let host = response.url().host_str().unwrap_or_default().to_string();
            let disposition = self.events.challenge(host.clone(), vec![certificate]).await;
            if disposition == ChallengeDisposition::Cancel {
                return Err(TransportError::ServerTrustRejected { host });
            }
        }

        let meta = HttpResponse::from_reqwest(&response);
        tracing::debug!(
            target: "courier::transport",
            task = %self.spec.id,
            status = meta.status(),
            "Received response"
        );
        if self.events.response(meta.clone()).await == ResponseDisposition::Cancel {
            return Err(TransportError::Cancelled);
        }

        match self.spec.delivery {
            BodyDelivery::Chunks => {
                while let Some(chunk) = response.chunk().await? {
                    self.events.send(TransportEvent::DataReceived(chunk));
                }
                Ok(())
            }
            BodyDelivery::TempFile => self.stage_to_file(&mut response, &meta).await,
        }
    }

    async fn build_request(&self) -> std::result::Result<reqwest::RequestBuilder, TransportError> {
        if self.spec.kind == TaskKind::Resume {
            let resume = self
                .spec
                .resume
                .as_ref()
                .ok_or_else(|| TransportError::Other("resume task without resume data".into()))?;
            let mut builder = self.client.get(resume.url.clone());
            for (name, value) in &resume.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = builder.header(RANGE, format!("bytes={}-", resume.offset));
            if let Some(validator) = resume.validator() {
                builder = builder.header(IF_RANGE, validator);
            }
            self.record_request(resume.url.clone(), resume.headers.clone());
            return Ok(builder);
        }

        let request = self
            .spec
            .request
            .as_ref()
            .ok_or_else(|| TransportError::Other("task without a request".into()))?;
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        self.record_request(request.url().clone(), headers);

        let mut builder = self
            .client
            .request(request.method().to_reqwest(), request.url().clone())
            .timeout(request.timeout())
            .headers(request.headers().clone());
        builder = apply_cache_policy(builder, request);

        if self.spec.kind == TaskKind::Upload {
            let data = match &self.spec.upload {
                Some(UploadSource::Bytes(bytes)) => bytes.clone(),
                Some(UploadSource::File(path)) => Bytes::from(tokio::fs::read(path).await?),
                None => body_bytes(request.body()).await?.unwrap_or_default(),
            };
            builder = builder
                .header(CONTENT_LENGTH, data.len())
                .body(progress_body(data, self.events.clone()));
        } else if let Some(data) = body_bytes(request.body()).await? {
            builder = builder.body(data);
        }
        Ok(builder)
    }

    fn record_request(&self, url: Url, headers: Vec<(String, String)>) {
        let mut staging = self.staging.lock();
        staging.url = Some(url);
        staging.headers = headers;
    }

    async fn stage_to_file(
        &self,
        response: &mut reqwest::Response,
        meta: &HttpResponse,
    ) -> std::result::Result<(), TransportError> {
        let resumed = self.spec.resume.as_ref().filter(|_| meta.status() == 206);

        let (mut file, path, offset) = match resumed {
            Some(resume) => {
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&resume.temp_path)
                    .await?;
                file.set_len(resume.offset).await?;
                file.seek(SeekFrom::End(0)).await?;
                (file, resume.temp_path.clone(), resume.offset)
            }
            None => {
                if let Some(stale) = &self.spec.resume {
                    let _ = tokio::fs::remove_file(&stale.temp_path).await;
                }
                let staged = tempfile::Builder::new()
                    .prefix("courier-")
                    .suffix(".download")
                    .tempfile_in(&self.temp_dir)?;
                let (file, path) = staged.keep().map_err(|e| TransportError::from(e.error))?;
                (tokio::fs::File::from_std(file), path, 0)
            }
        };

        let total_expected = match resumed {
            Some(_) => meta
                .content_range_total()
                .or_else(|| meta.expected_content_length().map(|len| offset + len)),
            None => meta.expected_content_length(),
        };
        {
            let mut staging = self.staging.lock();
            staging.temp_path = Some(path.clone());
            staging.offset = offset;
            staging.total_expected = total_expected;
            staging.etag = meta
                .header(ETAG.as_str())
                .map(str::to_string)
                .or_else(|| resumed.and_then(|r| r.etag.clone()));
            staging.last_modified = meta
                .header(LAST_MODIFIED.as_str())
                .map(str::to_string)
                .or_else(|| resumed.and_then(|r| r.last_modified.clone()));
        }

        if resumed.is_some() {
            tracing::debug!(target: "courier::transport", task = %self.spec.id, offset, "Resuming download");
            self.events.send(TransportEvent::DownloadResumed {
                offset,
                total_expected,
            });
        }

        let mut written = offset;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.staging.lock().offset = written;
            self.events.send(TransportEvent::DownloadProgress {
                bytes_written: chunk.len() as u64,
                total_written: written,
                total_expected,
            });
        }
        file.flush().await?;
        drop(file);

        self.staging.lock().finished = true;
        self.events
            .send(TransportEvent::FinishedDownloading { location: path });
        Ok(())
    }

    async fn discard_staging(&self) {
        let path = {
            let mut staging = self.staging.lock();
            if staging.keep_file || staging.finished {
                None
            } else {
                staging.temp_path.take()
            }
        };
        if let Some(path) = path {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

async fn body_bytes(body: &RequestBody) -> std::result::Result<Option<Bytes>, TransportError> {
    Ok(match body {
        RequestBody::None => None,
        RequestBody::Bytes(bytes) => Some(bytes.clone()),
        RequestBody::Params(text) => Some(Bytes::from(text.clone())),
        RequestBody::File(path) => Some(Bytes::from(tokio::fs::read(path).await?)),
    })
}

/// Stream `data` in fixed steps, reporting each step as sent.
fn progress_body(data: Bytes, events: TransportEvents) -> reqwest::Body {
    let total = data.len() as u64;
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    let stream = futures_util::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        events.send(TransportEvent::BodySent {
            bytes_sent: chunk.len() as u64,
            total_sent: sent,
            total_expected: Some(total),
        });
        Ok::<_, std::io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

fn apply_cache_policy(
    builder: reqwest::RequestBuilder,
    request: &RequestDescriptor,
) -> reqwest::RequestBuilder {
    if request.headers().contains_key(CACHE_CONTROL) {
        return builder;
    }
    match request.cache_policy() {
        CachePolicy::UseProtocolCachePolicy => builder,
        CachePolicy::ReloadIgnoringLocalCacheData => builder
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache"),
        CachePolicy::ReturnCacheDataElseLoad => builder.header(CACHE_CONTROL, "max-stale"),
        CachePolicy::ReturnCacheDataDontLoad => builder.header(CACHE_CONTROL, "only-if-cached"),
    }
}
