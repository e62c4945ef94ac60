//! Caller-facing task handles.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::http::RequestDescriptor;
use crate::progress::Progress;
use crate::transport::{ResumeData, TaskId, TaskKind, TransportTask};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not started.
    Suspended,
    /// Started.
    Running,
    /// Cancellation requested; completion is pending.
    Canceling,
    /// The completion handler has been scheduled.
    Completed,
}

/// A handle to one network operation.
///
/// Cloning is cheap; all clones refer to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: TaskId,
    kind: TaskKind,
    request: Option<RequestDescriptor>,
    transport: Arc<dyn TransportTask>,
    state: Mutex<TaskState>,
    upload_progress: Progress,
    download_progress: Progress,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        kind: TaskKind,
        request: Option<RequestDescriptor>,
        transport: Arc<dyn TransportTask>,
    ) -> Self {
        let inner = Arc::new(TaskInner {
            id,
            kind,
            request,
            transport,
            state: Mutex::new(TaskState::Suspended),
            upload_progress: Progress::new(),
            download_progress: Progress::new(),
        });
        for progress in [&inner.upload_progress, &inner.download_progress] {
            let owner: Weak<TaskInner> = Arc::downgrade(&inner);
            progress.set_canceller(move || {
                if let Some(inner) = owner.upgrade() {
                    Task { inner }.cancel();
                }
            });
        }
        Self { inner }
    }

    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// What the task does.
    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    /// The request, absent for tasks resumed from a token.
    pub fn request(&self) -> Option<&RequestDescriptor> {
        self.inner.request.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    /// Bytes sent.
    pub fn upload_progress(&self) -> &Progress {
        &self.inner.upload_progress
    }

    /// Bytes received.
    pub fn download_progress(&self) -> &Progress {
        &self.inner.download_progress
    }

    /// Start the task. Has no effect once started.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != TaskState::Suspended {
                return;
            }
            *state = TaskState::Running;
        }
        tracing::trace!(target: "courier::session", task = %self.id(), "Resuming task");
        self.inner.transport.resume();
    }

    /// Cancel the task. It completes with a cancelled error.
    pub fn cancel(&self) {
        if self.begin_cancel() {
            self.inner.transport.cancel();
        }
    }

    /// Cancel a download and keep what was received so far.
    ///
    /// The returned data can be encoded with [`ResumeData::to_bytes`] and
    /// passed to `Session::resume_download_task`.
    pub fn cancel_by_producing_resume_data(&self) -> Option<ResumeData> {
        if self.begin_cancel() {
            self.inner.transport.cancel_producing_resume_data()
        } else {
            None
        }
    }

    fn begin_cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        match *state {
            TaskState::Suspended | TaskState::Running => {
                *state = TaskState::Canceling;
                true
            }
            TaskState::Canceling | TaskState::Completed => false,
        }
    }

    pub(crate) fn mark_completed(&self) {
        *self.inner.state.lock() = TaskState::Completed;
    }
}
