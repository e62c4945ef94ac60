//! Contexts that caller-facing callbacks run on.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::runtime;

/// A unit of work handed to a [`CallbackQueue`].
pub type Job = Box<dyn FnOnce() + Send>;

/// Where progress and completion handlers are invoked.
///
/// The default is a serial queue: jobs run one at a time, in dispatch order,
/// on a background task. `custom` hands each job to an executor of the
/// caller's choosing, such as a UI event loop.
#[derive(Clone)]
pub enum CallbackQueue {
    /// Run jobs immediately on the dispatching thread.
    Inline,
    /// Run jobs in order on a dedicated task.
    Serial(mpsc::UnboundedSender<Job>),
    /// Pass jobs to a caller-supplied executor.
    Custom(Arc<dyn Fn(Job) + Send + Sync>),
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Inline => "Inline",
            Self::Serial(_) => "Serial",
            Self::Custom(_) => "Custom",
        };
        f.debug_tuple("CallbackQueue").field(&kind).finish()
    }
}

impl CallbackQueue {
    /// Create a serial queue on the current or shared runtime.
    pub fn serial() -> Result<Self> {
        Ok(Self::serial_on(&runtime::handle()?))
    }

    /// Create a serial queue on `handle`.
    pub fn serial_on(handle: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self::Serial(tx)
    }

    /// Create a queue that forwards jobs to `executor`.
    pub fn custom(executor: impl Fn(Job) + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(executor))
    }

    /// Run `job` on this queue.
    ///
    /// If a serial queue's worker has stopped, the job runs inline.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            Self::Inline => job(),
            Self::Serial(tx) => {
                if let Err(rejected) = tx.send(Box::new(job)) {
                    (rejected.0)();
                }
            }
            Self::Custom(executor) => executor(Box::new(job)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn test_inline_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        CallbackQueue::Inline.dispatch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serial_preserves_order() {
        let queue = CallbackQueue::serial().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = seen.clone();
            queue.dispatch(move || seen.lock().push(i));
        }
        let (done_tx, done_rx) = oneshot::channel();
        queue.dispatch(move || {
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_custom_executor_receives_jobs() {
        let parked: Arc<Mutex<Vec<Job>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = parked.clone();
        let queue = CallbackQueue::custom(move |job| sink.lock().push(job));

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        queue.dispatch(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);

        for job in parked.lock().drain(..) {
            job();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
