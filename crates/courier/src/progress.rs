//! Thread-safe transfer progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const UNKNOWN: u64 = u64::MAX;

type Canceller = Box<dyn Fn() + Send + Sync>;

/// Shared progress of one direction of a transfer.
///
/// `completed` never decreases. `total` is unknown until set, and is raised
/// whenever `completed` would exceed it.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    completed: AtomicU64,
    total: AtomicU64,
    canceller: OnceLock<Canceller>,
}

impl Default for ProgressInner {
    fn default() -> Self {
        Self {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN),
            canceller: OnceLock::new(),
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("completed", &self.completed())
            .field("total", &self.total())
            .finish()
    }
}

impl Progress {
    /// Create progress with nothing completed and an unknown total.
    pub fn new() -> Self {
        Self::default()
    }

    /// Units completed so far.
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Total units, if known.
    pub fn total(&self) -> Option<u64> {
        match self.inner.total.load(Ordering::Acquire) {
            UNKNOWN => None,
            total => Some(total),
        }
    }

    /// Set the total. A total below the completed count is raised to it.
    pub fn set_total(&self, total: Option<u64>) {
        let value = match total {
            Some(total) => total.max(self.completed()).min(UNKNOWN - 1),
            None => UNKNOWN,
        };
        self.inner.total.store(value, Ordering::Release);
    }

    /// Move `completed` forward to `value`. Smaller values are ignored.
    pub fn advance_to(&self, value: u64) {
        let previous = self.inner.completed.fetch_max(value, Ordering::AcqRel);
        self.raise_total(previous.max(value));
    }

    /// Add `delta` to `completed`.
    pub fn advance_by(&self, delta: u64) {
        let previous = self.inner.completed.fetch_add(delta, Ordering::AcqRel);
        self.raise_total(previous.saturating_add(delta));
    }

    fn raise_total(&self, completed: u64) {
        let total = self.inner.total.load(Ordering::Acquire);
        if total != UNKNOWN && total < completed {
            self.inner.total.fetch_max(completed, Ordering::AcqRel);
        }
    }

    /// Fraction of the transfer done, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.snapshot().fraction()
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            bytes_transferred: self.completed(),
            total_bytes: self.total(),
        }
    }

    /// Cancel the task that owns this progress.
    pub fn cancel(&self) {
        if let Some(canceller) = self.inner.canceller.get() {
            canceller();
        }
    }

    pub(crate) fn set_canceller(&self, canceller: impl Fn() + Send + Sync + 'static) {
        let _ = self.inner.canceller.set(Box::new(canceller));
    }
}

/// A point-in-time copy of a [`Progress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Number of bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total number of bytes, if known.
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// Get the progress as a fraction (0.0 to 1.0), if total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.bytes_transferred as f64 / total as f64
            }
        })
    }

    /// Get the progress as a percentage (0 to 100), if total is known.
    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0).min(100.0) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_completed_never_decreases() {
        let progress = Progress::new();
        progress.advance_to(100);
        progress.advance_to(40);
        assert_eq!(progress.completed(), 100);
        progress.advance_by(5);
        assert_eq!(progress.completed(), 105);
    }

    #[test]
    fn test_total_tracks_completed() {
        let progress = Progress::new();
        assert_eq!(progress.total(), None);

        progress.set_total(Some(10));
        progress.advance_by(25);
        assert_eq!(progress.total(), Some(25));

        progress.set_total(Some(5));
        assert_eq!(progress.total(), Some(25));
    }

    #[test]
    fn test_snapshot_fraction() {
        let progress = Progress::new();
        progress.set_total(Some(1500));
        progress.advance_to(1000);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.bytes_transferred, 1000);
        assert_eq!(snapshot.percent(), Some(66));

        let empty = TransferProgress {
            bytes_transferred: 0,
            total_bytes: Some(0),
        };
        assert_eq!(empty.fraction(), Some(1.0));
        assert_eq!(TransferProgress::default().fraction(), None);
    }

    #[test]
    fn test_cancel_invokes_owner() {
        let progress = Progress::new();
        progress.cancel();

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        progress.set_canceller(move || flag.store(true, Ordering::SeqCst));
        progress.clone().cancel();
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
