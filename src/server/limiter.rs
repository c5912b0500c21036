// Admission limiter module
// Bounded, non-blocking concurrency gate consulted on every accepted connection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-capacity counting semaphore with no queueing.
///
/// Callers that fail to acquire are expected to reject or back off; nothing
/// ever waits inside the limiter.
#[derive(Debug)]
pub struct AdmissionLimiter {
    capacity: usize,
    in_use: AtomicUsize,
}

impl AdmissionLimiter {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Take one slot if available.
    pub fn try_acquire(&self) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Return one slot. Releasing more than was acquired is refused and
    /// reported instead of wrapping the counter.
    pub fn release(&self) -> bool {
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            tracing::warn!(capacity = self.capacity, "admission release without a matching acquire");
        }
        released
    }

    /// Take one slot as a guard that releases on drop.
    pub fn try_acquire_token(self: &Arc<Self>) -> Option<AdmissionToken> {
        self.try_acquire().then(|| AdmissionToken {
            limiter: Arc::clone(self),
        })
    }
}

/// One occupied slot of an [`AdmissionLimiter`].
#[derive(Debug)]
pub struct AdmissionToken {
    limiter: Arc<AdmissionLimiter>,
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
