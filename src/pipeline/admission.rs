use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide ceiling on concurrently running sessions.
///
/// Requests at the ceiling are refused immediately; there is no queue.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    active: Arc<AtomicUsize>,
    max: usize,
}

impl AdmissionControl {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Claim a slot. The slot is released when the permit drops, on every
    /// exit path of the session that holds it.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                active: self.active.clone(),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[derive(Debug)]
pub struct AdmissionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
