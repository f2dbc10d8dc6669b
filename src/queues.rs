//! Hand-off from the processing thread to the consumer thread.
//!
//! Three single-producer/single-consumer buffers with lock-guarded
//! swap-and-drain: completed presents, lost presents, and process events.
//! The producer holds each lock only long enough to push; the consumer swaps
//! the whole buffer out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::record::{PresentRecord, ProcessEvent};

/// Completed/lost/process-event queues shared with the consumer.
#[derive(Default)]
pub struct OutputQueues {
    completed: Mutex<Vec<PresentRecord>>,
    lost: Mutex<Vec<PresentRecord>>,
    process_events: Mutex<Vec<ProcessEvent>>,
}

impl OutputQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completed(&self, record: PresentRecord) {
        self.completed.lock().push(record);
    }

    pub fn push_lost(&self, record: PresentRecord) {
        self.lost.lock().push(record);
    }

    pub fn push_process_event(&self, event: ProcessEvent) {
        self.process_events.lock().push(event);
    }

    /// Drain every completed present, in completion order.
    pub fn take_completed(&self) -> Vec<PresentRecord> {
        std::mem::take(&mut *self.completed.lock())
    }

    /// Drain every lost present, in the order loss was detected.
    pub fn take_lost(&self) -> Vec<PresentRecord> {
        std::mem::take(&mut *self.lost.lock())
    }

    /// Drain every pending process event.
    pub fn take_process_events(&self) -> Vec<ProcessEvent> {
        std::mem::take(&mut *self.process_events.lock())
    }
}

/// The set of process ids the consumer restricts attention to.
///
/// Reads happen on every event; writes only from the control surface, so a
/// reader-writer lock fits. Filtering is off until explicitly enabled, in
/// which case an empty set tracks nothing.
#[derive(Default)]
pub struct ProcessFilter {
    enabled: AtomicBool,
    tracked: RwLock<HashSet<u32>>,
}

impl ProcessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn add(&self, process_id: u32) {
        self.tracked.write().insert(process_id);
    }

    pub fn remove(&self, process_id: u32) {
        self.tracked.write().remove(&process_id);
    }

    /// Whether events for this process should be tracked.
    pub fn is_tracked(&self, process_id: u32) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.tracked.read().contains(&process_id)
    }
}
