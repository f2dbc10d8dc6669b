//! Completion engine: decides when a record leaves the tracking structures
//! and moves onto an output queue, and keeps the deferred-completion
//! bookkeeping.

use tracing::debug;

use super::PresentTracker;
use crate::record::{PresentResult, Runtime};
use crate::store::RecordHandle;

/// Why a record sits in the per-process deferral list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferKind {
    /// Final state decided, runtime present stop still outstanding.
    AwaitingStop,
    /// Runtime present stop seen, but no pipeline event classified the
    /// present; it may still be adopted by batched driver work.
    Unclassified,
}

/// One deferred completion: the record and how many further present stops
/// from its process may elapse before the deferral resolves on its own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deferred {
    pub handle: RecordHandle,
    pub remaining: u32,
    pub kind: DeferKind,
}

impl PresentTracker {
    /// A record's final state is set; retire it now, or defer if trailing
    /// events are still expected.
    pub(crate) fn complete_present(&mut self, handle: RecordHandle) {
        let Some(record) = self.store.get(handle) else {
            return;
        };
        debug_assert!(record.final_state != PresentResult::Unknown);

        // A runtime present whose API call has not returned yet still owes
        // us a present stop; hold the record until it arrives or enough
        // further presents pass.
        let stop_pending = record.runtime != Runtime::Other && record.time_in_present == 0;
        if stop_pending {
            let process_id = record.process_id;
            self.park_for_stop(handle);
            self.defer(process_id, handle, DeferKind::AwaitingStop);
            return;
        }

        self.finalize_completion(handle);
    }

    /// Retire a record: out of every index, dependents retired with it,
    /// strictly older same-process records lost, then onto the completed
    /// queue.
    pub(crate) fn finalize_completion(&mut self, handle: RecordHandle) {
        let Some(record) = self.store.get(handle) else {
            return;
        };
        let process_id = record.process_id;
        let start_time = record.start_time;
        let screen_time = record.screen_time;

        self.remove_from_tables(handle, false);
        self.remove_deferral(process_id, handle);

        // Dependents ride along: same screen time, presented unless already
        // discarded.
        let dependents: Vec<RecordHandle> = match self.store.get_mut(handle) {
            Some(record) => record.dependents.drain(..).collect(),
            None => Vec::new(),
        };
        for dep in dependents {
            if let Some(record) = self.store.get_mut(dep) {
                record.screen_time = screen_time;
                if record.final_state == PresentResult::Unknown {
                    record.final_state = PresentResult::Presented;
                }
                self.finalize_completion(dep);
            }
        }

        // Anything older from the same process missed its own completion
        // events. Records still inside a deferral window are left alone;
        // their counters decide.
        let older: Vec<RecordHandle> = self
            .tables
            .by_process
            .get(&process_id)
            .map(|map| map.range(..start_time).map(|(_, &h)| h).collect())
            .unwrap_or_default();
        for old in older {
            if self.deferral_active(process_id, old) {
                continue;
            }
            self.mark_lost(old);
        }

        if let Some(mut record) = self.store.remove(handle) {
            record.completed = true;
            record.completion_deferred = false;
            self.queues().push_completed(record);
        }
    }

    /// Surface a record as lost: impossible state, ring eviction, process
    /// exit, or missed events. Dependents lose their retirement vehicle and
    /// are lost with it.
    pub(crate) fn mark_lost(&mut self, handle: RecordHandle) {
        let Some(record) = self.store.get(handle) else {
            return;
        };
        let process_id = record.process_id;

        self.remove_from_tables(handle, false);
        self.remove_deferral(process_id, handle);

        let dependents: Vec<RecordHandle> = match self.store.get_mut(handle) {
            Some(record) => record.dependents.drain(..).collect(),
            None => Vec::new(),
        };
        for dep in dependents {
            self.mark_lost(dep);
        }

        if let Some(mut record) = self.store.remove(handle) {
            record.lost = true;
            self.queues().push_lost(record);
        }
    }

    /// Remove a record from every tracking index it can appear in. With
    /// `keep_thread`, the thread binding survives so a pending runtime
    /// present stop can still find the record.
    pub(crate) fn remove_from_tables(&mut self, handle: RecordHandle, keep_thread: bool) {
        let Some(record) = self.store.get(handle) else {
            return;
        };
        let thread_id = record.thread_id;
        let batch_thread_id = record.driver_batch_thread_id;
        let process_id = record.process_id;
        let start_time = record.start_time;
        let submit_sequence = record.submit_sequence;
        let token_key = record.win32k_token_key();
        let history_token = record.history_token;
        let legacy_blit_token = record.legacy_blit_token;
        let dxg_context = record.dxg_context;
        let window = record.window;
        let ring_index = record.ring_index;
        let in_dwm_waiting = record.in_dwm_waiting;

        if !keep_thread {
            if self.tables.by_thread.get(&thread_id) == Some(&handle) {
                self.tables.by_thread.remove(&thread_id);
            }
            if batch_thread_id != 0 && self.tables.by_thread.get(&batch_thread_id) == Some(&handle)
            {
                self.tables.by_thread.remove(&batch_thread_id);
            }
        }

        self.tables.remove_process_entry(process_id, start_time);

        if submit_sequence != 0
            && self.tables.by_submit_sequence.get(&submit_sequence) == Some(&handle)
        {
            self.tables.by_submit_sequence.remove(&submit_sequence);
        }
        if let Some(key) = token_key {
            if self.tables.win32k_tokens.get(&key) == Some(&handle) {
                self.tables.win32k_tokens.remove(&key);
            }
        }
        if history_token != 0 && self.tables.history_tokens.get(&history_token) == Some(&handle) {
            self.tables.history_tokens.remove(&history_token);
        }
        if legacy_blit_token != 0
            && self.tables.legacy_blit_tokens.get(&legacy_blit_token) == Some(&handle)
        {
            self.tables.legacy_blit_tokens.remove(&legacy_blit_token);
        }
        if dxg_context != 0 && self.tables.blits_by_context.get(&dxg_context) == Some(&handle) {
            self.tables.blits_by_context.remove(&dxg_context);
        }
        if window != 0 && self.tables.last_window_present.get(&window) == Some(&handle) {
            self.tables.last_window_present.remove(&window);
        }
        if in_dwm_waiting {
            self.tables.remove_from_dwm_waiting(handle);
            if let Some(record) = self.store.get_mut(handle) {
                record.in_dwm_waiting = false;
            }
        }
        if let Some(slot) = ring_index {
            self.tables.ring_release(slot, handle);
            if let Some(record) = self.store.get_mut(handle) {
                record.ring_index = None;
            }
        }
    }

    /// Park a record whose final state is known but whose present stop is
    /// still outstanding: out of every index except the thread binding.
    fn park_for_stop(&mut self, handle: RecordHandle) {
        self.remove_from_tables(handle, true);
        if let Some(record) = self.store.get_mut(handle) {
            record.completion_deferred = true;
        }
    }

    /// Add a record to its process's deferral list.
    pub(crate) fn defer(&mut self, process_id: u32, handle: RecordHandle, kind: DeferKind) {
        let remaining = self.deferral_presents;
        let entries = self.deferred.entry(process_id).or_default();
        if entries.iter().any(|d| d.handle == handle) {
            return;
        }
        debug!(process_id, ?kind, "deferring present completion");
        entries.push(Deferred {
            handle,
            remaining,
            kind,
        });
    }

    /// Drop a record's deferral entry, if any.
    pub(crate) fn remove_deferral(&mut self, process_id: u32, handle: RecordHandle) {
        if let Some(entries) = self.deferred.get_mut(&process_id) {
            entries.retain(|d| d.handle != handle);
            if entries.is_empty() {
                self.deferred.remove(&process_id);
            }
        }
    }

    /// Whether a record still has an unexpired deferral window.
    pub(crate) fn deferral_active(&self, process_id: u32, handle: RecordHandle) -> bool {
        self.deferred
            .get(&process_id)
            .is_some_and(|entries| entries.iter().any(|d| d.handle == handle && d.remaining > 0))
    }

    /// Another present stop happened in this process: advance every deferral
    /// except the stopping record's own. Parked completions whose window
    /// expires are finalized without their stop; unclassified presents merely
    /// lose their sweep exemption.
    pub(crate) fn advance_deferrals(&mut self, process_id: u32, exclude: Option<RecordHandle>) {
        let mut expired: Vec<RecordHandle> = Vec::new();
        if let Some(entries) = self.deferred.get_mut(&process_id) {
            for entry in entries.iter_mut() {
                if Some(entry.handle) == exclude || entry.remaining == 0 {
                    continue;
                }
                entry.remaining -= 1;
                if entry.remaining == 0 && entry.kind == DeferKind::AwaitingStop {
                    expired.push(entry.handle);
                }
            }
        }
        for handle in expired {
            debug!(process_id, "completing deferred present without its stop");
            self.remove_deferral(process_id, handle);
            self.finalize_completion(handle);
        }
    }
}
