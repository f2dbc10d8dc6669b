//! The present-tracking state machine.
//!
//! Every handler locates or creates the relevant [`PresentRecord`], advances
//! its state, and hands it to the completion engine (`complete.rs`) once a
//! terminal condition is reached. Handlers are total: malformed or
//! out-of-sequence events are dropped, and records found in impossible states
//! are surfaced as lost rather than propagated as errors.
//!
//! All methods here run on the single processing thread; only the output
//! queues and the process filter are shared.

mod complete;

pub use complete::DeferKind;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::providers::{mmio_flip_flags, FlipEntryStatus, QueuePacketType, TokenState};
use crate::queues::{OutputQueues, ProcessFilter};
use crate::record::{EventHeader, PresentMode, PresentRecord, PresentResult, ProcessEvent, Runtime};
use crate::store::{RecordHandle, RecordStore};
use crate::tables::TrackingTables;

pub(crate) use complete::Deferred;

/// Tunables for the tracker.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Whether display-path events are being consumed. When off, presents
    /// complete at their runtime present stop.
    pub track_display: bool,
    /// Capacity of the all-presents eviction ring.
    pub ring_capacity: usize,
    /// How many further present stops from the same process resolve a
    /// deferred completion or an unclassified present.
    pub deferral_presents: u32,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            track_display: true,
            ring_capacity: 4096,
            deferral_presents: 3,
        }
    }
}

/// The present-tracking core: record store, correlation indices, deferral
/// bookkeeping, and the per-event transition logic.
pub struct PresentTracker {
    pub(crate) store: RecordStore,
    pub(crate) tables: TrackingTables,
    /// Per-process deferred completions: (record, remaining present stops).
    pub(crate) deferred: HashMap<u32, Vec<Deferred>>,

    track_display: bool,
    filtered_events: bool,
    deferral_presents: u32,

    /// Compositor process, learned from its scheduling and present-history
    /// pulls. A flip is attributed to the compositor only when both this and
    /// the scheduled thread match; thread ids alone are reusable across
    /// processes.
    dwm_process_id: u32,
    /// Compositor thread with a scheduled present; its next flip adopts the
    /// waiting presents.
    dwm_present_thread_id: u32,

    queues: Arc<OutputQueues>,
    filter: Arc<ProcessFilter>,
}

impl PresentTracker {
    pub fn new(opts: TrackerOptions, queues: Arc<OutputQueues>, filter: Arc<ProcessFilter>) -> Self {
        Self {
            store: RecordStore::new(),
            tables: TrackingTables::new(opts.ring_capacity),
            deferred: HashMap::new(),
            track_display: opts.track_display,
            filtered_events: false,
            deferral_presents: opts.deferral_presents,
            dwm_process_id: 0,
            dwm_present_thread_id: 0,
            queues,
            filter,
        }
    }

    // --- Control surface ---

    pub fn set_track_display(&mut self, enabled: bool) {
        self.track_display = enabled;
    }

    pub fn track_display(&self) -> bool {
        self.track_display
    }

    /// Declare whether the session delivers only the consumed event set.
    /// In a filtered session an unrecognized event is an anomaly and is
    /// counted as dropped; an unfiltered session carries unrelated provider
    /// chatter that is skipped without counting.
    pub fn set_filtered_events(&mut self, enabled: bool) {
        self.filtered_events = enabled;
    }

    pub fn filtered_events(&self) -> bool {
        self.filtered_events
    }

    pub fn add_tracked_process(&self, process_id: u32) {
        self.filter.set_enabled(true);
        self.filter.add(process_id);
    }

    pub fn remove_tracked_process(&self, process_id: u32) {
        self.filter.remove(process_id);
    }

    pub fn is_process_tracked(&self, process_id: u32) -> bool {
        self.filter.is_tracked(process_id)
    }

    /// Number of in-flight presents.
    pub fn live_presents(&self) -> usize {
        self.store.len()
    }

    // --- Runtime present start/stop ---

    /// A runtime present call began on `hdr.thread_id`.
    pub fn runtime_present_start(
        &mut self,
        hdr: EventHeader,
        runtime: Runtime,
        swap_chain: u64,
        flags: u32,
        sync_interval: i32,
        is_test_present: bool,
    ) {
        if !self.filter.is_tracked(hdr.process_id) {
            return;
        }
        // Fullscreen-state probes never produce presentation work.
        if is_test_present {
            return;
        }

        // A start on a thread that still owns an in-flight record means we
        // missed that record's remaining events.
        if let Some(&prior) = self.tables.by_thread.get(&hdr.thread_id) {
            debug!(thread_id = hdr.thread_id, "present start on busy thread");
            self.mark_lost(prior);
        }

        let mut record = PresentRecord::new(hdr, runtime);
        record.swap_chain = swap_chain;
        record.present_flags = flags;
        record.sync_interval = sync_interval;

        let handle = self.store.insert(record);
        self.track_present(handle, hdr);
    }

    /// The runtime present call on `hdr.thread_id` returned.
    ///
    /// `succeeded` is false when the runtime reported a failure, in which
    /// case the present produced no work and is discarded immediately.
    pub fn runtime_present_stop(&mut self, hdr: EventHeader, runtime: Runtime, succeeded: bool) {
        let process_id = hdr.process_id;
        let current = self.tables.by_thread.get(&hdr.thread_id).copied();

        if let Some(handle) = current {
            let mut deferred_done = false;
            let mut unclassified = false;
            if let Some(record) = self.store.get_mut(handle) {
                record.runtime = runtime;
                record.time_in_present = hdr.timestamp.saturating_sub(record.start_time);
                deferred_done = record.completion_deferred;
                unclassified =
                    record.mode == PresentMode::Unknown && !record.seen_dxgk_present;
            }
            self.tables.by_thread.remove(&hdr.thread_id);

            if !succeeded {
                if let Some(record) = self.store.get_mut(handle) {
                    record.final_state = PresentResult::Discarded;
                }
                self.complete_present(handle);
            } else if deferred_done {
                // The final state was decided earlier; this stop was the
                // last expected event.
                self.remove_deferral(process_id, handle);
                self.finalize_completion(handle);
            } else if !self.track_display {
                if let Some(record) = self.store.get_mut(handle) {
                    record.final_state = PresentResult::Presented;
                }
                self.complete_present(handle);
            } else if unclassified {
                // No pipeline event claimed this present yet. It may be
                // batched onto a driver thread; give it a bounded number of
                // further presents before treating it as lost.
                self.defer(process_id, handle, DeferKind::Unclassified);
            }

            self.advance_deferrals(process_id, Some(handle));
        } else {
            self.advance_deferrals(process_id, None);
        }
    }

    // --- Graphics kernel handlers ---

    /// Blit classification. Redirected blits head for composition; direct
    /// blits go to the front buffer.
    pub fn blit(&mut self, hdr: EventHeader, window: u64, redirected: bool) {
        let Some(handle) = self.find_or_create(hdr) else {
            return;
        };
        let Some(record) = self.store.get_mut(handle) else {
            return;
        };
        record.window = window;
        if redirected {
            record.mode = PresentMode::ComposedCopyCpuGdi;
            record.supports_tearing = false;
        } else {
            record.mode = PresentMode::HardwareLegacyCopyToFrontBuffer;
            record.supports_tearing = true;
        }
    }

    /// The kernel optimized the blit out; the present produces no work.
    pub fn blit_cancel(&mut self, hdr: EventHeader) {
        if let Some(&handle) = self.tables.by_thread.get(&hdr.thread_id) {
            if let Some(record) = self.store.get_mut(handle) {
                record.final_state = PresentResult::Discarded;
            }
            self.complete_present(handle);
        }
    }

    /// Flip classification. `flip_interval` is negative when the event does
    /// not carry one (multi-plane overlay flips).
    pub fn flip(&mut self, hdr: EventHeader, flip_interval: i32, mmio: bool) {
        let Some(handle) = self.find_or_create(hdr) else {
            return;
        };

        {
            let Some(record) = self.store.get_mut(handle) else {
                return;
            };
            if record.mode == PresentMode::HardwareLegacyFlip {
                // Overlay flips emit one event per plane; only the first
                // classifies.
                return;
            }
            if record.mode != PresentMode::Unknown {
                // A flip for a present already classified down another path
                // means the stream is inconsistent.
                debug!(mode = %record.mode, "flip on an already classified present");
                self.mark_lost(handle);
                return;
            }
            record.mmio = mmio;
            record.mode = PresentMode::HardwareLegacyFlip;
            if flip_interval >= 0 {
                record.sync_interval = flip_interval;
            }
            if !mmio {
                record.supports_tearing = true;
            }
        }

        // The compositor's own flip carries every present that was waiting
        // on it; they retire when this flip completes.
        if self.dwm_present_thread_id != 0
            && hdr.thread_id == self.dwm_present_thread_id
            && hdr.process_id == self.dwm_process_id
        {
            let waiting: Vec<RecordHandle> = self.tables.waiting_for_dwm.drain(..).collect();
            for w in &waiting {
                if let Some(record) = self.store.get_mut(*w) {
                    record.in_dwm_waiting = false;
                }
            }
            if let Some(record) = self.store.get_mut(handle) {
                record.dependents.extend(waiting);
            }
            self.dwm_present_thread_id = 0;
        }
    }

    /// A flip-model present was promoted to an independent flip.
    pub fn independent_flip(&mut self, hdr: EventHeader, submit_sequence: u32, flip_interval: i32) {
        let _ = hdr;
        let Some(handle) = self.find_by_submit_sequence(submit_sequence) else {
            return;
        };
        if let Some(record) = self.store.get_mut(handle) {
            if record.mode == PresentMode::ComposedFlip {
                record.mode = PresentMode::HardwareIndependentFlip;
            }
            if flip_interval >= 0 {
                record.sync_interval = flip_interval;
            }
        }
    }

    /// A packet was submitted to a kernel queue.
    pub fn queue_submit(
        &mut self,
        hdr: EventHeader,
        packet_type: QueuePacketType,
        submit_sequence: u32,
        context: u64,
        present_packet: bool,
    ) {
        // A pending blit on this context is resolved by the next packet: no
        // present-history token observed means nothing went to the
        // compositor, so the blit targeted the front buffer.
        if let Some(&blit) = self.tables.blits_by_context.get(&context) {
            let fullscreen = self.store.get(blit).is_some_and(|r| {
                r.mode == PresentMode::HardwareLegacyCopyToFrontBuffer && r.history_token == 0
            });
            self.tables.blits_by_context.remove(&context);
            if let Some(record) = self.store.get_mut(blit) {
                record.dxg_context = 0;
                if fullscreen {
                    record.seen_dxgk_present = true;
                }
            }
            if fullscreen {
                let ready = self.store.get(blit).map_or(0, |r| r.screen_time);
                if ready != 0 {
                    self.complete_present(blit);
                }
            }
        }

        let is_present_packet = present_packet
            || matches!(
                packet_type,
                QueuePacketType::MmioFlipCommandBuffer | QueuePacketType::SoftwareCommandBuffer
            );
        if !is_present_packet {
            return;
        }

        let Some(&handle) = self.tables.by_thread.get(&hdr.thread_id) else {
            return;
        };
        let Some(record) = self.store.get_mut(handle) else {
            return;
        };
        if record.submit_sequence != 0 {
            return;
        }
        record.submit_sequence = submit_sequence;
        let bind_blit_context = record.mode == PresentMode::HardwareLegacyCopyToFrontBuffer;
        if bind_blit_context {
            record.dxg_context = context;
        }

        if let Some(old) = self
            .tables
            .by_submit_sequence
            .insert(submit_sequence, handle)
        {
            if old != handle {
                debug!(submit_sequence, "submit sequence rebound to a new present");
            }
        }
        if bind_blit_context {
            self.tables.blits_by_context.insert(context, handle);
        }
    }

    /// A kernel queue packet finished. For blits and non-MMIO legacy flips
    /// this is the only completion signal: ready and screen time coincide.
    pub fn queue_complete(&mut self, hdr: EventHeader, submit_sequence: u32) {
        let Some(handle) = self.find_by_submit_sequence(submit_sequence) else {
            return;
        };

        let mut complete_now = false;
        if let Some(record) = self.store.get_mut(handle) {
            let direct_path = record.mode == PresentMode::HardwareLegacyCopyToFrontBuffer
                || (record.mode == PresentMode::HardwareLegacyFlip && !record.mmio);
            if !direct_path {
                return;
            }
            record.ready_time = hdr.timestamp;
            record.screen_time = hdr.timestamp;
            record.final_state = PresentResult::Presented;
            // A blit still waiting on fullscreen-vs-windowed disambiguation
            // holds its completion until the context or kernel present
            // resolves it.
            complete_now = record.mode != PresentMode::HardwareLegacyCopyToFrontBuffer
                || record.seen_dxgk_present;
        }
        if complete_now {
            self.complete_present(handle);
        }
    }

    /// The flip was programmed to hardware. Ready time; immediate flips are
    /// on screen now.
    pub fn mmio_flip(&mut self, hdr: EventHeader, submit_sequence: u32, flags: u32) {
        let Some(handle) = self.find_by_submit_sequence(submit_sequence) else {
            return;
        };
        let mut complete_now = false;
        if let Some(record) = self.store.get_mut(handle) {
            if record.ready_time == 0 {
                record.ready_time = hdr.timestamp;
            }
            if flags & mmio_flip_flags::FLIP_IMMEDIATE != 0 {
                record.final_state = PresentResult::Presented;
                record.screen_time = hdr.timestamp;
                record.supports_tearing = true;
                complete_now = record.mode == PresentMode::HardwareLegacyFlip;
            }
        }
        if complete_now {
            self.complete_present(handle);
        }
    }

    /// Multi-plane-overlay flip. The entry status tells whether the flip
    /// waits for a sync interrupt or completed immediately.
    pub fn mmio_flip_mpo(
        &mut self,
        hdr: EventHeader,
        submit_sequence: u32,
        entry_status: Option<FlipEntryStatus>,
    ) {
        let Some(handle) = self.find_by_submit_sequence(submit_sequence) else {
            return;
        };
        let mut complete_now = false;
        if let Some(record) = self.store.get_mut(handle) {
            if record.ready_time == 0 {
                record.ready_time = hdr.timestamp;
            }
            let Some(status) = entry_status else {
                return;
            };
            if status != FlipEntryStatus::FlipWaitVSync {
                record.supports_tearing = true;
            }
            match status {
                FlipEntryStatus::FlipWaitVSync | FlipEntryStatus::FlipWaitHSync => {
                    // Screen time arrives with the matching sync DPC.
                }
                other => {
                    record.final_state = PresentResult::Presented;
                    if other == FlipEntryStatus::FlipWaitComplete {
                        record.screen_time = hdr.timestamp;
                    }
                    complete_now = record.mode == PresentMode::HardwareLegacyFlip;
                }
            }
        }
        if complete_now {
            self.complete_present(handle);
        }
    }

    /// Sync interrupt: the flip for this submit sequence is on screen.
    pub fn sync_dpc(&mut self, hdr: EventHeader, submit_sequence: u32) {
        self.sync_dpc_plane(hdr, submit_sequence, false);
    }

    /// One plane of a multi-plane sync interrupt. More than one valid plane
    /// means the composition happened in hardware.
    pub fn sync_dpc_mpo(&mut self, hdr: EventHeader, submit_sequence: u32, multi_plane: bool) {
        self.sync_dpc_plane(hdr, submit_sequence, multi_plane);
    }

    fn sync_dpc_plane(&mut self, hdr: EventHeader, submit_sequence: u32, multi_plane: bool) {
        let Some(handle) = self.find_by_submit_sequence(submit_sequence) else {
            return;
        };
        let mut complete_now = false;
        if let Some(record) = self.store.get_mut(handle) {
            if multi_plane
                && matches!(
                    record.mode,
                    PresentMode::HardwareIndependentFlip | PresentMode::ComposedFlip
                )
            {
                record.mode = PresentMode::HardwareComposedIndependentFlip;
            }
            if record.final_state != PresentResult::Presented {
                record.screen_time = hdr.timestamp;
                record.final_state = PresentResult::Presented;
            }
            complete_now = matches!(
                record.mode,
                PresentMode::HardwareLegacyFlip
                    | PresentMode::HardwareIndependentFlip
                    | PresentMode::HardwareComposedIndependentFlip
            );
        }
        if complete_now {
            self.complete_present(handle);
        }
    }

    /// The kernel present call finished on this thread.
    pub fn kernel_present(&mut self, hdr: EventHeader, window: u64) {
        let Some(&handle) = self.tables.by_thread.get(&hdr.thread_id) else {
            return;
        };
        let mut unbind_thread = false;
        let mut complete_now = false;
        if let Some(record) = self.store.get_mut(handle) {
            record.seen_dxgk_present = true;
            if record.window == 0 {
                record.window = window;
            }
            // Kernel-only presents and batched submissions are done with this
            // thread once the kernel present returns.
            unbind_thread =
                record.runtime == Runtime::Other || record.thread_id != hdr.thread_id;
            complete_now = record.mode == PresentMode::HardwareLegacyCopyToFrontBuffer
                && record.screen_time != 0;
        }
        if unbind_thread {
            self.tables.by_thread.remove(&hdr.thread_id);
        }
        if complete_now {
            self.complete_present(handle);
        }
    }

    /// A present-history token was assigned to the thread's present.
    /// `known_mode` carries the classification implied by the submission
    /// model, or `Unknown` when the model does not decide one.
    pub fn present_history(
        &mut self,
        hdr: EventHeader,
        token: u64,
        token_data: u64,
        known_mode: PresentMode,
    ) {
        let mut handle = match self.find_or_create(hdr) {
            Some(h) => h,
            None => return,
        };

        if self.store.get(handle).is_some_and(|r| r.history_token != 0) {
            // Two tokens for one present: the record is in an impossible
            // state. Surface it and start over.
            self.mark_lost(handle);
            handle = match self.find_or_create(hdr) {
                Some(h) => h,
                None => return,
            };
        }

        // The token starts the downstream (composition) leg; any display
        // state deduced so far belongs to the abandoned leg.
        let mut unbind_context = 0u64;
        if let Some(record) = self.store.get_mut(handle) {
            record.ready_time = 0;
            record.screen_time = 0;
            record.supports_tearing = false;
            record.final_state = PresentResult::Unknown;
            record.history_token = token;

            match known_mode {
                PresentMode::Unknown => {
                    if record.mode == PresentMode::HardwareLegacyCopyToFrontBuffer {
                        record.mode = PresentMode::ComposedCopyGpuGdi;
                    }
                }
                PresentMode::ComposedCopyGpuGdi => {
                    record.mode = PresentMode::ComposedCopyGpuGdi;
                }
                PresentMode::ComposedCopyCpuGdi => {
                    record.mode = PresentMode::ComposedCopyCpuGdi;
                    record.legacy_blit_token = token_data;
                }
                PresentMode::ComposedCompositionAtlas => {
                    record.mode = PresentMode::ComposedCompositionAtlas;
                }
                _ => {}
            }

            if record.dxg_context != 0 {
                // A token means the blit went to the compositor after all.
                unbind_context = record.dxg_context;
                record.dxg_context = 0;
            }
        }

        if unbind_context != 0
            && self.tables.blits_by_context.get(&unbind_context) == Some(&handle)
        {
            self.tables.blits_by_context.remove(&unbind_context);
        }

        if let Some(&old) = self.tables.history_tokens.get(&token) {
            if old != handle {
                self.mark_lost(old);
            }
        }
        self.tables.history_tokens.insert(token, handle);

        if token_data != 0 && known_mode == PresentMode::ComposedCopyCpuGdi {
            if let Some(&old) = self.tables.legacy_blit_tokens.get(&token_data) {
                if old != handle {
                    self.mark_lost(old);
                }
            }
            self.tables.legacy_blit_tokens.insert(token_data, handle);
        }
    }

    /// The present-history token was propagated to the compositor: the GPU
    /// work is done and the compositor now owns the buffer.
    pub fn present_history_propagate(&mut self, hdr: EventHeader, token: u64) {
        let Some(&handle) = self.tables.history_tokens.get(&token) else {
            return;
        };
        self.tables.history_tokens.remove(&token);

        let mut window = 0u64;
        let mut park_for_dwm = false;
        if let Some(record) = self.store.get_mut(handle) {
            if record.ready_time == 0 {
                record.ready_time = hdr.timestamp;
            }
            record.dwm_notified = true;
            match record.mode {
                PresentMode::ComposedCompositionAtlas => park_for_dwm = true,
                PresentMode::ComposedFlip if !record.seen_win32k_events => park_for_dwm = true,
                PresentMode::ComposedCopyGpuGdi => window = record.window,
                _ => {}
            }
            if park_for_dwm {
                record.in_dwm_waiting = true;
            }
        }

        if park_for_dwm {
            self.tables.waiting_for_dwm.push_back(handle);
        } else if window != 0 {
            // Becomes the window's latest composition subject; an earlier
            // binding is merely superseded and retires with a later present.
            self.tables.last_window_present.insert(window, handle);
        }
    }

    // --- Win32k composition tokens ---

    /// The composition triple identifies this present to the compositor.
    pub fn token_composition_surface(
        &mut self,
        hdr: EventHeader,
        surface_luid: u64,
        present_count: u64,
        bind_id: u64,
    ) {
        let Some(handle) = self.find_or_create(hdr) else {
            return;
        };
        if let Some(record) = self.store.get_mut(handle) {
            record.mode = PresentMode::ComposedFlip;
            record.seen_win32k_events = true;
            record.composition_surface_luid = surface_luid;
            record.win32k_present_count = present_count;
            record.win32k_bind_id = bind_id;
        }
        let key = (surface_luid, present_count, bind_id);
        if let Some(&old) = self.tables.win32k_tokens.get(&key) {
            if old != handle {
                self.mark_lost(old);
            }
        }
        self.tables.win32k_tokens.insert(key, handle);
    }

    /// A flip-model token advanced through the composition state machine.
    #[allow(clippy::too_many_arguments)]
    pub fn token_state_changed(
        &mut self,
        hdr: EventHeader,
        key: (u64, u64, u64),
        state: TokenState,
        independent_flip: bool,
        dest_width: u32,
        dest_height: u32,
    ) {
        let _ = hdr;
        let Some(&handle) = self.tables.win32k_tokens.get(&key) else {
            return;
        };

        match state {
            TokenState::InFrame => {
                let mut window = 0u64;
                if let Some(record) = self.store.get_mut(handle) {
                    record.seen_in_frame = true;
                    record.dwm_notified = true;
                    if dest_width != 0 {
                        record.dest_width = dest_width;
                        record.dest_height = dest_height;
                    }
                    if independent_flip && record.mode == PresentMode::ComposedFlip {
                        record.mode = PresentMode::HardwareIndependentFlip;
                    }
                    window = record.window;
                }
                if window != 0 {
                    match self.tables.last_window_present.get(&window).copied() {
                        Some(prev) if prev != handle => {
                            // A newer present entered the frame before the
                            // previous one was shown; the old one will never
                            // reach the screen.
                            if let Some(record) = self.store.get_mut(prev) {
                                if record.final_state == PresentResult::Unknown {
                                    record.final_state = PresentResult::Discarded;
                                }
                            }
                            self.complete_present(prev);
                            self.tables.last_window_present.insert(window, handle);
                        }
                        Some(_) => {}
                        None => {
                            self.tables.last_window_present.insert(window, handle);
                        }
                    }
                }
            }
            TokenState::Confirmed => {
                let window = self.store.get(handle).map_or(0, |r| r.window);
                if window != 0
                    && self.tables.last_window_present.get(&window) == Some(&handle)
                {
                    self.tables.last_window_present.remove(&window);
                }
            }
            TokenState::Retired => {
                // Screen time comes from the compositor's own present.
            }
            TokenState::Discarded => {
                self.tables.win32k_tokens.remove(&key);
                let unresolved = self
                    .store
                    .get(handle)
                    .is_some_and(|r| r.final_state == PresentResult::Unknown);
                if unresolved {
                    if let Some(record) = self.store.get_mut(handle) {
                        record.final_state = PresentResult::Discarded;
                    }
                    self.complete_present(handle);
                }
            }
        }
    }

    // --- Compositor ---

    /// The compositor pulled the pending present history: everything parked
    /// per window is now waiting on the compositor's own present.
    pub fn dwm_get_present_history(&mut self, hdr: EventHeader) {
        self.dwm_process_id = hdr.process_id;
        let mut bindings: Vec<(u64, RecordHandle)> = self
            .tables
            .last_window_present
            .iter()
            .map(|(&w, &h)| (w, h))
            .collect();
        bindings.sort_by_key(|&(w, _)| w);
        self.tables.last_window_present.clear();

        for (_, handle) in bindings {
            let Some(record) = self.store.get_mut(handle) else {
                continue;
            };
            record.dwm_notified = true;
            record.in_dwm_waiting = true;
            self.tables.waiting_for_dwm.push_back(handle);
        }
    }

    /// The compositor scheduled its own present on this thread.
    pub fn dwm_schedule_present(&mut self, hdr: EventHeader) {
        self.dwm_process_id = hdr.process_id;
        self.dwm_present_thread_id = hdr.thread_id;
    }

    /// A compositor flip-chain event binds a legacy-blit present to its
    /// window.
    pub fn dwm_flip_chain(&mut self, hdr: EventHeader, flip_chain: u32, serial: u32, window: u64) {
        let _ = hdr;
        let token = (u64::from(flip_chain) << 32) | u64::from(serial);
        let Some(&handle) = self.tables.legacy_blit_tokens.get(&token) else {
            return;
        };
        self.tables.legacy_blit_tokens.remove(&token);

        if let Some(record) = self.store.get_mut(handle) {
            record.window = window;
            record.dwm_notified = true;
        }
        self.tables.last_window_present.insert(window, handle);
    }

    // --- Process lifecycle ---

    /// A process started or stopped. Stops force every in-flight present of
    /// that process onto the lost queue, in start order.
    pub fn process_event(
        &mut self,
        timestamp: u64,
        process_id: u32,
        image_name: String,
        is_start: bool,
    ) {
        self.queues.push_process_event(ProcessEvent {
            image_name,
            timestamp,
            process_id,
            is_start,
        });

        if is_start {
            return;
        }

        let mut doomed: Vec<(u64, RecordHandle)> = Vec::new();
        if let Some(map) = self.tables.by_process.get(&process_id) {
            doomed.extend(map.iter().map(|(&ts, &h)| (ts, h)));
        }
        if let Some(entries) = self.deferred.get(&process_id) {
            for entry in entries {
                if let Some(record) = self.store.get(entry.handle) {
                    doomed.push((record.start_time, entry.handle));
                }
            }
        }
        doomed.sort_by_key(|&(ts, _)| ts);
        doomed.dedup_by_key(|&mut (_, h)| h);

        for (_, handle) in doomed {
            self.mark_lost(handle);
        }
        self.deferred.remove(&process_id);
    }

    // --- Lookup and tracking ---

    pub(crate) fn find_by_submit_sequence(&self, submit_sequence: u32) -> Option<RecordHandle> {
        self.tables
            .by_submit_sequence
            .get(&submit_sequence)
            .copied()
    }

    /// Locate the present this event belongs to: the record bound to the
    /// thread, an unclassified present of the process adopted for batched
    /// driver work, or a new kernel-originated record.
    fn find_or_create(&mut self, hdr: EventHeader) -> Option<RecordHandle> {
        if let Some(&handle) = self.tables.by_thread.get(&hdr.thread_id) {
            return Some(handle);
        }

        if let Some(map) = self.tables.by_process.get(&hdr.process_id) {
            let store = &self.store;
            let candidate = map
                .values()
                .copied()
                .find(|&h| {
                    store.get(h).is_some_and(|r| {
                        r.mode == PresentMode::Unknown
                            && !r.seen_dxgk_present
                            && r.driver_batch_thread_id == 0
                    })
                });
            if let Some(handle) = candidate {
                if let Some(record) = self.store.get_mut(handle) {
                    record.driver_batch_thread_id = hdr.thread_id;
                }
                self.tables.by_thread.insert(hdr.thread_id, handle);
                return Some(handle);
            }
        }

        if !self.filter.is_tracked(hdr.process_id) {
            return None;
        }

        // No runtime present observed; the kernel event implies one.
        let handle = self.store.insert(PresentRecord::new(hdr, Runtime::Other));
        self.track_present(handle, hdr);
        Some(handle)
    }

    /// Insert a fresh record into the ring, the per-process ordered map, and
    /// the thread index. A live record displaced from its ring slot is lost.
    fn track_present(&mut self, handle: RecordHandle, hdr: EventHeader) {
        let (slot, evicted) = self.tables.ring_insert(handle);
        if let Some(record) = self.store.get_mut(handle) {
            record.ring_index = Some(slot);
        }
        if let Some(old) = evicted {
            if old != handle {
                debug!("ring capacity reached, evicting oldest in-flight present");
                self.mark_lost(old);
            }
        }

        self.tables
            .process_presents(hdr.process_id)
            .insert(hdr.timestamp, handle);
        self.tables.by_thread.insert(hdr.thread_id, handle);
    }

    pub(crate) fn queues(&self) -> &Arc<OutputQueues> {
        &self.queues
    }
}

#[cfg(test)]
mod tests;
