//! The entities produced by the tracker: in-flight present records and
//! process lifecycle events.

use std::collections::VecDeque;
use std::fmt;

use crate::store::RecordHandle;

/// Timestamp/process/thread header common to every event, copied out of the
/// raw event before handler dispatch.
#[derive(Debug, Clone, Copy)]
pub struct EventHeader {
    pub timestamp: u64,
    pub process_id: u32,
    pub thread_id: u32,
}

/// Which presentation path a present took. Determines the event sequence
/// required to consider the present complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Unknown,
    HardwareLegacyFlip,
    HardwareLegacyCopyToFrontBuffer,
    HardwareIndependentFlip,
    ComposedFlip,
    ComposedCopyGpuGdi,
    ComposedCopyCpuGdi,
    ComposedCompositionAtlas,
    HardwareComposedIndependentFlip,
}

impl PresentMode {
    /// Canonical label used in output rows.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Other",
            Self::HardwareLegacyFlip => "Hardware: Legacy Flip",
            Self::HardwareLegacyCopyToFrontBuffer => "Hardware: Legacy Copy to front buffer",
            Self::HardwareIndependentFlip => "Hardware: Independent Flip",
            Self::ComposedFlip => "Composed: Flip",
            Self::ComposedCopyGpuGdi => "Composed: Copy with GPU GDI",
            Self::ComposedCopyCpuGdi => "Composed: Copy with CPU GDI",
            Self::ComposedCompositionAtlas => "Composed: Composition Atlas",
            Self::HardwareComposedIndependentFlip => "Hardware Composed: Independent Flip",
        }
    }
}

impl fmt::Display for PresentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Unknown,
    Presented,
    Discarded,
    Error,
}

/// Which runtime issued the present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Dxgi,
    D3d9,
    Other,
}

impl Runtime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dxgi => "DXGI",
            Self::D3d9 => "D3D9",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight (or finished) present. Pure data; all state transitions
/// happen in the tracker.
#[derive(Debug)]
pub struct PresentRecord {
    // Identity and timing.
    pub start_time: u64,
    pub process_id: u32,
    pub thread_id: u32,
    /// Duration of the runtime present call, once its stop has been seen.
    pub time_in_present: u64,
    /// When the last GPU work for this present finished.
    pub ready_time: u64,
    /// When the present became visible.
    pub screen_time: u64,

    // Present call parameters.
    pub swap_chain: u64,
    pub sync_interval: i32,
    pub present_flags: u32,

    // Correlation keys. Each is nonzero/set only while the matching tracking
    // index points back at this record.
    pub dxg_context: u64,
    pub window: u64,
    pub composition_surface_luid: u64,
    pub win32k_present_count: u64,
    pub win32k_bind_id: u64,
    pub history_token: u64,
    pub legacy_blit_token: u64,
    pub submit_sequence: u32,
    pub ring_index: Option<usize>,

    // Deduced along the pipeline.
    pub dest_width: u32,
    pub dest_height: u32,
    pub driver_batch_thread_id: u32,
    pub runtime: Runtime,
    pub mode: PresentMode,
    pub final_state: PresentResult,
    pub supports_tearing: bool,
    pub mmio: bool,
    pub seen_dxgk_present: bool,
    pub seen_win32k_events: bool,
    pub dwm_notified: bool,
    pub seen_in_frame: bool,
    pub completion_deferred: bool,
    pub completed: bool,
    pub lost: bool,
    /// Set while the record sits in the waiting-for-compositor deque, so
    /// retirement does not have to scan it fruitlessly.
    pub in_dwm_waiting: bool,

    /// Presents that retire together with this one (the compositor's
    /// previous subjects, riding on its own fullscreen present).
    pub dependents: VecDeque<RecordHandle>,
}

impl PresentRecord {
    pub fn new(hdr: EventHeader, runtime: Runtime) -> Self {
        Self {
            start_time: hdr.timestamp,
            process_id: hdr.process_id,
            thread_id: hdr.thread_id,
            time_in_present: 0,
            ready_time: 0,
            screen_time: 0,
            swap_chain: 0,
            sync_interval: -1,
            present_flags: 0,
            dxg_context: 0,
            window: 0,
            composition_surface_luid: 0,
            win32k_present_count: 0,
            win32k_bind_id: 0,
            history_token: 0,
            legacy_blit_token: 0,
            submit_sequence: 0,
            ring_index: None,
            dest_width: 0,
            dest_height: 0,
            driver_batch_thread_id: 0,
            runtime,
            mode: PresentMode::Unknown,
            final_state: PresentResult::Unknown,
            supports_tearing: false,
            mmio: false,
            seen_dxgk_present: false,
            seen_win32k_events: false,
            dwm_notified: false,
            seen_in_frame: false,
            completion_deferred: false,
            completed: false,
            lost: false,
            in_dwm_waiting: false,
            dependents: VecDeque::new(),
        }
    }

    /// Whether the output row should be flagged as dropped.
    pub fn dropped(&self) -> bool {
        matches!(
            self.final_state,
            PresentResult::Discarded | PresentResult::Error
        )
    }

    /// The composition-token triple, if assigned.
    pub fn win32k_token_key(&self) -> Option<(u64, u64, u64)> {
        if self.seen_win32k_events {
            Some((
                self.composition_surface_luid,
                self.win32k_present_count,
                self.win32k_bind_id,
            ))
        } else {
            None
        }
    }

    /// Whether the present call was observed to be issued from a thread
    /// other than the one that submitted the work to the kernel.
    pub fn was_batched(&self) -> bool {
        self.driver_batch_thread_id != 0
    }
}

/// A process start or stop observed on the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub image_name: String,
    pub timestamp: u64,
    pub process_id: u32,
    pub is_start: bool,
}
