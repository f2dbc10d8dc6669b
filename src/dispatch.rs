//! Event dispatch: routes each raw event to its tracker handler based on
//! provider GUID and event id, decoding fields through the metadata resolver.
//!
//! Decoding failures never propagate; the event is skipped and counted, per
//! the "drain faster than production" contract.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::metadata::{DecodeError, MetadataResolver, RawEvent};
use crate::providers::{
    self, FlipEntryStatus, PresentModel, QueuePacketType, TokenState, DXGI_PRESENT_TEST,
};
use crate::record::{EventHeader, PresentMode, Runtime};
use crate::tracker::PresentTracker;

// D3D9 present flags, translated into the common (DXGI) flag space.
const D3D9_PRESENT_DONOTWAIT: u32 = 0x0000_0001;
const D3D9_PRESENT_DONOTFLIP: u32 = 0x0000_0004;
const D3D9_PRESENT_FLIPRESTART: u32 = 0x0000_0008;
const D3D9_PRESENT_FORCEIMMEDIATE: u32 = 0x0000_0100;
const DXGI_PRESENT_DO_NOT_SEQUENCE: u32 = 0x0000_0002;
const DXGI_PRESENT_RESTART: u32 = 0x0000_0004;
const DXGI_PRESENT_DO_NOT_WAIT: u32 = 0x0000_0008;

/// Present returned "still drawing" under DONOTWAIT; not a failure.
const D3DERR_WASSTILLDRAWING: u32 = 0x8876_021C;

/// Lock-free dispatch counters, reported on session teardown.
#[derive(Default)]
pub struct DispatchStats {
    handled: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub handled: u64,
    pub dropped: u64,
    pub decode_failures: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            handled: self.handled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Routes raw events into the present tracker.
pub struct Dispatcher {
    metadata: MetadataResolver,
    tracker: PresentTracker,
    first_timestamp: Option<u64>,
    stats: DispatchStats,
}

enum Routed {
    Handled,
    Unknown,
}

impl Dispatcher {
    pub fn new(metadata: MetadataResolver, tracker: PresentTracker) -> Self {
        Self {
            metadata,
            tracker,
            first_timestamp: None,
            stats: DispatchStats::default(),
        }
    }

    /// Timestamp of the first event seen; the session-start reference in
    /// replay mode.
    pub fn first_timestamp(&self) -> Option<u64> {
        self.first_timestamp
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    pub fn tracker(&self) -> &PresentTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut PresentTracker {
        &mut self.tracker
    }

    /// Handler contract with the session: the buffer is not retained past
    /// this call.
    pub fn on_event(&mut self, event: &RawEvent<'_>) {
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(event.timestamp);
        }

        let track_display = self.tracker.track_display();
        let routed = match event.provider {
            providers::DXGI_PROVIDER => self.handle_dxgi(event),
            providers::D3D9_PROVIDER => self.handle_d3d9(event),
            providers::DXGKRNL_PROVIDER => self.handle_dxgk(event, track_display),
            providers::WIN32K_PROVIDER if track_display => self.handle_win32k(event),
            providers::DWM_PROVIDER if track_display => self.handle_dwm(event),
            providers::NT_PROCESS_PROVIDER => self.handle_nt_process(event),
            providers::METADATA_PROVIDER => self
                .metadata
                .handle_schema_event(event)
                .map(|()| Routed::Handled),
            _ => Ok(Routed::Unknown),
        };

        match routed {
            Ok(Routed::Handled) => {
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Routed::Unknown) => {
                // A filtered session promised to deliver only the consumed
                // event set, so anything unrecognized is worth counting. An
                // unfiltered session carries unrelated provider chatter that
                // is simply skipped.
                if self.tracker.filtered_events() {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                debug!(provider = %event.provider, id = event.id, error = %err, "skipping undecodable event");
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn header(event: &RawEvent<'_>) -> EventHeader {
        EventHeader {
            timestamp: event.timestamp,
            process_id: event.process_id,
            thread_id: event.thread_id,
        }
    }

    fn handle_dxgi(&mut self, event: &RawEvent<'_>) -> Result<Routed, DecodeError> {
        let hdr = Self::header(event);
        match event.id {
            providers::dxgi::PRESENT_START | providers::dxgi::PRESENT_MPO_START => {
                let reader = self.metadata.reader(event)?;
                let swap_chain = reader.u64("pIDXGISwapChain")?;
                let flags = reader.u32("Flags")?;
                let sync_interval = reader.i32("SyncInterval")?;
                let is_test = flags & DXGI_PRESENT_TEST != 0;
                self.tracker.runtime_present_start(
                    hdr,
                    Runtime::Dxgi,
                    swap_chain,
                    flags,
                    sync_interval,
                    is_test,
                );
                Ok(Routed::Handled)
            }
            providers::dxgi::PRESENT_STOP | providers::dxgi::PRESENT_MPO_STOP => {
                let result = self.metadata.reader(event)?.u32("Result")?;
                let succeeded = result >> 31 == 0;
                self.tracker
                    .runtime_present_stop(hdr, Runtime::Dxgi, succeeded);
                Ok(Routed::Handled)
            }
            _ => Ok(Routed::Unknown),
        }
    }

    fn handle_d3d9(&mut self, event: &RawEvent<'_>) -> Result<Routed, DecodeError> {
        let hdr = Self::header(event);
        match event.id {
            providers::d3d9::PRESENT_START => {
                let reader = self.metadata.reader(event)?;
                let swap_chain = reader.u64("pSwapchain")?;
                let d3d9_flags = reader.u32("Flags")?;

                let mut flags = 0u32;
                if d3d9_flags & D3D9_PRESENT_DONOTFLIP != 0 {
                    flags |= DXGI_PRESENT_DO_NOT_SEQUENCE;
                }
                if d3d9_flags & D3D9_PRESENT_DONOTWAIT != 0 {
                    flags |= DXGI_PRESENT_DO_NOT_WAIT;
                }
                if d3d9_flags & D3D9_PRESENT_FLIPRESTART != 0 {
                    flags |= DXGI_PRESENT_RESTART;
                }
                let sync_interval = if d3d9_flags & D3D9_PRESENT_FORCEIMMEDIATE != 0 {
                    0
                } else {
                    -1
                };

                self.tracker.runtime_present_start(
                    hdr,
                    Runtime::D3d9,
                    swap_chain,
                    flags,
                    sync_interval,
                    false,
                );
                Ok(Routed::Handled)
            }
            providers::d3d9::PRESENT_STOP => {
                let result = self.metadata.reader(event)?.u32("Result")?;
                let succeeded = result >> 31 == 0 || result == D3DERR_WASSTILLDRAWING;
                self.tracker
                    .runtime_present_stop(hdr, Runtime::D3d9, succeeded);
                Ok(Routed::Handled)
            }
            _ => Ok(Routed::Unknown),
        }
    }

    fn handle_dxgk(
        &mut self,
        event: &RawEvent<'_>,
        track_display: bool,
    ) -> Result<Routed, DecodeError> {
        use providers::dxgk;

        // Without display tracking only present-history submissions are
        // consumed, matching the reduced provider subscription.
        if !track_display && event.id != dxgk::PRESENT_HISTORY_START {
            return Ok(Routed::Unknown);
        }

        let hdr = Self::header(event);
        match event.id {
            dxgk::BLIT => {
                let reader = self.metadata.reader(event)?;
                let window = reader.u64("hwnd")?;
                let redirected = reader.bool32("bRedirectedPresent")?;
                self.tracker.blit(hdr, window, redirected);
                Ok(Routed::Handled)
            }
            dxgk::BLIT_CANCEL => {
                self.tracker.blit_cancel(hdr);
                Ok(Routed::Handled)
            }
            dxgk::FLIP => {
                let reader = self.metadata.reader(event)?;
                let flip_interval = reader.i32("FlipInterval")?;
                let mmio = reader.bool32("MMIOFlip")?;
                self.tracker.flip(hdr, flip_interval, mmio);
                Ok(Routed::Handled)
            }
            dxgk::FLIP_MPO => {
                // Multi-plane flips carry no interval and are always MMIO.
                self.tracker.flip(hdr, -1, true);
                Ok(Routed::Handled)
            }
            dxgk::INDEPENDENT_FLIP => {
                let reader = self.metadata.reader(event)?;
                let submit_sequence = reader.u32("SubmitSequence")?;
                let flip_interval = reader.i32("FlipInterval")?;
                self.tracker
                    .independent_flip(hdr, submit_sequence, flip_interval);
                Ok(Routed::Handled)
            }
            dxgk::QUEUE_PACKET_START => {
                let reader = self.metadata.reader(event)?;
                let packet_type_raw = reader.u32("PacketType")?;
                let submit_sequence = reader.u32("SubmitSequence")?;
                let context = reader.u64("hContext")?;
                let present = reader.bool32("bPresent")?;
                let Some(packet_type) = QueuePacketType::from_u32(packet_type_raw) else {
                    return Ok(Routed::Unknown);
                };
                self.tracker
                    .queue_submit(hdr, packet_type, submit_sequence, context, present);
                Ok(Routed::Handled)
            }
            dxgk::QUEUE_PACKET_STOP => {
                let submit_sequence = self.metadata.reader(event)?.u32("SubmitSequence")?;
                self.tracker.queue_complete(hdr, submit_sequence);
                Ok(Routed::Handled)
            }
            dxgk::MMIO_FLIP => {
                let reader = self.metadata.reader(event)?;
                let fence = reader.u64("FlipSubmitSequence")?;
                let flags = reader.u32("Flags")?;
                self.tracker.mmio_flip(hdr, (fence >> 32) as u32, flags);
                Ok(Routed::Handled)
            }
            dxgk::MMIO_FLIP_MPO => {
                let reader = self.metadata.reader(event)?;
                let fence = reader.u64("FlipSubmitSequence")?;
                let valid = reader.bool32("FlipEntryStatusAfterFlipValid")?;
                let status_raw = reader.u32("FlipEntryStatusAfterFlip")?;
                let status = if valid {
                    FlipEntryStatus::from_u32(status_raw)
                } else {
                    None
                };
                self.tracker.mmio_flip_mpo(hdr, (fence >> 32) as u32, status);
                Ok(Routed::Handled)
            }
            dxgk::VSYNC_DPC => {
                let fence = self.metadata.reader(event)?.u64("FlipFenceId")?;
                let submit_sequence = (fence >> 32) as u32;
                if submit_sequence != 0 {
                    self.tracker.sync_dpc(hdr, submit_sequence);
                }
                Ok(Routed::Handled)
            }
            dxgk::VSYNC_DPC_MPO | dxgk::HSYNC_DPC_MPO => {
                let reader = self.metadata.reader(event)?;
                let plane_count = reader.u32("PlaneCount")? as usize;
                let multi_plane = plane_count > 1;
                for plane in 0..plane_count {
                    let fence = reader.u64_at("FlipSubmitSequence", plane)?;
                    let submit_sequence = (fence >> 32) as u32;
                    if submit_sequence != 0 {
                        self.tracker.sync_dpc_mpo(hdr, submit_sequence, multi_plane);
                    }
                }
                Ok(Routed::Handled)
            }
            dxgk::PRESENT => {
                let window = self.metadata.reader(event)?.u64("hWindow")?;
                self.tracker.kernel_present(hdr, window);
                Ok(Routed::Handled)
            }
            dxgk::PRESENT_HISTORY_START | dxgk::PRESENT_HISTORY_DETAILED_START => {
                let reader = self.metadata.reader(event)?;
                let token = reader.u64("Token")?;
                let model_raw = reader.u32("Model")?;
                let model = PresentModel::from_u32(model_raw);

                // GDI redirection never reaches the display pipeline.
                if model == Some(PresentModel::RedirectedGdi) {
                    return Ok(Routed::Handled);
                }

                let (known_mode, token_data) = match model {
                    Some(PresentModel::RedirectedBlt) => (PresentMode::ComposedCopyGpuGdi, 0),
                    Some(PresentModel::RedirectedVistaBlt) => {
                        let data = if event.id == dxgk::PRESENT_HISTORY_START {
                            reader.u64("TokenData")?
                        } else {
                            0
                        };
                        (PresentMode::ComposedCopyCpuGdi, data)
                    }
                    Some(PresentModel::RedirectedComposition) => {
                        (PresentMode::ComposedCompositionAtlas, 0)
                    }
                    _ => (PresentMode::Unknown, 0),
                };
                self.tracker
                    .present_history(hdr, token, token_data, known_mode);
                Ok(Routed::Handled)
            }
            dxgk::PRESENT_HISTORY_INFO => {
                let token = self.metadata.reader(event)?.u64("Token")?;
                self.tracker.present_history_propagate(hdr, token);
                Ok(Routed::Handled)
            }
            _ => Ok(Routed::Unknown),
        }
    }

    fn handle_win32k(&mut self, event: &RawEvent<'_>) -> Result<Routed, DecodeError> {
        use providers::win32k;

        let hdr = Self::header(event);
        match event.id {
            win32k::TOKEN_COMPOSITION_SURFACE_OBJECT => {
                let reader = self.metadata.reader(event)?;
                let luid = reader.u64("CompositionSurfaceLuid")?;
                let present_count = reader.u64("PresentCount")?;
                let bind_id = reader.u64("BindId")?;
                self.tracker
                    .token_composition_surface(hdr, luid, present_count, bind_id);
                Ok(Routed::Handled)
            }
            win32k::TOKEN_STATE_CHANGED => {
                let reader = self.metadata.reader(event)?;
                let key = (
                    reader.u64("CompositionSurfaceLuid")?,
                    reader.u64("PresentCount")?,
                    reader.u64("BindId")?,
                );
                let Some(state) = TokenState::from_u32(reader.u32("NewState")?) else {
                    return Ok(Routed::Unknown);
                };
                let independent_flip = reader.bool32("IndependentFlip")?;
                let dest_width = reader.u32("DestWidth")?;
                let dest_height = reader.u32("DestHeight")?;
                self.tracker.token_state_changed(
                    hdr,
                    key,
                    state,
                    independent_flip,
                    dest_width,
                    dest_height,
                );
                Ok(Routed::Handled)
            }
            _ => Ok(Routed::Unknown),
        }
    }

    fn handle_dwm(&mut self, event: &RawEvent<'_>) -> Result<Routed, DecodeError> {
        use providers::dwm;

        let hdr = Self::header(event);
        match event.id {
            dwm::GET_PRESENT_HISTORY => {
                self.tracker.dwm_get_present_history(hdr);
                Ok(Routed::Handled)
            }
            dwm::SCHEDULE_PRESENT_START => {
                self.tracker.dwm_schedule_present(hdr);
                Ok(Routed::Handled)
            }
            dwm::FLIP_CHAIN_PENDING | dwm::FLIP_CHAIN_COMPLETE | dwm::FLIP_CHAIN_DIRTY => {
                let reader = self.metadata.reader(event)?;
                let flip_chain = reader.u32("ulFlipChain")?;
                let serial = reader.u32("ulSerialNumber")?;
                let window = reader.u64("hwnd")?;
                self.tracker.dwm_flip_chain(hdr, flip_chain, serial, window);
                Ok(Routed::Handled)
            }
            _ => Ok(Routed::Unknown),
        }
    }

    fn handle_nt_process(&mut self, event: &RawEvent<'_>) -> Result<Routed, DecodeError> {
        use providers::nt_process;

        let is_start = matches!(
            event.opcode,
            nt_process::OPCODE_START | nt_process::OPCODE_RUNDOWN_START
        );
        let is_stop = event.opcode == nt_process::OPCODE_STOP;
        if !is_start && !is_stop {
            // Rundown stops describe processes still alive at capture end;
            // nothing to track.
            return Ok(if event.opcode == nt_process::OPCODE_RUNDOWN_STOP {
                Routed::Handled
            } else {
                Routed::Unknown
            });
        }

        let lookup = RawEvent { id: 0, ..*event };
        let reader = self.metadata.reader(&lookup)?;
        let process_id = reader.u32("ProcessId")?;
        let image_name = reader.ansi_string("ImageFileName")?;

        self.tracker
            .process_event(event.timestamp, process_id, image_name, is_start);
        Ok(Routed::Handled)
    }
}
