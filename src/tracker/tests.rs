use std::sync::Arc;

use super::{PresentTracker, TrackerOptions};
use crate::providers::{mmio_flip_flags, QueuePacketType, TokenState};
use crate::queues::{OutputQueues, ProcessFilter};
use crate::record::{EventHeader, PresentMode, PresentResult, Runtime};

struct Fixture {
    tracker: PresentTracker,
    queues: Arc<OutputQueues>,
}

fn fixture() -> Fixture {
    fixture_with(TrackerOptions::default())
}

fn fixture_with(opts: TrackerOptions) -> Fixture {
    let queues = Arc::new(OutputQueues::new());
    let filter = Arc::new(ProcessFilter::new());
    Fixture {
        tracker: PresentTracker::new(opts, Arc::clone(&queues), filter),
        queues,
    }
}

fn hdr(timestamp: u64, process_id: u32, thread_id: u32) -> EventHeader {
    EventHeader {
        timestamp,
        process_id,
        thread_id,
    }
}

impl Fixture {
    /// Drive one present through the full hardware legacy flip sequence.
    fn hardware_flip_present(&mut self, t0: u64, pid: u32, tid: u32, seq: u32) {
        let t = &mut self.tracker;
        t.runtime_present_start(hdr(t0, pid, tid), Runtime::Dxgi, 0xA, 0, 1, false);
        t.flip(hdr(t0 + 1, pid, tid), 1, true);
        t.queue_submit(
            hdr(t0 + 2, pid, tid),
            QueuePacketType::MmioFlipCommandBuffer,
            seq,
            0x123,
            true,
        );
        t.runtime_present_stop(hdr(t0 + 3, pid, tid), Runtime::Dxgi, true);
        t.mmio_flip(hdr(t0 + 4, pid, tid), seq, 0);
        t.sync_dpc(hdr(t0 + 5, pid, tid), seq);
    }
}

// --- Scenario: happy hardware flip ---

#[test]
fn test_hardware_legacy_flip_completes() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    t.flip(hdr(110, 100, 7), 1, true);
    t.queue_submit(
        hdr(120, 100, 7),
        QueuePacketType::MmioFlipCommandBuffer,
        42,
        0x123,
        true,
    );
    t.runtime_present_stop(hdr(130, 100, 7), Runtime::Dxgi, true);
    t.mmio_flip(hdr(200, 0, 0), 42, 0);
    t.sync_dpc(hdr(300, 0, 0), 42);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    let p = &completed[0];
    assert_eq!(p.mode, PresentMode::HardwareLegacyFlip);
    assert_eq!(p.final_state, PresentResult::Presented);
    assert_eq!(p.ready_time, 200);
    assert_eq!(p.screen_time, 300);
    assert_eq!(p.swap_chain, 0xA);
    assert_eq!(p.sync_interval, 1);
    assert_eq!(p.time_in_present, 30);
    assert!(!p.dropped());
    assert!(f.queues.take_lost().is_empty());
    assert_eq!(f.tracker.live_presents(), 0);
}

// --- Scenario: composed flip retired by the compositor's own present ---

#[test]
fn test_composed_flip_via_compositor() {
    let mut f = fixture();
    let t = &mut f.tracker;
    let triple = (0x10, 2, 0x30);

    t.runtime_present_start(hdr(100, 100, 9), Runtime::Dxgi, 0xB, 0, 1, false);
    t.token_composition_surface(hdr(101, 100, 9), triple.0, triple.1, triple.2);
    t.present_history(hdr(102, 100, 9), 0x700, 0, PresentMode::Unknown);
    t.queue_submit(
        hdr(103, 100, 9),
        QueuePacketType::SoftwareCommandBuffer,
        5,
        0x200,
        true,
    );
    t.kernel_present(hdr(104, 100, 9), 0x5000);
    t.runtime_present_stop(hdr(105, 100, 9), Runtime::Dxgi, true);
    t.present_history_propagate(hdr(150, 4, 20), 0x700);
    t.token_state_changed(hdr(160, 4, 20), triple, TokenState::InFrame, false, 800, 600);
    t.dwm_get_present_history(hdr(170, 4, 20));
    t.dwm_schedule_present(hdr(180, 4, 21));

    // The compositor's own fullscreen present.
    t.flip(hdr(190, 4, 21), 1, true);
    t.queue_submit(
        hdr(191, 4, 21),
        QueuePacketType::MmioFlipCommandBuffer,
        99,
        0x300,
        true,
    );
    t.mmio_flip(hdr(200, 0, 0), 99, 0);
    t.sync_dpc(hdr(250, 0, 0), 99);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 2);

    // Dependents retire before the carrying present.
    let app = &completed[0];
    assert_eq!(app.process_id, 100);
    assert_eq!(app.mode, PresentMode::ComposedFlip);
    assert_eq!(app.final_state, PresentResult::Presented);
    assert_eq!(app.screen_time, 250);
    assert_eq!(app.dest_width, 800);
    assert_eq!(app.dest_height, 600);
    assert!(app.dwm_notified);
    assert!(app.seen_in_frame);

    let dwm = &completed[1];
    assert_eq!(dwm.process_id, 4);
    assert_eq!(dwm.screen_time, 250);
    assert!(f.queues.take_lost().is_empty());
}

// --- Scenario: superseded present ---

#[test]
fn test_newer_completion_loses_older_present() {
    let mut f = fixture();
    let t = &mut f.tracker;

    // First present never gets past its start.
    t.runtime_present_start(hdr(100, 100, 1), Runtime::Dxgi, 0xA, 0, 1, false);

    // Second present, same process, completes fully.
    t.runtime_present_start(hdr(200, 100, 2), Runtime::Dxgi, 0xA, 0, 1, false);
    t.flip(hdr(201, 100, 2), 1, true);
    t.queue_submit(
        hdr(202, 100, 2),
        QueuePacketType::MmioFlipCommandBuffer,
        7,
        0x1,
        true,
    );
    t.runtime_present_stop(hdr(203, 100, 2), Runtime::Dxgi, true);
    t.mmio_flip(hdr(210, 0, 0), 7, 0);
    t.sync_dpc(hdr(220, 0, 0), 7);

    let lost = f.queues.take_lost();
    let completed = f.queues.take_completed();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].start_time, 100);
    assert!(lost[0].lost);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].start_time, 200);
    assert_eq!(f.tracker.live_presents(), 0);
}

// --- Scenario: missing classifier event ---

#[test]
fn test_unclassified_present_lost_after_deferral_window() {
    let mut f = fixture();

    // Present with no kernel event between start and stop.
    f.tracker
        .runtime_present_start(hdr(100, 100, 1), Runtime::Dxgi, 0xA, 0, 1, false);
    f.tracker
        .runtime_present_stop(hdr(110, 100, 1), Runtime::Dxgi, true);

    // Three further presents complete on the same process.
    f.hardware_flip_present(200, 100, 1, 10);
    assert!(f.queues.take_lost().is_empty(), "still inside the window");
    f.hardware_flip_present(300, 100, 1, 11);
    assert!(f.queues.take_lost().is_empty(), "still inside the window");
    f.hardware_flip_present(400, 100, 1, 12);

    let lost = f.queues.take_lost();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].start_time, 100);
    assert_eq!(lost[0].mode, PresentMode::Unknown);
    assert_eq!(f.queues.take_completed().len(), 3);
}

// --- Scenario: ring eviction ---

#[test]
fn test_ring_eviction_surfaces_oldest_as_lost() {
    let mut f = fixture_with(TrackerOptions {
        ring_capacity: 4,
        ..TrackerOptions::default()
    });

    for i in 0..4u32 {
        f.tracker.runtime_present_start(
            hdr(100 + u64::from(i), 200, 1 + i),
            Runtime::Dxgi,
            0xA,
            0,
            1,
            false,
        );
    }
    assert!(f.queues.take_lost().is_empty());
    assert_eq!(f.tracker.live_presents(), 4);

    // The fifth in-flight present displaces the oldest.
    f.tracker
        .runtime_present_start(hdr(104, 200, 5), Runtime::Dxgi, 0xA, 0, 1, false);

    let lost = f.queues.take_lost();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].start_time, 100);
    assert_eq!(f.tracker.live_presents(), 4);
}

// --- Scenario: process termination ---

#[test]
fn test_process_stop_loses_all_in_flight_in_start_order() {
    let mut f = fixture();

    for i in 0..3u32 {
        f.tracker.runtime_present_start(
            hdr(100 + u64::from(i) * 10, 200, 1 + i),
            Runtime::Dxgi,
            0xA,
            0,
            1,
            false,
        );
    }
    f.tracker
        .process_event(500, 200, "game.exe".to_string(), false);

    let lost = f.queues.take_lost();
    assert_eq!(lost.len(), 3);
    let starts: Vec<u64> = lost.iter().map(|p| p.start_time).collect();
    assert_eq!(starts, vec![100, 110, 120]);
    assert_eq!(f.tracker.live_presents(), 0);

    let events = f.queues.take_process_events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_start);
    assert_eq!(events[0].image_name, "game.exe");
}

// --- Boundary: present start on a busy thread ---

#[test]
fn test_start_on_busy_thread_loses_prior() {
    let mut f = fixture();

    f.tracker
        .runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    f.tracker
        .runtime_present_start(hdr(200, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);

    let lost = f.queues.take_lost();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].start_time, 100);
    assert_eq!(f.tracker.live_presents(), 1);
}

// --- Boundary: token discarded with unresolved final state ---

#[test]
fn test_token_discarded_completes_as_dropped() {
    let mut f = fixture();
    let t = &mut f.tracker;
    let triple = (1, 2, 3);

    t.runtime_present_start(hdr(100, 100, 9), Runtime::Dxgi, 0xB, 0, 1, false);
    t.token_composition_surface(hdr(101, 100, 9), triple.0, triple.1, triple.2);
    t.runtime_present_stop(hdr(102, 100, 9), Runtime::Dxgi, true);
    t.token_state_changed(hdr(110, 4, 20), triple, TokenState::Discarded, false, 0, 0);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].final_state, PresentResult::Discarded);
    assert!(completed[0].dropped());
    assert!(f.queues.take_lost().is_empty());
}

// --- Deferred completion: screen time before the runtime stop ---

#[test]
fn test_completion_deferred_until_present_stop() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    t.flip(hdr(101, 100, 7), 1, true);
    t.queue_submit(
        hdr(102, 100, 7),
        QueuePacketType::MmioFlipCommandBuffer,
        42,
        0x1,
        true,
    );
    // The flip lands on screen while the API call is still outstanding.
    t.mmio_flip(hdr(110, 0, 0), 42, 0);
    t.sync_dpc(hdr(120, 0, 0), 42);

    assert!(f.queues.take_completed().is_empty());

    t.runtime_present_stop(hdr(130, 100, 7), Runtime::Dxgi, true);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].screen_time, 120);
    assert_eq!(completed[0].time_in_present, 30);
}

#[test]
fn test_deferred_completion_expires_without_stop() {
    let mut f = fixture();

    f.tracker
        .runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    f.tracker.flip(hdr(101, 100, 7), 1, true);
    f.tracker.queue_submit(
        hdr(102, 100, 7),
        QueuePacketType::MmioFlipCommandBuffer,
        42,
        0x1,
        true,
    );
    f.tracker.mmio_flip(hdr(110, 0, 0), 42, 0);
    f.tracker.sync_dpc(hdr(120, 0, 0), 42);
    assert!(f.queues.take_completed().is_empty());

    // The stop never arrives (lost event); three presents from the same
    // process flush the deferral. Use a different thread so the parked
    // record's thread binding stays intact.
    f.hardware_flip_present(200, 100, 8, 50);
    f.hardware_flip_present(300, 100, 8, 51);
    f.hardware_flip_present(400, 100, 8, 52);

    let completed = f.queues.take_completed();
    let deferred: Vec<_> = completed.iter().filter(|p| p.start_time == 100).collect();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].screen_time, 120);
}

// --- Hardware copy to front buffer ---

#[test]
fn test_fullscreen_blit_completes_at_queue_stop() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 0, false);
    t.blit(hdr(101, 100, 7), 0x5000, false);
    t.queue_submit(
        hdr(102, 100, 7),
        QueuePacketType::RenderCommandBuffer,
        9,
        0x400,
        true,
    );
    t.kernel_present(hdr(103, 100, 7), 0x5000);
    t.runtime_present_stop(hdr(104, 100, 7), Runtime::Dxgi, true);
    t.queue_complete(hdr(150, 0, 0), 9);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    let p = &completed[0];
    assert_eq!(p.mode, PresentMode::HardwareLegacyCopyToFrontBuffer);
    assert_eq!(p.ready_time, 150);
    assert_eq!(p.screen_time, 150);
    assert!(p.supports_tearing);
}

#[test]
fn test_blit_without_kernel_present_resolves_via_context() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 0, false);
    t.blit(hdr(101, 100, 7), 0x5000, false);
    t.queue_submit(
        hdr(102, 100, 7),
        QueuePacketType::RenderCommandBuffer,
        9,
        0x400,
        true,
    );
    t.runtime_present_stop(hdr(104, 100, 7), Runtime::Dxgi, true);
    t.queue_complete(hdr(150, 0, 0), 9);
    // Screen time known, but fullscreen-vs-windowed still open.
    assert!(f.queues.take_completed().is_empty());

    // Next packet on the same context is not a present-history submission:
    // the blit went straight to the front buffer.
    t.queue_submit(
        hdr(160, 100, 8),
        QueuePacketType::RenderCommandBuffer,
        10,
        0x400,
        false,
    );

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].mode,
        PresentMode::HardwareLegacyCopyToFrontBuffer
    );
    assert_eq!(completed[0].screen_time, 150);
}

// --- Composed copy (GPU GDI) ---

#[test]
fn test_windowed_blit_composed_copy_gpu_gdi() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 0, false);
    t.blit(hdr(101, 100, 7), 0x5000, false);
    t.present_history(hdr(102, 100, 7), 0x700, 0, PresentMode::ComposedCopyGpuGdi);
    t.runtime_present_stop(hdr(103, 100, 7), Runtime::Dxgi, true);
    t.present_history_propagate(hdr(120, 4, 20), 0x700);
    t.dwm_get_present_history(hdr(130, 4, 20));
    t.dwm_schedule_present(hdr(140, 4, 21));

    // Compositor's own present retires it.
    t.flip(hdr(150, 4, 21), 1, true);
    t.queue_submit(
        hdr(151, 4, 21),
        QueuePacketType::MmioFlipCommandBuffer,
        99,
        0x300,
        true,
    );
    t.mmio_flip(hdr(160, 0, 0), 99, 0);
    t.sync_dpc(hdr(170, 0, 0), 99);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 2);
    let app = &completed[0];
    assert_eq!(app.mode, PresentMode::ComposedCopyGpuGdi);
    assert_eq!(app.ready_time, 120);
    assert_eq!(app.screen_time, 170);
    assert!(app.dwm_notified);
}

#[test]
fn test_compositor_flip_requires_matching_process() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 0, false);
    t.blit(hdr(101, 100, 7), 0x5000, false);
    t.present_history(hdr(102, 100, 7), 0x700, 0, PresentMode::ComposedCopyGpuGdi);
    t.runtime_present_stop(hdr(103, 100, 7), Runtime::Dxgi, true);
    t.present_history_propagate(hdr(120, 4, 20), 0x700);
    t.dwm_get_present_history(hdr(130, 4, 20));
    t.dwm_schedule_present(hdr(140, 4, 21));

    // A flip on the scheduled thread id but from a different process is not
    // the compositor's present; the waiting present is not adopted.
    t.flip(hdr(150, 5, 21), 1, true);
    t.queue_submit(
        hdr(151, 5, 21),
        QueuePacketType::MmioFlipCommandBuffer,
        99,
        0x300,
        true,
    );
    t.mmio_flip(hdr(160, 0, 0), 99, 0);
    t.sync_dpc(hdr(170, 0, 0), 99);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].process_id, 5);
    // The app present still waits on the real compositor present.
    assert_eq!(f.tracker.live_presents(), 1);
    assert!(f.queues.take_lost().is_empty());
}

// --- Composed copy (CPU GDI) via legacy blit token ---

#[test]
fn test_composed_copy_cpu_gdi_flip_chain_path() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::D3d9, 0xA, 0, 0, false);
    t.blit(hdr(101, 100, 7), 0x5000, true);
    t.present_history(
        hdr(102, 100, 7),
        0x700,
        (0x9 << 32) | 0x1,
        PresentMode::ComposedCopyCpuGdi,
    );
    t.runtime_present_stop(hdr(103, 100, 7), Runtime::D3d9, true);
    t.present_history_propagate(hdr(120, 4, 20), 0x700);
    // Compositor binds the legacy token to its window.
    t.dwm_flip_chain(hdr(130, 4, 20), 0x9, 0x1, 0x6000);
    t.dwm_get_present_history(hdr(140, 4, 20));
    t.dwm_schedule_present(hdr(150, 4, 21));

    t.flip(hdr(160, 4, 21), 1, true);
    t.queue_submit(
        hdr(161, 4, 21),
        QueuePacketType::MmioFlipCommandBuffer,
        99,
        0x300,
        true,
    );
    t.mmio_flip(hdr(170, 0, 0), 99, 0);
    t.sync_dpc(hdr(180, 0, 0), 99);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 2);
    let app = &completed[0];
    assert_eq!(app.mode, PresentMode::ComposedCopyCpuGdi);
    assert_eq!(app.window, 0x6000);
    assert_eq!(app.screen_time, 180);
    assert!(!app.supports_tearing);
}

// --- Batched presents ---

#[test]
fn test_batched_present_adopted_by_driver_thread() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    t.runtime_present_stop(hdr(110, 100, 7), Runtime::Dxgi, true);

    // Kernel work shows up on a driver thread of the same process.
    t.flip(hdr(120, 100, 31), 1, true);
    t.queue_submit(
        hdr(121, 100, 31),
        QueuePacketType::MmioFlipCommandBuffer,
        42,
        0x1,
        true,
    );
    t.mmio_flip(hdr(130, 0, 0), 42, 0);
    t.sync_dpc(hdr(140, 0, 0), 42);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    let p = &completed[0];
    assert_eq!(p.start_time, 100);
    assert_eq!(p.thread_id, 7);
    assert_eq!(p.driver_batch_thread_id, 31);
    assert!(p.was_batched());
    assert_eq!(p.screen_time, 140);
    assert!(f.queues.take_lost().is_empty());
}

// --- Runtime behavior ---

#[test]
fn test_failed_present_stop_discards() {
    let mut f = fixture();

    f.tracker
        .runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    f.tracker
        .runtime_present_stop(hdr(110, 100, 7), Runtime::Dxgi, false);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].final_state, PresentResult::Discarded);
    assert!(completed[0].dropped());
}

#[test]
fn test_without_display_tracking_presents_complete_at_stop() {
    let mut f = fixture_with(TrackerOptions {
        track_display: false,
        ..TrackerOptions::default()
    });

    f.tracker
        .runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    f.tracker
        .runtime_present_stop(hdr(110, 100, 7), Runtime::Dxgi, true);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].final_state, PresentResult::Presented);
    assert_eq!(completed[0].screen_time, 0);
    assert_eq!(completed[0].time_in_present, 10);
}

#[test]
fn test_test_present_not_tracked() {
    let mut f = fixture();
    f.tracker
        .runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0x1, 1, true);
    assert_eq!(f.tracker.live_presents(), 0);
}

#[test]
fn test_mmio_immediate_flip_tears() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 0, false);
    t.flip(hdr(101, 100, 7), 0, true);
    t.queue_submit(
        hdr(102, 100, 7),
        QueuePacketType::MmioFlipCommandBuffer,
        42,
        0x1,
        true,
    );
    t.runtime_present_stop(hdr(103, 100, 7), Runtime::Dxgi, true);
    t.mmio_flip(hdr(110, 0, 0), 42, mmio_flip_flags::FLIP_IMMEDIATE);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].supports_tearing);
    assert_eq!(completed[0].screen_time, 110);
}

// --- Filtering ---

#[test]
fn test_untracked_process_ignored() {
    let mut f = fixture();
    f.tracker.add_tracked_process(100);

    f.tracker
        .runtime_present_start(hdr(100, 999, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    assert_eq!(f.tracker.live_presents(), 0);

    f.tracker
        .runtime_present_start(hdr(100, 100, 8), Runtime::Dxgi, 0xA, 0, 1, false);
    assert_eq!(f.tracker.live_presents(), 1);

    assert!(f.tracker.is_process_tracked(100));
    assert!(!f.tracker.is_process_tracked(999));
    f.tracker.remove_tracked_process(100);
    assert!(!f.tracker.is_process_tracked(100));
}

// --- Protocol violations ---

#[test]
fn test_unknown_submit_sequence_dropped() {
    let mut f = fixture();
    f.tracker.sync_dpc(hdr(100, 0, 0), 999);
    f.tracker.mmio_flip(hdr(100, 0, 0), 999, 0);
    f.tracker.queue_complete(hdr(100, 0, 0), 999);
    assert!(f.queues.take_completed().is_empty());
    assert!(f.queues.take_lost().is_empty());
}

#[test]
fn test_unknown_token_state_change_dropped() {
    let mut f = fixture();
    f.tracker.token_state_changed(
        hdr(100, 4, 20),
        (9, 9, 9),
        TokenState::Discarded,
        false,
        0,
        0,
    );
    assert!(f.queues.take_completed().is_empty());
    assert!(f.queues.take_lost().is_empty());
}

#[test]
fn test_double_flip_classification_is_lost() {
    let mut f = fixture();
    let t = &mut f.tracker;

    t.runtime_present_start(hdr(100, 100, 7), Runtime::Dxgi, 0xA, 0, 1, false);
    t.blit(hdr(101, 100, 7), 0x5000, false);
    // A flip for a present already classified as a blit is impossible.
    t.flip(hdr(102, 100, 7), 1, true);

    let lost = f.queues.take_lost();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].start_time, 100);
}

#[test]
fn test_independent_flip_promotion() {
    let mut f = fixture();
    let t = &mut f.tracker;
    let triple = (1, 2, 3);

    t.runtime_present_start(hdr(100, 100, 9), Runtime::Dxgi, 0xB, 0, 1, false);
    t.token_composition_surface(hdr(101, 100, 9), triple.0, triple.1, triple.2);
    t.queue_submit(
        hdr(102, 100, 9),
        QueuePacketType::SoftwareCommandBuffer,
        5,
        0x200,
        true,
    );
    t.runtime_present_stop(hdr(103, 100, 9), Runtime::Dxgi, true);
    t.independent_flip(hdr(110, 0, 0), 5, 1);
    t.mmio_flip(hdr(120, 0, 0), 5, 0);
    t.sync_dpc(hdr(130, 0, 0), 5);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].mode, PresentMode::HardwareIndependentFlip);
    assert_eq!(completed[0].screen_time, 130);
}

#[test]
fn test_multi_plane_sync_promotes_to_composed_independent() {
    let mut f = fixture();
    let t = &mut f.tracker;
    let triple = (1, 2, 3);

    t.runtime_present_start(hdr(100, 100, 9), Runtime::Dxgi, 0xB, 0, 1, false);
    t.token_composition_surface(hdr(101, 100, 9), triple.0, triple.1, triple.2);
    t.queue_submit(
        hdr(102, 100, 9),
        QueuePacketType::SoftwareCommandBuffer,
        5,
        0x200,
        true,
    );
    t.runtime_present_stop(hdr(103, 100, 9), Runtime::Dxgi, true);
    t.independent_flip(hdr(110, 0, 0), 5, 1);
    t.sync_dpc_mpo(hdr(130, 0, 0), 5, true);

    let completed = f.queues.take_completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        completed[0].mode,
        PresentMode::HardwareComposedIndependentFlip
    );
}
