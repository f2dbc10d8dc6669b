//! Tracking tables: one index per correlation identity, all pointing into
//! the record store by handle.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::store::RecordHandle;

/// In-flight presents of one process, ordered by start timestamp.
pub type OrderedPresents = BTreeMap<u64, RecordHandle>;

/// The bundle of indices over in-progress presents.
///
/// Every live record appears in the all-presents ring exactly once and in its
/// process's ordered map; the remaining indices each hold a record only while
/// the matching correlation key is bound.
pub struct TrackingTables {
    /// Record currently being built on each thread. Bound for at most the
    /// duration of the runtime present call on that thread.
    pub by_thread: HashMap<u32, RecordHandle>,
    /// Per-process in-flight presents in start order.
    pub by_process: HashMap<u32, OrderedPresents>,
    /// Queue-packet submit sequence lookup.
    pub by_submit_sequence: HashMap<u32, RecordHandle>,
    /// Flip-model composition token triple (surface LUID, present count,
    /// bind id).
    pub win32k_tokens: HashMap<(u64, u64, u64), RecordHandle>,
    /// Present-history token for windowed presents.
    pub history_tokens: HashMap<u64, RecordHandle>,
    /// Legacy blit token, CPU-GDI composed copies only.
    pub legacy_blit_tokens: HashMap<u64, RecordHandle>,
    /// Blit presents awaiting fullscreen-vs-windowed disambiguation, keyed by
    /// graphics context. Resolved by the next packet on the same context.
    pub blits_by_context: HashMap<u64, RecordHandle>,
    /// Most recent present handed off to the compositor per window.
    pub last_window_present: HashMap<u64, RecordHandle>,
    /// Presents the compositor's next present will retire.
    pub waiting_for_dwm: VecDeque<RecordHandle>,

    ring: Vec<Option<RecordHandle>>,
    ring_next: usize,
}

impl TrackingTables {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            by_thread: HashMap::new(),
            by_process: HashMap::new(),
            by_submit_sequence: HashMap::new(),
            win32k_tokens: HashMap::new(),
            history_tokens: HashMap::new(),
            legacy_blit_tokens: HashMap::new(),
            blits_by_context: HashMap::new(),
            last_window_present: HashMap::new(),
            waiting_for_dwm: VecDeque::new(),
            ring: vec![None; ring_capacity.max(1)],
            ring_next: 0,
        }
    }

    /// Claim the next ring slot for a record. Returns the slot index and the
    /// previous occupant, if any; the caller decides the occupant's fate.
    pub fn ring_insert(&mut self, handle: RecordHandle) -> (usize, Option<RecordHandle>) {
        let slot = self.ring_next;
        let evicted = self.ring[slot].replace(handle);
        self.ring_next = (self.ring_next + 1) % self.ring.len();
        (slot, evicted)
    }

    /// Release a ring slot if it still holds the given record.
    pub fn ring_release(&mut self, slot: usize, handle: RecordHandle) {
        if let Some(occupant) = self.ring.get_mut(slot) {
            if *occupant == Some(handle) {
                *occupant = None;
            }
        }
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring.len()
    }

    /// Number of records currently held by the ring.
    pub fn ring_len(&self) -> usize {
        self.ring.iter().filter(|s| s.is_some()).count()
    }

    /// The ordered in-flight presents of a process, creating the map on
    /// first use.
    pub fn process_presents(&mut self, process_id: u32) -> &mut OrderedPresents {
        self.by_process.entry(process_id).or_default()
    }

    /// Remove one record from its process's ordered map, dropping the map
    /// when it empties.
    pub fn remove_process_entry(&mut self, process_id: u32, start_time: u64) {
        if let Some(map) = self.by_process.get_mut(&process_id) {
            map.remove(&start_time);
            if map.is_empty() {
                self.by_process.remove(&process_id);
            }
        }
    }

    /// Drop the waiting-for-compositor entry for a record, if present.
    pub fn remove_from_dwm_waiting(&mut self, handle: RecordHandle) {
        self.waiting_for_dwm.retain(|h| *h != handle);
    }
}
