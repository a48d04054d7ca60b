// src/inventory/store.rs
//
// Thread-safe inventory of tag reads: per-EPC counts plus the ordered read history.
// Both live under one lock and are reset together when the history ceiling is hit.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::protocol::TagRead;

// ============================================================================
// Constants
// ============================================================================

/// EPC values some readers report when no real tag was singulated.
pub const SENTINEL_EPCS: [&str; 2] = ["000000", "000001"];

pub const DEFAULT_HISTORY_CEILING: usize = 10_000;

// ============================================================================
// Types
// ============================================================================

/// Result of recording an accepted read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    /// EPC was not in the inventory before this read
    pub is_new: bool,
    /// Reads of this EPC so far, including this one
    pub epc_count: u32,
    pub unique_count: usize,
    pub total_count: usize,
    /// The ceiling was reached and everything before this read was dropped
    pub was_reset: bool,
}

/// One history entry with sensor-activation marks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRow {
    pub index: usize,
    pub antenna: u8,
    pub epc: String,
    pub rssi: i32,
    /// HH:MM:SS.mmm
    pub timestamp: String,
    pub s1: bool,
    pub s2: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    counts: HashMap<String, u32>,
    history: Vec<TagRead>,
    total: usize,
}

impl StoreInner {
    fn clear(&mut self) {
        self.counts.clear();
        self.history.clear();
        self.total = 0;
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug)]
pub struct InventoryStore {
    ceiling: usize,
    inner: Mutex<StoreInner>,
}

impl Default for InventoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CEILING)
    }
}

pub fn is_sentinel_epc(epc: &str) -> bool {
    SENTINEL_EPCS.contains(&epc)
}

impl InventoryStore {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a read. Returns whether its EPC was previously unseen.
    /// Empty and sentinel EPCs are ignored.
    pub fn record(&self, read: TagRead) -> bool {
        self.record_detailed(read)
            .map(|outcome| outcome.is_new)
            .unwrap_or(false)
    }

    /// Record a read and report the resulting counts. `None` if the read was rejected.
    pub fn record_detailed(&self, read: TagRead) -> Option<RecordOutcome> {
        if read.epc.is_empty() || is_sentinel_epc(&read.epc) {
            return None;
        }

        let mut inner = self.lock();
        let mut was_reset = false;
        if inner.total + 1 >= self.ceiling {
            inner.clear();
            was_reset = true;
        }
        inner.total += 1;

        let count = inner.counts.entry(read.epc.clone()).or_insert(0);
        *count += 1;
        let epc_count = *count;
        inner.history.push(read);

        let outcome = RecordOutcome {
            is_new: epc_count == 1,
            epc_count,
            unique_count: inner.counts.len(),
            total_count: inner.total,
            was_reset,
        };
        drop(inner);

        if was_reset {
            tlog!(
                "[Store] Read ceiling of {} reached, inventory cleared",
                self.ceiling
            );
        }
        Some(outcome)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Point-in-time copy of the read history.
    pub fn snapshot(&self) -> Vec<TagRead> {
        self.lock().history.clone()
    }

    /// (unique EPCs, total reads)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.counts.len(), inner.total)
    }

    pub fn unique_count(&self) -> usize {
        self.lock().counts.len()
    }

    pub fn total_count(&self) -> usize {
        self.lock().total
    }

    pub fn count_for(&self, epc: &str) -> u32 {
        self.lock().counts.get(epc).copied().unwrap_or(0)
    }

    pub fn tag_counts(&self) -> HashMap<String, u32> {
        self.lock().counts.clone()
    }

    /// History with `s1`/`s2` set on reads within `tolerance_ms` of the given activations.
    pub fn history_rows(
        &self,
        sensor1_at: Option<DateTime<Local>>,
        sensor2_at: Option<DateTime<Local>>,
        tolerance_ms: i64,
    ) -> Vec<HistoryRow> {
        let near = |read_time: DateTime<Local>, mark: Option<DateTime<Local>>| {
            mark.map(|at| (read_time - at).num_milliseconds().abs() <= tolerance_ms)
                .unwrap_or(false)
        };

        self.lock()
            .history
            .iter()
            .enumerate()
            .map(|(i, read)| HistoryRow {
                index: i + 1,
                antenna: read.antenna,
                epc: read.epc.clone(),
                rssi: read.rssi,
                timestamp: read.read_time.format("%H:%M:%S%.3f").to_string(),
                s1: near(read.read_time, sensor1_at),
                s2: near(read.read_time, sensor2_at),
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
