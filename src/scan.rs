// src/scan.rs
//
// Inventory scan loop.
//
// While a scan is active one thread repeats the fast-switch inventory poll at a
// fixed cadence and periodically flushes queued tag events to the consumer.
// Stopping is cooperative: the loop checks its cancel flag each cycle and
// signals completion on a channel so callers can wait with a bounded timeout.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::protocol::TagRead;

// ============================================================================
// Tag Events
// ============================================================================

/// A tag observation as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagEvent {
    pub epc: String,
    pub antenna: u8,
    pub rssi: i32,
    /// MHz with two decimals
    pub frequency: String,
    /// Reads of this EPC so far
    pub count: u32,
    pub read_time: DateTime<Local>,
}

impl TagEvent {
    pub fn from_read(read: &TagRead, count: u32) -> Self {
        Self {
            epc: read.epc.clone(),
            antenna: read.antenna,
            rssi: read.rssi,
            frequency: read.frequency_text(),
            count,
            read_time: read.read_time,
        }
    }
}

/// Bounded FIFO of tag events waiting for the next UI flush.
/// When full the oldest event is dropped.
#[derive(Debug)]
pub struct TagQueue {
    capacity: usize,
    events: Mutex<VecDeque<TagEvent>>,
    dropped: AtomicU64,
    counts_dirty: AtomicBool,
}

impl TagQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            counts_dirty: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TagEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event and mark counts as changed.
    pub fn push(&self, event: TagEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        self.counts_dirty.store(true, Ordering::Relaxed);
    }

    /// Remove up to `max` events, oldest first.
    pub fn drain(&self, max: usize) -> Vec<TagEvent> {
        let mut events = self.lock();
        let n = max.min(events.len());
        events.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns whether counts changed since the last call, and resets the flag.
    pub fn take_counts_dirty(&self) -> bool {
        self.counts_dirty.swap(false, Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.dropped.store(0, Ordering::Relaxed);
        self.counts_dirty.store(false, Ordering::Relaxed);
    }
}

// ============================================================================
// Scan Loop
// ============================================================================

/// What the scan loop drives each cycle.
pub trait ScanDriver: Send + Sync + 'static {
    /// Inventory frame for this cycle, built from the current antenna selection.
    fn poll_frame(&self) -> Option<Vec<u8>>;

    /// Write a frame to the reader. Returns false if it could not be written.
    fn send(&self, frame: &[u8]) -> bool;

    /// Deliver queued tag events and count updates.
    fn flush_ui(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct ScanTiming {
    pub scan_interval: Duration,
    pub ui_batch_interval: Duration,
}

/// Handle to a running scan loop.
pub struct ScanLoop {
    cancel_flag: Arc<AtomicBool>,
    done_rx: std_mpsc::Receiver<u64>,
    task_handle: Option<JoinHandle<()>>,
}

impl ScanLoop {
    pub fn spawn(driver: Arc<dyn ScanDriver>, timing: ScanTiming) -> std::io::Result<Self> {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let cancel_flag_clone = cancel_flag.clone();
        let (done_tx, done_rx) = std_mpsc::channel();

        tlog!(
            "[Scan] Starting scan loop, poll every {}ms, flush every {}ms",
            timing.scan_interval.as_millis(),
            timing.ui_batch_interval.as_millis()
        );

        let task_handle = std::thread::Builder::new()
            .name("scan-loop".to_string())
            .spawn(move || {
                let polls = run_scan_loop(driver.as_ref(), &cancel_flag_clone, timing);
                let _ = done_tx.send(polls);
            })?;

        Ok(Self {
            cancel_flag,
            done_rx,
            task_handle: Some(task_handle),
        })
    }

    /// Signal the loop to stop and wait up to `timeout` for it to finish.
    /// Returns false if the loop was still running when the timeout expired;
    /// it is then left to exit on its own.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.cancel_flag.store(true, Ordering::Relaxed);

        match self.done_rx.recv_timeout(timeout) {
            Ok(polls) => {
                tlog!("[Scan] Scan loop stopped after {} polls", polls);
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                tlog!("[Scan] Scan loop exited without reporting");
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tlog!(
                    "[Scan] Scan loop did not stop within {}ms, detaching",
                    timeout.as_millis()
                );
                return false;
            }
        }

        if let Some(handle) = self.task_handle.take() {
            if handle.join().is_err() {
                tlog!("[Scan] Scan loop panicked");
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ScanLoop {
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}

/// Returns the number of polls written.
fn run_scan_loop(driver: &dyn ScanDriver, cancel_flag: &AtomicBool, timing: ScanTiming) -> u64 {
    let mut polls: u64 = 0;
    let mut failing = false;
    let mut last_flush = Instant::now();

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            break;
        }

        if let Some(frame) = driver.poll_frame() {
            if driver.send(&frame) {
                polls += 1;
                if failing {
                    tlog!("[Scan] Inventory poll writes recovered");
                    failing = false;
                }
            } else if !failing {
                // Logged once per run of failures; the reader link reports the cause
                tlog!("[Scan] Failed to write inventory poll");
                failing = true;
            }
        }

        if last_flush.elapsed() >= timing.ui_batch_interval {
            driver.flush_ui();
            last_flush = Instant::now();
        }

        std::thread::sleep(timing.scan_interval);
    }

    polls
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(epc: &str, count: u32) -> TagEvent {
        TagEvent {
            epc: epc.to_string(),
            antenna: 1,
            rssi: 180,
            frequency: "865.50".to_string(),
            count,
            read_time: Local::now(),
        }
    }

    #[derive(Default)]
    struct FakeDriver {
        sent: Mutex<Vec<Vec<u8>>>,
        flushes: AtomicU64,
        accept: AtomicBool,
        block_ms: u64,
    }

    impl ScanDriver for FakeDriver {
        fn poll_frame(&self) -> Option<Vec<u8>> {
            Some(vec![0xA0, 0x0D, 0xFF, 0x8A])
        }

        fn send(&self, frame: &[u8]) -> bool {
            if self.block_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.block_ms));
            }
            self.sent.lock().unwrap().push(frame.to_vec());
            self.accept.load(Ordering::Relaxed)
        }

        fn flush_ui(&self) {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fast_timing() -> ScanTiming {
        ScanTiming {
            scan_interval: Duration::from_millis(2),
            ui_batch_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_tag_event_from_read() {
        let read = TagRead {
            epc: "E200".to_string(),
            pc: "3000".to_string(),
            rssi: 200,
            antenna: 2,
            channel: 1,
            frequency_mhz: 865.5,
            read_time: Local::now(),
        };
        let event = TagEvent::from_read(&read, 3);
        assert_eq!(event.frequency, "865.50");
        assert_eq!(event.count, 3);
        assert_eq!(event.antenna, 2);
    }

    #[test]
    fn test_tag_queue_drops_oldest() {
        let queue = TagQueue::new(3);
        for i in 0..5 {
            queue.push(tag(&format!("E{}", i), 1));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        let batch = queue.drain(2);
        let epcs: Vec<&str> = batch.iter().map(|t| t.epc.as_str()).collect();
        assert_eq!(epcs, vec!["E2", "E3"]);
        assert_eq!(queue.drain(10).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tag_queue_counts_dirty() {
        let queue = TagQueue::new(10);
        assert!(!queue.take_counts_dirty());
        queue.push(tag("E1", 1));
        assert!(queue.take_counts_dirty());
        assert!(!queue.take_counts_dirty());

        queue.push(tag("E1", 2));
        queue.clear();
        assert!(!queue.take_counts_dirty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_scan_loop_polls_and_flushes() {
        let driver = Arc::new(FakeDriver {
            accept: AtomicBool::new(true),
            ..Default::default()
        });
        let scan = ScanLoop::spawn(driver.clone(), fast_timing()).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(scan.is_running());
        assert!(scan.stop(Duration::from_secs(2)));

        let sent = driver.sent.lock().unwrap().len();
        assert!(sent >= 2, "only {} polls", sent);
        assert!(driver.flushes.load(Ordering::Relaxed) >= 1);

        // Nothing is written after stop returns
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.sent.lock().unwrap().len(), sent);
    }

    #[test]
    fn test_scan_loop_survives_write_failures() {
        let driver = Arc::new(FakeDriver::default());
        let scan = ScanLoop::spawn(driver.clone(), fast_timing()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(scan.stop(Duration::from_secs(2)));
        assert!(driver.sent.lock().unwrap().len() >= 2);
    }

    #[test]
    fn test_stop_is_bounded() {
        let driver = Arc::new(FakeDriver {
            accept: AtomicBool::new(true),
            block_ms: 300,
            ..Default::default()
        });
        let scan = ScanLoop::spawn(driver, fast_timing()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(!scan.stop(Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
