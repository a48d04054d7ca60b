// src/session.rs
//
// Reader session: the controller tying transport, protocol and inventory together.
//
// Threads:
// - poll workers (one per open port) push TransportEvents into a bounded channel
// - the receive pipeline owns the frame reassembler and turns bytes and sensor
//   activations into store updates and SessionEvents
// - the scan loop polls the reader while a scan is active
// Consumers read SessionEvents from the receiver returned by `ReaderSession::new`.

use chrono::Local;
use serde::Serialize;
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, RwLock,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::inventory::{
    analyze, AnalysisResult, Direction, HistoryRow, InventoryStore, SensorCorrelator, SensorId,
};
use crate::io::serial::{FrameReassembler, Transport, TransportConfig, TransportError};
use crate::io::{LinkPort, LinkRole, TransportEvent};
use crate::logging::{LogLine, Severity};
use crate::protocol::commands::{command_name, CMD_SET_POWER};
use crate::protocol::{
    dispatch, AntennaConfig, BeeperMode, CommandError, CommandFailure, FrameError, ReaderCommand,
    ReaderEvent, Region,
};
use crate::scan::{ScanDriver, ScanLoop, ScanTiming, TagEvent, TagQueue};
use crate::settings::AppSettings;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Failed to write {0} command to the reader")]
    SendFailed(&'static str),

    #[error("A scan is already running")]
    AlreadyScanning,

    #[error("Failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Decoded answers to on-demand queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReaderInfo {
    Firmware(String),
    ReaderId(String),
    Temperature(String),
    PowerLevels(Vec<u8>),
    RfProfile(u8),
    Region(Region),
}

/// Everything a session reports to its consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    TagBatch {
        tags: Vec<TagEvent>,
    },
    Counts {
        unique: usize,
        total: usize,
    },
    Direction {
        direction: Direction,
        delta_ms: f64,
    },
    ReaderInfo {
        info: ReaderInfo,
    },
    Gpio {
        pins: [bool; 4],
    },
    S11 {
        value: u8,
    },
    CommandResult {
        command: u8,
        name: &'static str,
        result: Result<(), CommandFailure>,
    },
    Analysis {
        results: Vec<AnalysisResult>,
    },
    Connection {
        role: LinkRole,
        connected: bool,
        message: String,
    },
    ScanState {
        running: bool,
    },
    Log(LogLine),
}

/// How often the pipeline wakes up to check for shutdown when idle.
const PIPELINE_IDLE_TICK: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Shared State
// ============================================================================

struct SessionShared {
    settings: AppSettings,
    transport: Transport,
    store: InventoryStore,
    correlator: SensorCorrelator,
    antennas: RwLock<AntennaConfig>,
    scanning: AtomicBool,
    scan_loop: Mutex<Option<ScanLoop>>,
    tag_queue: TagQueue,
    events: std_mpsc::SyncSender<SessionEvent>,
    dropped_events: AtomicU64,
    shutdown: AtomicBool,
}

impl SessionShared {
    /// Deliver an event, waiting up to the stop timeout for room in the channel.
    fn emit(&self, event: SessionEvent) {
        let deadline = Instant::now() + self.settings.stop_timeout();
        let mut pending = event;
        loop {
            match self.events.try_send(pending) {
                Ok(()) => return,
                Err(std_mpsc::TrySendError::Disconnected(_)) => return,
                Err(std_mpsc::TrySendError::Full(event)) => {
                    if Instant::now() >= deadline {
                        if self.dropped_events.fetch_add(1, Ordering::Relaxed) == 0 {
                            tlog!("[Session] Event consumer is not keeping up, dropping events");
                        }
                        return;
                    }
                    pending = event;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn log(&self, severity: Severity, message: impl Into<String>) {
        let line = LogLine::new(severity, message);
        tlog!("[Session] {}: {}", severity.label(), line.message);
        self.emit(SessionEvent::Log(line));
    }

    fn antenna_config(&self) -> AntennaConfig {
        match self.antennas.read() {
            Ok(config) => *config,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_antenna_config(&self, config: AntennaConfig) {
        match self.antennas.write() {
            Ok(mut slot) => *slot = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    fn emit_counts(&self) {
        let (unique, total) = self.store.counts();
        self.emit(SessionEvent::Counts { unique, total });
    }

    /// Deliver one batch of queued tags, plus counts if they changed.
    fn flush_tag_batch(&self) {
        let tags = self.tag_queue.drain(self.settings.max_tags_per_batch.max(1));
        if !tags.is_empty() {
            self.emit(SessionEvent::TagBatch { tags });
        }
        if self.tag_queue.take_counts_dirty() {
            self.emit_counts();
        }
    }

    /// Deliver everything still queued.
    fn flush_all_tags(&self) {
        loop {
            let tags = self.tag_queue.drain(self.settings.max_tags_per_batch.max(1));
            if tags.is_empty() {
                break;
            }
            self.emit(SessionEvent::TagBatch { tags });
        }
        self.tag_queue.take_counts_dirty();
    }

    fn analyze(&self) -> Vec<AnalysisResult> {
        analyze(
            &self.store.snapshot(),
            Local::now(),
            self.correlator.last_direction(),
            &self.settings.analysis,
        )
    }

    fn send_command(&self, command: &ReaderCommand) -> Result<(), SessionError> {
        let frame = command.encode(self.settings.reader_id)?;
        if !self.transport.is_connected(LinkRole::Reader) {
            return Err(TransportError::NotConnected(LinkRole::Reader).into());
        }
        if !self.transport.send(&frame) {
            return Err(SessionError::SendFailed(command_name(command.code())));
        }
        Ok(())
    }

    fn start_scan(self: &Arc<Self>, antennas: [bool; 4]) -> Result<(), SessionError> {
        let config = AntennaConfig::try_from_enabled(antennas)?;
        if !self.transport.is_connected(LinkRole::Reader) {
            return Err(TransportError::NotConnected(LinkRole::Reader).into());
        }

        let mut slot = lock(&self.scan_loop);
        if self.scanning.load(Ordering::SeqCst) || slot.is_some() {
            return Err(SessionError::AlreadyScanning);
        }

        self.set_antenna_config(config);
        self.tag_queue.clear();
        self.scanning.store(true, Ordering::SeqCst);

        let timing = ScanTiming {
            scan_interval: self.settings.scan_interval(),
            ui_batch_interval: self.settings.ui_batch_interval(),
        };
        let driver: Arc<dyn ScanDriver> = self.clone();
        match ScanLoop::spawn(driver, timing) {
            Ok(scan_loop) => *slot = Some(scan_loop),
            Err(e) => {
                self.scanning.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }
        drop(slot);

        self.emit(SessionEvent::ScanState { running: true });
        self.log(Severity::Info, "Scan started");
        Ok(())
    }

    /// Stop the scan loop, flush what it queued, then report analysis.
    /// Returns false if no scan was running.
    fn stop_scan(&self) -> bool {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return false;
        }

        let scan_loop = lock(&self.scan_loop).take();
        if let Some(scan_loop) = scan_loop {
            if !scan_loop.stop(self.settings.stop_timeout()) {
                self.log(Severity::Error, "Scan loop did not stop in time");
            }
        }

        self.flush_all_tags();
        self.emit_counts();
        self.emit(SessionEvent::ScanState { running: false });

        let results = self.analyze();
        self.log(
            Severity::Info,
            format!("Scan stopped, {} tag(s) passed analysis", results.len()),
        );
        self.emit(SessionEvent::Analysis { results });
        true
    }

    // ------------------------------------------------------------------------
    // Receive pipeline
    // ------------------------------------------------------------------------

    fn handle_transport_event(&self, reassembler: &mut FrameReassembler, event: TransportEvent) {
        match event {
            TransportEvent::Connected(role, name) => {
                if role == LinkRole::Reader {
                    reassembler.clear();
                }
                self.emit(SessionEvent::Connection {
                    role,
                    connected: true,
                    message: format!("Connected to {}", name),
                });
            }
            TransportEvent::Bytes(bytes) => {
                let now = Local::now();
                for decoded in reassembler.feed_decoded(&bytes) {
                    // Corrupt frames are dropped; the reader repeats often enough
                    if let Ok(frame) = decoded {
                        self.handle_reader_event(dispatch(&frame, now));
                    }
                }
            }
            TransportEvent::SensorEdge(sensor, at) | TransportEvent::SensorText(sensor, at) => {
                self.handle_sensor(sensor, at);
            }
            TransportEvent::Ended(role, reason) => {
                if role == LinkRole::Reader {
                    self.stop_scan();
                }
                if reason.starts_with("disconnected") {
                    self.log(Severity::Error, format!("The {} port was lost: {}", role, reason));
                }
                self.emit(SessionEvent::Connection {
                    role,
                    connected: false,
                    message: reason,
                });
            }
        }
    }

    fn handle_sensor(&self, sensor: SensorId, at: chrono::DateTime<Local>) {
        tlog!("[Sensor] Sensor {} activated", sensor.number());
        let Some(resolution) = self.correlator.activate(sensor, at) else {
            return;
        };

        self.log(
            Severity::Success,
            format!(
                "Direction {} ({:.1}ms between sensors)",
                resolution.direction, resolution.delta_ms
            ),
        );
        self.emit(SessionEvent::Direction {
            direction: resolution.direction,
            delta_ms: resolution.delta_ms,
        });

        if self.settings.stop_on_direction && self.scanning.load(Ordering::SeqCst) {
            self.stop_scan();
        }
    }

    fn handle_reader_event(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::TagRead(read) => {
                // Late responses after stop are ignored
                if !self.scanning.load(Ordering::SeqCst) {
                    return;
                }
                let mut tag = TagEvent::from_read(&read, 0);
                if let Some(outcome) = self.store.record_detailed(read) {
                    tag.count = outcome.epc_count;
                    self.tag_queue.push(tag);
                    if outcome.was_reset {
                        self.log(Severity::Info, "Read ceiling reached, inventory cleared");
                    }
                }
            }
            ReaderEvent::FirmwareInfo { version } => self.emit_info(ReaderInfo::Firmware(version)),
            ReaderEvent::ReaderIdInfo { id } => self.emit_info(ReaderInfo::ReaderId(id)),
            ReaderEvent::TemperatureInfo { text } => {
                self.emit_info(ReaderInfo::Temperature(text))
            }
            ReaderEvent::PowerLevels { levels } => {
                self.emit_info(ReaderInfo::PowerLevels(levels))
            }
            ReaderEvent::RfProfileInfo { profile } => {
                self.emit_info(ReaderInfo::RfProfile(profile))
            }
            ReaderEvent::FrequencyRegionInfo { region } => {
                self.emit_info(ReaderInfo::Region(region))
            }
            ReaderEvent::PowerSetAck { result } => self.emit_command_result(CMD_SET_POWER, result),
            ReaderEvent::SetCommandAck { command, result } => {
                self.emit_command_result(command, result)
            }
            ReaderEvent::GpioState { pins } => self.emit(SessionEvent::Gpio { pins }),
            ReaderEvent::S11Result { value } => self.emit(SessionEvent::S11 { value }),
            ReaderEvent::Truncated { command, payload } => {
                tlog!(
                    "[Session] Short {} response: {}",
                    command_name(command),
                    hex::encode_upper(&payload)
                );
            }
            ReaderEvent::Unrecognized { command, payload } => {
                tlog!(
                    "[Session] Unhandled response 0x{:02X}: {}",
                    command,
                    hex::encode_upper(&payload)
                );
            }
        }
    }

    fn emit_info(&self, info: ReaderInfo) {
        self.emit(SessionEvent::ReaderInfo { info });
    }

    fn emit_command_result(&self, command: u8, result: Result<(), CommandFailure>) {
        let name = command_name(command);
        match &result {
            Ok(()) => self.log(Severity::Success, format!("{} succeeded", name)),
            Err(failure) => self.log(
                Severity::Error,
                format!("{} failed: {} (0x{:02X})", name, failure.message, failure.code),
            ),
        }
        self.emit(SessionEvent::CommandResult {
            command,
            name,
            result,
        });
    }
}

impl ScanDriver for SessionShared {
    fn poll_frame(&self) -> Option<Vec<u8>> {
        match ReaderCommand::FastSwitchInventory(self.antenna_config()).encode(self.settings.reader_id)
        {
            Ok(frame) => Some(frame),
            Err(e) => {
                tlog!("[Scan] Failed to encode inventory poll: {}", e);
                None
            }
        }
    }

    fn send(&self, frame: &[u8]) -> bool {
        self.transport.send(frame)
    }

    fn flush_ui(&self) {
        self.flush_tag_batch();
    }
}

fn run_pipeline(shared: Arc<SessionShared>, transport_rx: std_mpsc::Receiver<TransportEvent>) {
    let mut reassembler = FrameReassembler::new();
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match transport_rx.recv_timeout(PIPELINE_IDLE_TICK) {
            Ok(event) => shared.handle_transport_event(&mut reassembler, event),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    if reassembler.discarded() > 0 {
        tlog!(
            "[Session] Receive pipeline ended, {} stray bytes discarded",
            reassembler.discarded()
        );
    }
}

// ============================================================================
// Session
// ============================================================================

/// A connected (or connectable) reader with its inventory state.
pub struct ReaderSession {
    shared: Arc<SessionShared>,
    pipeline: Option<JoinHandle<()>>,
}

impl ReaderSession {
    /// Create a session and the receiver for its events.
    pub fn new(settings: AppSettings) -> (Self, std_mpsc::Receiver<SessionEvent>) {
        let capacity = settings.event_channel_capacity.max(1);
        let (event_tx, event_rx) = std_mpsc::sync_channel(capacity);
        let (transport_tx, transport_rx) = std_mpsc::sync_channel(capacity);

        let transport = Transport::new(TransportConfig::from(&settings), transport_tx);
        let antennas = AntennaConfig::try_from_enabled(settings.antennas).unwrap_or_default();

        let shared = Arc::new(SessionShared {
            store: InventoryStore::new(settings.history_ceiling),
            tag_queue: TagQueue::new(settings.tag_queue_capacity),
            correlator: SensorCorrelator::new(),
            antennas: RwLock::new(antennas),
            scanning: AtomicBool::new(false),
            scan_loop: Mutex::new(None),
            events: event_tx,
            dropped_events: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            transport,
            settings,
        });

        let pipeline_shared = shared.clone();
        let pipeline = match std::thread::Builder::new()
            .name("receive-pipeline".to_string())
            .spawn(move || run_pipeline(pipeline_shared, transport_rx))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                tlog!("[Session] Failed to spawn receive pipeline: {}", e);
                None
            }
        };

        (Self { shared, pipeline }, event_rx)
    }

    pub fn settings(&self) -> &AppSettings {
        &self.shared.settings
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub fn connect_reader(&self, port_name: &str) -> Result<(), SessionError> {
        self.connect(LinkRole::Reader, port_name)
    }

    pub fn connect_sensor(&self, port_name: &str) -> Result<(), SessionError> {
        self.connect(LinkRole::Sensor, port_name)
    }

    fn connect(&self, role: LinkRole, port_name: &str) -> Result<(), SessionError> {
        if role == LinkRole::Reader {
            self.shared.stop_scan();
        }
        match self.shared.transport.connect(role, port_name) {
            Ok(()) => {
                self.shared.log(
                    Severity::Success,
                    format!("Opened {} port {}", role, port_name),
                );
                Ok(())
            }
            Err(e) => {
                self.shared.log(Severity::Error, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Use an already-open link as the reader connection.
    pub fn attach_reader(&self, name: &str, port: Box<dyn LinkPort>) {
        self.shared.stop_scan();
        self.shared.transport.attach(LinkRole::Reader, name, port);
    }

    /// Use an already-open link as the sensor connection.
    pub fn attach_sensor(&self, name: &str, port: Box<dyn LinkPort>) {
        self.shared.transport.attach(LinkRole::Sensor, name, port);
    }

    /// Stops any running scan first. Returns false if the reader was not connected.
    pub fn disconnect_reader(&self) -> bool {
        self.shared.stop_scan();
        self.shared.transport.disconnect(LinkRole::Reader)
    }

    pub fn disconnect_sensor(&self) -> bool {
        self.shared.transport.disconnect(LinkRole::Sensor)
    }

    pub fn is_connected(&self, role: LinkRole) -> bool {
        self.shared.transport.is_connected(role)
    }

    pub fn port_name(&self, role: LinkRole) -> Option<String> {
        self.shared.transport.port_name(role)
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    pub fn start_scan(&self, antennas: [bool; 4]) -> Result<(), SessionError> {
        self.shared.start_scan(antennas)
    }

    /// Returns false if no scan was running.
    pub fn stop_scan(&self) -> bool {
        self.shared.stop_scan()
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    /// Change the antenna selection. A running scan uses it from its next poll.
    pub fn set_antennas(&self, antennas: [bool; 4]) -> Result<(), SessionError> {
        let config = AntennaConfig::try_from_enabled(antennas)?;
        self.shared.set_antenna_config(config);
        Ok(())
    }

    pub fn antennas(&self) -> [bool; 4] {
        self.shared.antenna_config().enabled()
    }

    /// Drop all reads and forget the last direction.
    pub fn clear_data(&self) {
        self.shared.store.clear();
        self.shared.correlator.clear_direction();
        self.shared.tag_queue.clear();
        self.shared.emit_counts();
        self.shared.log(Severity::Info, "Inventory cleared");
    }

    /// (unique EPCs, total reads)
    pub fn counts(&self) -> (usize, usize) {
        self.shared.store.counts()
    }

    pub fn last_direction(&self) -> Direction {
        self.shared.correlator.last_direction()
    }

    /// Score the current history against the windows ending now.
    pub fn analyze(&self) -> Vec<AnalysisResult> {
        self.shared.analyze()
    }

    /// Stored reads with marks for the last resolved sensor activations.
    pub fn history_rows(&self) -> Vec<HistoryRow> {
        let resolution = self.shared.correlator.last_resolution();
        self.shared.store.history_rows(
            resolution.as_ref().map(|r| r.sensor1_at),
            resolution.as_ref().map(|r| r.sensor2_at),
            self.shared.settings.sensor_mark_tolerance_ms,
        )
    }

    // ------------------------------------------------------------------------
    // Reader commands
    // ------------------------------------------------------------------------

    /// Validate, encode and write a command. Its response arrives as an event.
    pub fn send_command(&self, command: &ReaderCommand) -> Result<(), SessionError> {
        self.shared.send_command(command)
    }

    pub fn request_firmware(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetFirmware)
    }

    pub fn request_reader_id(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetReaderId)
    }

    pub fn request_temperature(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetTemperature)
    }

    /// Same output power on every antenna, 0-33 dBm.
    pub fn set_power(&self, dbm: u8) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::SetPower(dbm))
    }

    pub fn set_power_per_antenna(&self, levels: [u8; 4]) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::SetPowerPerAntenna(levels))
    }

    pub fn request_power(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetPower)
    }

    /// Power query for eight-port readers.
    pub fn request_power_eight(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetPowerEight)
    }

    pub fn set_region(&self, region: Region) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::SetFrequencyRegion(region))
    }

    pub fn request_region(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetFrequencyRegion)
    }

    pub fn set_rf_profile(&self, code: u8) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::SetRfProfile(code))
    }

    pub fn request_rf_profile(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::GetRfProfile)
    }

    pub fn set_beeper(&self, mode: BeeperMode) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::SetBeeper(mode))
    }

    pub fn reset_reader(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::Reset)
    }

    pub fn read_gpio(&self) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::ReadGpio)
    }

    pub fn write_gpio(&self, pin: u8, level: bool) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::WriteGpio { pin, level })
    }

    pub fn measure_s11(&self, freq_index: u8) -> Result<(), SessionError> {
        self.send_command(&ReaderCommand::MeasureS11 { freq_index })
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop scanning, close both ports and end the receive pipeline.
    pub fn shutdown(&mut self) {
        self.shared.stop_scan();
        self.shared.transport.disconnect_all();
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.pipeline.take() {
            if handle.join().is_err() {
                tlog!("[Session] Receive pipeline panicked");
            }
        }
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
