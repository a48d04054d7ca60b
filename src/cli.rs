// src/cli.rs
//
// `uhf-gate` command line.
//
// Every reader subcommand opens a session, writes its command(s), and prints the
// session's events until the reader has had time to answer. `scan` runs until
// Ctrl-C, the optional duration, or a sensor-triggered stop.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::io::serial::{list_serial_ports, suggest_reader_port};
use crate::logging::{init_file_logging, stop_file_logging};
use crate::protocol::{BeeperMode, Region};
use crate::session::{ReaderInfo, ReaderSession, SessionEvent};
use crate::settings::{default_settings_path, load_settings, AppSettings};

/// Time allowed for replies to on-demand commands.
const RESPONSE_WAIT: Duration = Duration::from_millis(500);

// ============================================================================
// Arguments
// ============================================================================

/// UHF RFID gate controller
#[derive(Parser, Debug)]
#[command(name = "uhf-gate")]
#[command(author, version, about = "UHF RFID reader and gate controller")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (default: <config dir>/uhf-gate/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Reader serial port; auto-detected when omitted
    #[arg(long, short, global = true)]
    pub port: Option<String>,

    /// Print session events as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Use the single-board computer scan cadence
    #[arg(long, global = true)]
    pub embedded: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List serial ports and the suggested reader port
    Ports,

    /// Run an inventory scan
    Scan {
        /// Antennas to enable, e.g. 1,2
        #[arg(long, value_delimiter = ',')]
        antennas: Option<Vec<u8>>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Serial port of the sensor board (#1/#2 text protocol)
        #[arg(long)]
        sensor_port: Option<String>,
    },

    /// Query firmware, reader id, temperature, power, region and RF profile
    Info,

    /// Set output power: one value for all antennas, or four values
    SetPower {
        #[arg(required = true, num_args = 1..=4)]
        dbm: Vec<u8>,
    },

    /// Set the frequency region (us, china, vietnam, europe, custom)
    SetRegion {
        region: String,
        #[arg(long)]
        code: Option<u8>,
        #[arg(long)]
        start: Option<u8>,
        #[arg(long)]
        end: Option<u8>,
    },

    /// Set the RF link profile (D0-D3)
    SetProfile { profile: String },

    /// Set the beeper mode
    Beeper { mode: BeeperArg },

    /// Read the GPIO input levels
    GpioRead,

    /// Drive a GPIO output
    GpioWrite { pin: u8, level: u8 },

    /// Measure antenna S11 at a frequency index
    S11 { freq_index: u8 },

    /// Reset the reader
    Reset,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum BeeperArg {
    Quiet,
    PerTag,
}

impl From<BeeperArg> for BeeperMode {
    fn from(arg: BeeperArg) -> Self {
        match arg {
            BeeperArg::Quiet => BeeperMode::Quiet,
            BeeperArg::PerTag => BeeperMode::PerTag,
        }
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
pub async fn run() {
    let cli = Cli::parse();
    let result = execute(cli).await;
    stop_file_logging();
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<(), String> {
    let settings = resolve_settings(&cli)?;

    if let Some(dir) = settings.log_dir.as_deref() {
        init_file_logging(std::path::Path::new(dir))?;
    }

    if let Commands::Ports = cli.command {
        return print_ports(cli.json);
    }

    let port = resolve_reader_port(&cli, &settings)?;
    let (session, events) = ReaderSession::new(settings);
    let session = Arc::new(session);

    let (scan_done_tx, scan_done_rx) = watch::channel(false);
    let json = cli.json;
    let printer = tokio::task::spawn_blocking(move || print_events(events, json, scan_done_tx));

    let result = run_command(session.clone(), &port, cli.command, scan_done_rx).await;

    // Dropping the last handle shuts the session down and closes the event stream
    let close = tokio::task::spawn_blocking(move || drop(session));
    let _ = close.await;
    let _ = printer.await;
    result
}

fn resolve_settings(cli: &Cli) -> Result<AppSettings, String> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_settings_path()?,
    };
    let mut settings = load_settings(&path)?;
    if cli.embedded {
        let embedded = AppSettings::embedded();
        settings.scan_interval_ms = embedded.scan_interval_ms;
        settings.ui_batch_interval_ms = embedded.ui_batch_interval_ms;
    }
    Ok(settings)
}

fn resolve_reader_port(cli: &Cli, settings: &AppSettings) -> Result<String, String> {
    if let Some(port) = cli.port.clone().or_else(|| settings.reader.port.clone()) {
        return Ok(port);
    }
    let ports = list_serial_ports()?;
    suggest_reader_port(&ports)
        .map(|p| p.port_name.clone())
        .ok_or_else(|| "No reader port found, pass --port".to_string())
}

/// Run a blocking session call off the async runtime.
async fn blocking<T, F>(session: &Arc<ReaderSession>, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&ReaderSession) -> Result<T, String> + Send + 'static,
{
    let session = session.clone();
    tokio::task::spawn_blocking(move || f(&session))
        .await
        .map_err(|e| format!("Failed to run session task: {}", e))?
}

async fn run_command(
    session: Arc<ReaderSession>,
    port: &str,
    command: Commands,
    mut scan_done: watch::Receiver<bool>,
) -> Result<(), String> {
    let reader_port = port.to_string();
    blocking(&session, move |s| {
        s.connect_reader(&reader_port).map_err(|e| e.to_string())
    })
    .await?;

    match command {
        Commands::Ports => Ok(()),
        Commands::Scan {
            antennas,
            duration,
            sensor_port,
        } => {
            let mask = match antennas {
                Some(list) => antenna_mask(&list)?,
                None => session.settings().antennas,
            };
            if let Some(sensor_port) = sensor_port {
                blocking(&session, move |s| {
                    s.connect_sensor(&sensor_port).map_err(|e| e.to_string())
                })
                .await?;
            }
            blocking(&session, move |s| s.start_scan(mask).map_err(|e| e.to_string())).await?;

            let timer = async {
                match duration {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tlog!("[cli] Interrupted, stopping scan");
                }
                _ = timer => {}
                _ = scan_done.wait_for(|done| *done) => {}
            }

            blocking(&session, |s| Ok(s.stop_scan())).await?;
            Ok(())
        }
        Commands::Info => {
            blocking(&session, |s| {
                s.request_firmware()
                    .and_then(|_| s.request_reader_id())
                    .and_then(|_| s.request_temperature())
                    .and_then(|_| s.request_power())
                    .and_then(|_| s.request_region())
                    .and_then(|_| s.request_rf_profile())
                    .map_err(|e| e.to_string())
            })
            .await?;
            tokio::time::sleep(RESPONSE_WAIT).await;
            Ok(())
        }
        other => {
            let request = reader_request(other)?;
            blocking(&session, move |s| request(s)).await?;
            tokio::time::sleep(RESPONSE_WAIT).await;
            Ok(())
        }
    }
}

type Request = Box<dyn FnOnce(&ReaderSession) -> Result<(), String> + Send>;

/// Validate arguments of a one-shot command and build the session call.
fn reader_request(command: Commands) -> Result<Request, String> {
    let request: Request = match command {
        Commands::SetPower { dbm } => match dbm.as_slice() {
            [all] => {
                let all = *all;
                Box::new(move |s: &ReaderSession| s.set_power(all).map_err(|e| e.to_string()))
            }
            [a, b, c, d] => {
                let levels = [*a, *b, *c, *d];
                Box::new(move |s: &ReaderSession| s.set_power_per_antenna(levels).map_err(|e| e.to_string()))
            }
            _ => return Err("Give one power value or four".to_string()),
        },
        Commands::SetRegion {
            region,
            code,
            start,
            end,
        } => {
            let region = parse_region(&region, code, start, end)?;
            Box::new(move |s: &ReaderSession| s.set_region(region).map_err(|e| e.to_string()))
        }
        Commands::SetProfile { profile } => {
            let code = parse_profile(&profile)?;
            Box::new(move |s: &ReaderSession| s.set_rf_profile(code).map_err(|e| e.to_string()))
        }
        Commands::Beeper { mode } => {
            Box::new(move |s: &ReaderSession| s.set_beeper(mode.into()).map_err(|e| e.to_string()))
        }
        Commands::GpioRead => Box::new(|s: &ReaderSession| s.read_gpio().map_err(|e| e.to_string())),
        Commands::GpioWrite { pin, level } => {
            Box::new(move |s: &ReaderSession| s.write_gpio(pin, level != 0).map_err(|e| e.to_string()))
        }
        Commands::S11 { freq_index } => {
            Box::new(move |s: &ReaderSession| s.measure_s11(freq_index).map_err(|e| e.to_string()))
        }
        Commands::Reset => Box::new(|s: &ReaderSession| s.reset_reader().map_err(|e| e.to_string())),
        Commands::Ports | Commands::Scan { .. } | Commands::Info => {
            return Err("Not a one-shot reader command".to_string())
        }
    };
    Ok(request)
}

// ============================================================================
// Argument Parsing
// ============================================================================

fn antenna_mask(antennas: &[u8]) -> Result<[bool; 4], String> {
    let mut mask = [false; 4];
    for antenna in antennas {
        match antenna {
            1..=4 => mask[(*antenna - 1) as usize] = true,
            other => return Err(format!("Invalid antenna {} (expected 1-4)", other)),
        }
    }
    Ok(mask)
}

fn parse_profile(text: &str) -> Result<u8, String> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("Invalid RF profile '{}': {}", text, e))
}

fn parse_region(
    name: &str,
    code: Option<u8>,
    start: Option<u8>,
    end: Option<u8>,
) -> Result<Region, String> {
    if name.eq_ignore_ascii_case("custom") {
        return match (code, start, end) {
            (Some(code), Some(start), Some(end)) => Ok(Region::Custom { code, start, end }),
            _ => Err("A custom region needs --code, --start and --end".to_string()),
        };
    }
    Region::from_name(name).map_err(|e| e.to_string())
}

// ============================================================================
// Output
// ============================================================================

fn print_ports(json: bool) -> Result<(), String> {
    let ports = list_serial_ports()?;
    let suggested = suggest_reader_port(&ports).map(|p| p.port_name.clone());

    if json {
        let line = serde_json::to_string(&ports)
            .map_err(|e| format!("Failed to serialize ports: {}", e))?;
        println!("{}", line);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        let marker = if suggested.as_deref() == Some(port.port_name.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<20} {:<8} {}",
            marker,
            port.port_name,
            port.port_type,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_events(
    events: std_mpsc::Receiver<SessionEvent>,
    json: bool,
    scan_done: watch::Sender<bool>,
) {
    for event in events.iter() {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tlog!("[cli] Failed to serialize event: {}", e),
            }
        } else {
            for line in describe(&event) {
                println!("{}", line);
            }
        }

        if let SessionEvent::ScanState { running: false } = event {
            let _ = scan_done.send(true);
        }
    }
}

/// Human-readable lines for an event.
fn describe(event: &SessionEvent) -> Vec<String> {
    match event {
        SessionEvent::TagBatch { tags } => tags
            .iter()
            .map(|t| {
                format!(
                    "{} ant{} {} rssi {} {} MHz x{}",
                    t.read_time.format("%H:%M:%S%.3f"),
                    t.antenna,
                    t.epc,
                    t.rssi,
                    t.frequency,
                    t.count
                )
            })
            .collect(),
        SessionEvent::Counts { unique, total } => {
            vec![format!("unique {} / total {}", unique, total)]
        }
        SessionEvent::Direction {
            direction,
            delta_ms,
        } => vec![format!("direction {} ({:.1} ms)", direction, delta_ms)],
        SessionEvent::ReaderInfo { info } => vec![match info {
            ReaderInfo::Firmware(v) => format!("firmware {}", v),
            ReaderInfo::ReaderId(id) => format!("reader id {}", id),
            ReaderInfo::Temperature(t) => format!("temperature {}", t),
            ReaderInfo::PowerLevels(levels) => format!("power {:?} dBm", levels),
            ReaderInfo::RfProfile(p) => format!("rf profile 0x{:02X}", p),
            ReaderInfo::Region(r) => {
                let (code, start, end) = r.params();
                format!("region {:?} (code {}, channels {}-{})", r, code, start, end)
            }
        }],
        SessionEvent::Gpio { pins } => vec![format!(
            "gpio {}",
            pins.iter()
                .enumerate()
                .map(|(i, on)| format!("{}={}", i + 1, u8::from(*on)))
                .collect::<Vec<_>>()
                .join(" ")
        )],
        SessionEvent::S11 { value } => vec![format!("s11 {}", value)],
        // Outcomes are also reported as log lines
        SessionEvent::CommandResult { .. } => Vec::new(),
        SessionEvent::Analysis { results } => {
            let mut lines = vec![format!("{} tag(s) passed analysis", results.len())];
            lines.extend(results.iter().map(|r| {
                format!(
                    "  {} ant1 {:.1} ant2 {:.1} all {:.1} {}",
                    r.epc, r.confidence_ant1, r.confidence_ant2, r.confidence_all, r.direction
                )
            }));
            lines
        }
        SessionEvent::Connection {
            role,
            connected,
            message,
        } => vec![format!(
            "{} {}: {}",
            role,
            if *connected { "connected" } else { "disconnected" },
            message
        )],
        SessionEvent::ScanState { running } => {
            vec![format!("scan {}", if *running { "running" } else { "stopped" })]
        }
        SessionEvent::Log(line) => vec![format!("[{}] {}", line.severity.label(), line.message)],
    }
}

// ============================================================================
// Tests
// ============================================================================
