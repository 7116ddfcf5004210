//! Desktop simulator for the vmon battery voltage logger.
//!
//! Runs the vmon-core task set on the embassy std executor against emulated
//! hardware, so the HTTP interface and the log format can be exercised
//! without a board:
//!
//! | Device        | Emulation                                          |
//! |---------------|----------------------------------------------------|
//! | Divider + ADC | slowly discharging 12 V battery with ripple        |
//! | DS3231        | host clock plus an offset moved by `/set_rtc`      |
//! | SD card       | files under the data directory                     |
//! | Network       | TCP listener on localhost                          |
//! | RTC watchdog  | monitor thread that exits the process when starved |
//!
//! # Environment
//!
//! | Variable              | Default    |
//! |-----------------------|------------|
//! | `VMON_SIM_PORT`       | `8080`     |
//! | `VMON_SIM_DATA_DIR`   | `sim-data` |
//! | `VMON_SIM_CARD_BYTES` | `67108864` |
//!
//! ```text
//! curl http://127.0.0.1:8080/
//! curl "http://127.0.0.1:8080/set_rtc?to=,2025,11,9,23,12,30,"
//! ```

use std::convert::Infallible;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};

use embassy_executor::Spawner;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use embedded_hal_async::i2c::{self, ErrorKind as I2cErrorKind, I2c, Operation};
use log::{debug, error, info, trace, warn};

use vmon_core::acquisition::{Acquisition, AnalogInput};
use vmon_core::calibration::{AdcScale, CalibrationConstants};
use vmon_core::config::Timing;
use vmon_core::http::RequestHandler;
use vmon_core::log_store::{LogBackend, LogStore};
use vmon_core::rtc::{CalendarTimestamp, DS3231_ADDRESS};
use vmon_core::scheduler::{
    self, Connection, EmbassyClock, Listener, Liveness, Sampler, Server, Suspend, Watchdog,
};
use vmon_core::shared_i2c::{ClockBus, shared_clock};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "sim-data";
/// Size of the emulated SD card
const DEFAULT_CARD_BYTES: u64 = 64 * 1024 * 1024;

/// Divider used when the data directory has no `OHMS.TXT`
const DEFAULT_OHMS: &str = "47000\n10000\n";
/// Correction used when the data directory has no `CALIB.TXT`
const DEFAULT_CALIB: &str = "1.0\n0.0\n";

/// Same budget the firmware gives the RTC watchdog
const STALL_LIMIT: std::time::Duration = std::time::Duration::from_secs(8);

/// Poll period for nonblocking sockets
const SOCKET_POLL: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// Emulated divider and converter
// ---------------------------------------------------------------------------

/// Battery that starts full and sags toward a floor, with a little ripple.
struct EmulatedAdc {
    started: Instant,
    scale: AdcScale,
    calibration: CalibrationConstants,
    noise: u32,
}

impl EmulatedAdc {
    const FULL_VOLTS: f64 = 12.7;
    const FLOOR_VOLTS: f64 = 11.6;
    const SAG_PER_SEC: f64 = 0.0005;
    const RIPPLE_VOLTS: f64 = 0.02;

    fn new(scale: AdcScale, calibration: CalibrationConstants) -> Self {
        Self {
            started: Instant::now(),
            scale,
            calibration,
            noise: 0x1234_5678,
        }
    }

    /// Cheap deterministic noise in [-1, 1)
    fn next_noise(&mut self) -> f64 {
        self.noise = self.noise.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        f64::from(self.noise >> 16) / 32_768.0 - 1.0
    }

    fn battery_volts(&mut self) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        let sagged = (Self::FULL_VOLTS - Self::SAG_PER_SEC * t).max(Self::FLOOR_VOLTS);
        sagged + Self::RIPPLE_VOLTS * self.next_noise()
    }
}

impl AnalogInput for EmulatedAdc {
    type Error = Infallible;

    fn read_raw(&mut self) -> Result<u16, Infallible> {
        // Run the calibration chain backwards from the true battery voltage
        let v_cal = self.battery_volts();
        let (a, b) = self.calibration.terms();
        let v_in = (v_cal - b) / a;
        let r_high = self.calibration.r_high();
        let r_low = self.calibration.r_low();
        let v_adc = v_in * r_low / (r_high + r_low);
        let raw = v_adc / self.scale.reference_volts * self.scale.full_scale;
        Ok(raw.round().clamp(0.0, f64::from(u16::MAX)) as u16)
    }
}

// ---------------------------------------------------------------------------
// Emulated DS3231
// ---------------------------------------------------------------------------

fn timestamp_from_datetime(dt: &NaiveDateTime) -> Option<CalendarTimestamp> {
    CalendarTimestamp::new(
        u16::try_from(dt.year()).ok()?,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
}

fn datetime_from_timestamp(ts: &CalendarTimestamp) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(
        i32::from(ts.year()),
        u32::from(ts.month()),
        u32::from(ts.day()),
    )?
    .and_hms_opt(
        u32::from(ts.hour()),
        u32::from(ts.minute()),
        u32::from(ts.second()),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NoDevice;

impl i2c::Error for NoDevice {
    fn kind(&self) -> I2cErrorKind {
        I2cErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address)
    }
}

/// Time registers tracking the host clock, shifted by whatever was last set.
struct EmulatedDs3231 {
    offset: TimeDelta,
    pointer: usize,
}

impl EmulatedDs3231 {
    fn new() -> Self {
        Self {
            offset: TimeDelta::zero(),
            pointer: 0,
        }
    }

    fn registers(&self) -> [u8; 7] {
        timestamp_from_datetime(&(Utc::now().naive_utc() + self.offset))
            .map(|ts| ts.to_registers())
            .unwrap_or_default()
    }

    fn store(&mut self, start: usize, data: &[u8]) {
        let mut regs = self.registers();
        for (i, &b) in data.iter().enumerate() {
            if let Some(slot) = regs.get_mut(start + i) {
                *slot = b;
            }
        }
        match CalendarTimestamp::from_registers(&regs)
            .and_then(|ts| Some((ts, datetime_from_timestamp(&ts)?)))
        {
            Some((ts, target)) => {
                self.offset = target - Utc::now().naive_utc();
                info!("Emulated RTC set to {} (offset {} s)", ts, self.offset.num_seconds());
            }
            None => warn!("Emulated RTC ignored invalid registers {:02x?}", regs),
        }
    }
}

impl i2c::ErrorType for EmulatedDs3231 {
    type Error = NoDevice;
}

impl I2c for EmulatedDs3231 {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), NoDevice> {
        if address != DS3231_ADDRESS {
            return Err(NoDevice);
        }

        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if let Some((&reg, data)) = bytes.split_first() {
                        self.pointer = usize::from(reg);
                        if !data.is_empty() {
                            self.store(self.pointer, data);
                            self.pointer += data.len();
                        }
                    }
                }
                Operation::Read(buf) => {
                    let regs = self.registers();
                    for b in buf.iter_mut() {
                        *b = regs.get(self.pointer).copied().unwrap_or(0);
                        self.pointer += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Emulated SD card
// ---------------------------------------------------------------------------

/// The log file as a plain host file.
///
/// The data directory stands in for a card of `capacity` bytes; free space
/// is whatever its files do not occupy.
struct FileLog {
    dir: PathBuf,
    path: PathBuf,
    capacity: u64,
}

impl FileLog {
    fn new(dir: &Path, capacity: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join("LOG.CSV"),
            capacity,
        }
    }
}

impl LogBackend for FileLog {
    type Error = io::Error;

    fn exists(&mut self) -> io::Result<bool> {
        self.path.try_exists()
    }

    fn create(&mut self, initial: &[u8]) -> io::Result<()> {
        fs::write(&self.path, initial)
    }

    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_data()
    }

    fn len(&mut self) -> io::Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn remove(&mut self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn free_space(&mut self) -> io::Result<u64> {
        let mut used = 0u64;
        for entry in fs::read_dir(&self.dir)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                used += metadata.len();
            }
        }
        Ok(self.capacity.saturating_sub(used))
    }
}

/// Boot file from the data directory, or `fallback` when it is absent.
fn boot_file(dir: &Path, name: &str, fallback: &str) -> String {
    match fs::read_to_string(dir.join(name)) {
        Ok(text) => text,
        Err(e) => {
            warn!("{} not loaded ({}); using built-in default", name, e);
            fallback.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Nonblocking host listener; `accept` never waits.
struct HostListener {
    inner: TcpListener,
}

impl HostListener {
    fn bind(port: u16) -> io::Result<Self> {
        let inner = TcpListener::bind(("127.0.0.1", port))?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }
}

impl Listener for HostListener {
    type Error = io::Error;
    type Connection<'a> = HostConnection;

    async fn accept(&mut self) -> io::Result<Option<HostConnection>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                debug!("accepted {}", peer);
                stream.set_nonblocking(true)?;
                Ok(Some(HostConnection { stream }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Nonblocking stream that parks on the embassy timer instead of the OS.
struct HostConnection {
    stream: TcpStream,
}

impl embedded_io_async::ErrorType for HostConnection {
    type Error = io::Error;
}

impl embedded_io_async::Read for HostConnection {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => Timer::after(SOCKET_POLL).await,
                other => return other,
            }
        }
    }
}

impl embedded_io_async::Write for HostConnection {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.write(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => Timer::after(SOCKET_POLL).await,
                other => return other,
            }
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for HostConnection {
    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// LED and watchdog
// ---------------------------------------------------------------------------

/// Activity LED reduced to trace output.
struct ConsoleLed;

impl embedded_hal::digital::ErrorType for ConsoleLed {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for ConsoleLed {
    fn set_low(&mut self) -> Result<(), Infallible> {
        trace!("LED off");
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        trace!("LED on");
        Ok(())
    }
}

/// Stands in for the RTC watchdog: a host thread ends the process when
/// pulses stop for longer than [`STALL_LIMIT`].
struct StallMonitor {
    started: Instant,
    last_pulse_ms: Arc<AtomicU64>,
}

impl StallMonitor {
    fn start() -> Self {
        let started = Instant::now();
        let last_pulse_ms = Arc::new(AtomicU64::new(0));

        let seen = Arc::clone(&last_pulse_ms);
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(std::time::Duration::from_secs(1));
                let now_ms = started.elapsed().as_millis() as u64;
                let quiet_ms = now_ms.saturating_sub(seen.load(Ordering::Relaxed));
                if quiet_ms > STALL_LIMIT.as_millis() as u64 {
                    error!("No liveness pulse for {} ms; resetting", quiet_ms);
                    std::process::exit(1);
                }
            }
        });

        Self {
            started,
            last_pulse_ms,
        }
    }
}

impl Liveness for StallMonitor {
    fn pulse(&mut self) {
        self.last_pulse_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    env_logger::init();
    info!("Starting vmon simulator");

    let port = std::env::var("VMON_SIM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let data_dir = PathBuf::from(
        std::env::var("VMON_SIM_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()),
    );
    if let Err(e) = fs::create_dir_all(&data_dir) {
        error!("Cannot create {}: {}", data_dir.display(), e);
        return;
    }

    let ohms = boot_file(&data_dir, "OHMS.TXT", DEFAULT_OHMS);
    let calib = boot_file(&data_dir, "CALIB.TXT", DEFAULT_CALIB);
    let calibration = match CalibrationConstants::parse(&ohms, &calib) {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid calibration files: {}", e);
            return;
        }
    };
    info!(
        "Calibration: R_HIGH={} R_LOW={}",
        calibration.r_high(),
        calibration.r_low()
    );

    let card_bytes = std::env::var("VMON_SIM_CARD_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CARD_BYTES);
    let log = LogStore::new(FileLog::new(&data_dir, card_bytes));
    if let Err(e) = log.ensure_header().await {
        error!("Log file not ready: {}", e);
    }
    info!("Log file: {}", data_dir.join("LOG.CSV").display());

    let clock_bus: ClockBus<EmulatedDs3231> = Mutex::new(EmulatedDs3231::new());

    let listener = match HostListener::bind(port) {
        Ok(l) => l,
        Err(e) => {
            error!("Cannot listen on port {}: {}", port, e);
            return;
        }
    };
    info!("Serving on http://127.0.0.1:{}/", port);

    let scale = AdcScale::default();
    let sampler = Sampler::new(
        EmulatedAdc::new(scale, calibration),
        Acquisition::new(scale, calibration),
        shared_clock(&clock_bus),
        &log,
        ConsoleLed,
    );
    let server = Server::new(
        listener,
        RequestHandler::new(&log, shared_clock(&clock_bus)),
    );
    let watchdog = Watchdog::new(StallMonitor::start());

    let clock = EmbassyClock;
    let suspend = Suspend::new(&clock, Timing::DEFAULT);
    match scheduler::run(&suspend, sampler, server, watchdog).await {}
}
