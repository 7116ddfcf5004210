//! Append-only CSV log of calibrated readings
//!
//! The file starts with a fixed header row, written exactly once when the
//! file is (re)created. Records are only ever appended. The store wraps a
//! [`LogBackend`] in an async mutex so the sampler and the server can share
//! it by reference; every public operation takes the lock for one backend
//! call sequence and releases it before awaiting anything else.

use core::fmt::{self, Write as _};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_io_async::Write;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::acquisition::Reading;
use crate::config::{LOG_CHUNK_SIZE, MIN_FREE_SPACE};
use crate::io::{SendError, send_all};
use crate::rtc::CalendarTimestamp;

/// First line of every log file
pub const HEADER: &str = "ts,vin_volts,adc_volts,smoothed,oversampled,rtc_ts\r\n";

/// Longest formatted record line accepted
pub const MAX_LINE_LEN: usize = 128;

/// Storage port for the single log file.
///
/// Implementations are blocking but bounded (flash or SD card I/O).
pub trait LogBackend {
    type Error: fmt::Debug;

    fn exists(&mut self) -> Result<bool, Self::Error>;

    /// Create or truncate the file so it holds exactly `initial`.
    fn create(&mut self, initial: &[u8]) -> Result<(), Self::Error>;

    /// Append `bytes` with a single write and flush it.
    fn append(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    fn len(&mut self) -> Result<u64, Self::Error>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Delete the file. Deleting a missing file is not an error.
    fn remove(&mut self) -> Result<(), Self::Error>;

    /// Bytes still available on the medium holding the file.
    fn free_space(&mut self) -> Result<u64, Self::Error>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError<E> {
    #[error("log storage error: {0:?}")]
    Backend(E),
    #[error("record does not fit in one log line")]
    LineTooLong,
    #[error("only {free} bytes free, need {required}")]
    LowSpace { free: u64, required: u64 },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError<E, W> {
    #[error("{0}")]
    Log(LogError<E>),
    #[error("{0}")]
    Sink(SendError<W>),
    #[error("log shrank while streaming")]
    Truncated,
}

/// One persisted reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRecord {
    /// Whole seconds since boot
    pub monotonic_ts: u64,
    pub vin_calibrated: f64,
    pub adc_voltage: f64,
    pub smoothed_raw: f64,
    pub oversampled_raw: f64,
    pub rtc_ts: CalendarTimestamp,
}

impl LogRecord {
    pub fn new(monotonic_ts: u64, reading: &Reading, rtc_ts: CalendarTimestamp) -> Self {
        Self {
            monotonic_ts,
            vin_calibrated: reading.vin_calibrated,
            adc_voltage: reading.adc_voltage,
            smoothed_raw: reading.smoothed_raw,
            oversampled_raw: reading.oversampled_raw,
            rtc_ts,
        }
    }

    /// The full CSV line including its `\r\n` terminator.
    pub fn to_line(&self) -> Option<heapless::String<MAX_LINE_LEN>> {
        let mut line = heapless::String::new();
        write!(line, "{self}\r\n").ok()?;
        Some(line)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.3},{:.4},{:.1},{:.1},{}",
            self.monotonic_ts,
            self.vin_calibrated,
            self.adc_voltage,
            self.smoothed_raw,
            self.oversampled_raw,
            self.rtc_ts
        )
    }
}

pub struct LogStore<B> {
    backend: Mutex<CriticalSectionRawMutex, B>,
    min_free: u64,
}

impl<B: LogBackend> LogStore<B> {
    pub const fn new(backend: B) -> Self {
        Self::with_min_free(backend, MIN_FREE_SPACE)
    }

    /// Refuse appends once fewer than `min_free` bytes remain.
    pub const fn with_min_free(backend: B, min_free: u64) -> Self {
        Self {
            backend: Mutex::new(backend),
            min_free,
        }
    }

    /// Write the header if the file is missing or empty. Idempotent.
    pub async fn ensure_header(&self) -> Result<(), LogError<B::Error>> {
        let mut backend = self.backend.lock().await;
        Self::ensure_header_locked(&mut backend)
    }

    fn ensure_header_locked(backend: &mut B) -> Result<(), LogError<B::Error>> {
        let present = backend.exists().map_err(LogError::Backend)?
            && backend.len().map_err(LogError::Backend)? > 0;
        if !present {
            info!("Creating log file with header");
            backend.create(HEADER.as_bytes()).map_err(LogError::Backend)?;
        }
        Ok(())
    }

    /// Append one record, recreating the header first if the file is gone.
    /// Nothing is written while the medium is below the free-space floor.
    ///
    /// The line is formatted in full and handed to the backend in a single
    /// write.
    pub async fn append(&self, record: &LogRecord) -> Result<(), LogError<B::Error>> {
        let line = record.to_line().ok_or(LogError::LineTooLong)?;
        let mut backend = self.backend.lock().await;

        let free = backend.free_space().map_err(LogError::Backend)?;
        if free < self.min_free {
            warn!("Append skipped: {} bytes free, need {}", free, self.min_free);
            return Err(LogError::LowSpace {
                free,
                required: self.min_free,
            });
        }

        Self::ensure_header_locked(&mut backend)?;
        backend
            .append(line.as_bytes())
            .map_err(LogError::Backend)
    }

    /// Capture the current length for a consistent download.
    pub async fn snapshot(&self) -> Result<LogSnapshot<'_, B>, LogError<B::Error>> {
        let mut backend = self.backend.lock().await;
        Self::ensure_header_locked(&mut backend)?;
        let len = backend.len().map_err(LogError::Backend)?;
        Ok(LogSnapshot { store: self, len })
    }

    /// Delete the log file.
    pub async fn clear(&self) -> Result<(), LogError<B::Error>> {
        let mut backend = self.backend.lock().await;
        backend.remove().map_err(LogError::Backend)?;
        info!("Log file cleared");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut backend = self.backend.lock().await;
        f(&mut backend)
    }
}

/// Fixed-length view of the log taken by [`LogStore::snapshot`].
pub struct LogSnapshot<'s, B> {
    store: &'s LogStore<B>,
    len: u64,
}

impl<B: LogBackend> LogSnapshot<'_, B> {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stream exactly `len` bytes to `sink` in bounded chunks.
    ///
    /// The store lock is held only while a chunk is read, so the sampler
    /// can keep appending during a slow download. Bytes appended after the
    /// snapshot are not sent.
    pub async fn read_all<W: Write>(
        &self,
        sink: &mut W,
    ) -> Result<u64, StreamError<B::Error, W::Error>> {
        let mut chunk = [0u8; LOG_CHUNK_SIZE];
        let mut offset = 0u64;

        while offset < self.len {
            let want = (self.len - offset).min(LOG_CHUNK_SIZE as u64) as usize;
            let n = {
                let mut backend = self.store.backend.lock().await;
                backend
                    .read_at(offset, &mut chunk[..want])
                    .map_err(|e| StreamError::Log(LogError::Backend(e)))?
            };
            if n == 0 {
                return Err(StreamError::Truncated);
            }
            send_all(sink, &chunk[..n]).await.map_err(StreamError::Sink)?;
            offset += n as u64;
        }

        debug!("Streamed {} log bytes", offset);
        Ok(offset)
    }
}
