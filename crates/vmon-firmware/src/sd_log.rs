//! SD card access: the CSV log file and the boot configuration files
//!
//! All operations are blocking, like the rest of the SPI traffic. Each call
//! opens the volume and root directory, does one thing and closes them
//! again, so a card pulled between calls only fails that call.

use embedded_sdmmc::{
    Error, Mode, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager,
};
use log::{debug, info};
use vmon_core::log_store::LogBackend;

/// Name of the log file in the card's root directory
pub const LOG_FILE: &str = "LOG.CSV";

pub type SdError = Error<SdCardError>;

/// Directory timestamps for files this firmware creates.
///
/// The DS3231 sits behind an async bus and cannot be read from here, so
/// every file is stamped with the same fixed date.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTime;

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 55,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub struct SdStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
    /// Card size in bytes, read once at startup
    capacity: u64,
}

impl<S, D, T> SdStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    /// Initializes the card to learn its size.
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Result<Self, SdError> {
        let capacity = sd_card.num_bytes().map_err(Error::DeviceError)?;
        info!("SD card: {} MB", capacity / (1024 * 1024));
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Ok(Self {
            volume_mgr,
            capacity,
        })
    }

    /// Read a small text file from the root directory into `buf`.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn read_text<'b>(
        &self,
        file_name: &str,
        buf: &'b mut [u8],
    ) -> Result<Option<&'b str>, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let file = match root_dir.open_file_in_dir(file_name, Mode::ReadOnly) {
            Ok(file) => file,
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut len = 0;
        while len < buf.len() {
            let n = file.read(&mut buf[len..])?;
            if n == 0 {
                break;
            }
            len += n;
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        debug!("Read {} bytes from {}", len, file_name);
        Ok(core::str::from_utf8(&buf[..len]).ok())
    }

    fn write_log(&self, mode: Mode, bytes: &[u8]) -> Result<(), SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(LOG_FILE, mode)?;

        file.write(bytes)?;

        // Closing flushes the directory entry with the new length
        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }
}

impl<S, D, T> LogBackend for SdStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    type Error = SdError;

    fn exists(&mut self) -> Result<bool, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let found = match root_dir.find_directory_entry(LOG_FILE) {
            Ok(_) => true,
            Err(Error::NotFound) => false,
            Err(e) => return Err(e),
        };

        root_dir.close()?;
        volume0.close()?;

        Ok(found)
    }

    fn create(&mut self, initial: &[u8]) -> Result<(), SdError> {
        self.write_log(Mode::ReadWriteCreateOrTruncate, initial)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), SdError> {
        self.write_log(Mode::ReadWriteCreateOrAppend, bytes)
    }

    fn len(&mut self) -> Result<u64, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let len = match root_dir.find_directory_entry(LOG_FILE) {
            Ok(entry) => u64::from(entry.size),
            Err(Error::NotFound) => 0,
            Err(e) => return Err(e),
        };

        root_dir.close()?;
        volume0.close()?;

        Ok(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, SdError> {
        let offset = u32::try_from(offset).map_err(|_| Error::InvalidOffset)?;

        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(LOG_FILE, Mode::ReadOnly)?;

        file.seek_from_start(offset)?;
        let n = file.read(buf)?;

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(n)
    }

    fn remove(&mut self) -> Result<(), SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        match root_dir.delete_file_in_dir(LOG_FILE) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        root_dir.close()?;
        volume0.close()?;

        Ok(())
    }

    /// Card size minus the files in the root directory, where everything
    /// this firmware writes lives. Cluster slack is not counted.
    fn free_space(&mut self) -> Result<u64, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;

        let mut used = 0u64;
        root_dir.iterate_dir(|entry| {
            if !entry.attributes.is_directory() {
                used += u64::from(entry.size);
            }
        })?;

        root_dir.close()?;
        volume0.close()?;

        debug!("SD card: {} of {} bytes used", used, self.capacity);
        Ok(self.capacity.saturating_sub(used))
    }
}
