//! DS3231 battery-backed clock over I2C
//!
//! Seven time registers starting at 0x00, each packed BCD:
//!
//! | Reg | Field   | Mask | Dropped bits          |
//! |-----|---------|------|-----------------------|
//! | 0   | seconds | 0x7F | clock-halt            |
//! | 1   | minutes | 0xFF |                       |
//! | 2   | hours   | 0x3F | 12/24h select         |
//! | 3   | weekday |      | written 0, never read |
//! | 4   | date    | 0xFF |                       |
//! | 5   | month   | 0x1F | century               |
//! | 6   | year    | 0xFF | stored as year - 2000 |

use core::fmt;

use embedded_hal_async::i2c::I2c;
use thiserror_no_std::Error;

/// Default 7-bit address of the DS3231
pub const DS3231_ADDRESS: u8 = 0x68;

const REG_SECONDS: u8 = 0x00;
const TIME_REGISTERS: usize = 7;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcError<E> {
    #[error("clock bus transaction failed: {0:?}")]
    Bus(E),
    #[error("clock registers hold an invalid time")]
    InvalidTime,
}

/// Calendar time as kept by the clock, always within the clock's century.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CalendarTimestamp {
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
}

impl CalendarTimestamp {
    /// Returns `None` when any field is outside the clock's range.
    pub fn new(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Option<Self> {
        let valid = (2000..=2099).contains(&year)
            && (1..=12).contains(&month)
            && (1..=31).contains(&day)
            && hour <= 23
            && minute <= 59
            && second <= 59;

        valid.then_some(Self {
            year,
            month,
            day,
            hour,
            minute,
            second,
        })
    }

    /// Build from wide integers as they arrive from a request.
    pub fn from_fields(fields: [i64; 6]) -> Option<Self> {
        let [y, mo, d, h, mi, s] = fields;
        Self::new(
            u16::try_from(y).ok()?,
            u8::try_from(mo).ok()?,
            u8::try_from(d).ok()?,
            u8::try_from(h).ok()?,
            u8::try_from(mi).ok()?,
            u8::try_from(s).ok()?,
        )
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn day(&self) -> u8 {
        self.day
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn second(&self) -> u8 {
        self.second
    }

    /// Pack into the seven time registers.
    pub fn to_registers(&self) -> [u8; TIME_REGISTERS] {
        [
            bcd_encode(self.second),
            bcd_encode(self.minute),
            bcd_encode(self.hour),
            bcd_encode(0),
            bcd_encode(self.day),
            bcd_encode(self.month),
            bcd_encode((self.year % 100) as u8),
        ]
    }

    /// Unpack the seven time registers, masking flag bits first.
    pub fn from_registers(regs: &[u8; TIME_REGISTERS]) -> Option<Self> {
        Self::new(
            2000 + u16::from(bcd_decode(regs[6])),
            bcd_decode(regs[5] & 0x1F),
            bcd_decode(regs[4]),
            bcd_decode(regs[2] & 0x3F),
            bcd_decode(regs[1]),
            bcd_decode(regs[0] & 0x7F),
        )
    }
}

impl fmt::Display for CalendarTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[inline]
pub const fn bcd_encode(n: u8) -> u8 {
    ((n / 10) << 4) | (n % 10)
}

#[inline]
pub const fn bcd_decode(b: u8) -> u8 {
    (b >> 4) * 10 + (b & 0x0F)
}

/// Codec handle for one DS3231 on a (possibly shared) bus.
pub struct Ds3231<I> {
    i2c: I,
    address: u8,
}

impl<I: I2c> Ds3231<I> {
    pub fn new(i2c: I) -> Self {
        Self::with_address(i2c, DS3231_ADDRESS)
    }

    pub fn with_address(i2c: I, address: u8) -> Self {
        Self { i2c, address }
    }

    /// Read all time registers in one write-read transaction.
    pub async fn read_time(&mut self) -> Result<CalendarTimestamp, RtcError<I::Error>> {
        let mut regs = [0u8; TIME_REGISTERS];
        self.i2c
            .write_read(self.address, &[REG_SECONDS], &mut regs)
            .await
            .map_err(RtcError::Bus)?;
        CalendarTimestamp::from_registers(&regs).ok_or(RtcError::InvalidTime)
    }

    /// Write all time registers in one transaction.
    pub async fn set_time(&mut self, ts: &CalendarTimestamp) -> Result<(), RtcError<I::Error>> {
        let mut frame = [0u8; TIME_REGISTERS + 1];
        frame[0] = REG_SECONDS;
        frame[1..].copy_from_slice(&ts.to_registers());
        self.i2c
            .write(self.address, &frame)
            .await
            .map_err(RtcError::Bus)
    }

    pub fn release(self) -> I {
        self.i2c
    }
}
