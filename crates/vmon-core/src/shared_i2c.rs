//! Clock bus shared between the sampler and the server
//!
//! Both tasks get their own [`Ds3231`] on one bus behind an Embassy async
//! mutex. Each I2C transaction holds the lock for its whole length, so a
//! register read started by one task is never interleaved with a write from
//! the other.
//!
//! ```ignore
//! static CLOCK_BUS: StaticCell<ClockBus<I2c<'static, Async>>> = StaticCell::new();
//! let bus = CLOCK_BUS.init(Mutex::new(i2c));
//!
//! let sampler_rtc = shared_clock(bus);
//! let server_rtc = shared_clock(bus);
//! ```

use embassy_embedded_hal::shared_bus::asynch::i2c::I2cDevice;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::i2c::I2c;

use crate::rtc::Ds3231;

pub type ClockBus<T> = Mutex<CriticalSectionRawMutex, T>;

/// One task's view of the clock bus.
pub type ClockDevice<'a, T> = I2cDevice<'a, CriticalSectionRawMutex, T>;

/// A DS3231 at the default address on the shared bus.
pub fn shared_clock<T: I2c>(bus: &ClockBus<T>) -> Ds3231<ClockDevice<'_, T>> {
    Ds3231::new(I2cDevice::new(bus))
}
