//! Hardware-independent core library for vmon
//!
//! Everything the battery voltage logger does that is not tied to a chip:
//! calibration maths, the acquisition pipeline, the DS3231 register codec,
//! the CSV log store, HTTP request handling and the cooperative task set
//! that ties them together.
//!
//! It is `#![no_std]` so it compiles for the ESP32-S3 firmware as well as
//! desktop hosts (the simulator and unit tests). Hardware is reached only
//! through the ports in [`acquisition`], [`log_store`] and [`scheduler`].

#![no_std]

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod http;
pub mod io;
pub mod log_store;
pub mod rtc;
pub mod scheduler;
pub mod shared_i2c;

#[cfg(test)]
mod testing;
