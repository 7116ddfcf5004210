//! ESP32-S3 firmware-specific modules for vmon
//!
//! This crate contains the hardware-specific code that cannot compile on
//! desktop targets: ADC and watchdog wrappers, the SD card log backend and
//! the Wi-Fi access point with its TCP listener.

#![no_std]

extern crate alloc;

pub mod hardware;
pub mod net;
pub mod sd_log;
