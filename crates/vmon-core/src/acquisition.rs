//! Acquisition pipeline: converter reads to calibrated volts
//!
//! Only [`oversample`] (hardware reads) and [`SmoothingState::push`] (ring
//! mutation) have side effects. Everything after smoothing is a pure
//! function of the smoothed value and the loaded constants.

use log::debug;
use thiserror_no_std::Error;

use crate::calibration::{AdcScale, CalibrationConstants};

/// Raw reads averaged into one oversampled value
pub const OVERSAMPLE_COUNT: usize = 16;

/// Depth of the smoothing ring
pub const SMOOTHING_DEPTH: usize = 8;

/// Port for the single analog channel.
pub trait AnalogInput {
    type Error: core::fmt::Debug;

    /// Take one raw conversion.
    fn read_raw(&mut self) -> Result<u16, Self::Error>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("analog read {index} of {count} failed")]
    ReadFailed { index: usize, count: usize },
}

/// Mean of `OVERSAMPLE_COUNT` consecutive raw reads.
pub fn oversample<A: AnalogInput>(adc: &mut A) -> Result<f64, AcquisitionError> {
    let mut total: u32 = 0;
    for index in 0..OVERSAMPLE_COUNT {
        let raw = adc.read_raw().map_err(|e| {
            debug!("analog read failed: {:?}", e);
            AcquisitionError::ReadFailed {
                index,
                count: OVERSAMPLE_COUNT,
            }
        })?;
        total += u32::from(raw);
    }
    Ok(total as f64 / OVERSAMPLE_COUNT as f64)
}

/// Moving average over the last `SMOOTHING_DEPTH` oversampled values.
///
/// The ring starts zero-filled, so the first seven results are pulled toward
/// zero. That warm-up transient is kept as-is.
#[derive(Debug, Clone)]
pub struct SmoothingState {
    ring: [f64; SMOOTHING_DEPTH],
    cursor: usize,
}

impl SmoothingState {
    pub const fn new() -> Self {
        Self {
            ring: [0.0; SMOOTHING_DEPTH],
            cursor: 0,
        }
    }

    /// Overwrite the oldest slot and return the mean of all slots.
    pub fn push(&mut self, value: f64) -> f64 {
        self.ring[self.cursor] = value;
        self.cursor = (self.cursor + 1) % SMOOTHING_DEPTH;
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        self.ring.iter().sum::<f64>() / SMOOTHING_DEPTH as f64
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

impl Default for SmoothingState {
    fn default() -> Self {
        Self::new()
    }
}

/// One pass through the pipeline, every intermediate kept for the log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub oversampled_raw: f64,
    pub smoothed_raw: f64,
    pub adc_voltage: f64,
    pub vin_calibrated: f64,
}

/// Pure tail of the pipeline: smoothed code to (adc volts, calibrated volts).
pub fn convert(smoothed: f64, scale: &AdcScale, cal: &CalibrationConstants) -> (f64, f64) {
    let v_adc = scale.raw_to_voltage(smoothed);
    let v_in = cal.divider_to_vin(v_adc);
    (v_adc, cal.calibrate(v_in))
}

/// Pipeline state owned by the sampler.
pub struct Acquisition {
    scale: AdcScale,
    calibration: CalibrationConstants,
    smoothing: SmoothingState,
}

impl Acquisition {
    pub fn new(scale: AdcScale, calibration: CalibrationConstants) -> Self {
        Self {
            scale,
            calibration,
            smoothing: SmoothingState::new(),
        }
    }

    pub fn sample<A: AnalogInput>(&mut self, adc: &mut A) -> Result<Reading, AcquisitionError> {
        let oversampled_raw = oversample(adc)?;
        Ok(self.process(oversampled_raw))
    }

    /// Feed an already oversampled value through smoothing and conversion.
    pub fn process(&mut self, oversampled_raw: f64) -> Reading {
        let smoothed_raw = self.smoothing.push(oversampled_raw);
        let (adc_voltage, vin_calibrated) = convert(smoothed_raw, &self.scale, &self.calibration);
        Reading {
            oversampled_raw,
            smoothed_raw,
            adc_voltage,
            vin_calibrated,
        }
    }

    pub fn smoothing(&self) -> &SmoothingState {
        &self.smoothing
    }
}
