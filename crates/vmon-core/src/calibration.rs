//! Calibration constants for the divider front end
//!
//! The input voltage reaches the converter through a two-resistor divider.
//! Recovering it takes two affine steps: undo the divider, then apply the
//! offline linear correction (`v_cal = v_in * a + b`).

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("divider resistance {which} must be finite and positive")]
    InvalidResistance { which: &'static str },
    #[error("calibration term {which} must be finite")]
    InvalidTerm { which: &'static str },
    #[error("{file}: expected a number on line {line}")]
    MissingValue { file: &'static str, line: usize },
    #[error("{file}: line {line} is not a number")]
    Malformed { file: &'static str, line: usize },
}

/// Divider resistances and linear correction loaded once at boot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationConstants {
    /// Ohms from the measured input to the converter node
    r_high: f64,
    /// Ohms from the converter node to ground
    r_low: f64,
    /// Correction scale
    calib_a: f64,
    /// Correction offset (volts)
    calib_b: f64,
}

impl CalibrationConstants {
    pub fn new(
        r_high: f64,
        r_low: f64,
        calib_a: f64,
        calib_b: f64,
    ) -> Result<Self, CalibrationError> {
        if !(r_high.is_finite() && r_high > 0.0) {
            return Err(CalibrationError::InvalidResistance { which: "R_HIGH" });
        }
        if !(r_low.is_finite() && r_low > 0.0) {
            return Err(CalibrationError::InvalidResistance { which: "R_LOW" });
        }
        if !calib_a.is_finite() {
            return Err(CalibrationError::InvalidTerm { which: "CALIB_A" });
        }
        if !calib_b.is_finite() {
            return Err(CalibrationError::InvalidTerm { which: "CALIB_B" });
        }

        Ok(Self {
            r_high,
            r_low,
            calib_a,
            calib_b,
        })
    }

    /// Build from the contents of the two boot files.
    ///
    /// `ohms` holds R_HIGH then R_LOW, `calib` holds CALIB_A then CALIB_B,
    /// one value per line. Surrounding whitespace and any further lines are
    /// ignored.
    pub fn parse(ohms: &str, calib: &str) -> Result<Self, CalibrationError> {
        let [r_high, r_low] = parse_pair(ohms, "OHMS.TXT")?;
        let [calib_a, calib_b] = parse_pair(calib, "CALIB.TXT")?;
        Self::new(r_high, r_low, calib_a, calib_b)
    }

    pub fn r_high(&self) -> f64 {
        self.r_high
    }

    pub fn r_low(&self) -> f64 {
        self.r_low
    }

    /// Correction scale and offset as `(a, b)`.
    pub fn terms(&self) -> (f64, f64) {
        (self.calib_a, self.calib_b)
    }

    /// Voltage upstream of the divider given the voltage at its midpoint.
    #[inline]
    pub fn divider_to_vin(&self, v_adc: f64) -> f64 {
        v_adc * ((self.r_high + self.r_low) / self.r_low)
    }

    #[inline]
    pub fn calibrate(&self, v_in: f64) -> f64 {
        v_in * self.calib_a + self.calib_b
    }
}

/// Converter full-scale code and reference voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcScale {
    pub full_scale: f64,
    pub reference_volts: f64,
}

impl AdcScale {
    /// 16-bit normalised reads against a 3.3 V reference
    pub const U16_3V3: Self = Self {
        full_scale: 65535.0,
        reference_volts: 3.3,
    };

    pub const fn new(full_scale: f64, reference_volts: f64) -> Self {
        Self {
            full_scale,
            reference_volts,
        }
    }

    #[inline]
    pub fn raw_to_voltage(&self, raw: f64) -> f64 {
        (raw / self.full_scale) * self.reference_volts
    }
}

impl Default for AdcScale {
    fn default() -> Self {
        Self::U16_3V3
    }
}

fn parse_pair(text: &str, file: &'static str) -> Result<[f64; 2], CalibrationError> {
    let mut lines = text.lines();
    let mut out = [0.0; 2];
    for (idx, slot) in out.iter_mut().enumerate() {
        let line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(CalibrationError::MissingValue { file, line: idx + 1 })?;
        *slot = line
            .parse::<f64>()
            .map_err(|_| CalibrationError::Malformed { file, line: idx + 1 })?;
    }
    Ok(out)
}
