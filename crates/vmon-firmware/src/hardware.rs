//! Board wiring and thin wrappers over ESP32-S3 peripherals
//!
//! | Signal         | Pin            |
//! |----------------|----------------|
//! | Divider tap    | GPIO1 (ADC1)   |
//! | DS3231 SDA/SCL | GPIO12/GPIO11  |
//! | SD SCK/MOSI    | GPIO36/GPIO35  |
//! | SD MISO/CS     | GPIO37/GPIO34  |
//! | Activity LED   | GPIO2          |

use core::convert::Infallible;

use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO1, LPWR};
use esp_hal::rtc_cntl::{Rtc, RwdtStage, RwdtStageAction};
use esp_hal::time::Duration;
use vmon_core::acquisition::AnalogInput;
use vmon_core::calibration::AdcScale;
use vmon_core::scheduler::Liveness;

/// ADC1 is 12 bits wide; the 11 dB range tops out near 3.3 V
pub const ADC_SCALE: AdcScale = AdcScale::new(4095.0, 3.3);

/// Reset if the watchdog task misses this many seconds of pulses
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(8);

/// One-shot reads of the divider tap.
pub struct BatteryAdc<'d> {
    adc: Adc<'d, ADC1<'d>, Blocking>,
    pin: AdcPin<GPIO1<'d>, ADC1<'d>>,
}

impl<'d> BatteryAdc<'d> {
    pub fn new(adc1: ADC1<'d>, pin: GPIO1<'d>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(pin, Attenuation::_11dB);
        let adc = Adc::new(adc1, config);
        Self { adc, pin }
    }
}

impl AnalogInput for BatteryAdc<'_> {
    type Error = Infallible;

    fn read_raw(&mut self) -> Result<u16, Infallible> {
        Ok(self.adc.read_blocking(&mut self.pin))
    }
}

/// RTC watchdog that resets the whole system when not fed.
pub struct RtcWatchdog<'d> {
    rtc: Rtc<'d>,
}

impl<'d> RtcWatchdog<'d> {
    /// Arms the watchdog immediately.
    pub fn new(lpwr: LPWR<'d>, timeout: Duration) -> Self {
        let mut rtc = Rtc::new(lpwr);
        rtc.rwdt
            .set_stage_action(RwdtStage::Stage0, RwdtStageAction::ResetSystem);
        rtc.rwdt.set_timeout(RwdtStage::Stage0, timeout);
        rtc.rwdt.enable();
        Self { rtc }
    }
}

impl Liveness for RtcWatchdog<'_> {
    fn pulse(&mut self) {
        self.rtc.rwdt.feed();
    }
}
