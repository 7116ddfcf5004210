#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_sync::mutex::Mutex;
use embedded_hal_bus::spi::ExclusiveDevice;
use embedded_sdmmc::SdCard;
use esp_hal::clock::CpuClock;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::rng::Rng;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::{Async, Blocking};
use log::{error, info, warn};
use static_cell::StaticCell;

use vmon_core::acquisition::Acquisition;
use vmon_core::calibration::CalibrationConstants;
use vmon_core::config::{AccessPointConfig, HTTP_PORT, Timing};
use vmon_core::http::RequestHandler;
use vmon_core::log_store::LogStore;
use vmon_core::scheduler::{self, EmbassyClock, Liveness, Sampler, Server, Suspend, Watchdog};
use vmon_core::shared_i2c::{ClockBus, shared_clock};
use vmon_firmware::hardware::{ADC_SCALE, BatteryAdc, RtcWatchdog, WATCHDOG_TIMEOUT};
use vmon_firmware::net::{self, TcpListener};
use vmon_firmware::sd_log::{FixedTime, SdStorage};

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    esp_hal::system::software_reset()
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
type Storage = SdStorage<SdSpi, Delay, FixedTime>;

const SOCKET_BUFFER_SIZE: usize = 1536;

static LOG: StaticCell<LogStore<Storage>> = StaticCell::new();
static CLOCK_BUS: StaticCell<ClockBus<I2c<'static, Async>>> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<2>> = StaticCell::new();
static RX_BUFFER: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();
static TX_BUFFER: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();
static CLOCK: EmbassyClock = EmbassyClock;

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // Armed before anything that can hang; fed between boot stages
    let mut rtc_watchdog = RtcWatchdog::new(peripherals.LPWR, WATCHDOG_TIMEOUT);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");
    rtc_watchdog.pulse();

    // SD card on its own SPI bus, at the 400 kHz the card expects during init
    let spi_bus = Spi::new(
        peripherals.SPI2,
        SpiConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("Failed to configure SD card SPI bus")
    .with_sck(peripherals.GPIO36)
    .with_mosi(peripherals.GPIO35)
    .with_miso(peripherals.GPIO37);
    let cs = Output::new(peripherals.GPIO34, Level::High, OutputConfig::default());
    let spi_device =
        ExclusiveDevice::new(spi_bus, cs, Delay::new()).expect("Failed to claim SD card CS");
    let storage = SdStorage::new(SdCard::new(spi_device, Delay::new()), FixedTime)
        .expect("Failed to initialize SD card");

    // Boot files
    let mut ohms_buf = [0u8; 64];
    let mut calib_buf = [0u8; 64];
    let mut wifi_buf = [0u8; 128];
    let ohms = storage
        .read_text("OHMS.TXT", &mut ohms_buf)
        .expect("Failed to read SD card")
        .expect("OHMS.TXT missing");
    let calib = storage
        .read_text("CALIB.TXT", &mut calib_buf)
        .expect("Failed to read SD card")
        .expect("CALIB.TXT missing");
    let calibration = CalibrationConstants::parse(ohms, calib).expect("Invalid calibration files");
    info!(
        "Calibration: R_HIGH={} R_LOW={}",
        calibration.r_high(),
        calibration.r_low()
    );

    let wifi_text = match storage.read_text("WIFI.TXT", &mut wifi_buf) {
        Ok(text) => text,
        Err(e) => {
            warn!("Could not read WIFI.TXT: {:?}", e);
            None
        }
    };
    let ap_config = match wifi_text.map(AccessPointConfig::parse) {
        Some(Ok(ap)) => ap,
        Some(Err(e)) => {
            warn!("Ignoring WIFI.TXT: {}", e);
            default_access_point()
        }
        None => default_access_point(),
    };
    let ap_mode = net::access_point_mode(&ap_config);
    info!("Access point SSID: {}", ap_config.ssid);

    let log = LOG.init(LogStore::new(storage));
    if let Err(e) = log.ensure_header().await {
        error!("Log file not ready: {}", e);
    }
    rtc_watchdog.pulse();

    // DS3231 on I2C0, shared by the sampler and the server
    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .expect("Failed to configure clock I2C bus")
    .with_sda(peripherals.GPIO12)
    .with_scl(peripherals.GPIO11)
    .into_async();
    let clock_bus: &'static ClockBus<_> = CLOCK_BUS.init(Mutex::new(i2c));

    let adc = BatteryAdc::new(peripherals.ADC1, peripherals.GPIO1);
    let led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());

    // Access point and network stack
    let radio = RADIO.init(esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, Default::default())
            .expect("Failed to initialize Wi-Fi controller");

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        interfaces.ap,
        net::stack_config(),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );

    spawner
        .spawn(net::net_task(runner))
        .expect("net_task spawn");
    spawner
        .spawn(net::access_point_task(wifi_controller, ap_mode))
        .expect("access_point_task spawn");
    rtc_watchdog.pulse();

    let timing = Timing::DEFAULT;
    let listener = TcpListener::new(
        stack,
        HTTP_PORT,
        timing.read_timeout,
        RX_BUFFER.init([0; SOCKET_BUFFER_SIZE]),
        TX_BUFFER.init([0; SOCKET_BUFFER_SIZE]),
    );

    let sampler = Sampler::new(
        adc,
        Acquisition::new(ADC_SCALE, calibration),
        shared_clock(clock_bus),
        log,
        led,
    );
    let server = Server::new(
        listener,
        RequestHandler::new(log, shared_clock(clock_bus)),
    );
    let watchdog = Watchdog::new(rtc_watchdog);

    info!("Serving on {}:{}", net::AP_ADDRESS, HTTP_PORT);
    let suspend = Suspend::new(&CLOCK, timing);
    match scheduler::run(&suspend, sampler, server, watchdog).await {}
}

/// Credentials baked in at build time from `VMON_AP_SSID` / `VMON_AP_PASSWORD`.
fn default_access_point() -> AccessPointConfig<'static> {
    AccessPointConfig::new(env!("VMON_AP_SSID"), env!("VMON_AP_PASSWORD"))
        .expect("Build-time access point credentials are invalid")
}
