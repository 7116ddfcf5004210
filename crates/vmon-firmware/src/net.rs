//! Wi-Fi access point and the TCP listener served by the core
//!
//! The device hosts its own network at 192.168.4.1/24. There is no DHCP
//! server, so clients join with a static address in the same subnet.

use alloc::string::String;

use embassy_net::tcp::{self, AcceptError, TcpSocket};
use embassy_net::{Config, Ipv4Address, Ipv4Cidr, Runner, Stack, StaticConfigV4};
use embassy_time::{Duration, Timer};
use esp_radio::wifi::{
    AccessPointConfig as RadioApConfig, AuthMethod, ModeConfig, WifiController, WifiDevice,
    WifiEvent,
};
use log::{debug, info, warn};
use thiserror_no_std::Error;
use vmon_core::config::AccessPointConfig;
use vmon_core::scheduler::{Connection, Listener};

/// Address of the device on its own network
pub const AP_ADDRESS: Ipv4Address = Ipv4Address::new(192, 168, 4, 1);
const AP_PREFIX_LEN: u8 = 24;

/// Pause before restarting the access point after it stops
const AP_RESTART_DELAY: Duration = Duration::from_secs(5);

pub fn stack_config() -> Config {
    Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(AP_ADDRESS, AP_PREFIX_LEN),
        gateway: Some(AP_ADDRESS),
        dns_servers: Default::default(),
    })
}

pub fn access_point_mode(ap: &AccessPointConfig<'_>) -> ModeConfig {
    ModeConfig::AccessPoint(
        RadioApConfig::default()
            .with_ssid(String::from(ap.ssid))
            .with_password(String::from(ap.password))
            .with_auth_method(AuthMethod::Wpa2Personal),
    )
}

#[embassy_executor::task]
pub async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

/// Bring the access point up and keep it up.
#[embassy_executor::task]
pub async fn access_point_task(mut controller: WifiController<'static>, mode: ModeConfig) {
    loop {
        if !matches!(controller.is_started(), Ok(true)) {
            if let Err(err) = controller.set_config(&mode) {
                warn!("Wi-Fi set_config error: {:?}", err);
                Timer::after(AP_RESTART_DELAY).await;
                continue;
            }

            if let Err(err) = controller.start_async().await {
                warn!("Wi-Fi start_async error: {:?}", err);
                Timer::after(AP_RESTART_DELAY).await;
                continue;
            }
            info!("Access point up at {}", AP_ADDRESS);
        }

        controller.wait_for_event(WifiEvent::ApStop).await;
        warn!("Access point stopped; restarting");
        Timer::after(AP_RESTART_DELAY).await;
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tcp error: {0:?}")]
pub struct NetError(pub tcp::Error);

impl embedded_io::Error for NetError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::ConnectionReset
    }
}

/// One TCP socket reused for every client, one client at a time.
pub struct TcpListener<'s> {
    stack: Stack<'s>,
    port: u16,
    timeout: Duration,
    rx: &'s mut [u8],
    tx: &'s mut [u8],
}

impl<'s> TcpListener<'s> {
    /// `timeout` bounds every socket operation, including the final flush.
    pub fn new(
        stack: Stack<'s>,
        port: u16,
        timeout: Duration,
        rx: &'s mut [u8],
        tx: &'s mut [u8],
    ) -> Self {
        Self {
            stack,
            port,
            timeout,
            rx,
            tx,
        }
    }
}

impl Listener for TcpListener<'_> {
    type Error = AcceptError;
    type Connection<'a>
        = NetConnection<'a>
    where
        Self: 'a;

    async fn accept(&mut self) -> Result<Option<NetConnection<'_>>, AcceptError> {
        self.stack.wait_config_up().await;

        let mut socket = TcpSocket::new(self.stack, &mut *self.rx, &mut *self.tx);
        socket.set_timeout(Some(self.timeout));
        socket.accept(self.port).await?;

        debug!("accepted {:?}", socket.remote_endpoint());
        Ok(Some(NetConnection { socket }))
    }
}

pub struct NetConnection<'a> {
    socket: TcpSocket<'a>,
}

impl embedded_io_async::ErrorType for NetConnection<'_> {
    type Error = NetError;
}

impl embedded_io_async::Read for NetConnection<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.socket.read(buf).await.map_err(NetError)
    }
}

impl embedded_io_async::Write for NetConnection<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, NetError> {
        self.socket.write(buf).await.map_err(NetError)
    }

    async fn flush(&mut self) -> Result<(), NetError> {
        self.socket.flush().await.map_err(NetError)
    }
}

impl Connection for NetConnection<'_> {
    async fn close(&mut self) {
        self.socket.close();
        if let Err(e) = self.socket.flush().await {
            debug!("close flush failed: {:?}", e);
        }
    }
}
