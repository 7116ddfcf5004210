//! Cooperative task set: Sampler, Server and Watchdog
//!
//! All three tasks run as futures joined on one executor task. None of them
//! spawns anything or blocks; each gives the executor back only through a
//! [`Suspend`] point or while awaiting I/O inside [`Suspend::bounded`]. That
//! keeps the Watchdog pulsing on schedule even when a client stalls the
//! Server mid-request.
//!
//! ```text
//!   Sampler  ──(5 s)──►  ADC ─► Acquisition ─► Ds3231 ─► LogStore
//!   Server   ──accept──► read (≤ 60 s) ─► RequestHandler (≤ 120 s) ─► close
//!   Watchdog ──(1 s)──►  Liveness::pulse
//! ```

use core::convert::Infallible;
use core::future::Future;

use embassy_futures::join::join3;
use embassy_futures::select::{Either, select};
use embassy_time::Duration;
use embedded_hal::digital::OutputPin;
use embedded_hal_async::i2c::I2c;
use embedded_io_async::{Read, Write};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::acquisition::{Acquisition, AcquisitionError, AnalogInput};
use crate::config::{MAX_REQUEST_SIZE, Timing};
use crate::http::{RequestHandler, is_complete};
use crate::log_store::{LogBackend, LogError, LogRecord, LogStore};
use crate::rtc::{Ds3231, RtcError};

/// Monotonic clock and timer the tasks run against.
pub trait TimeBase {
    /// Time since boot.
    fn uptime(&self) -> Duration;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

/// Something that must be told periodically that the system is alive.
pub trait Liveness {
    fn pulse(&mut self);
}

/// One accepted client.
pub trait Connection: Read + Write {
    /// Flush and close. Always called once the request is done with.
    fn close(&mut self) -> impl Future<Output = ()>;
}

impl<C: Connection + ?Sized> Connection for &mut C {
    fn close(&mut self) -> impl Future<Output = ()> {
        C::close(self)
    }
}

/// Source of inbound connections.
pub trait Listener {
    type Error: core::fmt::Debug;
    type Connection<'a>: Connection
    where
        Self: 'a;

    /// `Ok(None)` when nothing is pending right now.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Option<Self::Connection<'_>>, Self::Error>>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out")]
pub struct TimedOut;

/// The only places a task may hand the executor back.
pub struct Suspend<'t, T> {
    time: &'t T,
    timing: Timing,
}

impl<'t, T: TimeBase> Suspend<'t, T> {
    pub fn new(time: &'t T, timing: Timing) -> Self {
        Self { time, timing }
    }

    pub fn time(&self) -> &'t T {
        self.time
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Sleep between iterations of a periodic task.
    pub async fn interval(&self, period: Duration) {
        self.time.sleep(period).await
    }

    /// Pause before polling the listener again.
    pub async fn accept_backoff(&self) {
        self.time.sleep(self.timing.accept_retry).await
    }

    /// Drive `fut`, giving up after `timeout`. Other tasks keep running
    /// whenever `fut` is waiting.
    pub async fn bounded<F: Future>(
        &self,
        timeout: Duration,
        fut: F,
    ) -> Result<F::Output, TimedOut> {
        match select(fut, self.time.sleep(timeout)).await {
            Either::First(output) => Ok(output),
            Either::Second(()) => Err(TimedOut),
        }
    }
}

/// Why a sampler iteration was skipped.
#[derive(Error, Debug)]
pub enum SampleError<I, B> {
    #[error("{0}")]
    Acquisition(AcquisitionError),
    #[error("{0}")]
    Rtc(RtcError<I>),
    #[error("{0}")]
    Log(LogError<B>),
}

/// Whole seconds since boot, rounded to nearest.
fn uptime_secs(uptime: Duration) -> u64 {
    (uptime.as_millis() + 500) / 1000
}

/// Periodic acquisition into the log.
pub struct Sampler<'a, A, I, B, L> {
    adc: A,
    acquisition: Acquisition,
    rtc: Ds3231<I>,
    log: &'a LogStore<B>,
    led: L,
}

impl<'a, A, I, B, L> Sampler<'a, A, I, B, L>
where
    A: AnalogInput,
    I: I2c,
    B: LogBackend,
    L: OutputPin,
{
    pub fn new(
        adc: A,
        acquisition: Acquisition,
        rtc: Ds3231<I>,
        log: &'a LogStore<B>,
        led: L,
    ) -> Self {
        Self {
            adc,
            acquisition,
            rtc,
            log,
            led,
        }
    }

    /// Take, timestamp and persist one reading. The LED is lit for the
    /// duration whether or not the iteration succeeds.
    pub async fn sample_once<T: TimeBase>(
        &mut self,
        time: &T,
    ) -> Result<LogRecord, SampleError<I::Error, B::Error>> {
        if let Err(e) = self.led.set_high() {
            warn!("led on error: {:?}", e);
        }
        let result = self.record(time).await;
        if let Err(e) = self.led.set_low() {
            warn!("led off error: {:?}", e);
        }
        result
    }

    async fn record<T: TimeBase>(
        &mut self,
        time: &T,
    ) -> Result<LogRecord, SampleError<I::Error, B::Error>> {
        let monotonic_ts = uptime_secs(time.uptime());
        let reading = self
            .acquisition
            .sample(&mut self.adc)
            .map_err(SampleError::Acquisition)?;
        let rtc_ts = self.rtc.read_time().await.map_err(SampleError::Rtc)?;

        let record = LogRecord::new(monotonic_ts, &reading, rtc_ts);
        self.log.append(&record).await.map_err(SampleError::Log)?;
        Ok(record)
    }

    pub async fn run<T: TimeBase>(mut self, suspend: &Suspend<'_, T>) -> Infallible {
        info!("Sampler started");
        loop {
            match self.sample_once(suspend.time()).await {
                Ok(record) => info!("{}", record),
                Err(e) => error!("Sample skipped: {}", e),
            }
            suspend.interval(suspend.timing().sample_interval).await;
        }
    }
}

/// Accept loop answering one request per connection.
pub struct Server<'a, N, B, I> {
    listener: N,
    handler: RequestHandler<'a, B, I>,
}

impl<'a, N, B, I> Server<'a, N, B, I>
where
    N: Listener,
    B: LogBackend,
    I: I2c,
{
    pub fn new(listener: N, handler: RequestHandler<'a, B, I>) -> Self {
        Self { listener, handler }
    }

    pub async fn run<T: TimeBase>(mut self, suspend: &Suspend<'_, T>) -> Infallible {
        info!("Server started");
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        loop {
            let mut conn = match self.listener.accept().await {
                Ok(Some(conn)) => conn,
                Ok(None) => {
                    suspend.accept_backoff().await;
                    continue;
                }
                Err(e) => {
                    debug!("accept failed: {:?}", e);
                    suspend.accept_backoff().await;
                    continue;
                }
            };

            serve(&mut self.handler, &mut conn, &mut buf, suspend).await;
            conn.close().await;
        }
    }
}

/// Receive one request within the read timeout and answer it within the
/// response timeout.
async fn serve<B, I, C, T>(
    handler: &mut RequestHandler<'_, B, I>,
    conn: &mut C,
    buf: &mut [u8],
    suspend: &Suspend<'_, T>,
) where
    B: LogBackend,
    I: I2c,
    C: Connection,
    T: TimeBase,
{
    let timeout = suspend.timing().read_timeout;
    let len = match suspend.bounded(timeout, read_request(conn, buf)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            warn!("Dropping connection after read error: {:?}", e);
            return;
        }
        Err(TimedOut) => {
            warn!("Request not received within {} s", timeout.as_secs());
            return;
        }
    };

    let response_timeout = suspend.timing().response_timeout;
    if suspend
        .bounded(response_timeout, handler.handle(&buf[..len], conn))
        .await
        .is_err()
    {
        warn!("Response not delivered within {} s", response_timeout.as_secs());
    }
}

/// Read until the header terminator, end of stream, or a full buffer.
async fn read_request<C: Read>(conn: &mut C, buf: &mut [u8]) -> Result<usize, C::Error> {
    let mut len = 0;
    while len < buf.len() {
        let n = conn.read(&mut buf[len..]).await?;
        if n == 0 {
            break;
        }
        len += n;
        if is_complete(&buf[..len]) {
            break;
        }
    }
    Ok(len)
}

/// Periodic liveness pulse.
pub struct Watchdog<W> {
    liveness: W,
}

impl<W: Liveness> Watchdog<W> {
    pub fn new(liveness: W) -> Self {
        Self { liveness }
    }

    pub async fn run<T: TimeBase>(mut self, suspend: &Suspend<'_, T>) -> Infallible {
        loop {
            self.liveness.pulse();
            debug!("watchdog fed");
            suspend.interval(suspend.timing().watchdog_interval).await;
        }
    }
}

/// Run all three tasks on the current executor task. Never completes.
pub async fn run<T, A, I, B, L, N, J, W>(
    suspend: &Suspend<'_, T>,
    sampler: Sampler<'_, A, I, B, L>,
    server: Server<'_, N, B, J>,
    watchdog: Watchdog<W>,
) -> Infallible
where
    T: TimeBase,
    A: AnalogInput,
    I: I2c,
    B: LogBackend,
    L: OutputPin,
    N: Listener,
    J: I2c,
    W: Liveness,
{
    let (never, _, _) = join3(
        sampler.run(suspend),
        server.run(suspend),
        watchdog.run(suspend),
    )
    .await;
    never
}

/// [`TimeBase`] backed by the embassy-time driver of the running target.
#[cfg(feature = "time-driver")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

#[cfg(feature = "time-driver")]
impl TimeBase for EmbassyClock {
    fn uptime(&self) -> Duration {
        Duration::from_ticks(embassy_time::Instant::now().as_ticks())
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        embassy_time::Timer::after(duration)
    }
}
