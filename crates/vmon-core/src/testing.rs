//! In-memory fakes for every hardware and network port

extern crate std;

use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use embassy_futures::yield_now;
use embassy_time::Duration;
use embedded_hal::digital;
use embedded_hal_async::i2c::{self, ErrorKind, I2c, Operation};
use std::collections::VecDeque;
use std::vec::Vec;

use crate::acquisition::AnalogInput;
use crate::log_store::LogBackend;
use crate::rtc::{CalendarTimestamp, DS3231_ADDRESS};
use crate::scheduler::{Connection, Listener, Liveness, TimeBase};

/// Virtual clock advanced explicitly by the test.
pub struct FakeTime {
    now_us: Cell<u64>,
}

impl FakeTime {
    pub fn new() -> Self {
        Self { now_us: Cell::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.set(self.now_us.get() + by.as_micros());
    }

    /// Step the clock by `step` on every poll until it reaches `until`.
    pub async fn drive(&self, until: Duration, step: Duration) {
        while self.uptime() < until {
            yield_now().await;
            self.advance(step);
        }
    }
}

impl TimeBase for FakeTime {
    fn uptime(&self) -> Duration {
        Duration::from_micros(self.now_us.get())
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.uptime() + duration;
        while self.uptime() < deadline {
            yield_now().await;
        }
    }
}

/// Converter that cycles through fixed codes.
pub struct FakeAdc {
    values: Vec<u16>,
    fail_at: Option<usize>,
    reads: usize,
}

#[derive(Debug)]
pub struct FakeAdcError;

impl FakeAdc {
    pub fn sequence(values: &[u16]) -> Self {
        Self {
            values: values.to_vec(),
            fail_at: None,
            reads: 0,
        }
    }

    /// Succeeds `ok_reads` times, then fails.
    pub fn failing_after(values: &[u16], ok_reads: usize) -> Self {
        Self {
            fail_at: Some(ok_reads),
            ..Self::sequence(values)
        }
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl AnalogInput for FakeAdc {
    type Error = FakeAdcError;

    fn read_raw(&mut self) -> Result<u16, FakeAdcError> {
        if self.fail_at == Some(self.reads) {
            return Err(FakeAdcError);
        }
        let value = self.values[self.reads % self.values.len()];
        self.reads += 1;
        Ok(value)
    }
}

/// DS3231 register file behind an I2C interface.
pub struct FakeClockBus {
    registers: RefCell<[u8; 7]>,
    pointer: Cell<usize>,
    failing: Cell<bool>,
    transactions: Cell<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBusError {
    Nack,
    Injected,
}

impl i2c::Error for FakeBusError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Nack => ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address),
            Self::Injected => ErrorKind::Other,
        }
    }
}

impl FakeClockBus {
    /// Starts at 2025-01-01 00:00:00.
    pub fn new() -> Self {
        let start = CalendarTimestamp::new(2025, 1, 1, 0, 0, 0).map(|ts| ts.to_registers());
        Self {
            registers: RefCell::new(start.unwrap_or_default()),
            pointer: Cell::new(0),
            failing: Cell::new(false),
            transactions: Cell::new(0),
        }
    }

    pub fn registers(&self) -> [u8; 7] {
        *self.registers.borrow()
    }

    pub fn load_registers(&self, regs: [u8; 7]) {
        *self.registers.borrow_mut() = regs;
    }

    pub fn load_time(&self, ts: CalendarTimestamp) {
        self.load_registers(ts.to_registers());
    }

    pub fn time(&self) -> Option<CalendarTimestamp> {
        CalendarTimestamp::from_registers(&self.registers())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub fn transactions(&self) -> usize {
        self.transactions.get()
    }

    fn execute(&self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), FakeBusError> {
        self.transactions.set(self.transactions.get() + 1);
        if self.failing.get() {
            return Err(FakeBusError::Injected);
        }
        if address != DS3231_ADDRESS {
            return Err(FakeBusError::Nack);
        }

        let mut regs = self.registers.borrow_mut();
        for op in operations {
            match op {
                Operation::Write(bytes) => {
                    if let Some((&reg, data)) = bytes.split_first() {
                        self.pointer.set(usize::from(reg));
                        for &b in data {
                            if let Some(slot) = regs.get_mut(self.pointer.get()) {
                                *slot = b;
                            }
                            self.pointer.set(self.pointer.get() + 1);
                        }
                    }
                }
                Operation::Read(buf) => {
                    for b in buf.iter_mut() {
                        *b = regs.get(self.pointer.get()).copied().unwrap_or(0);
                        self.pointer.set(self.pointer.get() + 1);
                    }
                }
            }
        }
        Ok(())
    }
}

impl i2c::ErrorType for FakeClockBus {
    type Error = FakeBusError;
}

impl I2c for FakeClockBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), FakeBusError> {
        self.execute(address, operations)
    }
}

impl i2c::ErrorType for &FakeClockBus {
    type Error = FakeBusError;
}

impl I2c for &FakeClockBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), FakeBusError> {
        self.execute(address, operations)
    }
}

/// Log file held in memory.
pub struct MemoryLog {
    contents: Option<Vec<u8>>,
    fail_writes: bool,
    largest_read: usize,
    capacity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLogError;

impl MemoryLog {
    /// No file yet.
    pub fn new() -> Self {
        Self {
            contents: None,
            fail_writes: false,
            largest_read: 0,
            capacity: u64::MAX,
        }
    }

    /// Medium of `capacity` bytes, of which the file is the only user.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity,
            ..Self::new()
        }
    }

    pub fn with_contents(bytes: &[u8]) -> Self {
        Self {
            contents: Some(bytes.to_vec()),
            ..Self::new()
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents.clone()
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn largest_read(&self) -> usize {
        self.largest_read
    }
}

impl LogBackend for MemoryLog {
    type Error = MemoryLogError;

    fn exists(&mut self) -> Result<bool, MemoryLogError> {
        Ok(self.contents.is_some())
    }

    fn create(&mut self, initial: &[u8]) -> Result<(), MemoryLogError> {
        if self.fail_writes {
            return Err(MemoryLogError);
        }
        self.contents = Some(initial.to_vec());
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), MemoryLogError> {
        if self.fail_writes {
            return Err(MemoryLogError);
        }
        self.contents
            .get_or_insert_with(Vec::new)
            .extend_from_slice(bytes);
        Ok(())
    }

    fn len(&mut self) -> Result<u64, MemoryLogError> {
        Ok(self.contents.as_ref().map_or(0, |c| c.len() as u64))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, MemoryLogError> {
        self.largest_read = self.largest_read.max(buf.len());
        let contents = self.contents.as_deref().unwrap_or_default();
        let start = (offset as usize).min(contents.len());
        let n = buf.len().min(contents.len() - start);
        buf[..n].copy_from_slice(&contents[start..start + n]);
        Ok(n)
    }

    fn remove(&mut self) -> Result<(), MemoryLogError> {
        self.contents = None;
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64, MemoryLogError> {
        let used = self.len()?;
        Ok(self.capacity.saturating_sub(used))
    }
}

/// Client that sends a fixed request and records the reply.
pub struct ScriptedConnection {
    input: Vec<u8>,
    read_pos: usize,
    read_limit: Option<usize>,
    written: Vec<u8>,
    write_limit: Option<usize>,
    write_calls: usize,
    closed: bool,
}

impl ScriptedConnection {
    pub fn new(input: &[u8]) -> Self {
        Self {
            input: input.to_vec(),
            read_pos: 0,
            read_limit: None,
            written: Vec::new(),
            write_limit: None,
            write_calls: 0,
            closed: false,
        }
    }

    /// Deliver at most `n` bytes per read.
    pub fn with_read_limit(mut self, n: usize) -> Self {
        self.read_limit = Some(n);
        self
    }

    /// Accept at most `n` bytes per write.
    pub fn with_write_limit(mut self, n: usize) -> Self {
        self.write_limit = Some(n);
        self
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl embedded_io_async::ErrorType for ScriptedConnection {
    type Error = Infallible;
}

impl embedded_io_async::Read for ScriptedConnection {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let remaining = &self.input[self.read_pos..];
        let n = remaining
            .len()
            .min(buf.len())
            .min(self.read_limit.unwrap_or(usize::MAX));
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl embedded_io_async::Write for ScriptedConnection {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        self.write_calls += 1;
        let n = buf.len().min(self.write_limit.unwrap_or(usize::MAX));
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl Connection for ScriptedConnection {
    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Client that connects and then never sends anything.
pub struct HangingConnection<'a> {
    closed: &'a Cell<bool>,
}

impl<'a> HangingConnection<'a> {
    pub fn new(closed: &'a Cell<bool>) -> Self {
        Self { closed }
    }
}

impl embedded_io_async::ErrorType for HangingConnection<'_> {
    type Error = Infallible;
}

impl embedded_io_async::Read for HangingConnection<'_> {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Infallible> {
        core::future::pending().await
    }
}

impl embedded_io_async::Write for HangingConnection<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl Connection for HangingConnection<'_> {
    async fn close(&mut self) {
        self.closed.set(true);
    }
}

/// Client that sends a request and then never reads the response.
pub struct UnreadConnection<'a> {
    input: &'static [u8],
    read_pos: usize,
    closed: &'a Cell<bool>,
}

impl<'a> UnreadConnection<'a> {
    pub fn new(input: &'static [u8], closed: &'a Cell<bool>) -> Self {
        Self {
            input,
            read_pos: 0,
            closed,
        }
    }
}

impl embedded_io_async::ErrorType for UnreadConnection<'_> {
    type Error = Infallible;
}

impl embedded_io_async::Read for UnreadConnection<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let remaining = &self.input[self.read_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl embedded_io_async::Write for UnreadConnection<'_> {
    async fn write(&mut self, _buf: &[u8]) -> Result<usize, Infallible> {
        core::future::pending().await
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        core::future::pending().await
    }
}

impl Connection for UnreadConnection<'_> {
    async fn close(&mut self) {
        self.closed.set(true);
    }
}

/// Listener with nothing to hand out that records when it was polled.
///
/// Alternates between reporting nothing pending and failing.
pub struct PollRecorder<'t> {
    time: &'t FakeTime,
    polls: RefCell<Vec<Duration>>,
}

#[derive(Debug)]
pub struct AcceptFailed;

impl<'t> PollRecorder<'t> {
    pub fn new(time: &'t FakeTime) -> Self {
        Self {
            time,
            polls: RefCell::new(Vec::new()),
        }
    }

    pub fn polls(&self) -> Vec<Duration> {
        self.polls.borrow().clone()
    }
}

impl Listener for &PollRecorder<'_> {
    type Error = AcceptFailed;
    type Connection<'a>
        = ScriptedConnection
    where
        Self: 'a;

    async fn accept(&mut self) -> Result<Option<ScriptedConnection>, AcceptFailed> {
        let mut polls = self.polls.borrow_mut();
        polls.push(self.time.uptime());
        if polls.len() % 2 == 0 {
            Err(AcceptFailed)
        } else {
            Ok(None)
        }
    }
}

/// Hands out queued connections, then reports nothing pending.
pub struct FakeListener<C> {
    queue: VecDeque<C>,
}

impl<C> FakeListener<C> {
    pub fn new(connections: impl IntoIterator<Item = C>) -> Self {
        Self {
            queue: connections.into_iter().collect(),
        }
    }
}

impl<C: Connection> Listener for FakeListener<C> {
    type Error = Infallible;
    type Connection<'a>
        = C
    where
        Self: 'a;

    async fn accept(&mut self) -> Result<Option<C>, Infallible> {
        Ok(self.queue.pop_front())
    }
}

/// Activity LED that remembers every level it was driven to.
pub struct FakeLed {
    states: RefCell<Vec<bool>>,
    broken: bool,
}

#[derive(Debug)]
pub struct FakePinError;

impl digital::Error for FakePinError {
    fn kind(&self) -> digital::ErrorKind {
        digital::ErrorKind::Other
    }
}

impl FakeLed {
    pub fn new() -> Self {
        Self {
            states: RefCell::new(Vec::new()),
            broken: false,
        }
    }

    /// Every write fails and nothing is recorded.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new()
        }
    }

    pub fn states(&self) -> Vec<bool> {
        self.states.borrow().clone()
    }

    fn drive(&self, level: bool) -> Result<(), FakePinError> {
        if self.broken {
            return Err(FakePinError);
        }
        self.states.borrow_mut().push(level);
        Ok(())
    }
}

impl digital::ErrorType for &FakeLed {
    type Error = FakePinError;
}

impl digital::OutputPin for &FakeLed {
    fn set_low(&mut self) -> Result<(), FakePinError> {
        self.drive(false)
    }

    fn set_high(&mut self) -> Result<(), FakePinError> {
        self.drive(true)
    }
}

/// Liveness sink stamping each pulse with virtual time.
pub struct PulseRecorder<'t> {
    time: &'t FakeTime,
    stamps: RefCell<Vec<Duration>>,
}

impl<'t> PulseRecorder<'t> {
    pub fn new(time: &'t FakeTime) -> Self {
        Self {
            time,
            stamps: RefCell::new(Vec::new()),
        }
    }

    pub fn stamps(&self) -> Vec<Duration> {
        self.stamps.borrow().clone()
    }
}

impl Liveness for &PulseRecorder<'_> {
    fn pulse(&mut self) {
        self.stamps.borrow_mut().push(self.time.uptime());
    }
}
