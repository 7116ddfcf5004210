//! Minimal HTTP/1.0 request handling over a raw byte stream
//!
//! Four routes, one request per connection, `Connection: close` always.
//! Requests are recognised by literal prefix of the request line and turned
//! into a [`Request`] before anything is touched; unknown or malformed
//! requests produce no response at all.

use core::fmt::{self, Write as _};

use embedded_io_async::Write;
use embedded_hal_async::i2c::I2c;
use log::{info, warn};
use thiserror_no_std::Error;

use crate::io::{SendError, send_all};
use crate::log_store::{LogBackend, LogError, LogStore, StreamError};
use crate::rtc::{CalendarTimestamp, Ds3231, RtcError};

const ROUTE_LOG: &[u8] = b"GET / ";
const ROUTE_CLEAR: &[u8] = b"GET /clear ";
const ROUTE_GET_RTC: &[u8] = b"GET /get_rtc ";
const ROUTE_SET_RTC: &[u8] = b"GET /set_rtc?to=,";

/// Largest body the handler builds in memory (everything except the log)
const MAX_BODY_LEN: usize = 128;

/// Largest response preamble
const MAX_HEAD_LEN: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Download the whole log file
    Log,
    /// Delete the log file
    Clear,
    GetRtc,
    SetRtc(CalendarTimestamp),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("unrecognised request line")]
    UnknownRoute,
    #[error("set_rtc needs six integer fields")]
    BadFields,
    #[error("set_rtc fields are not a valid time")]
    InvalidTime,
}

/// Whether the bytes received so far end the request headers.
pub fn is_complete(buf: &[u8]) -> bool {
    contains(buf, b"\r\n\r\n") || contains(buf, b"\n\n")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

impl Request {
    /// Classify a raw request. The first matching prefix wins.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.is_empty() {
            Err(ParseError::Empty)
        } else if raw.starts_with(ROUTE_LOG) {
            Ok(Self::Log)
        } else if raw.starts_with(ROUTE_CLEAR) {
            Ok(Self::Clear)
        } else if raw.starts_with(ROUTE_GET_RTC) {
            Ok(Self::GetRtc)
        } else if raw.starts_with(ROUTE_SET_RTC) {
            let fields = parse_fields(raw)?;
            CalendarTimestamp::from_fields(fields)
                .map(Self::SetRtc)
                .ok_or(ParseError::InvalidTime)
        } else {
            Err(ParseError::UnknownRoute)
        }
    }
}

/// Comma separated fields 1..=6 of `GET /set_rtc?to=,Y,M,D,h,m,s, ...`
fn parse_fields(raw: &[u8]) -> Result<[i64; 6], ParseError> {
    let mut parts = raw.split(|&b| b == b',').skip(1);
    let mut fields = [0i64; 6];
    for field in fields.iter_mut() {
        let part = parts.next().ok_or(ParseError::BadFields)?;
        *field = core::str::from_utf8(part)
            .ok()
            .map(str::trim)
            .and_then(|s| s.parse().ok())
            .ok_or(ParseError::BadFields)?;
    }
    Ok(fields)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InternalError,
}

impl Status {
    pub const fn line(self) -> &'static str {
        match self {
            Self::Ok => "200 OK",
            Self::InternalError => "500 Internal Server Error",
        }
    }
}

/// Status line and headers for a body of `content_length` bytes.
pub fn preamble(status: Status, content_length: u64) -> heapless::String<MAX_HEAD_LEN> {
    let mut head = heapless::String::new();
    // Capacity covers the longest status line and a u64 length
    let _ = write!(
        head,
        "HTTP/1.0 {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status.line(),
        content_length
    );
    head
}

/// Failure while producing a response.
#[derive(Error, Debug)]
pub enum ResponseError<B, I, W> {
    #[error("{0}")]
    Log(LogError<B>),
    #[error("{0}")]
    Rtc(RtcError<I>),
    #[error("{0}")]
    Send(SendError<W>),
    #[error("log shrank while streaming")]
    Truncated,
    #[error("response body too long")]
    BodyTooLong,
}

impl<B, I, W> From<StreamError<B, W>> for ResponseError<B, I, W> {
    fn from(e: StreamError<B, W>) -> Self {
        match e {
            StreamError::Log(e) => Self::Log(e),
            StreamError::Sink(e) => Self::Send(e),
            StreamError::Truncated => Self::Truncated,
        }
    }
}

/// Serves requests against the shared log and a clock handle.
pub struct RequestHandler<'a, B, I> {
    log: &'a LogStore<B>,
    rtc: Ds3231<I>,
}

impl<'a, B, I> RequestHandler<'a, B, I>
where
    B: LogBackend,
    I: I2c,
{
    pub fn new(log: &'a LogStore<B>, rtc: Ds3231<I>) -> Self {
        Self { log, rtc }
    }

    /// Parse one raw request and answer it on `conn`.
    ///
    /// Returns `None` when the request was ignored. Any failure while
    /// responding is followed by a best-effort 500, whose own failure is
    /// only logged.
    pub async fn handle<W: Write>(&mut self, raw: &[u8], conn: &mut W) -> Option<Request> {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring request ({}): {:?}", e, first_line(raw));
                return None;
            }
        };

        info!("Serving {:?}", request);
        if let Err(e) = self.respond(request, conn).await {
            warn!("Failed to serve {:?}: {}", request, e);
            send_error(conn, &e).await;
        }
        Some(request)
    }

    async fn respond<W: Write>(
        &mut self,
        request: Request,
        conn: &mut W,
    ) -> Result<(), ResponseError<B::Error, I::Error, W::Error>> {
        let mut body: heapless::String<MAX_BODY_LEN> = heapless::String::new();

        match request {
            Request::Log => {
                let snapshot = self.log.snapshot().await.map_err(ResponseError::Log)?;
                let head = preamble(Status::Ok, snapshot.len());
                send_all(conn, head.as_bytes())
                    .await
                    .map_err(ResponseError::Send)?;
                snapshot.read_all(conn).await?;
                return conn
                    .flush()
                    .await
                    .map_err(|e| ResponseError::Send(SendError::Io(e)));
            }
            Request::Clear => {
                self.log.clear().await.map_err(ResponseError::Log)?;
                body.push_str("cleared")
                    .map_err(|_| ResponseError::BodyTooLong)?;
            }
            Request::GetRtc => {
                let now = self.rtc.read_time().await.map_err(ResponseError::Rtc)?;
                write!(body, "rtc_ts {now}").map_err(|_| ResponseError::BodyTooLong)?;
            }
            Request::SetRtc(ts) => {
                self.rtc.set_time(&ts).await.map_err(ResponseError::Rtc)?;
                let now = self.rtc.read_time().await.map_err(ResponseError::Rtc)?;
                write!(
                    body,
                    "set rtc to [{}, {}, {}, {}, {}, {}]\nrtc_ts {now}",
                    ts.year(),
                    ts.month(),
                    ts.day(),
                    ts.hour(),
                    ts.minute(),
                    ts.second()
                )
                .map_err(|_| ResponseError::BodyTooLong)?;
            }
        }

        send_body(conn, Status::Ok, body.as_bytes())
            .await
            .map_err(ResponseError::Send)
    }
}

async fn send_body<W: Write>(
    conn: &mut W,
    status: Status,
    body: &[u8],
) -> Result<(), SendError<W::Error>> {
    let head = preamble(status, body.len() as u64);
    send_all(conn, head.as_bytes()).await?;
    send_all(conn, body).await?;
    conn.flush().await.map_err(SendError::Io)
}

/// Best-effort 500 carrying the error text. Failures here are swallowed.
async fn send_error<W: Write, E: fmt::Display>(conn: &mut W, error: &E) {
    let mut body: heapless::String<MAX_BODY_LEN> = heapless::String::new();
    if write!(body, "{error}").is_err() {
        body.clear();
        let _ = body.push_str("internal error");
    }
    if let Err(e) = send_body(conn, Status::InternalError, body.as_bytes()).await {
        warn!("Could not send error response: {:?}", e);
    }
}

fn first_line(raw: &[u8]) -> &str {
    let end = raw
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(raw.len())
        .min(64);
    core::str::from_utf8(&raw[..end]).unwrap_or("<binary>")
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::String;

    use super::*;
    use crate::log_store::{HEADER, LogRecord};
    use crate::testing::{FakeClockBus, MemoryLog, ScriptedConnection};
    use embassy_futures::block_on;

    fn ts(y: u16, mo: u8, d: u8, h: u8, mi: u8, s: u8) -> CalendarTimestamp {
        CalendarTimestamp::new(y, mo, d, h, mi, s).unwrap()
    }

    fn serve(
        log: &LogStore<MemoryLog>,
        bus: &FakeClockBus,
        raw: &[u8],
        conn: &mut ScriptedConnection,
    ) -> Option<Request> {
        let mut handler = RequestHandler::new(log, Ds3231::new(bus));
        block_on(handler.handle(raw, conn))
    }

    fn split_response(conn: &ScriptedConnection) -> (String, String) {
        let text = String::from_utf8(conn.written().to_vec()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (String::from(head), String::from(body))
    }

    fn content_length(head: &str) -> usize {
        head.lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_parse_routes_in_order() {
        assert_eq!(Request::parse(b"GET / HTTP/1.0\r\n\r\n"), Ok(Request::Log));
        assert_eq!(Request::parse(b"GET /clear HTTP/1.0\r\n\r\n"), Ok(Request::Clear));
        assert_eq!(Request::parse(b"GET /get_rtc HTTP/1.1\n\n"), Ok(Request::GetRtc));
        assert_eq!(
            Request::parse(b"GET /set_rtc?to=,2025,11,9,23,12,30, HTTP/1.0\r\n\r\n"),
            Ok(Request::SetRtc(ts(2025, 11, 9, 23, 12, 30)))
        );
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(Request::parse(b""), Err(ParseError::Empty));
        assert_eq!(Request::parse(b"GET /bogus HTTP/1.0\r\n\r\n"), Err(ParseError::UnknownRoute));
        assert_eq!(Request::parse(b"get / HTTP/1.0\r\n\r\n"), Err(ParseError::UnknownRoute));
        assert_eq!(Request::parse(b"POST / HTTP/1.0\r\n\r\n"), Err(ParseError::UnknownRoute));
        // Query strings on the log route are not the log route
        assert_eq!(Request::parse(b"GET /?x HTTP/1.0\r\n\r\n"), Err(ParseError::UnknownRoute));
    }

    #[test]
    fn test_parse_set_rtc_errors() {
        assert_eq!(
            Request::parse(b"GET /set_rtc?to=,2025,11,9 HTTP/1.0\r\n\r\n"),
            Err(ParseError::BadFields)
        );
        assert_eq!(
            Request::parse(b"GET /set_rtc?to=,2025,xx,9,23,12,30, HTTP/1.0\r\n\r\n"),
            Err(ParseError::BadFields)
        );
        assert_eq!(
            Request::parse(b"GET /set_rtc?to=,2025,13,9,23,12,30, HTTP/1.0\r\n\r\n"),
            Err(ParseError::InvalidTime)
        );
    }

    #[test]
    fn test_request_completion() {
        assert!(!is_complete(b"GET / HTTP/1.0\r\n"));
        assert!(is_complete(b"GET / HTTP/1.0\r\n\r\n"));
        assert!(is_complete(b"GET / HTTP/1.0\n\n"));
    }

    #[test]
    fn test_preamble_format() {
        assert_eq!(
            preamble(Status::Ok, 7).as_str(),
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 7\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn test_get_rtc_reports_clock() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        bus.load_time(ts(2024, 2, 29, 6, 7, 8));
        let mut conn = ScriptedConnection::new(b"");

        let served = serve(&log, &bus, b"GET /get_rtc HTTP/1.0\r\n\r\n", &mut conn);

        assert_eq!(served, Some(Request::GetRtc));
        let (head, body) = split_response(&conn);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert_eq!(body, "rtc_ts 2024-02-29 06:07:08");
        assert_eq!(content_length(&head), body.len());
    }

    #[test]
    fn test_set_rtc_then_get_rtc() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();

        let mut conn = ScriptedConnection::new(b"");
        serve(
            &log,
            &bus,
            b"GET /set_rtc?to=,2025,11,9,23,12,30, HTTP/1.0\r\n\r\n",
            &mut conn,
        );
        let (head, body) = split_response(&conn);
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert_eq!(
            body,
            "set rtc to [2025, 11, 9, 23, 12, 30]\nrtc_ts 2025-11-09 23:12:30"
        );
        assert_eq!(content_length(&head), body.len());
        assert_eq!(bus.time(), Some(ts(2025, 11, 9, 23, 12, 30)));

        let mut conn = ScriptedConnection::new(b"");
        serve(&log, &bus, b"GET /get_rtc HTTP/1.0\r\n\r\n", &mut conn);
        let (_, body) = split_response(&conn);
        assert_eq!(body, "rtc_ts 2025-11-09 23:12:30");
    }

    #[test]
    fn test_unknown_route_is_silent_noop() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        let before = bus.registers();
        let mut conn = ScriptedConnection::new(b"");

        let served = serve(&log, &bus, b"GET /bogus HTTP/1.0\r\n\r\n", &mut conn);

        assert_eq!(served, None);
        assert!(conn.written().is_empty());
        assert_eq!(bus.transactions(), 0);
        assert_eq!(bus.registers(), before);
        assert!(block_on(log.with_backend(|b| b.contents())).is_none());
    }

    #[test]
    fn test_log_download_matches_file() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        let record = LogRecord {
            monotonic_ts: 5,
            vin_calibrated: 12.5,
            adc_voltage: 1.1,
            smoothed_raw: 21845.0,
            oversampled_raw: 21845.0,
            rtc_ts: ts(2025, 1, 1, 0, 0, 5),
        };
        block_on(log.append(&record)).unwrap();
        let mut conn = ScriptedConnection::new(b"").with_write_limit(7);

        serve(&log, &bus, b"GET / HTTP/1.0\r\n\r\n", &mut conn);

        let (head, body) = split_response(&conn);
        let mut expected = String::from(HEADER);
        expected.push_str(record.to_line().unwrap().as_str());
        assert_eq!(body, expected);
        assert_eq!(content_length(&head), expected.len());
    }

    #[test]
    fn test_clear_deletes_log() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        block_on(log.ensure_header()).unwrap();
        let mut conn = ScriptedConnection::new(b"");

        serve(&log, &bus, b"GET /clear HTTP/1.0\r\n\r\n", &mut conn);

        let (_, body) = split_response(&conn);
        assert_eq!(body, "cleared");
        assert!(block_on(log.with_backend(|b| b.contents())).is_none());
    }

    #[test]
    fn test_clock_failure_is_500() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        bus.set_failing(true);
        let mut conn = ScriptedConnection::new(b"");

        serve(&log, &bus, b"GET /get_rtc HTTP/1.0\r\n\r\n", &mut conn);

        let (head, body) = split_response(&conn);
        assert!(head.starts_with("HTTP/1.0 500 Internal Server Error\r\n"));
        assert!(body.starts_with("clock bus transaction failed"));
        assert_eq!(content_length(&head), body.len());
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let log = LogStore::new(MemoryLog::new());
        let bus = FakeClockBus::new();
        let mut conn = ScriptedConnection::new(b"").with_write_limit(0);

        let served = serve(&log, &bus, b"GET /get_rtc HTTP/1.0\r\n\r\n", &mut conn);

        assert_eq!(served, Some(Request::GetRtc));
        assert!(conn.written().is_empty());
    }
}
