//! Write helpers for byte-stream sinks

use embedded_io_async::Write;
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError<E> {
    #[error("connection write failed: {0:?}")]
    Io(E),
    #[error("peer stopped accepting data")]
    Closed,
}

/// Write every byte of `buf`, continuing after short writes.
///
/// A write that accepts zero bytes ends the transfer with
/// [`SendError::Closed`] rather than spinning.
pub async fn send_all<W: Write>(sink: &mut W, mut buf: &[u8]) -> Result<(), SendError<W::Error>> {
    while !buf.is_empty() {
        match sink.write(buf).await {
            Ok(0) => return Err(SendError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(e) => return Err(SendError::Io(e)),
        }
    }
    Ok(())
}
