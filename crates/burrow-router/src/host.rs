//! Host-header peek for the HTTP ingress
//!
//! The edge routes on nothing but the Host header, so this is the only place
//! any HTTP parsing happens. The bytes consumed while searching for the
//! header are replayed in front of the remaining stream, and the backend
//! sees the request byte-identical from the request line on.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Per-line cap while scanning headers. RFC 7230 recommends senders and
/// recipients support request-line lengths of at least 8000 octets.
pub const MAX_HEADER_LINE: usize = 8000;

#[derive(Debug, Error)]
pub enum PeekError {
    #[error("i/o error while peeking request: {0}")]
    Io(#[from] io::Error),

    #[error("no Host header before end of input")]
    MissingHost,

    #[error("header line over {MAX_HEADER_LINE} octets")]
    LineTooLong,
}

/// Reader that yields a consumed prefix before the rest of the stream.
/// Writes pass straight through to the inner stream.
pub struct PeekedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Scan HTTP/1.x header lines for the first `Host` field.
///
/// Returns the trimmed header value plus a stream that replays every byte
/// consumed so far followed by whatever is left in `stream`. The field name
/// is matched ASCII case-insensitively; the first occurrence wins. Input
/// with no Host header before the blank line (or EOF), or with a header
/// line over [`MAX_HEADER_LINE`] octets, is an error.
pub async fn peek_host<S>(mut stream: S) -> Result<(String, PeekedStream<S>), PeekError>
where
    S: AsyncRead + Unpin,
{
    let mut consumed: Vec<u8> = Vec::with_capacity(1024);
    let mut line_start = 0;
    let mut scanned = 0;

    loop {
        if let Some(offset) = consumed[scanned..].iter().position(|&b| b == b'\n') {
            let newline = scanned + offset;
            let mut line_end = newline;
            if line_end > line_start && consumed[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            let line = &consumed[line_start..line_end];
            if line.len() > MAX_HEADER_LINE {
                return Err(PeekError::LineTooLong);
            }
            if line.is_empty() {
                // End of headers without a Host field.
                return Err(PeekError::MissingHost);
            }
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                let (field, value) = line.split_at(colon);
                if field.eq_ignore_ascii_case(b"host") {
                    let host = String::from_utf8_lossy(&value[1..]).trim().to_string();
                    return Ok((host, PeekedStream::new(consumed, stream)));
                }
            }
            line_start = newline + 1;
            scanned = newline + 1;
        } else {
            scanned = consumed.len();
            // The unterminated tail is all one line; allow its CRLF on top
            // of the cap so a maximal line still fits.
            if consumed.len() - line_start > MAX_HEADER_LINE + 2 {
                return Err(PeekError::LineTooLong);
            }
            if stream.read_buf(&mut consumed).await? == 0 {
                return Err(PeekError::MissingHost);
            }
        }
    }
}

/// Extract the tunnel name from a Host value: drop an optional `:port`
/// suffix, take the leftmost DNS label, lowercase it.
pub fn tunnel_label(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    let label = host.split('.').next().unwrap_or(host);
    label.to_ascii_lowercase()
}
