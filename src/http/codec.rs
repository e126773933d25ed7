//! Reading HTTP/1.1 messages off a byte stream.
//!
//! # Responsibilities
//! - Read CRLF-terminated lines (status line, headers, chunk sizes)
//! - Collect header lines up to the blank separator line
//! - Read a body framed by Content-Length or chunked transfer coding
//! - Undo a gzip or deflate transfer coding after de-chunking
//!
//! # Design Decisions
//! - Bytes are mapped one-to-one onto chars (`U+0000..=U+00FF`) and written
//!   back the same way, so non-ASCII header bytes survive unchanged
//! - A single line is capped at 16 KiB, enforced while reading
//! - Bodies grow as bytes arrive; a declared length is never allocated up
//!   front
//! - Decoded gzip/deflate output is capped at 64 MiB
//! - Content-Length wins over chunked framing when both are present
//! - Messages without either header have no body

use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ProxyError, Result};
use crate::http::message::HttpMessage;

/// Upper bound for one status, header or chunk-size line.
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Upper bound for a body after undoing gzip or deflate.
pub const MAX_DECODED_LENGTH: u64 = 64 * 1024 * 1024;

/// Optional whitespace around header names and values.
fn is_ows(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn unexpected_eof(what: &str) -> ProxyError {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, what.to_string()).into()
}

/// Read one line, excluding the trailing CRLF.
///
/// A lone LF does not end the line; it is kept as part of the content.
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LENGTH + 2;
    let mut limited = AsyncReadExt::take(&mut *reader, limit as u64);
    let mut buf = Vec::new();
    loop {
        let n = limited.read_until(b'\n', &mut buf).await?;
        if buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Ok(buf.iter().map(|&b| b as char).collect());
        }
        if n == 0 {
            if buf.len() >= limit {
                return Err(ProxyError::LineTooLong {
                    limit: MAX_LINE_LENGTH,
                });
            }
            return Err(unexpected_eof("connection closed mid-line"));
        }
    }
}

/// Read header lines into `message` until the blank line.
pub async fn read_headers<R, M>(reader: &mut R, message: &mut M) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    M: HttpMessage,
{
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(());
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::MalformedHeader(line.clone()))?;
        let name = name.trim_matches(is_ows);
        if name.is_empty() {
            return Err(ProxyError::MalformedHeader(line));
        }
        message.headers_mut().append(name, value.trim_matches(is_ows));
    }
}

/// Read the body described by the message's headers and store it.
pub async fn read_body<R, M>(reader: &mut R, message: &mut M) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    M: HttpMessage,
{
    let headers = message.headers();

    let body = if let Some(raw) = headers.get("Content-Length") {
        let length = raw
            .trim_matches(is_ows)
            .parse::<u64>()
            .map_err(|_| ProxyError::InvalidContentLength(raw.to_string()))?;
        let mut body = Vec::new();
        read_exactly(reader, length, &mut body).await?;
        Some(Bytes::from(body))
    } else if headers.contains_token("Transfer-Encoding", "chunked") {
        // Only the first non-chunked coding is honoured.
        let coding = headers
            .tokens("Transfer-Encoding")
            .find(|t| !t.eq_ignore_ascii_case("chunked"))
            .map(str::to_ascii_lowercase);
        let raw = read_chunked(reader).await?;
        Some(decode(raw, coding.as_deref())?)
    } else {
        None
    };

    message.set_body(body);
    Ok(())
}

/// Whether a response to `request_method` with `status_code` may carry a body.
///
/// HEAD responses, 1xx, 204 and 304 never do, whatever their headers say.
pub fn response_has_body(request_method: &str, status_code: u16) -> bool {
    !(request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status_code)
        || status_code == 204
        || status_code == 304)
}

/// Append exactly `length` bytes from `reader` to `buf`.
///
/// The buffer grows with the bytes actually received.
async fn read_exactly<R>(reader: &mut R, length: u64, buf: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let read = AsyncReadExt::take(&mut *reader, length)
        .read_to_end(buf)
        .await?;
    if (read as u64) < length {
        return Err(unexpected_eof("connection closed mid-body"));
    }
    Ok(())
}

/// Reassemble a chunked body, consuming any trailer section.
pub async fn read_chunked<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim_matches(is_ows);
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| ProxyError::InvalidChunkSize(line.clone()))?;
        if size == 0 {
            break;
        }
        usize::try_from(size)
            .ok()
            .and_then(|size| body.len().checked_add(size))
            .ok_or_else(|| ProxyError::InvalidChunkSize(line.clone()))?;

        read_exactly(reader, size, &mut body).await?;
        read_line(reader).await?;
    }

    // trailers
    while !read_line(reader).await?.is_empty() {}

    Ok(Bytes::from(body))
}

/// Undo a transfer coding applied on top of chunking.
pub fn decode(raw: Bytes, coding: Option<&str>) -> Result<Bytes> {
    decode_limited(raw, coding, MAX_DECODED_LENGTH)
}

/// [`decode`] with an explicit cap on the decoded size.
pub fn decode_limited(raw: Bytes, coding: Option<&str>, limit: u64) -> Result<Bytes> {
    match coding {
        None | Some("identity") => Ok(raw),
        Some("gzip") | Some("x-gzip") => inflate(GzDecoder::new(&raw[..]), limit),
        Some("deflate") | Some("x-deflate") => inflate(ZlibDecoder::new(&raw[..]), limit),
        Some(other) => Err(ProxyError::UnsupportedEncoding(other.to_string())),
    }
}

fn inflate<D: Read>(decoder: D, limit: u64) -> Result<Bytes> {
    let mut decoded = Vec::new();
    Read::take(decoder, limit.saturating_add(1)).read_to_end(&mut decoded)?;
    if decoded.len() as u64 > limit {
        return Err(ProxyError::BodyTooLarge { limit });
    }
    Ok(Bytes::from(decoded))
}
