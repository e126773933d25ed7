//! Wire serialization shared by requests and responses.

use bytes::{BufMut, Bytes, BytesMut};

use crate::http::headers::HttpHeaders;

const TRANSFER_ENCODING: &str = "Transfer-Encoding";
const CONTENT_LENGTH: &str = "Content-Length";

/// Write `text` as wire bytes.
///
/// Chars up to `U+00FF` came off the wire one byte each and go back the
/// same way. Anything wider was set by code and is written as UTF-8.
fn put_wire_text(out: &mut BytesMut, text: &str) {
    for c in text.chars() {
        match u8::try_from(c) {
            Ok(byte) => out.put_u8(byte),
            Err(_) => out.put_slice(c.encode_utf8(&mut [0u8; 4]).as_bytes()),
        }
    }
}

/// Common shape of a mutable HTTP/1.1 message.
pub trait HttpMessage {
    /// The first line of the message, without CRLF.
    fn status_line(&self) -> String;

    fn headers(&self) -> &HttpHeaders;

    fn headers_mut(&mut self) -> &mut HttpHeaders;

    fn body(&self) -> Option<&Bytes>;

    fn set_body(&mut self, body: Option<Bytes>);

    /// Encode the message for the wire.
    ///
    /// Bodies are always forwarded de-chunked and decoded, so outgoing
    /// `Transfer-Encoding` is dropped and `Content-Length` is added when a
    /// body exists without one.
    fn to_bytes(&self) -> Bytes {
        let body = self.body();
        let mut out = BytesMut::with_capacity(256 + body.map_or(0, Bytes::len));

        put_wire_text(&mut out, &self.status_line());
        out.put_slice(b"\r\n");

        for (name, values) in self.headers().iter() {
            if name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
                continue;
            }
            put_wire_text(&mut out, name);
            out.put_slice(b": ");
            put_wire_text(&mut out, &values.join("; "));
            out.put_slice(b"\r\n");
        }

        if let Some(body) = body {
            if !self.headers().contains(CONTENT_LENGTH) {
                out.put_slice(format!("{}: {}\r\n", CONTENT_LENGTH, body.len()).as_bytes());
            }
        }

        out.put_slice(b"\r\n");

        if let Some(body) = body {
            out.put_slice(body);
        }

        out.freeze()
    }
}
