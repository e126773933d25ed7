//! HTTP response representations.

use bytes::Bytes;

use crate::error::{ProxyError, Result};
use crate::http::headers::HttpHeaders;
use crate::http::message::HttpMessage;
use crate::http::request::split_status_line;

/// Immutable response snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    version: String,
    status_code: u16,
    status_text: String,
    reason: String,
    headers: HttpHeaders,
    body: Option<Bytes>,
}

impl HttpResponse {
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Zero until a status line has been read.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The status code exactly as it appeared on the wire.
    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// Response under construction.
#[derive(Debug, Clone)]
pub struct MutableHttpResponse {
    version: String,
    status_code: u16,
    status_text: String,
    reason: String,
    headers: HttpHeaders,
    body: Option<Bytes>,
}

impl Default for MutableHttpResponse {
    fn default() -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status_code: 0,
            status_text: "0".to_string(),
            reason: String::new(),
            headers: HttpHeaders::new(),
            body: None,
        }
    }
}

impl MutableHttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// An HTTP/1.1 response with the given status.
    pub fn with_status(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            status_text: status_code.to_string(),
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// The synthetic reply to a CONNECT request.
    pub fn connection_established() -> Self {
        Self::with_status(200, "Connection established")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Parse `version SP code SP reason`; the reason may contain spaces.
    pub fn set_status_line(&mut self, line: &str) -> Result<()> {
        let (version, code, reason) = split_status_line(line)?;
        let status_code = code
            .parse::<u16>()
            .map_err(|_| ProxyError::MalformedStatusLine(line.to_string()))?;
        self.version = version.to_string();
        self.status_code = status_code;
        self.status_text = code.to_string();
        self.reason = reason.to_string();
        Ok(())
    }

    pub fn to_immutable(&self) -> HttpResponse {
        HttpResponse {
            version: self.version.clone(),
            status_code: self.status_code,
            status_text: self.status_text.clone(),
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

impl HttpMessage for MutableHttpResponse {
    fn status_line(&self) -> String {
        format!("{} {} {}", self.version, self.status_text, self.reason)
    }

    fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HttpHeaders {
        &mut self.headers
    }

    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }
}
