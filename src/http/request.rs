//! HTTP request representations.
//!
//! `MutableHttpRequest` is filled in while a request is parsed off the wire;
//! `HttpRequest` is the immutable snapshot handed to event subscribers.

use bytes::Bytes;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::http::headers::HttpHeaders;
use crate::http::message::HttpMessage;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Immutable request snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    method: String,
    target: String,
    version: String,
    headers: HttpHeaders,
    body: Option<Bytes>,
}

impl HttpRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn status_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }
}

/// Request under construction.
#[derive(Debug, Clone, Default)]
pub struct MutableHttpRequest {
    method: String,
    target: String,
    version: String,
    headers: HttpHeaders,
    body: Option<Bytes>,
}

impl MutableHttpRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request with its status line already set.
    pub fn with_line(
        method: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            target: target.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Parse `METHOD SP target SP version`.
    ///
    /// The split is capped at three fields; the method is upper-cased.
    pub fn set_status_line(&mut self, line: &str) -> Result<()> {
        let (method, target, version) = split_status_line(line)?;
        self.method = method.to_ascii_uppercase();
        self.target = target.to_string();
        self.version = version.to_string();
        Ok(())
    }

    /// Resolve the absolute URL this request is aimed at.
    ///
    /// Follows RFC 9112 section 3.3 loosely. A Host without a port is
    /// assumed to be plain HTTP on port 80; port 443 selects `https`.
    pub fn absolute_url(&self) -> Result<Url> {
        let target = self.target.as_str();
        if target == "*" {
            if self.method != "OPTIONS" {
                return Err(ProxyError::InvalidTarget(
                    "'*' is valid only with OPTIONS requests".to_string(),
                ));
            }
        } else if has_scheme(target) {
            return parse_url(target);
        } else if !target.contains('/') {
            return parse_url(&format!("http://{}/", target));
        }

        let host_header = self.headers.get("Host").ok_or(ProxyError::MissingHost)?;
        let (host, port) = parse_authority(host_header, DEFAULT_HTTP_PORT)?;
        let scheme = if port == DEFAULT_HTTPS_PORT { "https" } else { "http" };
        let path = if target == "*" { "" } else { target };

        parse_url(&format!("{}://{}:{}{}", scheme, bracket_ipv6(&host), port, path))
    }

    pub fn to_immutable(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            target: self.target.clone(),
            version: self.version.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

impl HttpMessage for MutableHttpRequest {
    fn status_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
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

/// Split a status line into exactly three fields, keeping spaces in the last.
pub(crate) fn split_status_line(line: &str) -> Result<(&str, &str, &str)> {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c)) => Ok((a, b, c)),
        _ => Err(ProxyError::MalformedStatusLine(line.to_string())),
    }
}

/// Parse `host[:port]`, falling back to `default_port`.
///
/// IPv6 literals may be bracketed; the brackets are stripped from the
/// returned host.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = || ProxyError::InvalidTarget(format!("bad authority {:?}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.trim().parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}

fn has_scheme(target: &str) -> bool {
    match target.split_once("://") {
        Some((scheme, _)) => {
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(line: &str, host: Option<&str>) -> MutableHttpRequest {
        let mut request = MutableHttpRequest::new();
        request.set_status_line(line).unwrap();
        if let Some(host) = host {
            request.headers_mut().set("Host", host);
        }
        request
    }

    #[test]
    fn status_line_round_trip() {
        let mut request = MutableHttpRequest::new();
        request.set_status_line("GET /a/b?c=d HTTP/1.1").unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.target(), "/a/b?c=d");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.status_line(), "GET /a/b?c=d HTTP/1.1");

        let mut again = MutableHttpRequest::new();
        again.set_status_line(&request.status_line()).unwrap();
        assert_eq!(again.to_immutable(), request.to_immutable());
    }

    #[test]
    fn status_line_needs_three_fields() {
        let mut request = MutableHttpRequest::new();
        assert!(matches!(
            request.set_status_line("GET /"),
            Err(ProxyError::MalformedStatusLine(_))
        ));
    }

    #[test]
    fn origin_form_uses_host_header() {
        let url = request("GET /foo HTTP/1.1", Some("example.com"))
            .absolute_url()
            .unwrap();
        assert_eq!(url.as_str(), "http://example.com/foo");
    }

    #[test]
    fn host_port_443_selects_https() {
        let url = request("GET /foo HTTP/1.1", Some("example.com:443"))
            .absolute_url()
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/foo");
    }

    #[test]
    fn absolute_form_ignores_host_header() {
        let url = request("GET http://a.b/c HTTP/1.1", Some("wrong.com"))
            .absolute_url()
            .unwrap();
        assert_eq!(url.as_str(), "http://a.b/c");
    }

    #[test]
    fn bare_authority_target() {
        let url = request("GET www.example.com HTTP/1.1", None)
            .absolute_url()
            .unwrap();
        assert_eq!(url.as_str(), "http://www.example.com/");
    }

    #[test]
    fn star_requires_options() {
        let err = request("GET * HTTP/1.1", Some("example.com"))
            .absolute_url()
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget(_)));
    }

    #[test]
    fn options_star_resolves_to_host() {
        let url = request("OPTIONS * HTTP/1.1", Some("foo.bar.com:8080"))
            .absolute_url()
            .unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("foo.bar.com"));
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn origin_form_without_host_fails() {
        let err = request("GET /foo HTTP/1.1", None).absolute_url().unwrap_err();
        assert!(matches!(err, ProxyError::MissingHost));
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(
            parse_authority("example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.com:8443", 443).unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("[::1]:8080", 80).unwrap(),
            ("::1".to_string(), 8080)
        );
        assert!(parse_authority("example.com:http", 80).is_err());
        assert!(parse_authority(":80", 80).is_err());
    }
}
