//! HTTP/1.1 message model and wire codec.
//!
//! # Data Flow
//! ```text
//! inbound bytes
//!     → codec.rs (status line, headers, body; de-chunk, decode)
//!     → request.rs / response.rs (mutable message under construction)
//!     → message.rs (serialize for the other side)
//!     → outbound bytes
//!
//! Every state change also snapshots the message:
//!     MutableHttpRequest  → HttpRequest
//!     MutableHttpResponse → HttpResponse
//! ```
//!
//! # Design Decisions
//! - Bodies are buffered whole; the proxy observes complete messages
//! - Outgoing bodies are always de-chunked with an explicit Content-Length

pub mod codec;
pub mod headers;
pub mod message;
pub mod request;
pub mod response;

pub use headers::HttpHeaders;
pub use message::HttpMessage;
pub use request::{HttpRequest, MutableHttpRequest};
pub use response::{HttpResponse, MutableHttpResponse};
