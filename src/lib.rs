//! Amanuensis: a local forward HTTP/1.1 proxy for watching traffic.
//!
//! Clients point their proxy settings at the server; every request and
//! response that passes through is published as an event, and CONNECT
//! requests are tunneled byte for byte.
//!
//! ```text
//!     client ──▶ net::Listener ──▶ proxy::Session ──▶ proxy::Transaction ──▶ upstream
//!                                        │                    │
//!                                        └──── ProxyEvent ◀───┘
//!                                                 │
//!                                    subscribers (UI, event logger)
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::{FakeProxyServer, ProxyEvent, ProxyServer, ProxyService, ProxyState};
