//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! proxy core
//!     → tracing macros           → logging.rs (subscriber, text or JSON)
//!     → ProxyEvent stream        → logging.rs (traffic summary lines)
//!     → metrics macros           → metrics.rs (Prometheus scrape endpoint)
//! ```
//!
//! # Design Decisions
//! - Structured fields (`session_id`, `authority`, ...) on every log line
//! - Metrics are cheap atomic increments and no-ops without a recorder

pub mod logging;
pub mod metrics;

pub use logging::{describe_event, init_logging, spawn_event_logger};
