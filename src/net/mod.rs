//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → pool.rs (register under local:<addr>)
//!     → connection.rs (buffered read half, write half)
//!     → Hand off to a proxy session
//!
//! Outgoing TCP connection
//!     → pool.rs (dial host:port lazily, one dial per authority)
//!     → connection.rs
//!     → returned (destroyed) when the transaction or tunnel ends
//! ```
//!
//! # Design Decisions
//! - Every connection has a string key and lives in one pool map
//! - Session backpressure is applied before accept, not after

pub mod connection;
pub mod listener;
pub mod pool;

pub use connection::Connection;
pub use listener::{ConnectionPermit, Listener};
pub use pool::{ConnectionPool, DefaultConnectionPool};
