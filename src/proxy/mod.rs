//! Proxy core: server, sessions, transactions and their events.
//!
//! # Data Flow
//! ```text
//! client connects
//!     → server.rs (accept, register client socket, assign SessionId)
//!     → session.rs (Started, TransactionStarted ... Stopped | Error)
//!     → transaction.rs
//!         plain HTTP: read request → dial upstream → forward
//!                     → read response → write back → Completed
//!         CONNECT:    dial upstream → "200 Connection established"
//!                     → tunnel.rs (relay bytes both ways) → Completed
//!
//! every transition
//!     → events.rs (snapshot into the transaction's latest slot)
//!     → EventSink (server-wide broadcast of ProxyEvent)
//! ```
//!
//! # Design Decisions
//! - One cancellation token per server, with a child token per session
//! - Event publishing never blocks the proxy; slow subscribers lag
//! - `ProxyService` is the seam consumers use; `FakeProxyServer` stands in
//!   for the real server in tests

pub mod events;
pub mod fake;
pub mod server;
pub mod service;
pub mod session;
pub mod transaction;
pub mod tunnel;

pub use events::{
    EventSink, ProxyEvent, ProxyState, SessionEvent, TransactionEvent, TransactionHandle,
    TransactionState,
};
pub use fake::{FakeProxyServer, ScriptBuilder, SessionBuilder, TransactionBuilder};
pub use server::ProxyServer;
pub use service::ProxyService;
pub use session::{Session, SessionId, SessionIdGenerator};
pub use transaction::Transaction;
