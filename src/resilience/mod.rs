//! Resilience helpers.
//!
//! # Data Flow
//! ```text
//! accept() fails (e.g. out of file descriptors)
//!     → backoff.rs (exponential delay with jitter)
//!     → accept loop sleeps, then tries again
//! first success → backoff reset
//! ```

pub mod backoff;

pub use backoff::{calculate_backoff, Backoff};
