//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from configuration
//! - Turn proxy events into one-line traffic summaries
//! - Follow the server's event stream and log those summaries
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level when set
//! - JSON output is opt-in; the default is human-readable
//! - Only terminal and tunnel-open events are summarized; the rest is
//!   available at debug level from the proxy itself

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::proxy::{ProxyEvent, SessionEvent, TransactionState};

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("amanuensis={}", config.log_level).into());

    let json = config.json_logs.then(|| fmt::layer().json());
    let text = (!config.json_logs).then(fmt::layer);

    if tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// One-line summary of an event, or `None` if it is not worth a line.
pub fn describe_event(event: &ProxyEvent) -> Option<String> {
    match event {
        ProxyEvent::Session(SessionEvent::Error { session, error }) => {
            Some(format!("{} failed: {}", session, error))
        }
        ProxyEvent::Session(_) => None,
        ProxyEvent::Transaction { session, event } => {
            let request = event.request();
            let response = event.response();
            match event.state() {
                TransactionState::TlsSession => Some(format!(
                    "{} CONNECT {} tunnel open",
                    session,
                    request.target()
                )),
                TransactionState::Completed if request.method() == "CONNECT" => Some(format!(
                    "{} CONNECT {} tunnel closed",
                    session,
                    request.target()
                )),
                TransactionState::Completed => Some(format!(
                    "{} {} {} -> {} {}",
                    session,
                    request.method(),
                    request.target(),
                    response.status_code(),
                    response.reason()
                )),
                TransactionState::Error => Some(format!(
                    "{} {} {} error: {}",
                    session,
                    request.method(),
                    request.target(),
                    event
                        .error()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )),
                _ => None,
            }
        }
    }
}

/// Log a summary line for every notable event until the stream closes.
pub fn spawn_event_logger(mut events: broadcast::Receiver<ProxyEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        tracing::info!(session_id = %event.session(), "{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
