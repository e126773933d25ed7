//! Observable proxy events.
//!
//! Every transaction transition produces a [`TransactionEvent`] snapshot.
//! Sessions add [`SessionEvent`]s around them, and the server republishes
//! both on one [`ProxyEvent`] stream.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::error::ProxyError;
use crate::http::{HttpRequest, HttpResponse};
use crate::proxy::session::SessionId;

/// Lifecycle position of one transaction.
///
/// Variants are declared in the only order a transaction may move through
/// them; `Error` may follow any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionState {
    Started,
    RequestLine,
    RequestHeaders,
    RequestBody,
    RequestComplete,
    ResponseLine,
    ResponseHeaders,
    ResponseBody,
    ResponseComplete,
    TlsSession,
    Completed,
    Error,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Error)
    }

    /// Whether moving from `self` to `next` is legal.
    pub fn can_advance_to(self, next: TransactionState) -> bool {
        !self.is_terminal() && next > self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Started => "STARTED",
            TransactionState::RequestLine => "REQUEST_LINE",
            TransactionState::RequestHeaders => "REQUEST_HEADERS",
            TransactionState::RequestBody => "REQUEST_BODY",
            TransactionState::RequestComplete => "REQUEST_COMPLETE",
            TransactionState::ResponseLine => "RESPONSE_LINE",
            TransactionState::ResponseHeaders => "RESPONSE_HEADERS",
            TransactionState::ResponseBody => "RESPONSE_BODY",
            TransactionState::ResponseComplete => "RESPONSE_COMPLETE",
            TransactionState::TlsSession => "TLS_SESSION",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a transaction taken at one transition.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    state: TransactionState,
    request: HttpRequest,
    response: HttpResponse,
    error: Option<Arc<ProxyError>>,
}

impl TransactionEvent {
    /// A snapshot for any state but `Error`.
    pub fn new(state: TransactionState, request: HttpRequest, response: HttpResponse) -> Self {
        assert_ne!(state, TransactionState::Error, "error snapshots need a cause");
        Self {
            state,
            request,
            response,
            error: None,
        }
    }

    pub fn failed(request: HttpRequest, response: HttpResponse, error: Arc<ProxyError>) -> Self {
        Self {
            state: TransactionState::Error,
            request,
            response,
            error: Some(error),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// The cause, present exactly when the state is `Error`.
    pub fn error(&self) -> Option<&Arc<ProxyError>> {
        self.error.as_ref()
    }
}

/// Read side of one transaction's latest-event slot.
///
/// New subscribers immediately observe the most recent snapshot.
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    latest: watch::Receiver<TransactionEvent>,
}

impl TransactionHandle {
    pub fn new(latest: watch::Receiver<TransactionEvent>) -> Self {
        Self { latest }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransactionEvent> {
        self.latest.clone()
    }

    pub fn latest(&self) -> TransactionEvent {
        self.latest.borrow().clone()
    }

    pub fn state(&self) -> TransactionState {
        self.latest.borrow().state()
    }
}

/// Lifecycle of one accepted client connection.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        session: SessionId,
    },
    TransactionStarted {
        session: SessionId,
        transaction: TransactionHandle,
    },
    Error {
        session: SessionId,
        error: Arc<ProxyError>,
    },
    Stopped {
        session: SessionId,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Started { session }
            | SessionEvent::TransactionStarted { session, .. }
            | SessionEvent::Error { session, .. }
            | SessionEvent::Stopped { session } => *session,
        }
    }
}

/// Everything published on the server-wide stream.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Session(SessionEvent),
    Transaction {
        session: SessionId,
        event: TransactionEvent,
    },
}

impl ProxyEvent {
    pub fn session(&self) -> SessionId {
        match self {
            ProxyEvent::Session(event) => event.session(),
            ProxyEvent::Transaction { session, .. } => *session,
        }
    }
}

/// Server-wide listening state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Listening,
}

/// Publishing side of the server-wide stream.
///
/// Sending never waits: subscribers that fall behind by more than the
/// channel capacity observe a lag instead of slowing the proxy down.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProxyEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn session(&self, event: SessionEvent) {
        self.publish(ProxyEvent::Session(event));
    }

    pub fn transaction(&self, session: SessionId, event: TransactionEvent) {
        self.publish(ProxyEvent::Transaction { session, event });
    }
}
