//! Client sessions.
//!
//! # Responsibilities
//! - Own one accepted client connection for its whole life
//! - Run its transaction and publish the session lifecycle around it
//! - Release the client connection on every exit path
//!
//! # Design Decisions
//! - One transaction per session; the client connection is closed after it
//! - Ids come from a per-server generator, never from global state

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::net::{Connection, ConnectionPool};
use crate::observability::metrics;
use crate::proxy::events::{EventSink, SessionEvent};
use crate::proxy::transaction::Transaction;

/// Identifier of one session, unique for the lifetime of its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Hands out increasing session ids starting at 1.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }
}

/// One accepted client connection and the exchange carried on it.
pub struct Session {
    id: SessionId,
    local: Option<Arc<Connection>>,
    transaction: Option<Transaction>,
    pool: Arc<dyn ConnectionPool>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: SessionId,
        local: Arc<Connection>,
        pool: Arc<dyn ConnectionPool>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            local: Some(local),
            transaction: None,
            pool,
            sink,
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Publish `Started`, run the transaction, then publish `Stopped` or `Error`.
    pub async fn run(&mut self) -> Result<(), Arc<ProxyError>> {
        let Some(local) = self.local.clone() else {
            return Ok(());
        };
        self.sink.session(SessionEvent::Started { session: self.id });

        let transaction = self.transaction.insert(Transaction::new(
            self.id,
            local,
            Arc::clone(&self.pool),
            self.sink.clone(),
            self.cancel.child_token(),
        ));
        self.sink.session(SessionEvent::TransactionStarted {
            session: self.id,
            transaction: transaction.handle(),
        });

        let outcome = transaction.run().await;
        match &outcome {
            Ok(()) => self.sink.session(SessionEvent::Stopped { session: self.id }),
            Err(error) => self.sink.session(SessionEvent::Error {
                session: self.id,
                error: Arc::clone(error),
            }),
        }
        outcome
    }

    /// Run to the end and release every connection.
    pub async fn run_to_completion(mut self) {
        metrics::record_session_started();
        if let Err(error) = self.run().await {
            tracing::debug!(session_id = %self.id, error = %error, "Session ended with error");
        }
        self.close().await;
        metrics::record_session_finished();
    }

    /// Release the upstream and client connections. Idempotent.
    pub async fn close(&mut self) {
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.close().await;
        }
        if let Some(local) = self.local.take() {
            self.pool.return_connection(&local).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let remote = self.transaction.as_mut().and_then(Transaction::take_remote);
        let local = self.local.take();
        if remote.is_none() && local.is_none() {
            return;
        }

        // Dropped mid-flight (task aborted or panicked): release asynchronously.
        let pool = Arc::clone(&self.pool);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for connection in remote.into_iter().chain(local) {
                    pool.return_connection(&connection).await;
                }
            });
        }
    }
}
