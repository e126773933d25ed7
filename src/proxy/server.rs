//! The proxy server: accept loop and session supervision.
//!
//! # Responsibilities
//! - Bind the listener and accept client connections
//! - Start one session task per client under a shared cancellation token
//! - Publish the listening state and the aggregated event stream
//! - Stop cleanly: cancel sessions, drain them, then report `Stopped`
//!
//! # Design Decisions
//! - Sessions live in a `JoinSet` owned by the accept loop, so closing the
//!   server can wait for every one of them
//! - Accept failures back off exponentially instead of spinning
//! - Session ids keep increasing across listen/close cycles

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::net::{ConnectionPool, DefaultConnectionPool, Listener};
use crate::proxy::events::{EventSink, ProxyEvent, ProxyState};
use crate::proxy::service::ProxyService;
use crate::proxy::session::{Session, SessionIdGenerator};
use crate::resilience::Backoff;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A running accept loop.
struct Running {
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Local forward HTTP proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    state: watch::Sender<ProxyState>,
    sink: EventSink,
    ids: Arc<SessionIdGenerator>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let (state, _) = watch::channel(ProxyState::Stopped);
        let sink = EventSink::new(config.events.capacity);
        Self {
            config,
            state,
            sink,
            ids: Arc::new(SessionIdGenerator::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

#[async_trait]
impl ProxyService for ProxyServer {
    async fn listen(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyListening);
        }

        let listener = Listener::bind(&self.config.listener).await?;
        let local_addr = listener.local_addr()?;
        let pool = Arc::new(DefaultConnectionPool::new(Duration::from_secs(
            self.config.timeouts.connect_secs,
        )));
        let cancel = CancellationToken::new();

        let accept_loop = tokio::spawn(accept_loop(
            listener,
            pool,
            Arc::clone(&self.ids),
            self.sink.clone(),
            cancel.clone(),
        ));

        *running = Some(Running {
            cancel,
            accept_loop,
            local_addr,
        });
        self.state.send_replace(ProxyState::Listening);

        tracing::info!(address = %local_addr, "Proxy listening");
        Ok(local_addr)
    }

    async fn close(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            tracing::info!(address = %running.local_addr, "Proxy shutting down");
            running.cancel.cancel();
            if let Err(e) = running.accept_loop.await {
                tracing::error!(error = %e, "Accept loop ended abnormally");
            }
            tracing::info!("Proxy stopped");
        }
        self.state.send_replace(ProxyState::Stopped);
    }

    fn state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sink.subscribe()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: Listener,
    pool: Arc<DefaultConnectionPool>,
    ids: Arc<SessionIdGenerator>,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    let mut backoff = Backoff::new(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_MAX);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                log_session_exit(joined);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr, permit)) => {
                    backoff.reset();
                    let local = match pool.register_local_socket(stream).await {
                        Ok(local) => local,
                        Err(e) => {
                            tracing::error!(peer_addr = %peer_addr, error = %e, "Dropping client");
                            continue;
                        }
                    };

                    let id = ids.next_id();
                    tracing::debug!(session_id = %id, peer_addr = %peer_addr, "Session accepted");

                    let session_pool: Arc<dyn ConnectionPool> = pool.clone();
                    let session = Session::new(id, local, session_pool, sink.clone(), cancel.child_token());
                    sessions.spawn(async move {
                        let _permit = permit;
                        session.run_to_completion().await;
                    });
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Accept failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    tracing::debug!(active_sessions = sessions.len(), "Draining sessions");
    while let Some(joined) = sessions.join_next().await {
        log_session_exit(joined);
    }
}

fn log_session_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Session task panicked");
        } else {
            tracing::debug!(error = %e, "Session task cancelled");
        }
    }
}
