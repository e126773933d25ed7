//! A scripted stand-in for [`ProxyServer`](crate::proxy::ProxyServer).
//!
//! Consumers of the event stream (UIs, loggers) can be exercised without
//! sockets: build a script of sessions and transactions, then `listen()`
//! replays it.
//!
//! ```
//! use amanuensis::proxy::{FakeProxyServer, ProxyService, ScriptBuilder};
//!
//! # tokio_test_block_on(async {
//! let server: FakeProxyServer = ScriptBuilder::new()
//!     .session(|s| s.transaction(|t| { t.exchange("GET", "http://a/", 200, "OK", b"hi"); }))
//!     .into_server();
//! let mut events = server.events();
//! server.listen().await.unwrap();
//! assert!(events.recv().await.is_ok());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::error::{ProxyError, Result};
use crate::http::{HttpMessage, MutableHttpRequest, MutableHttpResponse};
use crate::proxy::events::{
    EventSink, ProxyEvent, ProxyState, SessionEvent, TransactionEvent, TransactionHandle,
    TransactionState,
};
use crate::proxy::service::ProxyService;
use crate::proxy::session::SessionId;

/// Replays a fixed event script each time it starts listening.
pub struct FakeProxyServer {
    script: Vec<ProxyEvent>,
    state: watch::Sender<ProxyState>,
    sink: EventSink,
    listening: AtomicBool,
}

impl FakeProxyServer {
    pub fn new(script: Vec<ProxyEvent>) -> Self {
        let (state, _) = watch::channel(ProxyState::Stopped);
        let sink = EventSink::new(script.len().max(16));
        Self {
            script,
            state,
            sink,
            listening: AtomicBool::new(false),
        }
    }

    pub fn script(&self) -> &[ProxyEvent] {
        &self.script
    }
}

#[async_trait]
impl ProxyService for FakeProxyServer {
    async fn listen(&self) -> Result<SocketAddr> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(ProxyError::AlreadyListening);
        }
        self.state.send_replace(ProxyState::Listening);
        for event in &self.script {
            self.sink.publish(event.clone());
        }
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    async fn close(&self) {
        self.listening.store(false, Ordering::Release);
        self.state.send_replace(ProxyState::Stopped);
    }

    fn state(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.sink.subscribe()
    }
}

/// Builds a script of sessions, numbered from 1.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    sessions: u64,
    events: Vec<ProxyEvent>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, build: impl FnOnce(&mut SessionBuilder)) -> Self {
        self.sessions += 1;
        let mut session = SessionBuilder::new(SessionId::new(self.sessions));
        build(&mut session);
        self.events.extend(session.finish());
        self
    }

    pub fn build(self) -> Vec<ProxyEvent> {
        self.events
    }

    pub fn into_server(self) -> FakeProxyServer {
        FakeProxyServer::new(self.events)
    }
}

/// Events of one scripted session.
#[derive(Debug)]
pub struct SessionBuilder {
    id: SessionId,
    events: Vec<ProxyEvent>,
    error: Option<Arc<ProxyError>>,
}

impl SessionBuilder {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            events: Vec::new(),
            error: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Add a transaction. A failed transaction also fails the session.
    pub fn transaction(&mut self, build: impl FnOnce(&mut TransactionBuilder)) {
        let mut transaction = TransactionBuilder::new();
        build(&mut transaction);

        let (handle, events) = transaction.finish();
        self.events.push(ProxyEvent::Session(SessionEvent::TransactionStarted {
            session: self.id,
            transaction: handle,
        }));
        for event in events {
            if let Some(error) = event.error() {
                self.error = Some(Arc::clone(error));
            }
            self.events.push(ProxyEvent::Transaction {
                session: self.id,
                event,
            });
        }
    }

    /// End the session with `Error` instead of `Stopped`.
    pub fn fail(&mut self, error: ProxyError) {
        self.error = Some(Arc::new(error));
    }

    fn finish(self) -> Vec<ProxyEvent> {
        let mut events = Vec::with_capacity(self.events.len() + 2);
        events.push(ProxyEvent::Session(SessionEvent::Started { session: self.id }));
        events.extend(self.events);
        events.push(ProxyEvent::Session(match self.error {
            Some(error) => SessionEvent::Error {
                session: self.id,
                error,
            },
            None => SessionEvent::Stopped { session: self.id },
        }));
        events
    }
}

/// Snapshots of one scripted transaction.
///
/// Each step advances the state and records a snapshot, so steps must be
/// called in lifecycle order.
#[derive(Debug)]
pub struct TransactionBuilder {
    state: TransactionState,
    request: MutableHttpRequest,
    response: MutableHttpResponse,
    events: Vec<TransactionEvent>,
}

impl TransactionBuilder {
    fn new() -> Self {
        Self {
            state: TransactionState::Started,
            request: MutableHttpRequest::new(),
            response: MutableHttpResponse::new(),
            events: Vec::new(),
        }
    }

    pub fn request_line(&mut self, method: &str, target: &str) -> &mut Self {
        self.request = MutableHttpRequest::with_line(method, target, "HTTP/1.1");
        self.advance(TransactionState::RequestLine)
    }

    pub fn request_headers(&mut self, headers: &[(&str, &str)]) -> &mut Self {
        for (name, value) in headers {
            self.request.headers_mut().append(*name, *value);
        }
        self.advance(TransactionState::RequestHeaders)
    }

    pub fn request_body(&mut self, body: &[u8]) -> &mut Self {
        self.request
            .set_body((!body.is_empty()).then(|| Bytes::copy_from_slice(body)));
        self.advance(TransactionState::RequestBody)
    }

    pub fn request_complete(&mut self) -> &mut Self {
        self.advance(TransactionState::RequestComplete)
    }

    pub fn response_line(&mut self, status_code: u16, reason: &str) -> &mut Self {
        self.response = MutableHttpResponse::with_status(status_code, reason);
        self.advance(TransactionState::ResponseLine)
    }

    pub fn response_headers(&mut self, headers: &[(&str, &str)]) -> &mut Self {
        for (name, value) in headers {
            self.response.headers_mut().append(*name, *value);
        }
        self.advance(TransactionState::ResponseHeaders)
    }

    pub fn response_body(&mut self, body: &[u8]) -> &mut Self {
        self.response
            .set_body((!body.is_empty()).then(|| Bytes::copy_from_slice(body)));
        self.advance(TransactionState::ResponseBody)
    }

    pub fn response_complete(&mut self) -> &mut Self {
        self.advance(TransactionState::ResponseComplete)
    }

    /// A whole successful HTTP exchange, ending in `Completed`.
    pub fn exchange(
        &mut self,
        method: &str,
        target: &str,
        status_code: u16,
        reason: &str,
        body: &[u8],
    ) -> &mut Self {
        self.request_line(method, target)
            .request_headers(&[])
            .request_body(&[])
            .request_complete()
            .response_line(status_code, reason)
            .response_headers(&[])
            .response_body(body)
            .response_complete()
            .complete()
    }

    /// A CONNECT to `host` that reached the tunnel stage.
    pub fn tls_session(&mut self, host: &str) -> &mut Self {
        self.request = MutableHttpRequest::with_line("CONNECT", host, "HTTP/1.1");
        self.request.headers_mut().set("Host", host);
        self.response = MutableHttpResponse::connection_established();
        self.advance(TransactionState::TlsSession)
    }

    pub fn complete(&mut self) -> &mut Self {
        self.advance(TransactionState::Completed)
    }

    pub fn fail(&mut self, error: ProxyError) -> &mut Self {
        self.check(TransactionState::Error);
        self.state = TransactionState::Error;
        self.events.push(TransactionEvent::failed(
            self.request.to_immutable(),
            self.response.to_immutable(),
            Arc::new(error),
        ));
        self
    }

    fn advance(&mut self, next: TransactionState) -> &mut Self {
        self.check(next);
        self.state = next;
        self.events.push(TransactionEvent::new(
            next,
            self.request.to_immutable(),
            self.response.to_immutable(),
        ));
        self
    }

    fn check(&self, next: TransactionState) {
        assert!(
            self.state.can_advance_to(next),
            "scripted transaction cannot go from {} to {}",
            self.state,
            next
        );
    }

    /// A handle already pointing at the final snapshot, plus every snapshot.
    fn finish(self) -> (TransactionHandle, Vec<TransactionEvent>) {
        let initial = TransactionEvent::new(
            TransactionState::Started,
            MutableHttpRequest::new().to_immutable(),
            MutableHttpResponse::new().to_immutable(),
        );
        let (latest, rx) = watch::channel(initial);
        if let Some(last) = self.events.last() {
            latest.send_replace(last.clone());
        }
        (TransactionHandle::new(rx), self.events)
    }
}
