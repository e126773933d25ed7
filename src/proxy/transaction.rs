//! One request/response exchange, or one CONNECT tunnel.
//!
//! # Responsibilities
//! - Read the client's request and forward it upstream
//! - Read the upstream response and write it back to the client
//! - Open a byte tunnel for CONNECT requests
//! - Publish a snapshot on every state transition
//!
//! # Design Decisions
//! - States only move forward; an illegal transition is a bug and panics
//! - Cancellation stops an HTTP exchange quietly: no `Error` snapshot is
//!   published and the caller sees `Ok`. An open tunnel that is cancelled
//!   ends in `Completed`
//! - The upstream connection is released as soon as the exchange is done

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::{Host, Url};

use crate::error::{ProxyError, Result};
use crate::http::codec;
use crate::http::request::{parse_authority, DEFAULT_HTTPS_PORT};
use crate::http::{HttpMessage, MutableHttpRequest, MutableHttpResponse};
use crate::net::{Connection, ConnectionPool};
use crate::observability::metrics;
use crate::proxy::events::{EventSink, TransactionEvent, TransactionHandle, TransactionState};
use crate::proxy::session::SessionId;
use crate::proxy::tunnel;

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn guarded<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        result = fut => result,
    }
}

/// Upstream `(host, port)` for a resolved request URL.
fn upstream_authority(url: &Url) -> Result<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => return Err(ProxyError::InvalidTarget(format!("{} has no host", url))),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProxyError::InvalidTarget(format!("{} has no port", url)))?;
    Ok((host, port))
}

/// A single proxied exchange on behalf of one session.
pub struct Transaction {
    session: SessionId,
    state: TransactionState,
    request: MutableHttpRequest,
    response: MutableHttpResponse,
    local: Arc<Connection>,
    remote: Option<Arc<Connection>>,
    pool: Arc<dyn ConnectionPool>,
    latest: watch::Sender<TransactionEvent>,
    sink: EventSink,
    cancel: CancellationToken,
}

impl Transaction {
    pub fn new(
        session: SessionId,
        local: Arc<Connection>,
        pool: Arc<dyn ConnectionPool>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let request = MutableHttpRequest::new();
        let response = MutableHttpResponse::new();
        let (latest, _) = watch::channel(TransactionEvent::new(
            TransactionState::Started,
            request.to_immutable(),
            response.to_immutable(),
        ));

        Self {
            session,
            state: TransactionState::Started,
            request,
            response,
            local,
            remote: None,
            pool,
            latest,
            sink,
            cancel,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &MutableHttpRequest {
        &self.request
    }

    pub fn response(&self) -> &MutableHttpResponse {
        &self.response
    }

    /// A replaying view of this transaction's snapshots.
    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle::new(self.latest.subscribe())
    }

    /// Drive the exchange to completion.
    ///
    /// On failure the transaction is moved to `Error` and the same cause
    /// is returned to the caller.
    pub async fn run(&mut self) -> std::result::Result<(), Arc<ProxyError>> {
        match self.drive().await {
            Ok(()) => {
                metrics::record_transaction("completed");
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                tracing::debug!(session_id = %self.session, state = %self.state, "Transaction cancelled");
                metrics::record_transaction("cancelled");
                self.release_remote().await;
                Ok(())
            }
            Err(e) => {
                let error = Arc::new(e);
                tracing::debug!(
                    session_id = %self.session,
                    state = %self.state,
                    error = %error,
                    "Transaction failed"
                );
                metrics::record_transaction("error");
                self.release_remote().await;
                self.fail(Arc::clone(&error));
                Err(error)
            }
        }
    }

    /// Release the upstream connection, if any. Idempotent.
    pub async fn close(&mut self) {
        self.release_remote().await;
    }

    pub(crate) fn take_remote(&mut self) -> Option<Arc<Connection>> {
        self.remote.take()
    }

    async fn drive(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        guarded(&cancel, self.read_request()).await?;
        if self.request.is_connect() {
            self.open_tunnel(&cancel).await
        } else {
            guarded(&cancel, self.forward()).await
        }
    }

    async fn read_request(&mut self) -> Result<()> {
        let local = Arc::clone(&self.local);
        let mut reader = local.reader().await;

        let line = codec::read_line(&mut *reader).await?;
        self.request.set_status_line(&line)?;
        self.advance(TransactionState::RequestLine);
        tracing::debug!(
            session_id = %self.session,
            method = %self.request.method(),
            target = %self.request.target(),
            "Request line received"
        );

        codec::read_headers(&mut *reader, &mut self.request).await?;
        self.advance(TransactionState::RequestHeaders);

        codec::read_body(&mut *reader, &mut self.request).await?;
        self.advance(TransactionState::RequestBody);
        Ok(())
    }

    async fn forward(&mut self) -> Result<()> {
        let url = self.request.absolute_url()?;
        let (host, port) = upstream_authority(&url)?;
        let remote = self.pool.get_or_create_connection(&host, port).await?;
        self.remote = Some(Arc::clone(&remote));

        remote.send(&self.request.to_bytes()).await?;
        self.advance(TransactionState::RequestComplete);

        {
            let mut reader = remote.reader().await;

            let line = codec::read_line(&mut *reader).await?;
            self.response.set_status_line(&line)?;
            self.advance(TransactionState::ResponseLine);

            codec::read_headers(&mut *reader, &mut self.response).await?;
            self.advance(TransactionState::ResponseHeaders);

            if codec::response_has_body(self.request.method(), self.response.status_code()) {
                codec::read_body(&mut *reader, &mut self.response).await?;
            }
            self.advance(TransactionState::ResponseBody);
        }

        self.local.send(&self.response.to_bytes()).await?;
        self.advance(TransactionState::ResponseComplete);

        tracing::debug!(
            session_id = %self.session,
            url = %url,
            status = self.response.status_code(),
            "Response relayed"
        );

        self.release_remote().await;
        self.advance(TransactionState::Completed);
        Ok(())
    }

    async fn open_tunnel(&mut self, cancel: &CancellationToken) -> Result<()> {
        let (host, port) = parse_authority(self.request.target(), DEFAULT_HTTPS_PORT)?;
        let remote = guarded(cancel, self.pool.get_or_create_connection(&host, port)).await?;
        self.remote = Some(Arc::clone(&remote));

        self.response = MutableHttpResponse::connection_established();
        self.advance(TransactionState::TlsSession);
        let reply = self.response.to_bytes();
        guarded(cancel, async {
            self.local.send(&reply).await.map_err(ProxyError::from)
        })
        .await?;

        tracing::debug!(session_id = %self.session, authority = %remote.key(), "Tunnel open");

        let local = Arc::clone(&self.local);
        let outcome = tunnel::run(&local, &remote, cancel).await;
        self.release_remote().await;
        outcome?;

        // A tunnel cut short by cancellation still completes.
        self.advance(TransactionState::Completed);
        Ok(())
    }

    async fn release_remote(&mut self) {
        if let Some(remote) = self.remote.take() {
            self.pool.return_connection(&remote).await;
        }
    }

    fn advance(&mut self, next: TransactionState) {
        let event = TransactionEvent::new(
            next,
            self.request.to_immutable(),
            self.response.to_immutable(),
        );
        self.publish(event);
    }

    fn fail(&mut self, error: Arc<ProxyError>) {
        if self.state == TransactionState::Error {
            return;
        }
        let event = TransactionEvent::failed(
            self.request.to_immutable(),
            self.response.to_immutable(),
            error,
        );
        self.publish(event);
    }

    fn publish(&mut self, event: TransactionEvent) {
        let next = event.state();
        assert!(
            self.state.can_advance_to(next),
            "illegal transaction transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.latest.send_replace(event.clone());
        self.sink.transaction(self.session, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DefaultConnectionPool;
    use crate::proxy::events::ProxyEvent;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Harness {
        transaction: Transaction,
        client: TcpStream,
        events: tokio::sync::broadcast::Receiver<ProxyEvent>,
        cancel: CancellationToken,
    }

    async fn harness() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let pool: Arc<dyn ConnectionPool> =
            Arc::new(DefaultConnectionPool::new(Duration::from_secs(2)));
        let local = pool.register_local_socket(server_side).await.unwrap();
        let sink = EventSink::new(64);
        let events = sink.subscribe();
        let cancel = CancellationToken::new();
        let transaction = Transaction::new(SessionId::new(1), local, pool, sink, cancel.clone());

        Harness {
            transaction,
            client,
            events,
            cancel,
        }
    }

    /// Upstream that answers one request with a fixed response.
    async fn upstream(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(reply).await.unwrap();
            let _ = socket.shutdown().await;
        });
        port
    }

    fn states(events: &mut tokio::sync::broadcast::Receiver<ProxyEvent>) -> Vec<TransactionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProxyEvent::Transaction { event, .. } = event {
                states.push(event.state());
            }
        }
        states
    }

    #[test]
    fn authority_from_url() {
        let url = Url::parse("http://[::1]:8080/x").unwrap();
        assert_eq!(upstream_authority(&url).unwrap(), ("::1".to_string(), 8080));
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(
            upstream_authority(&url).unwrap(),
            ("example.com".to_string(), 443)
        );
    }

    #[tokio::test]
    async fn http_exchange_walks_every_state() {
        let port = upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
        let mut h = harness().await;
        let handle = h.transaction.handle();

        let request = format!(
            "GET http://127.0.0.1:{}/path HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
            port
        );
        h.client.write_all(request.as_bytes()).await.unwrap();

        h.transaction.run().await.unwrap();
        assert_eq!(h.transaction.state(), TransactionState::Completed);

        let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let mut reply = vec![0u8; expected.len()];
        h.client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], &expected[..]);

        use TransactionState::*;
        assert_eq!(
            states(&mut h.events),
            vec![
                RequestLine,
                RequestHeaders,
                RequestBody,
                RequestComplete,
                ResponseLine,
                ResponseHeaders,
                ResponseBody,
                ResponseComplete,
                Completed
            ]
        );
        let latest = handle.latest();
        assert_eq!(latest.state(), Completed);
        assert_eq!(latest.response().status_code(), 200);
        assert_eq!(latest.response().body().unwrap().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let port = upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").await;
        let mut h = harness().await;

        let request = format!("HEAD http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port);
        h.client.write_all(request.as_bytes()).await.unwrap();

        h.transaction.run().await.unwrap();
        assert!(h.transaction.response().body().is_none());
    }

    #[tokio::test]
    async fn malformed_request_moves_to_error() {
        let mut h = harness().await;
        let handle = h.transaction.handle();
        h.client.write_all(b"GARBAGE\r\n").await.unwrap();

        let error = h.transaction.run().await.unwrap_err();
        assert!(matches!(*error, ProxyError::MalformedStatusLine(_)));
        assert_eq!(h.transaction.state(), TransactionState::Error);

        let latest = handle.latest();
        assert_eq!(latest.state(), TransactionState::Error);
        assert!(Arc::ptr_eq(latest.error().unwrap(), &error));
        assert_eq!(states(&mut h.events), vec![TransactionState::Error]);
    }

    #[tokio::test]
    async fn unreachable_upstream_moves_to_error() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut h = harness().await;
        let request = format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port);
        h.client.write_all(request.as_bytes()).await.unwrap();

        let error = h.transaction.run().await.unwrap_err();
        assert!(matches!(*error, ProxyError::Connect { .. }));
        assert_eq!(
            states(&mut h.events).last(),
            Some(&TransactionState::Error)
        );
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error() {
        let mut h = harness().await;
        h.cancel.cancel();

        h.transaction.run().await.unwrap();
        assert_eq!(h.transaction.state(), TransactionState::Started);
        assert!(states(&mut h.events).is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "illegal transaction transition")]
    async fn backwards_transition_panics() {
        let mut h = harness().await;
        h.transaction.advance(TransactionState::ResponseLine);
        h.transaction.advance(TransactionState::RequestLine);
    }
}
