//! Connection pool management.
//!
//! # Responsibilities
//! - Dial upstream connections lazily, keyed by authority
//! - Register inbound client sockets under `local:<addr>`
//! - Destroy connections when a transaction or tunnel is finished
//!
//! # Design Decisions
//! - One lock guards the whole map, including the dial; this keeps two
//!   tasks from dialing the same authority at once
//! - Returning a connection destroys it; there is no keep-alive reuse

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::net::connection::Connection;
use crate::observability::metrics;

/// Source of upstream connections and registry of inbound ones.
#[async_trait]
pub trait ConnectionPool: Send + Sync + std::fmt::Debug {
    /// Return the live connection for `host:port`, dialing if needed.
    async fn get_or_create_connection(&self, host: &str, port: u16) -> Result<Arc<Connection>>;

    /// Hand a connection back once its holder is done with it.
    async fn return_connection(&self, connection: &Arc<Connection>);

    /// Forget and close a connection. Close errors are ignored.
    async fn destroy_connection(&self, connection: &Arc<Connection>);

    /// Track a socket accepted from a client.
    async fn register_local_socket(&self, socket: TcpStream) -> Result<Arc<Connection>>;
}

/// The pool used by the proxy server.
#[derive(Debug)]
pub struct DefaultConnectionPool {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connect_timeout: Duration,
}

impl DefaultConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Number of tracked connections, inbound and upstream.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    async fn dial(&self, key: &str, host: &str, port: u16) -> Result<Connection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                authority: key.to_string(),
            })?
            .map_err(|source| ProxyError::Connect {
                authority: key.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        metrics::record_upstream_dial();

        tracing::debug!(authority = %key, "Upstream connection established");
        Ok(Connection::new(key, stream)?)
    }
}

#[async_trait]
impl ConnectionPool for DefaultConnectionPool {
    async fn get_or_create_connection(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        let key = format!("{}:{}", host, port);
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&key) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            connections.remove(&key);
        }

        let connection = Arc::new(self.dial(&key, host, port).await?);
        connections.insert(key, Arc::clone(&connection));
        Ok(connection)
    }

    async fn return_connection(&self, connection: &Arc<Connection>) {
        self.destroy_connection(connection).await;
    }

    async fn destroy_connection(&self, connection: &Arc<Connection>) {
        {
            let mut connections = self.connections.lock().await;
            // A replacement may already sit under the same key.
            if connections
                .get(connection.key())
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                connections.remove(connection.key());
            }
        }

        if let Err(e) = connection.close().await {
            tracing::trace!(key = %connection.key(), error = %e, "Ignoring close error");
        }
    }

    async fn register_local_socket(&self, socket: TcpStream) -> Result<Arc<Connection>> {
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;
        let key = format!("local:{}", peer_addr);

        let mut connections = self.connections.lock().await;
        if connections.contains_key(&key) {
            return Err(ProxyError::DuplicateConnection(key));
        }
        let connection = Arc::new(Connection::new(key.clone(), socket)?);
        connections.insert(key, Arc::clone(&connection));
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Accept forever, counting connections and keeping them open.
    async fn counting_upstream() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        (port, accepted)
    }

    fn pool() -> Arc<DefaultConnectionPool> {
        Arc::new(DefaultConnectionPool::new(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_dial() {
        let (port, accepted) = counting_upstream().await;
        let pool = pool();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                pool.get_or_create_connection("127.0.0.1", port).await.unwrap()
            }));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
        assert_eq!(connections[0].key(), format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn returned_connection_is_closed_and_redialed() {
        let (port, accepted) = counting_upstream().await;
        let pool = pool();

        let first = pool.get_or_create_connection("127.0.0.1", port).await.unwrap();
        pool.return_connection(&first).await;
        assert!(first.is_closed());
        assert!(pool.is_empty().await);

        let second = pool.get_or_create_connection("127.0.0.1", port).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_entry_is_replaced() {
        let (port, _) = counting_upstream().await;
        let pool = pool();

        let first = pool.get_or_create_connection("127.0.0.1", port).await.unwrap();
        first.close().await.unwrap();
        let second = pool.get_or_create_connection("127.0.0.1", port).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // Destroying the stale handle must not evict its replacement.
        pool.destroy_connection(&first).await;
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn dial_failure_names_the_authority() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = pool()
            .get_or_create_connection("127.0.0.1", port)
            .await
            .unwrap_err();
        match err {
            ProxyError::Connect { authority, .. } => {
                assert_eq!(authority, format!("127.0.0.1:{}", port))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_sockets_are_keyed_by_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let pool = pool();
        let local = pool.register_local_socket(server_side).await.unwrap();
        assert_eq!(local.key(), format!("local:{}", client.local_addr().unwrap()));
        assert_eq!(pool.len().await, 1);

        pool.return_connection(&local).await;
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn second_registration_of_a_peer_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        // A cloned handle reports the same peer address.
        let std_socket = server_side.into_std().unwrap();
        let twin = TcpStream::from_std(std_socket.try_clone().unwrap()).unwrap();
        let socket = TcpStream::from_std(std_socket).unwrap();

        let pool = pool();
        let first = pool.register_local_socket(socket).await.unwrap();
        let err = pool.register_local_socket(twin).await.unwrap_err();
        match err {
            ProxyError::DuplicateConnection(key) => {
                assert_eq!(key, format!("local:{}", client.local_addr().unwrap()));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(pool.len().await, 1);
        assert!(!first.is_closed());

        pool.return_connection(&first).await;
        assert!(pool.is_empty().await);
    }
}
