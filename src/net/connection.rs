//! A TCP socket plus its buffered read side and write side.
//!
//! # Responsibilities
//! - Split one socket into independently lockable read and write halves
//! - Carry the pool key that identifies the connection
//! - Track whether the connection has been closed
//!
//! # Design Decisions
//! - Halves sit behind async mutexes so a tunnel can pump both directions
//!   concurrently while the pool still holds a shared handle
//! - Closing shuts down the write half; the socket itself is released when
//!   the last handle drops

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

/// Read buffer size for every connection.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One TCP connection, inbound from a client or outbound to an upstream.
#[derive(Debug)]
pub struct Connection {
    key: String,
    peer_addr: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap a connected socket under `key`.
    pub fn new(key: impl Into<String>, stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            key: key.into(),
            peer_addr,
            reader: Mutex::new(BufReader::with_capacity(READ_BUFFER_SIZE, read_half)),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
        })
    }

    /// Pool key: `host:port` upstream, `local:<addr>` inbound.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Exclusive access to the buffered read side.
    pub async fn reader(&self) -> MutexGuard<'_, BufReader<OwnedReadHalf>> {
        self.reader.lock().await
    }

    /// Exclusive access to the write side.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Write `bytes` in full and flush.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Mark closed and send FIN to the peer.
    ///
    /// Idempotent. If another task is mid-write the shutdown is skipped and
    /// the socket closes once the last handle drops.
    pub async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.writer.try_lock() {
            Ok(mut writer) => writer.shutdown().await,
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new("test", server).unwrap(), client)
    }

    #[tokio::test]
    async fn send_and_read_through_halves() {
        let (conn, mut client) = pair().await;
        assert_eq!(conn.key(), "test");
        assert_eq!(conn.peer_addr(), client.local_addr().unwrap());

        client.write_all(b"hello\r\n").await.unwrap();
        let mut line = String::new();
        conn.reader().await.read_line(&mut line).await.unwrap();
        assert_eq!(line, "hello\r\n");

        conn.send(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_signals_eof() {
        let (conn, mut client) = pair().await;
        assert!(!conn.is_closed());
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
