//! Bidirectional byte relay for CONNECT tunnels.
//!
//! Bytes are copied verbatim in both directions. Each direction runs until
//! its source reaches end of stream, then passes the FIN on by shutting
//! down the opposite write half. The tunnel ends once both directions are
//! done, as soon as either side resets, or when the session is cancelled.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::net::Connection;
use crate::observability::metrics;

/// Copy buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay between `local` and `remote` until both sides have closed.
///
/// A peer going away, including by reset, counts as a normal end.
pub async fn run(local: &Connection, remote: &Connection, cancel: &CancellationToken) -> Result<()> {
    let relays = async {
        tokio::try_join!(
            relay(local, remote, "upstream"),
            relay(remote, local, "downstream"),
        )
        .map(|_| ())
    };

    let outcome = tokio::select! {
        result = relays => result,
        _ = cancel.cancelled() => return Ok(()),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_peer_closed() => {
            tracing::trace!(error = %e, "Tunnel peer went away");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn relay(from: &Connection, to: &Connection, direction: &'static str) -> Result<()> {
    // The reader may still hold bytes buffered while the request was parsed.
    let mut reader = from.reader().await;
    let mut writer = to.writer().await;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(direction, error = %e, "Ignoring half-close error");
            }
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        metrics::record_tunnel_bytes(direction, n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    /// A connection wrapper on one end, a raw socket on the other.
    async fn pair(key: &str) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        (Arc::new(Connection::new(key, socket).unwrap()), peer)
    }

    #[tokio::test]
    async fn relays_both_ways_until_client_closes() {
        let (local, mut client) = pair("local").await;
        let (remote, mut server) = pair("remote").await;
        let cancel = CancellationToken::new();

        let tunnel = {
            let (local, remote, cancel) = (local.clone(), remote.clone(), cancel.clone());
            tokio::spawn(async move { run(&local, &remote, &cancel).await })
        };

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(server);
        tunnel.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reply_after_client_half_close_is_delivered() {
        let (local, mut client) = pair("local").await;
        let (remote, mut server) = pair("remote").await;
        let cancel = CancellationToken::new();

        let tunnel = {
            let (local, remote, cancel) = (local.clone(), remote.clone(), cancel.clone());
            tokio::spawn(async move { run(&local, &remote, &cancel).await })
        };

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // The origin answers only once it has seen the whole request.
        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");
        server.write_all(b"response-after-request").await.unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response-after-request");
        tunnel.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_ends_tunnel() {
        let (local, _client) = pair("local").await;
        let (remote, _server) = pair("remote").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        run(&local, &remote, &cancel).await.unwrap();
    }
}
