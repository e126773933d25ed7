//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use amanuensis::{ProxyConfig, ProxyEvent, ProxyServer, ProxyService};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

/// Start a mock origin that answers every request with `body`.
///
/// The request head (status line and headers, without the blank line) of
/// each request is sent on the returned channel.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = socket.into_split();
                let mut reader = BufReader::new(read_half);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                let length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let mut request_body = vec![0u8; length];
                let _ = reader.read_exact(&mut request_body).await;
                let _ = tx.send(head);

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = write_half.write_all(response.as_bytes()).await;
                let _ = write_half.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// Start an origin that answers every `ping` with `pong`.
pub async fn start_ping_pong_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                while socket.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"ping" && socket.write_all(b"pong").await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// A proxy on an ephemeral loopback port, already listening.
pub async fn start_proxy() -> (ProxyServer, SocketAddr, broadcast::Receiver<ProxyEvent>) {
    let mut config = ProxyConfig::with_port(0);
    config.listener.host = "127.0.0.1".into();
    config.timeouts.connect_secs = 2;

    let server = ProxyServer::new(config);
    let events = server.events();
    let addr = server.listen().await.unwrap();
    (server, addr, events)
}

/// Collect events until `done` matches one, or fail after five seconds.
pub async fn collect_until<F>(events: &mut broadcast::Receiver<ProxyEvent>, done: F) -> Vec<ProxyEvent>
where
    F: Fn(&ProxyEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for proxy events");
    seen
}
