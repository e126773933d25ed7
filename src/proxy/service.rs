//! The interface consumers program against.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use crate::proxy::events::{ProxyEvent, ProxyState};

/// A proxy that can be started, stopped and observed.
///
/// Implemented by the real [`ProxyServer`](crate::proxy::ProxyServer) and
/// by the scripted [`FakeProxyServer`](crate::proxy::FakeProxyServer).
#[async_trait]
pub trait ProxyService: Send + Sync {
    /// Start accepting clients. Fails if already listening.
    async fn listen(&self) -> Result<SocketAddr>;

    /// Stop accepting, cancel running sessions and wait for them. Idempotent.
    async fn close(&self);

    /// Listening state; new subscribers see the current value first.
    fn state(&self) -> watch::Receiver<ProxyState>;

    /// Session and transaction events from now on.
    fn events(&self) -> broadcast::Receiver<ProxyEvent>;
}
