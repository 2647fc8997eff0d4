//! Long-lived cached TCP connections.
//!
//! Opening a TCP socket per transaction is wasteful on links that poll
//! every few seconds, so [`CachedTcpTransport`] keeps one socket alive
//! across calls. An idle-expiry watcher task closes the socket after a
//! configured quiet period; every successful transaction re-arms the
//! deadline, and the next request after an expiry reconnects
//! transparently.
//!
//! Connection state machine:
//!
//! ```text
//! Closed -> Connecting -> Open -> (Closed on idle expiry | I/O error)
//! ```
//!
//! Concurrent open attempts are serialised by the internal mutex, so at
//! most one physical socket exists per cache instance. The watcher task is
//! owned by the transport and aborted on [`ModbusTransport::close`] or
//! drop, so no timer threads leak.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket open.
    Closed,
    /// A connect attempt is in flight.
    Connecting,
    /// A socket is open and usable.
    Open,
}

struct CachedInner {
    address: SocketAddr,
    timeout: Duration,
    idle_timeout: Duration,
    /// Serialises transactions and open/close transitions.
    link: Mutex<LinkState>,
    /// Milliseconds of activity clock at the last completed transaction.
    last_activity_ms: AtomicU64,
    /// Activity clock epoch.
    epoch: Instant,
    stats: Mutex<TransportStats>,
}

struct LinkState {
    state: ConnState,
    transport: Option<TcpTransport>,
}

impl CachedInner {
    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }
}

/// A TCP transport that persists its socket across transactions.
///
/// Shareable as the link handle for any number of
/// [`ModbusConnection`](crate::connection::ModbusConnection)s; the internal
/// mutex guarantees request/response cycles never interleave on the wire.
pub struct CachedTcpTransport {
    inner: Arc<CachedInner>,
    watcher: Option<JoinHandle<()>>,
}

impl CachedTcpTransport {
    /// Create a cached transport for the endpoint.
    ///
    /// No socket is opened until the first request. When `idle_timeout` is
    /// zero the idle watcher is not started and the socket lives until an
    /// error or an explicit close.
    pub fn new(address: SocketAddr, timeout: Duration, idle_timeout: Duration) -> Self {
        let inner = Arc::new(CachedInner {
            address,
            timeout,
            idle_timeout,
            link: Mutex::new(LinkState {
                state: ConnState::Closed,
                transport: None,
            }),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            stats: Mutex::new(TransportStats::default()),
        });

        let watcher = if idle_timeout > Duration::ZERO {
            Some(Self::spawn_watcher(inner.clone()))
        } else {
            None
        };

        Self { inner, watcher }
    }

    /// The current connection state.
    pub async fn state(&self) -> ConnState {
        self.inner.link.lock().await.state
    }

    fn spawn_watcher(inner: Arc<CachedInner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let idle_timeout = inner.idle_timeout;
            loop {
                let idle = inner.idle_for();
                if idle >= idle_timeout {
                    // the link lock excludes closing mid-transaction
                    let mut link = inner.link.lock().await;
                    let still_idle = inner.idle_for() >= idle_timeout;
                    if still_idle && link.state == ConnState::Open {
                        debug!(
                            "Closing idle cached connection to {} after {:?}",
                            inner.address, idle_timeout
                        );
                        if let Some(mut transport) = link.transport.take() {
                            let _ = transport.close().await;
                        }
                        link.state = ConnState::Closed;
                    }
                    drop(link);
                    tokio::time::sleep(idle_timeout).await;
                } else {
                    tokio::time::sleep(idle_timeout - idle).await;
                }
            }
        })
    }

    async fn ensure_open(link: &mut LinkState, inner: &CachedInner) -> ModbusResult<()> {
        if link.state == ConnState::Open && link.transport.is_some() {
            return Ok(());
        }
        link.state = ConnState::Connecting;
        match TcpTransport::connect(inner.address, inner.timeout).await {
            Ok(transport) => {
                link.transport = Some(transport);
                link.state = ConnState::Open;
                Ok(())
            }
            Err(e) => {
                link.transport = None;
                link.state = ConnState::Closed;
                Err(e)
            }
        }
    }

    /// Execute a request, opening or reusing the cached socket.
    pub async fn execute(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let inner = &self.inner;
        let mut link = inner.link.lock().await;
        Self::ensure_open(&mut link, inner).await?;

        let transport = link
            .transport
            .as_mut()
            .ok_or_else(|| ModbusError::internal("Cached transport missing after open"))?;

        let result = transport.request(request).await;
        let transport_stats = transport.get_stats();

        match &result {
            Ok(_) => {
                inner.touch();
            }
            Err(e) if e.is_transport_error() => {
                // drop the broken socket; the next call reconnects
                if let Some(mut transport) = link.transport.take() {
                    let _ = transport.close().await;
                }
                link.state = ConnState::Closed;
            }
            Err(_) => {
                inner.touch();
            }
        }

        *inner.stats.lock().await = transport_stats;
        result
    }

    /// Close the socket and cancel the idle watcher.
    pub async fn shutdown(&mut self) -> ModbusResult<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        let mut link = self.inner.link.lock().await;
        if let Some(mut transport) = link.transport.take() {
            let _ = transport.close().await;
        }
        link.state = ConnState::Closed;
        Ok(())
    }
}

impl Drop for CachedTcpTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl ModbusTransport for CachedTcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.execute(request).await
    }

    fn is_connected(&self) -> bool {
        // non-blocking view; Connecting counts as not yet usable
        self.inner
            .link
            .try_lock()
            .map(|link| link.state == ConnState::Open)
            .unwrap_or(true)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.shutdown().await
    }

    fn get_stats(&self) -> TransportStats {
        self.inner
            .stats
            .try_lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_closed() {
        let cache = CachedTcpTransport::new(
            "127.0.0.1:1502".parse().unwrap(),
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        assert_eq!(cache.state().await, ConnState::Closed);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_closed() {
        let cache = CachedTcpTransport::new(
            // unroutable per RFC 5737, so connect times out or refuses
            "192.0.2.1:502".parse().unwrap(),
            Duration::from_millis(50),
            Duration::from_secs(30),
        );
        let request = ModbusRequest::new_read(
            1,
            crate::protocol::FunctionCode::ReadHoldingRegisters,
            0,
            1,
        );
        let result = cache.execute(&request).await;
        assert!(result.is_err());
        assert_eq!(cache.state().await, ConnState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_watcher() {
        let mut cache = CachedTcpTransport::new(
            "127.0.0.1:1502".parse().unwrap(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        assert!(cache.watcher.is_some());
        cache.shutdown().await.unwrap();
        assert!(cache.watcher.is_none());
    }
}
