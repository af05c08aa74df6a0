//! Relays: one public listener (TCP) or socket (UDP) per exposed port
//!
//! A relay owns its port lease. The lease is dropped by the relay task only
//! after the listener or socket is gone, so a port never returns to the pool
//! while something is still bound to it.

mod tcp;
mod udp;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use goexpose_proto::Transport;

use crate::port_pool::PortLease;
use crate::streams::{FrameSender, StreamRouter};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Consecutive accept/receive failures after which the listener is considered broken
const MAX_CONSECUTIVE_IO_ERRORS: u32 = 8;
const IO_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {transport} relay on {address}: {reason}")]
    BindError {
        transport: Transport,
        address: SocketAddr,
        reason: String,
    },
}

/// Sent to the owning session when a relay stops on its own
#[derive(Debug)]
pub(crate) struct RelayFailure {
    pub relay_id: u64,
    pub transport: Transport,
    pub port: u16,
    pub reason: String,
}

/// Session resources a relay needs to reach the tunnel
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub outbound: FrameSender,
    pub router: Arc<StreamRouter>,
    pub failures: mpsc::Sender<RelayFailure>,
    pub bind_ip: IpAddr,
    /// Tunnel data buffered per TCP stream
    pub stream_queue_capacity: usize,
    pub stream_write_timeout: Duration,
    pub udp_idle_timeout: Duration,
}

impl RelayContext {
    fn report_failure(&self, relay_id: u64, transport: Transport, port: u16, reason: String) {
        let failure = RelayFailure {
            relay_id,
            transport,
            port,
            reason,
        };
        if let Err(e) = self.failures.try_send(failure) {
            warn!("Could not notify session of relay failure: {}", e);
        }
    }
}

/// An exposed port and the task relaying its traffic
pub struct Relay {
    id: u64,
    transport: Transport,
    port: u16,
    target: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Public side of a relay, bound but not yet relaying.
///
/// Lets the session announce the port before the first connection can be
/// reported. Dropping it closes the socket, then returns the port.
pub(crate) struct BoundRelay {
    id: u64,
    transport: Transport,
    target: String,
    socket: BoundSocket,
    lease: PortLease,
    cancel: CancellationToken,
    ctx: RelayContext,
}

enum BoundSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl BoundRelay {
    pub(crate) fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Spawn the accept (TCP) or receive (UDP) loop
    pub(crate) fn start(self) -> Relay {
        let port = self.lease.port();
        let task = match self.socket {
            BoundSocket::Tcp(listener) => tokio::spawn(tcp::run(
                listener,
                self.lease,
                self.id,
                self.ctx,
                self.cancel.clone(),
            )),
            BoundSocket::Udp(socket) => tokio::spawn(udp::run(
                socket,
                self.lease,
                self.id,
                self.ctx,
                self.cancel.clone(),
            )),
        };

        Relay {
            id: self.id,
            transport: self.transport,
            port,
            target: self.target,
            cancel: self.cancel,
            task: Some(task),
        }
    }
}

impl std::fmt::Debug for BoundRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundRelay")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("port", &self.lease.port())
            .finish()
    }
}

impl Relay {
    /// Bind the public side on the leased port.
    ///
    /// On error the lease is dropped, returning the port to the pool.
    pub(crate) async fn bind(
        id: u64,
        transport: Transport,
        target: String,
        lease: PortLease,
        parent: &CancellationToken,
        ctx: RelayContext,
    ) -> Result<BoundRelay, RelayError> {
        let address = SocketAddr::new(ctx.bind_ip, lease.port());

        let socket = match transport {
            Transport::Tcp => BoundSocket::Tcp(
                bind_with_retry(transport, address, |addr| TcpListener::bind(addr)).await?,
            ),
            Transport::Udp => BoundSocket::Udp(
                bind_with_retry(transport, address, |addr| UdpSocket::bind(addr)).await?,
            ),
        };

        info!(
            "{} relay listening on {} for target {}",
            transport, address, target
        );

        Ok(BoundRelay {
            id,
            transport,
            target,
            socket,
            lease,
            cancel: parent.child_token(),
            ctx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_alive(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Close the listener and every live stream, then return the port.
    ///
    /// Waits until the port is back in the pool. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("{} relay on port {} panicked: {}", self.transport, self.port, e);
                }
            }
            info!("{} relay on port {} stopped", self.transport, self.port);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        // The task still releases the port once it unwinds
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("port", &self.port)
            .field("target", &self.target)
            .finish()
    }
}

/// Retry on AddrInUse to ride out sockets lingering in TIME_WAIT
async fn bind_with_retry<T, F, Fut>(
    transport: Transport,
    address: SocketAddr,
    mut bind: F,
) -> Result<T, RelayError>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    for attempt in 1..=BIND_ATTEMPTS {
        match bind(address).await {
            Ok(bound) => {
                if attempt > 1 {
                    info!(
                        "Successfully bound to {} on attempt {}/{}",
                        address, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(bound);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying in {:?}...",
                    address.port(),
                    attempt,
                    BIND_ATTEMPTS,
                    BIND_RETRY_DELAY
                );
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(RelayError::BindError {
                    transport,
                    address,
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(RelayError::BindError {
        transport,
        address,
        reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_pool::{PortAllocator, PortPool};
    use goexpose_proto::Frame;
    use std::net::Ipv4Addr;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn context() -> (RelayContext, mpsc::Receiver<Frame>, mpsc::Receiver<RelayFailure>) {
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (failures_tx, failures_rx) = mpsc::channel(4);
        let ctx = RelayContext {
            outbound: FrameSender::new(frames_tx),
            router: Arc::new(StreamRouter::new()),
            failures: failures_tx,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            stream_queue_capacity: 8,
            stream_write_timeout: Duration::from_secs(10),
            udp_idle_timeout: Duration::from_secs(30),
        };
        (ctx, frames_rx, failures_rx)
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let pool: Arc<dyn PortAllocator> = Arc::new(PortPool::from_ports([free_port()]));
        let (ctx, _frames, _failures) = context();
        let session = CancellationToken::new();

        let lease = PortLease::acquire(&pool).unwrap();
        let port = lease.port();
        let mut relay = Relay::bind(1, Transport::Tcp, "svc".to_string(), lease, &session, ctx)
            .await
            .unwrap()
            .start();
        assert!(relay.is_alive());
        assert_eq!(pool.available(), 0);

        relay.stop().await;
        relay.stop().await;
        assert!(!relay.is_alive());
        assert_eq!(pool.available(), 1);

        // Nothing is left bound to the port
        let rebound = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_session_cancel_stops_relay() {
        let pool: Arc<dyn PortAllocator> = Arc::new(PortPool::from_ports([free_port()]));
        let (ctx, _frames, _failures) = context();
        let session = CancellationToken::new();

        let lease = PortLease::acquire(&pool).unwrap();
        let mut relay = Relay::bind(1, Transport::Udp, "dns".to_string(), lease, &session, ctx)
            .await
            .unwrap()
            .start();

        session.cancel();
        // Concurrent teardown paths converge on the same task
        relay.stop().await;
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_returns_port() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let pool: Arc<dyn PortAllocator> = Arc::new(PortPool::from_ports([port]));
        let (ctx, _frames, _failures) = context();

        let lease = PortLease::acquire(&pool).unwrap();
        let err = Relay::bind(
            1,
            Transport::Tcp,
            "svc".to_string(),
            lease,
            &CancellationToken::new(),
            ctx,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RelayError::BindError { .. }));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_unstarted_relay_returns_port() {
        let pool: Arc<dyn PortAllocator> = Arc::new(PortPool::from_ports([free_port()]));
        let (ctx, _frames, _failures) = context();

        let lease = PortLease::acquire(&pool).unwrap();
        let bound = Relay::bind(
            1,
            Transport::Udp,
            "dns".to_string(),
            lease,
            &CancellationToken::new(),
            ctx,
        )
        .await
        .unwrap();
        let port = bound.port();
        assert_eq!(pool.available(), 0);

        drop(bound);
        assert_eq!(pool.available(), 1);
        assert!(UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await.is_ok());
    }
}
