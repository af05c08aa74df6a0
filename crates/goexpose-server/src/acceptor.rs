//! Tunnel acceptor: mutual TLS listener that hands each client to a session

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::port_pool::PortAllocator;
use crate::session::{handle_client, SessionContext, SessionEnd};
use crate::tls::ClientIdentity;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TunnelAcceptor {
    listener: TcpListener,
    tls: TlsAcceptor,
    ctx: SessionContext,
    max_sessions: usize,
    handshake_timeout: Duration,
}

impl TunnelAcceptor {
    /// Bind the control listener
    pub async fn bind(
        config: &ServerConfig,
        tls_config: Arc<rustls::ServerConfig>,
        pool: Arc<dyn PortAllocator>,
    ) -> Result<Self, ServerError> {
        let addr = config.control_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: addr.to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        info!(
            "Tunnel listener bound on {} ({} relay ports, up to {} concurrent clients)",
            listener.local_addr()?,
            pool.capacity(),
            config.max_sessions
        );

        Ok(Self {
            listener,
            tls: TlsAcceptor::from(tls_config),
            ctx: SessionContext {
                pool,
                settings: config.session_settings(),
            },
            max_sessions: config.max_sessions.max(1),
            handshake_timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `cancel` fires, then wait for live sessions to tear down.
    ///
    /// A session slot is claimed before the next connection is accepted, so with
    /// `max_sessions = 1` clients are served strictly one after another.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            tls,
            ctx,
            max_sessions,
            handshake_timeout,
        } = self;

        let slots = Arc::new(Semaphore::new(max_sessions));
        let mut sessions = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join(joined);
                    continue;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept tunnel connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };
            debug!("Tunnel connection from {}", peer_addr);

            let tls = tls.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            sessions.spawn(async move {
                let _permit = permit;
                serve_connection(stream, peer_addr, tls, handshake_timeout, ctx, &cancel).await
            });
        }

        drop(listener);
        if !sessions.is_empty() {
            info!("Waiting for {} sessions to close", sessions.len());
        }
        while let Some(joined) = sessions.join_next().await {
            log_join(joined);
        }
        info!("Tunnel acceptor stopped");
    }
}

fn log_join(joined: Result<Option<SessionEnd>, tokio::task::JoinError>) {
    match joined {
        Ok(Some(end)) => debug!("Session slot freed ({:?})", end),
        Ok(None) => {}
        Err(e) if e.is_panic() => error!("Session task panicked: {}", e),
        Err(_) => {}
    }
}

/// Authenticate one connection and run its session. None if it never got that far.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: TlsAcceptor,
    handshake_timeout: Duration,
    ctx: SessionContext,
    cancel: &CancellationToken,
) -> Option<SessionEnd> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
    }

    let handshake = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        handshake = tokio::time::timeout(handshake_timeout, tls.accept(stream)) => handshake,
    };

    let tls_stream = match handshake {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!("TLS handshake with {} failed: {}", peer_addr, e);
            return None;
        }
        Err(_) => {
            warn!(
                "TLS handshake with {} timed out after {:?}",
                peer_addr, handshake_timeout
            );
            return None;
        }
    };

    let Some(identity) = ClientIdentity::from_connection(tls_stream.get_ref().1, peer_addr) else {
        warn!("Refusing {}: no client certificate", peer_addr);
        return None;
    };

    info!("Client {} authenticated", identity);
    Some(handle_client(cancel, tls_stream, identity, ctx).await)
}
