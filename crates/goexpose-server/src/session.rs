//! Client session: the control-protocol state machine for one tunnel
//!
//! Three tasks cooperate per session. A reader decodes frames onto the inbound
//! queue, the session loop digests them and drives relay lifecycle, and a
//! single writer drains the outbound queue onto the socket. Relay pumps write
//! to the same outbound queue, so nothing else ever touches the socket.
//!
//! Every task and relay hangs off the session's cancellation token. Whatever
//! ends the session (unpair, disconnect, a fatal codec error or shutdown) ends
//! up in the same teardown path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use goexpose_proto::{
    CodecError, ExposeFailure, Frame, FrameReader, FrameWriter, StreamId, Transport,
};

use crate::config::SessionSettings;
use crate::port_pool::{PortAllocator, PortLease};
use crate::relay::{Relay, RelayContext, RelayFailure};
use crate::streams::{FrameSender, StreamEvent, StreamHandle, StreamRouter};
use crate::tls::ClientIdentity;

const RELAY_FAILURE_CAPACITY: usize = 16;
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared resources handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub pool: Arc<dyn PortAllocator>,
    pub settings: SessionSettings,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent UNPAIR
    Unpaired,
    /// Tunnel closed or reset by the peer
    Disconnected,
    /// Corrupt stream, stalled digestion, or a failed write
    ProtocolError(String),
    /// The server is shutting down
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnecting,
    Closed,
}

enum Inbound {
    Frame(Frame),
    /// Framing was intact but the payload could not be decoded
    Malformed(String),
    /// The reader stopped; no frames follow
    Closed(SessionEnd),
}

/// Active relays of one session, keyed by public port
#[derive(Default)]
struct RelayTable {
    tcp: HashMap<u16, Relay>,
    udp: HashMap<u16, Relay>,
}

impl RelayTable {
    fn get_mut(&mut self, transport: Transport) -> &mut HashMap<u16, Relay> {
        match transport {
            Transport::Tcp => &mut self.tcp,
            Transport::Udp => &mut self.udp,
        }
    }

    fn port_for(&self, transport: Transport, target: &str) -> Option<u16> {
        let relays = match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        };
        relays
            .values()
            .find(|relay| relay.target() == target)
            .map(Relay::port)
    }

    fn drain(&mut self) -> Vec<Relay> {
        self.tcp
            .drain()
            .chain(self.udp.drain())
            .map(|(_, relay)| relay)
            .collect()
    }

    fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }
}

struct ClientSession {
    ctx: SessionContext,
    cancel: CancellationToken,
    state: SessionState,
    relays: RelayTable,
    router: Arc<StreamRouter>,
    outbound: FrameSender,
    failures: mpsc::Sender<RelayFailure>,
    next_relay_id: u64,
}

/// Serve one accepted, authenticated tunnel until it ends.
///
/// Cancelling `parent` tears the session down. On return every relay is
/// stopped and every port the session acquired is back in the pool.
pub async fn handle_client<S>(
    parent: &CancellationToken,
    stream: S,
    identity: ClientIdentity,
    ctx: SessionContext,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = info_span!("session", client = %identity);
    run_session(parent, stream, ctx).instrument(span).await
}

async fn run_session<S>(parent: &CancellationToken, stream: S, ctx: SessionContext) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = parent.child_token();
    let settings = ctx.settings.clone();

    let (reader, writer) = tokio::io::split(stream);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(settings.inbound_queue_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);
    let (failures_tx, mut failures_rx) = mpsc::channel(RELAY_FAILURE_CAPACITY);

    let reader_task = tokio::spawn(
        read_frames(
            FrameReader::new(reader),
            inbound_tx,
            settings.inbound_queue_timeout,
            cancel.clone(),
        )
        .in_current_span(),
    );
    let writer_task = tokio::spawn(
        write_frames(FrameWriter::new(writer), outbound_rx, cancel.clone()).in_current_span(),
    );

    let mut session = ClientSession {
        ctx,
        cancel: cancel.clone(),
        state: SessionState::Connected,
        relays: RelayTable::default(),
        router: Arc::new(StreamRouter::new()),
        outbound: FrameSender::new(outbound_tx),
        failures: failures_tx,
        next_relay_id: 0,
    };
    info!("Session connected");

    let digested = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break None,

            Some(failure) = failures_rx.recv() => session.relay_failed(failure).await,

            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Frame(frame)) => {
                    if let Some(end) = session.digest(frame).await {
                        break Some(end);
                    }
                }
                Some(Inbound::Malformed(reason)) => {
                    warn!("Skipping malformed frame: {}", reason);
                    session
                        .reply(Frame::Error {
                            reason: format!("malformed frame: {}", reason),
                        })
                        .await;
                }
                Some(Inbound::Closed(end)) => break Some(end),
                None => break None,
            },
        }
    };

    session.teardown().await;

    let read_end = reader_task.await.ok().flatten();
    let write_end = writer_task.await.ok().flatten();
    session.set_state(SessionState::Closed);

    let end = digested
        .or(write_end)
        .or(read_end)
        .unwrap_or(SessionEnd::Shutdown);

    match &end {
        SessionEnd::ProtocolError(reason) => warn!("Session closed: protocol error: {}", reason),
        other => info!("Session closed: {:?}", other),
    }
    end
}

impl ClientSession {
    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn relay_context(&self) -> RelayContext {
        RelayContext {
            outbound: self.outbound.clone(),
            router: self.router.clone(),
            failures: self.failures.clone(),
            bind_ip: self.ctx.settings.bind_ip,
            stream_queue_capacity: self.ctx.settings.stream_queue_capacity,
            stream_write_timeout: self.ctx.settings.stream_write_timeout,
            udp_idle_timeout: self.ctx.settings.udp_idle_timeout,
        }
    }

    async fn reply(&self, frame: Frame) {
        if !self.outbound.send(frame, &self.cancel).await {
            debug!("Dropping reply, session is closing");
        }
    }

    /// Handle one inbound frame; Some ends the session
    async fn digest(&mut self, frame: Frame) -> Option<SessionEnd> {
        if !frame.is_client_frame() {
            let frame_type = frame.frame_type();
            warn!("Unexpected {:?} frame from client", frame_type);
            self.reply(Frame::Error {
                reason: format!("unexpected {:?} frame", frame_type),
            })
            .await;
            return None;
        }

        match frame {
            Frame::Unpair => {
                info!("Client requested unpair");
                return Some(SessionEnd::Unpaired);
            }
            Frame::ExposeTcp { target } => self.expose(Transport::Tcp, target).await,
            Frame::ExposeUdp { target } => self.expose(Transport::Udp, target).await,
            Frame::HideTcp { port } => self.hide(Transport::Tcp, port).await,
            Frame::HideUdp { port } => self.hide(Transport::Udp, port).await,
            Frame::StreamData { stream_id, data } => match self.router.handle(stream_id) {
                Some(handle) if handle.is_aborted() => {
                    debug!("Dropping data for aborted stream {}", stream_id);
                }
                Some(handle) => {
                    self.forward(handle, stream_id, StreamEvent::Data { stream_id, data })
                }
                None => {
                    if self.router.refuse(stream_id) {
                        debug!("Data for unknown stream {}, closing it", stream_id);
                        self.reply(Frame::StreamClose { stream_id }).await;
                    }
                }
            },
            Frame::StreamClose { stream_id } => match self.router.handle(stream_id) {
                Some(handle) => {
                    self.forward(handle, stream_id, StreamEvent::Close { stream_id })
                }
                None => debug!("Close for unknown stream {}", stream_id),
            },
            Frame::Ping { timestamp } => self.reply(Frame::Pong { timestamp }).await,
            // Pong, and server frames already rejected above
            _ => {}
        }
        None
    }

    async fn expose(&mut self, transport: Transport, target: String) {
        if let Some(port) = self.relays.port_for(transport, &target) {
            debug!("{} target {} already exposed on port {}", transport, target, port);
            self.reply(Frame::ExposeFailed {
                transport,
                target,
                reason: ExposeFailure::AlreadyExposed { port },
            })
            .await;
            return;
        }

        let Some(lease) = PortLease::acquire(&self.ctx.pool) else {
            warn!("No relay port available for {} target {}", transport, target);
            self.reply(Frame::ExposeFailed {
                transport,
                target,
                reason: ExposeFailure::PoolExhausted,
            })
            .await;
            return;
        };

        self.next_relay_id += 1;
        let bound = match Relay::bind(
            self.next_relay_id,
            transport,
            target.clone(),
            lease,
            &self.cancel,
            self.relay_context(),
        )
        .await
        {
            Ok(bound) => bound,
            Err(e) => {
                warn!("{}", e);
                self.reply(Frame::ExposeFailed {
                    transport,
                    target,
                    reason: ExposeFailure::BindFailed {
                        reason: e.to_string(),
                    },
                })
                .await;
                return;
            }
        };

        let port = bound.port();
        self.reply(Frame::Exposed {
            transport,
            target: target.clone(),
            port,
        })
        .await;

        self.relays.get_mut(transport).insert(port, bound.start());
        info!(
            "Exposed {} target {} on port {} ({} relays active)",
            transport,
            target,
            port,
            self.relays.len()
        );
    }

    async fn hide(&mut self, transport: Transport, port: u16) {
        match self.relays.get_mut(transport).remove(&port) {
            Some(mut relay) => {
                relay.stop().await;
                info!("Hid {} port {} (target {})", transport, port, relay.target());
                self.reply(Frame::Hidden { transport, port }).await;
            }
            None => {
                debug!("No {} relay on port {} to hide", transport, port);
                self.reply(Frame::HideFailed {
                    transport,
                    port,
                    reason: format!("no {} relay on port {}", transport, port),
                })
                .await;
            }
        }
    }

    /// Hand tunnel traffic to the relay that owns the stream.
    ///
    /// Never waits on the relay. A TCP stream whose backlog is full is closed;
    /// its pump tells the client.
    fn forward(&self, handle: StreamHandle, stream_id: StreamId, event: StreamEvent) {
        let rejected = match handle.events.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                debug!("Stream {} is closing, dropping tunnel traffic", stream_id);
                return;
            }
            Err(TrySendError::Full(rejected)) => rejected,
        };

        match (handle.transport, rejected) {
            (Transport::Udp, _) => {
                debug!("UDP stream {} backlogged, dropping datagram", stream_id);
            }
            (Transport::Tcp, close @ StreamEvent::Close { .. }) => {
                // Let the backlog drain before the close lands
                let timeout = self.ctx.settings.stream_write_timeout;
                let cancel = self.cancel.clone();
                tokio::spawn(
                    async move {
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = handle.events.send_timeout(close, timeout) => sent,
                        };
                        if let Err(SendTimeoutError::Timeout(_)) = sent {
                            if let Some(abort) = handle.abort {
                                abort.cancel();
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
            (Transport::Tcp, StreamEvent::Data { .. }) => {
                warn!("Stream {} backlog full, closing it", stream_id);
                if let Some(abort) = handle.abort {
                    abort.cancel();
                }
            }
        }
    }

    async fn relay_failed(&mut self, failure: RelayFailure) {
        let relays = self.relays.get_mut(failure.transport);
        let current = relays
            .get(&failure.port)
            .is_some_and(|relay| relay.id() == failure.relay_id);
        if !current {
            debug!(
                "Ignoring failure of retired {} relay {}",
                failure.transport, failure.relay_id
            );
            return;
        }

        if let Some(mut relay) = relays.remove(&failure.port) {
            relay.stop().await;
        }
        warn!(
            "{} relay on port {} closed: {}",
            failure.transport, failure.port, failure.reason
        );
        self.reply(Frame::RelayClosed {
            transport: failure.transport,
            port: failure.port,
            reason: failure.reason,
        })
        .await;
    }

    /// Stop every relay and unblock every task. Safe to run more than once.
    async fn teardown(&mut self) {
        self.set_state(SessionState::Disconnecting);
        self.cancel.cancel();

        let relays = self.relays.drain();
        if !relays.is_empty() {
            info!("Stopping {} relays", relays.len());
        }
        for mut relay in relays {
            relay.stop().await;
        }
    }
}

/// Decode frames onto the inbound queue until the tunnel ends.
///
/// Returns None when the session was cancelled from elsewhere.
async fn read_frames<R>(
    mut reader: FrameReader<R>,
    inbound: mpsc::Sender<Inbound>,
    queue_timeout: Duration,
    cancel: CancellationToken,
) -> Option<SessionEnd>
where
    R: AsyncRead + Unpin,
{
    let end = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            read = reader.read_frame() => read,
        };

        let item = match read {
            Ok(frame) => {
                debug!("<- {:?}", frame.frame_type());
                Inbound::Frame(frame)
            }
            Err(e) if e.is_recoverable() => Inbound::Malformed(e.to_string()),
            Err(e) if e.is_closed() => {
                debug!("Tunnel closed by peer");
                break SessionEnd::Disconnected;
            }
            Err(e) => break SessionEnd::ProtocolError(e.to_string()),
        };

        if let Err(end) = enqueue(&inbound, item, queue_timeout, &cancel).await {
            return end;
        }
    };

    match enqueue(&inbound, Inbound::Closed(end.clone()), queue_timeout, &cancel).await {
        Ok(()) => None,
        Err(None) => None,
        Err(Some(_)) => Some(end),
    }
}

/// Queue an inbound item. A queue that stays full cancels the session.
async fn enqueue(
    inbound: &mpsc::Sender<Inbound>,
    item: Inbound,
    queue_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Option<SessionEnd>> {
    let sent = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(None),
        sent = inbound.send_timeout(item, queue_timeout) => sent,
    };

    match sent {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => {
            let reason = format!("inbound queue stalled for {:?}", queue_timeout);
            cancel.cancel();
            Err(Some(SessionEnd::ProtocolError(reason)))
        }
        Err(SendTimeoutError::Closed(_)) => Err(None),
    }
}

/// Drain the outbound queue onto the socket.
///
/// Frames still queued at cancellation are discarded. Returns the session end
/// when a write failure is what stopped it.
async fn write_frames<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) -> Option<SessionEnd>
where
    W: AsyncWrite + Unpin,
{
    let mut end = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            written = writer.write_frame(&frame) => written,
        };

        if let Err(e) = written {
            end = Some(classify_write_error(e));
            cancel.cancel();
            break;
        }
    }

    outbound.close();
    let mut discarded = 0usize;
    while outbound.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("Discarded {} queued frames", discarded);
    }

    if end.is_none() {
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
            Ok(Err(e)) if !e.is_closed() => debug!("Tunnel shutdown failed: {}", e),
            Err(_) => debug!("Tunnel shutdown timed out"),
            _ => {}
        }
    }
    end
}

fn classify_write_error(e: CodecError) -> SessionEnd {
    if e.is_closed() {
        SessionEnd::Disconnected
    } else {
        SessionEnd::ProtocolError(format!("write failed: {}", e))
    }
}
