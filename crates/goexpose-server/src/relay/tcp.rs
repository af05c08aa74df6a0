//! TCP relay: accept public connections and pump them through the tunnel

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use goexpose_proto::{Frame, StreamId, Transport};

use super::{RelayContext, IO_ERROR_BACKOFF, MAX_CONSECUTIVE_IO_ERRORS};
use crate::port_pool::PortLease;
use crate::streams::StreamEvent;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Public peer hung up or failed; the client must be told
    Local,
    /// Client closed the stream
    Remote,
    /// Public peer stopped taking data; closed without the client asking
    Aborted,
    /// Relay or session is shutting down
    Teardown,
}

pub(super) async fn run(
    listener: TcpListener,
    lease: PortLease,
    relay_id: u64,
    ctx: RelayContext,
    cancel: CancellationToken,
) {
    let port = lease.port();
    let mut connections = JoinSet::new();
    let mut consecutive_errors = 0u32;

    let failure = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break None,

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("TCP stream task on port {} panicked: {}", port, e);
                    }
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    consecutive_errors = 0;

                    let abort = cancel.child_token();
                    let (events_tx, events_rx) = mpsc::channel(ctx.stream_queue_capacity);
                    let stream_id = match ctx.router.open(
                        Transport::Tcp,
                        events_tx,
                        Some(abort.clone()),
                    ) {
                        Ok(id) => id,
                        Err(e) => {
                            warn!("Rejecting connection from {} on port {}: {}", peer_addr, port, e);
                            continue;
                        }
                    };

                    debug!("Accepted {} on port {} as stream {}", peer_addr, port, stream_id);

                    let open = Frame::StreamOpen {
                        stream_id,
                        transport: Transport::Tcp,
                        port,
                        peer_addr: peer_addr.to_string(),
                    };
                    if !ctx.outbound.send(open, &cancel).await {
                        ctx.router.close(stream_id);
                        break None;
                    }

                    connections.spawn(pump(
                        socket,
                        stream_id,
                        events_rx,
                        ctx.clone(),
                        cancel.clone(),
                        abort,
                    ));
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_IO_ERRORS {
                        break Some(format!("accept failed: {}", e));
                    }
                    warn!("Failed to accept on port {}: {}", port, e);
                    tokio::time::sleep(IO_ERROR_BACKOFF).await;
                }
            }
        }
    };

    drop(listener);
    cancel.cancel();
    while connections.join_next().await.is_some() {}

    if let Some(reason) = failure {
        error!("TCP relay on port {} failed: {}", port, reason);
        ctx.report_failure(relay_id, Transport::Tcp, port, reason);
    }

    drop(lease);
}

/// Copy bytes between one public connection and its tunnel stream
async fn pump(
    socket: TcpStream,
    stream_id: StreamId,
    mut events: mpsc::Receiver<StreamEvent>,
    ctx: RelayContext,
    relay_cancel: CancellationToken,
    abort: CancellationToken,
) {
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let stopped = || {
        if relay_cancel.is_cancelled() {
            CloseReason::Teardown
        } else {
            CloseReason::Aborted
        }
    };

    let reason = loop {
        tokio::select! {
            biased;

            _ = abort.cancelled() => break stopped(),

            event = events.recv() => match event {
                Some(StreamEvent::Data { data, .. }) => {
                    let written = tokio::select! {
                        _ = abort.cancelled() => break stopped(),
                        written = tokio::time::timeout(
                            ctx.stream_write_timeout,
                            writer.write_all(&data),
                        ) => written,
                    };
                    match written {
                        Ok(Ok(())) => bytes_out += data.len() as u64,
                        Ok(Err(e)) => {
                            debug!("Stream {}: public write failed: {}", stream_id, e);
                            break CloseReason::Local;
                        }
                        Err(_) => {
                            warn!(
                                "Stream {} refused data for {:?}, closing it",
                                stream_id, ctx.stream_write_timeout
                            );
                            break CloseReason::Aborted;
                        }
                    }
                }
                Some(StreamEvent::Close { .. }) => break CloseReason::Remote,
                None => break CloseReason::Local,
            },

            read = reader.read(&mut buf) => match read {
                Ok(0) => break CloseReason::Local,
                Ok(n) => {
                    bytes_in += n as u64;
                    let frame = Frame::StreamData {
                        stream_id,
                        data: buf[..n].to_vec(),
                    };
                    if !ctx.outbound.send(frame, &abort).await {
                        break stopped();
                    }
                }
                Err(e) => {
                    debug!("Stream {}: public read failed: {}", stream_id, e);
                    break CloseReason::Local;
                }
            }
        }
    };

    // The client still holds a locally closed or aborted stream open
    let announce = matches!(reason, CloseReason::Local | CloseReason::Aborted);
    if announce {
        ctx.router.retire(stream_id);
        ctx.outbound
            .send(Frame::StreamClose { stream_id }, &relay_cancel)
            .await;
    } else {
        ctx.router.close(stream_id);
        if reason == CloseReason::Remote {
            let _ = writer.shutdown().await;
        }
    }

    debug!(
        "Stream {} closed ({:?}): {} bytes in, {} bytes out",
        stream_id, reason, bytes_in, bytes_out
    );
}
