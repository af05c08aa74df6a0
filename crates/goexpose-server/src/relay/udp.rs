//! UDP relay: one socket per exposed port, one stream per remote address
//!
//! A flow lives as long as datagrams keep moving in either direction. Flows
//! idle for longer than the configured window are closed on both sides.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use goexpose_proto::{Frame, StreamId, Transport};

use super::{RelayContext, IO_ERROR_BACKOFF, MAX_CONSECUTIVE_IO_ERRORS};
use crate::port_pool::PortLease;
use crate::streams::StreamEvent;

/// Largest payload a UDP datagram can carry
const MAX_DATAGRAM_SIZE: usize = 65_535;
const UDP_EVENT_CAPACITY: usize = 256;
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(50);

struct Flow {
    stream_id: StreamId,
    last_seen: Instant,
}

/// Remote address <-> stream id, both directions
#[derive(Default)]
struct FlowTable {
    by_addr: HashMap<SocketAddr, Flow>,
    by_stream: HashMap<StreamId, SocketAddr>,
}

impl FlowTable {
    fn insert(&mut self, addr: SocketAddr, stream_id: StreamId, now: Instant) {
        self.by_addr.insert(
            addr,
            Flow {
                stream_id,
                last_seen: now,
            },
        );
        self.by_stream.insert(stream_id, addr);
    }

    /// Stream of a remote address, refreshing the flow
    fn touch_addr(&mut self, addr: &SocketAddr, now: Instant) -> Option<StreamId> {
        self.by_addr.get_mut(addr).map(|flow| {
            flow.last_seen = now;
            flow.stream_id
        })
    }

    /// Remote address of a stream, refreshing the flow
    fn touch_stream(&mut self, stream_id: StreamId, now: Instant) -> Option<SocketAddr> {
        let addr = *self.by_stream.get(&stream_id)?;
        if let Some(flow) = self.by_addr.get_mut(&addr) {
            flow.last_seen = now;
        }
        Some(addr)
    }

    fn remove_stream(&mut self, stream_id: StreamId) -> Option<SocketAddr> {
        let addr = self.by_stream.remove(&stream_id)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }

    /// Remove and return every flow idle for at least `idle`
    fn expire(&mut self, idle: Duration, now: Instant) -> Vec<StreamId> {
        let expired: Vec<StreamId> = self
            .by_addr
            .values()
            .filter(|flow| now.saturating_duration_since(flow.last_seen) >= idle)
            .map(|flow| flow.stream_id)
            .collect();

        for stream_id in &expired {
            self.remove_stream(*stream_id);
        }
        expired
    }

    fn drain(&mut self) -> Vec<StreamId> {
        self.by_addr.clear();
        self.by_stream.drain().map(|(id, _)| id).collect()
    }

    fn len(&self) -> usize {
        self.by_addr.len()
    }
}

fn reap_interval(idle: Duration) -> Duration {
    (idle / 2).max(MIN_REAP_INTERVAL)
}

/// ICMP errors surface on the next recv and say nothing about the socket itself
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

pub(super) async fn run(
    socket: UdpSocket,
    lease: PortLease,
    relay_id: u64,
    ctx: RelayContext,
    cancel: CancellationToken,
) {
    let port = lease.port();
    let idle = ctx.udp_idle_timeout;
    let (events_tx, mut events) = mpsc::channel(UDP_EVENT_CAPACITY);
    let mut flows = FlowTable::default();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut consecutive_errors = 0u32;

    let mut reap = tokio::time::interval(reap_interval(idle));
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break None,

            Some(event) = events.recv() => match event {
                StreamEvent::Data { stream_id, data } => {
                    match flows.touch_stream(stream_id, Instant::now()) {
                        Some(addr) => {
                            if let Err(e) = socket.send_to(&data, addr).await {
                                debug!("UDP port {}: send to {} failed: {}", port, addr, e);
                            }
                        }
                        None => debug!("UDP port {}: dropping datagram for closed stream {}", port, stream_id),
                    }
                }
                StreamEvent::Close { stream_id } => {
                    if let Some(addr) = flows.remove_stream(stream_id) {
                        debug!("UDP flow {} (stream {}) closed by client", addr, stream_id);
                        ctx.router.close(stream_id);
                    }
                }
            },

            received = socket.recv_from(&mut buf) => match received {
                Ok((n, src)) => {
                    consecutive_errors = 0;
                    let now = Instant::now();

                    let stream_id = match flows.touch_addr(&src, now) {
                        Some(id) => id,
                        None => {
                            let stream_id = match ctx.router.open(Transport::Udp, events_tx.clone(), None) {
                                Ok(id) => id,
                                Err(e) => {
                                    warn!("Dropping datagram from {} on port {}: {}", src, port, e);
                                    continue;
                                }
                            };
                            flows.insert(src, stream_id, now);
                            debug!("New UDP flow {} on port {} as stream {} ({} active)", src, port, stream_id, flows.len());

                            let open = Frame::StreamOpen {
                                stream_id,
                                transport: Transport::Udp,
                                port,
                                peer_addr: src.to_string(),
                            };
                            if !ctx.outbound.send(open, &cancel).await {
                                break None;
                            }
                            stream_id
                        }
                    };

                    let frame = Frame::StreamData {
                        stream_id,
                        data: buf[..n].to_vec(),
                    };
                    if !ctx.outbound.send(frame, &cancel).await {
                        break None;
                    }
                }
                Err(e) if is_transient(&e) => {
                    debug!("UDP port {}: ignoring {}", port, e);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_IO_ERRORS {
                        break Some(format!("receive failed: {}", e));
                    }
                    warn!("UDP port {}: receive failed: {}", port, e);
                    tokio::time::sleep(IO_ERROR_BACKOFF).await;
                }
            },

            _ = reap.tick() => {
                for stream_id in flows.expire(idle, Instant::now()) {
                    debug!("UDP stream {} on port {} idle, closing", stream_id, port);
                    ctx.router.retire(stream_id);
                    if !ctx.outbound.send(Frame::StreamClose { stream_id }, &cancel).await {
                        break;
                    }
                }
            }
        }
    };

    for stream_id in flows.drain() {
        ctx.router.close(stream_id);
    }
    drop(socket);

    if let Some(reason) = failure {
        error!("UDP relay on port {} failed: {}", port, reason);
        ctx.report_failure(relay_id, Transport::Udp, port, reason);
    }

    drop(lease);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 7], port))
    }

    #[test]
    fn test_flow_lookup_both_ways() {
        let mut flows = FlowTable::default();
        let now = Instant::now();

        flows.insert(addr(5000), 1, now);
        flows.insert(addr(5001), 2, now);

        assert_eq!(flows.touch_addr(&addr(5000), now), Some(1));
        assert_eq!(flows.touch_stream(2, now), Some(addr(5001)));
        assert_eq!(flows.touch_stream(3, now), None);

        assert_eq!(flows.remove_stream(1), Some(addr(5000)));
        assert_eq!(flows.touch_addr(&addr(5000), now), None);
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn test_expire_spares_active_flows() {
        let mut flows = FlowTable::default();
        let start = Instant::now();
        let idle = Duration::from_secs(30);

        flows.insert(addr(5000), 1, start);
        flows.insert(addr(5001), 2, start);

        // Traffic towards the remote also counts as activity
        let later = start + Duration::from_secs(20);
        flows.touch_stream(2, later);

        let expired = flows.expire(idle, start + Duration::from_secs(31));
        assert_eq!(expired, vec![1]);
        assert_eq!(flows.len(), 1);

        let expired = flows.expire(idle, later + idle);
        assert_eq!(expired, vec![2]);
        assert_eq!(flows.len(), 0);
    }

    #[test]
    fn test_drain_returns_all_streams() {
        let mut flows = FlowTable::default();
        let now = Instant::now();
        flows.insert(addr(1), 7, now);
        flows.insert(addr(2), 9, now);

        let mut drained = flows.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![7, 9]);
        assert_eq!(flows.len(), 0);
    }

    #[test]
    fn test_reap_interval_floor() {
        assert_eq!(reap_interval(Duration::from_secs(30)), Duration::from_secs(15));
        assert_eq!(reap_interval(Duration::from_millis(20)), MIN_REAP_INTERVAL);
    }
}
