//! Per-session stream bookkeeping
//!
//! Every relayed TCP connection and UDP flow of a session gets a stream id from
//! one allocator, so the client can demultiplex on the id alone. The router
//! maps each live id to the relay task that owns it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use goexpose_proto::{Frame, MuxError, StreamId, StreamIdAllocator, Transport};

/// Closed stream ids remembered so late tunnel data draws one `StreamClose` at most
const RETIRED_MEMORY: usize = 256;

/// Tunnel-side traffic for a relayed stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data { stream_id: StreamId, data: Vec<u8> },
    Close { stream_id: StreamId },
}

/// Handle onto the session's outbound queue.
///
/// All frames bound for the client funnel through here, so a single writer task
/// owns the socket and frames from one producer stay in order.
#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a frame, waiting for capacity. Returns false once the session is
    /// going away.
    pub(crate) async fn send(&self, frame: Frame, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.tx.send(frame) => sent.is_ok(),
        }
    }
}

struct Route {
    transport: Transport,
    events: mpsc::Sender<StreamEvent>,
    abort: Option<CancellationToken>,
}

/// Delivery handle for one live stream
#[derive(Clone)]
pub(crate) struct StreamHandle {
    pub transport: Transport,
    pub events: mpsc::Sender<StreamEvent>,
    /// Closes a TCP stream from outside its pump; UDP flows have none
    pub abort: Option<CancellationToken>,
}

impl StreamHandle {
    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Ids whose close the client has already been told about, oldest evicted first
#[derive(Default)]
struct Retired {
    order: VecDeque<StreamId>,
    ids: HashSet<StreamId>,
}

impl Retired {
    fn insert(&mut self, stream_id: StreamId) -> bool {
        if !self.ids.insert(stream_id) {
            return false;
        }
        self.order.push_back(stream_id);
        if self.order.len() > RETIRED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn forget(&mut self, stream_id: StreamId) {
        if self.ids.remove(&stream_id) {
            self.order.retain(|id| *id != stream_id);
        }
    }
}

#[derive(Default)]
struct Routes {
    live: HashMap<StreamId, Route>,
    retired: Retired,
}

/// Maps live stream ids to the relay that owns them
pub struct StreamRouter {
    ids: StreamIdAllocator,
    routes: Mutex<Routes>,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self {
            ids: StreamIdAllocator::new(),
            routes: Mutex::new(Routes::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new stream and return its id.
    ///
    /// Only the owner of the stream may `close` it again.
    pub(crate) fn open(
        &self,
        transport: Transport,
        events: mpsc::Sender<StreamEvent>,
        abort: Option<CancellationToken>,
    ) -> Result<StreamId, MuxError> {
        let stream_id = self.ids.allocate()?;
        let mut routes = self.lock();
        routes.retired.forget(stream_id);
        routes.live.insert(
            stream_id,
            Route {
                transport,
                events,
                abort,
            },
        );
        Ok(stream_id)
    }

    /// Where tunnel traffic for `stream_id` should go
    pub(crate) fn handle(&self, stream_id: StreamId) -> Option<StreamHandle> {
        self.lock().live.get(&stream_id).map(|route| StreamHandle {
            transport: route.transport,
            events: route.events.clone(),
            abort: route.abort.clone(),
        })
    }

    /// Forget a stream and free its id. Returns false if it was already closed.
    pub fn close(&self, stream_id: StreamId) -> bool {
        let removed = self.lock().live.remove(&stream_id).is_some();
        if removed {
            let _ = self.ids.release(stream_id);
        }
        removed
    }

    /// Close a stream whose owner is about to send the client `StreamClose`
    pub fn retire(&self, stream_id: StreamId) -> bool {
        let removed = {
            let mut routes = self.lock();
            let removed = routes.live.remove(&stream_id).is_some();
            if removed {
                routes.retired.insert(stream_id);
            }
            removed
        };
        if removed {
            let _ = self.ids.release(stream_id);
        }
        removed
    }

    /// Whether tunnel data for an unknown stream should be answered with
    /// `StreamClose`. True once per id until the id is opened again.
    pub fn refuse(&self, stream_id: StreamId) -> bool {
        let mut routes = self.lock();
        !routes.live.contains_key(&stream_id) && routes.retired.insert(stream_id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_route_close() {
        let router = StreamRouter::new();
        let (tx, mut rx) = mpsc::channel(4);

        let abort = CancellationToken::new();
        let stream_id = router
            .open(Transport::Tcp, tx, Some(abort.clone()))
            .unwrap();
        assert_eq!(router.len(), 1);

        let handle = router.handle(stream_id).unwrap();
        assert_eq!(handle.transport, Transport::Tcp);
        handle
            .events
            .send(StreamEvent::Data {
                stream_id,
                data: b"hi".to_vec(),
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            StreamEvent::Data { data, .. } => assert_eq!(data, b"hi"),
            other => panic!("unexpected event {:?}", other),
        }

        handle.abort.unwrap().cancel();
        assert!(abort.is_cancelled());

        assert!(router.close(stream_id));
        assert!(!router.close(stream_id));
        assert!(router.handle(stream_id).is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_ids_unique_across_relays() {
        let router = StreamRouter::new();
        let (tcp_tx, _tcp_rx) = mpsc::channel(1);
        let (udp_tx, _udp_rx) = mpsc::channel(1);

        let a = router.open(Transport::Tcp, tcp_tx.clone(), None).unwrap();
        let b = router.open(Transport::Udp, udp_tx, None).unwrap();
        let c = router.open(Transport::Tcp, tcp_tx, None).unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_eq!(router.handle(b).unwrap().transport, Transport::Udp);
        assert_eq!(router.len(), 3);
    }

    #[test]
    fn test_retired_stream_is_refused_once() {
        let router = StreamRouter::new();
        let (tx, _rx) = mpsc::channel(1);

        let announced = router.open(Transport::Tcp, tx.clone(), None).unwrap();
        assert!(!router.refuse(announced));
        assert!(router.retire(announced));
        assert!(!router.retire(announced));
        assert!(!router.refuse(announced));

        // Client-initiated closes were never announced
        let quiet = router.open(Transport::Tcp, tx, None).unwrap();
        assert!(router.close(quiet));
        assert!(router.refuse(quiet));
        assert!(!router.refuse(quiet));

        assert!(router.refuse(999));
        assert!(!router.refuse(999));
    }

    #[test]
    fn test_retired_memory_is_bounded() {
        let mut retired = Retired::default();
        for id in 1..=RETIRED_MEMORY as StreamId + 1 {
            assert!(retired.insert(id));
        }
        assert!(!retired.ids.contains(&1));
        assert!(retired.ids.contains(&2));
        assert_eq!(retired.order.len(), RETIRED_MEMORY);

        retired.forget(2);
        assert!(retired.insert(2));
    }

    #[tokio::test]
    async fn test_frame_sender_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = FrameSender::new(tx);
        let cancel = CancellationToken::new();

        assert!(sender.send(Frame::Ping { timestamp: 1 }, &cancel).await);

        // Queue is full now; cancellation must unblock the waiting send
        let waiter = {
            let sender = sender.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sender.send(Frame::Ping { timestamp: 2 }, &cancel).await })
        };
        cancel.cancel();
        assert!(!waiter.await.unwrap());
    }
}
