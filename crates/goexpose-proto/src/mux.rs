//! Stream identifiers for multiplexing relayed traffic over one tunnel

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Multiplexer errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("No available stream IDs")]
    NoAvailableStreamIds,
}

struct AllocatorState {
    next: StreamId,
    in_use: HashSet<StreamId>,
}

/// Hands out stream identifiers that are unique among the streams still open.
///
/// Identifiers increase monotonically and wrap around, skipping the reserved
/// control id and any id that has not been released yet.
pub struct StreamIdAllocator {
    state: Mutex<AllocatorState>,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start allocating from `first`; the control id is still skipped
    pub fn starting_at(first: StreamId) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: first,
                in_use: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a new stream ID
    pub fn allocate(&self) -> Result<StreamId, MuxError> {
        let mut state = self.lock();

        let start_id = state.next;
        loop {
            let id = state.next;
            state.next = id.wrapping_add(1);

            if id != crate::CONTROL_STREAM_ID && state.in_use.insert(id) {
                return Ok(id);
            }

            // Prevent infinite loop
            if state.next == start_id {
                return Err(MuxError::NoAvailableStreamIds);
            }
        }
    }

    /// Return an identifier so it can be handed out again
    pub fn release(&self, stream_id: StreamId) -> Result<(), MuxError> {
        if self.lock().in_use.remove(&stream_id) {
            Ok(())
        } else {
            Err(MuxError::StreamNotFound(stream_id))
        }
    }

    pub fn is_in_use(&self, stream_id: StreamId) -> bool {
        self.lock().in_use.contains(&stream_id)
    }

    /// Number of identifiers currently handed out
    pub fn active_streams(&self) -> usize {
        self.lock().in_use.len()
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
