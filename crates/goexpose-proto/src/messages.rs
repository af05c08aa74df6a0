//! Protocol frame types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::mux::StreamId;

/// Transport of an exposed service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message on the tunnel.
///
/// Control requests flow from the client, responses and relayed traffic flow
/// from the server. `StreamData`, `StreamClose` and `Ping` travel both ways.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    // Client requests
    /// Ends the session; the server tears down every relay and closes the tunnel
    Unpair,
    ExposeTcp {
        /// Client-side service the exposed port forwards to, echoed back verbatim
        target: String,
    },
    HideTcp {
        port: u16,
    },
    ExposeUdp {
        target: String,
    },
    HideUdp {
        port: u16,
    },

    // Server responses
    Exposed {
        transport: Transport,
        target: String,
        port: u16,
    },
    ExposeFailed {
        transport: Transport,
        target: String,
        reason: ExposeFailure,
    },
    Hidden {
        transport: Transport,
        port: u16,
    },
    HideFailed {
        transport: Transport,
        port: u16,
        reason: String,
    },
    /// A relay stopped on its own (listener or socket failure)
    RelayClosed {
        transport: Transport,
        port: u16,
        reason: String,
    },
    /// A public connection (TCP) or flow (UDP) arrived on an exposed port
    StreamOpen {
        stream_id: StreamId,
        transport: Transport,
        port: u16,
        peer_addr: String,
    },
    Error {
        reason: String,
    },

    // Relayed traffic
    StreamData {
        stream_id: StreamId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    StreamClose {
        stream_id: StreamId,
    },

    // Keepalive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

/// Why an expose request could not be honoured
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExposeFailure {
    /// Every relay port is checked out
    PoolExhausted,
    /// The allocated port could not be bound
    BindFailed { reason: String },
    /// The same target is already exposed by this session
    AlreadyExposed { port: u16 },
}

impl fmt::Display for ExposeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposeFailure::PoolExhausted => f.write_str("no relay port available"),
            ExposeFailure::BindFailed { reason } => write!(f, "failed to bind relay port: {}", reason),
            ExposeFailure::AlreadyExposed { port } => {
                write!(f, "target already exposed on port {}", port)
            }
        }
    }
}

/// Type tag of a frame, used for logging and dispatch tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Unpair,
    ExposeTcp,
    HideTcp,
    ExposeUdp,
    HideUdp,
    Exposed,
    ExposeFailed,
    Hidden,
    HideFailed,
    RelayClosed,
    StreamOpen,
    Error,
    StreamData,
    StreamClose,
    Ping,
    Pong,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Unpair => FrameType::Unpair,
            Frame::ExposeTcp { .. } => FrameType::ExposeTcp,
            Frame::HideTcp { .. } => FrameType::HideTcp,
            Frame::ExposeUdp { .. } => FrameType::ExposeUdp,
            Frame::HideUdp { .. } => FrameType::HideUdp,
            Frame::Exposed { .. } => FrameType::Exposed,
            Frame::ExposeFailed { .. } => FrameType::ExposeFailed,
            Frame::Hidden { .. } => FrameType::Hidden,
            Frame::HideFailed { .. } => FrameType::HideFailed,
            Frame::RelayClosed { .. } => FrameType::RelayClosed,
            Frame::StreamOpen { .. } => FrameType::StreamOpen,
            Frame::Error { .. } => FrameType::Error,
            Frame::StreamData { .. } => FrameType::StreamData,
            Frame::StreamClose { .. } => FrameType::StreamClose,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Whether a client is allowed to send this frame to the server
    pub fn is_client_frame(&self) -> bool {
        matches!(
            self,
            Frame::Unpair
                | Frame::ExposeTcp { .. }
                | Frame::HideTcp { .. }
                | Frame::ExposeUdp { .. }
                | Frame::HideUdp { .. }
                | Frame::StreamData { .. }
                | Frame::StreamClose { .. }
                | Frame::Ping { .. }
                | Frame::Pong { .. }
        )
    }
}

// Relayed payloads go through serialize_bytes instead of a u8 sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_frame_serialization() {
        let frame = Frame::ExposeTcp {
            target: "127.0.0.1:8080".to_string(),
        };
        let serialized = bincode::serialize(&frame).unwrap();
        let deserialized: Frame = bincode::deserialize(&serialized).unwrap();
        assert_eq!(frame, deserialized);
        assert_eq!(deserialized.frame_type(), FrameType::ExposeTcp);
    }

    #[test]
    fn test_stream_data_frame() {
        let data = vec![1, 2, 3, 4, 5];
        let frame = Frame::StreamData {
            stream_id: 42,
            data: data.clone(),
        };

        let serialized = bincode::serialize(&frame).unwrap();
        let deserialized: Frame = bincode::deserialize(&serialized).unwrap();

        if let Frame::StreamData {
            stream_id,
            data: recv_data,
        } = deserialized
        {
            assert_eq!(stream_id, 42);
            assert_eq!(recv_data, data);
        } else {
            panic!("Expected StreamData frame");
        }
    }

    #[test]
    fn test_expose_failure_reasons() {
        let frame = Frame::ExposeFailed {
            transport: Transport::Udp,
            target: "dns".to_string(),
            reason: ExposeFailure::BindFailed {
                reason: "Address in use".to_string(),
            },
        };
        let serialized = bincode::serialize(&frame).unwrap();
        let deserialized: Frame = bincode::deserialize(&serialized).unwrap();
        assert_eq!(frame, deserialized);

        assert_eq!(
            ExposeFailure::PoolExhausted.to_string(),
            "no relay port available"
        );
        assert_eq!(
            ExposeFailure::AlreadyExposed { port: 47923 }.to_string(),
            "target already exposed on port 47923"
        );
    }

    #[test]
    fn test_client_frame_classification() {
        assert!(Frame::Unpair.is_client_frame());
        assert!(Frame::HideUdp { port: 1 }.is_client_frame());
        assert!(Frame::StreamClose { stream_id: 1 }.is_client_frame());
        assert!(!Frame::Exposed {
            transport: Transport::Tcp,
            target: "x".to_string(),
            port: 1,
        }
        .is_client_frame());
        assert!(!Frame::Error {
            reason: "nope".to_string()
        }
        .is_client_frame());
    }
}
