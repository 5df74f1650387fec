//! Peer-to-peer transport
//!
//! One TCP connection carries both structured command messages and raw
//! stream bodies. Every logical message starts with a one-byte type:
//!
//! ```text
//! [0x01] [4 bytes: length, big-endian] [bincode message record]
//! [0x02] [8 bytes: length, big-endian] [raw bytes...]
//! ```
//!
//! The codec frames the command body only. A stream header hands control
//! back to the consumer, which reads the raw body through
//! [`Peer::read_stream`].

pub mod codec;
pub mod peer;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer rejected: {0}")]
    Rejected(String),

    #[error("transport is not listening")]
    NotListening,

    #[error("delivery queue already taken")]
    QueueTaken,

    #[error("delivery queue closed")]
    QueueClosed,

    #[error("no stream body pending")]
    NoStreamPending,

    #[error("body of stream {0} was already consumed or discarded")]
    StreamExpired(u64),
}

impl NetworkError {
    /// Whether this error is an ordinary peer hang-up
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetworkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Wire message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Structured message record follows
    Command = 0x01,
    /// Raw stream body follows, read by the consumer
    Stream = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::Command),
            0x02 => Ok(MessageKind::Stream),
            other => Err(NetworkError::UnknownMessageType(other)),
        }
    }
}

/// Connection direction, fixed when the peer is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// A message exchanged between nodes
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Sender address, stamped by the receiving transport
    pub from: String,
    /// Opaque payload; empty for stream headers
    pub payload: Vec<u8>,
    /// Whether a raw stream body follows on the connection
    pub is_stream: bool,
    /// Sequence number of a received stream header on its connection,
    /// stamped by the receiving transport. Zero for anything else.
    #[serde(skip)]
    pub stream_id: u64,
    /// Peer the message arrived on
    #[serde(skip)]
    pub source_peer: Option<Weak<dyn Peer>>,
}

impl Message {
    /// Command message carrying `payload`
    pub fn command(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Stream header
    pub fn stream() -> Self {
        Self {
            is_stream: true,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> MessageKind {
        if self.is_stream {
            MessageKind::Stream
        } else {
            MessageKind::Command
        }
    }

    /// The delivering peer, if its connection is still alive
    pub fn source(&self) -> Option<Arc<dyn Peer>> {
        self.source_peer.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("from", &self.from)
            .field("payload_len", &self.payload.len())
            .field("is_stream", &self.is_stream)
            .field("stream_id", &self.stream_id)
            .field("has_source", &self.source_peer.is_some())
            .finish()
    }
}

/// Writes messages onto a connection
pub trait Encoder: Send + Sync {
    fn encode(&self, writer: &mut dyn Write, msg: &Message) -> NetworkResult<()>;
}

/// Reads messages off a connection
pub trait Decoder: Send + Sync {
    /// Decode one message. For stream headers nothing beyond the type byte
    /// is consumed.
    fn decode(&self, reader: &mut dyn Read) -> NetworkResult<Message>;
}

/// A remote node reachable over one live connection.
///
/// Sends are written straight to the socket; concurrent senders on the same
/// peer must serialize among themselves.
pub trait Peer: Send + Sync {
    /// Encode and write `msg`.
    fn send(&self, msg: &Message) -> NetworkResult<()>;

    /// Write a stream header followed by exactly `len` bytes from `body`.
    fn send_stream(&self, body: &mut dyn Read, len: u64) -> NetworkResult<u64>;

    /// Open the body following the received stream `header`. The decode
    /// loop of this connection resumes once the returned reader is dropped.
    /// Fails with [`NetworkError::StreamExpired`] if the body was already
    /// read or discarded after the stream timeout.
    fn read_stream(&self, header: &Message) -> NetworkResult<Box<dyn Read + '_>>;

    fn remote_addr(&self) -> String;

    fn direction(&self) -> Direction;

    /// Shut the connection down in both directions.
    fn close(&self) -> NetworkResult<()>;
}

/// Callback run on every new peer before any message is read
pub type HandshakeFn = Arc<dyn Fn(&dyn Peer) -> NetworkResult<()> + Send + Sync>;

/// Callback admitting a peer after a successful handshake
pub type OnPeerFn = Arc<dyn Fn(Arc<dyn Peer>) -> NetworkResult<()> + Send + Sync>;

/// Handshake that accepts every peer
pub fn nop_handshake(_peer: &dyn Peer) -> NetworkResult<()> {
    Ok(())
}

/// Connection manager owned by the server
pub trait Transport: Send + Sync {
    /// Configured listen address
    fn addr(&self) -> String;

    /// Open an outbound connection and start reading from it.
    fn dial(&self, addr: &str) -> NetworkResult<()>;

    /// Bind the listener and start accepting in the background.
    fn listen_and_accept(&self) -> NetworkResult<()>;

    /// Take the receiving end of the delivery queue. There is one consumer,
    /// so only the first call succeeds.
    fn consume(&self) -> NetworkResult<std::sync::mpsc::Receiver<Message>>;

    /// Stop accepting. Established connections end on their own.
    fn close(&self) -> NetworkResult<()>;
}

pub use codec::BinaryCodec;
pub use peer::TcpPeer;
pub use transport::{TcpTransport, TcpTransportConfig, DEFAULT_QUEUE_CAPACITY};
