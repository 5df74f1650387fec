//! Peer-to-peer content-addressable file store node
//!
//! A node keeps a local object store keyed by content hash and exchanges
//! messages and raw byte streams with other nodes over TCP. Command
//! messages and stream bodies share one connection, told apart by a
//! leading type byte.

pub mod config;
pub mod network;
pub mod server;
pub mod storage;

pub use config::Config;
pub use network::{Message, NetworkError, Peer, TcpTransport, TcpTransportConfig, Transport};
pub use server::{Server, ServerError, ServerOpts};
pub use storage::{ObjectStore, Store, StoreError};
