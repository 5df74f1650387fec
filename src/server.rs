//! Node server
//!
//! Owns the transport and the object store, drains the delivery queue and
//! dispatches each message to a handler. A failing message is answered
//! with an error message to the peer it came from.

use crate::network::{Message, NetworkError, Transport};
use crate::storage::{Store, StoreError};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How often the drain loop checks the shutdown flag
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server options: {0} is missing")]
    MissingDependency(&'static str),

    #[error("empty payload received")]
    EmptyPayload,

    #[error("source peer is gone")]
    PeerGone,

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-message business logic
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: &Message, store: &dyn Store) -> Result<(), ServerError>;
}

/// Rejects empty commands and drains stream bodies
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl MessageHandler for DefaultHandler {
    fn handle(&self, msg: &Message, _store: &dyn Store) -> Result<(), ServerError> {
        if msg.is_stream {
            let peer = msg.source().ok_or(ServerError::PeerGone)?;
            let mut body = peer.read_stream(msg)?;
            let received =
                io::copy(&mut body, &mut io::sink()).map_err(NetworkError::from)?;
            log::info!("Received {} byte stream from {}", received, msg.from);
            return Ok(());
        }

        if msg.payload.is_empty() {
            return Err(ServerError::EmptyPayload);
        }

        log::debug!("Command from {} ({} bytes)", msg.from, msg.payload.len());
        Ok(())
    }
}

/// Server construction options
pub struct ServerOpts {
    pub listen_addr: String,
    pub transport: Option<Arc<dyn Transport>>,
    pub store: Option<Arc<dyn Store>>,
    /// Defaults to [`DefaultHandler`]
    pub handler: Option<Arc<dyn MessageHandler>>,
    /// Nodes dialed once the listener is up
    pub bootstrap_nodes: Vec<String>,
    pub poll_interval: Duration,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            transport: None,
            store: None,
            handler: None,
            bootstrap_nodes: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Node server
pub struct Server {
    listen_addr: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    handler: Arc<dyn MessageHandler>,
    bootstrap_nodes: Vec<String>,
    poll_interval: Duration,
}

impl Server {
    pub fn new(opts: ServerOpts) -> Result<Self, ServerError> {
        let transport = opts
            .transport
            .ok_or(ServerError::MissingDependency("transport"))?;
        let store = opts.store.ok_or(ServerError::MissingDependency("store"))?;
        let listen_addr = if opts.listen_addr.is_empty() {
            transport.addr()
        } else {
            opts.listen_addr
        };

        Ok(Self {
            listen_addr,
            transport,
            store,
            handler: opts.handler.unwrap_or_else(|| Arc::new(DefaultHandler)),
            bootstrap_nodes: opts.bootstrap_nodes,
            poll_interval: opts.poll_interval,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Listen, dial bootstrap nodes and serve until `shutdown` is set or the
    /// delivery queue closes.
    pub fn start(&self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        log::info!("Server starting on {}", self.listen_addr);

        self.transport.listen_and_accept()?;
        let queue = self.transport.consume()?;
        self.bootstrap();

        self.serve(&queue, shutdown);

        log::info!("Server stopped");
        Ok(())
    }

    fn bootstrap(&self) {
        for node in &self.bootstrap_nodes {
            if let Err(e) = self.transport.dial(node) {
                log::warn!("Failed to dial bootstrap node {}: {}", node, e);
            }
        }
    }

    fn serve(&self, queue: &Receiver<Message>, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            match queue.recv_timeout(self.poll_interval) {
                Ok(msg) => self.dispatch(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Shutting down transport");
        if let Err(e) = self.transport.close() {
            log::warn!("Closing transport: {}", e);
        }
    }

    fn dispatch(&self, msg: Message) {
        let Err(err) = self.handler.handle(&msg, self.store.as_ref()) else {
            return;
        };
        log::error!("Handling message from {}: {}", msg.from, err);

        let Some(peer) = msg.source() else {
            return;
        };
        let response = Message::command(format!("Server error: {:?}", err.to_string()));
        if let Err(e) = peer.send(&response) {
            log::warn!("Failed to send error response to {}: {}", msg.from, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BinaryCodec, Decoder, Encoder, TcpTransport, TcpTransportConfig};
    use crate::storage::ObjectStore;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::thread::{self, JoinHandle};
    use tempfile::TempDir;

    struct Running {
        addr: SocketAddr,
        shutdown: Arc<AtomicBool>,
        handle: JoinHandle<Result<(), ServerError>>,
        _temp: TempDir,
    }

    impl Running {
        fn stop(self) -> TempDir {
            self.shutdown.store(true, Ordering::SeqCst);
            self.handle.join().unwrap().unwrap();
            self._temp
        }
    }

    fn run_server(handler: Option<Arc<dyn MessageHandler>>) -> (Running, Arc<ObjectStore>) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ObjectStore::with_root(temp.path()));
        let transport = Arc::new(TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0")));

        let server = Server::new(ServerOpts {
            transport: Some(transport.clone()),
            store: Some(store.clone()),
            handler,
            poll_interval: Duration::from_millis(20),
            ..ServerOpts::default()
        })
        .unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || server.start(&flag));

        let mut addr = None;
        for _ in 0..100 {
            addr = transport.local_addr();
            if addr.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let running = Running {
            addr: addr.unwrap(),
            shutdown,
            handle,
            _temp: temp,
        };
        (running, store)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        conn
    }

    #[test]
    fn test_missing_dependencies() {
        let result = Server::new(ServerOpts::default());
        assert!(matches!(result, Err(ServerError::MissingDependency("transport"))));

        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0")));
        let result = Server::new(ServerOpts {
            transport: Some(transport),
            ..ServerOpts::default()
        });
        assert!(matches!(result, Err(ServerError::MissingDependency("store"))));
    }

    #[test]
    fn test_error_response_to_source_peer() {
        let (running, _store) = run_server(None);
        let codec = BinaryCodec::default();

        let mut conn = connect(running.addr);
        codec.encode(&mut conn, &Message::command(Vec::new())).unwrap();

        let response = codec.decode(&mut conn).unwrap();
        assert_eq!(response.payload, b"Server error: \"empty payload received\"");

        running.stop();
    }

    #[test]
    fn test_stream_body_is_consumed() {
        let (running, _store) = run_server(None);
        let codec = BinaryCodec::default();

        let mut conn = connect(running.addr);
        codec.encode(&mut conn, &Message::stream()).unwrap();
        conn.write_u64::<BigEndian>(11).unwrap();
        conn.write_all(b"stream body").unwrap();
        codec.encode(&mut conn, &Message::command("fine")).unwrap();
        codec.encode(&mut conn, &Message::command(Vec::new())).unwrap();

        // only the empty command fails, so the connection stayed in sync
        let response = codec.decode(&mut conn).unwrap();
        assert!(response.payload.starts_with(b"Server error"));

        running.stop();
    }

    struct StoringHandler;

    impl MessageHandler for StoringHandler {
        fn handle(&self, msg: &Message, store: &dyn Store) -> Result<(), ServerError> {
            store.write("last", &mut msg.payload.as_slice())?;
            Ok(())
        }
    }

    #[test]
    fn test_custom_handler_uses_store() {
        let (running, store) = run_server(Some(Arc::new(StoringHandler)));

        let mut conn = connect(running.addr);
        BinaryCodec::default()
            .encode(&mut conn, &Message::command("remember me"))
            .unwrap();

        let mut stored = false;
        for _ in 0..100 {
            if store.has("last").unwrap() {
                stored = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stored);

        let _temp = running.stop();

        let mut data = Vec::new();
        store.read("last").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"remember me");
    }
}
