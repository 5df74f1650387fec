//! TCP transport
//!
//! Accepts and dials connections, runs one thread per connection and
//! publishes decoded messages to a bounded delivery queue.

use super::codec::BinaryCodec;
use super::peer::TcpPeer;
use super::{
    Decoder, Direction, Encoder, HandshakeFn, Message, NetworkError, NetworkResult, OnPeerFn,
    Peer, Transport,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Delivery queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How long a received stream body may wait for its consumer
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP transport configuration
#[derive(Clone)]
pub struct TcpTransportConfig {
    /// Address to bind, e.g. `0.0.0.0:4000`
    pub listen_addr: String,
    /// Run on every new connection before reading
    pub handshake: Option<HandshakeFn>,
    /// Run after the handshake, e.g. to register the peer
    pub on_peer: Option<OnPeerFn>,
    pub encoder: Arc<dyn Encoder>,
    pub decoder: Arc<dyn Decoder>,
    pub queue_capacity: usize,
    pub stream_timeout: Duration,
}

impl TcpTransportConfig {
    /// Configuration with the binary codec and no callbacks
    pub fn new(listen_addr: impl Into<String>) -> Self {
        let codec = Arc::new(BinaryCodec::default());
        Self {
            listen_addr: listen_addr.into(),
            handshake: None,
            on_peer: None,
            encoder: codec.clone(),
            decoder: codec,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

/// State shared with connection threads
struct Shared {
    handshake: Option<HandshakeFn>,
    on_peer: Option<OnPeerFn>,
    encoder: Arc<dyn Encoder>,
    decoder: Arc<dyn Decoder>,
    stream_timeout: Duration,
    queue: SyncSender<Message>,
}

/// TCP transport
pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    receiver: Mutex<Option<Receiver<Message>>>,
    bound: Mutex<Option<SocketAddr>>,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let (queue, receiver) = mpsc::sync_channel(config.queue_capacity.max(1));
        let shared = Shared {
            handshake: config.handshake,
            on_peer: config.on_peer,
            encoder: config.encoder,
            decoder: config.decoder,
            stream_timeout: config.stream_timeout,
            queue,
        };

        Self {
            listen_addr: config.listen_addr,
            shared: Arc::new(shared),
            receiver: Mutex::new(Some(receiver)),
            bound: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound)
    }
}

impl Transport for TcpTransport {
    fn addr(&self) -> String {
        self.listen_addr.clone()
    }

    fn dial(&self, addr: &str) -> NetworkResult<()> {
        let conn = TcpStream::connect(addr)?;
        log::info!("Dialed {}", addr);

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || handle_conn(shared, conn, Direction::Outbound));
        Ok(())
    }

    fn listen_and_accept(&self) -> NetworkResult<()> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        let local = listener.local_addr()?;
        *lock(&self.bound) = Some(local);
        self.closed.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let closed = Arc::clone(&self.closed);
        thread::Builder::new()
            .name("destore-accept".to_string())
            .spawn(move || accept_loop(listener, shared, closed))?;

        log::info!("TCP transport listening on {}", local);
        Ok(())
    }

    fn consume(&self) -> NetworkResult<Receiver<Message>> {
        lock(&self.receiver).take().ok_or(NetworkError::QueueTaken)
    }

    fn close(&self) -> NetworkResult<()> {
        let local = lock(&self.bound).take().ok_or(NetworkError::NotListening)?;
        self.closed.store(true, Ordering::SeqCst);

        // unblock the pending accept; the loop sees the flag and drops the listener
        let _ = TcpStream::connect(wake_addr(local));
        log::info!("TCP transport on {} closed", local);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connectable form of a bound address
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, closed: Arc<AtomicBool>) {
    loop {
        match listener.accept() {
            Ok((conn, _)) => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let shared = Arc::clone(&shared);
                thread::spawn(move || handle_conn(shared, conn, Direction::Inbound));
            }
            Err(_) if closed.load(Ordering::SeqCst) => return,
            Err(e) => log::error!("TCP accept error: {}", e),
        }
    }
}

/// Connection thread body. Always closes the connection on the way out.
fn handle_conn(shared: Arc<Shared>, conn: TcpStream, direction: Direction) {
    let reader = match conn.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("Failed to clone connection: {}", e);
            return;
        }
    };
    let peer = match TcpPeer::new(conn, direction, Arc::clone(&shared.encoder)) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            log::warn!("Failed to set up peer: {}", e);
            return;
        }
    };

    let remote = peer.remote_addr();
    log::info!("New {:?} connection: {}", direction, remote);

    match serve_peer(&shared, &peer, &reader) {
        Err(e) if e.is_disconnect() => log::info!("Peer {} disconnected", remote),
        Err(e) => log::warn!("Peer {} connection dropped: {}", remote, e),
        Ok(()) => {}
    }

    let _ = peer.close();
}

fn serve_peer(shared: &Shared, peer: &Arc<TcpPeer>, mut reader: &TcpStream) -> NetworkResult<()> {
    if let Some(handshake) = &shared.handshake {
        handshake(&**peer)?;
    }

    let handle: Arc<dyn Peer> = peer.clone();
    if let Some(on_peer) = &shared.on_peer {
        on_peer(Arc::clone(&handle))?;
    }
    let source = Arc::downgrade(&handle);

    loop {
        let mut msg = shared.decoder.decode(&mut reader)?;
        msg.from = peer.remote_addr();
        msg.source_peer = Some(source.clone());

        let is_stream = msg.is_stream;
        if is_stream {
            msg.stream_id = peer.begin_stream();
        }

        // blocks while the queue is full
        shared
            .queue
            .send(msg)
            .map_err(|_| NetworkError::QueueClosed)?;

        if is_stream {
            peer.await_stream(shared.stream_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::{Read, Write};
    use std::net::Shutdown;

    const WAIT: Duration = Duration::from_secs(2);

    fn start(config: TcpTransportConfig) -> (TcpTransport, Receiver<Message>, SocketAddr) {
        let transport = TcpTransport::new(config);
        transport.listen_and_accept().unwrap();
        let rx = transport.consume().unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, rx, addr)
    }

    fn send(conn: &mut TcpStream, msg: &Message) {
        BinaryCodec::default().encode(conn, msg).unwrap();
    }

    #[test]
    fn test_command_delivery() {
        let (_transport, rx, addr) = start(TcpTransportConfig::new("127.0.0.1:0"));

        let mut conn = TcpStream::connect(addr).unwrap();
        send(&mut conn, &Message::command("Command Payload"));

        let msg = rx.recv_timeout(WAIT).unwrap();
        assert!(!msg.is_stream);
        assert_eq!(msg.payload, b"Command Payload");
        assert_eq!(msg.from, conn.local_addr().unwrap().to_string());
        assert!(msg.source().is_some());
    }

    #[test]
    fn test_stream_header_delivery() {
        let mut config = TcpTransportConfig::new("127.0.0.1:0");
        config.stream_timeout = Duration::from_millis(100);
        let (_transport, rx, addr) = start(config);

        let mut conn = TcpStream::connect(addr).unwrap();
        send(&mut conn, &Message::stream());

        let msg = rx.recv_timeout(WAIT).unwrap();
        assert!(msg.is_stream);
        assert!(msg.payload.is_empty());
        assert!(msg.stream_id > 0);
        assert!(msg.source().is_some());

        // the connection thread gives up on the missing body and sees EOF
        conn.shutdown(Shutdown::Both).unwrap();
    }

    #[test]
    fn test_stream_body_then_command() {
        let (_transport, rx, addr) = start(TcpTransportConfig::new("127.0.0.1:0"));

        let mut conn = TcpStream::connect(addr).unwrap();
        let body = b"ROW_BINARY_DATA_OF_THE_FILE";
        send(&mut conn, &Message::stream());
        conn.write_u64::<BigEndian>(body.len() as u64).unwrap();
        conn.write_all(body).unwrap();
        send(&mut conn, &Message::command("after"));

        let header = rx.recv_timeout(WAIT).unwrap();
        assert!(header.is_stream);
        let peer = header.source().unwrap();

        let mut received = Vec::new();
        peer.read_stream(&header).unwrap().read_to_end(&mut received).unwrap();
        assert_eq!(received, body);

        let next = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(next.payload, b"after");
    }

    #[test]
    fn test_slow_consumer_never_gets_a_later_body() {
        let mut config = TcpTransportConfig::new("127.0.0.1:0");
        config.stream_timeout = Duration::from_millis(100);
        let (_transport, rx, addr) = start(config);

        let mut conn = TcpStream::connect(addr).unwrap();
        for body in [b"AAA", b"BBB"] {
            send(&mut conn, &Message::stream());
            conn.write_u64::<BigEndian>(3).unwrap();
            conn.write_all(body).unwrap();
        }

        let first = rx.recv_timeout(WAIT).unwrap();
        // the first body is discarded and the second header queued meanwhile
        let second = rx.recv_timeout(WAIT).unwrap();
        assert!(second.is_stream);
        assert!(second.stream_id > first.stream_id);

        let peer = first.source().unwrap();
        assert!(matches!(
            peer.read_stream(&first),
            Err(NetworkError::StreamExpired(id)) if id == first.stream_id
        ));

        let mut received = Vec::new();
        peer.read_stream(&second).unwrap().read_to_end(&mut received).unwrap();
        assert_eq!(received, b"BBB");
    }

    #[test]
    fn test_dial_and_reply() {
        let (admitted_tx, admitted_rx) = mpsc::channel::<Arc<dyn Peer>>();
        let admitted_tx = Mutex::new(admitted_tx);

        let mut server_config = TcpTransportConfig::new("127.0.0.1:0");
        server_config.handshake = Some(Arc::new(super::super::nop_handshake));
        server_config.on_peer = Some(Arc::new(move |peer: Arc<dyn Peer>| -> NetworkResult<()> {
            let _ = lock(&admitted_tx).send(peer);
            Ok(())
        }));
        let (_server, _server_rx, addr) = start(server_config);

        let client = TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0"));
        let client_rx = client.consume().unwrap();
        client.dial(&addr.to_string()).unwrap();

        let inbound = admitted_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(inbound.direction(), Direction::Inbound);
        inbound.send(&Message::command("welcome")).unwrap();

        let msg = client_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.payload, b"welcome");
        assert_eq!(msg.from, addr.to_string());
        assert_eq!(msg.source().unwrap().direction(), Direction::Outbound);
    }

    #[test]
    fn test_handshake_rejection_closes_connection() {
        let mut config = TcpTransportConfig::new("127.0.0.1:0");
        config.handshake = Some(Arc::new(|_: &dyn Peer| -> NetworkResult<()> {
            Err(NetworkError::Handshake("not welcome".to_string()))
        }));
        let (_transport, rx, addr) = start(config);

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(WAIT)).unwrap();
        let _ = BinaryCodec::default().encode(&mut conn, &Message::command("ignored"));

        let mut buf = [0u8; 1];
        match conn.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::WouldBlock),
        }
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_bad_type_byte_only_drops_that_connection() {
        let (_transport, rx, addr) = start(TcpTransportConfig::new("127.0.0.1:0"));

        let mut bad = TcpStream::connect(addr).unwrap();
        bad.write_all(&[0x7f]).unwrap();

        let mut good = TcpStream::connect(addr).unwrap();
        send(&mut good, &Message::command("still here"));

        let msg = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(msg.payload, b"still here");
    }

    #[test]
    fn test_full_queue_blocks_without_dropping() {
        let codec = Arc::new(BinaryCodec::new(64 << 20));
        let mut config = TcpTransportConfig::new("127.0.0.1:0");
        config.queue_capacity = 1;
        config.encoder = codec.clone();
        config.decoder = codec.clone();
        let (_transport, rx, addr) = start(config);

        let mut conn = TcpStream::connect(addr).unwrap();
        send(&mut conn, &Message::command("msg_0"));
        send(&mut conn, &Message::command("msg_1"));
        // msg_0 fills the queue, the connection thread is parked holding msg_1
        thread::sleep(Duration::from_millis(200));

        // larger than the socket buffers, so the write only completes once
        // the connection thread reads again
        let written = Arc::new(AtomicBool::new(false));
        let writer = {
            let mut conn = conn.try_clone().unwrap();
            let written = Arc::clone(&written);
            thread::spawn(move || {
                let big = Message::command(vec![7u8; 32 << 20]);
                codec.encode(&mut conn, &big).unwrap();
                written.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(300));
        assert!(!written.load(Ordering::SeqCst));

        assert_eq!(rx.recv_timeout(WAIT).unwrap().payload, b"msg_0");
        assert_eq!(rx.recv_timeout(WAIT).unwrap().payload, b"msg_1");
        let big = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(big.payload.len(), 32 << 20);

        writer.join().unwrap();
        assert!(written.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_stops_accepting() {
        let (transport, rx, addr) = start(TcpTransportConfig::new("127.0.0.1:0"));
        let mut established = TcpStream::connect(addr).unwrap();
        send(&mut established, &Message::command("before"));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().payload, b"before");

        transport.close().unwrap();
        assert!(matches!(transport.close(), Err(NetworkError::NotListening)));

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).is_err() {
                refused = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(refused);

        // accepted connections outlive the listener
        send(&mut established, &Message::command("after"));
        assert_eq!(rx.recv_timeout(WAIT).unwrap().payload, b"after");
    }

    #[test]
    fn test_queue_has_one_consumer() {
        let transport = TcpTransport::new(TcpTransportConfig::new("127.0.0.1:0"));
        assert_eq!(transport.addr(), "127.0.0.1:0");
        assert!(transport.consume().is_ok());
        assert!(matches!(transport.consume(), Err(NetworkError::QueueTaken)));
        assert!(matches!(transport.close(), Err(NetworkError::NotListening)));
    }
}
