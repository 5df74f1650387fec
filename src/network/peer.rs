//! TCP peer
//!
//! Wraps one live connection. Stream bodies are sent as an 8-byte
//! big-endian length followed by the raw bytes. While a received body is
//! pending, the connection's decode loop is parked until the consumer has
//! read it (or given up on it).

use super::{Direction, Encoder, Message, NetworkError, NetworkResult, Peer};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Hand-off state of the stream body following a stream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    /// Body of the header with this sequence number is waiting
    Pending(u64),
    Reading,
}

/// Parks the decode loop while a consumer owns the connection's read side
struct StreamGate {
    state: Mutex<StreamState>,
    changed: Condvar,
    last_id: AtomicU64,
}

impl StreamGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Idle),
            changed: Condvar::new(),
            last_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: StreamState) {
        *self.lock() = state;
        self.changed.notify_all();
    }

    /// Pending -> Reading. With `id` set, only the body of that header
    /// can be claimed.
    fn claim(&self, id: Option<u64>) -> NetworkResult<()> {
        let mut state = self.lock();
        match (*state, id) {
            (StreamState::Pending(pending), Some(id)) if id < pending => {
                Err(NetworkError::StreamExpired(id))
            }
            (StreamState::Pending(pending), id) if id.map_or(true, |id| id == pending) => {
                *state = StreamState::Reading;
                Ok(())
            }
            (_, Some(id)) if id <= self.last_id.load(Ordering::SeqCst) => {
                Err(NetworkError::StreamExpired(id))
            }
            _ => Err(NetworkError::NoStreamPending),
        }
    }

    /// Wait until the gate is idle again; false on timeout
    fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| *state != StreamState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        *state == StreamState::Idle
    }
}

/// Reader over one stream body. Unread bytes are drained on drop so the
/// connection stays aligned on message boundaries.
struct StreamBody<'a> {
    inner: io::Take<&'a TcpStream>,
    gate: &'a StreamGate,
}

impl Read for StreamBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for StreamBody<'_> {
    fn drop(&mut self) {
        if self.inner.limit() > 0 {
            let _ = io::copy(&mut self.inner, &mut io::sink());
        }
        self.gate.set(StreamState::Idle);
    }
}

/// Peer over a TCP connection
pub struct TcpPeer {
    conn: TcpStream,
    remote: String,
    direction: Direction,
    encoder: Arc<dyn Encoder>,
    gate: StreamGate,
}

impl TcpPeer {
    pub fn new(conn: TcpStream, direction: Direction, encoder: Arc<dyn Encoder>) -> io::Result<Self> {
        let remote = conn.peer_addr()?.to_string();
        Ok(Self {
            conn,
            remote,
            direction,
            encoder,
            gate: StreamGate::new(),
        })
    }

    /// Mark a stream body as waiting and return the sequence number to stamp
    /// on its header. Called before the header is published so a fast
    /// consumer cannot miss it.
    pub(crate) fn begin_stream(&self) -> u64 {
        let id = self.gate.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.set(StreamState::Pending(id));
        id
    }

    /// Block until the pending body has been consumed. A body nobody claims
    /// within `timeout` is discarded here, and its header can no longer be
    /// read.
    pub(crate) fn await_stream(&self, timeout: Duration) {
        loop {
            if self.gate.wait_idle(timeout) {
                return;
            }
            match self.open_body(None) {
                Ok(body) => {
                    log::warn!(
                        "Stream from {} not consumed within {:?}, discarding",
                        self.remote,
                        timeout
                    );
                    drop(body);
                    return;
                }
                // claimed by the consumer in the meantime
                Err(_) => continue,
            }
        }
    }

    fn open_body(&self, id: Option<u64>) -> NetworkResult<Box<dyn Read + '_>> {
        self.gate.claim(id)?;

        let mut conn = &self.conn;
        let len = match conn.read_u64::<BigEndian>() {
            Ok(len) => len,
            Err(e) => {
                self.gate.set(StreamState::Idle);
                return Err(e.into());
            }
        };

        Ok(Box::new(StreamBody {
            inner: conn.take(len),
            gate: &self.gate,
        }))
    }
}

impl Peer for TcpPeer {
    fn send(&self, msg: &Message) -> NetworkResult<()> {
        let mut conn = &self.conn;
        self.encoder.encode(&mut conn, msg)
    }

    fn send_stream(&self, body: &mut dyn Read, len: u64) -> NetworkResult<u64> {
        let mut conn = &self.conn;
        self.encoder.encode(&mut conn, &Message::stream())?;
        conn.write_u64::<BigEndian>(len)?;

        let sent = io::copy(&mut body.take(len), &mut conn)?;
        if sent != len {
            return Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream body ended after {} of {} bytes", sent, len),
            )));
        }
        Ok(sent)
    }

    fn read_stream(&self, header: &Message) -> NetworkResult<Box<dyn Read + '_>> {
        if !header.is_stream || header.stream_id == 0 {
            return Err(NetworkError::NoStreamPending);
        }
        self.open_body(Some(header.stream_id))
    }

    fn remote_addr(&self) -> String {
        self.remote.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn close(&self) -> NetworkResult<()> {
        match self.conn.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}
