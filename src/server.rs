//! TCP server driving pooled connections through a mio event loop.
//!
//! One thread owns the listener, the buffer arena and every connection.
//! Each operation is attempted inline first; if the socket is not ready the
//! connection waits for a readiness event and is picked up again by the
//! same dispatch function.
//!
//! ```text
//! accept ──> Receiving ──read──> handler ──> Responding ──write──┐
//!                ^                                               │
//!                └───────────────────────────────────────────────┘
//!            EOF / error ──> closed (context returned, slot released)
//! ```

use crate::config::{Config, ConfigError};
use crate::error::{Result, ServerError};
use crate::handler::Handler;
use crate::runtime::{
    AdmissionGate, AdmissionPermit, BufferArena, ConnState, Connection, ConnectionRegistry,
    CountersSnapshot, OperationContextPool, ServerCounters, OPS_PER_CONNECTION,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Where a connection stands after being driven.
enum Progress {
    /// Waiting on socket readiness.
    Pending,
    /// Peer went away.
    Closed,
}

/// Bounded-concurrency server with pooled buffers and contexts.
pub struct ConnectionServer<H> {
    poll: Poll,
    event_capacity: usize,
    listener: TcpListener,
    local_addr: SocketAddr,
    arena: BufferArena,
    contexts: Arc<OperationContextPool>,
    gate: AdmissionGate,
    counters: Arc<ServerCounters>,
    connections: ConnectionRegistry,
    handler: H,
    preview_len: usize,
    /// Accepting stopped because the gate was saturated.
    accept_stalled: bool,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

/// Thread-safe view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    counters: Arc<ServerCounters>,
    contexts: Arc<OperationContextPool>,
    gate: AdmissionGate,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl<H: Handler> ConnectionServer<H> {
    /// Bind the listener and preallocate every pooled resource.
    pub fn bind(config: &Config, handler: H) -> Result<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;

        let context_count = config
            .max_connections
            .checked_mul(OPS_PER_CONNECTION)
            .ok_or(ConfigError::Invalid("max_connections too large"))?;
        let arena_bytes = context_count
            .checked_mul(config.buffer_size)
            .ok_or(ConfigError::Invalid("buffer arena size overflows"))?;

        let mut arena = BufferArena::new(arena_bytes, config.buffer_size)?;
        let contexts = Arc::new(OperationContextPool::preallocate(context_count, &mut arena)?);

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            contexts = context_count,
            arena_bytes,
            backlog = config.backlog,
            "Server bound"
        );

        Ok(Self {
            poll,
            event_capacity: config.event_capacity,
            listener,
            local_addr,
            arena,
            contexts,
            gate: AdmissionGate::new(config.max_connections),
            counters: Arc::new(ServerCounters::new()),
            connections: ConnectionRegistry::new(config.max_connections),
            handler,
            preview_len: config.preview_len,
            accept_stalled: false,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            counters: Arc::clone(&self.counters),
            contexts: Arc::clone(&self.contexts),
            gate: self.gate.clone(),
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Serve until [`ServerHandle::shutdown`] is called.
    ///
    /// Per-connection failures never surface here; only poller failures do.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);
        info!(addr = %self.local_addr, "Server listening");

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.dispatch(conn_id),
                }
            }

            // Slots freed by closes above; the listener will not signal again
            // for connections already waiting in the backlog.
            while self.accept_stalled && self.gate.available() > 0 {
                self.accept_connections();
            }
        }

        self.stop();
        Ok(())
    }

    /// Accept until the backlog is drained or the gate is saturated.
    fn accept_connections(&mut self) {
        loop {
            let Some(permit) = self.gate.try_acquire() else {
                if !self.accept_stalled {
                    warn!(
                        max_connections = self.gate.max(),
                        "Connection limit reached, pausing accepts"
                    );
                }
                self.accept_stalled = true;
                return;
            };

            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer, permit),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_stalled = false;
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_stalled = false;
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, permit: AdmissionPermit) {
        let context = match self.contexts.checkout() {
            Ok(context) => context,
            Err(e) => {
                error!(peer = %peer, error = %e, "Dropping connection");
                return;
            }
        };

        let conn = Connection::new(stream, peer, context, permit);
        let conn_id = match self.connections.insert(conn) {
            Ok(id) => id,
            Err(conn) => {
                error!(peer = %peer, "Connection registry full, dropping connection");
                let (_stream, context, _permit) = conn.into_parts();
                self.contexts.put_back(context);
                return;
            }
        };

        let connected = self.counters.connection_opened();
        info!(conn_id, peer = %peer, connected, "Client connected");

        let registered = match self.connections.get_mut(conn_id) {
            Some(conn) => self.poll.registry().register(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE,
            ),
            None => return,
        };
        if let Err(e) = registered {
            warn!(conn_id, error = %e, "Failed to register connection");
            self.close_connection(conn_id);
            return;
        }

        // Data may already be waiting; try the first receive inline.
        self.dispatch(conn_id);
    }

    /// Single completion point for every connection operation.
    fn dispatch(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        let buf = self.arena.slice_mut(conn.context.offset());

        let outcome = match drive(
            conn_id,
            conn,
            buf,
            &self.handler,
            &self.counters,
            self.preview_len,
        ) {
            Ok(Progress::Pending) => {
                let wanted = conn.state.interest();
                if wanted != conn.interest {
                    conn.interest = wanted;
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, Token(conn_id), wanted)
                        .map_err(ServerError::from)
                } else {
                    Ok(())
                }
            }
            Ok(Progress::Closed) => {
                debug!(conn_id, "Connection closed by peer");
                self.close_connection(conn_id);
                return;
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            match e {
                ServerError::ResponseTooLarge { .. } => {
                    warn!(conn_id, error = %e, "Closing connection")
                }
                _ => debug!(conn_id, error = %e, "Connection error"),
            }
            self.close_connection(conn_id);
        }
    }

    /// Tear down a connection and hand its resources back.
    fn close_connection(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.remove(conn_id) else {
            return;
        };

        let peer = conn.peer;
        let requests = conn.requests;
        let bytes = conn.bytes_served;
        let (mut stream, context, permit) = conn.into_parts();

        // Best effort: the peer may already be gone.
        let _ = stream.shutdown(Shutdown::Write);
        let _ = self.poll.registry().deregister(&mut stream);
        drop(stream);

        let connected = self.counters.connection_closed();
        self.contexts.put_back(context);
        drop(permit);

        info!(
            conn_id,
            peer = %peer,
            requests,
            bytes,
            connected,
            total_bytes_read = self.counters.snapshot().total_bytes_read,
            "Client disconnected"
        );
    }

    fn stop(&mut self) {
        for conn_id in self.connections.ids() {
            self.close_connection(conn_id);
        }
        let released = self.contexts.teardown(&mut self.arena);

        let counters = self.counters.snapshot();
        info!(
            released_contexts = released,
            arena_live = self.arena.live(),
            accepted = counters.accepted,
            responses = counters.responses,
            total_bytes_read = counters.total_bytes_read,
            "Server stopped"
        );
    }
}

/// Run a connection's state machine until it must wait or is finished.
fn drive<H: Handler>(
    conn_id: usize,
    conn: &mut Connection,
    buf: &mut [u8],
    handler: &H,
    counters: &ServerCounters,
    preview_len: usize,
) -> Result<Progress> {
    loop {
        match conn.state {
            ConnState::Receiving => match conn.stream.read(buf) {
                Ok(0) => return Ok(Progress::Closed),
                Ok(n) => {
                    conn.bytes_served += n as u64;
                    let total_bytes_read = counters.bytes_read(n);

                    let preview = String::from_utf8_lossy(&buf[..n.min(preview_len)]);
                    debug!(
                        conn_id,
                        bytes = n,
                        total_bytes_read,
                        preview = %preview.escape_debug(),
                        "Received request"
                    );

                    let response = handler.handle(&buf[..n]);
                    if response.len() > buf.len() {
                        return Err(ServerError::ResponseTooLarge {
                            len: response.len(),
                            capacity: buf.len(),
                        });
                    }
                    buf[..response.len()].copy_from_slice(&response);
                    conn.start_responding(response.len());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Pending)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            },
            ConnState::Responding { written, total } if written >= total => {
                // Nothing to send for an empty response.
                conn.advance_write(0);
                counters.response_sent();
            }
            ConnState::Responding { written, total } => {
                match conn.stream.write(&buf[written..total]) {
                    Ok(0) => {
                        return Err(
                            io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into()
                        );
                    }
                    Ok(n) => {
                        counters.bytes_written(n);
                        if conn.advance_write(n) {
                            counters.response_sent();
                            trace!(conn_id, bytes = total, "Response sent");
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::Pending)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Contexts sitting in the pool.
    pub fn available_contexts(&self) -> usize {
        self.contexts.available()
    }

    pub fn total_contexts(&self) -> usize {
        self.contexts.total()
    }

    /// Admission slots currently held by open connections.
    pub fn outstanding_permits(&self) -> usize {
        self.gate.outstanding()
    }

    /// Ask the event loop to close every connection and return.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FixedReply, PONG};
    use bytes::Bytes;
    use std::net::TcpStream as StdTcpStream;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    fn test_config(max_connections: usize) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_connections,
            buffer_size: 256,
            ..Config::default()
        }
    }

    fn start<H: Handler + 'static>(
        max_connections: usize,
        handler: H,
    ) -> (ServerHandle, JoinHandle<Result<()>>) {
        start_with(&test_config(max_connections), handler)
    }

    fn start_with<H: Handler + 'static>(
        config: &Config,
        handler: H,
    ) -> (ServerHandle, JoinHandle<Result<()>>) {
        let server = ConnectionServer::bind(config, handler).unwrap();
        let handle = server.handle();
        let join = thread::spawn(move || server.run());
        (handle, join)
    }

    fn stop(handle: ServerHandle, join: JoinHandle<Result<()>>) {
        handle.shutdown().unwrap();
        join.join().unwrap().unwrap();
    }

    fn connect(handle: &ServerHandle) -> StdTcpStream {
        let stream = StdTcpStream::connect(handle.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn request(stream: &mut StdTcpStream, payload: &[u8], reply_len: usize) -> Vec<u8> {
        stream.write_all(payload).unwrap();
        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply).unwrap();
        reply
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_fixed_reply_repeats_on_one_connection() {
        let (handle, join) = start(4, FixedReply::default());
        let mut client = connect(&handle);

        assert_eq!(request(&mut client, b"hello", PONG.len()), PONG);
        assert_eq!(request(&mut client, b"hello", PONG.len()), PONG);
        assert_eq!(request(&mut client, b"anything else", PONG.len()), PONG);

        // Send counters are bumped after the write returns.
        wait_until(|| handle.counters().responses == 3);
        let counters = handle.counters();
        assert_eq!(counters.connected, 1);
        assert_eq!(counters.total_bytes_read, 23);
        assert_eq!(counters.bytes_written, 3 * PONG.len() as u64);

        stop(handle, join);
    }

    #[test]
    fn test_replies_follow_request_order() {
        let echo = |request: &[u8]| Bytes::copy_from_slice(request);
        let (handle, join) = start(2, echo);
        let mut client = connect(&handle);

        assert_eq!(request(&mut client, b"R1", 2), b"R1");
        assert_eq!(request(&mut client, b"R2", 2), b"R2");
        assert_eq!(request(&mut client, b"third", 5), b"third");

        stop(handle, join);
    }

    #[test]
    fn test_admission_bound_stalls_extra_connection() {
        let (handle, join) = start(2, FixedReply::default());

        let mut first = connect(&handle);
        let mut second = connect(&handle);
        assert_eq!(request(&mut first, b"a", PONG.len()), PONG);
        assert_eq!(request(&mut second, b"b", PONG.len()), PONG);

        // Third connection completes the TCP handshake but is not admitted.
        let mut third = connect(&handle);
        third.write_all(b"hello").unwrap();
        third
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut reply = [0u8; 7];
        let err = third.read(&mut reply).unwrap_err();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ));
        assert_eq!(handle.counters().connected, 2);
        assert_eq!(handle.outstanding_permits(), 2);

        // Freeing a slot admits the waiting connection.
        drop(first);
        third
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        third.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, PONG);

        let counters = handle.counters();
        assert!(counters.connected <= 2);
        assert_eq!(counters.accepted, 3);
        assert_eq!(request(&mut second, b"c", PONG.len()), PONG);

        stop(handle, join);
    }

    #[test]
    fn test_large_response_resumes_after_socket_drains() {
        const REPLY_LEN: usize = 6 << 20;

        // Far larger than the loopback send buffer, so the first write is partial
        // and the rest has to wait for writability.
        let config = Config {
            buffer_size: 8 << 20,
            ..test_config(1)
        };
        let big = |_request: &[u8]| Bytes::from(vec![b'z'; REPLY_LEN]);
        let (handle, join) = start_with(&config, big);
        let mut client = connect(&handle);

        for payload in [&b"first"[..], &b"second"[..]] {
            client.write_all(payload).unwrap();
            thread::sleep(Duration::from_millis(300));

            let mut reply = vec![0u8; REPLY_LEN];
            client.read_exact(&mut reply).unwrap();
            assert!(reply.iter().all(|&b| b == b'z'));
        }

        wait_until(|| handle.counters().responses == 2);
        let counters = handle.counters();
        assert_eq!(counters.bytes_written, 2 * REPLY_LEN as u64);
        assert_eq!(counters.connected, 1);

        drop(client);
        stop(handle, join);
    }

    #[test]
    fn test_disconnect_returns_context() {
        let (handle, join) = start(2, FixedReply::default());
        assert_eq!(handle.total_contexts(), 2 * OPS_PER_CONNECTION);

        let mut client = connect(&handle);
        assert_eq!(request(&mut client, b"hello", PONG.len()), PONG);
        assert_eq!(handle.available_contexts(), handle.total_contexts() - 1);
        assert_eq!(handle.counters().connected, 1);

        drop(client);
        wait_until(|| handle.outstanding_permits() == 0);
        assert_eq!(handle.counters().connected, 0);
        assert_eq!(handle.available_contexts(), handle.total_contexts());

        // The returned context serves the next connection.
        let mut client = connect(&handle);
        assert_eq!(request(&mut client, b"again", PONG.len()), PONG);
        let counters = handle.counters();
        assert_eq!(counters.accepted, 2);
        assert_eq!(counters.connected, 1);

        stop(handle, join);
    }

    #[test]
    fn test_oversized_response_closes_only_that_connection() {
        let handler = |request: &[u8]| {
            if request.starts_with(b"big") {
                Bytes::from(vec![b'x'; 1024])
            } else {
                Bytes::from_static(PONG)
            }
        };
        let (handle, join) = start(2, handler);

        let mut healthy = connect(&handle);
        let mut doomed = connect(&handle);
        assert_eq!(request(&mut healthy, b"ping", PONG.len()), PONG);

        doomed.write_all(b"big").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(doomed.read(&mut buf).unwrap(), 0);

        wait_until(|| handle.counters().connected == 1);
        assert_eq!(request(&mut healthy, b"ping", PONG.len()), PONG);

        stop(handle, join);
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (handle, join) = start(2, FixedReply::default());
        let mut client = connect(&handle);
        assert_eq!(request(&mut client, b"hello", PONG.len()), PONG);

        let view = handle.clone();
        stop(handle, join);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(view.counters().connected, 0);
        assert_eq!(view.outstanding_permits(), 0);
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let config = Config {
            max_connections: 0,
            ..test_config(1)
        };
        assert!(matches!(
            ConnectionServer::bind(&config, FixedReply::default()),
            Err(ServerError::Config(_))
        ));
    }
}
