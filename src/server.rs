//! Single-threaded readiness loop.
//!
//! One `mio::Poll` owns the listener and every connection socket. Readiness
//! events drive connection state machines; a periodic tick pings
//! connections that have gone silent. Handler code runs synchronously on
//! the loop thread, so per-connection event order matches arrival order.

use crate::handler::ConnectionHandler;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnEvent, ConnState, Connection};
use crate::handler::{Factory, HandlerResult};
use crate::protocol::close::CloseCode;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Where the server gets its listening socket.
pub enum Listen {
    /// Bind the given port on all interfaces.
    Port(u16),
    /// Bind a specific address.
    Addr(SocketAddr),
    /// Adopt a pre-bound listener; it is switched to non-blocking mode.
    Bound(std::net::TcpListener),
}

/// Server options.
pub struct ServerConfig {
    pub listen: Listen,
    /// Seconds of allowed per-connection silence before pinging; 0 disables
    /// idle pings. The scheduler ticks every `silence_max / 2`.
    pub silence_max: u64,
    /// Cap on an assembled message; overflow closes the connection with 1009.
    pub max_message_size: usize,
    /// Connections beyond this are dropped at accept.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: Listen::Port(80),
            silence_max: 20,
            max_message_size: 16 * 1024 * 1024,
            max_connections: 10240,
        }
    }
}

/// Fatal server errors.
#[derive(Debug)]
pub enum ServerError {
    /// Listener could not be created or registered.
    Bind(io::Error),
    /// The readiness wait itself failed.
    Poll(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "failed to bind listener: {e}"),
            ServerError::Poll(e) => write!(f, "readiness wait failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) | ServerError::Poll(e) => Some(e),
        }
    }
}

struct ConnEntry<H> {
    conn: Connection,
    handler: H,
    last_recv: Instant,
    disconnect_fired: bool,
}

/// WebSocket server: listener, connection registry, and the event loop.
pub struct Server<F: Factory> {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    conns: Slab<ConnEntry<F::Handler>>,
    factory: F,
    silence_max: Duration,
    check_interval: Duration,
    next_check: Instant,
    max_message_size: usize,
    max_connections: usize,
    shutting_down: bool,
    shutdown_pending: bool,
}

impl<F: Factory> Server<F> {
    /// Bind the listener and prepare the loop. Listener failures are fatal.
    pub fn bind(config: ServerConfig, factory: F) -> Result<Self, ServerError> {
        let std_listener = make_listener(config.listen).map_err(ServerError::Bind)?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new().map_err(ServerError::Bind)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Bind)?;

        let silence_max = Duration::from_secs(config.silence_max);
        let check_interval = silence_max / 2;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(%addr, silence_max = config.silence_max, "listening");

        Ok(Server {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: Some(listener),
            conns: Slab::with_capacity(256),
            factory,
            silence_max,
            check_interval,
            next_check: Instant::now() + check_interval,
            max_message_size: config.max_message_size,
            max_connections: config.max_connections,
            shutting_down: false,
            shutdown_pending: false,
        })
    }

    /// Address the listener is bound to; `None` once shutdown has begun.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Current connections, in no particular order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.conns.iter().map(|(_, entry)| &entry.conn)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Run until the listener is gone and the last connection has closed.
    ///
    /// The only way out is [`shutdown`](Self::shutdown), reachable from
    /// handler code via [`Connection::shutdown_server`], followed by the
    /// remaining connections draining.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while self.listener.is_some() || !self.conns.is_empty() {
            let timeout = if self.silence_max.is_zero() {
                None
            } else {
                Some(self.next_check.saturating_duration_since(Instant::now()))
            };

            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            }

            let mut ready = Vec::new();
            for event in self.events.iter() {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                ready.push((event.token(), readable, event.is_writable()));
            }

            for (token, readable, writable) in ready {
                if token == LISTENER_TOKEN {
                    self.accept_ready();
                } else {
                    self.conn_ready(token.0, readable, writable);
                }
            }

            self.idle_tick();
        }
        info!("server loop finished");
        Ok(())
    }

    /// Stop listening and start an orderly close (code 1001, Going Away) on
    /// every connection. Idempotent; the loop exits once the last
    /// connection drains.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            info!(conns = self.conns.len(), "shutting down");
        }
        for (_, entry) in self.conns.iter_mut() {
            entry.conn.disconnect(CloseCode::GoingAway, "server going away");
        }
        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.sweep(id);
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let result = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match result {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
            self.run_pending_shutdown();
        }
    }

    fn accept_one(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.conns.len() >= self.max_connections {
            warn!(peer = %peer, "connection limit reached");
            return;
        }
        let entry = self.conns.vacant_entry();
        let id = entry.key();
        let mut conn = Connection::new(stream, peer, Token(id), self.max_message_size);
        if let Err(e) = conn.register(self.poll.registry()) {
            error!(peer = %peer, error = %e, "failed to register connection");
            return;
        }
        let handler = self.factory.on_connect(&mut conn);
        entry.insert(ConnEntry {
            conn,
            handler,
            last_recv: Instant::now(),
            disconnect_fired: false,
        });
        debug!(conn_id = id, peer = %peer, "accepted connection");
        self.sweep(id);
    }

    fn conn_ready(&mut self, id: usize, readable: bool, writable: bool) {
        if !self.conns.contains(id) {
            return;
        }
        if writable {
            self.conns[id].conn.drive_writable();
        }
        if readable {
            self.conns[id].last_recv = Instant::now();
            let events = self.conns[id].conn.drive_readable();
            self.dispatch(id, events);
        }
        self.sweep(id);
        self.run_pending_shutdown();
    }

    /// Dispatch connection events to the handler, in arrival order.
    fn dispatch(&mut self, id: usize, events: Vec<ConnEvent>) {
        let mut queue: VecDeque<ConnEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            if !self.conns.contains(id) {
                return;
            }
            match event {
                ConnEvent::HandshakeParsed => {
                    let Some(request) = self.conns[id].conn.take_handshake() else {
                        continue;
                    };
                    let result = {
                        let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                        handler.on_handshake(conn, &request)
                    };
                    self.after_handler(id, result);
                    if self.conns[id].conn.state() != ConnState::Handshake {
                        // Rejected during the callback.
                        continue;
                    }
                    let pipelined = self.conns[id].conn.finish_handshake(&request);
                    if self.conns[id].conn.state() == ConnState::Established {
                        let result = {
                            let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                            handler.on_ready(conn)
                        };
                        self.after_handler(id, result);
                    }
                    // Frames the client pipelined behind its request head
                    // precede anything read later in this cycle.
                    for event in pipelined.into_iter().rev() {
                        queue.push_front(event);
                    }
                }
                ConnEvent::Text(text) => {
                    if self.conns[id].conn.state() != ConnState::Established {
                        continue;
                    }
                    let result = {
                        let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                        handler.on_text(conn, &text)
                    };
                    self.after_handler(id, result);
                }
                ConnEvent::Binary(data) => {
                    if self.conns[id].conn.state() != ConnState::Established {
                        continue;
                    }
                    let result = {
                        let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                        handler.on_binary(conn, &data)
                    };
                    self.after_handler(id, result);
                }
                ConnEvent::Ping(payload) => {
                    if self.conns[id].conn.state() != ConnState::Established {
                        continue;
                    }
                    let result = {
                        let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                        handler.on_ping(conn, &payload)
                    };
                    self.after_handler(id, result);
                }
                ConnEvent::Pong(payload) => {
                    if self.conns[id].conn.state() != ConnState::Established {
                        continue;
                    }
                    let result = {
                        let ConnEntry { conn, handler, .. } = &mut self.conns[id];
                        handler.on_pong(conn, &payload)
                    };
                    self.after_handler(id, result);
                }
                ConnEvent::CloseReceived { code, reason } => {
                    self.fire_disconnect(id, code, reason.as_deref());
                }
                ConnEvent::Failed => {
                    // A handshake failure is already Closed and goes now. A
                    // protocol failure sits in Closing while its close frame
                    // drains; the peer's next event finalizes it and the
                    // disconnect fires at removal.
                    if self.conns.get(id).map(|e| e.conn.state()) == Some(ConnState::Closed) {
                        self.fire_disconnect(id, None, None);
                        self.remove(id);
                    }
                }
                ConnEvent::Dropped => {
                    self.fire_disconnect(id, None, None);
                    self.remove(id);
                }
            }
        }
    }

    /// Invoke `on_disconnect` at most once for this connection.
    fn fire_disconnect(&mut self, id: usize, code: Option<u16>, reason: Option<&str>) {
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if entry.disconnect_fired {
            return;
        }
        entry.disconnect_fired = true;
        let result = {
            let ConnEntry { conn, handler, .. } = entry;
            handler.on_disconnect(conn, code, reason)
        };
        self.after_handler(id, result);
    }

    /// Containment and control-flag collection after any handler call.
    ///
    /// A handler error is fatal for its connection only: the connection is
    /// closed with 1011 and the loop goes on serving everyone else.
    fn after_handler(&mut self, id: usize, result: HandlerResult) {
        if let Err(e) = result {
            warn!(conn_id = id, error = %e, "handler failed; closing connection");
            if let Some(entry) = self.conns.get_mut(id) {
                entry
                    .conn
                    .disconnect(CloseCode::InternalError, "internal error");
            }
        }
        if let Some(entry) = self.conns.get_mut(id) {
            if entry.conn.take_shutdown_request() {
                self.shutdown_pending = true;
            }
        }
    }

    /// Post-dispatch bookkeeping: reap closed connections, keep readiness
    /// interest in sync with pending egress.
    fn sweep(&mut self, id: usize) {
        let Some(entry) = self.conns.get_mut(id) else {
            return;
        };
        if entry.conn.state() == ConnState::Closed {
            self.fire_disconnect(id, None, None);
            self.remove(id);
        } else if let Err(e) = entry.conn.update_registration(self.poll.registry()) {
            error!(conn_id = id, error = %e, "reregister failed");
            self.fire_disconnect(id, None, None);
            self.remove(id);
        }
    }

    /// Low-level teardown: deregister and drop without firing callbacks.
    fn remove(&mut self, id: usize) {
        if let Some(mut entry) = self.conns.try_remove(id) {
            if entry.conn.take_shutdown_request() {
                self.shutdown_pending = true;
            }
            entry.conn.deregister(self.poll.registry());
            debug!(conn_id = id, "connection removed");
        }
    }

    fn run_pending_shutdown(&mut self) {
        if self.shutdown_pending {
            self.shutdown_pending = false;
            self.shutdown();
        }
    }

    /// Ping every established connection that has been silent since the
    /// previous tick boundary, then re-arm the timer.
    fn idle_tick(&mut self) {
        if self.silence_max.is_zero() {
            return;
        }
        let now = Instant::now();
        if now < self.next_check {
            return;
        }
        let threshold = self.next_check - self.check_interval;
        let mut pinged = 0usize;
        for (_, entry) in self.conns.iter_mut() {
            if entry.conn.state() == ConnState::Established && entry.last_recv < threshold {
                let _ = entry.conn.send_ping(&[]);
                pinged += 1;
            }
        }
        if pinged > 0 {
            trace!(pinged, "idle tick");
        }
        self.next_check = now + self.check_interval;

        let ids: Vec<usize> = self.conns.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.sweep(id);
        }
        self.run_pending_shutdown();
    }
}

/// Build the listening socket: reuse-address, non-blocking, backlog 1024.
fn make_listener(listen: Listen) -> io::Result<std::net::TcpListener> {
    match listen {
        Listen::Bound(listener) => {
            listener.set_nonblocking(true)?;
            Ok(listener)
        }
        Listen::Port(port) => bind_addr(SocketAddr::from(([0, 0, 0, 0], port))),
        Listen::Addr(addr) => bind_addr(addr),
    }
}

fn bind_addr(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
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
    socket.listen(1024)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ConnectionHandler;

    struct Quiet;
    impl ConnectionHandler for Quiet {}

    #[test]
    fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            listen: Listen::Addr("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let server = Server::bind(config, |_: &mut Connection| Quiet).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_empty());
    }

    #[test]
    fn test_bind_adopts_prebound_listener() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let config = ServerConfig {
            listen: Listen::Bound(std_listener),
            ..Default::default()
        };
        let server = Server::bind(config, |_: &mut Connection| Quiet).unwrap();
        assert_eq!(server.local_addr(), Some(addr));
    }

    #[test]
    fn test_run_returns_after_shutdown_with_no_conns() {
        let config = ServerConfig {
            listen: Listen::Addr("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        };
        let mut server = Server::bind(config, |_: &mut Connection| Quiet).unwrap();
        server.shutdown();
        server.shutdown(); // idempotent
        server.run().unwrap();
    }
}
