//! Per-socket connection state machine.
//!
//! A connection owns its TCP stream and drives bytes through the handshake
//! and frame codecs, yielding [`ConnEvent`]s for the server loop to
//! dispatch. Outbound frames are encoded into a send buffer and flushed
//! immediately; whatever the kernel refuses waits for writable readiness.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use crate::protocol::close::{self, CloseCode};
use crate::protocol::frame::{Frame, FrameParser, Message, MessageAssembler, Opcode};
use crate::protocol::handshake::{self, HandshakeRequest};
use crate::protocol::ProtocolError;

/// Bytes pulled from the socket per read syscall.
const READ_CHUNK: usize = 8 * 1024;

/// Cap on the accumulated request head before the handshake is rejected.
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the client's upgrade request.
    Handshake,
    /// Upgrade complete; frames flow in both directions.
    Established,
    /// A close frame has been sent; the next inbound event finalizes the
    /// connection.
    Closing,
    /// Socket is dead; the registry entry is about to be dropped.
    Closed,
}

/// Events a connection yields for the server loop to dispatch.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Upgrade request parsed and validated; response not yet written.
    HandshakeParsed,
    /// Complete text message.
    Text(String),
    /// Complete binary message.
    Binary(Vec<u8>),
    /// Ping received; the pong reply is already queued.
    Ping(Vec<u8>),
    /// Pong received.
    Pong(Vec<u8>),
    /// Peer sent a close frame; the echo is already queued.
    CloseReceived {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// Handshake or protocol failure; the 400 or close reply is queued.
    Failed,
    /// Socket finished (EOF or I/O error); remove the connection.
    Dropped,
}

/// One client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    token: Token,
    state: ConnState,
    ingress: BytesMut,
    parser: FrameParser,
    assembler: MessageAssembler,
    handshake: Option<HandshakeRequest>,
    subprotocol: Option<String>,
    send_buf: BytesMut,
    shutdown_requested: bool,
    registered_interest: Option<Interest>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        token: Token,
        max_message_size: usize,
    ) -> Self {
        Connection {
            stream,
            peer,
            token,
            state: ConnState::Handshake,
            ingress: BytesMut::new(),
            parser: FrameParser::new(true, max_message_size),
            assembler: MessageAssembler::new(max_message_size),
            handshake: None,
            subprotocol: None,
            send_buf: BytesMut::new(),
            shutdown_requested: false,
            registered_interest: None,
        }
    }

    /// Remote address of this connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Registry identity; stable for the connection's lifetime.
    pub fn id(&self) -> usize {
        self.token.0
    }

    /// Answer one of the client's requested subprotocols.
    ///
    /// Only meaningful from the handshake callback; the chosen value is
    /// echoed in the 101 response.
    pub fn select_subprotocol(&mut self, protocol: &str) {
        self.subprotocol = Some(protocol.to_string());
    }

    /// Subprotocol selected during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Send a text frame.
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send_data(Opcode::Text, text.as_bytes())
    }

    /// Send a binary frame.
    pub fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_data(Opcode::Binary, data)
    }

    /// Send a ping; payload is limited to 125 bytes.
    pub fn send_ping(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_control(Opcode::Ping, payload)
    }

    /// Send an unsolicited pong; payload is limited to 125 bytes.
    pub fn send_pong(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_control(Opcode::Pong, payload)
    }

    /// Start an orderly close.
    ///
    /// On an established connection this sends a close frame with the given
    /// code and reason and stops accepting outbound data. During the
    /// handshake it rejects the client with a 400. Idempotent.
    pub fn disconnect(&mut self, code: CloseCode, reason: &str) {
        match self.state {
            ConnState::Established => {
                debug!(conn_id = self.token.0, %code, "closing connection");
                let payload = close::encode_close_payload(Some(code.as_u16()), reason);
                self.queue_frame(&Frame::new(Opcode::Close, payload));
                if self.state == ConnState::Established {
                    self.state = ConnState::Closing;
                }
            }
            ConnState::Handshake => {
                debug!(conn_id = self.token.0, "rejecting connection before upgrade");
                self.queue_raw(handshake::REJECT_RESPONSE);
                self.state = ConnState::Closed;
            }
            ConnState::Closing | ConnState::Closed => {}
        }
    }

    /// Close with the default code 1000 (Normal).
    pub fn close(&mut self) {
        self.disconnect(CloseCode::Normal, "");
    }

    /// Ask the server loop to shut down: stop listening and close every
    /// connection with code 1001 (Going Away). Safe to call from any
    /// handler; idempotent.
    pub fn shutdown_server(&mut self) {
        self.shutdown_requested = true;
    }

    fn send_data(&mut self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        if self.state != ConnState::Established {
            trace!(conn_id = self.token.0, "dropping send on non-established connection");
            return Ok(());
        }
        self.queue_frame(&Frame::new(opcode, payload.to_vec()));
        Ok(())
    }

    fn send_control(&mut self, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        if payload.len() > 125 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control frame payload exceeds 125 bytes",
            ));
        }
        self.send_data(opcode, payload)
    }

    /// Encode a frame into the send buffer and flush what the kernel takes.
    fn queue_frame(&mut self, frame: &Frame) {
        frame.encode_into(&mut self.send_buf);
        self.flush();
    }

    fn queue_raw(&mut self, bytes: &[u8]) {
        self.send_buf.extend_from_slice(bytes);
        self.flush();
    }

    fn flush(&mut self) {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => {
                    self.state = ConnState::Closed;
                    return;
                }
                Ok(n) => self.send_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id = self.token.0, error = %e, "write failed");
                    self.state = ConnState::Closed;
                    return;
                }
            }
        }
    }

    /// True while flushed-but-unwritten bytes remain.
    pub(crate) fn wants_write(&self) -> bool {
        !self.send_buf.is_empty()
    }

    pub(crate) fn take_shutdown_request(&mut self) -> bool {
        std::mem::take(&mut self.shutdown_requested)
    }

    pub(crate) fn take_handshake(&mut self) -> Option<HandshakeRequest> {
        self.handshake.take()
    }

    /// Write the 101 response and open the frame pipeline.
    ///
    /// Returns events for any frames the client pipelined behind its
    /// request head.
    pub(crate) fn finish_handshake(&mut self, request: &HandshakeRequest) -> Vec<ConnEvent> {
        let accept = handshake::accept_key(&request.key);
        let response = handshake::build_accept_response(&accept, self.subprotocol.as_deref());
        self.queue_raw(&response);
        if self.state == ConnState::Handshake {
            self.state = ConnState::Established;
        }
        debug!(
            conn_id = self.token.0,
            peer = %self.peer,
            path = %request.path,
            "handshake complete"
        );
        let mut events = Vec::new();
        self.drain_frames(&mut events);
        events
    }

    /// Read until `WouldBlock` or EOF, advancing the state machine.
    pub(crate) fn drive_readable(&mut self) -> Vec<ConnEvent> {
        let mut events = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.state == ConnState::Closed {
                return events;
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    trace!(conn_id = self.token.0, "peer closed");
                    self.state = ConnState::Closed;
                    events.push(ConnEvent::Dropped);
                    return events;
                }
                Ok(n) => self.ingest(&chunk[..n], &mut events),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn_id = self.token.0, error = %e, "read failed");
                    self.state = ConnState::Closed;
                    events.push(ConnEvent::Dropped);
                    return events;
                }
            }
        }
        events
    }

    /// Flush buffered egress on writable readiness.
    pub(crate) fn drive_writable(&mut self) {
        self.flush();
    }

    fn ingest(&mut self, bytes: &[u8], events: &mut Vec<ConnEvent>) {
        match self.state {
            ConnState::Handshake => {
                if self.handshake.is_some() {
                    // Parsed but not yet answered; anything more is frame
                    // data the client pipelined behind its request.
                    self.parser.push(bytes);
                    return;
                }
                self.ingress.extend_from_slice(bytes);
                if self.ingress.len() > MAX_HANDSHAKE_LEN {
                    warn!(conn_id = self.token.0, peer = %self.peer, "oversized request head");
                    self.queue_raw(handshake::REJECT_RESPONSE);
                    self.state = ConnState::Closed;
                    events.push(ConnEvent::Failed);
                    return;
                }
                let Some(head_end) = handshake::find_head_end(&self.ingress) else {
                    return;
                };
                let head = self.ingress.split_to(head_end);
                match HandshakeRequest::parse(&head) {
                    Ok(request) => {
                        self.handshake = Some(request);
                        let rest = self.ingress.split();
                        if !rest.is_empty() {
                            self.parser.push(&rest);
                        }
                        events.push(ConnEvent::HandshakeParsed);
                    }
                    Err(e) => {
                        warn!(conn_id = self.token.0, peer = %self.peer, error = %e, "bad upgrade request");
                        self.queue_raw(handshake::REJECT_RESPONSE);
                        self.state = ConnState::Closed;
                        events.push(ConnEvent::Failed);
                    }
                }
            }
            ConnState::Established => {
                self.parser.push(bytes);
                self.drain_frames(events);
            }
            // The close exchange is over; any further traffic finalizes
            // the connection and the loop reaps it.
            ConnState::Closing => {
                self.state = ConnState::Closed;
            }
            ConnState::Closed => {}
        }
    }

    fn drain_frames(&mut self, events: &mut Vec<ConnEvent>) {
        while self.state == ConnState::Established {
            match self.parser.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame, events),
                Ok(None) => break,
                Err(e) => {
                    self.protocol_close(&e);
                    events.push(ConnEvent::Failed);
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<ConnEvent>) {
        match frame.opcode {
            Opcode::Ping => {
                // Pong first so it is on the wire before the event fires.
                self.queue_frame(&Frame::new(Opcode::Pong, frame.payload.clone()));
                events.push(ConnEvent::Ping(frame.payload));
            }
            Opcode::Pong => events.push(ConnEvent::Pong(frame.payload)),
            Opcode::Close => match close::parse_close_payload(&frame.payload) {
                Ok((code, reason)) => {
                    let echo = close::encode_close_payload(code, "");
                    self.queue_frame(&Frame::new(Opcode::Close, echo));
                    if self.state == ConnState::Established {
                        self.state = ConnState::Closing;
                    }
                    events.push(ConnEvent::CloseReceived { code, reason });
                }
                Err(e) => {
                    self.protocol_close(&e);
                    events.push(ConnEvent::Failed);
                }
            },
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                match self.assembler.push_frame(frame) {
                    Ok(Some(Message::Text(text))) => events.push(ConnEvent::Text(text)),
                    Ok(Some(Message::Binary(data))) => events.push(ConnEvent::Binary(data)),
                    Ok(None) => {}
                    Err(e) => {
                        self.protocol_close(&e);
                        events.push(ConnEvent::Failed);
                    }
                }
            }
        }
    }

    fn protocol_close(&mut self, error: &ProtocolError) {
        warn!(
            conn_id = self.token.0,
            peer = %self.peer,
            error = %error,
            "protocol violation"
        );
        let payload = close::encode_close_payload(Some(error.close_code().as_u16()), "");
        self.queue_frame(&Frame::new(Opcode::Close, payload));
        if self.state != ConnState::Closed {
            self.state = ConnState::Closing;
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)?;
        self.registered_interest = Some(Interest::READABLE);
        Ok(())
    }

    /// Keep the readiness interest in sync with pending egress.
    pub(crate) fn update_registration(&mut self, registry: &Registry) -> io::Result<()> {
        let want = if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if self.registered_interest != Some(want) {
            registry.reregister(&mut self.stream, self.token, want)?;
            self.registered_interest = Some(want);
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.token.0)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
