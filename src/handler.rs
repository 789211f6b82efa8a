//! Per-connection event handlers.
//!
//! Connection behavior is a closed set of events expressed as one trait
//! method each. The server holds a [`Factory`] and asks it for a fresh
//! handler whenever a socket is accepted; that call is the "connect" event.

use std::error::Error;

use crate::connection::Connection;
use crate::protocol::handshake::HandshakeRequest;

/// Result of a handler method.
///
/// An `Err` is contained to the connection that produced it: the server
/// logs it and closes that connection with code 1011, leaving the rest of
/// the loop untouched.
pub type HandlerResult = Result<(), Box<dyn Error>>;

/// Event sink for one connection. All methods default to no-ops.
///
/// Methods run synchronously on the server loop thread and may write to
/// their own connection freely; they must not block unboundedly.
pub trait ConnectionHandler {
    /// The client's upgrade request parsed, before the 101 response is
    /// written. Inspect the origin or requested subprotocols here; call
    /// [`Connection::select_subprotocol`] to answer one, or
    /// [`Connection::disconnect`] to reject the client.
    fn on_handshake(&mut self, conn: &mut Connection, request: &HandshakeRequest) -> HandlerResult {
        let _ = (conn, request);
        Ok(())
    }

    /// The 101 response has been written; the connection can send frames.
    fn on_ready(&mut self, conn: &mut Connection) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// A complete text message arrived.
    fn on_text(&mut self, conn: &mut Connection, text: &str) -> HandlerResult {
        let _ = (conn, text);
        Ok(())
    }

    /// A complete binary message arrived.
    fn on_binary(&mut self, conn: &mut Connection, data: &[u8]) -> HandlerResult {
        let _ = (conn, data);
        Ok(())
    }

    /// A ping arrived; the matching pong has already been queued.
    fn on_ping(&mut self, conn: &mut Connection, payload: &[u8]) -> HandlerResult {
        let _ = (conn, payload);
        Ok(())
    }

    /// A pong arrived.
    fn on_pong(&mut self, conn: &mut Connection, payload: &[u8]) -> HandlerResult {
        let _ = (conn, payload);
        Ok(())
    }

    /// The connection is going away. Fired exactly once per accepted
    /// socket; `code` and `reason` are present only for a clean close
    /// initiated by the peer.
    fn on_disconnect(
        &mut self,
        conn: &mut Connection,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> HandlerResult {
        let _ = (conn, code, reason);
        Ok(())
    }
}

/// Builds one handler per accepted connection.
///
/// Invoked after `accept`, before any bytes are read; this is the
/// connection's "connect" event.
pub trait Factory {
    type Handler: ConnectionHandler;

    fn on_connect(&mut self, conn: &mut Connection) -> Self::Handler;
}

impl<F, H> Factory for F
where
    F: FnMut(&mut Connection) -> H,
    H: ConnectionHandler,
{
    type Handler = H;

    fn on_connect(&mut self, conn: &mut Connection) -> H {
        self(conn)
    }
}
