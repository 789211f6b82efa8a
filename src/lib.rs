//! grow-a-socket: a minimal RFC 6455 WebSocket server.
//!
//! A single-threaded readiness loop accepts TCP connections, performs the
//! WebSocket opening handshake, multiplexes many concurrent clients,
//! parses and emits frames, pings idle connections, and dispatches
//! per-connection events to a user-provided [`ConnectionHandler`].
//!
//! # Example
//!
//! ```no_run
//! use grow_a_socket::{
//!     Connection, ConnectionHandler, HandlerResult, Listen, Server, ServerConfig,
//! };
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_text(&mut self, conn: &mut Connection, text: &str) -> HandlerResult {
//!         conn.send_text(text)?;
//!         Ok(())
//!     }
//! }
//!
//! let config = ServerConfig {
//!     listen: Listen::Port(8080),
//!     ..Default::default()
//! };
//! let mut server = Server::bind(config, |_conn: &mut Connection| Echo).unwrap();
//! server.run().unwrap();
//! ```

pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

pub use connection::{ConnState, Connection};
pub use handler::{ConnectionHandler, Factory, HandlerResult};
pub use protocol::close::CloseCode;
pub use protocol::handshake::HandshakeRequest;
pub use server::{Listen, Server, ServerConfig, ServerError};
