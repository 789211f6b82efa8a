//! grow-a-socket: a minimal WebSocket echo server.
//!
//! Accepts RFC 6455 WebSocket connections and echoes text and binary
//! messages back to the sender. Configuration via CLI arguments or a TOML
//! file.

use grow_a_socket::config::Config;
use grow_a_socket::{Connection, ConnectionHandler, HandlerResult, Server};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn on_ready(&mut self, conn: &mut Connection) -> HandlerResult {
        debug!(conn_id = conn.id(), peer = %conn.peer_addr(), "session ready");
        Ok(())
    }

    fn on_text(&mut self, conn: &mut Connection, text: &str) -> HandlerResult {
        conn.send_text(text)?;
        Ok(())
    }

    fn on_binary(&mut self, conn: &mut Connection, data: &[u8]) -> HandlerResult {
        conn.send_binary(data)?;
        Ok(())
    }

    fn on_disconnect(
        &mut self,
        conn: &mut Connection,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> HandlerResult {
        debug!(
            conn_id = conn.id(),
            code = code.unwrap_or(1005),
            reason = reason.unwrap_or(""),
            "session closed"
        );
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        silence_max = config.silence_max,
        "Starting grow-a-socket server"
    );

    let mut server = Server::bind(config.server_config(), |conn: &mut Connection| {
        debug!(conn_id = conn.id(), peer = %conn.peer_addr(), "client connected");
        EchoHandler
    })?;
    server.run()?;
    Ok(())
}
