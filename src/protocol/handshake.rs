//! HTTP upgrade handshake (RFC 6455 §4).
//!
//! Parses the client's `GET` + `Upgrade: websocket` request head and builds
//! the `101 Switching Protocols` response with the computed
//! `Sec-WebSocket-Accept` value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// GUID mixed into the accept-key digest (RFC 6455 §4.2.2).
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
const WS_VERSION: &str = "13";

/// Response written when the upgrade request is unacceptable.
pub const REJECT_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// A parsed, validated upgrade request.
///
/// Held by the connection between parsing and the 101 response so the
/// handshake callback can inspect origin and requested subprotocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request path.
    pub path: String,
    /// Host header.
    pub host: Option<String>,
    /// Origin header.
    pub origin: Option<String>,
    /// Raw `Sec-WebSocket-Key` value.
    pub key: String,
    /// Requested subprotocols, in preference order.
    pub protocols: Vec<String>,
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Look up any request header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse a complete request head (request line through the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(head).map_err(|_| HandshakeError::InvalidEncoding)?;
        let mut lines = text.lines();

        let request_line = lines.next().ok_or(HandshakeError::BadRequestLine)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(HandshakeError::BadRequestLine)?;
        let path = parts.next().ok_or(HandshakeError::BadRequestLine)?;
        let version = parts.next().ok_or(HandshakeError::BadRequestLine)?;
        if method != "GET" || version != "HTTP/1.1" {
            return Err(HandshakeError::BadRequestLine);
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(HandshakeError::MalformedHeader)?;
            headers.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }

        let upgrade = headers
            .get("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.to_ascii_lowercase().contains("websocket") {
            return Err(HandshakeError::NotAnUpgrade);
        }
        let connection = headers
            .get("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !connection.to_ascii_lowercase().contains("upgrade") {
            return Err(HandshakeError::NotAnUpgrade);
        }
        let version = headers
            .get("sec-websocket-version")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
        if version != WS_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version.clone()));
        }
        let key = headers
            .get("sec-websocket-key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?
            .clone();
        match BASE64.decode(key.trim()) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::InvalidKey),
        }

        let protocols = headers
            .get("sec-websocket-protocol")
            .map(|value| {
                value
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(HandshakeRequest {
            path: path.to_string(),
            host: headers.get("host").cloned(),
            origin: headers.get("origin").cloned(),
            key,
            protocols,
            headers,
        })
    }
}

/// Index just past the `\r\n\r\n` terminating the request head, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response.
pub fn build_accept_response(accept: &str, subprotocol: Option<&str>) -> Vec<u8> {
    let mut response = String::with_capacity(160);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(accept);
    response.push_str("\r\n");
    if let Some(protocol) = subprotocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}

/// Upgrade request validation failures; all answered with a 400.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    InvalidEncoding,
    BadRequestLine,
    MalformedHeader,
    NotAnUpgrade,
    MissingHeader(&'static str),
    UnsupportedVersion(String),
    InvalidKey,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "request head is not valid UTF-8"),
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::MalformedHeader => write!(f, "malformed header line"),
            Self::NotAnUpgrade => write!(f, "not a websocket upgrade request"),
            Self::MissingHeader(name) => write!(f, "missing header: {name}"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported websocket version: {version}")
            }
            Self::InvalidKey => write!(f, "invalid Sec-WebSocket-Key"),
        }
    }
}

impl std::error::Error for HandshakeError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_sample_request() {
        let request = HandshakeRequest::parse(SAMPLE_REQUEST.as_bytes()).unwrap();
        assert_eq!(request.path, "/chat");
        assert_eq!(request.host.as_deref(), Some("server.example.com"));
        assert_eq!(request.origin.as_deref(), Some("http://example.com"));
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(request.protocols, ["chat", "superchat"]);
        assert_eq!(request.header("HOST"), Some("server.example.com"));
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let head = SAMPLE_REQUEST.replace("Upgrade:", "UPGRADE:");
        assert!(HandshakeRequest::parse(head.as_bytes()).is_ok());
    }

    #[test]
    fn test_rejects_missing_key() {
        let head = SAMPLE_REQUEST.replace("Sec-WebSocket-Key", "X-Key");
        assert_eq!(
            HandshakeRequest::parse(head.as_bytes()),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        );
    }

    #[test]
    fn test_rejects_short_key() {
        let head = SAMPLE_REQUEST.replace("dGhlIHNhbXBsZSBub25jZQ==", "c2hvcnQ=");
        assert_eq!(
            HandshakeRequest::parse(head.as_bytes()),
            Err(HandshakeError::InvalidKey)
        );
    }

    #[test]
    fn test_rejects_wrong_version() {
        let head = SAMPLE_REQUEST.replace("Version: 13", "Version: 8");
        assert_eq!(
            HandshakeRequest::parse(head.as_bytes()),
            Err(HandshakeError::UnsupportedVersion("8".to_string()))
        );
    }

    #[test]
    fn test_rejects_plain_get() {
        let head = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(
            HandshakeRequest::parse(head.as_bytes()),
            Err(HandshakeError::MissingHeader("Upgrade"))
        );
    }

    #[test]
    fn test_rejects_post() {
        let head = SAMPLE_REQUEST.replace("GET", "POST");
        assert_eq!(
            HandshakeRequest::parse(head.as_bytes()),
            Err(HandshakeError::BadRequestLine)
        );
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nextra"), Some(18));
    }

    #[test]
    fn test_accept_response_shape() {
        let response = build_accept_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=", None);
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_accept_response_with_subprotocol() {
        let response = build_accept_response("abc=", Some("chat"));
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
    }
}
