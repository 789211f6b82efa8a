//! WebSocket wire protocol: frame codec, handshake codec, close codes.
//!
//! Everything in this module is pure byte-buffer manipulation with explicit
//! state and no I/O, so the server loop can feed it whatever `read()`
//! returned without caring about message boundaries.

pub mod close;
pub mod frame;
pub mod handshake;

pub use close::CloseCode;
pub use frame::{Frame, FrameParser, Message, MessageAssembler, Opcode};
pub use handshake::HandshakeRequest;

use std::fmt;

/// Protocol violations detected while decoding client frames.
///
/// Each variant maps to the close code the connection sends before
/// transitioning to `Closing` (see [`ProtocolError::close_code`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Client frame arrived with the MASK bit clear.
    UnmaskedFrame,
    /// RSV1-3 set without a negotiated extension.
    ReservedBits(u8),
    /// Opcode outside the supported set.
    UnknownOpcode(u8),
    /// Control frame with FIN=0.
    FragmentedControl(Opcode),
    /// Control frame declaring a payload longer than 125 bytes.
    OversizedControl,
    /// Continuation frame with no fragmented message in progress.
    UnexpectedContinuation,
    /// New data frame while another fragmented message is in progress.
    MessageInProgress,
    /// 64-bit payload length with the top bit set.
    InvalidLength(u64),
    /// Close frame with a one-byte payload.
    InvalidCloseFrame,
    /// Text payload (or close reason) that is not valid UTF-8.
    InvalidUtf8,
    /// Frame or assembled message above the configured cap.
    MessageTooBig { size: u64, limit: u64 },
}

impl ProtocolError {
    /// Close code sent to the peer for this violation.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            ProtocolError::MessageTooBig { .. } => CloseCode::TooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmaskedFrame => write!(f, "unmasked frame from client"),
            Self::ReservedBits(bits) => write!(f, "reserved bits set: {bits:#x}"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode: {op:#x}"),
            Self::FragmentedControl(op) => write!(f, "fragmented control frame: {op:?}"),
            Self::OversizedControl => write!(f, "control frame payload exceeds 125 bytes"),
            Self::UnexpectedContinuation => {
                write!(f, "continuation frame without a message in progress")
            }
            Self::MessageInProgress => {
                write!(f, "new data frame while a fragmented message is in progress")
            }
            Self::InvalidLength(len) => write!(f, "invalid 64-bit payload length: {len}"),
            Self::InvalidCloseFrame => write!(f, "close frame with a one-byte payload"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in text payload"),
            Self::MessageTooBig { size, limit } => {
                write!(f, "message too big: {size} bytes (limit {limit})")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(
            ProtocolError::UnmaskedFrame.close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(
            ProtocolError::InvalidUtf8.close_code(),
            CloseCode::InvalidPayload
        );
        assert_eq!(
            ProtocolError::MessageTooBig {
                size: 100,
                limit: 10
            }
            .close_code(),
            CloseCode::TooBig
        );
    }
}
