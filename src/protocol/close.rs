//! Close status codes and close-frame payload encoding (RFC 6455 §7.4).

use super::ProtocolError;

/// Close status code carried in the first two bytes of a close payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal,
    /// Endpoint going away (1001).
    GoingAway,
    /// Protocol error (1002).
    ProtocolError,
    /// Unsupported data type (1003).
    UnsupportedData,
    /// No status code present (1005); never sent on the wire.
    NoStatus,
    /// Abnormal closure (1006); never sent on the wire.
    Abnormal,
    /// Invalid frame payload data (1007).
    InvalidPayload,
    /// Policy violation (1008).
    PolicyViolation,
    /// Message too big (1009).
    TooBig,
    /// Missing expected extension (1010).
    MandatoryExtension,
    /// Internal server error (1011).
    InternalError,
    /// Application-defined code in the 3000-4999 range; passed through unaltered.
    Application(u16),
    /// Any other registered or unassigned code.
    Other(u16),
}

impl CloseCode {
    /// The 2-byte wire representation.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::TooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::Application(code) => code,
            Self::Other(code) => code,
        }
    }

    /// Parse a 2-byte wire value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::TooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            3000..=4999 => Self::Application(code),
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Longest reason that still fits a control frame next to the 2-byte code.
const MAX_REASON_LEN: usize = 123;

/// Decode a close payload into `(code, reason)`.
///
/// An empty payload carries neither; a one-byte payload is malformed; the
/// reason, if present, must be valid UTF-8.
pub fn parse_close_payload(
    payload: &[u8],
) -> Result<(Option<u16>, Option<String>), ProtocolError> {
    match payload.len() {
        0 => Ok((None, None)),
        1 => Err(ProtocolError::InvalidCloseFrame),
        2 => Ok((Some(u16::from_be_bytes([payload[0], payload[1]])), None)),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            Ok((Some(code), Some(reason)))
        }
    }
}

/// Encode a close payload: big-endian code followed by a UTF-8 reason.
///
/// The reason is truncated at a character boundary so the whole payload
/// stays within the 125-byte control-frame limit.
pub fn encode_close_payload(code: Option<u16>, reason: &str) -> Vec<u8> {
    let Some(code) = code else {
        return Vec::new();
    };
    let mut end = reason.len().min(MAX_REASON_LEN);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_named_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011] {
            assert_eq!(CloseCode::from_u16(code).as_u16(), code);
        }
    }

    #[test]
    fn test_application_codes_pass_through() {
        assert_eq!(CloseCode::from_u16(4242), CloseCode::Application(4242));
        assert_eq!(CloseCode::Application(4242).as_u16(), 4242);
        assert_eq!(CloseCode::from_u16(2999), CloseCode::Other(2999));
    }

    #[test]
    fn test_parse_empty_payload() {
        assert_eq!(parse_close_payload(b"").unwrap(), (None, None));
    }

    #[test]
    fn test_parse_one_byte_payload_is_malformed() {
        assert!(matches!(
            parse_close_payload(&[0x03]),
            Err(ProtocolError::InvalidCloseFrame)
        ));
    }

    #[test]
    fn test_parse_code_and_reason() {
        let mut payload = 4242u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"test server shutdown cleanly");
        let (code, reason) = parse_close_payload(&payload).unwrap();
        assert_eq!(code, Some(4242));
        assert_eq!(reason.as_deref(), Some("test server shutdown cleanly"));
    }

    #[test]
    fn test_parse_invalid_utf8_reason() {
        let payload = [0x03, 0xe8, 0xff, 0xfe];
        assert!(matches!(
            parse_close_payload(&payload),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_encode_truncates_long_reason() {
        let reason = "x".repeat(200);
        let payload = encode_close_payload(Some(1000), &reason);
        assert_eq!(payload.len(), 125);
    }

    #[test]
    fn test_encode_respects_char_boundary() {
        // A multi-byte character straddling the cut point is dropped whole.
        let reason = format!("{}é", "x".repeat(122));
        let payload = encode_close_payload(Some(1000), &reason);
        assert_eq!(&payload[2..], "x".repeat(122).as_bytes());
    }

    #[test]
    fn test_encode_no_code() {
        assert!(encode_close_payload(None, "ignored").is_empty());
    }
}
