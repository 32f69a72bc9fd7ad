//! WebSocket frame types
//!
//! Plain data carried between the codec and the transport socket.
//! Only final (FIN) frames exist here; continuation frames are rejected
//! by the decoder before a `Frame` is ever built.

use bytes::Bytes;

use crate::ws::WebSocketError;

/// 4-bit frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Control frames (close/ping/pong) carry at most 125 payload bytes
    #[inline(always)]
    pub const fn is_control(&self) -> bool {
        (*self as u8) & 0x8 != 0
    }

    #[inline(always)]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Values above 15 do not fit the opcode nibble (`InvalidOpcode`);
    /// reserved nibbles 0x3-0x7 and 0xB-0xF are `UnknownOpcode`.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            v if v > 0x0F => Err(WebSocketError::InvalidOpcode(v)),
            v => Err(WebSocketError::UnknownOpcode(v)),
        }
    }
}

/// Close status code carried in the first two bytes of a Close payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    InvalidData,
    PolicyViolation,
    MessageTooBig,
    ServerError,
    TlsHandshake,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1007 => CloseCode::InvalidData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1011 => CloseCode::ServerError,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::InvalidData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::ServerError => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(other) => other,
        }
    }
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    #[inline]
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Split a Close payload into its status code and trailing data.
    ///
    /// Fewer than two payload bytes means no code was sent; that reads as
    /// `Normal` with empty data.
    pub fn close_parts(&self) -> (CloseCode, Bytes) {
        if self.payload.len() < 2 {
            return (CloseCode::Normal, Bytes::new());
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        (CloseCode::from(code), self.payload.slice(2..))
    }
}

/// Build a Close payload: big-endian status code followed by optional data
pub fn close_payload(code: CloseCode, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_try_from() {
        assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::try_from(0xA).unwrap(), OpCode::Pong);
        assert!(matches!(
            OpCode::try_from(0x3),
            Err(WebSocketError::UnknownOpcode(0x3))
        ));
        assert!(matches!(
            OpCode::try_from(0x10),
            Err(WebSocketError::InvalidOpcode(0x10))
        ));
    }

    #[test]
    fn test_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_close_code_conversion() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(4001), CloseCode::Other(4001));
        assert_eq!(u16::from(CloseCode::GoingAway), 1001);
        assert_eq!(u16::from(CloseCode::Other(3000)), 3000);
    }

    #[test]
    fn test_close_parts() {
        let frame = Frame::new(OpCode::Close, close_payload(CloseCode::GoingAway, b"bye"));
        let (code, data) = frame.close_parts();
        assert_eq!(code, CloseCode::GoingAway);
        assert_eq!(&data[..], b"bye");

        let empty = Frame::new(OpCode::Close, Bytes::new());
        assert_eq!(empty.close_parts(), (CloseCode::Normal, Bytes::new()));
    }
}
