//! socket.io v0.9 packet codec
//!
//! One packet per text frame: `type:id:endpoint:data`. The id and endpoint
//! are optional but their colons stay, e.g. `4::/icbit:{"a":1}`. Trailing
//! fields may be cut off entirely (`2::`, `0::/icbit`).

use crate::protocols::{ProtocolError, Result};

/// Packet type digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Disconnect = 0,
    Connect = 1,
    Heartbeat = 2,
    Message = 3,
    Json = 4,
    Event = 5,
    Ack = 6,
    Error = 7,
    Noop = 8,
}

impl PacketType {
    #[inline]
    pub const fn as_char(&self) -> char {
        (b'0' + *self as u8) as char
    }

    #[inline]
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '0' => PacketType::Disconnect,
            '1' => PacketType::Connect,
            '2' => PacketType::Heartbeat,
            '3' => PacketType::Message,
            '4' => PacketType::Json,
            '5' => PacketType::Event,
            '6' => PacketType::Ack,
            '7' => PacketType::Error,
            '8' => PacketType::Noop,
            _ => return None,
        })
    }
}

/// Id, endpoint and payload shared by the data-carrying packet types
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub id: Option<u64>,
    pub endpoint: Option<String>,
    pub data: String,
}

impl Envelope {
    /// `<id>[+<args>]` payload of an Ack packet
    pub fn ack_parts(&self) -> Option<(u64, Option<&str>)> {
        let (id, args) = match self.data.split_once('+') {
            Some((id, args)) => (id, Some(args)),
            None => (self.data.as_str(), None),
        };
        id.parse().ok().map(|id| (id, args))
    }

    /// `<reason>[+<advice>]` payload of an Error packet
    pub fn error_parts(&self) -> (&str, Option<&str>) {
        match self.data.split_once('+') {
            Some((reason, advice)) => (reason, Some(advice)),
            None => (self.data.as_str(), None),
        }
    }
}

/// Decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Disconnect { endpoint: Option<String> },
    Connect { endpoint: Option<String>, query: Option<String> },
    Heartbeat,
    Message(Envelope),
    Json(Envelope),
    Event(Envelope),
    Ack(Envelope),
    Error(Envelope),
    Noop,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Disconnect { .. } => PacketType::Disconnect,
            Packet::Connect { .. } => PacketType::Connect,
            Packet::Heartbeat => PacketType::Heartbeat,
            Packet::Message(_) => PacketType::Message,
            Packet::Json(_) => PacketType::Json,
            Packet::Event(_) => PacketType::Event,
            Packet::Ack(_) => PacketType::Ack,
            Packet::Error(_) => PacketType::Error,
            Packet::Noop => PacketType::Noop,
        }
    }
}

/// Build `type:id:endpoint[:data]`
pub fn encode_packet(
    kind: PacketType,
    id: Option<u64>,
    endpoint: Option<&str>,
    data: Option<&str>,
) -> String {
    let id = id.map(|id| id.to_string()).unwrap_or_default();
    write_packet(kind, &id, endpoint, data)
}

/// Same as `encode_packet` with the id marked `<id>+`, asking the peer to
/// answer with an Ack carrying data.
pub fn encode_request(kind: PacketType, id: u64, endpoint: Option<&str>, data: &str) -> String {
    write_packet(kind, &format!("{id}+"), endpoint, Some(data))
}

fn write_packet(kind: PacketType, id: &str, endpoint: Option<&str>, data: Option<&str>) -> String {
    let endpoint = endpoint.unwrap_or_default();
    let mut line = String::with_capacity(4 + id.len() + endpoint.len() + data.map_or(0, str::len));
    line.push(kind.as_char());
    line.push(':');
    line.push_str(id);
    line.push(':');
    line.push_str(endpoint);
    if let Some(data) = data {
        line.push(':');
        line.push_str(data);
    }
    line
}

/// `0::<endpoint>`
pub fn disconnect(endpoint: Option<&str>) -> String {
    encode_packet(PacketType::Disconnect, None, endpoint, None)
}

/// `1::<path>[?<query>]`
pub fn connect(path: Option<&str>, query: Option<&str>) -> String {
    let mut target = path.unwrap_or_default().to_string();
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query.trim_start_matches('?'));
    }
    encode_packet(PacketType::Connect, None, Some(&target), None)
}

/// `2::`
pub fn heartbeat() -> String {
    encode_packet(PacketType::Heartbeat, None, None, None)
}

/// `6:::<id>[+<args>]`
pub fn ack(id: u64, args: Option<&str>) -> String {
    let data = match args {
        Some(args) => format!("{id}+{args}"),
        None => id.to_string(),
    };
    encode_packet(PacketType::Ack, None, None, Some(&data))
}

/// `7::<endpoint>:<reason>[+<advice>]`
pub fn error(reason: &str, advice: Option<&str>, endpoint: Option<&str>) -> String {
    let data = match advice {
        Some(advice) => format!("{reason}+{advice}"),
        None => reason.to_string(),
    };
    encode_packet(PacketType::Error, None, endpoint, Some(&data))
}

/// `8::`
pub fn noop() -> String {
    encode_packet(PacketType::Noop, None, None, None)
}

/// Parse one packet line
pub fn decode_packet(line: &str) -> Result<Packet> {
    let first = line
        .chars()
        .next()
        .ok_or_else(|| ProtocolError::MalformedPacket("empty packet".into()))?;
    let kind = PacketType::from_char(first).ok_or(ProtocolError::UnknownPacketType(first))?;

    let mut fields = line.splitn(4, ':');
    let _type = fields.next();
    if line.len() > 1 && line.as_bytes()[1] != b':' {
        return Err(ProtocolError::MalformedPacket(line.to_string()));
    }
    let id = parse_id(fields.next().unwrap_or_default(), line)?;
    let endpoint = fields.next().filter(|e| !e.is_empty()).map(str::to_string);
    let data = fields.next().unwrap_or_default().to_string();

    Ok(match kind {
        PacketType::Disconnect => Packet::Disconnect { endpoint },
        PacketType::Connect => {
            let (endpoint, query) = match endpoint {
                Some(target) => match target.split_once('?') {
                    Some((path, query)) => (
                        Some(path.to_string()).filter(|p| !p.is_empty()),
                        Some(query.to_string()),
                    ),
                    None => (Some(target), None),
                },
                None => (None, None),
            };
            Packet::Connect { endpoint, query }
        }
        PacketType::Heartbeat => Packet::Heartbeat,
        PacketType::Noop => Packet::Noop,
        PacketType::Message => Packet::Message(Envelope { id, endpoint, data }),
        PacketType::Json => Packet::Json(Envelope { id, endpoint, data }),
        PacketType::Event => Packet::Event(Envelope { id, endpoint, data }),
        PacketType::Ack => Packet::Ack(Envelope { id, endpoint, data }),
        PacketType::Error => Packet::Error(Envelope { id, endpoint, data }),
    })
}

/// Message id field; `12+` (ack with data requested) reads as 12
fn parse_id(field: &str, line: &str) -> Result<Option<u64>> {
    let digits = field.strip_suffix('+').unwrap_or(field);
    if digits.is_empty() {
        return Ok(None);
    }
    digits
        .parse()
        .map(Some)
        .map_err(|_| ProtocolError::MalformedPacket(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_without_id() {
        let line = encode_packet(PacketType::Json, None, Some("/icbit"), Some(r#"{"a":1}"#));
        assert_eq!(line, r#"4::/icbit:{"a":1}"#);

        match decode_packet(&line).unwrap() {
            Packet::Json(env) => {
                assert_eq!(env.id, None);
                assert_eq!(env.endpoint.as_deref(), Some("/icbit"));
                assert_eq!(env.data, r#"{"a":1}"#);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_data_may_contain_colons() {
        let packet = decode_packet(r#"3:7::time:12:30"#).unwrap();
        assert_eq!(
            packet,
            Packet::Message(Envelope {
                id: Some(7),
                endpoint: None,
                data: "time:12:30".into(),
            })
        );
    }

    #[test]
    fn test_id_with_plus() {
        let packet = decode_packet("5:3+::{\"name\":\"x\"}").unwrap();
        match packet {
            Packet::Event(env) => assert_eq!(env.id, Some(3)),
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(
            encode_request(PacketType::Json, 3, Some("/icbit"), "{}"),
            "4:3+:/icbit:{}"
        );
    }

    #[test]
    fn test_short_packets() {
        assert_eq!(decode_packet("2::").unwrap(), Packet::Heartbeat);
        assert_eq!(decode_packet("8::").unwrap(), Packet::Noop);
        assert_eq!(decode_packet("2").unwrap(), Packet::Heartbeat);
        assert_eq!(
            decode_packet("0::/icbit").unwrap(),
            Packet::Disconnect {
                endpoint: Some("/icbit".into())
            }
        );
        assert_eq!(
            decode_packet("1::").unwrap(),
            Packet::Connect {
                endpoint: None,
                query: None
            }
        );
    }

    #[test]
    fn test_connect_with_query() {
        assert_eq!(connect(Some("/icbit"), Some("key=1")), "1::/icbit?key=1");
        assert_eq!(
            decode_packet("1::/icbit?key=1").unwrap(),
            Packet::Connect {
                endpoint: Some("/icbit".into()),
                query: Some("key=1".into())
            }
        );
    }

    #[test]
    fn test_ack_and_error_parts() {
        assert_eq!(ack(12, Some(r#"["ok"]"#)), r#"6:::12+["ok"]"#);
        assert_eq!(ack(12, None), "6:::12");

        match decode_packet(r#"6:::12+["ok"]"#).unwrap() {
            Packet::Ack(env) => assert_eq!(env.ack_parts(), Some((12, Some(r#"["ok"]"#)))),
            other => panic!("unexpected packet {:?}", other),
        }

        assert_eq!(error("unauthorized", Some("reconnect"), Some("/icbit")), "7::/icbit:unauthorized+reconnect");
        match decode_packet("7::/icbit:unauthorized+reconnect").unwrap() {
            Packet::Error(env) => {
                assert_eq!(env.error_parts(), ("unauthorized", Some("reconnect")))
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_builders() {
        assert_eq!(heartbeat(), "2::");
        assert_eq!(noop(), "8::");
        assert_eq!(disconnect(None), "0::");
        assert_eq!(disconnect(Some("/icbit")), "0::/icbit");
        assert_eq!(
            encode_packet(PacketType::Message, Some(5), None, Some("hi")),
            "3:5::hi"
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_packet(""),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_packet("9::"),
            Err(ProtocolError::UnknownPacketType('9'))
        ));
        assert!(matches!(
            decode_packet("4:abc::{}"),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert!(matches!(
            decode_packet("42::"),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_packet_type_chars() {
        for c in '0'..='8' {
            let kind = PacketType::from_char(c).unwrap();
            assert_eq!(kind.as_char(), c);
        }
        assert!(PacketType::from_char('x').is_none());
    }
}
