//! Wire protocol types for host-worker communication.
//!
//! One channel (loopback TCP) carries both directions:
//! - **Host → worker**: StartTransport, StopTransport, Send
//! - **Worker → host**: ConnectionEstablished, Send
//!
//! On the wire each message is a flat record keyed by a numeric `Header`,
//! with `ConnectionId`/`Body` present only for the variants that carry them.
//! In Rust the record is a sum type so malformed combinations can't be built.

use serde::{Deserialize, Serialize};

/// Identifier the worker assigns to a remote peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag identifying a message variant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Header {
    StartTransport = 1,
    StopTransport = 2,
    Send = 3,
    ConnectionEstablished = 4,
}

impl Header {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Header {
    type Error = MalformedMessage;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::StartTransport),
            2 => Ok(Self::StopTransport),
            3 => Ok(Self::Send),
            4 => Ok(Self::ConnectionEstablished),
            other => Err(MalformedMessage::new(format!("unknown header {other}"))),
        }
    }
}

impl std::fmt::Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartTransport => "StartTransport",
            Self::StopTransport => "StopTransport",
            Self::Send => "Send",
            Self::ConnectionEstablished => "ConnectionEstablished",
        };
        f.write_str(name)
    }
}

/// Unit of IPC exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    /// Begin accepting/serving remote transport connections.
    StartTransport,

    /// Cease serving.
    StopTransport,

    /// Opaque payload addressed to/from a remote connection.
    Send {
        connection_id: ConnectionId,
        body: Vec<u8>,
    },

    /// The worker accepted a remote peer under this identifier.
    ConnectionEstablished { connection_id: ConnectionId },
}

impl Message {
    pub fn send(connection_id: impl Into<ConnectionId>, body: impl Into<Vec<u8>>) -> Self {
        Self::Send {
            connection_id: connection_id.into(),
            body: body.into(),
        }
    }

    pub fn connection_established(connection_id: impl Into<ConnectionId>) -> Self {
        Self::ConnectionEstablished {
            connection_id: connection_id.into(),
        }
    }

    pub fn header(&self) -> Header {
        match self {
            Self::StartTransport => Header::StartTransport,
            Self::StopTransport => Header::StopTransport,
            Self::Send { .. } => Header::Send,
            Self::ConnectionEstablished { .. } => Header::ConnectionEstablished,
        }
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Send { connection_id, .. } | Self::ConnectionEstablished { connection_id } => {
                Some(*connection_id)
            }
            Self::StartTransport | Self::StopTransport => None,
        }
    }
}

/// Input was not a well-formed encoding of any known message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed message: {reason}")]
pub struct MalformedMessage {
    reason: String,
}

impl MalformedMessage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Flat record as it appears on the wire.
///
/// Extra fields on payload-less variants are ignored so senders that
/// always write every field still decode.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    header: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "body_base64")]
    body: Option<Vec<u8>>,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let header = message.header().code();
        match message {
            Message::StartTransport | Message::StopTransport => Self {
                header,
                connection_id: None,
                body: None,
            },
            Message::Send {
                connection_id,
                body,
            } => Self {
                header,
                connection_id: Some(connection_id.get()),
                body: Some(body),
            },
            Message::ConnectionEstablished { connection_id } => Self {
                header,
                connection_id: Some(connection_id.get()),
                body: None,
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = MalformedMessage;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let header = Header::try_from(wire.header)?;
        let require_id = || {
            wire.connection_id
                .map(ConnectionId)
                .ok_or_else(|| MalformedMessage::new(format!("{header} without ConnectionId")))
        };

        match header {
            Header::StartTransport => Ok(Self::StartTransport),
            Header::StopTransport => Ok(Self::StopTransport),
            Header::ConnectionEstablished => Ok(Self::ConnectionEstablished {
                connection_id: require_id()?,
            }),
            Header::Send => {
                let connection_id = require_id()?;
                let body = wire
                    .body
                    .ok_or_else(|| MalformedMessage::new("Send without Body"))?;
                Ok(Self::Send {
                    connection_id,
                    body,
                })
            }
        }
    }
}

/// Byte bodies travel as base64 strings, matching how the host's JSON
/// serializer writes byte arrays.
mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        body: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| BASE64.decode(encoded).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_transport_wire_format() {
        insta::assert_json_snapshot!(Message::StartTransport);
    }

    #[test]
    fn stop_transport_wire_format() {
        insta::assert_json_snapshot!(Message::StopTransport);
    }

    #[test]
    fn send_wire_format() {
        insta::assert_json_snapshot!(Message::send(42, vec![1u8, 2, 3]));
    }

    #[test]
    fn connection_established_wire_format() {
        insta::assert_json_snapshot!(Message::connection_established(42));
    }

    #[test]
    fn header_codes_match_wire_tags() {
        assert_eq!(Header::StartTransport.code(), 1);
        assert_eq!(Header::StopTransport.code(), 2);
        assert_eq!(Header::Send.code(), 3);
        assert_eq!(Header::ConnectionEstablished.code(), 4);
        for code in 1..=4u8 {
            assert_eq!(Header::try_from(code).unwrap().code(), code);
        }
        assert!(Header::try_from(0).is_err());
        assert!(Header::try_from(5).is_err());
    }

    #[test]
    fn every_variant_survives_serde() {
        let messages = [
            Message::StartTransport,
            Message::StopTransport,
            Message::send(7, Vec::new()),
            Message::send(u64::MAX, vec![0xff; 64]),
            Message::connection_established(0),
        ];
        for message in messages {
            let json = serde_json::to_string(&message).unwrap();
            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn flat_record_with_unused_fields_decodes() {
        // Payload fields serialized regardless of variant.
        let value = json!({"Header": 1, "ConnectionId": 0, "Body": null});
        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, Message::StartTransport);

        let value = json!({"Header": 4, "ConnectionId": 9, "Body": null});
        let parsed: Message = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, Message::connection_established(9));
    }

    #[test]
    fn send_requires_connection_id_and_body() {
        let missing_body = json!({"Header": 3, "ConnectionId": 1});
        assert!(serde_json::from_value::<Message>(missing_body).is_err());

        let missing_id = json!({"Header": 3, "Body": "AAAA"});
        assert!(serde_json::from_value::<Message>(missing_id).is_err());

        let missing_id = json!({"Header": 4});
        assert!(serde_json::from_value::<Message>(missing_id).is_err());
    }

    #[test]
    fn invalid_base64_body_is_rejected() {
        let value = json!({"Header": 3, "ConnectionId": 1, "Body": "not base64!"});
        assert!(serde_json::from_value::<Message>(value).is_err());
    }

    #[test]
    fn accessors_follow_variant() {
        assert_eq!(Message::StopTransport.connection_id(), None);
        assert_eq!(
            Message::send(5, b"hi".to_vec()).connection_id(),
            Some(ConnectionId::new(5))
        );
        assert_eq!(Message::connection_established(5).header(), Header::ConnectionEstablished);
        assert_eq!(Header::Send.to_string(), "Send");
    }
}
