//! Framed codec for host-worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Each frame is a 4-byte big-endian length followed by one JSON-encoded
//! message, so a read never has to equal exactly one write.

use std::io;

use thiserror::Error;
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{MalformedMessage, Message};

/// Length of the frame header preceding every encoded message.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest JSON payload accepted in one frame, either direction.
///
/// Bodies travel as base64, so the largest `Send` body is about 3/4 of this.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Outgoing message whose encoding does not fit in one frame.
///
/// Carried inside the `io::Error` returned by the encoder; nothing is written
/// to the destination buffer.
#[derive(Debug, Error)]
#[error("encoded message is {len} bytes, frame limit is {max}")]
pub struct FrameTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Serialize a message to its JSON text (without the frame header).
pub fn encode(message: &Message) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(message)
}

/// Parse one message from its JSON text (without the frame header).
pub fn decode(bytes: &[u8]) -> Result<Message, MalformedMessage> {
    serde_json::from_slice(bytes).map_err(|e| MalformedMessage::new(e.to_string()))
}

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Decoding yields `Ok(Err(_))` for a frame whose payload is not a valid
/// message, and for a frame over `MAX_FRAME_LEN` (its payload is skipped as
/// it arrives). The stream stays in sync either way and the caller decides
/// whether to keep reading. Only socket failures and truncated streams
/// surface as the outer `io::Error`.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
    max_frame_len: usize,
    /// Payload bytes of an oversized frame still to be skipped.
    discarding: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(FRAME_HEADER_LEN)
                .max_frame_length(max_frame_len)
                .new_codec(),
            max_frame_len,
            discarding: 0,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Drop whatever part of an oversized payload is buffered. Returns `true`
    /// once the whole payload is gone.
    fn skip_discarded(&mut self, src: &mut BytesMut) -> bool {
        let skip = self.discarding.min(src.len());
        src.advance(skip);
        self.discarding -= skip;
        self.discarding == 0
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, MalformedMessage>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.skip_discarded(src) {
            return Ok(None);
        }
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut head = [0u8; FRAME_HEADER_LEN];
        head.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(head) as usize;

        if len > self.max_frame_len {
            src.advance(FRAME_HEADER_LEN);
            self.discarding = len;
            self.skip_discarded(src);
            tracing::warn!(len, max = self.max_frame_len, "Skipping oversized frame");
            return Ok(Some(Err(MalformedMessage::new(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_len
            )))));
        }

        // Hand the inner codec complete frames only, so it never holds a
        // half-read head between calls.
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode(&frame))),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.header();
        let json = encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameTooLarge {
                    len: json.len(),
                    max: self.max_frame_len,
                },
            ));
        }
        tracing::trace!(%header, json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// The `FrameTooLarge` carried by an encoder error, if that is what it is.
pub fn frame_too_large(error: &io::Error) -> Option<&FrameTooLarge> {
    error.get_ref()?.downcast_ref::<FrameTooLarge>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::ConnectionId;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decode_inverts_encode() {
        let messages = [
            Message::StartTransport,
            Message::StopTransport,
            Message::send(3, b"payload".to_vec()),
            Message::connection_established(42),
        ];
        for message in messages {
            let bytes = encode(&message).unwrap();
            assert_eq!(decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn decode_rejects_truncated_and_unknown_input() {
        let bytes = encode(&Message::send(1, vec![0u8; 8])).unwrap();
        for cut in [0, 1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} decoded");
        }

        assert!(decode(br#"{"Header": 9}"#).is_err());
        assert!(decode(br#"{"Header": -1}"#).is_err());
        assert!(decode(br#"{"ConnectionId": 1}"#).is_err());
        assert!(decode(b"\xff\xfe\x00").is_err());
        assert!(decode(b"[]").is_err());
    }

    #[test]
    fn codec_roundtrip_send() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Message::send(42, vec![9u8, 8, 7]), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        match decoded {
            Message::Send {
                connection_id,
                body,
            } => {
                assert_eq!(connection_id, ConnectionId::new(42));
                assert_eq!(body, vec![9u8, 8, 7]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Message::StopTransport, &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, Message::StopTransport);
    }

    #[test]
    fn coalesced_frames_decode_in_order() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::StartTransport, &mut buf).unwrap();
        codec
            .encode(Message::connection_established(1), &mut buf)
            .unwrap();
        codec.encode(Message::StopTransport, &mut buf).unwrap();

        let mut decoded = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            decoded.push(item.unwrap());
        }
        assert_eq!(
            decoded,
            vec![
                Message::StartTransport,
                Message::connection_established(1),
                Message::StopTransport,
            ]
        );
    }

    #[test]
    fn malformed_frame_keeps_stream_in_sync() {
        let mut codec = MessageCodec::new();
        let mut buf = frame(br#"{"Header": 4}"#);
        codec.encode(Message::StartTransport, &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.unwrap(), Message::StartTransport);
    }

    #[test]
    fn oversized_outgoing_message_is_rejected_without_writing() {
        let mut codec = MessageCodec::with_max_frame_len(64);
        let mut buf = BytesMut::new();

        let err = codec
            .encode(Message::send(1, vec![0u8; 128]), &mut buf)
            .unwrap_err();
        let too_large = frame_too_large(&err).expect("not a size error");
        assert_eq!(too_large.max, 64);
        assert!(too_large.len > 64);
        assert!(buf.is_empty());

        codec.encode(Message::StopTransport, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, Message::StopTransport);
    }

    #[test]
    fn oversized_incoming_frame_is_skipped() {
        let mut codec = MessageCodec::with_max_frame_len(16);
        let big = frame(&[b'x'; 40]);
        let mut follow = BytesMut::new();
        codec.encode(Message::StartTransport, &mut follow).unwrap();

        // Header plus part of the payload first, rest in a later read.
        let mut buf = BytesMut::from(&big[..10]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&big[10..]);
        buf.extend_from_slice(&follow);
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.unwrap(), Message::StartTransport);
        assert!(buf.is_empty());
    }

    #[test]
    fn default_limit_is_explicit() {
        assert_eq!(MessageCodec::new().max_frame_len(), MAX_FRAME_LEN);
    }
}
