//! Wire format for peer-to-peer message exchange
//!
//! Messages travel as JSON objects with a fixed, case-sensitive field set.
//! The field names are the protocol: renaming one breaks interop with every
//! deployed node. Acknowledgements are ordinary wire messages whose content
//! is `"ACK:" || original_message_id`.

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::types::{MessageId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Content prefix marking an acknowledgement.
pub const ACK_PREFIX: &str = "ACK:";

// ----------------------------------------------------------------------------
// Message Type
// ----------------------------------------------------------------------------

/// Wire message discriminator, carried as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Text,
    Ack,
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Text => 1,
            MessageType::Ack => 2,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Text),
            2 => Ok(MessageType::Ack),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

// ----------------------------------------------------------------------------
// Network Message
// ----------------------------------------------------------------------------

/// A message as it appears on the wire. Never persisted.
///
/// `content` carries either the plaintext body or, when `encrypted` is set,
/// the serialized [`crate::crypto::EncryptedPayload`]. `hash` is always
/// computed over the plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMessage {
    pub message_type: MessageType,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: u64,
    pub hop_count: u32,
    pub ttl: u64,
    pub hash: String,
    pub encrypted: bool,
    pub signature: String,
    /// Chain of forwarder IDs, for diagnostics only. Untrusted.
    pub forwarder_path: String,
}

impl NetworkMessage {
    /// Whether the message's TTL has elapsed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.as_millis() > self.ttl
    }

    /// Whether the message may still be forwarded: hop budget remaining and
    /// TTL not elapsed.
    pub fn should_forward(&self, now: Timestamp, max_hops: u32) -> bool {
        self.hop_count < max_hops && !self.is_expired(now)
    }

    /// Copy for rebroadcast: hop count incremented and this node appended to
    /// the forwarder path.
    pub fn forwarded_by(&self, forwarder: &UserId) -> NetworkMessage {
        let mut next = self.clone();
        next.hop_count += 1;
        if next.forwarder_path.is_empty() {
            next.forwarder_path = next.sender_id.to_string();
        }
        next.forwarder_path = format!("{} -> {}", next.forwarder_path, forwarder);
        next
    }

    /// Extract the acknowledged message ID from an ACK's content.
    pub fn ack_target(&self) -> Option<MessageId> {
        self.content.strip_prefix(ACK_PREFIX).map(MessageId::from)
    }
}

/// Content body of an ACK for the given message.
pub fn ack_content(original: &MessageId) -> String {
    format!("{ACK_PREFIX}{original}")
}

// ----------------------------------------------------------------------------
// Wire Codec
// ----------------------------------------------------------------------------

/// Encoder/decoder between [`NetworkMessage`] and wire bytes.
pub struct WireCodec;

impl WireCodec {
    /// Serialize a message to wire bytes. Deterministic for a given input.
    pub fn encode(message: &NetworkMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(CodecError::Encode)
    }

    /// Parse and validate wire bytes.
    ///
    /// Rejects payloads missing `messageId`, `senderId`, or `content`, and
    /// any with a non-positive timestamp.
    pub fn decode(bytes: &[u8]) -> Result<NetworkMessage, CodecError> {
        let message: NetworkMessage =
            serde_json::from_slice(bytes).map_err(CodecError::Decode)?;

        if message.message_id.is_empty() {
            return Err(CodecError::MissingField("messageId"));
        }
        if message.sender_id.as_str().is_empty() {
            return Err(CodecError::MissingField("senderId"));
        }
        if message.timestamp == 0 {
            return Err(CodecError::InvalidTimestamp);
        }

        Ok(message)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> NetworkMessage {
        NetworkMessage {
            message_type: MessageType::Text,
            message_id: MessageId::from("m-1"),
            sender_id: UserId::from("user-a"),
            recipient_id: UserId::from("user-b"),
            content: "hello".to_string(),
            timestamp: 1_700_000_000_000,
            hop_count: 0,
            ttl: 1_700_086_400_000,
            hash: "00".repeat(32),
            encrypted: false,
            signature: "sig".to_string(),
            forwarder_path: "user-a".to_string(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let message = sample_message();
        let bytes = WireCodec::encode(&message).unwrap();
        let decoded = WireCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_wire_field_names_are_stable() {
        let bytes = WireCodec::encode(&sample_message()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let object = value.as_object().unwrap();

        for field in [
            "messageType",
            "messageId",
            "senderId",
            "recipientId",
            "content",
            "timestamp",
            "hopCount",
            "ttl",
            "hash",
            "encrypted",
            "signature",
            "forwarderPath",
        ] {
            assert!(object.contains_key(field), "missing wire field {field}");
        }
        assert_eq!(object.len(), 12);
        assert_eq!(object["messageType"], 1);
    }

    #[test]
    fn test_message_type_integers() {
        assert_eq!(u8::from(MessageType::Text), 1);
        assert_eq!(u8::from(MessageType::Ack), 2);
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Ack);
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let mut message = sample_message();
        message.message_id = MessageId::from("");
        let bytes = WireCodec::encode(&message).unwrap();
        assert!(matches!(
            WireCodec::decode(&bytes),
            Err(CodecError::MissingField("messageId"))
        ));

        let mut message = sample_message();
        message.sender_id = UserId::from("");
        let bytes = WireCodec::encode(&message).unwrap();
        assert!(matches!(
            WireCodec::decode(&bytes),
            Err(CodecError::MissingField("senderId"))
        ));

        // A JSON object without `content` fails structural decoding.
        let bytes = br#"{"messageType":1,"messageId":"m","senderId":"a"}"#;
        assert!(matches!(WireCodec::decode(bytes), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let mut message = sample_message();
        message.timestamp = 0;
        let bytes = WireCodec::encode(&message).unwrap();
        assert!(matches!(
            WireCodec::decode(&bytes),
            Err(CodecError::InvalidTimestamp)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(WireCodec::decode(b"not json").is_err());
        assert!(WireCodec::decode(b"").is_err());
        assert!(WireCodec::decode(b"[1,2,3]").is_err());
    }

    #[test]
    fn test_expiry_and_forward_gate() {
        let message = sample_message();
        let before = Timestamp::new(message.ttl - 1);
        let after = Timestamp::new(message.ttl + 1);

        assert!(!message.is_expired(before));
        assert!(message.is_expired(after));
        assert!(message.should_forward(before, 5));
        assert!(!message.should_forward(after, 5));

        let mut at_limit = sample_message();
        at_limit.hop_count = 5;
        assert!(!at_limit.should_forward(before, 5));
    }

    #[test]
    fn test_forwarded_by_appends_path() {
        let message = sample_message();
        let forwarded = message.forwarded_by(&UserId::from("user-b"));
        assert_eq!(forwarded.hop_count, 1);
        assert_eq!(forwarded.forwarder_path, "user-a -> user-b");

        let again = forwarded.forwarded_by(&UserId::from("user-c"));
        assert_eq!(again.hop_count, 2);
        assert_eq!(again.forwarder_path, "user-a -> user-b -> user-c");
    }

    #[test]
    fn test_ack_content_round_trip() {
        let original = MessageId::from("m-42");
        let mut ack = sample_message();
        ack.message_type = MessageType::Ack;
        ack.content = ack_content(&original);
        assert_eq!(ack.content, "ACK:m-42");
        assert_eq!(ack.ack_target(), Some(original));

        let text = sample_message();
        assert_eq!(text.ack_target(), None);
    }
}
