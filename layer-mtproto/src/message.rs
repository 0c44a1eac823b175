//! MTProto message framing types.

use crate::tl::ids;

/// A 64-bit MTProto message identifier.
///
/// The upper 32 bits are the (server-corrected) Unix time, the lower bits
/// keep ids unique within that second. Client ids are divisible by four.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub i64);

/// A framed MTProto message ready to be sent.
#[derive(Clone, Debug)]
pub struct Message {
    /// Unique identifier for this message.
    pub id:     MessageId,
    /// Session-scoped sequence number (even for content-unrelated, odd for content-related).
    pub seq_no: i32,
    /// The serialized TL body (constructor ID + fields).
    pub body:   Vec<u8>,
}

impl Message {
    /// Construct a new plaintext message (used before key exchange).
    pub fn plaintext(id: MessageId, seq_no: i32, body: Vec<u8>) -> Self {
        Self { id, seq_no, body }
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.0.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse a plaintext frame received from the server.
    pub fn from_plaintext_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 20 || raw[..8] != [0u8; 8] {
            return None;
        }
        let id = i64::from_le_bytes(raw[8..16].try_into().ok()?);
        let len = u32::from_le_bytes(raw[16..20].try_into().ok()?) as usize;
        let body = raw.get(20..20 + len)?.to_vec();
        Some(Self { id: MessageId(id), seq_no: 0, body })
    }

    /// Inner layout used inside encrypted payloads and containers:
    /// `msg_id:long seqno:int bytes:int body`.
    pub fn write_inner(&self, buf: &mut Vec<u8>) {
        buf.extend(self.id.0.to_le_bytes());
        buf.extend(self.seq_no.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
    }

    /// Build the body of a `msg_container` holding `messages`.
    pub fn container_body(messages: &[Message]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(ids::MSG_CONTAINER.to_le_bytes());
        buf.extend((messages.len() as u32).to_le_bytes());
        for m in messages {
            m.write_inner(&mut buf);
        }
        buf
    }
}
