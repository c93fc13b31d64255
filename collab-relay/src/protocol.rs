//! Wire frames exchanged with y-websocket compatible clients.
//!
//! Every frame is lib0-encoded:
//! ```text
//! ┌──────────────────┬─────────────────────────────────────────────┐
//! │ varint msg_type  │ type-specific payload                       │
//! ├──────────────────┼─────────────────────────────────────────────┤
//! │ 0 Sync           │ varint subtype (0 step1 / 1 step2 / 2 upd.) │
//! │                  │ varbuf state vector or update               │
//! │ 1 Awareness      │ varbuf awareness update                     │
//! │ 2 Auth           │ varint auth type, varstring reason          │
//! │ 3 QueryAwareness │ (empty)                                     │
//! └──────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! Payloads are carried as opaque bytes. Their interpretation belongs to the
//! replica engine ([`crate::replica`]) and the presence table
//! ([`crate::awareness`]).

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::error::{RelayError, Result};

/// Sync sub-message: sender's state vector, asks for what it is missing.
pub const SYNC_STEP1: u64 = 0;
/// Sync sub-message: reply to step 1 carrying the missing updates.
pub const SYNC_STEP2: u64 = 1;
/// Sync sub-message: incremental update.
pub const SYNC_UPDATE: u64 = 2;

/// Auth sub-message reporting that access was refused.
pub const AUTH_PERMISSION_DENIED: u64 = 0;

/// Top-level message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
}

impl MessageType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            2 => Some(Self::Auth),
            3 => Some(Self::QueryAwareness),
            _ => None,
        }
    }

    pub fn tag(self) -> u64 {
        self as u64
    }
}

/// Auth payload. Only "permission denied" has a defined meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    PermissionDenied { reason: String },
    /// Any other auth type; its body is left unread.
    Other(u64),
}

impl AuthMessage {
    fn read(cursor: &mut Cursor<'_>) -> Result<Self> {
        let auth_type: u64 = cursor.read_var()?;
        if auth_type == AUTH_PERMISSION_DENIED {
            let reason = cursor.read_string()?.to_string();
            Ok(Self::PermissionDenied { reason })
        } else {
            Ok(Self::Other(auth_type))
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Self::PermissionDenied { reason } => {
                buf.write_var(AUTH_PERMISSION_DENIED);
                buf.write_string(reason);
            }
            Self::Other(auth_type) => buf.write_var(*auth_type),
        }
    }
}

/// A decoded inbound or outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Encoded state vector of the sender.
    SyncStep1(Vec<u8>),
    /// Encoded update answering a SyncStep1.
    SyncStep2(Vec<u8>),
    /// Encoded incremental update.
    Update(Vec<u8>),
    /// Encoded awareness update (see [`crate::awareness`]).
    Awareness(Vec<u8>),
    Auth(AuthMessage),
    QueryAwareness,
    /// A message tag this relay does not speak.
    Unknown(u64),
}

impl Frame {
    /// Decode a frame. Unknown top-level tags decode to [`Frame::Unknown`];
    /// truncated or invalid payloads fail with [`RelayError::Malformed`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let tag: u64 = cursor.read_var()?;

        let frame = match MessageType::from_tag(tag) {
            Some(MessageType::Sync) => {
                let subtype: u64 = cursor.read_var()?;
                if subtype > SYNC_UPDATE {
                    return Err(RelayError::UnknownSyncMessage(subtype));
                }
                let payload = cursor.read_buf()?.to_vec();
                match subtype {
                    SYNC_STEP1 => Frame::SyncStep1(payload),
                    SYNC_STEP2 => Frame::SyncStep2(payload),
                    _ => Frame::Update(payload),
                }
            }
            Some(MessageType::Awareness) => Frame::Awareness(cursor.read_buf()?.to_vec()),
            Some(MessageType::Auth) => Frame::Auth(AuthMessage::read(&mut cursor)?),
            Some(MessageType::QueryAwareness) => Frame::QueryAwareness,
            None => Frame::Unknown(tag),
        };
        Ok(frame)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Frame::SyncStep1(payload) => write_sync(&mut buf, SYNC_STEP1, payload),
            Frame::SyncStep2(payload) => write_sync(&mut buf, SYNC_STEP2, payload),
            Frame::Update(payload) => write_sync(&mut buf, SYNC_UPDATE, payload),
            Frame::Awareness(payload) => {
                buf.write_var(MessageType::Awareness.tag());
                buf.write_buf(payload);
            }
            Frame::Auth(auth) => {
                buf.write_var(MessageType::Auth.tag());
                auth.write(&mut buf);
            }
            Frame::QueryAwareness => buf.write_var(MessageType::QueryAwareness.tag()),
            Frame::Unknown(tag) => buf.write_var(*tag),
        }
        buf
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SyncStep1(_) => "sync-step1",
            Frame::SyncStep2(_) => "sync-step2",
            Frame::Update(_) => "update",
            Frame::Awareness(_) => "awareness",
            Frame::Auth(_) => "auth",
            Frame::QueryAwareness => "query-awareness",
            Frame::Unknown(_) => "unknown",
        }
    }
}

fn write_sync(buf: &mut Vec<u8>, subtype: u64, payload: &[u8]) {
    buf.write_var(MessageType::Sync.tag());
    buf.write_var(subtype);
    buf.write_buf(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_y_websocket_sync_step1() {
        // messageSync, step1, 1-byte state vector of an empty doc
        let frame = Frame::decode(&[0, 0, 1, 0]).unwrap();
        assert_eq!(frame, Frame::SyncStep1(vec![0]));
    }

    #[test]
    fn test_decode_query_awareness() {
        assert_eq!(Frame::decode(&[3]).unwrap(), Frame::QueryAwareness);
    }

    #[test]
    fn test_update_wire_layout() {
        let encoded = Frame::Update(vec![9, 8, 7]).encode();
        assert_eq!(encoded, vec![0, 2, 3, 9, 8, 7]);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Update(vec![9, 8, 7]));
    }

    #[test]
    fn test_step2_decodes_separately_from_update() {
        let encoded = Frame::SyncStep2(vec![0, 0]).encode();
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::SyncStep2(vec![0, 0]));
    }

    #[test]
    fn test_auth_permission_denied() {
        let frame = Frame::Auth(AuthMessage::PermissionDenied {
            reason: "read-only".into(),
        });
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_auth_other_type() {
        let decoded = Frame::decode(&[2, 7]).unwrap();
        assert_eq!(decoded, Frame::Auth(AuthMessage::Other(7)));
    }

    #[test]
    fn test_unknown_message_type() {
        let decoded = Frame::decode(&[42, 1, 2, 3]).unwrap();
        assert_eq!(decoded, Frame::Unknown(42));
        assert_eq!(decoded.kind(), "unknown");
    }

    #[test]
    fn test_unknown_sync_subtype() {
        match Frame::decode(&[0, 9, 0]) {
            Err(RelayError::UnknownSyncMessage(9)) => {}
            other => panic!("expected UnknownSyncMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        // declares a 10-byte buffer but carries 2
        assert!(matches!(
            Frame::decode(&[1, 10, 1, 2]),
            Err(RelayError::Malformed(_))
        ));
        assert!(matches!(Frame::decode(&[]), Err(RelayError::Malformed(_))));
    }

    #[test]
    fn test_large_update_length_prefix() {
        let payload = vec![42u8; 65536];
        let encoded = Frame::Update(payload.clone()).encode();
        // tag + subtype + 3-byte varint length
        assert_eq!(encoded.len(), 2 + 3 + payload.len());
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Update(payload));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Sync as u8, 0);
        assert_eq!(MessageType::Awareness as u8, 1);
        assert_eq!(MessageType::Auth as u8, 2);
        assert_eq!(MessageType::QueryAwareness as u8, 3);
        assert_eq!(MessageType::from_tag(4), None);
    }
}
