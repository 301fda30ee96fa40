//! Classification of inbound frames.

use std::path::PathBuf;

use thiserror::Error;

use crate::identity::{IdentityKey, IdentityUpdate};
use crate::protocol::{RequestId, StreamResponse};

/// Why a push could not be given a routing key.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not JSON: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Push carries no identity key")]
    MissingIdentity,
}

/// A frame read off the shared stream, tagged by how it must be routed.
#[derive(Debug)]
pub enum InboundMessage {
    /// Reply to an outstanding request; belongs to the correlation pool only.
    Reply {
        request_id: RequestId,
        frame: StreamResponse,
    },
    /// Identity-assignment push for every session that is still unbound.
    IdentityAssignment { frame: StreamResponse },
    /// Push addressed to one backend identity.
    Targeted {
        key: IdentityKey,
        identity: IdentityUpdate,
        frame: StreamResponse,
    },
    /// Push without a usable identity key.
    Unaddressed {
        reason: DecodeError,
        frame: StreamResponse,
    },
}

impl InboundMessage {
    /// Classify a frame.
    #[must_use]
    pub fn classify(frame: StreamResponse) -> Self {
        if let Some(request_id) = frame.correlation_id() {
            return Self::Reply {
                request_id: request_id.to_string(),
                frame,
            };
        }
        if frame.response_type.is_identity_assignment() {
            return Self::IdentityAssignment { frame };
        }

        let payload = match frame.payload() {
            Ok(payload) => payload,
            Err(e) => {
                return Self::Unaddressed {
                    reason: e.into(),
                    frame,
                };
            }
        };
        let identity = IdentityUpdate::from_payload(&payload);
        match identity.routing_key() {
            Some(key) => Self::Targeted {
                key,
                identity,
                frame,
            },
            None => Self::Unaddressed {
                reason: DecodeError::MissingIdentity,
                frame,
            },
        }
    }

    #[must_use]
    pub const fn frame(&self) -> &StreamResponse {
        match self {
            Self::Reply { frame, .. }
            | Self::IdentityAssignment { frame }
            | Self::Targeted { frame, .. }
            | Self::Unaddressed { frame, .. } => frame,
        }
    }

    #[must_use]
    pub fn into_frame(self) -> StreamResponse {
        match self {
            Self::Reply { frame, .. }
            | Self::IdentityAssignment { frame }
            | Self::Targeted { frame, .. }
            | Self::Unaddressed { frame, .. } => frame,
        }
    }
}

/// Outcome of materializing a frame's embedded file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Attachment {
    /// The frame carries no attachment.
    #[default]
    None,
    /// Decoded and written to disk.
    Saved(PathBuf),
    /// Materialization failed; the frame is still delivered.
    Failed(String),
}

/// Value emitted on a session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub frame: StreamResponse,
    pub attachment: Attachment,
}

impl Delivery {
    #[must_use]
    pub const fn new(frame: StreamResponse, attachment: Attachment) -> Self {
        Self { frame, attachment }
    }
}

impl From<StreamResponse> for Delivery {
    fn from(frame: StreamResponse) -> Self {
        Self::new(frame, Attachment::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseType;

    #[test]
    fn test_reply_wins_over_push_type() {
        let frame = StreamResponse::reply("r1", ResponseType::LoginQrcode, "{}");
        assert!(matches!(
            InboundMessage::classify(frame),
            InboundMessage::Reply { request_id, .. } if request_id == "r1"
        ));
    }

    #[test]
    fn test_login_qrcode_is_identity_assignment() {
        let frame = StreamResponse::push(ResponseType::LoginQrcode, r#"{"qrcodeId":7}"#);
        assert!(matches!(
            InboundMessage::classify(frame),
            InboundMessage::IdentityAssignment { .. }
        ));
    }

    #[test]
    fn test_targeted_push_prefers_uin() {
        let frame = StreamResponse::push(
            ResponseType::AccountLogin,
            r#"{"qrcodeId":7,"uin":42,"userName":"wxid_alice"}"#,
        );
        match InboundMessage::classify(frame) {
            InboundMessage::Targeted { key, identity, .. } => {
                assert_eq!(key, IdentityKey::Uin(42));
                assert_eq!(identity.qrcode_id, Some(7));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_unaddressed_pushes() {
        let garbage = StreamResponse::push(ResponseType::StatusNotify, "not json");
        assert!(matches!(
            InboundMessage::classify(garbage),
            InboundMessage::Unaddressed {
                reason: DecodeError::Payload(_),
                ..
            }
        ));

        let anonymous = StreamResponse::push(ResponseType::StatusNotify, r#"{"status":1}"#);
        assert!(matches!(
            InboundMessage::classify(anonymous),
            InboundMessage::Unaddressed {
                reason: DecodeError::MissingIdentity,
                ..
            }
        ));
    }
}
