//! Envelope codec: JSON text frames with fail-closed unknown-kind handling.

use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Every tag a conforming peer may send.
///
/// Must stay in sync with [`Message`]; `test_known_kinds_cover_enum` guards
/// the invariant.
pub const KNOWN_KINDS: &[&str] = &[
    "register",
    "register_ack",
    "list_clients",
    "client_list",
    "execute_sequence",
    "accepted",
    "rejected",
    "cancel_sequence",
    "action_dispatch",
    "action_result",
    "sequence_complete",
    "sequence_failed",
    "client_status_event",
    "ping",
    "pong",
];

/// Codec failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame is not valid JSON, or a known kind carried a bad payload.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Frame carried a `type` tag outside the protocol.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

/// Encode a message as a JSON text frame.
///
/// # Errors
/// Returns `CodecError::Malformed` if serialization fails (non-finite floats
/// are the only realistic cause).
pub fn encode(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one text frame.
///
/// Unknown `type` tags are reported as [`CodecError::UnknownKind`] so callers
/// can count them against a violation budget instead of tearing the
/// connection down on the first stray message.
///
/// # Errors
/// Returns `CodecError::Malformed` for invalid JSON or bad payloads,
/// `CodecError::UnknownKind` for tags outside [`KNOWN_KINDS`].
pub fn decode(text: &str) -> Result<Message, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    match serde_json::from_value(value) {
        Ok(message) => Ok(message),
        Err(err) => match kind {
            Some(kind) if !KNOWN_KINDS.contains(&kind.as_str()) => {
                Err(CodecError::UnknownKind(kind))
            }
            _ => Err(CodecError::Malformed(err)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::message::{RejectReason, Role};

    #[test]
    fn test_roundtrip() {
        let msg = Message::ExecuteSequence {
            request_id: "r1".to_string(),
            target_client_id: "agent-1".to_string(),
            actions: vec![
                Action::named("click_x").with_screenshot().with_delay(0.5),
                Action::named("click_y"),
            ],
        };
        let text = encode(&msg).unwrap();
        let decoded = decode(&text).unwrap();
        match decoded {
            Message::ExecuteSequence { request_id, actions, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(actions.len(), 2);
                assert!(actions[0].screenshot);
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_fails_closed() {
        let err = decode(r#"{"type":"firmware_update","payload":"x"}"#).unwrap_err();
        match err {
            CodecError::UnknownKind(kind) => assert_eq!(kind, "firmware_update"),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(decode("{not json"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_known_kind_bad_payload_is_malformed() {
        // `register` without a role is a payload error, not an unknown kind.
        let err = decode(r#"{"type":"register"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_missing_tag_is_malformed() {
        let err = decode(r#"{"role":"client"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_known_kinds_cover_enum() {
        let samples = [
            Message::Register { role: Role::Client, id: None },
            Message::RegisterAck { id: "a".into() },
            Message::ListClients,
            Message::ClientList { clients: vec![] },
            Message::ExecuteSequence {
                request_id: "r".into(),
                target_client_id: "c".into(),
                actions: vec![],
            },
            Message::Accepted { request_id: "r".into() },
            Message::Rejected { request_id: "r".into(), reason: RejectReason::Busy },
            Message::CancelSequence { request_id: "r".into() },
            Message::ActionDispatch {
                request_id: "r".into(),
                action_index: 0,
                action: Action::named("noop"),
            },
            Message::ActionResult(crate::action::ActionResult::ok("r", 0)),
            Message::SequenceComplete { request_id: "r".into(), results: vec![] },
            Message::SequenceFailed {
                request_id: "r".into(),
                reason: crate::message::FailureReason::Timeout,
                error: None,
            },
            Message::ClientStatusEvent {
                client_id: "c".into(),
                event: crate::message::StatusEvent::Connected,
                timestamp: 0,
            },
            Message::Ping,
            Message::Pong,
        ];
        assert_eq!(samples.len(), KNOWN_KINDS.len());
        for msg in &samples {
            let value: Value = serde_json::from_str(&encode(msg).unwrap()).unwrap();
            let tag = value["type"].as_str().unwrap();
            assert!(KNOWN_KINDS.contains(&tag), "tag {tag} missing from KNOWN_KINDS");
        }
    }
}
