//! The closed message envelope exchanged over relay connections.

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionOutcome, ActionResult};

/// Role a connection declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Remote automation agent executing actions.
    Client,
    /// Process issuing sequences and consuming results.
    Controller,
}

/// Observable state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Connected, no sequence running.
    Idle,
    /// A sequence is running or queued.
    Busy,
    /// Session torn down; terminal.
    Disconnected,
}

/// One row of a `LIST_CLIENTS` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    /// Client identifier.
    pub id: String,
    /// Session status at snapshot time.
    pub status: ClientStatus,
}

/// Why an `EXECUTE_SEQUENCE` was rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Target is running a sequence and queueing is disabled.
    Busy,
    /// Target client is not connected.
    NotFound,
    /// Target's pending queue is at capacity.
    QueueFull,
    /// The request id is already in flight.
    DuplicateRequest,
}

/// Why an accepted sequence terminated in `SEQUENCE_FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// An action reported an error and abort-on-error is enabled.
    ActionError,
    /// Per-action or whole-sequence timeout.
    Timeout,
    /// The client disconnected or was invalidated.
    Disconnected,
    /// The sequence was cancelled.
    Aborted,
}

/// Connect/disconnect notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    /// Client registered.
    Connected,
    /// Client session ended.
    Disconnected,
}

/// Every message the relay sends or receives.
///
/// The discriminant travels as a `type` tag; unknown tags are rejected by the
/// codec rather than silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message on any connection; declares the role.
    Register {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Registration confirmation with the assigned id.
    RegisterAck { id: String },
    /// Controller request for a snapshot of connected clients.
    ListClients,
    /// Snapshot reply to `ListClients`.
    ClientList { clients: Vec<ClientSummary> },
    /// Controller submits an ordered action sequence for one client.
    ExecuteSequence {
        request_id: String,
        target_client_id: String,
        actions: Vec<Action>,
    },
    /// The sequence was admitted; a terminal message will follow.
    Accepted { request_id: String },
    /// The sequence was refused; no terminal message will follow.
    Rejected {
        request_id: String,
        reason: RejectReason,
    },
    /// Controller cancels an accepted sequence.
    CancelSequence { request_id: String },
    /// Relay hands one action to a client.
    ActionDispatch {
        request_id: String,
        action_index: u32,
        action: Action,
    },
    /// Client reports one action's result; relayed to the issuer.
    ActionResult(ActionResult),
    /// All actions completed; screenshot-free summary rows.
    SequenceComplete {
        request_id: String,
        results: Vec<ActionOutcome>,
    },
    /// The sequence terminated early.
    SequenceFailed {
        request_id: String,
        reason: FailureReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Broadcast to controllers on client connect/disconnect.
    ClientStatusEvent {
        client_id: String,
        event: StatusEvent,
        timestamp: i64,
    },
    /// Heartbeat probe.
    Ping,
    /// Heartbeat answer.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionStatus;

    #[test]
    fn test_register_tag() {
        let msg = Message::Register {
            role: Role::Client,
            id: Some("agent-1".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains(r#""role":"client""#));
    }

    #[test]
    fn test_register_without_id() {
        let parsed: Message =
            serde_json::from_str(r#"{"type":"register","role":"controller"}"#).unwrap();
        match parsed {
            Message::Register { role, id } => {
                assert_eq!(role, Role::Controller);
                assert!(id.is_none());
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_action_result_envelope_roundtrip() {
        let msg = Message::ActionResult(
            ActionResult::ok("r1", 3).with_screenshot(b"pixels"),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"action_result""#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::ActionResult(result) => {
                assert_eq!(result.action_index, 3);
                assert_eq!(result.status, ActionStatus::Ok);
                assert_eq!(result.screenshot_bytes().unwrap(), b"pixels");
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_unit_variants() {
        assert_eq!(serde_json::to_string(&Message::Ping).unwrap(), r#"{"type":"ping"}"#);
        let parsed: Message = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(parsed, Message::Pong));
    }

    #[test]
    fn test_rejected_reason_wire_form() {
        let msg = Message::Rejected {
            request_id: "r9".to_string(),
            reason: RejectReason::QueueFull,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""reason":"queue_full""#));
    }
}
