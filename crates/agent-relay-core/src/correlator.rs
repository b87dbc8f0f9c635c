//! Request correlation: request id → issuing controller, exactly-once terminals.

use std::sync::Mutex;

use agent_relay_proto::{ActionOutcome, ActionResult, FailureReason, Message};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::RelayError;
use crate::registry::ControllerHandle;

struct Entry {
    controller: Uuid,
    outbound: crate::relay::OutboundSender,
    client_id: String,
    outcomes: Mutex<Vec<ActionOutcome>>,
}

/// Matches the asynchronous result stream back to issuing controllers.
///
/// Removing an entry is the linearization point for terminal delivery: the
/// first of `complete`/`fail` wins, the other finds nothing, so a requester
/// sees exactly one terminal message.
#[derive(Default)]
pub struct RequestCorrelator {
    entries: DashMap<String, Entry>,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a request id for a controller before anything is dispatched.
    ///
    /// # Errors
    /// `DuplicateRequest` if the id is already in flight.
    pub fn register(
        &self,
        request_id: &str,
        controller: &ControllerHandle,
        client_id: &str,
    ) -> Result<(), RelayError> {
        match self.entries.entry(request_id.to_string()) {
            dashmap::Entry::Occupied(_) => {
                Err(RelayError::DuplicateRequest(request_id.to_string()))
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(Entry {
                    controller: controller.id,
                    outbound: controller.outbound.clone(),
                    client_id: client_id.to_string(),
                    outcomes: Mutex::new(Vec::new()),
                });
                Ok(())
            }
        }
    }

    /// Drop a claim that never got dispatched (enqueue was rejected).
    pub fn discard(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    /// Owning controller and target client of a request, if still live.
    #[must_use]
    pub fn target(&self, request_id: &str) -> Option<(Uuid, String)> {
        self.entries
            .get(request_id)
            .map(|entry| (entry.controller, entry.client_id.clone()))
    }

    /// Stream one result to the issuer and record its outcome row.
    ///
    /// Misses (entry already settled, e.g. after cancellation) are logged
    /// and non-fatal.
    pub fn route(&self, result: &ActionResult) {
        if let Some(entry) = self.entries.get(&result.request_id) {
            entry
                .outcomes
                .lock()
                .unwrap()
                .push(ActionOutcome::from(result));
            let _ = entry.outbound.send(Message::ActionResult(result.clone()));
        } else {
            tracing::debug!(
                request_id = %result.request_id,
                index = result.action_index,
                "no correlator entry for result"
            );
        }
    }

    /// Settle a request with `SEQUENCE_COMPLETE` and clear bookkeeping.
    pub fn complete(&self, request_id: &str) {
        if let Some((request_id, entry)) = self.entries.remove(request_id) {
            let results = entry.outcomes.into_inner().unwrap();
            let _ = entry
                .outbound
                .send(Message::SequenceComplete { request_id, results });
        } else {
            tracing::debug!(%request_id, "complete for already-settled request");
        }
    }

    /// Settle a request with `SEQUENCE_FAILED` and clear bookkeeping.
    pub fn fail(&self, request_id: &str, reason: FailureReason, error: Option<String>) {
        if let Some((request_id, entry)) = self.entries.remove(request_id) {
            let _ = entry.outbound.send(Message::SequenceFailed {
                request_id,
                reason,
                error,
            });
        } else {
            tracing::debug!(%request_id, "failure for already-settled request");
        }
    }

    /// Remove and return every `(request_id, client_id)` a controller owns.
    ///
    /// Used on controller disconnect; no terminal is sent (there is nobody
    /// left to receive it), the caller frees the client sessions instead.
    pub fn take_requests_for(&self, controller: Uuid) -> Vec<(String, String)> {
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().controller == controller)
            .map(|entry| entry.key().clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|request_id| {
                self.entries
                    .remove_if(&request_id, |_, entry| entry.controller == controller)
                    .map(|(request_id, entry)| (request_id, entry.client_id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_proto::ActionStatus;
    use tokio::sync::mpsc::unbounded_channel;

    fn handle() -> (ControllerHandle, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        (ControllerHandle { id: Uuid::new_v4(), outbound: tx }, rx)
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let correlator = RequestCorrelator::new();
        let (handle, _rx) = handle();
        correlator.register("r1", &handle, "agent-1").unwrap();
        let err = correlator.register("r1", &handle, "agent-2").unwrap_err();
        assert!(matches!(err, RelayError::DuplicateRequest(_)));
    }

    #[test]
    fn test_route_streams_and_complete_summarizes() {
        let correlator = RequestCorrelator::new();
        let (handle, mut rx) = handle();
        correlator.register("r1", &handle, "agent-1").unwrap();

        correlator.route(&ActionResult::ok("r1", 0).with_screenshot(b"png"));
        correlator.route(&ActionResult::ok("r1", 1));
        correlator.complete("r1");

        match rx.try_recv().unwrap() {
            Message::ActionResult(result) => {
                assert_eq!(result.action_index, 0);
                assert!(result.screenshot.is_some());
            }
            other => panic!("wrong message: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), Message::ActionResult(_)));
        match rx.try_recv().unwrap() {
            Message::SequenceComplete { request_id, results } => {
                assert_eq!(request_id, "r1");
                assert_eq!(results.len(), 2);
                assert!(results.iter().all(|r| r.status == ActionStatus::Ok));
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn test_terminal_is_exactly_once() {
        let correlator = RequestCorrelator::new();
        let (handle, mut rx) = handle();
        correlator.register("r1", &handle, "agent-1").unwrap();

        correlator.fail("r1", FailureReason::Timeout, None);
        correlator.complete("r1");
        correlator.fail("r1", FailureReason::Disconnected, None);

        assert!(matches!(rx.try_recv().unwrap(), Message::SequenceFailed { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_miss_is_nonfatal() {
        let correlator = RequestCorrelator::new();
        correlator.route(&ActionResult::ok("ghost", 0));
    }

    #[test]
    fn test_take_requests_for_controller() {
        let correlator = RequestCorrelator::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        correlator.register("r1", &first, "agent-1").unwrap();
        correlator.register("r2", &first, "agent-2").unwrap();
        correlator.register("r3", &second, "agent-1").unwrap();

        let mut taken = correlator.take_requests_for(first.id);
        taken.sort();
        assert_eq!(
            taken,
            vec![
                ("r1".to_string(), "agent-1".to_string()),
                ("r2".to_string(), "agent-2".to_string()),
            ]
        );
        assert!(correlator.target("r3").is_some());
    }
}
