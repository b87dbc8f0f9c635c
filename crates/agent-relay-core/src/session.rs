//! Per-client session: state machine, bounded queue, dispatch loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_proto::{
    Action, ActionResult, ActionStatus, ClientStatus, FailureReason, Message, now_millis,
};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::correlator::RequestCorrelator;
use crate::error::RelayError;
use crate::relay::OutboundSender;

/// A sequence admitted to the queue but not yet finished.
struct QueuedSequence {
    request_id: String,
    actions: Vec<Action>,
    issued_at: i64,
}

/// Bookkeeping for the sequence currently owning the client.
struct Running {
    request_id: String,
    cancelled: bool,
    result_tx: mpsc::UnboundedSender<ActionResult>,
}

struct SessionState {
    status: ClientStatus,
    queue: VecDeque<QueuedSequence>,
    running: Option<Running>,
    last_seen: i64,
}

/// Live bookkeeping for one connected agent.
///
/// Exactly one dispatch task runs per session; every state transition
/// happens under a single short-lived mutex. The session is invalidated
/// (terminally `Disconnected`) through [`ClientSession::abort_all`].
pub struct ClientSession {
    id: String,
    conn: Uuid,
    outbound: OutboundSender,
    state: Mutex<SessionState>,
    work: Notify,
    closed_tx: watch::Sender<bool>,
}

impl ClientSession {
    /// Create a session for a freshly registered client connection.
    #[must_use]
    pub fn new(id: String, conn: Uuid, outbound: OutboundSender) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            conn,
            outbound,
            state: Mutex::new(SessionState {
                status: ClientStatus::Idle,
                queue: VecDeque::new(),
                running: None,
                last_seen: now_millis(),
            }),
            work: Notify::new(),
            closed_tx,
        })
    }

    /// Client identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the physical connection that owns this session.
    #[must_use]
    pub const fn conn(&self) -> Uuid {
        self.conn
    }

    /// Current status for snapshots.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.state.lock().unwrap().status
    }

    /// Record inbound traffic as proof of liveness.
    pub fn touch(&self) {
        self.state.lock().unwrap().last_seen = now_millis();
    }

    /// Epoch millis of the last inbound message.
    #[must_use]
    pub fn last_seen(&self) -> i64 {
        self.state.lock().unwrap().last_seen
    }

    /// Watch that flips to `true` when the session is invalidated.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Admit a sequence under the bounded FIFO policy.
    ///
    /// # Errors
    /// `Busy` when occupied with queueing disabled, `QueueFull` at capacity,
    /// `Disconnected` after invalidation.
    pub fn enqueue(
        &self,
        request_id: &str,
        actions: Vec<Action>,
        config: &RelayConfig,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().unwrap();
        if state.status == ClientStatus::Disconnected {
            return Err(RelayError::Disconnected);
        }
        let occupied = state.running.is_some() || !state.queue.is_empty();
        if occupied {
            if config.queue_depth == 0 {
                return Err(RelayError::Busy);
            }
            if state.queue.len() >= config.queue_depth {
                return Err(RelayError::QueueFull);
            }
        }
        state.queue.push_back(QueuedSequence {
            request_id: request_id.to_string(),
            actions,
            issued_at: now_millis(),
        });
        state.status = ClientStatus::Busy;
        drop(state);
        self.work.notify_one();
        Ok(())
    }

    /// Cancel a queued or in-flight sequence.
    ///
    /// Returns whether the request was found. A running sequence is only
    /// flagged; its dispatched action's eventual result is discarded, not
    /// interrupted.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.running.as_mut() {
            if running.request_id == request_id {
                running.cancelled = true;
                return true;
            }
        }
        let before = state.queue.len();
        state.queue.retain(|seq| seq.request_id != request_id);
        state.queue.len() != before
    }

    /// Feed a client-reported result to the dispatch loop.
    pub fn on_result(&self, result: ActionResult) {
        let mut state = self.state.lock().unwrap();
        state.last_seen = now_millis();
        match state.running.as_ref() {
            Some(running) if running.request_id == result.request_id => {
                let _ = running.result_tx.send(result);
            }
            _ => tracing::debug!(
                client = %self.id,
                request_id = %result.request_id,
                "dropping result with no in-flight sequence"
            ),
        }
    }

    /// Invalidate the session: terminal `Disconnected`, queue discarded.
    ///
    /// Returns the request ids (in-flight first) whose requesters still need
    /// a terminal failure; the caller settles them with the correlator.
    pub fn abort_all(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.status = ClientStatus::Disconnected;
        let mut ids: Vec<String> = Vec::with_capacity(state.queue.len() + 1);
        if let Some(running) = state.running.as_mut() {
            running.cancelled = true;
            ids.push(running.request_id.clone());
        }
        ids.extend(state.queue.drain(..).map(|seq| seq.request_id));
        drop(state);
        let _ = self.closed_tx.send(true);
        self.work.notify_one();
        ids
    }

    fn is_cancelled(&self, request_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .running
            .as_ref()
            .is_some_and(|running| running.request_id == request_id && running.cancelled)
    }

    /// Single-owner dispatch loop; runs until the session is invalidated.
    ///
    /// Pops sequences FIFO, keeps at most one `ACTION_DISPATCH` outstanding,
    /// and settles each sequence through the correlator.
    pub async fn run_dispatch(
        self: Arc<Self>,
        correlator: Arc<RequestCorrelator>,
        config: RelayConfig,
    ) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            if *closed.borrow() {
                break;
            }
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(seq) => {
                        let (result_tx, result_rx) = mpsc::unbounded_channel();
                        state.status = ClientStatus::Busy;
                        state.running = Some(Running {
                            request_id: seq.request_id.clone(),
                            cancelled: false,
                            result_tx,
                        });
                        Some((seq, result_rx))
                    }
                    None => {
                        if state.status != ClientStatus::Disconnected {
                            state.status = ClientStatus::Idle;
                        }
                        None
                    }
                }
            };
            match next {
                Some((seq, result_rx)) => {
                    self.run_sequence(seq, result_rx, &correlator, &config).await;
                    self.state.lock().unwrap().running = None;
                }
                None => {
                    tokio::select! {
                        () = self.work.notified() => {}
                        _ = closed.changed() => break,
                    }
                }
            }
        }
        tracing::debug!(client = %self.id, "dispatch loop stopped");
    }

    async fn run_sequence(
        &self,
        seq: QueuedSequence,
        mut result_rx: mpsc::UnboundedReceiver<ActionResult>,
        correlator: &RequestCorrelator,
        config: &RelayConfig,
    ) {
        let request_id = seq.request_id;
        let total = u32::try_from(seq.actions.len()).unwrap_or(u32::MAX);
        let deadline = Instant::now() + config.sequence_timeout;
        let mut closed = self.closed_tx.subscribe();
        tracing::debug!(
            client = %self.id,
            %request_id,
            actions = total,
            queued_for_ms = now_millis() - seq.issued_at,
            "sequence started"
        );

        for (index, action) in seq.actions.into_iter().enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            if self.is_cancelled(&request_id) {
                // The canceller already settled the requester.
                tracing::debug!(client = %self.id, %request_id, "sequence cancelled");
                return;
            }
            let remaining = deadline.duration_since(Instant::now());
            if remaining.is_zero() {
                flush_aborted(correlator, &request_id, index, total);
                correlator.fail(
                    &request_id,
                    FailureReason::Timeout,
                    Some("sequence deadline exceeded".to_string()),
                );
                return;
            }
            let delay = action.delay;
            let _ = self.outbound.send(Message::ActionDispatch {
                request_id: request_id.clone(),
                action_index: index,
                action,
            });

            let received = tokio::select! {
                received = timeout(config.action_timeout.min(remaining), result_rx.recv()) => received,
                _ = closed.wait_for(|flag| *flag) => {
                    // Session torn down mid-wait; the abort path settles requesters.
                    return;
                }
            };
            let result = match received {
                Ok(Some(result)) => result,
                Ok(None) => return,
                Err(_) => {
                    if self.is_cancelled(&request_id) {
                        return;
                    }
                    tracing::warn!(client = %self.id, %request_id, index, "action timed out");
                    correlator.route(&ActionResult::timeout(&request_id, index));
                    flush_aborted(correlator, &request_id, index + 1, total);
                    correlator.fail(
                        &request_id,
                        FailureReason::Timeout,
                        Some(format!("action {index} timed out")),
                    );
                    return;
                }
            };

            if self.is_cancelled(&request_id) {
                tracing::debug!(client = %self.id, %request_id, index, "discarding result of cancelled sequence");
                return;
            }
            if result.action_index != index {
                let detail = format!(
                    "expected result for action {index}, got {}",
                    result.action_index
                );
                tracing::warn!(client = %self.id, %request_id, "{detail}");
                flush_aborted(correlator, &request_id, index, total);
                correlator.fail(&request_id, FailureReason::ActionError, Some(detail));
                return;
            }

            let failed = result.status != ActionStatus::Ok;
            let error = result.error.clone();
            correlator.route(&result);
            if failed && config.abort_on_error {
                flush_aborted(correlator, &request_id, index + 1, total);
                correlator.fail(&request_id, FailureReason::ActionError, error);
                return;
            }
            // Post-action delay, clamped to the sequence deadline so a
            // hostile value cannot park the session.
            let pause = Duration::try_from_secs_f64(delay)
                .unwrap_or(Duration::ZERO)
                .min(deadline.duration_since(Instant::now()));
            if !pause.is_zero() {
                sleep(pause).await;
            }
        }

        correlator.complete(&request_id);
        tracing::debug!(client = %self.id, %request_id, "sequence complete");
    }
}

/// Stream ABORTED placeholders for actions `[from, total)` of a dying sequence.
fn flush_aborted(correlator: &RequestCorrelator, request_id: &str, from: u32, total: u32) {
    for index in from..total {
        correlator.route(&ActionResult::aborted(request_id, index));
    }
}
