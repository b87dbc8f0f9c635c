//! Controller-side SDK for the agent relay.
//!
//! Wraps the wire protocol behind a small async API: connect and register,
//! submit an action sequence and suspend until its terminal signal, list
//! clients, observe status events, cancel. One background task reads the
//! socket, one writes it; callers never poll.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_proto::{
    Action, ActionOutcome, ActionResult, ClientSummary, CodecError, FailureReason, Message,
    RejectReason, Role, StatusEvent, codec,
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, tungstenite::Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Controller SDK failure.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Could not reach or speak WebSocket to the relay.
    #[error("connection failed: {0}")]
    Connect(#[from] tungstenite::Error),
    /// The relay answered the handshake with something other than an ack.
    #[error("registration failed")]
    Registration,
    /// The connection is gone.
    #[error("connection closed")]
    Closed,
    /// The relay refused the sequence outright.
    #[error("sequence rejected: {0:?}")]
    Rejected(RejectReason),
    /// The sequence was accepted but terminated early.
    #[error("sequence failed: {reason:?}")]
    Failed {
        reason: FailureReason,
        error: Option<String>,
        /// Results streamed before the failure.
        results: Vec<ActionResult>,
    },
    /// The relay did not answer within the response timeout.
    #[error("timed out waiting for the relay")]
    Timeout,
    /// The relay sent a frame the codec refused.
    #[error("bad frame from relay: {0}")]
    Codec(#[from] CodecError),
}

/// Everything observed for one completed sequence.
#[derive(Debug)]
pub struct SequenceReport {
    /// The request id used on the wire.
    pub request_id: String,
    /// Per-action results in dispatch order, screenshots included.
    pub results: Vec<ActionResult>,
    /// The relay's terminal summary rows.
    pub outcomes: Vec<ActionOutcome>,
}

/// A client connect/disconnect notification.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    /// Client the event concerns.
    pub client_id: String,
    /// What happened.
    pub event: StatusEvent,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

enum SequenceDone {
    Complete {
        results: Vec<ActionResult>,
        outcomes: Vec<ActionOutcome>,
    },
    Failed {
        reason: FailureReason,
        error: Option<String>,
        results: Vec<ActionResult>,
    },
}

struct Pending {
    accept: Option<oneshot::Sender<Result<(), RejectReason>>>,
    done: Option<oneshot::Sender<SequenceDone>>,
    results: Vec<ActionResult>,
}

struct Shared {
    pending: Mutex<HashMap<String, Pending>>,
    list_waiters: Mutex<VecDeque<oneshot::Sender<Vec<ClientSummary>>>>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl Shared {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            pending: Mutex::new(HashMap::new()),
            list_waiters: Mutex::new(VecDeque::new()),
            events_tx,
        }
    }
}

/// A registered controller connection to the relay.
///
/// Dropping the client (or calling [`ControllerClient::close`]) tears down
/// the connection; outstanding calls resolve with `Closed`.
pub struct ControllerClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    controller_id: String,
    response_timeout: Duration,
}

impl ControllerClient {
    /// Connect to the relay and register as a controller.
    ///
    /// # Errors
    /// `Connect` on transport failure, `Registration` if the relay answers
    /// the handshake with anything but `REGISTER_ACK`.
    pub async fn connect(url: &str) -> Result<Self, ControllerError> {
        let (stream, _) = connect_async(url).await?;
        let (mut sink, mut source) = stream.split();

        send_frame(
            &mut sink,
            &Message::Register {
                role: Role::Controller,
                id: None,
            },
        )
        .await?;
        let controller_id = await_ack(&mut sink, &mut source).await?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(source, Arc::clone(&shared), outbound.clone()));

        Ok(Self {
            shared,
            outbound,
            controller_id,
            response_timeout: Duration::from_secs(10),
        })
    }

    /// Id the relay assigned to this controller session.
    #[must_use]
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Override the timeout for ACCEPTED/CLIENT_LIST replies.
    #[must_use]
    pub const fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Execute a sequence on one client under a generated request id.
    ///
    /// Suspends until the relay's terminal signal. The wait after ACCEPTED is
    /// unbounded here; the relay's per-sequence deadline guarantees a
    /// terminal arrives.
    ///
    /// # Errors
    /// `Rejected` on immediate refusal, `Failed` on early termination,
    /// `Timeout` if the accept reply never comes, `Closed` if the connection
    /// dies mid-wait.
    pub async fn execute_sequence(
        &self,
        client_id: &str,
        actions: Vec<Action>,
    ) -> Result<SequenceReport, ControllerError> {
        self.execute_sequence_with_id(Uuid::new_v4().to_string(), client_id, actions)
            .await
    }

    /// Execute a sequence under a caller-chosen request id.
    ///
    /// The id must be unique for this connection's lifetime; knowing it up
    /// front is what makes [`ControllerClient::cancel`] usable mid-flight.
    ///
    /// # Errors
    /// See [`ControllerClient::execute_sequence`].
    pub async fn execute_sequence_with_id(
        &self,
        request_id: impl Into<String>,
        client_id: &str,
        actions: Vec<Action>,
    ) -> Result<SequenceReport, ControllerError> {
        let request_id = request_id.into();
        let (accept_tx, accept_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(
            request_id.clone(),
            Pending {
                accept: Some(accept_tx),
                done: Some(done_tx),
                results: Vec::new(),
            },
        );
        self.send(Message::ExecuteSequence {
            request_id: request_id.clone(),
            target_client_id: client_id.to_string(),
            actions,
        })?;

        match timeout(self.response_timeout, accept_rx).await {
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                return Err(ControllerError::Timeout);
            }
            Ok(Err(_)) => return Err(ControllerError::Closed),
            Ok(Ok(Err(reason))) => return Err(ControllerError::Rejected(reason)),
            Ok(Ok(Ok(()))) => {}
        }

        match done_rx.await {
            Err(_) => Err(ControllerError::Closed),
            Ok(SequenceDone::Complete { results, outcomes }) => Ok(SequenceReport {
                request_id,
                results,
                outcomes,
            }),
            Ok(SequenceDone::Failed { reason, error, results }) => {
                Err(ControllerError::Failed { reason, error, results })
            }
        }
    }

    /// Snapshot of connected clients.
    ///
    /// # Errors
    /// `Timeout` if the relay does not answer, `Closed` if the connection is
    /// gone.
    pub async fn list_clients(&self) -> Result<Vec<ClientSummary>, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.shared.list_waiters.lock().unwrap().push_back(tx);
        self.send(Message::ListClients)?;
        match timeout(self.response_timeout, rx).await {
            Err(_) => Err(ControllerError::Timeout),
            Ok(Err(_)) => Err(ControllerError::Closed),
            Ok(Ok(clients)) => Ok(clients),
        }
    }

    /// Subscribe to client connect/disconnect events from this moment on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Cancel an accepted sequence by request id.
    ///
    /// The pending `execute_sequence_with_id` call resolves with
    /// `Failed { reason: Aborted, .. }` once the relay confirms.
    ///
    /// # Errors
    /// `Closed` if the connection is gone.
    pub fn cancel(&self, request_id: &str) -> Result<(), ControllerError> {
        self.send(Message::CancelSequence {
            request_id: request_id.to_string(),
        })
    }

    /// Close the connection.
    pub fn close(self) {
        drop(self);
    }

    fn send(&self, message: Message) -> Result<(), ControllerError> {
        self.outbound
            .send(message)
            .map_err(|_| ControllerError::Closed)
    }
}

async fn send_frame(sink: &mut WsSink, message: &Message) -> Result<(), ControllerError> {
    let text = codec::encode(message)?;
    sink.send(tungstenite::Message::text(text)).await?;
    Ok(())
}

/// Drain frames until the registration ack, answering heartbeats meanwhile.
async fn await_ack(sink: &mut WsSink, source: &mut WsSource) -> Result<String, ControllerError> {
    loop {
        let frame = source.next().await.ok_or(ControllerError::Closed)??;
        match frame {
            tungstenite::Message::Text(text) => match codec::decode(text.as_str())? {
                Message::RegisterAck { id } => return Ok(id),
                Message::Ping => send_frame(sink, &Message::Pong).await?,
                other => {
                    tracing::debug!(message = ?other, "unexpected message before ack");
                    return Err(ControllerError::Registration);
                }
            },
            tungstenite::Message::Close(_) => return Err(ControllerError::Closed),
            _ => {}
        }
    }
}

async fn write_loop(mut sink: WsSink, mut outbound_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound_rx.recv().await {
        let text = match codec::encode(&message) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(%err, "failed to encode message");
                continue;
            }
        };
        if sink.send(tungstenite::Message::text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.send(tungstenite::Message::Close(None)).await;
}

async fn read_loop(
    mut source: WsSource,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(tungstenite::Message::Text(text)) => text,
            Ok(tungstenite::Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(%err, "websocket error");
                break;
            }
        };
        match codec::decode(text.as_str()) {
            Ok(message) => dispatch_message(&shared, &outbound, message),
            Err(err) => tracing::warn!(%err, "bad frame from relay"),
        }
    }
    // Settle every waiter with Closed by dropping their senders.
    shared.pending.lock().unwrap().clear();
    shared.list_waiters.lock().unwrap().clear();
    tracing::debug!("relay connection closed");
}

fn dispatch_message(
    shared: &Shared,
    outbound: &mpsc::UnboundedSender<Message>,
    message: Message,
) {
    match message {
        Message::Accepted { request_id } => {
            if let Some(pending) = shared.pending.lock().unwrap().get_mut(&request_id) {
                if let Some(accept) = pending.accept.take() {
                    let _ = accept.send(Ok(()));
                }
            }
        }
        Message::Rejected { request_id, reason } => {
            if let Some(mut pending) = shared.pending.lock().unwrap().remove(&request_id) {
                if let Some(accept) = pending.accept.take() {
                    let _ = accept.send(Err(reason));
                }
            }
        }
        Message::ActionResult(result) => {
            if let Some(pending) = shared.pending.lock().unwrap().get_mut(&result.request_id) {
                pending.results.push(result);
            } else {
                tracing::debug!(request_id = %result.request_id, "result for unknown request");
            }
        }
        Message::SequenceComplete { request_id, results } => {
            if let Some(mut pending) = shared.pending.lock().unwrap().remove(&request_id) {
                if let Some(done) = pending.done.take() {
                    let _ = done.send(SequenceDone::Complete {
                        results: std::mem::take(&mut pending.results),
                        outcomes: results,
                    });
                }
            }
        }
        Message::SequenceFailed { request_id, reason, error } => {
            if let Some(mut pending) = shared.pending.lock().unwrap().remove(&request_id) {
                if let Some(done) = pending.done.take() {
                    let _ = done.send(SequenceDone::Failed {
                        reason,
                        error,
                        results: std::mem::take(&mut pending.results),
                    });
                }
            }
        }
        Message::ClientList { clients } => {
            if let Some(waiter) = shared.list_waiters.lock().unwrap().pop_front() {
                let _ = waiter.send(clients);
            }
        }
        Message::ClientStatusEvent { client_id, event, timestamp } => {
            let _ = shared.events_tx.send(ClientEvent {
                client_id,
                event,
                timestamp,
            });
        }
        Message::Ping => {
            let _ = outbound.send(Message::Pong);
        }
        Message::Pong => {}
        other => tracing::debug!(message = ?other, "unexpected message from relay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_proto::ActionStatus;
    use tokio_test::assert_ok;
    use tokio::sync::mpsc::unbounded_channel;

    fn shared_with_pending(request_id: &str) -> (Arc<Shared>, oneshot::Receiver<Result<(), RejectReason>>, oneshot::Receiver<SequenceDone>) {
        let shared = Arc::new(Shared::new());
        let (accept_tx, accept_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(
            request_id.to_string(),
            Pending {
                accept: Some(accept_tx),
                done: Some(done_tx),
                results: Vec::new(),
            },
        );
        (shared, accept_rx, done_rx)
    }

    #[tokio::test]
    async fn test_accept_resolves_waiter() {
        let (shared, accept_rx, _done_rx) = shared_with_pending("r1");
        let (outbound, _rx) = unbounded_channel();
        dispatch_message(&shared, &outbound, Message::Accepted { request_id: "r1".into() });
        tokio_test::assert_ok!(accept_rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_resolves_and_clears() {
        let (shared, accept_rx, _done_rx) = shared_with_pending("r1");
        let (outbound, _rx) = unbounded_channel();
        dispatch_message(
            &shared,
            &outbound,
            Message::Rejected { request_id: "r1".into(), reason: RejectReason::NotFound },
        );
        assert_eq!(accept_rx.await.unwrap().unwrap_err(), RejectReason::NotFound);
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_accumulate_until_complete() {
        let (shared, _accept_rx, done_rx) = shared_with_pending("r1");
        let (outbound, _rx) = unbounded_channel();

        dispatch_message(
            &shared,
            &outbound,
            Message::ActionResult(ActionResult::ok("r1", 0).with_screenshot(b"png")),
        );
        dispatch_message(
            &shared,
            &outbound,
            Message::ActionResult(ActionResult::ok("r1", 1)),
        );
        let outcomes = vec![
            ActionOutcome { action_index: 0, status: ActionStatus::Ok, error: None, timestamp: 0 },
            ActionOutcome { action_index: 1, status: ActionStatus::Ok, error: None, timestamp: 0 },
        ];
        dispatch_message(
            &shared,
            &outbound,
            Message::SequenceComplete { request_id: "r1".into(), results: outcomes },
        );

        match done_rx.await.unwrap() {
            SequenceDone::Complete { results, outcomes } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].screenshot_bytes().unwrap(), b"png");
                assert_eq!(outcomes.len(), 2);
            }
            SequenceDone::Failed { .. } => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_failure_carries_partial_results() {
        let (shared, _accept_rx, done_rx) = shared_with_pending("r1");
        let (outbound, _rx) = unbounded_channel();

        dispatch_message(
            &shared,
            &outbound,
            Message::ActionResult(ActionResult::ok("r1", 0)),
        );
        dispatch_message(
            &shared,
            &outbound,
            Message::SequenceFailed {
                request_id: "r1".into(),
                reason: FailureReason::Timeout,
                error: Some("action 1 timed out".into()),
            },
        );

        match done_rx.await.unwrap() {
            SequenceDone::Failed { reason, error, results } => {
                assert_eq!(reason, FailureReason::Timeout);
                assert_eq!(error.as_deref(), Some("action 1 timed out"));
                assert_eq!(results.len(), 1);
            }
            SequenceDone::Complete { .. } => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_client_list_answers_waiters_in_order() {
        let shared = Arc::new(Shared::new());
        let (outbound, _rx) = unbounded_channel();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        shared.list_waiters.lock().unwrap().push_back(first_tx);
        shared.list_waiters.lock().unwrap().push_back(second_tx);

        dispatch_message(&shared, &outbound, Message::ClientList { clients: vec![] });
        assert!(first_rx.await.unwrap().is_empty());

        dispatch_message(
            &shared,
            &outbound,
            Message::ClientList {
                clients: vec![ClientSummary {
                    id: "agent-1".into(),
                    status: agent_relay_proto::ClientStatus::Idle,
                }],
            },
        );
        assert_eq!(second_rx.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_answered_and_events_forwarded() {
        let shared = Arc::new(Shared::new());
        let (outbound, mut rx) = unbounded_channel();
        let mut events = shared.events_tx.subscribe();

        dispatch_message(&shared, &outbound, Message::Ping);
        assert!(matches!(rx.try_recv().unwrap(), Message::Pong));

        dispatch_message(
            &shared,
            &outbound,
            Message::ClientStatusEvent {
                client_id: "agent-1".into(),
                event: StatusEvent::Connected,
                timestamp: 1,
            },
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.client_id, "agent-1");
        assert_eq!(event.event, StatusEvent::Connected);
    }
}
