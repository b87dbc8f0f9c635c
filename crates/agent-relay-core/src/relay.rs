//! The relay router: registration handshake, role loops, dispatch plumbing.

use std::sync::Arc;

use agent_relay_proto::{Action, CodecError, FailureReason, Message, Role};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::correlator::RequestCorrelator;
use crate::error::RelayError;
use crate::notifier::EventNotifier;
use crate::registry::{ConnectionRegistry, ControllerHandle};

/// Channel into a connection's socket.
pub type OutboundSender = mpsc::UnboundedSender<Message>;
/// Decoded frames (or codec failures) arriving from a connection's socket.
pub type InboundReceiver = mpsc::UnboundedReceiver<Result<Message, CodecError>>;

/// The relay core.
///
/// Transports attach each accepted connection through
/// [`Relay::run_connection`] with a channel pair; everything else (session
/// lifecycle, correlation, heartbeats, event fan-out) happens in here.
pub struct Relay {
    config: RelayConfig,
    registry: ConnectionRegistry,
    correlator: Arc<RequestCorrelator>,
    notifier: EventNotifier,
}

impl Relay {
    /// Create a relay with the given configuration.
    #[must_use]
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ConnectionRegistry::new(),
            correlator: Arc::new(RequestCorrelator::new()),
            notifier: EventNotifier::new(),
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Snapshot of connected clients (also served over HTTP).
    #[must_use]
    pub fn snapshot(&self) -> Vec<agent_relay_proto::ClientSummary> {
        self.registry.snapshot()
    }

    /// Drive one connection until it ends.
    ///
    /// The first inbound frame must be REGISTER (bounded by the registration
    /// timeout); after that the connection is serviced per its role. Returns
    /// when the peer goes away, exceeds the violation budget, misses too many
    /// heartbeats, or is displaced by a re-registration.
    pub async fn run_connection(
        self: Arc<Self>,
        outbound: OutboundSender,
        mut inbound: InboundReceiver,
    ) {
        let conn = Uuid::new_v4();
        let (role, declared_id) = match self.await_registration(&mut inbound).await {
            Ok(registration) => registration,
            Err(err) => {
                tracing::debug!(%conn, %err, "connection closed before registration");
                return;
            }
        };
        match role {
            Role::Client => self.run_client(conn, declared_id, outbound, inbound).await,
            Role::Controller => self.run_controller(conn, outbound, inbound).await,
        }
    }

    async fn await_registration(
        &self,
        inbound: &mut InboundReceiver,
    ) -> Result<(Role, Option<String>), RelayError> {
        match timeout(self.config.register_timeout, inbound.recv()).await {
            Err(_) => Err(RelayError::Timeout),
            Ok(None) => Err(RelayError::Disconnected),
            Ok(Some(Ok(Message::Register { role, id }))) => Ok((role, id)),
            Ok(Some(Ok(_))) => Err(RelayError::Protocol(
                "first message must be register".to_string(),
            )),
            Ok(Some(Err(err))) => Err(RelayError::Protocol(err.to_string())),
        }
    }

    async fn run_client(
        self: Arc<Self>,
        conn: Uuid,
        declared_id: Option<String>,
        outbound: OutboundSender,
        mut inbound: InboundReceiver,
    ) {
        let (session, displaced) =
            self.registry
                .register_client(declared_id, conn, outbound.clone());
        let id = session.id().to_string();
        if let Some(old) = displaced {
            tracing::info!(client = %id, "re-registration displaces live session");
            for request_id in old.abort_all() {
                self.correlator.fail(
                    &request_id,
                    FailureReason::Disconnected,
                    Some("client re-registered".to_string()),
                );
            }
        }
        let _ = outbound.send(Message::RegisterAck { id: id.clone() });
        self.notifier.connected(&id);
        tracing::info!(client = %id, clients = self.registry.client_count(), "client registered");

        tokio::spawn(
            Arc::clone(&session).run_dispatch(Arc::clone(&self.correlator), self.config.clone()),
        );

        let mut closed = session.closed();
        let mut ping = interval(self.config.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses: u32 = 0;
        let mut violations: u32 = 0;

        loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    None => break,
                    Some(Ok(msg)) => {
                        misses = 0;
                        session.touch();
                        match msg {
                            Message::ActionResult(result) => session.on_result(result),
                            Message::Pong => {}
                            Message::Ping => {
                                let _ = outbound.send(Message::Pong);
                            }
                            other => {
                                violations += 1;
                                tracing::warn!(client = %id, message = ?other, "unexpected message from client");
                                if violations >= self.config.violation_limit {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        violations += 1;
                        tracing::warn!(client = %id, %err, "protocol violation");
                        if violations >= self.config.violation_limit {
                            tracing::warn!(client = %id, "violation limit reached, closing");
                            break;
                        }
                    }
                },
                _ = ping.tick() => {
                    if misses >= self.config.heartbeat_misses {
                        tracing::warn!(client = %id, misses, "heartbeat misses exceeded, forcing disconnect");
                        break;
                    }
                    let _ = outbound.send(Message::Ping);
                    misses += 1;
                },
                _ = closed.changed() => break,
            }
        }

        // Connection-guarded: a displaced session must not tear down its
        // replacement.
        if self.registry.unregister_client(&id, conn) {
            for request_id in session.abort_all() {
                self.correlator.fail(
                    &request_id,
                    FailureReason::Disconnected,
                    Some("client disconnected".to_string()),
                );
            }
            self.notifier.disconnected(&id);
            tracing::info!(client = %id, "client disconnected");
        }
    }

    async fn run_controller(
        self: Arc<Self>,
        conn: Uuid,
        outbound: OutboundSender,
        mut inbound: InboundReceiver,
    ) {
        let handle = self.registry.register_controller(conn, outbound.clone());
        let _ = outbound.send(Message::RegisterAck {
            id: conn.to_string(),
        });
        tracing::info!(controller = %conn, "controller registered");

        let events_task = spawn_event_forwarder(self.notifier.subscribe(), outbound.clone());

        let mut ping = interval(self.config.heartbeat_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses: u32 = 0;
        let mut violations: u32 = 0;

        loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    None => break,
                    Some(Ok(msg)) => {
                        misses = 0;
                        match msg {
                            Message::ListClients => {
                                let _ = outbound.send(Message::ClientList {
                                    clients: self.registry.snapshot(),
                                });
                            }
                            Message::ExecuteSequence { request_id, target_client_id, actions } => {
                                self.execute_sequence(&handle, request_id, &target_client_id, actions);
                            }
                            Message::CancelSequence { request_id } => {
                                self.cancel_sequence(&handle, &request_id);
                            }
                            Message::Pong => {}
                            Message::Ping => {
                                let _ = outbound.send(Message::Pong);
                            }
                            other => {
                                violations += 1;
                                tracing::warn!(controller = %conn, message = ?other, "unexpected message from controller");
                                if violations >= self.config.violation_limit {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        violations += 1;
                        tracing::warn!(controller = %conn, %err, "protocol violation");
                        if violations >= self.config.violation_limit {
                            tracing::warn!(controller = %conn, "violation limit reached, closing");
                            break;
                        }
                    }
                },
                _ = ping.tick() => {
                    if misses >= self.config.heartbeat_misses {
                        tracing::warn!(controller = %conn, misses, "heartbeat misses exceeded, forcing disconnect");
                        break;
                    }
                    let _ = outbound.send(Message::Ping);
                    misses += 1;
                },
            }
        }

        events_task.abort();
        self.registry.unregister_controller(conn);
        // Nobody is left to receive results; free the client sessions.
        for (request_id, client_id) in self.correlator.take_requests_for(conn) {
            if let Some(session) = self.registry.lookup(&client_id) {
                session.cancel(&request_id);
            }
            tracing::debug!(%request_id, "aborting sequence after controller disconnect");
        }
        tracing::info!(controller = %conn, "controller disconnected");
    }

    fn execute_sequence(
        &self,
        handle: &ControllerHandle,
        request_id: String,
        target: &str,
        actions: Vec<Action>,
    ) {
        let Some(session) = self.registry.lookup(target) else {
            tracing::debug!(%request_id, target, "rejecting sequence for unknown client");
            let _ = handle.outbound.send(Message::Rejected {
                request_id,
                reason: RelayError::NotFound(target.to_string()).reject_reason(),
            });
            return;
        };
        if let Err(err) = self.correlator.register(&request_id, handle, target) {
            let _ = handle.outbound.send(Message::Rejected {
                request_id,
                reason: err.reject_reason(),
            });
            return;
        }
        match session.enqueue(&request_id, actions, &self.config) {
            Ok(()) => {
                tracing::info!(%request_id, target, "sequence accepted");
                let _ = handle.outbound.send(Message::Accepted { request_id });
            }
            Err(err) => {
                tracing::debug!(%request_id, target, %err, "sequence rejected");
                self.correlator.discard(&request_id);
                let _ = handle.outbound.send(Message::Rejected {
                    request_id,
                    reason: err.reject_reason(),
                });
            }
        }
    }

    fn cancel_sequence(&self, handle: &ControllerHandle, request_id: &str) {
        match self.correlator.target(request_id) {
            Some((owner, client_id)) if owner == handle.id => {
                if let Some(session) = self.registry.lookup(&client_id) {
                    session.cancel(request_id);
                }
                self.correlator.fail(
                    request_id,
                    FailureReason::Aborted,
                    Some("cancelled by controller".to_string()),
                );
                tracing::info!(%request_id, "sequence cancelled");
            }
            Some(_) => {
                tracing::warn!(%request_id, "cancel from non-owning controller ignored");
            }
            None => {
                tracing::debug!(%request_id, "cancel for unknown request ignored");
            }
        }
    }
}

/// Forward status events into one controller's outbound stream.
fn spawn_event_forwarder(
    events: tokio::sync::broadcast::Receiver<Message>,
    outbound: OutboundSender,
) -> tokio::task::JoinHandle<()> {
    use tokio_stream::StreamExt;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(events);
        while let Some(event) = stream.next().await {
            match event {
                Ok(msg) => {
                    if outbound.send(msg).is_err() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    // Best-effort: a slow controller loses events.
                    tracing::debug!(missed, "controller lagged behind status events");
                }
            }
        }
    })
}
