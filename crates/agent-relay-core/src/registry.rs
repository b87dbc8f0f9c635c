//! Live connection bookkeeping for both roles.

use std::sync::Arc;

use agent_relay_proto::ClientSummary;
use dashmap::DashMap;
use uuid::Uuid;

use crate::relay::OutboundSender;
use crate::session::ClientSession;

/// Outbound handle for one registered controller connection.
#[derive(Clone)]
pub struct ControllerHandle {
    /// Controller session id (the physical connection id).
    pub id: Uuid,
    /// Channel into the controller's socket.
    pub outbound: OutboundSender,
}

/// Tracks every open connection, keyed by role-specific id.
///
/// Clients are keyed by their declared (or generated) string id,
/// controllers by connection UUID. Sharded maps keep registration and
/// lookup safe under many concurrent connection tasks without a global
/// lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<String, Arc<ClientSession>>,
    controllers: DashMap<Uuid, ControllerHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client connection, enforcing id uniqueness.
    ///
    /// A collision displaces the older live session, which is returned so
    /// the caller can tear it down (abort its queue, settle its waiters).
    pub fn register_client(
        &self,
        declared_id: Option<String>,
        conn: Uuid,
        outbound: OutboundSender,
    ) -> (Arc<ClientSession>, Option<Arc<ClientSession>>) {
        let id = declared_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = ClientSession::new(id.clone(), conn, outbound);
        let displaced = self.clients.insert(id, Arc::clone(&session));
        (session, displaced)
    }

    /// Remove a client entry; idempotent and connection-guarded.
    ///
    /// Returns `false` when the id is gone or now owned by a newer
    /// connection, so a displaced session's cleanup never evicts its
    /// replacement.
    pub fn unregister_client(&self, id: &str, conn: Uuid) -> bool {
        self.clients
            .remove_if(id, |_, session| session.conn() == conn)
            .is_some()
    }

    /// Look up a live client session.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of connected clients, sorted by id for stable output.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<ClientSummary> = self
            .clients
            .iter()
            .map(|entry| ClientSummary {
                id: entry.key().clone(),
                status: entry.value().status(),
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Register a controller connection.
    pub fn register_controller(&self, conn: Uuid, outbound: OutboundSender) -> ControllerHandle {
        let handle = ControllerHandle { id: conn, outbound };
        self.controllers.insert(conn, handle.clone());
        handle
    }

    /// Remove a controller entry; idempotent.
    pub fn unregister_controller(&self, id: Uuid) {
        self.controllers.remove(&id);
    }

    /// Number of live client sessions.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of live controller connections.
    #[must_use]
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }
}
