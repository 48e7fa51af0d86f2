use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_core::{ConnId, ServerFrame, UserId, UserRole};

/// What goes down a connection's outbound channel: a serialized frame, or an
/// instruction to close the transport with a specific code.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

/// Outcome of a single delivery attempt. An offline recipient is not an
/// error; a failed send means the recipient's connection is dead and must be
/// evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Offline,
    Failed,
}

/// Ephemeral handle to one live transport. Owned by the registry while the
/// identity is online; displaced handles are cancelled so their session
/// loops exit.
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    last_pong: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(queue: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue);
        let handle = Self {
            conn_id: ConnId::new(),
            tx,
            cancel: CancellationToken::new(),
            last_pong: Arc::new(AtomicU64::new(now_secs())),
        };
        (handle, rx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the owning session loop. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    fn clone_parts(&self) -> (mpsc::Sender<Outbound>, CancellationToken) {
        (self.tx.clone(), self.cancel.clone())
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct Registered {
    role: UserRole,
    handle: ConnectionHandle,
}

/// Process-wide map from identity to its single live connection. At most one
/// entry per identity, last writer wins. The online set is the key set; the
/// administrator set is derived from entry roles so it can never drift from
/// the connection map.
pub struct ConnectionRegistry {
    connections: DashMap<UserId, Registered>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            send_timeout,
        }
    }

    /// Insert or overwrite the identity's entry. Returns the displaced
    /// handle when the identity was already connected; the caller must close
    /// it — holding a half-dead socket would let writes block or error.
    pub fn insert(
        &self,
        identity: &UserId,
        role: UserRole,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        self.connections
            .insert(identity.clone(), Registered { role, handle })
            .map(|old| old.handle)
    }

    /// Remove the identity's entry, but only if it still belongs to the
    /// given connection. A session loop that was superseded must not evict
    /// its replacement. Idempotent.
    pub fn remove(&self, identity: &UserId, conn_id: &ConnId) -> Option<ConnectionHandle> {
        self.connections
            .remove_if(identity, |_, entry| entry.handle.conn_id == *conn_id)
            .map(|(_, entry)| entry.handle)
    }

    /// Remove whatever entry the identity currently has. Used when a
    /// delivery failure implies the connection is dead.
    pub fn remove_any(&self, identity: &UserId) -> Option<ConnectionHandle> {
        self.connections.remove(identity).map(|(_, entry)| entry.handle)
    }

    /// Constant-time online check.
    pub fn is_online(&self, identity: &UserId) -> bool {
        self.connections.contains_key(identity)
    }

    /// Snapshot of every online identity.
    pub fn online_users(&self) -> Vec<UserId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of identities with monitoring privilege.
    pub fn admin_identities(&self) -> Vec<UserId> {
        self.connections
            .iter()
            .filter(|e| e.value().role.is_admin())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver one frame to one identity, bounded by the send timeout so a
    /// stuck recipient cannot block the delivering task indefinitely.
    pub async fn send_to(&self, identity: &UserId, frame: &ServerFrame) -> Delivery {
        match serde_json::to_string(frame) {
            Ok(json) => self.send_raw(identity, json).await,
            Err(e) => {
                tracing::error!(frame = frame.frame_type(), error = %e, "frame serialization failed");
                Delivery::Offline
            }
        }
    }

    /// Deliver an already-serialized frame. The sender handle is cloned out
    /// of the map before awaiting so no shard lock is held across the send.
    pub async fn send_raw(&self, identity: &UserId, json: String) -> Delivery {
        let (tx, cancel) = match self.connections.get(identity) {
            Some(entry) => entry.value().handle.clone_parts(),
            None => return Delivery::Offline,
        };
        if cancel.is_cancelled() {
            return Delivery::Failed;
        }
        match tx
            .send_timeout(Outbound::Frame(json), self.send_timeout)
            .await
        {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                tracing::debug!(identity = %identity, error = %e, "outbound send failed");
                Delivery::Failed
            }
        }
    }

    /// Ask a connection to close its transport with the given code. Guarded
    /// by the connection identity so a superseded session cannot close its
    /// replacement.
    pub async fn send_close(
        &self,
        identity: &UserId,
        conn_id: &ConnId,
        code: u16,
        reason: &'static str,
    ) {
        let tx = match self.connections.get(identity) {
            Some(entry) if entry.value().handle.conn_id == *conn_id => {
                entry.value().handle.tx.clone()
            }
            _ => return,
        };
        let _ = tx
            .send_timeout(Outbound::Close { code, reason }, self.send_timeout)
            .await;
    }

    /// Record a pong for liveness, but only if the entry still belongs to
    /// the ponging connection.
    pub fn record_pong(&self, identity: &UserId, conn_id: &ConnId) {
        if let Some(entry) = self.connections.get(identity) {
            if entry.value().handle.conn_id == *conn_id {
                entry.value().handle.record_pong();
            }
        }
    }

    /// Connections whose pongs stopped arriving. The reaper disconnects
    /// them through the normal presence path.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<(UserId, ConnId)> {
        self.connections
            .iter()
            .filter(|e| !e.value().handle.is_alive(timeout))
            .map(|e| (e.key().clone(), e.value().handle.conn_id.clone()))
            .collect()
    }
}
