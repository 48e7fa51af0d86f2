use std::sync::Arc;

use parley_core::{now_ts, ConnId, PresenceStatus, ServerFrame, UserId, UserRole};

use crate::registry::{ConnectionHandle, ConnectionRegistry, Delivery};

/// Announces online/offline transitions and owns the registration side
/// effects around them.
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Register a fresh connection. In order: displace (and close) any
    /// previous handle for the identity, send the current online list to the
    /// new connection, then announce the identity online to everyone else.
    pub async fn connected(&self, identity: &UserId, role: UserRole, handle: ConnectionHandle) {
        let conn_id = handle.conn_id.clone();
        if let Some(old) = self.registry.insert(identity, role, handle) {
            tracing::info!(identity = %identity, "reconnect supersedes previous connection");
            old.close();
        }

        let users: Vec<UserId> = self
            .registry
            .online_users()
            .into_iter()
            .filter(|u| u != identity)
            .collect();
        let frame = ServerFrame::OnlineUsers {
            users,
            timestamp: now_ts(),
        };
        if self.registry.send_to(identity, &frame).await == Delivery::Failed {
            // Dead on arrival; it was never announced, so no offline event.
            tracing::warn!(identity = %identity, "connection dead before registration completed");
            if let Some(handle) = self.registry.remove(identity, &conn_id) {
                handle.close();
            }
            return;
        }

        self.broadcast_status(identity, PresenceStatus::Online).await;
        tracing::info!(identity = %identity, conn_id = %conn_id, online = self.registry.count(), "connection registered");
    }

    /// Deregister on a normal close path. Conditional on the connection
    /// identity so a superseded loop cannot evict its replacement; a no-op
    /// when the entry is already gone.
    pub async fn disconnected(&self, identity: &UserId, conn_id: &ConnId) {
        if let Some(handle) = self.registry.remove(identity, conn_id) {
            handle.close();
            tracing::info!(identity = %identity, conn_id = %conn_id, "connection deregistered");
            self.broadcast_status(identity, PresenceStatus::Offline).await;
        }
    }

    /// Evict whatever connection the identity currently has. Used when a
    /// delivery failure reveals the connection as dead.
    pub async fn evict(&self, identity: &UserId) {
        if let Some(handle) = self.registry.remove_any(identity) {
            handle.close();
            tracing::warn!(identity = %identity, "connection evicted after delivery failure");
            self.broadcast_status(identity, PresenceStatus::Offline).await;
        }
    }

    /// Best-effort status fan-out to every connection except the subject's
    /// own. A failed recipient is evicted and its own offline announcement
    /// is queued, so cascading failures drain iteratively instead of
    /// aborting the fan-out.
    pub async fn broadcast_status(&self, identity: &UserId, status: PresenceStatus) {
        let mut pending = vec![(identity.clone(), status)];

        while let Some((subject, status)) = pending.pop() {
            let frame = ServerFrame::Status {
                user_id: subject.clone(),
                status,
                timestamp: now_ts(),
            };
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };

            for target in self.registry.online_users() {
                if target == subject {
                    continue;
                }
                if self.registry.send_raw(&target, json.clone()).await == Delivery::Failed {
                    if let Some(handle) = self.registry.remove_any(&target) {
                        handle.close();
                        tracing::warn!(identity = %target, "evicted during status fan-out");
                        pending.push((target, PresenceStatus::Offline));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn uid(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn setup() -> (Arc<ConnectionRegistry>, PresenceBroadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(100)));
        let presence = PresenceBroadcaster::new(Arc::clone(&registry));
        (registry, presence)
    }

    fn frame(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
        match rx.try_recv().expect("expected a frame") {
            Outbound::Frame(json) => serde_json::from_str(&json).unwrap(),
            Outbound::Close { .. } => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn first_connection_gets_empty_online_list() {
        let (_registry, presence) = setup();
        let (handle, mut rx) = ConnectionHandle::new(8);

        presence.connected(&uid("b1"), UserRole::Buyer, handle).await;

        let online = frame(&mut rx);
        assert_eq!(online["type"], "online_users");
        assert_eq!(online["users"], serde_json::json!([]));
        assert!(rx.try_recv().is_err(), "no status frame for own transition");
    }

    #[tokio::test]
    async fn online_list_excludes_self_and_others_get_status() {
        let (_registry, presence) = setup();
        let (h1, mut rx1) = ConnectionHandle::new(8);
        presence.connected(&uid("b1"), UserRole::Buyer, h1).await;
        let _ = frame(&mut rx1); // b1's own online_users

        let (h2, mut rx2) = ConnectionHandle::new(8);
        presence.connected(&uid("m1"), UserRole::Merchant, h2).await;

        let online = frame(&mut rx2);
        assert_eq!(online["type"], "online_users");
        assert_eq!(online["users"], serde_json::json!(["b1"]));

        let status = frame(&mut rx1);
        assert_eq!(status["type"], "status");
        assert_eq!(status["user_id"], "m1");
        assert_eq!(status["status"], "online");
        assert!(rx2.try_recv().is_err(), "new connection must not see its own online event");
    }

    #[tokio::test]
    async fn disconnect_broadcasts_offline_and_clears_presence() {
        let (registry, presence) = setup();
        let (h1, mut rx1) = ConnectionHandle::new(8);
        presence.connected(&uid("b1"), UserRole::Buyer, h1).await;
        let _ = frame(&mut rx1);

        let (h2, _rx2) = ConnectionHandle::new(8);
        let m1_conn = h2.conn_id.clone();
        presence.connected(&uid("m1"), UserRole::Merchant, h2).await;
        let _ = frame(&mut rx1); // m1 online

        presence.disconnected(&uid("m1"), &m1_conn).await;

        assert!(!registry.is_online(&uid("m1")));
        let status = frame(&mut rx1);
        assert_eq!(status["type"], "status");
        assert_eq!(status["user_id"], "m1");
        assert_eq!(status["status"], "offline");
    }

    #[tokio::test]
    async fn supersession_closes_old_handle_without_offline_event() {
        let (registry, presence) = setup();
        let (observer, mut obs_rx) = ConnectionHandle::new(8);
        presence.connected(&uid("m1"), UserRole::Merchant, observer).await;
        let _ = frame(&mut obs_rx);

        let (first, _rx1) = ConnectionHandle::new(8);
        let first_conn = first.conn_id.clone();
        let first_cancel = first.cancel_token();
        presence.connected(&uid("b1"), UserRole::Buyer, first).await;
        let _ = frame(&mut obs_rx); // b1 online

        let (second, _rx2) = ConnectionHandle::new(8);
        presence.connected(&uid("b1"), UserRole::Buyer, second).await;
        assert!(first_cancel.is_cancelled(), "displaced handle must be closed");

        // The superseded loop's teardown is a no-op: identity stays online
        // and observers see no offline announcement.
        presence.disconnected(&uid("b1"), &first_conn).await;
        assert!(registry.is_online(&uid("b1")));

        let status = frame(&mut obs_rx); // re-announce from second connect
        assert_eq!(status["user_id"], "b1");
        assert_eq!(status["status"], "online");
        assert!(obs_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_recipient_is_evicted_and_announced_offline() {
        let (registry, presence) = setup();

        // A connection whose receiver is gone: every send to it fails.
        let (dead, dead_rx) = ConnectionHandle::new(8);
        presence.connected(&uid("b2"), UserRole::Buyer, dead).await;
        drop(dead_rx);

        let (observer, mut obs_rx) = ConnectionHandle::new(8);
        presence.connected(&uid("m1"), UserRole::Merchant, observer).await;
        let _ = frame(&mut obs_rx);

        // Broadcasting m1's online to b2 failed, so b2 was evicted and its
        // offline event reached the survivors.
        assert!(!registry.is_online(&uid("b2")));
        let status = frame(&mut obs_rx);
        assert_eq!(status["type"], "status");
        assert_eq!(status["user_id"], "b2");
        assert_eq!(status["status"], "offline");
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let (_registry, presence) = setup();
        presence.evict(&uid("ghost")).await;
        presence.evict(&uid("ghost")).await;
    }
}
