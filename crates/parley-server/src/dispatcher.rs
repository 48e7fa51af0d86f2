use std::sync::Arc;

use parley_core::{now_ts, ConversationId, MessageType, ServerFrame, UserId};
use parley_store::conversations::ConversationRepo;
use parley_store::{Database, StoreError};

use crate::presence::PresenceBroadcaster;
use crate::registry::{ConnectionRegistry, Delivery};
use crate::url;

/// Routes inbound events to the correct peer and to monitoring
/// administrators. Delivery is best-effort; the persisted message row is the
/// system of record and must already be committed before routing is invoked.
pub struct MessageDispatcher {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceBroadcaster>,
    db: Database,
    base_url: String,
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceBroadcaster>,
        db: Database,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            presence,
            db,
            base_url: base_url.into(),
        }
    }

    /// Deliver a chat message to the sender's peer and to every
    /// administrator except the sender. The sender identity is the
    /// connection's authenticated identity, never taken from the frame.
    pub async fn route_message(
        &self,
        sender: &UserId,
        conversation_id: ConversationId,
        content: &str,
        message_type: MessageType,
    ) -> Result<(), StoreError> {
        let Some(conv) = ConversationRepo::new(self.db.clone()).find(conversation_id)? else {
            tracing::debug!(conversation_id = %conversation_id, "message for unknown conversation dropped");
            return Ok(());
        };
        let Some(peer) = conv.peer_of(sender) else {
            tracing::warn!(
                sender = %sender,
                conversation_id = %conversation_id,
                "sender is not a participant, message dropped"
            );
            return Ok(());
        };

        let frame = ServerFrame::Message {
            conversation_id,
            sender_id: sender.clone(),
            content: self.expand_content(content, message_type),
            message_type,
            timestamp: now_ts(),
        };

        self.deliver(peer, &frame).await;

        // Unconditional monitoring fan-out: administrators see every
        // conversation's traffic.
        for admin in self.registry.admin_identities() {
            if admin != *sender {
                self.deliver(&admin, &frame).await;
            }
        }
        Ok(())
    }

    /// Typing indicators go to the peer only, never to administrators.
    pub async fn route_typing(
        &self,
        sender: &UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        let Some(conv) = ConversationRepo::new(self.db.clone()).find(conversation_id)? else {
            return Ok(());
        };
        let Some(peer) = conv.peer_of(sender) else {
            return Ok(());
        };

        let frame = ServerFrame::Typing {
            user_id: sender.clone(),
            conversation_id,
            is_typing,
        };
        self.deliver(peer, &frame).await;
        Ok(())
    }

    /// The shared delivery primitive. An offline recipient is skipped; a
    /// failed send means that recipient's connection is dead, so it is
    /// evicted (with its offline announcement) without aborting the caller's
    /// remaining fan-out.
    pub async fn deliver(&self, recipient: &UserId, frame: &ServerFrame) {
        match self.registry.send_to(recipient, frame).await {
            Delivery::Delivered => {}
            Delivery::Offline => {
                tracing::debug!(recipient = %recipient, frame = frame.frame_type(), "recipient offline, skipped");
            }
            Delivery::Failed => {
                self.presence.evict(recipient).await;
            }
        }
    }

    fn expand_content(&self, content: &str, message_type: MessageType) -> String {
        if message_type.is_media() {
            url::build_full_url(&self.base_url, content)
        } else {
            content.to_string()
        }
    }
}
