use std::sync::Arc;

use parley_core::{now_ts, ConversationId, ServerFrame, UserId};
use parley_store::conversations::ConversationRepo;
use parley_store::{Database, StoreError};

use crate::dispatcher::MessageDispatcher;

/// Applies read events to persisted state, then notifies the other
/// participant through the dispatcher's delivery primitive.
pub struct ReadStateCoordinator {
    dispatcher: Arc<MessageDispatcher>,
    db: Database,
}

impl ReadStateCoordinator {
    pub fn new(dispatcher: Arc<MessageDispatcher>, db: Database) -> Self {
        Self { dispatcher, db }
    }

    /// Reset the reader's unread counter, flip the peer's messages to read
    /// (both in one storage transaction), then send the read receipt to the
    /// peer only. Absent conversations and non-participant readers are
    /// silent no-ops.
    pub async fn route_read(
        &self,
        reader: &UserId,
        conversation_id: ConversationId,
    ) -> Result<(), StoreError> {
        let repo = ConversationRepo::new(self.db.clone());
        let Some(conv) = repo.mark_read(conversation_id, reader)? else {
            tracing::debug!(
                reader = %reader,
                conversation_id = %conversation_id,
                "read event for unknown conversation or non-participant dropped"
            );
            return Ok(());
        };

        // mark_read only returns a row when the reader occupies a slot, so
        // the peer always resolves here.
        let Some(peer) = conv.peer_of(reader) else {
            return Ok(());
        };

        let frame = ServerFrame::Read {
            conversation_id,
            reader_id: reader.clone(),
            timestamp: now_ts(),
        };
        // No administrator fan-out for read events.
        self.dispatcher.deliver(peer, &frame).await;
        Ok(())
    }
}
