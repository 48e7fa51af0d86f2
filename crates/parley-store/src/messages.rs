use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{now_ts, ConversationId, MessageId, MessageType, UserId};

use crate::conversations;
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cap on the last-message preview cached on the conversation row.
const PREVIEW_MAX_CHARS: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub is_read: bool,
    pub created_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    pub conversation_id: Option<ConversationId>,
    pub sender_id: Option<UserId>,
    pub message_type: Option<MessageType>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The message-create path. Inserts the row unread, refreshes the
    /// conversation's last-message cache and increments the *peer* slot's
    /// unread counter, all in one transaction. This commit must complete
    /// before the message is routed live; the live channel is best-effort
    /// and this row is the system of record.
    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, sender = %sender))]
    pub fn create(
        &self,
        conversation_id: ConversationId,
        sender: &UserId,
        content: &str,
        message_type: MessageType,
    ) -> Result<MessageRow, StoreError> {
        let now = now_ts();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let conv = conversations::find_in(&tx, conversation_id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
            let slot = conv.slot_of(sender).ok_or_else(|| {
                StoreError::Conflict(format!(
                    "user {sender} is not a participant of conversation {conversation_id}"
                ))
            })?;

            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, message_type, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    conversation_id.as_i64(),
                    sender.as_str(),
                    content,
                    message_type.to_string(),
                    now,
                ],
            )?;
            let id = MessageId::from_raw(tx.last_insert_rowid());

            let preview = preview_text(content, message_type);
            tx.execute(
                &format!(
                    "UPDATE conversations
                     SET last_message = ?1, last_message_time = ?2, updated_at = ?2,
                         {col} = {col} + 1
                     WHERE id = ?3",
                    col = slot.other().unread_column(),
                ),
                rusqlite::params![preview, now, conversation_id.as_i64()],
            )?;

            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id,
                sender_id: sender.clone(),
                content: content.to_string(),
                message_type,
                is_read: false,
                created_at: now,
            })
        })
    }

    /// Get a message by id.
    pub fn get(&self, id: MessageId) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_i64()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// List messages matching the filter, ordered by creation time.
    #[instrument(skip(self, filter))]
    pub fn list(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let (where_sql, params) = filter_clause(filter);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages{where_sql}
                 ORDER BY created_at {order}, id {order} LIMIT ?{l} OFFSET ?{o}",
                order = order.sql(),
                l = params.len() + 1,
                o = params.len() + 2,
            ))?;

            let mut all: Vec<Box<dyn rusqlite::types::ToSql>> = params;
            all.push(Box::new(limit));
            all.push(Box::new(offset));
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                all.iter().map(|p| p.as_ref()).collect();

            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self, filter: &MessageFilter) -> Result<i64, StoreError> {
        let (where_sql, params) = filter_clause(filter);
        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let count = conn.query_row(
                &format!("SELECT COUNT(*) FROM messages{where_sql}"),
                param_refs.as_slice(),
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Hard delete.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id.as_i64()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {id}")));
            }
            Ok(())
        })
    }
}

fn filter_clause(filter: &MessageFilter) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(id) = filter.conversation_id {
        params.push(Box::new(id.as_i64()));
        conditions.push(format!("conversation_id = ?{}", params.len()));
    }
    if let Some(ref sender) = filter.sender_id {
        params.push(Box::new(sender.as_str().to_string()));
        conditions.push(format!("sender_id = ?{}", params.len()));
    }
    if let Some(message_type) = filter.message_type {
        params.push(Box::new(message_type.to_string()));
        conditions.push(format!("message_type = ?{}", params.len()));
    }

    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (where_sql, params)
}

fn preview_text(content: &str, message_type: MessageType) -> String {
    match message_type {
        MessageType::Image => "[image]".to_string(),
        MessageType::File => "[file]".to_string(),
        MessageType::Text => content.chars().take(PREVIEW_MAX_CHARS).collect(),
    }
}

const COLUMNS: &str = "id, conversation_id, sender_id, content, message_type, is_read, created_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let type_str: String = row_helpers::get(row, 4, "messages", "message_type")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get(
            row,
            1,
            "messages",
            "conversation_id",
        )?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "sender_id")?),
        content: row_helpers::get(row, 3, "messages", "content")?,
        message_type: row_helpers::parse_enum(&type_str, "messages", "message_type")?,
        is_read: row_helpers::get::<i64>(row, 5, "messages", "is_read")? != 0,
        created_at: row_helpers::get(row, 6, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::{ConversationRepo, ParticipantSlot};
    use crate::users::UserRepo;
    use parley_core::UserRole;

    fn uid(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn setup() -> (Database, ConversationId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.create(&uid("b1"), "buyer1", UserRole::Buyer, None, None).unwrap();
        users.create(&uid("m1"), "merchant1", UserRole::Merchant, None, None).unwrap();
        users.create(&uid("b2"), "buyer2", UserRole::Buyer, None, None).unwrap();
        let conv = ConversationRepo::new(db.clone())
            .get_or_create(&uid("b1"), &uid("m1"))
            .unwrap();
        (db, conv.id)
    }

    #[test]
    fn create_increments_peer_unread_only() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db.clone());
        let convs = ConversationRepo::new(db);

        for _ in 0..3 {
            repo.create(conv_id, &uid("b1"), "hello", MessageType::Text).unwrap();
        }

        let conv = convs.get(conv_id).unwrap();
        assert_eq!(conv.unread(ParticipantSlot::Second), 3);
        assert_eq!(conv.unread(ParticipantSlot::First), 0);
    }

    #[test]
    fn create_stores_row_unread() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        let msg = repo.create(conv_id, &uid("b1"), "hello", MessageType::Text).unwrap();
        assert!(!msg.is_read);

        let fetched = repo.get(msg.id).unwrap();
        assert!(!fetched.is_read);
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.sender_id, uid("b1"));
    }

    #[test]
    fn create_updates_last_message_cache() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db.clone());
        let convs = ConversationRepo::new(db);

        repo.create(conv_id, &uid("b1"), "hello there", MessageType::Text).unwrap();
        let conv = convs.get(conv_id).unwrap();
        assert_eq!(conv.last_message.as_deref(), Some("hello there"));
        assert!(conv.last_message_time.is_some());

        repo.create(conv_id, &uid("m1"), "/media/pic.png", MessageType::Image).unwrap();
        let conv = convs.get(conv_id).unwrap();
        assert_eq!(conv.last_message.as_deref(), Some("[image]"));
    }

    #[test]
    fn long_text_preview_is_truncated() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db.clone());
        let convs = ConversationRepo::new(db);

        let long = "x".repeat(500);
        repo.create(conv_id, &uid("b1"), &long, MessageType::Text).unwrap();
        let conv = convs.get(conv_id).unwrap();
        assert_eq!(conv.last_message.unwrap().chars().count(), 100);
    }

    #[test]
    fn create_rejects_absent_conversation() {
        let (db, _) = setup();
        let repo = MessageRepo::new(db);
        let result = repo.create(
            ConversationId::from_raw(999),
            &uid("b1"),
            "hi",
            MessageType::Text,
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn create_rejects_non_participant_sender() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        let result = repo.create(conv_id, &uid("b2"), "hi", MessageType::Text);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn mark_read_flips_only_peer_messages() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db.clone());
        let convs = ConversationRepo::new(db);

        repo.create(conv_id, &uid("b1"), "one", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("b1"), "two", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("m1"), "reply", MessageType::Text).unwrap();

        // m1 reads: b1's messages flip, m1's own stays unread
        let conv = convs.mark_read(conv_id, &uid("m1")).unwrap().unwrap();
        assert_eq!(conv.unread(ParticipantSlot::Second), 0);

        let all = repo
            .list(
                &MessageFilter {
                    conversation_id: Some(conv_id),
                    ..Default::default()
                },
                SortOrder::Asc,
                100,
                0,
            )
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].is_read);
        assert!(all[1].is_read);
        assert!(!all[2].is_read, "reader's own message must stay unread");

        // b1 still has m1's message counted
        let conv = convs.get(conv_id).unwrap();
        assert_eq!(conv.unread(ParticipantSlot::First), 1);
    }

    #[test]
    fn reconcile_matches_incremental_counters() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db.clone());
        let convs = ConversationRepo::new(db);

        repo.create(conv_id, &uid("b1"), "one", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("m1"), "two", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("b1"), "three", MessageType::Text).unwrap();
        convs.mark_read(conv_id, &uid("m1")).unwrap();
        repo.create(conv_id, &uid("b1"), "four", MessageType::Text).unwrap();

        let before = convs.get(conv_id).unwrap();
        let (unread1, unread2) = convs.reconcile_unread(conv_id).unwrap();
        assert_eq!(unread1, before.unread1);
        assert_eq!(unread2, before.unread2);
    }

    #[test]
    fn list_filters_and_orders() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);

        repo.create(conv_id, &uid("b1"), "first", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("m1"), "second", MessageType::Text).unwrap();
        repo.create(conv_id, &uid("b1"), "/media/f.pdf", MessageType::File).unwrap();

        let from_b1 = repo
            .list(
                &MessageFilter {
                    sender_id: Some(uid("b1")),
                    ..Default::default()
                },
                SortOrder::Asc,
                100,
                0,
            )
            .unwrap();
        assert_eq!(from_b1.len(), 2);

        let files = repo
            .list(
                &MessageFilter {
                    message_type: Some(MessageType::File),
                    ..Default::default()
                },
                SortOrder::Asc,
                100,
                0,
            )
            .unwrap();
        assert_eq!(files.len(), 1);

        let desc = repo
            .list(
                &MessageFilter {
                    conversation_id: Some(conv_id),
                    ..Default::default()
                },
                SortOrder::Desc,
                100,
                0,
            )
            .unwrap();
        assert_eq!(desc[0].content, "/media/f.pdf");

        assert_eq!(repo.count(&MessageFilter::default()).unwrap(), 3);
    }

    #[test]
    fn delete_message() {
        let (db, conv_id) = setup();
        let repo = MessageRepo::new(db);
        let msg = repo.create(conv_id, &uid("b1"), "gone", MessageType::Text).unwrap();
        repo.delete(msg.id).unwrap();
        assert!(repo.get(msg.id).is_err());
        assert!(matches!(repo.delete(msg.id), Err(StoreError::NotFound(_))));
    }
}
