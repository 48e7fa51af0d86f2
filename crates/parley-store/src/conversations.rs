use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{now_ts, ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One of the two fixed positions in a two-party conversation. Each slot has
/// its own unread counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantSlot {
    First,
    Second,
}

impl ParticipantSlot {
    pub fn unread_column(&self) -> &'static str {
        match self {
            Self::First => "unread1",
            Self::Second => "unread2",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub participant1_id: UserId,
    pub participant2_id: UserId,
    pub unread1: i64,
    pub unread2: i64,
    pub last_message: Option<String>,
    pub last_message_time: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationRow {
    /// Which slot the given user occupies, if any.
    pub fn slot_of(&self, user: &UserId) -> Option<ParticipantSlot> {
        if *user == self.participant1_id {
            Some(ParticipantSlot::First)
        } else if *user == self.participant2_id {
            Some(ParticipantSlot::Second)
        } else {
            None
        }
    }

    /// The participant that is not `user`, if `user` is a participant.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        match self.slot_of(user)? {
            ParticipantSlot::First => Some(&self.participant2_id),
            ParticipantSlot::Second => Some(&self.participant1_id),
        }
    }

    pub fn participant(&self, slot: ParticipantSlot) -> &UserId {
        match slot {
            ParticipantSlot::First => &self.participant1_id,
            ParticipantSlot::Second => &self.participant2_id,
        }
    }

    pub fn unread(&self, slot: ParticipantSlot) -> i64 {
        match slot {
            ParticipantSlot::First => self.unread1,
            ParticipantSlot::Second => self.unread2,
        }
    }
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the conversation for this participant pair, creating it if absent.
    /// Slot assignment is fixed at creation and never depends on roles.
    #[instrument(skip(self), fields(p1 = %participant1, p2 = %participant2))]
    pub fn get_or_create(
        &self,
        participant1: &UserId,
        participant2: &UserId,
    ) -> Result<ConversationRow, StoreError> {
        if participant1 == participant2 {
            return Err(StoreError::Conflict(
                "conversation requires two distinct participants".to_string(),
            ));
        }
        self.db.with_conn(|conn| {
            if let Some(existing) = find_pair_in(conn, participant1, participant2)? {
                return Ok(existing);
            }

            let now = now_ts();
            conn.execute(
                "INSERT INTO conversations (participant1_id, participant2_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![participant1.as_str(), participant2.as_str(), now],
            )?;
            let id = ConversationId::from_raw(conn.last_insert_rowid());

            Ok(ConversationRow {
                id,
                participant1_id: participant1.clone(),
                participant2_id: participant2.clone(),
                unread1: 0,
                unread2: 0,
                last_message: None,
                last_message_time: None,
                created_at: now,
                updated_at: now,
            })
        })
    }

    /// Look up a conversation, `None` if absent. Routing operations drop
    /// silently on `None`; REST handlers turn it into a 404.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn find(&self, id: ConversationId) -> Result<Option<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| find_in(conn, id))
    }

    pub fn get(&self, id: ConversationId) -> Result<ConversationRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))
    }

    /// List conversations, optionally restricted to ones the given user
    /// participates in (either slot). Ordered by most recent activity.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        participant: Option<&UserId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match participant {
                Some(user) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM conversations
                         WHERE participant1_id = ?1 OR participant2_id = ?1
                         ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![user.as_str(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_conversation(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM conversations
                         ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_conversation(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    pub fn count(&self, participant: Option<&UserId>) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let count = match participant {
                Some(user) => conn.query_row(
                    "SELECT COUNT(*) FROM conversations
                     WHERE participant1_id = ?1 OR participant2_id = ?1",
                    [user.as_str()],
                    |row| row.get(0),
                )?,
                None => {
                    conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?
                }
            };
            Ok(count)
        })
    }

    /// Atomic single-statement increment of one slot's unread counter. This
    /// and `reset_unread` are the only mutation paths for the counters; the
    /// invariant is maintained, never recomputed on the hot path.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn increment_unread(
        &self,
        id: ConversationId,
        slot: ParticipantSlot,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE conversations SET {col} = {col} + 1, updated_at = ?1 WHERE id = ?2",
                    col = slot.unread_column(),
                ),
                rusqlite::params![now_ts(), id.as_i64()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// Unconditional reset of one slot's unread counter to zero.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn reset_unread(
        &self,
        id: ConversationId,
        slot: ParticipantSlot,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE conversations SET {col} = 0 WHERE id = ?1",
                    col = slot.unread_column(),
                ),
                [id.as_i64()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            Ok(())
        })
    }

    /// The read-state mutation: reset the reader's unread counter and flip
    /// every message authored by the other participant to read, in one
    /// transaction so a concurrent message-create cannot interleave between
    /// the two statements.
    ///
    /// Returns the conversation (with the reader's counter already zeroed)
    /// or `None` when the conversation is absent or the reader is not a
    /// participant — both are silent no-ops for the caller.
    #[instrument(skip(self), fields(conversation_id = %id, reader = %reader))]
    pub fn mark_read(
        &self,
        id: ConversationId,
        reader: &UserId,
    ) -> Result<Option<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(mut conv) = find_in(&tx, id)? else {
                return Ok(None);
            };
            let Some(slot) = conv.slot_of(reader) else {
                return Ok(None);
            };

            tx.execute(
                &format!(
                    "UPDATE conversations SET {col} = 0 WHERE id = ?1",
                    col = slot.unread_column(),
                ),
                [id.as_i64()],
            )?;
            tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2",
                rusqlite::params![id.as_i64(), reader.as_str()],
            )?;
            tx.commit()?;

            match slot {
                ParticipantSlot::First => conv.unread1 = 0,
                ParticipantSlot::Second => conv.unread2 = 0,
            }
            Ok(Some(conv))
        })
    }

    /// Defensive reconciliation: recompute both counters from the message
    /// table and overwrite them. Normal operation never calls this; it exists
    /// to detect and repair drift.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn reconcile_unread(&self, id: ConversationId) -> Result<(i64, i64), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET
                    unread1 = (SELECT COUNT(*) FROM messages m
                               WHERE m.conversation_id = conversations.id
                                 AND m.sender_id = conversations.participant2_id
                                 AND m.is_read = 0),
                    unread2 = (SELECT COUNT(*) FROM messages m
                               WHERE m.conversation_id = conversations.id
                                 AND m.sender_id = conversations.participant1_id
                                 AND m.is_read = 0)
                 WHERE id = ?1",
                [id.as_i64()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {id}")));
            }
            let counters = conn.query_row(
                "SELECT unread1, unread2 FROM conversations WHERE id = ?1",
                [id.as_i64()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(counters)
        })
    }
}

const COLUMNS: &str = "id, participant1_id, participant2_id, unread1, unread2, \
                       last_message, last_message_time, created_at, updated_at";

pub(crate) fn find_in(
    conn: &rusqlite::Connection,
    id: ConversationId,
) -> Result<Option<ConversationRow>, StoreError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {COLUMNS} FROM conversations WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_i64()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_conversation(row)?)),
        None => Ok(None),
    }
}

fn find_pair_in(
    conn: &rusqlite::Connection,
    participant1: &UserId,
    participant2: &UserId,
) -> Result<Option<ConversationRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM conversations
         WHERE participant1_id = ?1 AND participant2_id = ?2",
    ))?;
    let mut rows = stmt.query([participant1.as_str(), participant2.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_conversation(row)?)),
        None => Ok(None),
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get(row, 0, "conversations", "id")?),
        participant1_id: UserId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "conversations",
            "participant1_id",
        )?),
        participant2_id: UserId::from_raw(row_helpers::get::<String>(
            row,
            2,
            "conversations",
            "participant2_id",
        )?),
        unread1: row_helpers::get(row, 3, "conversations", "unread1")?,
        unread2: row_helpers::get(row, 4, "conversations", "unread2")?,
        last_message: row_helpers::get_opt(row, 5, "conversations", "last_message")?,
        last_message_time: row_helpers::get_opt(row, 6, "conversations", "last_message_time")?,
        created_at: row_helpers::get(row, 7, "conversations", "created_at")?,
        updated_at: row_helpers::get(row, 8, "conversations", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;
    use parley_core::UserRole;

    fn setup() -> (Database, ConversationRepo) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        users.create(&UserId::from_raw("b1"), "buyer1", UserRole::Buyer, None, None).unwrap();
        users.create(&UserId::from_raw("m1"), "merchant1", UserRole::Merchant, None, None).unwrap();
        users.create(&UserId::from_raw("b2"), "buyer2", UserRole::Buyer, None, None).unwrap();
        (db.clone(), ConversationRepo::new(db))
    }

    fn uid(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (_db, repo) = setup();
        let a = repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();
        let b = repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(repo.count(None).unwrap(), 1);
    }

    #[test]
    fn same_participant_twice_is_rejected() {
        let (_db, repo) = setup();
        let result = repo.get_or_create(&uid("b1"), &uid("b1"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn slot_and_peer_resolution() {
        let (_db, repo) = setup();
        let conv = repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();

        assert_eq!(conv.slot_of(&uid("b1")), Some(ParticipantSlot::First));
        assert_eq!(conv.slot_of(&uid("m1")), Some(ParticipantSlot::Second));
        assert_eq!(conv.slot_of(&uid("b2")), None);

        assert_eq!(conv.peer_of(&uid("b1")), Some(&uid("m1")));
        assert_eq!(conv.peer_of(&uid("m1")), Some(&uid("b1")));
        assert_eq!(conv.peer_of(&uid("b2")), None);
    }

    #[test]
    fn find_absent_is_none() {
        let (_db, repo) = setup();
        assert!(repo.find(ConversationId::from_raw(999)).unwrap().is_none());
        assert!(repo.get(ConversationId::from_raw(999)).is_err());
    }

    #[test]
    fn increment_and_reset_unread() {
        let (_db, repo) = setup();
        let conv = repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();

        repo.increment_unread(conv.id, ParticipantSlot::Second).unwrap();
        repo.increment_unread(conv.id, ParticipantSlot::Second).unwrap();
        let fetched = repo.get(conv.id).unwrap();
        assert_eq!(fetched.unread1, 0);
        assert_eq!(fetched.unread2, 2);

        repo.reset_unread(conv.id, ParticipantSlot::Second).unwrap();
        let fetched = repo.get(conv.id).unwrap();
        assert_eq!(fetched.unread2, 0);
    }

    #[test]
    fn increment_absent_conversation_fails() {
        let (_db, repo) = setup();
        let result = repo.increment_unread(ConversationId::from_raw(42), ParticipantSlot::First);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn mark_read_ignores_non_participants() {
        let (_db, repo) = setup();
        let conv = repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();
        assert!(repo.mark_read(conv.id, &uid("b2")).unwrap().is_none());
        assert!(repo.mark_read(ConversationId::from_raw(99), &uid("b1")).unwrap().is_none());
    }

    #[test]
    fn list_filters_by_participant_in_either_slot() {
        let (_db, repo) = setup();
        repo.get_or_create(&uid("b1"), &uid("m1")).unwrap();
        repo.get_or_create(&uid("m1"), &uid("b2")).unwrap();

        let for_m1 = repo.list(Some(&uid("m1")), 100, 0).unwrap();
        assert_eq!(for_m1.len(), 2);

        let for_b2 = repo.list(Some(&uid("b2")), 100, 0).unwrap();
        assert_eq!(for_b2.len(), 1);

        assert_eq!(repo.count(Some(&uid("m1"))).unwrap(), 2);
    }

    #[test]
    fn slot_other_flips() {
        assert_eq!(ParticipantSlot::First.other(), ParticipantSlot::Second);
        assert_eq!(ParticipantSlot::Second.other(), ParticipantSlot::First);
    }
}
