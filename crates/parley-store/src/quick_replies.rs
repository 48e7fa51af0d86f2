use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{now_ts, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cap on active canned replies per user.
pub const MAX_QUICK_REPLIES: i64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuickReplyRow {
    pub id: i64,
    pub user_id: UserId,
    pub content: String,
    pub sort_order: i64,
    pub is_active: bool,
    pub created_at: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct QuickReplyUpdate {
    pub content: Option<String>,
    pub sort_order: Option<i64>,
}

pub struct QuickReplyRepo {
    db: Database,
}

impl QuickReplyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Active replies for a user, in sort order.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_for_user(&self, user: &UserId) -> Result<Vec<QuickReplyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, sort_order, is_active, created_at
                 FROM quick_replies
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY sort_order",
            )?;
            let mut rows = stmt.query([user.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_quick_reply(row)?);
            }
            Ok(results)
        })
    }

    /// Create a reply; at most `MAX_QUICK_REPLIES` active per user.
    #[instrument(skip(self, content), fields(user_id = %user))]
    pub fn create(
        &self,
        user: &UserId,
        content: &str,
        sort_order: i64,
    ) -> Result<QuickReplyRow, StoreError> {
        let now = now_ts();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM quick_replies WHERE user_id = ?1 AND is_active = 1",
                [user.as_str()],
                |row| row.get(0),
            )?;
            if active >= MAX_QUICK_REPLIES {
                return Err(StoreError::Conflict(format!(
                    "user {user} already has {MAX_QUICK_REPLIES} quick replies"
                )));
            }

            tx.execute(
                "INSERT INTO quick_replies (user_id, content, sort_order, is_active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                rusqlite::params![user.as_str(), content, sort_order, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(QuickReplyRow {
                id,
                user_id: user.clone(),
                content: content.to_string(),
                sort_order,
                is_active: true,
                created_at: now,
            })
        })
    }

    /// Apply a partial update, returning the fresh row.
    #[instrument(skip(self, update))]
    pub fn update(&self, id: i64, update: &QuickReplyUpdate) -> Result<QuickReplyRow, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE quick_replies SET
                    content = COALESCE(?1, content),
                    sort_order = COALESCE(?2, sort_order)
                 WHERE id = ?3",
                rusqlite::params![update.content, update.sort_order, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("quick reply {id}")));
            }

            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, sort_order, is_active, created_at
                 FROM quick_replies WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_quick_reply(row),
                None => Err(StoreError::NotFound(format!("quick reply {id}"))),
            }
        })
    }

    /// Soft delete.
    #[instrument(skip(self))]
    pub fn deactivate(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed =
                conn.execute("UPDATE quick_replies SET is_active = 0 WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("quick reply {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_quick_reply(row: &rusqlite::Row<'_>) -> Result<QuickReplyRow, StoreError> {
    Ok(QuickReplyRow {
        id: row_helpers::get(row, 0, "quick_replies", "id")?,
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "quick_replies", "user_id")?),
        content: row_helpers::get(row, 2, "quick_replies", "content")?,
        sort_order: row_helpers::get(row, 3, "quick_replies", "sort_order")?,
        is_active: row_helpers::get::<i64>(row, 4, "quick_replies", "is_active")? != 0,
        created_at: row_helpers::get(row, 5, "quick_replies", "created_at")?,
    })
}
