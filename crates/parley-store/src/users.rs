use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::{now_ts, UserId, UserRole};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
    pub role: UserRole,
    pub description: Option<String>,
    pub status: String,
    pub created_at: i64,
}

/// Partial update; unset fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a user with a caller-assigned id.
    #[instrument(skip(self), fields(user_id = %id, role = %role))]
    pub fn create(
        &self,
        id: &UserId,
        username: &str,
        role: UserRole,
        avatar: Option<&str>,
        description: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        let now = now_ts();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, avatar, role, description, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
                rusqlite::params![id.as_str(), username, avatar, role.to_string(), description, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("user {id} or username already exists"))
                }
                other => other.into(),
            })?;

            Ok(UserRow {
                id: id.clone(),
                username: username.to_string(),
                avatar: avatar.map(str::to_string),
                role,
                description: description.map(str::to_string),
                status: "active".to_string(),
                created_at: now,
            })
        })
    }

    /// Get a user by id.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    /// Look up a user, `None` if absent. This is the handshake contract:
    /// an absent user means the connection is rejected.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn find(&self, id: &UserId) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, avatar, role, description, status, created_at
                 FROM users WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List users, optionally filtered by role.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        role: Option<UserRole>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match role {
                Some(r) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, username, avatar, role, description, status, created_at
                         FROM users WHERE role = ?1 ORDER BY created_at LIMIT ?2 OFFSET ?3",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![r.to_string(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_user(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, username, avatar, role, description, status, created_at
                         FROM users ORDER BY created_at LIMIT ?1 OFFSET ?2",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_user(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Total user count for the given filter.
    pub fn count(&self, role: Option<UserRole>) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let count = match role {
                Some(r) => conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE role = ?1",
                    [r.to_string()],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?,
            };
            Ok(count)
        })
    }

    /// Apply a partial update, returning the fresh row.
    #[instrument(skip(self, update), fields(user_id = %id))]
    pub fn update(&self, id: &UserId, update: &UserUpdate) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET
                    username = COALESCE(?1, username),
                    avatar = COALESCE(?2, avatar),
                    description = COALESCE(?3, description),
                    status = COALESCE(?4, status)
                 WHERE id = ?5",
                rusqlite::params![
                    update.username,
                    update.avatar,
                    update.description,
                    update.status,
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
            Ok(())
        })?;
        self.get(id)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    let role_str: String = row_helpers::get(row, 3, "users", "role")?;
    Ok(UserRow {
        id: UserId::from_raw(row_helpers::get::<String>(row, 0, "users", "id")?),
        username: row_helpers::get(row, 1, "users", "username")?,
        avatar: row_helpers::get_opt(row, 2, "users", "avatar")?,
        role: row_helpers::parse_enum(&role_str, "users", "role")?,
        description: row_helpers::get_opt(row, 4, "users", "description")?,
        status: row_helpers::get(row, 5, "users", "status")?,
        created_at: row_helpers::get(row, 6, "users", "created_at")?,
    })
}
