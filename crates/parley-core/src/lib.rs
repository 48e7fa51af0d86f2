pub mod frames;
pub mod ids;
pub mod roles;

pub use frames::{ClientFrame, MessageType, PresenceStatus, ServerFrame};
pub use ids::{ConnId, ConversationId, MessageId, UserId};
pub use roles::UserRole;

/// Current time as integer unix seconds, the timestamp unit used on the wire
/// and in the database.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
