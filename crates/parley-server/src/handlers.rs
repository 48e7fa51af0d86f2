//! REST boundary: conventional CRUD over the persistence collaborator.
//! The live core only depends on these through the store; nothing here
//! touches registry state except the read-all path, which goes through the
//! read-state coordinator so the peer gets its live receipt.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use parley_core::{ConversationId, MessageId, MessageType, UserId, UserRole};
use parley_store::conversations::{ConversationRepo, ConversationRow};
use parley_store::messages::{MessageFilter, MessageRepo, MessageRow, SortOrder};
use parley_store::quick_replies::{QuickReplyRepo, QuickReplyRow, QuickReplyUpdate};
use parley_store::users::{UserRepo, UserRow, UserUpdate};
use parley_store::StoreError;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    pub count: i64,
    pub results: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

fn status_of(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn internal(e: StoreError) -> StatusCode {
    error!(error = %e, "store operation failed");
    status_of(&e)
}

fn page_bounds(page: u32, page_size: u32) -> (u32, u32) {
    let page = page.max(1);
    (page_size, (page - 1) * page_size)
}

// ── Users ──

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub role: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

fn default_message_page_size() -> u32 {
    50
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserListQuery>,
) -> Result<Json<PaginatedResponse<UserRow>>, StatusCode> {
    let role = match query.role.as_deref() {
        Some(raw) => Some(raw.parse::<UserRole>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let (limit, offset) = page_bounds(query.page, query.page_size);

    let repo = UserRepo::new(state.db.clone());
    let count = repo.count(role).map_err(internal)?;
    let results = repo.list(role, limit, offset).map_err(internal)?;
    Ok(Json(PaginatedResponse { count, results }))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserRow>, StatusCode> {
    let user = UserRepo::new(state.db.clone())
        .get(&UserId::from_raw(user_id))
        .map_err(internal)?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub id: String,
    pub username: String,
    pub role: UserRole,
    pub avatar: Option<String>,
    pub description: Option<String>,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserRow>, StatusCode> {
    let user = UserRepo::new(state.db.clone())
        .create(
            &UserId::from_raw(req.id),
            &req.username,
            req.role,
            req.avatar.as_deref(),
            req.description.as_deref(),
        )
        .map_err(internal)?;
    Ok(Json(user))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<UserUpdate>,
) -> Result<Json<UserRow>, StatusCode> {
    let user = UserRepo::new(state.db.clone())
        .update(&UserId::from_raw(user_id), &update)
        .map_err(internal)?;
    Ok(Json(user))
}

// ── Conversations ──

#[derive(Debug, Deserialize)]
pub struct ConversationListQuery {
    pub participant: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationListQuery>,
) -> Result<Json<PaginatedResponse<ConversationRow>>, StatusCode> {
    let participant = query.participant.map(UserId::from_raw);
    let (limit, offset) = page_bounds(query.page, query.page_size);

    let repo = ConversationRepo::new(state.db.clone());
    let count = repo.count(participant.as_ref()).map_err(internal)?;
    let results = repo
        .list(participant.as_ref(), limit, offset)
        .map_err(internal)?;
    Ok(Json(PaginatedResponse { count, results }))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub participant1_id: String,
    pub participant2_id: String,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<ConversationRow>, StatusCode> {
    let p1 = UserId::from_raw(req.participant1_id);
    let p2 = UserId::from_raw(req.participant2_id);

    // Both participants must exist before a conversation is minted.
    let users = UserRepo::new(state.db.clone());
    users.get(&p1).map_err(internal)?;
    users.get(&p2).map_err(internal)?;

    let conv = ConversationRepo::new(state.db.clone())
        .get_or_create(&p1, &p2)
        .map_err(internal)?;
    Ok(Json(conv))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
) -> Result<Json<ConversationRow>, StatusCode> {
    let conv = ConversationRepo::new(state.db.clone())
        .get(ConversationId::from_raw(conversation_id))
        .map_err(internal)?;
    Ok(Json(conv))
}

#[derive(Debug, Deserialize)]
pub struct ConversationMessagesQuery {
    pub order: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_message_page_size")]
    pub page_size: u32,
}

pub async fn list_conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<ConversationMessagesQuery>,
) -> Result<Json<PaginatedResponse<MessageRow>>, StatusCode> {
    let conversation_id = ConversationId::from_raw(conversation_id);
    ConversationRepo::new(state.db.clone())
        .get(conversation_id)
        .map_err(internal)?;

    let order = match query.order.as_deref() {
        Some("asc") => SortOrder::Asc,
        _ => SortOrder::Desc,
    };
    let (limit, offset) = page_bounds(query.page, query.page_size);
    let filter = MessageFilter {
        conversation_id: Some(conversation_id),
        ..Default::default()
    };

    let repo = MessageRepo::new(state.db.clone());
    let count = repo.count(&filter).map_err(internal)?;
    let results = repo.list(&filter, order, limit, offset).map_err(internal)?;
    Ok(Json(PaginatedResponse { count, results }))
}

#[derive(Debug, Deserialize)]
pub struct ReaderQuery {
    pub user_id: String,
}

/// Counter reset only; the full read-state path (flags + live receipt) is
/// the read-all endpoint below and the websocket read frame.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<ReaderQuery>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let repo = ConversationRepo::new(state.db.clone());
    let conv = repo
        .get(ConversationId::from_raw(conversation_id))
        .map_err(internal)?;
    let slot = conv
        .slot_of(&UserId::from_raw(query.user_id))
        .ok_or(StatusCode::BAD_REQUEST)?;
    repo.reset_unread(conv.id, slot).map_err(internal)?;
    Ok(Json(StatusResponse { status: "success" }))
}

#[derive(Debug, Deserialize)]
pub struct ReadAllQuery {
    pub reader_id: String,
}

pub async fn mark_messages_read_all(
    State(state): State<AppState>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<ReadAllQuery>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let conversation_id = ConversationId::from_raw(conversation_id);
    ConversationRepo::new(state.db.clone())
        .get(conversation_id)
        .map_err(internal)?;

    state
        .coordinator
        .route_read(&UserId::from_raw(query.reader_id), conversation_id)
        .await
        .map_err(internal)?;
    Ok(Json(StatusResponse { status: "success" }))
}

// ── Messages ──

#[derive(Debug, Deserialize)]
pub struct MessageListQuery {
    pub conversation_id: Option<i64>,
    pub sender_id: Option<String>,
    pub message_type: Option<String>,
    pub order: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_message_page_size")]
    pub page_size: u32,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<PaginatedResponse<MessageRow>>, StatusCode> {
    let message_type = match query.message_type.as_deref() {
        Some(raw) => Some(raw.parse::<MessageType>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let filter = MessageFilter {
        conversation_id: query.conversation_id.map(ConversationId::from_raw),
        sender_id: query.sender_id.map(UserId::from_raw),
        message_type,
    };
    let order = match query.order.as_deref() {
        Some("asc") => SortOrder::Asc,
        _ => SortOrder::Desc,
    };
    let (limit, offset) = page_bounds(query.page, query.page_size);

    let repo = MessageRepo::new(state.db.clone());
    let count = repo.count(&filter).map_err(internal)?;
    let results = repo.list(&filter, order, limit, offset).map_err(internal)?;
    Ok(Json(PaginatedResponse { count, results }))
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub conversation_id: i64,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
}

/// The message-create path: the row and its counter increment commit here,
/// before the sender's websocket frame triggers any live routing. The live
/// channel is never the system of record.
pub async fn create_message(
    State(state): State<AppState>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<Json<MessageRow>, StatusCode> {
    let message = MessageRepo::new(state.db.clone())
        .create(
            ConversationId::from_raw(req.conversation_id),
            &UserId::from_raw(req.sender_id),
            &req.content,
            req.message_type,
        )
        .map_err(internal)?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
) -> Result<Json<StatusResponse>, StatusCode> {
    MessageRepo::new(state.db.clone())
        .delete(MessageId::from_raw(message_id))
        .map_err(internal)?;
    Ok(Json(StatusResponse { status: "success" }))
}

// ── Quick replies ──

pub async fn list_quick_replies(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<QuickReplyRow>>, StatusCode> {
    let replies = QuickReplyRepo::new(state.db.clone())
        .list_for_user(&UserId::from_raw(user_id))
        .map_err(internal)?;
    Ok(Json(replies))
}

#[derive(Debug, Deserialize)]
pub struct CreateQuickReplyRequest {
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub sort_order: i64,
}

pub async fn create_quick_reply(
    State(state): State<AppState>,
    Json(req): Json<CreateQuickReplyRequest>,
) -> Result<Json<QuickReplyRow>, StatusCode> {
    let reply = QuickReplyRepo::new(state.db.clone())
        .create(&UserId::from_raw(req.user_id), &req.content, req.sort_order)
        .map_err(internal)?;
    Ok(Json(reply))
}

pub async fn update_quick_reply(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<QuickReplyUpdate>,
) -> Result<Json<QuickReplyRow>, StatusCode> {
    let reply = QuickReplyRepo::new(state.db.clone())
        .update(id, &update)
        .map_err(internal)?;
    Ok(Json(reply))
}

pub async fn delete_quick_reply(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>, StatusCode> {
    QuickReplyRepo::new(state.db.clone())
        .deactivate(id)
        .map_err(internal)?;
    Ok(Json(StatusResponse { status: "success" }))
}

// ── Health ──

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
