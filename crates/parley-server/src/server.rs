use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use parley_core::UserId;
use parley_store::users::UserRepo;
use parley_store::Database;

use crate::dispatcher::MessageDispatcher;
use crate::handlers;
use crate::presence::PresenceBroadcaster;
use crate::read_state::ReadStateCoordinator;
use crate::registry::ConnectionRegistry;
use crate::session;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Base URL media paths are expanded against on the wire.
    pub base_url: String,
    pub max_send_queue: usize,
    /// Bound on a single outbound send; a recipient slower than this is
    /// treated as disconnected.
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A connection whose pongs are older than this is reaped.
    pub client_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            base_url: "http://localhost:8000".to_string(),
            max_send_queue: 256,
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceBroadcaster>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub coordinator: Arc<ReadStateCoordinator>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new(config.send_timeout));
        let presence = Arc::new(PresenceBroadcaster::new(Arc::clone(&registry)));
        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&presence),
            db.clone(),
            config.base_url.clone(),
        ));
        let coordinator = Arc::new(ReadStateCoordinator::new(
            Arc::clone(&dispatcher),
            db.clone(),
        ));
        Self {
            db,
            registry,
            presence,
            dispatcher,
            coordinator,
            config,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{user_id}", get(ws_handler))
        .route("/health", get(handlers::health))
        .route(
            "/api/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/api/users/{user_id}",
            get(handlers::get_user).put(handlers::update_user),
        )
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(handlers::get_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(handlers::list_conversation_messages),
        )
        .route(
            "/api/conversations/{conversation_id}/read",
            axum::routing::put(handlers::mark_conversation_read),
        )
        .route(
            "/api/conversations/{conversation_id}/messages/read-all",
            axum::routing::put(handlers::mark_messages_read_all),
        )
        .route(
            "/api/messages",
            get(handlers::list_messages).post(handlers::create_message),
        )
        .route(
            "/api/messages/{message_id}",
            axum::routing::delete(handlers::delete_message),
        )
        .route(
            "/api/quick-replies",
            axum::routing::post(handlers::create_quick_reply),
        )
        .route(
            "/api/quick-replies/user/{user_id}",
            get(handlers::list_quick_replies),
        )
        .route(
            "/api/quick-replies/{id}",
            axum::routing::put(handlers::update_quick_reply)
                .delete(handlers::delete_quick_reply),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps background
/// tasks alive.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config, db);

    // Reap connections whose heartbeats stopped; they go through the normal
    // disconnect path so presence stays consistent.
    let reaper_state = state.clone();
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_state.config.reaper_interval);
        loop {
            ticker.tick().await;
            let stale = reaper_state
                .registry
                .stale_connections(reaper_state.config.client_timeout);
            for (identity, conn_id) in stale {
                tracing::info!(identity = %identity, "reaping unresponsive connection");
                reaper_state.presence.disconnected(&identity, &conn_id).await;
            }
        }
    });

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(state);
    tracing::info!(port = local_addr.port(), "parley server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _reaper: reaper,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _reaper: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade. The path carries the claimed identity; the handshake
/// resolves it against the user table before the connection may open.
async fn ws_handler(
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: String, state: AppState) {
    let identity = UserId::from_raw(user_id);
    let user = match UserRepo::new(state.db.clone()).find(&identity) {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!(identity = %identity, "handshake rejected: unknown user");
            reject(socket, "unknown user").await;
            return;
        }
        Err(e) => {
            tracing::error!(identity = %identity, error = %e, "handshake lookup failed");
            reject(socket, "handshake failed").await;
            return;
        }
    };

    tracing::info!(identity = %identity, role = %user.role, "websocket connected");
    session::run(socket, identity, user.role, state).await;
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: session::POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_test_server() -> (ServerHandle, String, Database) {
        let db = Database::in_memory().unwrap();
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let handle = start(config, db.clone()).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        (handle, base, db)
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (_handle, base, _db) = start_test_server().await;

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let state = AppState::new(ServerConfig::default(), db);
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn rest_round_trip_maintains_unread_invariant() {
        let (_handle, base, _db) = start_test_server().await;
        let client = reqwest::Client::new();

        for (id, username, role) in [("b1", "buyer1", "buyer"), ("m1", "merchant1", "merchant")] {
            let resp = client
                .post(format!("{base}/api/users"))
                .json(&serde_json::json!({ "id": id, "username": username, "role": role }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let conv: serde_json::Value = client
            .post(format!("{base}/api/conversations"))
            .json(&serde_json::json!({ "participant1_id": "b1", "participant2_id": "m1" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let conv_id = conv["id"].as_i64().unwrap();

        // Two messages from b1, peer offline the whole time: rows persist
        // unread and m1's counter climbs.
        for content in ["hello", "are you there?"] {
            let message: serde_json::Value = client
                .post(format!("{base}/api/messages"))
                .json(&serde_json::json!({
                    "conversation_id": conv_id,
                    "sender_id": "b1",
                    "content": content,
                }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(message["is_read"], false);
        }

        let conv: serde_json::Value = client
            .get(format!("{base}/api/conversations/{conv_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(conv["unread2"], 2);
        assert_eq!(conv["unread1"], 0);
        assert_eq!(conv["last_message"], "are you there?");

        // m1 reads everything.
        let resp = client
            .put(format!(
                "{base}/api/conversations/{conv_id}/messages/read-all?reader_id=m1"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let conv: serde_json::Value = client
            .get(format!("{base}/api/conversations/{conv_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(conv["unread2"], 0);

        let messages: serde_json::Value = client
            .get(format!(
                "{base}/api/conversations/{conv_id}/messages?order=asc"
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(messages["count"], 2);
        for message in messages["results"].as_array().unwrap() {
            assert_eq!(message["is_read"], true);
        }
    }

    #[tokio::test]
    async fn unknown_conversation_is_404() {
        let (_handle, base, _db) = start_test_server().await;
        let resp = reqwest::get(format!("{base}/api/conversations/999")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn message_to_unknown_conversation_is_404() {
        let (_handle, base, _db) = start_test_server().await;
        let client = reqwest::Client::new();

        client
            .post(format!("{base}/api/users"))
            .json(&serde_json::json!({ "id": "b1", "username": "buyer1", "role": "buyer" }))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("{base}/api/messages"))
            .json(&serde_json::json!({
                "conversation_id": 999,
                "sender_id": "b1",
                "content": "void",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
