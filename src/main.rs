use std::path::PathBuf;

use parley_server::ServerConfig;
use parley_store::Database;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting parley chat server");

    let port = std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let base_url = std::env::var("PARLEY_BASE_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"));
    let db_path = std::env::var("PARLEY_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_home().join(".parley").join("parley.db"));

    let db = Database::open(&db_path).expect("Failed to open database");

    let config = ServerConfig {
        port,
        base_url,
        ..Default::default()
    };
    let handle = parley_server::start(config, db)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "parley server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
