use std::net::SocketAddr;
use std::sync::Arc;

mod routes;
mod store;

use routes::AppState;
use store::FileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "papershelf_server=info".into()),
        )
        .init();

    let data_dir =
        std::env::var("PAPERSHELF_DATA").unwrap_or_else(|_| "./papershelf-data".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4577);

    let store = FileStore::open(&data_dir).await?;
    let state = Arc::new(AppState { store });

    // Allow large PDF uploads (base64 inflates them by a third)
    let body_limit = axum::extract::DefaultBodyLimit::max(100 * 1024 * 1024);
    let app = routes::router(state).layer(body_limit);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, data_dir, "papershelf server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
