use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labsense_api::storage::JsonSnapshotStore;
use labsense_api::{create_router, AppState, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labsense_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LabSense exam session engine");

    let config = Config::load().expect("Failed to load configuration");
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );

    let store = Arc::new(
        JsonSnapshotStore::new(&config.data_dir).expect("Failed to initialize snapshot store"),
    );

    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(config, store);
    app_state
        .engine
        .load()
        .await
        .expect("Failed to load state snapshots");

    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    tracing::info!("Server listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
