use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use subscription_server::config::Config;
use subscription_server::db::Db;
use subscription_server::routes;
use subscription_server::state::AppState;

#[tokio::main]
async fn main() {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Config (panics on missing required vars — fail-fast)
    let config = Config::from_env();
    let port = config.port;

    // HTTP client shared by the store APIs and the subscriptions store
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(15))
        .build()
        .expect("failed to build HTTP client");

    let db = Db::new(
        &config.supabase_url,
        &config.service_role_key,
        http_client.clone(),
    );

    let state = AppState {
        config: Arc::new(config),
        http_client,
        db,
    };

    // Router
    let app = routes::router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
