mod broker;
mod config;
mod error;
mod handlers;
mod router;
mod session;
mod types;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use log::info;
use tower_http::cors::CorsLayer;

use broker::Broker;
use config::Config;
use handlers::AppState;
use router::Router;
use types::HelloMessage;

async fn auth_middleware(
    State(api_key): State<Option<Arc<str>>>,
    req: Request,
    next: Next,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(api_key) = api_key else {
        return Ok(next.run(req).await);
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth_header.strip_prefix("Bearer ").unwrap_or(auth_header);

    if token == &*api_key {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// Inbound destinations served by this process.
fn destinations(delay: Duration) -> Router {
    let mut router = Router::new();
    router.register("/hello", "/topic/greetings", move |msg: HelloMessage| {
        handlers::produce_greeting(msg, delay)
    });
    router
}

fn app(config: &Config, router: Router) -> axum::Router {
    let state = Arc::new(AppState {
        router: Arc::new(router),
        broker: Arc::new(Broker::new()),
    });
    let api_key: Option<Arc<str>> = config.api_key.as_deref().map(Arc::from);

    axum::Router::new()
        .route(&config.ws_path, get(handlers::ws_upgrade))
        .route("/api/health", get(handlers::health))
        .layer(middleware::from_fn_with_state(api_key, auth_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_timed();

    let config = Config::from_env();
    info!("Simulated delay: {:?}", config.delay);
    if config.api_key.is_some() {
        info!("Bearer token authentication enabled");
    }

    let router = destinations(config.delay);
    for destination in router.destinations() {
        info!("Serving destination {}", destination);
    }

    let app = app(&config, router);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Starting server on {} (WebSocket at {})", addr, config.ws_path);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
