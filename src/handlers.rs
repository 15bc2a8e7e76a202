use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use log::info;

use crate::broker::Broker;
use crate::error::AppError;
use crate::router::Router;
use crate::session;
use crate::types::{Greeting, HealthResponse, HelloMessage};

pub struct AppState {
    pub router: Arc<Router>,
    pub broker: Arc<Broker>,
}

fn escape_html(input: &str) -> String {
    html_escape::encode_double_quoted_attribute(input).replace('\'', "&#39;")
}

/// Turns an inbound name into the greeting broadcast on `/topic/greetings`.
///
/// Waits `delay` first (skipped when zero), then HTML-escapes the name.
pub async fn produce_greeting(message: HelloMessage, delay: Duration) -> anyhow::Result<Greeting> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Ok(Greeting::new(format!("Hello, {}!", escape_html(message.name()))))
}

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    info!("Upgrading connection to WebSocket");
    ws.on_upgrade(move |socket| session::run(socket, state.router.clone(), state.broker.clone()))
}

pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        destinations: state.router.destinations(),
        topics: state.broker.topic_count(),
    }))
}
