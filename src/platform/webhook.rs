//! HTTP intake for webhook mode.
//!
//! - `POST /webhook` receives Telegram updates pushed by the Bot API.
//! - `POST /updates` receives platform-neutral JSON envelopes.
//! - `GET /health` reports whether the dispatcher still accepts work.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::telegram;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct WebhookState {
    dispatcher: Arc<Dispatcher>,
    secret: Option<Arc<str>>,
}

impl WebhookState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.secret {
            None => true,
            Some(expected) => headers
                .get(SECRET_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected.as_ref()),
        }
    }
}

fn status_for(result: Result<bool, DispatchError>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::OK,
        Err(DispatchError::MalformedPayload(_)) => StatusCode::BAD_REQUEST,
        Err(DispatchError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
        Err(e) => {
            error!("Webhook update rejected: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn telegram_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !state.authorized(&headers) {
        warn!("Rejected webhook call with a bad secret token");
        return StatusCode::UNAUTHORIZED;
    }

    // Malformed pushes are acknowledged so Telegram doesn't redeliver them.
    let update = match telegram::decode(&body) {
        Ok(Some(update)) => update,
        Ok(None) => return StatusCode::OK,
        Err(e) => {
            warn!("Dropping webhook payload: {}", e);
            return StatusCode::OK;
        }
    };

    status_for(state.dispatcher.handle_update(update).await)
}

async fn envelope_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !state.authorized(&headers) {
        warn!("Rejected envelope call with a bad secret token");
        return StatusCode::UNAUTHORIZED;
    }

    status_for(state.dispatcher.handle_raw(&body).await)
}

async fn health(State(state): State<WebhookState>) -> (StatusCode, &'static str) {
    if state.dispatcher.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    } else {
        (StatusCode::OK, "ok")
    }
}

pub fn router(dispatcher: Arc<Dispatcher>, secret: Option<String>) -> Router {
    let state = WebhookState {
        dispatcher,
        secret: secret.map(Arc::from),
    };

    Router::new()
        .route("/webhook", post(telegram_update))
        .route("/updates", post(envelope_update))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the webhook routes until `shutdown` fires.
pub async fn serve(addr: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind webhook listener on {}", addr))?;

    info!("Webhook server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Webhook server error")?;

    info!("Webhook server stopped");
    Ok(())
}
