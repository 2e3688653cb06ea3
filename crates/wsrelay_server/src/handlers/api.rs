use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use wsrelay::{HookMessage, TOPIC_PUBLISH};

use crate::AppState;

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub hook_listeners: usize,
}

/// Body of `POST /api/publish`: one message or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PublishRequest {
    Many(Vec<HookMessage>),
    One(HookMessage),
}

impl PublishRequest {
    fn into_messages(self) -> Vec<HookMessage> {
        match self {
            PublishRequest::Many(messages) => messages,
            PublishRequest::One(message) => vec![message],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Messages that carried both a topic and a payload.
    pub accepted: usize,
    /// Connections whose listener ran.
    pub listeners: usize,
}

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/publish", post(publish))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: state.relay.registry().peer_count(),
        hook_listeners: state.relay.hooks().listener_count(TOPIC_PUBLISH),
    })
}

/// Inject messages through the `topic-publish` hook.
///
/// Every subscriber of each message's topic receives it once, as a regular
/// `{topic, payload}` frame. Nothing is persisted.
async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    let messages = request.into_messages();
    let accepted = messages.iter().filter(|m| m.parts().is_some()).count();
    if accepted == 0 {
        debug!("Publish request without a usable message");
        return (
            StatusCode::BAD_REQUEST,
            "each message needs a topic and a payload",
        )
            .into_response();
    }

    let listeners = state.relay.trigger_publish(&messages);
    info!("Hook publish: {} message(s), {} listener(s)", accepted, listeners);

    (
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            accepted,
            listeners,
        }),
    )
        .into_response()
}
