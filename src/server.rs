//! HTTP surface of the broadcaster.
//!
//! Two routers share one [`Broadcaster`]: [`router`] serves browsers the
//! live-update streams, [`internal_router`] takes publishes from the case,
//! message and invitation handlers. Anyone who reaches the internal listener
//! can push events into any case, so it must stay on a private interface.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
        HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::TypedHeader;
use serde::Deserialize;
use serde_json::{json, Value};

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use axum::extract::connect_info::ConnectInfo;

use crate::{
    broadcaster::Broadcaster,
    config::Config,
    event::{CaseId, EventKind},
    sse::EventStream,
    subscriber::ChannelSubscriber,
};

#[derive(Clone)]
struct AppState {
    broadcaster: Broadcaster,
    keepalive: Option<Duration>,
}

/// Body accepted by the publish endpoint.
#[derive(Debug, Deserialize)]
struct PublishRequest {
    event: String,
    #[serde(default = "empty_object")]
    payload: Value,
}

fn empty_object() -> Value {
    json!({})
}

pub async fn serve(config: Config) -> std::io::Result<()> {
    let broadcaster = Broadcaster::with_limits(config.limits);
    let public = router(broadcaster.clone(), config.keepalive);
    let internal = internal_router(broadcaster);

    let public_listener = tokio::net::TcpListener::bind(config.bind).await?;
    let internal_listener = tokio::net::TcpListener::bind(config.internal_bind).await?;
    tracing::info!(
        "listening on {}, publishes on {}",
        public_listener.local_addr()?,
        internal_listener.local_addr()?
    );

    tokio::try_join!(
        axum::serve(
            public_listener,
            public.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
        axum::serve(internal_listener, internal).into_future(),
    )?;
    Ok(())
}

/// Browser-facing routes. The router needs connect info, so serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(broadcaster: Broadcaster, keepalive: Option<Duration>) -> Router {
    let state = AppState {
        broadcaster,
        keepalive,
    };

    Router::new()
        .route("/cases/:case_id/events", get(subscribe_handler))
        .route("/health", get(health_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .with_state(state)
}

/// Publish routes for trusted producers only.
pub fn internal_router(broadcaster: Broadcaster) -> Router {
    let state = AppState {
        broadcaster,
        keepalive: None,
    };

    Router::new()
        .route("/cases/:case_id/events", post(publish_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn subscribe_handler(
    Path(case_id): Path<String>,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let user_agent = if let Some(TypedHeader(user_agent)) = user_agent {
        user_agent.to_string()
    } else {
        String::from("Unknown browser")
    };
    let case_id = CaseId::from(case_id);

    let max_queued = state.broadcaster.limits().max_queued_messages;
    let (subscriber, receiver) = ChannelSubscriber::new(max_queued);
    let unsubscribe = match state
        .broadcaster
        .try_subscribe(&case_id, Arc::new(subscriber))
    {
        Ok(unsubscribe) => unsubscribe,
        Err(e) => {
            tracing::warn!("`{user_agent}` at {addr} refused: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    tracing::info!("`{user_agent}` at {addr} watching case {case_id}");

    let stream = EventStream::new(receiver, unsubscribe, state.keepalive);
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn publish_handler(
    Path(case_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> StatusCode {
    // Custom names are allowed, but usually mean a typo in a producer.
    if let Err(e) = EventKind::try_from(request.event.as_str()) {
        tracing::debug!(case_id = %case_id, "{e}");
    }
    state
        .broadcaster
        .publish(case_id, &request.event, &request.payload);
    StatusCode::ACCEPTED
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cases": state.broadcaster.case_count(),
        "subscribers": state.broadcaster.total_subscribers(),
    }))
}
