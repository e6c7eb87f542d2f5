//! HTTP API handlers

use crate::context::Context;
use crate::dispatch::{query_params, Endpoint};
use crate::error::ControlError;
use crate::notify::NotifyOutcome;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ctx: Context,
}

impl AppState {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

type Params = Query<Vec<(String, String)>>;

/// Full application router. Anything unrouted goes to the NOTIFY fallback.
pub fn router(ctx: Context) -> Router {
    Router::new()
        // Command endpoints
        .route("/get", get(get_handler))
        .route("/set", get(set_handler))
        .route("/do", get(do_handler))
        .route("/remove", get(remove_handler))
        // Health check
        .route("/status", get(status_handler))
        // Event stream (SSE)
        .route("/events", get(events_handler))
        .fallback(fallback_handler)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(ctx))
}

async fn dispatch(state: &AppState, endpoint: Endpoint, Query(pairs): Params) -> Response {
    let params = query_params(pairs);
    match state.ctx.dispatcher.handle(endpoint, &params).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            debug!("{:?} request failed: {}", endpoint, e);
            e.into_response()
        }
    }
}

/// GET /get - read state
pub async fn get_handler(State(state): State<AppState>, params: Params) -> Response {
    dispatch(&state, Endpoint::Get, params).await
}

/// GET /set - mutate state, echo the result
pub async fn set_handler(State(state): State<AppState>, params: Params) -> Response {
    dispatch(&state, Endpoint::Set, params).await
}

/// GET /do - transport and grouping actions
pub async fn do_handler(State(state): State<AppState>, params: Params) -> Response {
    dispatch(&state, Endpoint::Do, params).await
}

/// GET /remove - cancel alarms and sleep timers
pub async fn remove_handler(State(state): State<AppState>, params: Params) -> Response {
    dispatch(&state, Endpoint::Remove, params).await
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub generation: u64,
    pub zones: usize,
    pub subscriptions: usize,
    pub topology_stale: bool,
    pub bus_subscribers: usize,
}

/// GET /status - Service health check
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.ctx.store.snapshot().await;
    let subscriptions = state.ctx.subscriptions.count().await;

    Json(StatusResponse {
        service: "raumfeld-control",
        version: env!("RFC_VERSION"),
        git_sha: env!("RFC_GIT_SHA"),
        generation: snapshot.generation,
        zones: snapshot.addressable_zones().count(),
        subscriptions,
        topology_stale: state.ctx.stale.is_raised(),
        bus_subscribers: state.ctx.bus.subscriber_count(),
    })
}

/// GET /events - Server-Sent Events stream
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.ctx.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        },
        Err(_) => None, // Skip lagged messages
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Event callbacks arrive as `NOTIFY /<udn-suffix>` and are always acknowledged.
/// Every other unrouted request is a 404.
pub async fn fallback_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    if method.as_str() != "NOTIFY" {
        return ControlError::page_not_found().into_response();
    }

    let body = String::from_utf8_lossy(&body);
    match state.ctx.notifications.process(uri.path(), &body).await {
        NotifyOutcome::Applied(n) => debug!("NOTIFY {} applied {} changes", uri.path(), n),
        NotifyOutcome::TopologyStale => debug!("NOTIFY {} marked topology stale", uri.path()),
        NotifyOutcome::Ignored | NotifyOutcome::Malformed => {}
    }
    StatusCode::OK.into_response()
}
