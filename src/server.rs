use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::logging::{SharedJournal, Stage};
use crate::proxy::{self, ProxyResult, StreamResult, UpstreamAuth};
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_JOURNAL_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: BridgeConfig,
    pub client: reqwest::Client,
    pub journal: SharedJournal,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/chat/completions", post(handle_chat_completions))
        .route("/health", get(handle_health))
        .route("/journal", get(handle_journal))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .journal
                .error(Stage::Inbound, format!("Failed to parse request: {}", e));
            let err = ChatErrorResponse::invalid_request(format!("Invalid request body: {}", e));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let is_streaming = req.stream.unwrap_or(false);
    let auth = UpstreamAuth::from_headers(&headers, &state.config);

    state.journal.info(
        Stage::Inbound,
        format!(
            "Request: model={} streaming={} messages={}",
            req.model,
            is_streaming,
            req.messages.len()
        ),
    );

    if is_streaming {
        handle_streaming(&state, &req, &auth).await
    } else {
        handle_non_streaming(&state, &req, &auth).await
    }
}

async fn handle_non_streaming(
    state: &AppState,
    req: &ChatCompletionRequest,
    auth: &UpstreamAuth,
) -> Response {
    match proxy::proxy_non_streaming(req, auth, &state.config, &state.client, &state.journal).await
    {
        Ok(ProxyResult::Success(resp)) => Json(resp).into_response(),
        Ok(ProxyResult::Upstream { status, body }) => passthrough_error(status, body),
        Err(e) => error_response(e, &state.journal),
    }
}

async fn handle_streaming(
    state: &AppState,
    req: &ChatCompletionRequest,
    auth: &UpstreamAuth,
) -> Response {
    match proxy::proxy_streaming(req, auth, &state.config, &state.client, &state.journal).await {
        Ok(StreamResult::Stream(stream)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(StreamResult::Upstream { status, body }) => passthrough_error(status, body),
        Err(e) => error_response(e, &state.journal),
    }
}

/// Upstream failures reach the client with the vendor's own status and body.
fn passthrough_error(status: u16, body: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: BridgeError, journal: &SharedJournal) -> Response {
    match err {
        BridgeError::Unsupported(feature) => {
            let body = ChatErrorResponse::invalid_request(feature.to_string())
                .with_param(feature.param())
                .with_code("unsupported_feature");
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
        other => {
            journal.error(Stage::Upstream, format!("Bridge error: {}", other));
            let body = ChatErrorResponse::api_error(format!("Bridge error: {}", other));
            (StatusCode::BAD_GATEWAY, Json(body)).into_response()
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct JournalQuery {
    limit: Option<usize>,
}

async fn handle_journal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JournalQuery>,
) -> Json<serde_json::Value> {
    let entries = state
        .journal
        .recent(query.limit.unwrap_or(DEFAULT_JOURNAL_LIMIT));
    Json(serde_json::json!({ "entries": entries }))
}
