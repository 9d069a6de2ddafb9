//! HTTP routes answering friends.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::wire::{DownloadRequest, ErrorBody, PingResponse, QueryRequest, QueryResponse};
use crate::error::ErrorKind;
use crate::index::StorageIndex;
use crate::registry::PeerRegistry;
use crate::router::index_error_kind;
use crate::transfer::DownloadManager;

/// Shared state of the peer API.
pub struct PeerState {
    pub index: Arc<dyn StorageIndex>,
    pub downloads: DownloadManager,
    /// Resolves the friend a download request claims to come from
    pub registry: Arc<PeerRegistry>,
    /// Served under `/api/files`; file routes answer 404 when unset
    pub shared_folder: Option<PathBuf>,
    /// Bearer token friends must present for queries and files; `None`
    /// leaves those routes open. Download requests always need the
    /// requesting friend's own credential.
    pub token: Option<String>,
}

/// Build the router with all routes.
pub fn build_router(state: Arc<PeerState>) -> Router {
    let mut protected = Router::new().route("/api/query", post(query_handler));

    if let Some(ref shared) = state.shared_folder {
        protected = protected.nest_service("/api/files", ServeDir::new(shared));
    }

    let protected = protected.layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        require_token,
    ));

    Router::new()
        .route("/api/ping", get(ping_handler))
        .route("/api/downloads", post(download_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnknownFriend | ErrorKind::TransferNotFound => StatusCode::NOT_FOUND,
        ErrorKind::TransferAlreadyInProgress => StatusCode::CONFLICT,
        ErrorKind::IndexUnavailable | ErrorKind::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PeerAuthFailed => StatusCode::UNAUTHORIZED,
        kind if kind.is_caller_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, kind: Option<ErrorKind>, message: String) -> Response {
    (status, Json(ErrorBody { error: message, kind })).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn require_token(State(state): State<Arc<PeerState>>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    if bearer_token(request.headers()) == Some(expected) {
        next.run(request).await
    } else {
        warn!(uri = %request.uri(), "Rejected peer request without a valid token");
        error_response(
            StatusCode::UNAUTHORIZED,
            Some(ErrorKind::PeerAuthFailed),
            "missing or invalid bearer token".to_string(),
        )
    }
}

async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse {
        pong: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Forwarded queries are answered from the local index only.
async fn query_handler(
    State(state): State<Arc<PeerState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    debug!(query = %request.query, "Answering friend query");
    match state.index.query(&request.query).await {
        Ok(records) => Json(QueryResponse { records }).into_response(),
        Err(e) => {
            let kind = index_error_kind(&e);
            error_response(status_for(kind), Some(kind), e.to_string())
        }
    }
}

/// A friend asks us to pull a file from it.
///
/// The caller must present the named friend's credential, so nobody can
/// start a transfer on another friend's behalf. Friends without a
/// configured credential cannot request downloads.
async fn download_handler(
    State(state): State<Arc<PeerState>>,
    headers: HeaderMap,
    Json(request): Json<DownloadRequest>,
) -> Response {
    let friend = match state.registry.lookup(&request.friend) {
        Ok(friend) => friend,
        Err(e) => {
            return error_response(StatusCode::NOT_FOUND, Some(ErrorKind::UnknownFriend), e.to_string())
        }
    };

    let authenticated = match (friend.credential.as_deref(), bearer_token(&headers)) {
        (Some(expected), Some(provided)) => expected == provided,
        _ => false,
    };
    if !authenticated {
        warn!(friend = %friend.name, "Rejected download request without the friend's credential");
        return error_response(
            StatusCode::UNAUTHORIZED,
            Some(ErrorKind::PeerAuthFailed),
            format!("request is not authenticated as '{}'", friend.name),
        );
    }

    match state
        .downloads
        .start_download(&request.friend, &request.filename)
    {
        Ok(info) => (StatusCode::ACCEPTED, Json(info)).into_response(),
        Err(e) => {
            let kind = e.kind();
            error_response(status_for(kind), Some(kind), e.to_string())
        }
    }
}
