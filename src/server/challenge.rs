//! # HTTP-01 Challenge Listener
//!
//! Answers `GET /.well-known/acme-challenge/{token}` with the key
//! authorization of a pending challenge. Solver Ingresses route the CA's
//! validation requests here.

use crate::acme::ChallengeStore;
use crate::observability::metrics;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[must_use]
pub fn router(challenges: Arc<ChallengeStore>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(challenge_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(challenges)
}

async fn challenge_handler(
    State(challenges): State<Arc<ChallengeStore>>,
    Path(token): Path<String>,
) -> Response {
    let found = challenges.get_challenge(&token).await;
    metrics::increment_challenge_requests(found.is_some());
    match found {
        Some(key_authorization) => {
            debug!(token = %token, "Serving HTTP-01 key authorization");
            (
                StatusCode::OK,
                [("content-type", "application/octet-stream")],
                key_authorization,
            )
                .into_response()
        }
        None => {
            warn!(token = %token, "HTTP-01 request for unknown token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
