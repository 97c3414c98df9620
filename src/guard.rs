//! Shared-secret gate in front of every resource route.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use url::form_urlencoded;

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "api_key";

/// Holds the one secret every guarded request must present, either as the
/// `api_key` query parameter or the `x-api-key` header.
#[derive(Clone)]
pub struct AccessGuard {
    secret: Arc<str>,
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard").finish_non_exhaustive()
    }
}

impl AccessGuard {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
        }
    }

    pub fn allows(&self, request: &Request) -> bool {
        presented_key(request).is_some_and(|key| *key == *self.secret)
    }
}

/// The query parameter wins over the header, mirroring how clients were told
/// to authenticate.
fn presented_key(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == API_KEY_QUERY)
            .map(|(_, value)| value.into_owned())
    });
    from_query
        .filter(|key| !key.is_empty())
        .or_else(|| {
            request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .filter(|key| !key.is_empty())
}

pub async fn require_api_key(
    State(guard): State<AccessGuard>,
    request: Request,
    next: Next,
) -> Response {
    if guard.allows(&request) {
        return next.run(request).await;
    }
    tracing::warn!(
        method = %request.method(),
        path = %request.uri().path(),
        "rejected request without a valid API key"
    );
    ApiError::forbidden("Forbidden: Invalid API Key").into_response()
}
