//! Session cookie authentication.
//!
//! Handlers declare `Session` as an extractor argument to require auth, or
//! `Option<Session>` to merely observe it. The cookie holds the raw token;
//! the store only ever sees its SHA-256.

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;

use super::state::ServerState;
use crate::security::token_hash;

pub const SESSION_COOKIE: &str = "uv_session";

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i64,
    pub username: String,
    pub token: String,
}

pub struct AuthRequired;

impl IntoResponse for AuthRequired {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication required"})),
        )
            .into_response()
    }
}

fn session_from_parts(parts: &Parts, state: &ServerState) -> Option<Session> {
    let jar = CookieJar::from_headers(&parts.headers);
    let token = jar.get(SESSION_COOKIE)?.value().to_string();
    if token.is_empty() {
        return None;
    }
    let record = state.store.lookup_session(&token_hash(&token)).ok()??;
    Some(Session {
        user_id: record.user_id,
        username: record.username,
        token,
    })
}

impl FromRequestParts<ServerState> for Session {
    type Rejection = AuthRequired;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        session_from_parts(parts, state).ok_or(AuthRequired)
    }
}

impl OptionalFromRequestParts<ServerState> for Session {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Option<Self>, Self::Rejection> {
        Ok(session_from_parts(parts, state))
    }
}
