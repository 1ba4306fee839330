//! Caller identity. Authentication happens elsewhere; this module only keeps
//! the identity a client presents in its cookie session.

use axum::{debug_handler, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{error::ChatError, AppResult, AppState};

pub const USER_ID: &str = "user_id";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/session", post(login).delete(logout))
}

pub async fn current_user(session: &Session) -> AppResult<Option<String>> {
    Ok(session.get::<String>(USER_ID).await?)
}

pub async fn require_user(session: &Session) -> AppResult<String> {
    current_user(session).await?.ok_or_else(|| ChatError::Unauthorized.into())
}

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    user: String,
}

#[debug_handler]
pub(crate) async fn login(
    session: Session,
    Json(LoginQuery { user }): Json<LoginQuery>,
) -> AppResult<StatusCode> {
    let user = user.trim();
    if user.is_empty() {
        return Err(ChatError::Unauthorized.into());
    }

    session.insert(USER_ID, user).await?;
    tracing::info!(user, "logged in");
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler]
pub(crate) async fn logout(session: Session) -> AppResult<StatusCode> {
    session.clear().await;
    Ok(StatusCode::NO_CONTENT)
}
