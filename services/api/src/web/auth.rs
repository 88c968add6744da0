//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for user signup, login, and logout.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;
use verse_study_core::{domain::Identity, library::write_user_profile, ports::IdentityProvider};

use crate::error::reject;
use crate::web::middleware::{issue_cookie, session_cookie, CLEARED_COOKIE};
use crate::web::state::AppState;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
}

impl From<Identity> for AuthResponse {
    fn from(identity: Identity) -> Self {
        Self {
            user_id: identity.uid,
            email: identity.email.unwrap_or_default(),
            display_name: identity.display_name,
        }
    }
}

fn session_issue_failed() -> (StatusCode, String) {
    error!("Signed in without an auth session.");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to create session".to_string(),
    )
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a new user account
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "User created successfully", body = AuthResponse),
        (status = 400, description = "Invalid request or email already registered"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let provider = state.identity_provider();
    let identity = provider
        .sign_up(&req.email, &req.password, req.display_name.as_deref())
        .await
        .map_err(|e| reject("Sign-up", e))?;
    let auth_session_id = provider.auth_session_id().ok_or_else(session_issue_failed)?;

    // The profile document is written in the background like every other write.
    write_user_profile(&state.dispatcher, &identity);

    info!(uid = %identity.uid, "User signed up.");
    let cookie = issue_cookie(&auth_session_id, state.session_ttl());
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(AuthResponse::from(identity)),
    ))
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let provider = state.identity_provider();
    let identity = provider
        .sign_in(&req.email, &req.password)
        .await
        .map_err(|e| match reject("Sign-in", e) {
            (StatusCode::UNAUTHORIZED, _) => (
                StatusCode::UNAUTHORIZED,
                "Invalid email or password".to_string(),
            ),
            other => other,
        })?;
    let auth_session_id = provider.auth_session_id().ok_or_else(session_issue_failed)?;

    let cookie = issue_cookie(&auth_session_id, state.session_ttl());
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(AuthResponse::from(identity)),
    ))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let auth_session_id = session_cookie(&headers)
        .ok_or((StatusCode::UNAUTHORIZED, "No session found".to_string()))?;

    state
        .accounts
        .delete_auth_session(auth_session_id)
        .await
        .map_err(|e| reject("Logout", e))?;

    Ok((StatusCode::OK, [(header::SET_COOKIE, CLEARED_COOKIE.to_string())]))
}
