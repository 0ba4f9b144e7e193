use anyhow::Context;
use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use trustroute_core::User;
use trustroute_storage::{AuthSession, AuthSessionRepository, StoreError, UserRepository};

use crate::{
    build_clear_cookie, build_session_cookie, error_response, generate_urlsafe_token,
    hash_session_token, internal_error, read_cookie_value, require_user, session_user,
    with_cookie, ApiState,
};

const MIN_PASSWORD_LEN: usize = 6;
const MAX_PASSWORD_LEN: usize = 72;
const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 80;
const SESSION_TOKEN_BYTES: usize = 32;

#[derive(Debug, Deserialize)]
pub(crate) struct SignupRequest {
    email: Option<String>,
    password: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProfileRequest {
    name: Option<String>,
    #[serde(alias = "phoneNumber")]
    phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChangePasswordRequest {
    #[serde(alias = "currentPassword")]
    current_password: Option<String>,
    #[serde(alias = "newPassword")]
    new_password: Option<String>,
}

pub(crate) async fn signup(
    State(state): State<ApiState>,
    Json(input): Json<SignupRequest>,
) -> Result<Response, Response> {
    let (Some(email), Some(password)) = (input.email, input.password) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_fields",
            "email and password are required",
        ));
    };
    let email = normalize_email(&email).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_email",
            "enter a valid email address",
        )
    })?;
    validate_password(&password)?;
    let name = match input.name.as_deref().map(str::trim) {
        Some("") | None => None,
        Some(name) => Some(validate_name(name)?),
    };

    let existing = state
        .store
        .find_user_by_email(&email)
        .await
        .map_err(|error| internal_error("signup failed", error))?;
    if existing.is_some() {
        return Err(email_taken());
    }

    let password_hash = hash_password(password, state.config.bcrypt_cost)
        .await
        .map_err(|error| internal_error("signup failed", error))?;
    let now = Utc::now();
    let user = User {
        user_id: uuid::Uuid::new_v4().to_string(),
        email,
        name,
        phone_number: None,
        password_hash,
        created_at: now,
        updated_at: now,
    };

    match state.store.create_user(&user).await {
        Ok(()) => {}
        Err(StoreError::Conflict(_)) => return Err(email_taken()),
        Err(error) => return Err(internal_error("signup failed", error)),
    }

    info!(user_id = %user.user_id, "user signed up");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "user": user }))).into_response())
}

pub(crate) async fn login(
    State(state): State<ApiState>,
    Json(input): Json<LoginRequest>,
) -> Result<Response, Response> {
    let (Some(email), Some(password)) = (input.email, input.password) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_fields",
            "email and password are required",
        ));
    };

    let user = state
        .store
        .find_user_by_email(email.trim())
        .await
        .map_err(|error| internal_error("login failed", error))?
        .ok_or_else(invalid_credentials)?;

    let valid = verify_password(password, user.password_hash.clone())
        .await
        .map_err(|error| internal_error("login failed", error))?;
    if !valid {
        return Err(invalid_credentials());
    }

    let token = generate_urlsafe_token(SESSION_TOKEN_BYTES);
    let now = Utc::now();
    let ttl = state.config.session_ttl;
    let expires_at = now
        + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(7));
    state
        .store
        .create_auth_session(&AuthSession {
            token_hash: hash_session_token(&token),
            user_id: user.user_id.clone(),
            created_at: now,
            expires_at,
        })
        .await
        .map_err(|error| internal_error("login failed", error))?;

    let cookie = build_session_cookie(
        &state.config.cookie_name,
        &token,
        ttl.as_secs(),
        state.config.cookie_secure,
        &state.config.cookie_same_site,
        state.config.cookie_domain.as_deref(),
    );
    info!(user_id = %user.user_id, "user logged in");

    Ok(with_cookie(
        (StatusCode::OK, Json(serde_json::json!({ "user": user }))).into_response(),
        &cookie,
    ))
}

pub(crate) async fn session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let user = session_user(&state, &headers).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "user": user }))).into_response())
}

pub(crate) async fn logout(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(token) = read_cookie_value(&headers, &state.config.cookie_name) {
        if let Err(error) = state
            .store
            .delete_auth_session(&hash_session_token(&token))
            .await
        {
            warn!(%error, "failed to delete session on logout");
        }
    }

    let clear_cookie = build_clear_cookie(
        &state.config.cookie_name,
        state.config.cookie_secure,
        &state.config.cookie_same_site,
        state.config.cookie_domain.as_deref(),
    );
    with_cookie(
        (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response(),
        &clear_cookie,
    )
}

pub(crate) async fn me(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "user": user }))).into_response())
}

pub(crate) async fn update_profile(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<ProfileRequest>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;

    let name = input
        .name
        .as_deref()
        .map(|name| validate_name(name.trim()))
        .transpose()?;
    let phone_number = input
        .phone_number
        .as_deref()
        .map(validate_phone)
        .transpose()?;

    let updated = state
        .store
        .update_profile(&user.user_id, name, phone_number, Utc::now())
        .await
        .map_err(|error| internal_error("failed to update profile", error))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "user": updated,
            "message": "Profile updated successfully"
        })),
    )
        .into_response())
}

pub(crate) async fn change_password(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<ChangePasswordRequest>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;

    let (Some(current_password), Some(new_password)) =
        (input.current_password, input.new_password)
    else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_fields",
            "current_password and new_password are required",
        ));
    };
    validate_password(&new_password)?;

    let valid = verify_password(current_password, user.password_hash.clone())
        .await
        .map_err(|error| internal_error("failed to update password", error))?;
    if !valid {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "current password is incorrect",
        ));
    }

    let password_hash = hash_password(new_password, state.config.bcrypt_cost)
        .await
        .map_err(|error| internal_error("failed to update password", error))?;
    state
        .store
        .update_password(&user.user_id, &password_hash, Utc::now())
        .await
        .map_err(|error| internal_error("failed to update password", error))?;

    info!(user_id = %user.user_id, "password changed");
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "message": "Password updated successfully" })),
    )
        .into_response())
}

async fn hash_password(password: String, cost: u32) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("password hashing task failed")?
        .context("password hashing failed")
}

async fn verify_password(password: String, password_hash: String) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
        .await
        .context("password verification task failed")?
        .context("stored password hash is invalid")
}

fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_ascii_lowercase();
    let (local, domain) = email.split_once('@')?;
    let plausible = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
        && email.len() <= 254;
    plausible.then_some(email)
}

fn validate_password(password: &str) -> Result<(), Response> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "weak_password",
            format!("password must be at least {MIN_PASSWORD_LEN} characters long"),
        ));
    }
    // bcrypt only looks at the first 72 bytes
    if password.len() > MAX_PASSWORD_LEN {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "password_too_long",
            format!("password must be at most {MAX_PASSWORD_LEN} bytes"),
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<String, Response> {
    let len = name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_name",
            format!("name must be between {MIN_NAME_LEN} and {MAX_NAME_LEN} characters long"),
        ));
    }
    Ok(name.to_string())
}

fn validate_phone(phone: &str) -> Result<String, Response> {
    let phone = phone.trim();
    if phone.len() == 10 && phone.chars().all(|c| c.is_ascii_digit()) {
        Ok(phone.to_string())
    } else {
        Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_phone",
            "phone number must be exactly 10 digits",
        ))
    }
}

fn email_taken() -> Response {
    error_response(
        StatusCode::CONFLICT,
        "email_taken",
        "an account with this email already exists",
    )
}

fn invalid_credentials() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "invalid_credentials",
        "email or password is incorrect",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_lower_cased_and_checked() {
        assert_eq!(
            normalize_email("  Priya@Example.COM ").as_deref(),
            Some("priya@example.com")
        );
        assert!(normalize_email("priya@localhost").is_none());
        assert!(normalize_email("@example.com").is_none());
        assert!(normalize_email("pri ya@example.com").is_none());
    }

    #[test]
    fn phone_needs_exactly_ten_digits() {
        assert!(validate_phone("9876543210").is_ok());
        assert!(validate_phone("98765-4321").is_err());
        assert!(validate_phone("987654321").is_err());
    }

    #[test]
    fn short_names_and_passwords_are_rejected() {
        assert!(validate_name("A").is_err());
        assert_eq!(validate_name("Arun").unwrap(), "Arun");
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
    }

    #[tokio::test]
    async fn bcrypt_round_trip() {
        let hash = hash_password("secret1".to_string(), 4).await.unwrap();
        assert!(verify_password("secret1".to_string(), hash.clone()).await.unwrap());
        assert!(!verify_password("secret2".to_string(), hash).await.unwrap());
    }
}
