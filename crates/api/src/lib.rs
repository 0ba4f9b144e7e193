mod auth;
mod bookings;
pub mod config;
mod openrouter;
pub mod rate_limit;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Json, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{body::Body, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use trustroute_agents::{load_policy_document, RefundAssistant};
use trustroute_core::{ChatInput, ChatMessage, ChatRole, User};
use trustroute_observability::AppMetrics;
use trustroute_storage::{
    seed_default_operators, AuthSessionRepository, Store, UserRepository,
};
use url::Url;

pub use crate::config::ApiConfig;
pub use crate::openrouter::OpenRouterClient;
use crate::rate_limit::IpRateLimiter;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const MAX_CHAT_MESSAGES: usize = 50;
const MAX_CHAT_MESSAGE_LEN: usize = 4_000;

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<RefundAssistant<Store>>,
    pub store: Arc<Store>,
    pub metrics: Arc<AppMetrics>,
    pub completion: OpenRouterClient,
    pub config: Arc<ApiConfig>,
    pub limiter: IpRateLimiter,
    pub auth_limiter: IpRateLimiter,
    pub allowed_origins: Arc<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp_utc: String,
    database: &'static str,
    storage_backend: &'static str,
    metrics: trustroute_observability::MetricsSnapshot,
    capabilities: HealthCapabilities,
}

#[derive(Debug, Serialize)]
struct HealthCapabilities {
    chat_model: bool,
    policy_document: bool,
    persistent_storage: bool,
}

/// Router over the configuration in the environment.
pub async fn build_app() -> Result<Router> {
    build_app_with_config(ApiConfig::from_env()).await
}

pub async fn build_app_with_config(config: ApiConfig) -> Result<Router> {
    Ok(build_router(build_state(config).await?))
}

/// Opens the store, seeds the default operators and wires the assistant.
pub async fn build_state(config: ApiConfig) -> Result<ApiState> {
    let metrics = AppMetrics::shared();

    let store = Store::from_url(config.database_url.as_deref())
        .await
        .context("failed to open store")?;
    let seeded = seed_default_operators(&store)
        .await
        .context("failed to seed default operators")?;
    info!(backend = store.backend(), seeded, "store ready");
    let store = Arc::new(store);

    let policy_text = load_policy_document(config.policy_doc.as_deref());
    let agent = Arc::new(RefundAssistant::new(
        store.clone(),
        metrics.clone(),
        policy_text,
    ));
    let completion =
        OpenRouterClient::new(config.openrouter_api_key.clone(), config.chat_model.clone())?;

    Ok(ApiState {
        agent,
        store,
        metrics,
        completion,
        limiter: IpRateLimiter::new(config.api_rate_limit_window, config.api_rate_limit_max),
        auth_limiter: IpRateLimiter::new(
            config.auth_rate_limit_window,
            config.auth_rate_limit_max,
        ),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
        config: Arc::new(config),
    })
}

/// Periodically drops expired auth sessions, chat sessions and idle limiter keys.
pub fn spawn_housekeeping(state: ApiState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let sessions = match state.store.purge_expired_auth_sessions(Utc::now()).await {
                Ok(count) => count,
                Err(error) => {
                    warn!(%error, "auth session purge failed");
                    0
                }
            };
            let conversations = match state.agent.purge_expired_conversations().await {
                Ok(count) => count,
                Err(error) => {
                    warn!(%error, "conversation purge failed");
                    0
                }
            };
            let limiter_keys = state.limiter.prune() + state.auth_limiter.prune();
            info!(sessions, conversations, limiter_keys, "housekeeping pass");
        }
    })
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/auth/signup", post(auth::signup))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/session", get(auth::session))
        .route("/v1/auth/logout", post(auth::logout))
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/user/profile", patch(auth::update_profile))
        .route("/v1/user/change-password", post(auth::change_password))
        .route("/v1/operators", get(bookings::list_operators))
        .route("/v1/buses/search", get(bookings::search))
        .route("/v1/buses/{operator_id}/seats", get(bookings::seats))
        .route(
            "/v1/bookings",
            get(bookings::list_bookings).post(bookings::create_booking),
        )
        .route(
            "/v1/bookings/{booking_id}/refund-preview",
            get(bookings::refund_preview),
        )
        .route("/v1/bookings/{booking_id}/cancel", post(bookings::cancel))
        .route("/v1/chat", post(chat))
        .layer(build_cors_layer(&state.allowed_origins))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security_headers_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            csrf_origin_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_metrics_middleware,
        ))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let database = match state.store.ping().await {
        Ok(()) => "ok",
        Err(error) => {
            error!(%error, "database health check failed");
            "error"
        }
    };
    let healthy = database == "ok";

    let payload = HealthResponse {
        status: if healthy { "ok" } else { "error" },
        timestamp_utc: Utc::now().to_rfc3339(),
        database,
        storage_backend: state.store.backend(),
        metrics: state.metrics.snapshot(),
        capabilities: HealthCapabilities {
            chat_model: state.completion.is_configured(),
            policy_document: state.config.policy_doc.is_some(),
            persistent_storage: state.store.backend() != "memory",
        },
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(payload))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    locale: Option<String>,
}

async fn chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;

    if request.messages.len() > MAX_CHAT_MESSAGES
        || request
            .messages
            .iter()
            .any(|message| message.content.chars().count() > MAX_CHAT_MESSAGE_LEN)
    {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "chat_too_long",
            "conversation is too long; start a new chat",
        ));
    }
    if !request
        .messages
        .iter()
        .any(|message| message.role == ChatRole::User && !message.content.trim().is_empty())
    {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_messages",
            "messages must include at least one user message",
        ));
    }

    let input = ChatInput {
        session_id: request.session_id,
        user_id: user.user_id.clone(),
        messages: request.messages,
        locale: request.locale,
    };

    let reply = state
        .agent
        .handle_chat(input, &user, &state.completion)
        .await
        .map_err(|error| internal_error("chat failed", error))?;

    Ok((StatusCode::OK, Json(reply)).into_response())
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into()
        })),
    )
        .into_response()
}

/// Logs the cause and answers 500 without leaking it.
pub(crate) fn internal_error(context: &str, error: impl std::fmt::Display) -> Response {
    error!(%error, "{context}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        context.to_string(),
    )
}

/// The signed-in user for the session cookie, if any. Expired sessions are removed.
pub(crate) async fn session_user(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<Option<User>, Response> {
    let Some(token) = read_cookie_value(headers, &state.config.cookie_name) else {
        return Ok(None);
    };
    let token_hash = hash_session_token(&token);

    let session = state
        .store
        .find_auth_session(&token_hash)
        .await
        .map_err(|error| internal_error("session lookup failed", error))?;
    let Some(session) = session else {
        return Ok(None);
    };
    if session.expires_at <= Utc::now() {
        if let Err(error) = state.store.delete_auth_session(&token_hash).await {
            warn!(%error, "failed to delete expired session");
        }
        return Ok(None);
    }

    state
        .store
        .find_user(&session.user_id)
        .await
        .map_err(|error| internal_error("user lookup failed", error))
}

pub(crate) async fn require_user(state: &ApiState, headers: &HeaderMap) -> Result<User, Response> {
    session_user(state, headers).await?.ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "not_authenticated",
            "sign in first",
        )
    })
}

pub(crate) fn hash_session_token(token: &str) -> String {
    hex_encode(&Sha256::digest(token.as_bytes()))
}

pub(crate) fn generate_urlsafe_token(bytes: usize) -> String {
    let mut buffer = vec![0_u8; bytes];
    rng().fill_bytes(&mut buffer);
    URL_SAFE_NO_PAD.encode(buffer)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

async fn api_key_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if request.method() == Method::OPTIONS || is_public_endpoint(path.as_str()) {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if header_key == state.config.api_key {
        return next.run(request).await;
    }

    // Browser requests from allowed origins carry no key.
    if !request_origin_is_allowed(&state, request.headers()) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid x-api-key, and request origin is not allowed",
        );
    }

    next.run(request).await
}

pub(crate) fn read_cookie_value(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw_cookie = headers.get(header::COOKIE)?.to_str().ok()?;
    raw_cookie.split(';').find_map(|part| {
        let mut split = part.trim().splitn(2, '=');
        let key = split.next()?.trim();
        let value = split.next()?.trim();
        if key == cookie_name && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn request_origin_is_allowed(state: &ApiState, headers: &HeaderMap) -> bool {
    request_origin_from_headers(headers)
        .map(|origin| state.allowed_origins.iter().any(|allowed| allowed == &origin))
        .unwrap_or(false)
}

fn request_origin_from_headers(headers: &HeaderMap) -> Option<String> {
    let direct_origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty());
    if direct_origin.is_some() {
        return direct_origin;
    }

    headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Url::parse(value).ok())
        .map(|url| url.origin().ascii_serialization())
        .filter(|value| value != "null")
}

fn cookie_same_site_attr(value: &str) -> &'static str {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => "None",
        "strict" => "Strict",
        _ => "Lax",
    }
}

pub(crate) fn build_session_cookie(
    cookie_name: &str,
    token: &str,
    max_age_seconds: u64,
    secure: bool,
    same_site: &str,
    domain: Option<&str>,
) -> String {
    let mut segments = vec![
        format!("{cookie_name}={token}"),
        "Path=/".to_string(),
        "HttpOnly".to_string(),
        format!("SameSite={}", cookie_same_site_attr(same_site)),
        format!("Max-Age={max_age_seconds}"),
    ];
    if secure {
        segments.push("Secure".to_string());
    }
    if let Some(domain) = domain {
        segments.push(format!("Domain={domain}"));
    }
    segments.join("; ")
}

pub(crate) fn build_clear_cookie(
    cookie_name: &str,
    secure: bool,
    same_site: &str,
    domain: Option<&str>,
) -> String {
    let mut segments = vec![
        format!("{cookie_name}="),
        "Path=/".to_string(),
        "HttpOnly".to_string(),
        format!("SameSite={}", cookie_same_site_attr(same_site)),
        "Max-Age=0".to_string(),
        "Expires=Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
    ];
    if secure {
        segments.push("Secure".to_string());
    }
    if let Some(domain) = domain {
        segments.push(format!("Domain={domain}"));
    }
    segments.join("; ")
}

pub(crate) fn with_cookie(mut response: Response, cookie: &str) -> Response {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(error) => warn!(%error, "session cookie is not a valid header value"),
    }
    response
}

fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/health")
}

fn is_auth_rate_limited_endpoint(path: &str) -> bool {
    matches!(
        path,
        "/v1/auth/signup" | "/v1/auth/login" | "/v1/user/change-password"
    )
}

fn build_cors_layer(allowed_origins: &Arc<Vec<String>>) -> CorsLayer {
    let origins = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    let origins = if origins.is_empty() {
        vec![HeaderValue::from_static("http://localhost:3000")]
    } else {
        origins
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

async fn request_metrics_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.inc_request();
    state.metrics.observe_latency(started.elapsed());
    response
}

async fn rate_limit_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let ip = request_ip(&request);

    if is_auth_rate_limited_endpoint(path.as_str()) {
        let auth_key = format!("auth:{path}:{ip}");
        if !state.auth_limiter.allow(&auth_key) {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "auth_rate_limited",
                "too many authentication attempts from this IP. wait and retry.",
            );
        }
    }

    if is_public_endpoint(path.as_str()) {
        return next.run(request).await;
    }

    if !state.limiter.allow(&ip) {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded for this IP",
        );
    }

    next.run(request).await
}

async fn csrf_origin_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::GET
        || request.method() == Method::HEAD
        || request.method() == Method::OPTIONS
    {
        return next.run(request).await;
    }

    let has_cookie_session =
        read_cookie_value(request.headers(), &state.config.cookie_name).is_some();
    if !has_cookie_session {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .trim_end_matches('/')
        .to_string();

    if origin.is_empty() {
        return error_response(
            StatusCode::FORBIDDEN,
            "origin_required",
            "origin header is required for cookie-authenticated state changes",
        );
    }

    if !state.allowed_origins.iter().any(|value| value == &origin) {
        return error_response(
            StatusCode::FORBIDDEN,
            "origin_not_allowed",
            "request origin is not in TRUSTROUTE_ALLOWED_ORIGINS",
        );
    }

    next.run(request).await
}

fn request_ip(request: &Request<Body>) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

async fn security_headers_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'; base-uri 'none'"),
    );
    if state.config.cookie_secure {
        headers.insert(
            header::HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }

    response
}
