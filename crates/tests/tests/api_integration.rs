use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;
use trustroute_api::{build_app_with_config, ApiConfig};

const API_KEY: &str = "dev-trustroute-key";
const ORIGIN: &str = "http://localhost:3000";

async fn app() -> Router {
    build_app_with_config(ApiConfig {
        bcrypt_cost: 4,
        ..ApiConfig::default()
    })
    .await
    .expect("app should build")
}

struct Reply {
    status: StatusCode,
    body: Value,
    set_cookie: Option<String>,
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    cookie: Option<&str>,
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("origin", ORIGIN);
    if let Some(cookie) = cookie {
        builder = builder.header("cookie", cookie);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    Reply {
        status,
        body,
        set_cookie,
    }
}

/// Signs up and logs in, returning the `name=value` cookie pair.
async fn sign_in(app: &Router, email: &str, name: &str) -> String {
    let signup = send(
        app,
        "POST",
        "/v1/auth/signup",
        None,
        Some(json!({ "email": email, "password": "secret123", "name": name })),
    )
    .await;
    assert_eq!(signup.status, StatusCode::CREATED, "{}", signup.body);

    let login = send(
        app,
        "POST",
        "/v1/auth/login",
        None,
        Some(json!({ "email": email, "password": "secret123" })),
    )
    .await;
    assert_eq!(login.status, StatusCode::OK, "{}", login.body);
    login
        .set_cookie
        .expect("login should set a cookie")
        .split(';')
        .next()
        .expect("cookie pair should be present")
        .to_string()
}

fn travel_date() -> String {
    (Utc::now() + Duration::days(30))
        .format("%Y-%m-%d")
        .to_string()
}

/// Books seat `seat` on the first search result and returns the booking JSON.
async fn book_first_bus(app: &Router, cookie: &str, seat: &str) -> Value {
    let date = travel_date();
    let search = send(
        app,
        "GET",
        &format!("/v1/buses/search?from=Chennai&to=Madurai&date={date}"),
        Some(cookie),
        None,
    )
    .await;
    assert_eq!(search.status, StatusCode::OK);
    let bus = search.body["buses"][0].clone();

    let created = send(
        app,
        "POST",
        "/v1/bookings",
        Some(cookie),
        Some(json!({
            "operator_id": bus["operator_id"],
            "policy_id": bus["policy_id"],
            "amount": bus["price"],
            "seat_number": seat,
            "passenger_name": "Priya",
            "travel_date": date,
            "departure_time": bus["departure"],
            "route": bus["route"]
        })),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.body);
    created.body["booking"].clone()
}

#[tokio::test]
async fn health_is_public() {
    let app = app().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["database"], "ok");
    assert_eq!(parsed["storage_backend"], "memory");
}

#[tokio::test]
async fn requests_without_key_or_origin_are_rejected() {
    let app = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/operators")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn allowed_origin_needs_no_api_key() {
    let app = app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/operators")
                .header("origin", ORIGIN)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn signed_out_callers_get_401_and_a_null_session() {
    let app = app().await;

    let bookings = send(&app, "GET", "/v1/bookings", None, None).await;
    assert_eq!(bookings.status, StatusCode::UNAUTHORIZED);
    assert_eq!(bookings.body["error"], "not_authenticated");

    let me = send(&app, "GET", "/v1/auth/me", None, None).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);

    let session = send(&app, "GET", "/v1/auth/session", None, None).await;
    assert_eq!(session.status, StatusCode::OK);
    assert!(session.body["user"].is_null());
}

#[tokio::test]
async fn signup_rejects_duplicates_and_login_rejects_bad_passwords() {
    let app = app().await;
    sign_in(&app, "arun@example.com", "Arun").await;

    let duplicate = send(
        &app,
        "POST",
        "/v1/auth/signup",
        None,
        Some(json!({ "email": "ARUN@example.com", "password": "another1" })),
    )
    .await;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);

    let short = send(
        &app,
        "POST",
        "/v1/auth/signup",
        None,
        Some(json!({ "email": "new@example.com", "password": "123" })),
    )
    .await;
    assert_eq!(short.status, StatusCode::BAD_REQUEST);

    let bad_login = send(
        &app,
        "POST",
        "/v1/auth/login",
        None,
        Some(json!({ "email": "arun@example.com", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(bad_login.status, StatusCode::UNAUTHORIZED);
    assert!(bad_login.set_cookie.is_none());
}

#[tokio::test]
async fn profile_and_password_changes_validate_input() {
    let app = app().await;
    let cookie = sign_in(&app, "meena@example.com", "Meena").await;

    let bad_phone = send(
        &app,
        "PATCH",
        "/v1/user/profile",
        Some(&cookie),
        Some(json!({ "phoneNumber": "12345" })),
    )
    .await;
    assert_eq!(bad_phone.status, StatusCode::BAD_REQUEST);

    let updated = send(
        &app,
        "PATCH",
        "/v1/user/profile",
        Some(&cookie),
        Some(json!({ "name": "Meena K", "phone_number": "9876543210" })),
    )
    .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.body["user"]["phone_number"], "9876543210");
    assert!(updated.body["user"].get("password_hash").is_none());

    let wrong_current = send(
        &app,
        "POST",
        "/v1/user/change-password",
        Some(&cookie),
        Some(json!({ "currentPassword": "nope-nope", "newPassword": "newsecret" })),
    )
    .await;
    assert_eq!(wrong_current.status, StatusCode::UNAUTHORIZED);

    let changed = send(
        &app,
        "POST",
        "/v1/user/change-password",
        Some(&cookie),
        Some(json!({ "current_password": "secret123", "new_password": "newsecret" })),
    )
    .await;
    assert_eq!(changed.status, StatusCode::OK);

    let relogin = send(
        &app,
        "POST",
        "/v1/auth/login",
        None,
        Some(json!({ "email": "meena@example.com", "password": "newsecret" })),
    )
    .await;
    assert_eq!(relogin.status, StatusCode::OK);
}

#[tokio::test]
async fn search_requires_every_field() {
    let app = app().await;

    let missing_date = send(
        &app,
        "GET",
        "/v1/buses/search?from=Chennai&to=Madurai",
        None,
        None,
    )
    .await;
    assert_eq!(missing_date.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing_date.body["error"], "invalid_search");

    let bad_date = send(
        &app,
        "GET",
        "/v1/buses/search?from=Chennai&to=Madurai&date=tomorrow",
        None,
        None,
    )
    .await;
    assert_eq!(bad_date.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn booking_preview_and_cancellation_flow() {
    let app = app().await;
    let cookie = sign_in(&app, "priya@example.com", "Priya").await;

    let booking = book_first_bus(&app, &cookie, "3c").await;
    let booking_id = booking["booking_id"].as_str().unwrap().to_string();
    let operator_id = booking["operator_id"].as_str().unwrap().to_string();
    let amount = booking["amount"].as_f64().unwrap();
    assert_eq!(booking["status"], "CONFIRMED");
    assert_eq!(booking["seat_number"], "3C");

    let seats_uri = format!("/v1/buses/{operator_id}/seats?date={}", travel_date());
    let seats = send(&app, "GET", &seats_uri, Some(&cookie), None).await;
    assert_eq!(seats.status, StatusCode::OK);
    assert_eq!(seats.body["available"], 34);

    let taken = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({
            "operator_id": operator_id,
            "amount": amount,
            "seat_number": "3C",
            "travel_date": travel_date(),
            "departure_time": booking["departure_label"]
        })),
    )
    .await;
    assert_eq!(taken.status, StatusCode::CONFLICT);

    let preview = send(
        &app,
        "GET",
        &format!("/v1/bookings/{booking_id}/refund-preview"),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(preview.status, StatusCode::OK);
    let refund = &preview.body["refund"];
    let refunded = refund["refund_amount"].as_f64().unwrap();
    let deducted = refund["deduction_total"].as_f64().unwrap();
    assert!((refunded + deducted - amount).abs() < 1e-6);

    let cancelled = send(
        &app,
        "POST",
        &format!("/v1/bookings/{booking_id}/cancel"),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(cancelled.status, StatusCode::OK, "{}", cancelled.body);
    assert_eq!(cancelled.body["booking"]["booking"]["status"], "CANCELLED");
    let transaction = &cancelled.body["booking"]["refund"];
    assert_eq!(transaction["status"], "INITIATED");
    assert_eq!(transaction["timeline"].as_array().unwrap().len(), 5);
    assert_eq!(transaction["refund_amount"], cancelled.body["refund"]["refund_amount"]);

    let again = send(
        &app,
        "POST",
        &format!("/v1/bookings/{booking_id}/cancel"),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
    assert_eq!(again.body["error"], "already_cancelled");

    let seats = send(&app, "GET", &seats_uri, Some(&cookie), None).await;
    assert_eq!(seats.body["available"], 35);

    let listed = send(&app, "GET", "/v1/bookings", Some(&cookie), None).await;
    let bookings = listed.body["bookings"].as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["refund"]["cancellation_slot"], transaction["cancellation_slot"]);

    let health = send(&app, "GET", "/health", None, None).await;
    assert_eq!(health.body["metrics"]["cancellations_total"], 1);
    assert_eq!(health.body["metrics"]["refund_previews_total"], 1);
}

#[tokio::test]
async fn other_users_bookings_are_hidden() {
    let app = app().await;
    let owner = sign_in(&app, "owner@example.com", "Owner").await;
    let intruder = sign_in(&app, "intruder@example.com", "Intruder").await;

    let booking = book_first_bus(&app, &owner, "6B").await;
    let booking_id = booking["booking_id"].as_str().unwrap();

    let preview = send(
        &app,
        "GET",
        &format!("/v1/bookings/{booking_id}/refund-preview"),
        Some(&intruder),
        None,
    )
    .await;
    assert_eq!(preview.status, StatusCode::NOT_FOUND);

    let cancel = send(
        &app,
        "POST",
        &format!("/v1/bookings/{booking_id}/cancel"),
        Some(&intruder),
        None,
    )
    .await;
    assert_eq!(cancel.status, StatusCode::NOT_FOUND);

    let listed = send(&app, "GET", "/v1/bookings", Some(&intruder), None).await;
    assert!(listed.body["bookings"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn bookings_without_a_departure_cannot_be_cancelled() {
    let app = app().await;
    let cookie = sign_in(&app, "ravi@example.com", "Ravi").await;
    let operators = send(&app, "GET", "/v1/operators", Some(&cookie), None).await;
    let operator_id = operators.body["operators"][0]["operator"]["operator_id"].clone();

    let created = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({ "operator_id": operator_id, "amount": 850.0, "seat_number": "4A" })),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);
    let booking_id = created.body["booking"]["booking_id"].as_str().unwrap();

    let cancel = send(
        &app,
        "POST",
        &format!("/v1/bookings/{booking_id}/cancel"),
        Some(&cookie),
        None,
    )
    .await;
    assert_eq!(cancel.status, StatusCode::BAD_REQUEST);
    assert_eq!(cancel.body["error"], "departure_unknown");
}

#[tokio::test]
async fn booking_validation_rejects_bad_amounts_seats_and_policies() {
    let app = app().await;
    let cookie = sign_in(&app, "sara@example.com", "Sara").await;
    let operators = send(&app, "GET", "/v1/operators", Some(&cookie), None).await;
    let first = operators.body["operators"][0].clone();
    let second = operators.body["operators"][1].clone();

    let zero = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({
            "operator_id": first["operator"]["operator_id"],
            "amount": 0,
            "seat_number": "4A"
        })),
    )
    .await;
    assert_eq!(zero.status, StatusCode::BAD_REQUEST);

    let mock_taken = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({
            "operator_id": first["operator"]["operator_id"],
            "amount": 700,
            "seat_number": "1A"
        })),
    )
    .await;
    assert_eq!(mock_taken.status, StatusCode::CONFLICT);

    let no_such_seat = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({
            "operator_id": first["operator"]["operator_id"],
            "amount": 700,
            "seat_number": "11E"
        })),
    )
    .await;
    assert_eq!(no_such_seat.status, StatusCode::BAD_REQUEST);

    let foreign_policy = send(
        &app,
        "POST",
        "/v1/bookings",
        Some(&cookie),
        Some(json!({
            "operator_id": first["operator"]["operator_id"],
            "policy_id": second["policy"]["policy_id"],
            "amount": 700,
            "seat_number": "4A"
        })),
    )
    .await;
    assert_eq!(foreign_policy.status, StatusCode::BAD_REQUEST);
    assert_eq!(foreign_policy.body["error"], "policy_mismatch");
}

#[tokio::test]
async fn chat_falls_back_to_rule_based_reply() {
    let app = app().await;
    let cookie = sign_in(&app, "kavya@example.com", "Kavya").await;
    book_first_bus(&app, &cookie, "7D").await;

    let reply = send(
        &app,
        "POST",
        "/v1/chat",
        Some(&cookie),
        Some(json!({
            "messages": [{ "role": "user", "content": "What is the refund policy?" }]
        })),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
    assert!(!reply.body["reply_text"].as_str().unwrap().is_empty());
    assert_eq!(reply.body["json_payload"]["source"], "rules");
    assert!(reply.body["json_payload"]["session_id"].is_string());

    let empty = send(
        &app,
        "POST",
        "/v1/chat",
        Some(&cookie),
        Some(json!({ "messages": [] })),
    )
    .await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cookie_requests_from_foreign_origins_are_refused() {
    let app = app().await;
    let cookie = sign_in(&app, "nila@example.com", "Nila").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/auth/logout")
        .header("x-api-key", API_KEY)
        .header("origin", "https://evil.example")
        .header("cookie", cookie)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn logout_ends_the_session() {
    let app = app().await;
    let cookie = sign_in(&app, "deepa@example.com", "Deepa").await;

    let me = send(&app, "GET", "/v1/auth/me", Some(&cookie), None).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["user"]["email"], "deepa@example.com");

    let logout = send(&app, "POST", "/v1/auth/logout", Some(&cookie), None).await;
    assert_eq!(logout.status, StatusCode::OK);
    assert!(logout.set_cookie.unwrap().contains("Max-Age=0"));

    let me = send(&app, "GET", "/v1/auth/me", Some(&cookie), None).await;
    assert_eq!(me.status, StatusCode::UNAUTHORIZED);
}
