use std::collections::HashSet;

use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::info;
use trustroute_core::{
    build_refund_timeline, calculate_refund, ensure_seat_available, search_buses, seat_map,
    Booking, BookingDetails, BookingStatus, BusSearchQuery, RefundStatus, RefundTransaction,
    SeatError, User,
};
use trustroute_storage::{BookingRepository, OperatorRepository, StoreError};

use crate::{error_response, internal_error, require_user, ApiState};

const MAX_PASSENGER_NAME_LEN: usize = 80;
const MAX_ROUTE_LEN: usize = 120;

#[derive(Debug, Deserialize)]
pub(crate) struct SeatQuery {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateBookingRequest {
    #[serde(alias = "operatorId")]
    operator_id: Option<String>,
    #[serde(alias = "policyId")]
    policy_id: Option<String>,
    amount: Option<f64>,
    #[serde(alias = "seatNumber")]
    seat_number: Option<String>,
    #[serde(alias = "passengerName")]
    passenger_name: Option<String>,
    #[serde(alias = "travelDate")]
    travel_date: Option<String>,
    #[serde(alias = "departureTime")]
    departure_time: Option<String>,
    #[serde(alias = "departureAt")]
    departure_at: Option<DateTime<Utc>>,
    route: Option<String>,
}

pub(crate) async fn list_operators(State(state): State<ApiState>) -> Result<Response, Response> {
    let operators = state
        .store
        .list_operators()
        .await
        .map_err(|error| internal_error("failed to load operators", error))?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "operators": operators })),
    )
        .into_response())
}

pub(crate) async fn search(
    State(state): State<ApiState>,
    Query(query): Query<BusSearchQuery>,
) -> Result<Response, Response> {
    let operators = state
        .store
        .list_operators()
        .await
        .map_err(|error| internal_error("failed to search buses", error))?;
    let buses = search_buses(&query, &operators).map_err(|error| {
        error_response(StatusCode::BAD_REQUEST, "invalid_search", error.to_string())
    })?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "buses": buses }))).into_response())
}

pub(crate) async fn seats(
    State(state): State<ApiState>,
    Path(operator_id): Path<String>,
    Query(query): Query<SeatQuery>,
) -> Result<Response, Response> {
    let date = parse_travel_date(query.date.as_deref())?.ok_or_else(|| {
        error_response(StatusCode::BAD_REQUEST, "missing_fields", "date is required")
    })?;

    let operator = state
        .store
        .find_operator(&operator_id)
        .await
        .map_err(|error| internal_error("failed to load seats", error))?;
    if operator.is_none() {
        return Err(operator_not_found());
    }

    let booked = state
        .store
        .occupied_seats(&operator_id, date)
        .await
        .map_err(|error| internal_error("failed to load seats", error))?;
    let seats = seat_map(&booked);
    let available = seats.iter().filter(|seat| !seat.occupied).count();

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "operator_id": operator_id,
            "date": date.format("%Y-%m-%d").to_string(),
            "available": available,
            "seats": seats
        })),
    )
        .into_response())
}

pub(crate) async fn list_bookings(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;
    let bookings = state
        .store
        .list_bookings_for_user(&user.user_id)
        .await
        .map_err(|error| internal_error("failed to fetch bookings", error))?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "bookings": bookings })),
    )
        .into_response())
}

pub(crate) async fn create_booking(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(input): Json<CreateBookingRequest>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;

    let (Some(operator_id), Some(amount), Some(seat_number)) =
        (input.operator_id, input.amount, input.seat_number)
    else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing_fields",
            "operator_id, amount and seat_number are required",
        ));
    };
    if !amount.is_finite() || amount <= 0.0 {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_amount",
            "amount must be greater than zero",
        ));
    }

    let operator = state
        .store
        .find_operator(&operator_id)
        .await
        .map_err(|error| internal_error("failed to create booking", error))?
        .ok_or_else(operator_not_found)?;

    let policy_id = match input.policy_id {
        Some(policy_id) if policy_id != operator.policy.policy_id => {
            let policy = state
                .store
                .find_policy(&policy_id)
                .await
                .map_err(|error| internal_error("failed to create booking", error))?;
            match policy {
                Some(policy) if policy.operator_id == operator_id => policy.policy_id,
                _ => {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        "policy_mismatch",
                        "policy does not belong to this operator",
                    ))
                }
            }
        }
        _ => operator.policy.policy_id.clone(),
    };

    let departure_label = input
        .departure_time
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let departure_at = match input.departure_at {
        Some(at) => Some(at),
        None => parse_travel_date(input.travel_date.as_deref())?
            .map(|date| departure_instant(date, departure_label.as_deref())),
    };

    let booked = match departure_at {
        Some(at) => state
            .store
            .occupied_seats(&operator_id, at.date_naive())
            .await
            .map_err(|error| internal_error("failed to create booking", error))?,
        None => HashSet::new(),
    };
    let seat_number = ensure_seat_available(&seat_number, &booked).map_err(seat_error)?;

    let booking = Booking {
        booking_id: uuid::Uuid::new_v4().to_string(),
        user_id: user.user_id.clone(),
        operator_id,
        policy_id,
        amount,
        status: BookingStatus::Confirmed,
        seat_number,
        passenger_name: passenger_name(input.passenger_name.as_deref(), &user),
        route: input
            .route
            .map(|route| route.trim().chars().take(MAX_ROUTE_LEN).collect::<String>())
            .filter(|route| !route.is_empty()),
        departure_label,
        departure_at,
        created_at: Utc::now(),
        cancelled_at: None,
    };

    match state.store.create_booking(&booking).await {
        Ok(()) => {}
        Err(StoreError::Conflict(_)) => {
            return Err(seat_error(SeatError::Occupied(booking.seat_number)))
        }
        Err(error) => return Err(internal_error("failed to create booking", error)),
    }

    info!(
        booking_id = %booking.booking_id,
        user_id = %user.user_id,
        operator = %operator.operator.name,
        seat = %booking.seat_number,
        "booking created"
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "booking": booking })),
    )
        .into_response())
}

pub(crate) async fn refund_preview(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(booking_id): Path<String>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;
    let details = owned_booking(&state, &user, &booking_id).await?;

    let departure_at = details.booking.departure_at.ok_or_else(departure_unknown)?;
    let refund = calculate_refund(details.booking.amount, departure_at, Utc::now(), &details.rules)
        .map_err(|error| {
            error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "refund_unavailable",
                error.to_string(),
            )
        })?;
    state.metrics.inc_refund_preview();

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "booking_id": details.booking.booking_id,
            "status": details.booking.status,
            "operator_name": details.operator_name,
            "policy_version": details.policy_version,
            "refund": refund
        })),
    )
        .into_response())
}

pub(crate) async fn cancel(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(booking_id): Path<String>,
) -> Result<Response, Response> {
    let user = require_user(&state, &headers).await?;
    let details = owned_booking(&state, &user, &booking_id).await?;
    let booking = &details.booking;

    match booking.status {
        BookingStatus::Confirmed => {}
        BookingStatus::Cancelled => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "already_cancelled",
                "booking already cancelled",
            ))
        }
        BookingStatus::Completed => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "booking_completed",
                "completed trips cannot be cancelled",
            ))
        }
    }

    let departure_at = booking.departure_at.ok_or_else(departure_unknown)?;
    let now = Utc::now();
    if departure_at <= now {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "booking_departed",
            "the bus has already departed",
        ));
    }

    let result = calculate_refund(booking.amount, departure_at, now, &details.rules).map_err(
        |error| {
            error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "refund_unavailable",
                error.to_string(),
            )
        },
    )?;

    let refund = RefundTransaction {
        refund_id: uuid::Uuid::new_v4().to_string(),
        booking_id: booking.booking_id.clone(),
        refund_amount: result.refund_amount,
        deduction_total: result.deduction_total,
        breakdown: result.breakdown.clone(),
        cancellation_slot: result.applied_slab.label.clone(),
        status: RefundStatus::Initiated,
        timeline: build_refund_timeline(booking.created_at, now, &details.operator_name, &result),
        initiated_at: now,
        updated_at: now,
    };

    match state.store.cancel_booking(&booking.booking_id, now, &refund).await {
        Ok(()) => {}
        Err(StoreError::Conflict(_) | StoreError::Transition(_)) => {
            state.metrics.inc_cancellation_conflict();
            return Err(error_response(
                StatusCode::CONFLICT,
                "cancellation_conflict",
                "booking was cancelled by another request",
            ));
        }
        Err(StoreError::NotFound(_)) => return Err(booking_not_found()),
        Err(error) => return Err(internal_error("failed to cancel booking", error)),
    }
    state.metrics.inc_cancellation();

    info!(
        target: "audit",
        booking_id = %booking.booking_id,
        user_id = %user.user_id,
        original_amount = booking.amount,
        refund_amount = result.refund_amount,
        deduction_total = result.deduction_total,
        slab = %result.applied_slab.label,
        departure = %departure_at.to_rfc3339(),
        "refund initiated"
    );

    let updated = state
        .store
        .booking_details(&booking.booking_id)
        .await
        .map_err(|error| internal_error("failed to load cancelled booking", error))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "Booking cancelled successfully",
            "booking": updated,
            "refund": result
        })),
    )
        .into_response())
}

/// 404 both when the booking is missing and when another user owns it.
async fn owned_booking(
    state: &ApiState,
    user: &User,
    booking_id: &str,
) -> Result<BookingDetails, Response> {
    let details = state
        .store
        .booking_details(booking_id)
        .await
        .map_err(|error| internal_error("failed to load booking", error))?;
    match details {
        Some(details) if details.booking.user_id == user.user_id => Ok(details),
        _ => Err(booking_not_found()),
    }
}

fn parse_travel_date(raw: Option<&str>) -> Result<Option<NaiveDate>, Response> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_date",
                format!("date must be YYYY-MM-DD (got {raw})"),
            )
        })
}

/// Combines the travel day with a "9:00 AM" style label; midnight when the
/// label is missing or unreadable.
fn departure_instant(date: NaiveDate, label: Option<&str>) -> DateTime<Utc> {
    let time = label
        .and_then(|label| {
            NaiveTime::parse_from_str(label, "%I:%M %p")
                .or_else(|_| NaiveTime::parse_from_str(label, "%H:%M"))
                .ok()
        })
        .unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

fn passenger_name(requested: Option<&str>, user: &User) -> String {
    requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .or_else(|| user.name.clone())
        .unwrap_or_else(|| user.email.clone())
        .chars()
        .take(MAX_PASSENGER_NAME_LEN)
        .collect()
}

fn seat_error(error: SeatError) -> Response {
    match error {
        SeatError::UnknownSeat(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_seat", error.to_string())
        }
        SeatError::Occupied(_) => {
            error_response(StatusCode::CONFLICT, "seat_taken", error.to_string())
        }
    }
}

fn booking_not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "booking_not_found",
        "booking not found",
    )
}

fn operator_not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "operator_not_found",
        "operator not found",
    )
}

fn departure_unknown() -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "departure_unknown",
        "booking has no departure time",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn departure_label_sets_the_hour() {
        let date = NaiveDate::from_ymd_opt(2030, 3, 1).unwrap();
        assert_eq!(departure_instant(date, Some("9:00 AM")).hour(), 9);
        assert_eq!(departure_instant(date, Some("21:30")).hour(), 21);
        assert_eq!(departure_instant(date, Some("soon")).hour(), 0);
        assert_eq!(departure_instant(date, None).date_naive(), date);
    }

    #[test]
    fn travel_date_must_be_iso() {
        assert!(parse_travel_date(None).unwrap().is_none());
        assert!(parse_travel_date(Some("  ")).unwrap().is_none());
        assert!(parse_travel_date(Some("2030-03-01")).unwrap().is_some());
        assert!(parse_travel_date(Some("01/03/2030")).is_err());
    }

    #[test]
    fn passenger_defaults_to_the_account_name() {
        let now = Utc::now();
        let user = User {
            user_id: "u1".to_string(),
            email: "kavya@example.com".to_string(),
            name: None,
            phone_number: None,
            password_hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(passenger_name(None, &user), "kavya@example.com");
        assert_eq!(passenger_name(Some(" Kavya "), &user), "Kavya");
    }
}
