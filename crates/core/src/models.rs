use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    En,
    Ta,
    Unknown,
}

impl Locale {
    pub fn from_optional_str(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "en" || v == "en-in" || v == "en-us" || v == "english" => Self::En,
            Some(v) if v == "ta" || v == "ta-in" || v == "tamil" || v == "தமிழ்" => Self::Ta,
            _ => Self::Unknown,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Ta => "ta",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    RefundPolicy,
    RefundStatus,
    BookingDetails,
    Cancellation,
    SmallTalk,
    Unknown,
}

/// One band of the hours-before-departure timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSlab {
    pub hours_before: f64,
    pub refund_percentage: f64,
    pub label: String,
}

impl RefundSlab {
    pub fn new(hours_before: f64, refund_percentage: f64, label: impl Into<String>) -> Self {
        Self {
            hours_before,
            refund_percentage,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundFees {
    pub convenience: f64,
    #[serde(default)]
    pub operator_delay: f64,
}

impl Default for RefundFees {
    fn default() -> Self {
        Self {
            convenience: 5.0,
            operator_delay: 0.0,
        }
    }
}

/// Slabs plus fee percentages, as stored on a [`RefundPolicy`].
///
/// Construct from untrusted JSON with [`RefundRules::from_json`], which
/// validates the document before it reaches the calculator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRules {
    pub slabs: Vec<RefundSlab>,
    #[serde(default)]
    pub fees: RefundFees,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deductions {
    pub convenience: f64,
    pub cancellation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundBreakdown {
    pub original_fare: f64,
    pub refund_amount: f64,
    pub deductions: Deductions,
    pub applied_slab: String,
    pub time_diff_hrs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_amount: f64,
    pub deduction_total: f64,
    pub breakdown: RefundBreakdown,
    pub applied_slab: RefundSlab,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot move {entity} from {from} to {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Confirmed, Self::Cancelled) | (Self::Confirmed, Self::Completed)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "booking",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Initiated,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "INITIATED" => Some(Self::Initiated),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" | "CREDITED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initiated, Self::Processing)
                | (Self::Initiated, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "refund",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStatus {
    Completed,
    Current,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub stage: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: TimelineStatus,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
    pub phone_number: Option<String>,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusOperator {
    pub operator_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundPolicy {
    pub policy_id: String,
    pub operator_id: String,
    pub version: i64,
    pub is_current: bool,
    pub rules: RefundRules,
    pub cancellation_summary: String,
    pub reschedule_summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorWithPolicy {
    pub operator: BusOperator,
    pub policy: RefundPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub user_id: String,
    pub operator_id: String,
    pub policy_id: String,
    pub amount: f64,
    pub status: BookingStatus,
    pub seat_number: String,
    pub passenger_name: String,
    pub route: Option<String>,
    pub departure_label: Option<String>,
    pub departure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundTransaction {
    pub refund_id: String,
    pub booking_id: String,
    pub refund_amount: f64,
    pub deduction_total: f64,
    pub breakdown: RefundBreakdown,
    pub cancellation_slot: String,
    pub status: RefundStatus,
    pub timeline: Vec<TimelineEntry>,
    pub initiated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A booking joined with what the dashboard and the assistant need to show it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub operator_name: String,
    pub policy_version: i64,
    pub rules: RefundRules,
    pub refund: Option<RefundTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub at: DateTime<Utc>,
    pub user_text: String,
    pub assistant_text: String,
    pub intent: Intent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: Option<String>,
    pub locale: Locale,
    pub expires_at: DateTime<Utc>,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInput {
    pub session_id: Option<String>,
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    pub locale: Option<String>,
}

impl ChatInput {
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == ChatRole::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action_type: String,
    pub label: String,
    pub payload: Value,
}

/// What the assistant knows about one booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingContextItem {
    pub booking_id: String,
    pub operator_name: String,
    pub route: Option<String>,
    pub travel_date: Option<String>,
    pub departure_time: Option<String>,
    pub amount: f64,
    pub status: BookingStatus,
    pub refund_status: Option<RefundStatus>,
    pub refund_amount: Option<f64>,
    pub policy_lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantContext {
    pub user_name: String,
    pub bookings: Vec<BookingContextItem>,
    pub policy_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantReply {
    pub reply_text: String,
    pub suggested_actions: Vec<SuggestedAction>,
    pub json_payload: Value,
    pub locale: Locale,
    pub intent: Intent,
    pub clarifying_questions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_status_only_leaves_confirmed() {
        assert!(BookingStatus::Confirmed.can_transition_to(BookingStatus::Cancelled));
        assert!(BookingStatus::Confirmed.can_transition_to(BookingStatus::Completed));
        assert!(BookingStatus::Cancelled
            .transition(BookingStatus::Confirmed)
            .is_err());
        assert!(BookingStatus::Completed
            .transition(BookingStatus::Cancelled)
            .is_err());
    }

    #[test]
    fn refund_status_progression() {
        let status = RefundStatus::Initiated
            .transition(RefundStatus::Processing)
            .and_then(|status| status.transition(RefundStatus::Completed))
            .expect("initiated -> processing -> completed should be allowed");
        assert!(status.is_terminal());

        let err = RefundStatus::Initiated
            .transition(RefundStatus::Completed)
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot move refund from INITIATED to COMPLETED");
    }

    #[test]
    fn slab_json_uses_policy_document_keys() {
        let slab: RefundSlab = serde_json::from_value(serde_json::json!({
            "hoursBefore": 24,
            "refundPercentage": 95,
            "label": "More than 24 hours"
        }))
        .unwrap();
        assert_eq!(slab.hours_before, 24.0);
        assert_eq!(slab.refund_percentage, 95.0);
    }
}
