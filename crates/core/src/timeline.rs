use chrono::{DateTime, Utc};

use crate::models::{RefundResult, RefundStatus, TimelineEntry, TimelineStatus};

pub const STAGE_BOOKED: &str = "Booked";
pub const STAGE_CANCELLED: &str = "Cancelled";
pub const STAGE_INITIATED: &str = "Refund Initiated";
pub const STAGE_PROCESSING: &str = "Processing";
pub const STAGE_CREDITED: &str = "Credited";

pub fn build_refund_timeline(
    booked_at: DateTime<Utc>,
    cancelled_at: DateTime<Utc>,
    operator_name: &str,
    result: &RefundResult,
) -> Vec<TimelineEntry> {
    vec![
        entry(
            STAGE_BOOKED,
            Some(booked_at),
            TimelineStatus::Completed,
            format!("Ticket booked for {operator_name}"),
        ),
        entry(
            STAGE_CANCELLED,
            Some(cancelled_at),
            TimelineStatus::Completed,
            format!("Cancellation confirmed. {}", result.applied_slab.label),
        ),
        entry(
            STAGE_INITIATED,
            Some(cancelled_at),
            TimelineStatus::Current,
            format!("Refund of ₹{:.2} initiated", result.refund_amount),
        ),
        entry(
            STAGE_PROCESSING,
            None,
            TimelineStatus::Pending,
            "Bank verification in progress".to_string(),
        ),
        entry(
            STAGE_CREDITED,
            None,
            TimelineStatus::Pending,
            "Amount will be credited to your original payment method".to_string(),
        ),
    ]
}

/// Moves the "current" marker to match `status`.
pub fn advance_timeline(timeline: &mut [TimelineEntry], status: RefundStatus, at: DateTime<Utc>) {
    match status {
        RefundStatus::Initiated => {}
        RefundStatus::Processing => {
            set_stage(timeline, STAGE_INITIATED, TimelineStatus::Completed, None);
            set_stage(timeline, STAGE_PROCESSING, TimelineStatus::Current, Some(at));
        }
        RefundStatus::Completed => {
            set_stage(timeline, STAGE_INITIATED, TimelineStatus::Completed, None);
            set_stage(timeline, STAGE_PROCESSING, TimelineStatus::Completed, None);
            set_stage(timeline, STAGE_CREDITED, TimelineStatus::Completed, Some(at));
        }
        RefundStatus::Failed => {
            let current = timeline
                .iter_mut()
                .find(|entry| entry.status == TimelineStatus::Current);
            if let Some(current) = current {
                current.status = TimelineStatus::Failed;
                current.timestamp = Some(at);
                current.description = format!("{} (failed)", current.description);
            }
        }
    }
}

fn set_stage(
    timeline: &mut [TimelineEntry],
    stage: &str,
    status: TimelineStatus,
    at: Option<DateTime<Utc>>,
) {
    if let Some(entry) = timeline.iter_mut().find(|entry| entry.stage == stage) {
        entry.status = status;
        if at.is_some() || entry.timestamp.is_none() {
            entry.timestamp = at.or(entry.timestamp);
        }
    }
}

fn entry(
    stage: &str,
    timestamp: Option<DateTime<Utc>>,
    status: TimelineStatus,
    description: String,
) -> TimelineEntry {
    TimelineEntry {
        stage: stage.to_string(),
        timestamp,
        status,
        description,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::RefundRules;
    use crate::refund::calculate_refund;

    fn sample_timeline() -> Vec<TimelineEntry> {
        let now = Utc::now();
        let result =
            calculate_refund(1000.0, now + Duration::hours(30), now, &RefundRules::standard())
                .unwrap();
        build_refund_timeline(now - Duration::days(2), now, "NightRider", &result)
    }

    #[test]
    fn new_timeline_has_refund_initiated_as_current() {
        let timeline = sample_timeline();
        assert_eq!(timeline.len(), 5);
        assert_eq!(timeline[0].description, "Ticket booked for NightRider");
        assert_eq!(timeline[2].status, TimelineStatus::Current);
        assert_eq!(timeline[2].description, "Refund of ₹950.00 initiated");
        assert!(timeline[4].timestamp.is_none());
    }

    #[test]
    fn completion_marks_every_stage_done() {
        let mut timeline = sample_timeline();
        let now = Utc::now();
        advance_timeline(&mut timeline, RefundStatus::Processing, now);
        assert_eq!(timeline[3].status, TimelineStatus::Current);
        advance_timeline(&mut timeline, RefundStatus::Completed, now);
        assert!(timeline
            .iter()
            .all(|entry| entry.status == TimelineStatus::Completed));
        assert_eq!(timeline[4].timestamp, Some(now));
    }

    #[test]
    fn failure_flags_the_current_stage() {
        let mut timeline = sample_timeline();
        advance_timeline(&mut timeline, RefundStatus::Failed, Utc::now());
        assert_eq!(timeline[2].status, TimelineStatus::Failed);
    }
}
