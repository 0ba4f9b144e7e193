use serde_json::json;

use crate::models::{
    AssistantContext, AssistantReply, BookingContextItem, BookingStatus, Intent, Locale,
    RefundStatus, SuggestedAction,
};

/// Deterministic Markdown reply built only from `context`.
///
/// Used whenever the model is unavailable. The assistant is read-only, so no
/// branch ever claims to have booked or cancelled anything.
pub fn compose_chat_reply(
    intent: Intent,
    locale: Locale,
    context: &AssistantContext,
    clarifying_questions: Vec<String>,
) -> AssistantReply {
    let tamil = locale == Locale::Ta;
    let mut sections = Vec::new();
    let mut suggested_actions = Vec::new();

    match intent {
        Intent::RefundPolicy => {
            sections.push(heading(tamil, "Refund policy", "பணம் திரும்பப் பெறும் கொள்கை"));
            sections.push(context.policy_text.clone());
            if let Some(first) = context.bookings.first() {
                if !first.policy_lines.is_empty() {
                    sections.push(format!(
                        "**{}**\n{}",
                        first.operator_name,
                        bullet_list(&first.policy_lines)
                    ));
                }
                suggested_actions.push(action(
                    "refund_preview",
                    if tamil { "ரீஃபண்ட் முன்னோட்டம்" } else { "Preview my refund" },
                    json!({ "booking_id": first.booking_id }),
                ));
            }
        }
        Intent::RefundStatus => {
            sections.push(heading(tamil, "Your refunds", "உங்கள் ரீஃபண்டுகள்"));
            let refunds = context
                .bookings
                .iter()
                .filter(|booking| booking.refund_status.is_some())
                .map(|booking| refund_line(booking, tamil))
                .collect::<Vec<_>>();
            if refunds.is_empty() {
                sections.push(
                    if tamil {
                        "உங்கள் கணக்கில் எந்த ரீஃபண்டும் இல்லை."
                    } else {
                        "You have no refunds in progress."
                    }
                    .to_string(),
                );
            } else {
                sections.push(refunds.join("\n"));
                sections.push(
                    if tamil {
                        "செயலாக்கம் 1-2 நாட்கள், வங்கிக் கணக்கில் வர 3-5 நாட்கள் ஆகும்."
                    } else {
                        "Processing takes 1-2 days and the credit reaches your bank in 3-5 days."
                    }
                    .to_string(),
                );
            }
        }
        Intent::BookingDetails => {
            sections.push(heading(tamil, "Your bookings", "உங்கள் முன்பதிவுகள்"));
            if context.bookings.is_empty() {
                sections.push(no_bookings(tamil));
            } else {
                sections.push(
                    context
                        .bookings
                        .iter()
                        .map(booking_line)
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
            }
        }
        Intent::Cancellation => {
            sections.push(heading(tamil, "Cancelling a ticket", "டிக்கெட் ரத்து"));
            sections.push(
                if tamil {
                    "நான் டிக்கெட்டை ரத்து செய்ய முடியாது. டாஷ்போர்டில் உள்ள முன்பதிவைத் திறந்து \"Cancel\" அழுத்தவும்; உறுதி செய்வதற்கு முன் ரீஃபண்ட் தொகை காட்டப்படும்."
                } else {
                    "I can't cancel tickets for you. Open the booking on your dashboard and press **Cancel**; the refund amount is shown before you confirm."
                }
                .to_string(),
            );
            let open = context
                .bookings
                .iter()
                .filter(|booking| booking.status == BookingStatus::Confirmed)
                .collect::<Vec<_>>();
            if !open.is_empty() {
                sections.push(
                    open.iter()
                        .map(|booking| booking_line(booking))
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
            }
            for booking in open {
                suggested_actions.push(action(
                    "refund_preview",
                    &format!("Preview refund for {}", booking.operator_name),
                    json!({ "booking_id": booking.booking_id }),
                ));
            }
        }
        Intent::SmallTalk => {
            sections.push(if tamil {
                format!(
                    "வணக்கம் {}! ரீஃபண்ட், ரத்து அல்லது உங்கள் முன்பதிவுகள் பற்றி கேளுங்கள்.",
                    context.user_name
                )
            } else {
                format!(
                    "Hi {}! Ask me about refunds, cancellations or your bookings.",
                    context.user_name
                )
            });
        }
        Intent::Unknown => {
            sections.push(
                if tamil {
                    "மன்னிக்கவும், அது எனக்கு புரியவில்லை. நான் ரீஃபண்ட் மற்றும் முன்பதிவு கேள்விகளுக்கு உதவுவேன்."
                } else {
                    "Sorry, I didn't catch that. I can help with refunds, cancellations and your bookings."
                }
                .to_string(),
            );
        }
    }

    if !clarifying_questions.is_empty() {
        sections.push(bullet_list(&clarifying_questions));
    }

    AssistantReply {
        reply_text: sections.join("\n\n"),
        json_payload: json!({
            "intent": intent,
            "booking_count": context.bookings.len(),
        }),
        suggested_actions,
        locale,
        intent,
        clarifying_questions,
    }
}

fn heading(tamil: bool, english: &str, tamil_text: &str) -> String {
    format!("### {}", if tamil { tamil_text } else { english })
}

fn no_bookings(tamil: bool) -> String {
    if tamil {
        "உங்களுக்கு முன்பதிவுகள் எதுவும் இல்லை.".to_string()
    } else {
        "You don't have any bookings yet.".to_string()
    }
}

fn booking_line(booking: &BookingContextItem) -> String {
    let route = booking.route.as_deref().unwrap_or("route not set");
    let when = match (&booking.travel_date, &booking.departure_time) {
        (Some(date), Some(time)) => format!("{date} {time}"),
        (Some(date), None) => date.clone(),
        (None, Some(time)) => time.clone(),
        (None, None) => "departure not set".to_string(),
    };
    format!(
        "- **{}** {route}, {when}, ₹{:.2} ({})",
        booking.operator_name, booking.amount, booking.status
    )
}

fn refund_line(booking: &BookingContextItem, tamil: bool) -> String {
    let status = booking.refund_status.unwrap_or(RefundStatus::Initiated);
    let amount = booking.refund_amount.unwrap_or_default();
    let state = match (status, tamil) {
        (RefundStatus::Initiated, false) => "initiated",
        (RefundStatus::Processing, false) => "processing",
        (RefundStatus::Completed, false) => "credited",
        (RefundStatus::Failed, false) => "failed, contact support",
        (RefundStatus::Initiated, true) => "தொடங்கப்பட்டது",
        (RefundStatus::Processing, true) => "செயலாக்கத்தில்",
        (RefundStatus::Completed, true) => "வரவு வைக்கப்பட்டது",
        (RefundStatus::Failed, true) => "தோல்வி, உதவியை அணுகவும்",
    };
    format!("- **{}**: ₹{amount:.2} {state}", booking.operator_name)
}

fn bullet_list(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn action(action_type: &str, label: &str, payload: serde_json::Value) -> SuggestedAction {
    SuggestedAction {
        action_type: action_type.to_string(),
        label: label.to_string(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AssistantContext {
        AssistantContext {
            user_name: "Priya".to_string(),
            bookings: vec![
                BookingContextItem {
                    booking_id: "b-1".to_string(),
                    operator_name: "NightRider".to_string(),
                    route: Some("Chennai → Madurai".to_string()),
                    travel_date: Some("2026-10-20".to_string()),
                    departure_time: Some("9:00 AM".to_string()),
                    amount: 700.0,
                    status: BookingStatus::Cancelled,
                    refund_status: Some(RefundStatus::Processing),
                    refund_amount: Some(665.0),
                    policy_lines: vec!["24h+: 95% refund".to_string()],
                },
                BookingContextItem {
                    booking_id: "b-2".to_string(),
                    operator_name: "StarBus".to_string(),
                    route: None,
                    travel_date: None,
                    departure_time: None,
                    amount: 850.0,
                    status: BookingStatus::Confirmed,
                    refund_status: None,
                    refund_amount: None,
                    policy_lines: Vec::new(),
                },
            ],
            policy_text: "Refund Policy: 95% refund if >24hrs.".to_string(),
        }
    }

    #[test]
    fn refund_status_lists_only_refunded_bookings() {
        let reply = compose_chat_reply(Intent::RefundStatus, Locale::En, &context(), Vec::new());
        assert!(reply.reply_text.contains("₹665.00 processing"));
        assert!(!reply.reply_text.contains("StarBus"));
    }

    #[test]
    fn cancellation_reply_stays_read_only() {
        let reply = compose_chat_reply(Intent::Cancellation, Locale::En, &context(), Vec::new());
        assert!(reply.reply_text.contains("can't cancel"));
        assert_eq!(reply.suggested_actions.len(), 1);
        assert_eq!(reply.suggested_actions[0].payload["booking_id"], "b-2");
    }

    #[test]
    fn tamil_and_clarifying_questions_are_carried() {
        let reply = compose_chat_reply(
            Intent::BookingDetails,
            Locale::Ta,
            &context(),
            vec!["Which booking?".to_string()],
        );
        assert!(reply.reply_text.starts_with("### உங்கள் முன்பதிவுகள்"));
        assert!(reply.reply_text.ends_with("- Which booking?"));
        assert_eq!(reply.locale, Locale::Ta);
    }
}
