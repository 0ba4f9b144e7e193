use crate::models::{Intent, Locale};

pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

const TAMIL_BLOCK: std::ops::RangeInclusive<u32> = 0x0B80..=0x0BFF;

pub fn detect_locale(explicit: Option<Locale>, text: &str) -> Locale {
    if let Some(locale) = explicit {
        if locale != Locale::Unknown {
            return locale;
        }
    }

    let lower = text.to_lowercase();
    if contains_any(&lower, &["in tamil", "tamil la", "தமிழ்"]) {
        return Locale::Ta;
    }

    let mut tamil_count = 0usize;
    let mut latin_count = 0usize;
    for ch in text.chars() {
        if TAMIL_BLOCK.contains(&(ch as u32)) {
            tamil_count += 1;
        } else if ch.is_ascii_alphabetic() {
            latin_count += 1;
        }
    }

    if tamil_count > 0 && tamil_count * 2 >= latin_count {
        Locale::Ta
    } else if latin_count > 0 {
        Locale::En
    } else {
        Locale::Unknown
    }
}

pub fn classify_intent_rules(text: &str) -> Intent {
    let lower = text.to_lowercase();

    if contains_any(
        &lower,
        &[
            "refund status",
            "where is my refund",
            "where's my refund",
            "refund credited",
            "not received",
            "not yet received",
            "track refund",
            "பணம் திரும்ப வந்ததா",
            "ரீஃபண்ட் நிலை",
        ],
    ) {
        return Intent::RefundStatus;
    }

    if contains_any(
        &lower,
        &[
            "how do i cancel",
            "cancel my",
            "cancel ticket",
            "cancellation",
            "want to cancel",
            "ரத்து",
        ],
    ) {
        return Intent::Cancellation;
    }

    if contains_any(
        &lower,
        &[
            "refund",
            "policy",
            "how much will i get",
            "deduction",
            "convenience fee",
            "slab",
            "பணம் திரும்ப",
            "கொள்கை",
        ],
    ) {
        return Intent::RefundPolicy;
    }

    if contains_any(
        &lower,
        &[
            "my booking",
            "my bookings",
            "my ticket",
            "booking details",
            "seat number",
            "departure",
            "when is my bus",
            "முன்பதிவு",
            "டிக்கெட்",
        ],
    ) {
        return Intent::BookingDetails;
    }

    if contains_any(
        &lower,
        &["hello", "hi", "hey", "thanks", "thank you", "வணக்கம்", "நன்றி"],
    ) {
        return Intent::SmallTalk;
    }

    Intent::Unknown
}

/// True when the reply should ask which booking (or what) the user means.
pub fn needs_clarification(intent: Intent, text: &str, booking_count: usize) -> bool {
    let mentions_reference = text.chars().any(|ch| ch.is_ascii_digit());

    match intent {
        Intent::RefundStatus | Intent::BookingDetails | Intent::Cancellation => {
            booking_count > 1 && !mentions_reference
        }
        Intent::Unknown => text.split_whitespace().count() <= 2,
        _ => false,
    }
}

fn contains_any(input: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| input.contains(needle))
}
