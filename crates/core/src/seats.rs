use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SEAT_ROWS: u8 = 10;
pub const SEATS_PER_ROW: u8 = 4;

/// Seats the demo layout treats as already sold.
pub const MOCK_OCCUPIED_SEATS: [&str; 5] = ["1A", "2B", "5C", "8D", "10A"];
pub const BEST_SEATS: [&str; 6] = ["1A", "1B", "1C", "1D", "2A", "2B"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeatError {
    #[error("seat {0} does not exist on this bus")]
    UnknownSeat(String),
    #[error("seat {0} is already taken")]
    Occupied(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatInfo {
    pub label: String,
    pub row: u8,
    pub column: char,
    pub occupied: bool,
    pub recommended: bool,
}

pub fn seat_labels() -> Vec<String> {
    (0..SEAT_ROWS * SEATS_PER_ROW)
        .map(|index| {
            let row = index / SEATS_PER_ROW + 1;
            let column = (b'A' + index % SEATS_PER_ROW) as char;
            format!("{row}{column}")
        })
        .collect()
}

pub fn normalize_seat(label: &str) -> String {
    label.trim().to_ascii_uppercase()
}

pub fn is_valid_seat(label: &str) -> bool {
    let label = normalize_seat(label);
    let Some(column) = label.chars().last() else {
        return false;
    };
    let row = &label[..label.len() - column.len_utf8()];
    let Ok(row) = row.parse::<u8>() else {
        return false;
    };
    (1..=SEAT_ROWS).contains(&row)
        && ('A'..(b'A' + SEATS_PER_ROW) as char).contains(&column)
        && !label.starts_with('0')
}

/// Full layout with the mock occupied seats and `booked` merged in.
pub fn seat_map(booked: &HashSet<String>) -> Vec<SeatInfo> {
    seat_labels()
        .into_iter()
        .enumerate()
        .map(|(index, label)| {
            let index = index as u8;
            let occupied = MOCK_OCCUPIED_SEATS.contains(&label.as_str()) || booked.contains(&label);
            SeatInfo {
                recommended: BEST_SEATS.contains(&label.as_str()) && !occupied,
                row: index / SEATS_PER_ROW + 1,
                column: (b'A' + index % SEATS_PER_ROW) as char,
                occupied,
                label,
            }
        })
        .collect()
}

pub fn ensure_seat_available(label: &str, booked: &HashSet<String>) -> Result<String, SeatError> {
    let normalized = normalize_seat(label);
    if !is_valid_seat(&normalized) {
        return Err(SeatError::UnknownSeat(label.trim().to_string()));
    }
    if MOCK_OCCUPIED_SEATS.contains(&normalized.as_str()) || booked.contains(&normalized) {
        return Err(SeatError::Occupied(normalized));
    }
    Ok(normalized)
}
