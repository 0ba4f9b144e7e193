//! Mocked bus search: every operator with a current policy runs one service a day.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::OperatorWithPolicy;

const BASE_FARE: f64 = 700.0;
const FARE_STEP: f64 = 150.0;
const FIRST_DEPARTURE_HOUR: u32 = 9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("date must be YYYY-MM-DD (got {0})")]
    InvalidDate(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusSearchQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusOption {
    pub id: String,
    pub name: String,
    pub operator_name: String,
    pub operator_id: String,
    pub policy_id: String,
    pub route: String,
    pub departure: String,
    pub arrival: String,
    pub departure_at: DateTime<Utc>,
    pub price: f64,
    pub bus_type: String,
}

#[derive(Debug, Clone)]
struct ValidatedQuery {
    from: String,
    to: String,
    date: NaiveDate,
}

fn validate(query: &BusSearchQuery) -> Result<ValidatedQuery, SearchError> {
    let required = |value: &Option<String>, name: &'static str| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
            .ok_or(SearchError::MissingField(name))
    };

    let from = required(&query.from, "from")?;
    let to = required(&query.to, "to")?;
    let raw_date = required(&query.date, "date")?;
    let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
        .map_err(|_| SearchError::InvalidDate(raw_date.clone()))?;

    Ok(ValidatedQuery { from, to, date })
}

pub fn search_buses(
    query: &BusSearchQuery,
    operators: &[OperatorWithPolicy],
) -> Result<Vec<BusOption>, SearchError> {
    let query = validate(query)?;
    let route = format!("{} → {}", query.from, query.to);

    let options = operators
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let index_u32 = index as u32;
            let departure_hour = (FIRST_DEPARTURE_HOUR + index_u32) % 24;
            BusOption {
                id: entry.operator.operator_id.clone(),
                name: format!("{} Express", entry.operator.name),
                operator_name: entry.operator.name.clone(),
                operator_id: entry.operator.operator_id.clone(),
                policy_id: entry.policy.policy_id.clone(),
                route: route.clone(),
                departure: format!("{}:00 AM", FIRST_DEPARTURE_HOUR + index_u32),
                arrival: format!("{}:00 PM", 5 + index_u32),
                departure_at: departure_instant(query.date, departure_hour),
                price: BASE_FARE + FARE_STEP * index as f64,
                bus_type: if index % 2 == 0 {
                    "A/C Sleeper"
                } else {
                    "Non-A/C Seater"
                }
                .to_string(),
            }
        })
        .collect();

    Ok(options)
}

fn departure_instant(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = date
        .and_hms_opt(hour, 0, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
    Utc.from_utc_datetime(&naive)
}
