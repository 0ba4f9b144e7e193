use serde_json::Value;
use thiserror::Error;

use crate::models::{RefundFees, RefundRules, RefundSlab};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("policy document is malformed: {0}")]
    Malformed(String),
    #[error("policy must define at least one slab")]
    NoSlabs,
    #[error("slab {index} has invalid hoursBefore {value}")]
    InvalidHours { index: usize, value: f64 },
    #[error("slab {index} has refundPercentage {value} outside 0-100")]
    InvalidPercentage { index: usize, value: f64 },
    #[error("slab {index} has an empty label")]
    EmptyLabel { index: usize },
    #[error("fee {name} is {value}, expected 0-100")]
    InvalidFee { name: &'static str, value: f64 },
}

impl RefundRules {
    /// Parses a stored policy document and rejects anything the calculator
    /// should never see.
    pub fn from_json(value: &Value) -> Result<Self, PolicyError> {
        let rules: RefundRules = serde_json::from_value(value.clone())
            .map_err(|error| PolicyError::Malformed(error.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PolicyError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|error| PolicyError::Malformed(error.to_string()))?;
        Self::from_json(&value)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.slabs.is_empty() {
            return Err(PolicyError::NoSlabs);
        }

        for (index, slab) in self.slabs.iter().enumerate() {
            if !slab.hours_before.is_finite() || slab.hours_before < 0.0 {
                return Err(PolicyError::InvalidHours {
                    index,
                    value: slab.hours_before,
                });
            }
            if !is_percentage(slab.refund_percentage) {
                return Err(PolicyError::InvalidPercentage {
                    index,
                    value: slab.refund_percentage,
                });
            }
            if slab.label.trim().is_empty() {
                return Err(PolicyError::EmptyLabel { index });
            }
        }

        if !is_percentage(self.fees.convenience) {
            return Err(PolicyError::InvalidFee {
                name: "convenience",
                value: self.fees.convenience,
            });
        }
        if !is_percentage(self.fees.operator_delay) {
            return Err(PolicyError::InvalidFee {
                name: "operatorDelay",
                value: self.fees.operator_delay,
            });
        }

        Ok(())
    }

    /// The platform-wide slab table.
    pub fn standard() -> Self {
        Self {
            slabs: vec![
                RefundSlab::new(24.0, 95.0, "More than 24 hours before departure"),
                RefundSlab::new(12.0, 75.0, "12-24 hours before departure"),
                RefundSlab::new(3.0, 50.0, "3-12 hours before departure"),
                RefundSlab::new(0.0, 0.0, "Less than 3 hours before departure"),
            ],
            fees: RefundFees::default(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn is_percentage(value: f64) -> bool {
    value.is_finite() && (0.0..=100.0).contains(&value)
}

/// An operator inserted by `trustroute seed` and on first start of an empty store.
#[derive(Debug, Clone)]
pub struct SeedOperator {
    pub name: &'static str,
    pub cancellation_summary: &'static str,
    pub reschedule_summary: &'static str,
    pub rules: RefundRules,
}

pub fn default_operators() -> Vec<SeedOperator> {
    vec![
        SeedOperator {
            name: "FastTrack Travels",
            cancellation_summary: "Full refund before 24h, 50% refund before 12h",
            reschedule_summary: "Allowed with 10% fee up to 6h before",
            rules: rules(&[
                (24.0, 100.0, "More than 24 hours before departure"),
                (12.0, 50.0, "12-24 hours before departure"),
                (0.0, 0.0, "Less than 12 hours before departure"),
            ]),
        },
        SeedOperator {
            name: "StarBus",
            cancellation_summary: "No refund within 24h of departure",
            reschedule_summary: "Not allowed for promotional tickets",
            rules: rules(&[
                (24.0, 90.0, "More than 24 hours before departure"),
                (0.0, 0.0, "Within 24 hours of departure"),
            ]),
        },
        SeedOperator {
            name: "GreenLine",
            cancellation_summary: "75% refund if cancelled 48h early",
            reschedule_summary: "Unlimited rescheduling for Silver members",
            rules: rules(&[
                (48.0, 75.0, "More than 48 hours before departure"),
                (0.0, 0.0, "Within 48 hours of departure"),
            ]),
        },
        SeedOperator {
            name: "NightRider",
            cancellation_summary: "95% refund before 24h, 50% refund before 6h",
            reschedule_summary: "Allowed with 5% fee up to 4h before",
            rules: rules(&[
                (24.0, 95.0, "More than 24 hours before departure"),
                (6.0, 50.0, "6-24 hours before departure"),
                (0.0, 0.0, "Less than 6 hours before departure"),
            ]),
        },
        SeedOperator {
            name: "CityLink Express",
            cancellation_summary: "80% refund if cancelled 24h early",
            reschedule_summary: "Allowed with 15% fee up to 8h before",
            rules: rules(&[
                (24.0, 80.0, "More than 24 hours before departure"),
                (0.0, 0.0, "Within 24 hours of departure"),
            ]),
        },
        SeedOperator {
            name: "Royal Coaches",
            cancellation_summary: "90% refund before 12h, 40% refund before 3h",
            reschedule_summary: "Allowed with 20% fee up to 2h before",
            rules: rules(&[
                (12.0, 90.0, "More than 12 hours before departure"),
                (3.0, 40.0, "3-12 hours before departure"),
                (0.0, 0.0, "Less than 3 hours before departure"),
            ]),
        },
        SeedOperator {
            name: "MetroWay",
            cancellation_summary: "85% refund before 24h, 30% refund before 6h",
            reschedule_summary: "Allowed with 10% fee up to 5h before",
            rules: rules(&[
                (24.0, 85.0, "More than 24 hours before departure"),
                (6.0, 30.0, "6-24 hours before departure"),
                (0.0, 0.0, "Less than 6 hours before departure"),
            ]),
        },
    ]
}

fn rules(slabs: &[(f64, f64, &str)]) -> RefundRules {
    RefundRules {
        slabs: slabs
            .iter()
            .map(|(hours, pct, label)| RefundSlab::new(*hours, *pct, *label))
            .collect(),
        fees: RefundFees::default(),
    }
}

/// One line per slab, highest threshold first, plus the fee line.
pub fn describe_rules(rules: &RefundRules) -> Vec<String> {
    let mut slabs = rules.slabs.iter().collect::<Vec<_>>();
    slabs.sort_by(|a, b| b.hours_before.total_cmp(&a.hours_before));

    let mut lines = slabs
        .into_iter()
        .map(|slab| {
            format!(
                "{}: {}% refund (cancel at least {}h before departure)",
                slab.label,
                format_number(slab.refund_percentage),
                format_number(slab.hours_before)
            )
        })
        .collect::<Vec<_>>();
    lines.push(format!(
        "Convenience fee: {}% of the fare is retained on every cancellation",
        format_number(rules.fees.convenience)
    ));
    lines
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.1}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_the_stored_document_shape() {
        let rules = RefundRules::from_json(&json!({
            "slabs": [
                { "hoursBefore": 24, "refundPercentage": 95, "label": "24h+" },
                { "hoursBefore": 0, "refundPercentage": 0, "label": "late" }
            ],
            "fees": { "convenience": 5, "operatorDelay": 0 }
        }))
        .expect("document should validate");
        assert_eq!(rules.slabs.len(), 2);
    }

    #[test]
    fn missing_fees_default_to_five_percent() {
        let rules = RefundRules::from_json(&json!({
            "slabs": [{ "hoursBefore": 0, "refundPercentage": 0, "label": "none" }]
        }))
        .unwrap();
        assert_eq!(rules.fees.convenience, 5.0);
    }

    #[test]
    fn rejects_bad_documents() {
        assert_eq!(
            RefundRules::from_json(&json!({ "slabs": [] })),
            Err(PolicyError::NoSlabs)
        );
        assert!(matches!(
            RefundRules::from_json(&json!({
                "slabs": [{ "hoursBefore": -1, "refundPercentage": 10, "label": "x" }]
            })),
            Err(PolicyError::InvalidHours { index: 0, .. })
        ));
        assert!(matches!(
            RefundRules::from_json(&json!({
                "slabs": [
                    { "hoursBefore": 0, "refundPercentage": 0, "label": "ok" },
                    { "hoursBefore": 5, "refundPercentage": 120, "label": "too much" }
                ]
            })),
            Err(PolicyError::InvalidPercentage { index: 1, .. })
        ));
        assert!(matches!(
            RefundRules::from_json(&json!({ "cancellation": "Full refund before 24h" })),
            Err(PolicyError::Malformed(_))
        ));
    }

    #[test]
    fn every_seed_operator_validates() {
        for operator in default_operators() {
            operator
                .rules
                .validate()
                .unwrap_or_else(|error| panic!("{} invalid: {error}", operator.name));
        }
        RefundRules::standard().validate().unwrap();
    }

    #[test]
    fn describes_slabs_highest_first() {
        let lines = describe_rules(&RefundRules::standard());
        assert!(lines[0].starts_with("More than 24 hours before departure: 95% refund"));
        assert!(lines.last().unwrap().contains("5%"));
    }
}
