//! Typed validation violations.

use std::fmt;

use thiserror::Error;

/// The five independent validator checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationRule {
    /// Field names and types match the canonical schema.
    SchemaConformance,
    /// No two rows share `(date, coin_id)`.
    DuplicateKeys,
    /// Required fields are never null.
    RequiredNulls,
    /// Ranks are `>= 1` and not implausibly large.
    RankRange,
    /// Populated non-negative metrics are `>= 0`.
    ValueSanity,
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SchemaConformance => "schema_conformance",
            Self::DuplicateKeys => "duplicate_keys",
            Self::RequiredNulls => "required_nulls",
            Self::RankRange => "rank_range",
            Self::ValueSanity => "value_sanity",
        };
        write!(f, "{label}")
    }
}

/// Identifying columns of an offending row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSample {
    pub date: Option<String>,
    pub coin_id: Option<String>,
    pub rank: Option<i64>,
}

impl fmt::Display for RowSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(date={}, coin_id={}, rank={})",
            self.date.as_deref().unwrap_or("null"),
            self.coin_id.as_deref().unwrap_or("null"),
            self.rank.map_or_else(|| "null".to_string(), |r| r.to_string()),
        )
    }
}

/// A negative metric value and the row it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSample {
    pub coin_id: Option<String>,
    pub value: f64,
}

impl fmt::Display for ValueSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}",
            self.coin_id.as_deref().unwrap_or("null"),
            self.value
        )
    }
}

/// One violation found by the validator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing columns: {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },

    #[error("unexpected columns: {}", .columns.join(", "))]
    ExtraColumns { columns: Vec<String> },

    #[error("column '{column}' type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("found {count} rows sharing a (date, coin_id) pair; sample: {}", join(.sample))]
    DuplicateKeys { count: usize, sample: Vec<RowSample> },

    #[error("found {count} null values in required field '{field}'; sample: {}", join(.sample))]
    RequiredNull {
        field: String,
        count: usize,
        sample: Vec<RowSample>,
    },

    #[error("rank minimum is {min_rank}, expected >= 1")]
    RankBelowMinimum { min_rank: i64 },

    #[error("rank maximum {max_rank} too high for {row_count} rows (bound {bound})")]
    RankAboveBound {
        max_rank: i64,
        row_count: usize,
        bound: f64,
    },

    #[error("found {count} negative {field} value(s); sample: {}", join(.sample))]
    NegativeValues {
        field: String,
        count: usize,
        sample: Vec<ValueSample>,
    },
}

impl ValidationError {
    /// The check that produced this violation.
    #[must_use]
    pub fn rule(&self) -> ValidationRule {
        match self {
            Self::MissingColumns { .. } | Self::ExtraColumns { .. } | Self::TypeMismatch { .. } => {
                ValidationRule::SchemaConformance
            }
            Self::DuplicateKeys { .. } => ValidationRule::DuplicateKeys,
            Self::RequiredNull { .. } => ValidationRule::RequiredNulls,
            Self::RankBelowMinimum { .. } | Self::RankAboveBound { .. } => {
                ValidationRule::RankRange
            }
            Self::NegativeValues { .. } => ValidationRule::ValueSanity,
        }
    }
}

/// All violations of one validation pass, raised as a single error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("validation failed with {} error(s):\n{}", .errors.len(), bullet_list(.errors))]
pub struct ValidationFailure {
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    /// Whether any violation came from `rule`.
    #[must_use]
    pub fn has_rule(&self, rule: ValidationRule) -> bool {
        self.errors.iter().any(|e| e.rule() == rule)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn bullet_list(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - [{}] {e}", e.rule()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_values_message_names_coin() {
        let err = ValidationError::NegativeValues {
            field: "market_cap".into(),
            count: 1,
            sample: vec![ValueSample {
                coin_id: Some("c".into()),
                value: -5.0,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("negative market_cap"), "{msg}");
        assert!(msg.contains("c=-5"), "{msg}");
        assert_eq!(err.rule(), ValidationRule::ValueSanity);
    }

    #[test]
    fn test_failure_lists_every_error() {
        let failure = ValidationFailure {
            errors: vec![
                ValidationError::RankBelowMinimum { min_rank: 0 },
                ValidationError::MissingColumns {
                    columns: vec!["rank".into()],
                },
            ],
        };
        let msg = failure.to_string();
        assert!(msg.starts_with("validation failed with 2 error(s)"));
        assert!(msg.contains("[rank_range] rank minimum is 0"));
        assert!(msg.contains("[schema_conformance] missing columns: rank"));
        assert!(failure.has_rule(ValidationRule::RankRange));
        assert!(!failure.has_rule(ValidationRule::DuplicateKeys));
    }

    #[test]
    fn test_row_sample_display_with_nulls() {
        let sample = RowSample {
            date: Some("2025-01-01".into()),
            coin_id: None,
            rank: Some(3),
        };
        assert_eq!(
            sample.to_string(),
            "(date=2025-01-01, coin_id=null, rank=3)"
        );
    }
}
