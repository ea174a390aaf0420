//! Structural and value checks for canonical rankings tables.
//!
//! [`Validator::validate`] runs five independent checks over an Arrow
//! [`RecordBatch`] and returns every violation it finds. It never stops at
//! the first failure; callers decide what to do with the list, or use
//! [`Validator::validate_and_raise`] to fail fast with one aggregated error.
//!
//! A check whose column is missing or has the wrong type is skipped; the
//! schema conformance check already reports that column.

mod error;

use std::collections::HashMap;

use arrow::array::{Array, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use tracing::{debug, info, instrument};

use crate::schema::{PARTITION_COLUMNS, RANKINGS_SCHEMA, SchemaDefinition, days_to_date};

pub use error::{RowSample, ValidationError, ValidationFailure, ValidationRule, ValueSample};

/// Default multiple of the row count the maximum rank may reach.
pub const DEFAULT_MAX_RANK_FACTOR: f64 = 2.0;

/// Default number of sample rows attached to a violation.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// Tunable validator thresholds.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// `max(rank)` may not exceed `row_count * max_rank_factor`.
    pub max_rank_factor: f64,
    /// Columns tolerated beyond the schema (partition-derived).
    pub allowed_extra_columns: Vec<String>,
    /// Sample rows per violation.
    pub sample_size: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_rank_factor: DEFAULT_MAX_RANK_FACTOR,
            allowed_extra_columns: PARTITION_COLUMNS.iter().map(ToString::to_string).collect(),
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

/// Validator bound to one schema definition.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: &'static SchemaDefinition,
    config: ValidatorConfig,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl Validator {
    /// Validator against the current [`RANKINGS_SCHEMA`].
    #[must_use]
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            schema: &RANKINGS_SCHEMA,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Runs all five checks and returns every violation (empty when valid).
    #[must_use]
    #[instrument(skip_all, fields(rows = table.num_rows()))]
    pub fn validate(&self, table: &RecordBatch) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let columns = Columns::bind(table);

        self.check_schema(table, &mut errors);
        self.check_duplicates(&columns, &mut errors);
        self.check_required_nulls(table, &columns, &mut errors);
        self.check_rank_range(table, &columns, &mut errors);
        self.check_values(table, &columns, &mut errors);

        debug!(violations = errors.len(), "validation pass complete");
        errors
    }

    /// Like [`validate`](Self::validate) but returns all violations as one error.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationFailure`] when at least one check fails.
    pub fn validate_and_raise(&self, table: &RecordBatch) -> Result<(), ValidationFailure> {
        let errors = self.validate(table);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure { errors })
        }
    }

    fn check_schema(&self, table: &RecordBatch, errors: &mut Vec<ValidationError>) {
        let actual = table.schema();

        let missing: Vec<String> = self
            .schema
            .field_names()
            .filter(|name| actual.field_with_name(name).is_err())
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            errors.push(ValidationError::MissingColumns { columns: missing });
        }

        let extra: Vec<String> = actual
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|name| self.schema.field(name).is_none())
            .filter(|name| !self.config.allowed_extra_columns.contains(name))
            .collect();
        if !extra.is_empty() {
            errors.push(ValidationError::ExtraColumns { columns: extra });
        }

        for def in self.schema.fields() {
            if let Ok(field) = actual.field_with_name(def.name) {
                let expected = def.semantic_type.arrow_type();
                if field.data_type() != &expected {
                    errors.push(ValidationError::TypeMismatch {
                        column: def.name.to_string(),
                        expected: expected.to_string(),
                        actual: field.data_type().to_string(),
                    });
                }
            }
        }
    }

    fn check_duplicates(&self, columns: &Columns<'_>, errors: &mut Vec<ValidationError>) {
        let (Some(dates), Some(ids)) = (columns.date, columns.coin_id) else {
            return;
        };

        // Rows with a null key part are reported by the null check instead.
        let mut seen: HashMap<(i32, &str), usize> = HashMap::new();
        for row in 0..ids.len() {
            if dates.is_valid(row) && ids.is_valid(row) {
                *seen.entry((dates.value(row), ids.value(row))).or_default() += 1;
            }
        }

        let duplicated: Vec<usize> = (0..ids.len())
            .filter(|&row| {
                dates.is_valid(row)
                    && ids.is_valid(row)
                    && seen
                        .get(&(dates.value(row), ids.value(row)))
                        .is_some_and(|&n| n > 1)
            })
            .collect();

        if !duplicated.is_empty() {
            errors.push(ValidationError::DuplicateKeys {
                count: duplicated.len(),
                sample: duplicated
                    .iter()
                    .take(self.config.sample_size)
                    .map(|&row| columns.sample(row))
                    .collect(),
            });
        }
    }

    fn check_required_nulls(
        &self,
        table: &RecordBatch,
        columns: &Columns<'_>,
        errors: &mut Vec<ValidationError>,
    ) {
        for def in self.schema.required_fields() {
            let Some(column) = table.column_by_name(def.name) else {
                continue;
            };
            let null_count = column.null_count();
            if null_count == 0 {
                continue;
            }
            let sample = (0..column.len())
                .filter(|&row| column.is_null(row))
                .take(self.config.sample_size)
                .map(|row| columns.sample(row))
                .collect();
            errors.push(ValidationError::RequiredNull {
                field: def.name.to_string(),
                count: null_count,
                sample,
            });
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn check_rank_range(
        &self,
        table: &RecordBatch,
        columns: &Columns<'_>,
        errors: &mut Vec<ValidationError>,
    ) {
        let Some(ranks) = columns.rank else {
            return;
        };
        let values: Vec<i64> = ranks.iter().flatten().collect();
        let (Some(&min_rank), Some(&max_rank)) = (values.iter().min(), values.iter().max()) else {
            return;
        };

        if min_rank < 1 {
            errors.push(ValidationError::RankBelowMinimum { min_rank });
        }

        let row_count = table.num_rows();
        let bound = row_count as f64 * self.config.max_rank_factor;
        if max_rank as f64 > bound {
            errors.push(ValidationError::RankAboveBound {
                max_rank,
                row_count,
                bound,
            });
        }

        // Ties share a rank upstream; they are expected, not corruption.
        let mut distinct = values.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != values.len() {
            info!(
                tied_rows = values.len() - distinct.len(),
                "duplicate rank values present (ties)"
            );
        }
    }

    fn check_values(
        &self,
        table: &RecordBatch,
        columns: &Columns<'_>,
        errors: &mut Vec<ValidationError>,
    ) {
        for def in self.schema.fields().iter().filter(|f| f.non_negative) {
            let Some(values) = table
                .column_by_name(def.name)
                .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            else {
                continue;
            };

            let negative: Vec<usize> = (0..values.len())
                .filter(|&row| values.is_valid(row) && values.value(row) < 0.0)
                .collect();
            if negative.is_empty() {
                continue;
            }

            errors.push(ValidationError::NegativeValues {
                field: def.name.to_string(),
                count: negative.len(),
                sample: negative
                    .iter()
                    .take(self.config.sample_size)
                    .map(|&row| ValueSample {
                        coin_id: columns.coin_id_at(row),
                        value: values.value(row),
                    })
                    .collect(),
            });
        }
    }
}

/// Typed views of the key columns, `None` when missing or mistyped.
struct Columns<'a> {
    date: Option<&'a Date32Array>,
    rank: Option<&'a Int64Array>,
    coin_id: Option<&'a StringArray>,
}

impl<'a> Columns<'a> {
    fn bind(table: &'a RecordBatch) -> Self {
        Self {
            date: table
                .column_by_name("date")
                .and_then(|c| c.as_any().downcast_ref::<Date32Array>()),
            rank: table
                .column_by_name("rank")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>()),
            coin_id: table
                .column_by_name("coin_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>()),
        }
    }

    fn coin_id_at(&self, row: usize) -> Option<String> {
        self.coin_id
            .filter(|ids| ids.is_valid(row))
            .map(|ids| ids.value(row).to_string())
    }

    fn sample(&self, row: usize) -> RowSample {
        RowSample {
            date: self
                .date
                .filter(|d| d.is_valid(row))
                .and_then(|d| days_to_date(d.value(row)))
                .map(|d| d.to_string()),
            coin_id: self.coin_id_at(row),
            rank: self.rank.filter(|r| r.is_valid(row)).map(|r| r.value(row)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use arrow::array::ArrayRef;
    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;

    const DAY: i32 = 20415;

    struct Rows {
        dates: Vec<Option<i32>>,
        ranks: Vec<Option<i64>>,
        ids: Vec<Option<&'static str>>,
        caps: Vec<Option<f64>>,
        price: f64,
        volume: f64,
    }

    impl Rows {
        fn clean() -> Self {
            Self {
                dates: vec![Some(DAY); 3],
                ranks: vec![Some(1), Some(2), Some(3)],
                ids: vec![Some("a"), Some("b"), Some("c")],
                caps: vec![Some(300.0), Some(200.0), None],
                price: 1.0,
                volume: 10.0,
            }
        }

        fn batch(&self) -> RecordBatch {
            let n = self.ids.len();
            let columns: Vec<ArrayRef> = vec![
                Arc::new(Date32Array::from(self.dates.clone())),
                Arc::new(Int64Array::from(self.ranks.clone())),
                Arc::new(StringArray::from(self.ids.clone())),
                Arc::new(StringArray::from(vec![Some("sym"); n])),
                Arc::new(StringArray::from(vec![Some("Name"); n])),
                Arc::new(Float64Array::from(self.caps.clone())),
                Arc::new(Float64Array::from(vec![Some(self.price); n])),
                Arc::new(Float64Array::from(vec![Some(self.volume); n])),
                Arc::new(Float64Array::from(vec![Some(-2.5); n])),
            ];
            RecordBatch::try_new(RANKINGS_SCHEMA.relaxed_arrow_schema(), columns).unwrap()
        }
    }

    fn rules(errors: &[ValidationError]) -> Vec<ValidationRule> {
        errors.iter().map(ValidationError::rule).collect()
    }

    #[test]
    fn test_clean_table_has_no_errors() {
        let errors = Validator::default().validate(&Rows::clean().batch());
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_negative_price_change_is_allowed() {
        // price_change_24h_pct is -2.5 in every fixture row
        let errors = Validator::default().validate(&Rows::clean().batch());
        assert!(!rules(&errors).contains(&ValidationRule::ValueSanity));
    }

    #[test]
    fn test_negative_price_and_volume_are_allowed() {
        let mut rows = Rows::clean();
        rows.price = -1.0;
        rows.volume = -3.0;

        let errors = Validator::default().validate(&rows.batch());
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_schema_violation_only_flags_schema() {
        let base = Rows::clean().batch();
        let mut fields: Vec<Field> = base.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new("extra", DataType::Utf8, true));
        let mut columns = base.columns().to_vec();
        columns.push(Arc::new(StringArray::from(vec!["x"; 3])));
        let table = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap();

        let errors = Validator::default().validate(&table);
        assert_eq!(rules(&errors), [ValidationRule::SchemaConformance]);
        assert!(matches!(&errors[0], ValidationError::ExtraColumns { columns } if columns == &["extra"]));
    }

    #[test]
    fn test_partition_columns_are_allowed() {
        let base = Rows::clean().batch();
        let mut fields: Vec<Field> = base.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = base.columns().to_vec();
        for name in PARTITION_COLUMNS {
            fields.push(Field::new(name, DataType::Int32, false));
            columns.push(Arc::new(arrow::array::Int32Array::from(vec![1; 3])));
        }
        let table = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap();

        assert!(Validator::default().validate(&table).is_empty());
    }

    #[test]
    fn test_type_mismatch_and_missing_column() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("date", DataType::Utf8, true),
            Field::new("coin_id", DataType::Utf8, true),
        ]));
        let table = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["2025-01-01"])),
                Arc::new(StringArray::from(vec!["a"])),
            ],
        )
        .unwrap();

        let errors = Validator::default().validate(&table);
        assert!(errors.iter().all(|e| e.rule() == ValidationRule::SchemaConformance));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::MissingColumns { columns } if columns.contains(&"rank".to_string()))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::TypeMismatch { column, .. } if column == "date")));
    }

    #[test]
    fn test_duplicate_key_only_flags_duplicates() {
        let mut rows = Rows::clean();
        rows.ids = vec![Some("a"), Some("a"), Some("c")];

        let errors = Validator::default().validate(&rows.batch());
        assert_eq!(rules(&errors), [ValidationRule::DuplicateKeys]);
        let ValidationError::DuplicateKeys { count, sample } = &errors[0] else {
            panic!("expected duplicate error");
        };
        assert_eq!(*count, 2);
        assert_eq!(sample[0].coin_id.as_deref(), Some("a"));
        assert_eq!(sample[0].date.as_deref(), Some("2025-11-23"));
    }

    #[test]
    fn test_same_id_on_different_dates_is_not_duplicate() {
        let mut rows = Rows::clean();
        rows.ids = vec![Some("a"), Some("a"), Some("c")];
        rows.dates = vec![Some(DAY), Some(DAY + 1), Some(DAY)];

        assert!(Validator::default().validate(&rows.batch()).is_empty());
    }

    #[test]
    fn test_required_null_only_flags_nulls() {
        let mut rows = Rows::clean();
        rows.ids = vec![Some("a"), None, Some("c")];

        let errors = Validator::default().validate(&rows.batch());
        assert_eq!(rules(&errors), [ValidationRule::RequiredNulls]);
        let ValidationError::RequiredNull { field, count, sample } = &errors[0] else {
            panic!("expected null error");
        };
        assert_eq!(field, "coin_id");
        assert_eq!(*count, 1);
        assert_eq!(sample[0].rank, Some(2));
    }

    #[test]
    fn test_null_rank_reported_per_field() {
        let mut rows = Rows::clean();
        rows.ranks = vec![Some(1), None, None];
        rows.dates = vec![None, Some(DAY), Some(DAY)];

        let errors = Validator::default().validate(&rows.batch());
        let fields: Vec<_> = errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::RequiredNull { field, count, .. } => Some((field.as_str(), *count)),
                _ => None,
            })
            .collect();
        assert_eq!(fields, [("date", 1), ("rank", 2)]);
    }

    #[test]
    fn test_rank_below_one_only_flags_rank_range() {
        let mut rows = Rows::clean();
        rows.ranks = vec![Some(0), Some(1), Some(2)];

        let errors = Validator::default().validate(&rows.batch());
        assert_eq!(rules(&errors), [ValidationRule::RankRange]);
        assert!(matches!(errors[0], ValidationError::RankBelowMinimum { min_rank: 0 }));
    }

    #[test]
    fn test_rank_above_bound_uses_configured_factor() {
        let mut rows = Rows::clean();
        rows.ranks = vec![Some(1), Some(2), Some(7)];

        let errors = Validator::default().validate(&rows.batch());
        assert!(matches!(errors[..], [ValidationError::RankAboveBound { max_rank: 7, row_count: 3, .. }]));

        let relaxed = Validator::new(ValidatorConfig {
            max_rank_factor: 3.0,
            ..ValidatorConfig::default()
        });
        assert!(relaxed.validate(&rows.batch()).is_empty());
    }

    #[test]
    fn test_tied_ranks_are_valid() {
        let mut rows = Rows::clean();
        rows.ranks = vec![Some(1), Some(2), Some(2)];

        assert!(Validator::default().validate(&rows.batch()).is_empty());
    }

    #[test]
    fn test_negative_market_cap_only_flags_value_sanity() {
        let mut rows = Rows::clean();
        rows.caps = vec![Some(300.0), Some(200.0), Some(-5.0)];

        let errors = Validator::default().validate(&rows.batch());
        assert_eq!(rules(&errors), [ValidationRule::ValueSanity]);
        let ValidationError::NegativeValues { field, count, sample } = &errors[0] else {
            panic!("expected value error");
        };
        assert_eq!(field, "market_cap");
        assert_eq!(*count, 1);
        assert_eq!(sample[0].coin_id.as_deref(), Some("c"));
    }

    #[test]
    fn test_all_checks_run_after_earlier_failures() {
        let mut rows = Rows::clean();
        rows.ids = vec![Some("a"), Some("a"), None];
        rows.ranks = vec![Some(0), Some(1), Some(2)];
        rows.caps = vec![Some(-1.0), None, None];

        let errors = Validator::default().validate(&rows.batch());
        let found = rules(&errors);
        assert!(found.contains(&ValidationRule::DuplicateKeys));
        assert!(found.contains(&ValidationRule::RequiredNulls));
        assert!(found.contains(&ValidationRule::RankRange));
        assert!(found.contains(&ValidationRule::ValueSanity));
    }

    #[test]
    fn test_validate_and_raise_aggregates() {
        let mut rows = Rows::clean();
        rows.ranks = vec![Some(0), Some(1), Some(2)];
        rows.caps = vec![Some(-1.0), None, None];

        let failure = Validator::default()
            .validate_and_raise(&rows.batch())
            .unwrap_err();
        assert_eq!(failure.errors.len(), 2);
        assert!(Validator::default().validate_and_raise(&Rows::clean().batch()).is_ok());
    }

    #[test]
    fn test_sample_is_capped() {
        let mut rows = Rows::clean();
        rows.ids = vec![None, None, None];
        let validator = Validator::new(ValidatorConfig {
            sample_size: 2,
            ..ValidatorConfig::default()
        });

        let errors = validator.validate(&rows.batch());
        let ValidationError::RequiredNull { count, sample, .. } = &errors[0] else {
            panic!("expected null error");
        };
        assert_eq!(*count, 3);
        assert_eq!(sample.len(), 2);
    }
}
