//! Raw records to canonical Arrow table.
//!
//! Upstream fields arrive as strings, integers, floats or null for the same
//! logical column. Each value passes through a best-effort coercion that
//! yields `None` instead of failing; the validator decides afterwards
//! whether the resulting nulls are acceptable.

use std::sync::Arc;

use arrow::array::{ArrayRef, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use serde_json::Value;

use super::BuildError;
use crate::schema::{RANKINGS_SCHEMA, SemanticType, date_to_days};

/// Upstream key feeding each canonical column.
fn raw_key(column: &str) -> Option<&'static str> {
    match column {
        "rank" => Some("market_cap_rank"),
        "coin_id" => Some("id"),
        "symbol" => Some("symbol"),
        "name" => Some("name"),
        "market_cap" => Some("market_cap"),
        "price" => Some("current_price"),
        "volume_24h" => Some("total_volume"),
        "price_change_24h_pct" => Some("price_change_percentage_24h"),
        _ => None,
    }
}

fn raw_value<'a>(coin: &'a Value, column: &str) -> Option<&'a Value> {
    raw_key(column).and_then(|key| coin.get(key))
}

/// Integer via float: `"123.45"` becomes 123. Blank or unparsable values
/// yield `fallback`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn coerce_int(value: Option<&Value>, fallback: Option<i64>) -> Option<i64> {
    let parsed = match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|f| f.trunc() as i64),
        _ => None,
    };
    parsed.or(fallback)
}

/// Float from a number or numeric string. NaN and infinities become `None`.
#[must_use]
pub fn coerce_float(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// String from a string or number.
#[must_use]
pub fn coerce_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds the canonical table for `date` from raw records, in input order.
///
/// The result uses the relaxed (all-nullable) schema so rows with missing
/// required values survive long enough to be reported by the validator.
/// A missing or unparsable rank falls back to the 1-based position.
///
/// # Errors
///
/// [`BuildError::Arrow`] if the columns cannot be assembled.
pub fn to_canonical_batch(date: NaiveDate, coins: &[Value]) -> Result<RecordBatch, BuildError> {
    let days = date_to_days(date);
    let columns: Vec<ArrayRef> = RANKINGS_SCHEMA
        .fields()
        .iter()
        .map(|field| {
            let column: ArrayRef = match field.semantic_type {
                SemanticType::Date => Arc::new(Date32Array::from(vec![Some(days); coins.len()])),
                SemanticType::Int64 => Arc::new(Int64Array::from(
                    coins
                        .iter()
                        .enumerate()
                        .map(|(index, coin)| {
                            let fallback = (field.name == "rank")
                                .then(|| i64::try_from(index + 1).ok())
                                .flatten();
                            coerce_int(raw_value(coin, field.name), fallback)
                        })
                        .collect::<Vec<_>>(),
                )),
                SemanticType::Utf8 => Arc::new(StringArray::from(
                    coins
                        .iter()
                        .map(|c| coerce_string(raw_value(c, field.name)))
                        .collect::<Vec<_>>(),
                )),
                SemanticType::Float64 => Arc::new(Float64Array::from(
                    coins
                        .iter()
                        .map(|c| coerce_float(raw_value(c, field.name)))
                        .collect::<Vec<_>>(),
                )),
            };
            column
        })
        .collect();

    RecordBatch::try_new(RANKINGS_SCHEMA.relaxed_arrow_schema(), columns)
        .map_err(|e| BuildError::arrow("canonical table", e))
}

/// Re-labels a validated table with the strict schema (declared nullability).
///
/// # Errors
///
/// [`BuildError::Arrow`] if a required column still holds nulls or a column
/// type differs.
pub fn conform(table: &RecordBatch) -> Result<RecordBatch, BuildError> {
    RecordBatch::try_new(RANKINGS_SCHEMA.arrow_schema(), table.columns().to_vec())
        .map_err(|e| BuildError::arrow("strict schema", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arrow::array::Array;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_coerce_int_variants() {
        assert_eq!(coerce_int(Some(&json!(7)), None), Some(7));
        assert_eq!(coerce_int(Some(&json!(7.9)), None), Some(7));
        assert_eq!(coerce_int(Some(&json!("123.45")), None), Some(123));
        assert_eq!(coerce_int(Some(&json!(" 42 ")), None), Some(42));
        assert_eq!(coerce_int(Some(&json!("")), Some(3)), Some(3));
        assert_eq!(coerce_int(Some(&json!("n/a")), None), None);
        assert_eq!(coerce_int(Some(&Value::Null), Some(9)), Some(9));
        assert_eq!(coerce_int(None, Some(1)), Some(1));
    }

    #[test]
    fn test_coerce_float_variants() {
        assert_eq!(coerce_float(Some(&json!(1.5))), Some(1.5));
        assert_eq!(coerce_float(Some(&json!(2))), Some(2.0));
        assert_eq!(coerce_float(Some(&json!("3.25"))), Some(3.25));
        assert_eq!(coerce_float(Some(&json!("  "))), None);
        assert_eq!(coerce_float(Some(&json!("NaN"))), None);
        assert_eq!(coerce_float(Some(&json!(true))), None);
        assert_eq!(coerce_float(None), None);
    }

    #[test]
    fn test_coerce_string_variants() {
        assert_eq!(coerce_string(Some(&json!("btc"))), Some("btc".into()));
        assert_eq!(coerce_string(Some(&json!(12))), Some("12".into()));
        assert_eq!(coerce_string(Some(&json!(null))), None);
    }

    #[test]
    fn test_to_canonical_batch_maps_fields() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 23).unwrap();
        let coins = vec![
            json!({
                "id": "bitcoin", "symbol": "btc", "name": "Bitcoin",
                "market_cap_rank": 1, "market_cap": 1.7e12, "current_price": "84921",
                "total_volume": 1.3e11, "price_change_percentage_24h": -2.4
            }),
            json!({"id": "mystery", "market_cap_rank": null, "market_cap": "bad"}),
        ];

        let batch = to_canonical_batch(date, &coins).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), RANKINGS_SCHEMA.fields().len());

        let rank = batch.column_by_name("rank").unwrap().as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(rank.value(0), 1);
        assert_eq!(rank.value(1), 2, "missing rank falls back to position");

        let price = batch.column_by_name("price").unwrap().as_any().downcast_ref::<Float64Array>().unwrap();
        assert!((price.value(0) - 84921.0).abs() < f64::EPSILON);
        assert!(price.is_null(1));

        let cap = batch.column_by_name("market_cap").unwrap();
        assert!(cap.is_null(1));

        let dates = batch.column_by_name("date").unwrap().as_any().downcast_ref::<Date32Array>().unwrap();
        assert_eq!(dates.value(1), date_to_days(date));
    }

    #[test]
    fn test_conform_rejects_null_required() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 23).unwrap();
        let batch = to_canonical_batch(date, &[json!({"symbol": "x"})]).unwrap();

        assert!(matches!(conform(&batch), Err(BuildError::Arrow { .. })));

        let ok = to_canonical_batch(date, &[json!({"id": "x"})]).unwrap();
        let strict = conform(&ok).unwrap();
        assert!(!strict.schema().field_with_name("coin_id").unwrap().is_nullable());
    }
}
