//! Single-file embedded database encoding.
//!
//! Layout: one `rankings` table created from the schema DDL, secondary
//! indexes on date, rank and coin_id, and a `dataset_metadata` key/value
//! table holding the schema version and build timestamp. Dates are stored
//! as `YYYY-MM-DD` text.

use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::{ArtifactContents, BuildError, DatasetFormat, Encoding};
use crate::schema::{
    RANKINGS_SCHEMA, SCHEMA_VERSION_KEY, SemanticType, TABLE_NAME, date_to_days, days_to_date,
};

const METADATA_TABLE: &str = "dataset_metadata";
const BUILD_TIMESTAMP_KEY: &str = "build_timestamp";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEncoding;

async fn open(path: &Path, create: bool) -> Result<SqlitePool, BuildError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .read_only(!create)
        .journal_mode(SqliteJournalMode::Delete);

    // Single writer; the artifact is built in one transaction.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| BuildError::database(path, e))
}

/// One column's values as bindable SQL parameters.
enum Column<'a> {
    Date(&'a Date32Array),
    Int(&'a Int64Array),
    Text(&'a StringArray),
    Float(&'a Float64Array),
}

impl<'a> Column<'a> {
    fn bind(array: &'a ArrayRef, path: &Path, name: &str) -> Result<Self, BuildError> {
        let any = array.as_any();
        let column = if let Some(a) = any.downcast_ref::<Date32Array>() {
            Self::Date(a)
        } else if let Some(a) = any.downcast_ref::<Int64Array>() {
            Self::Int(a)
        } else if let Some(a) = any.downcast_ref::<StringArray>() {
            Self::Text(a)
        } else if let Some(a) = any.downcast_ref::<Float64Array>() {
            Self::Float(a)
        } else {
            return Err(BuildError::malformed(
                path,
                format!("column {name} has unsupported type {}", array.data_type()),
            ));
        };
        Ok(column)
    }
}

#[async_trait]
impl Encoding for SqliteEncoding {
    fn format(&self) -> DatasetFormat {
        DatasetFormat::Sqlite
    }

    #[instrument(skip(self, table), fields(path = %path.display(), rows = table.num_rows()))]
    async fn write(&self, table: &RecordBatch, path: &Path) -> Result<(), BuildError> {
        let db = |e: sqlx::Error| BuildError::database(path, e);
        let pool = open(path, true).await?;

        let names: Vec<&str> = RANKINGS_SCHEMA.field_names().collect();
        let mut columns = Vec::with_capacity(names.len());
        for name in &names {
            let array = table
                .column_by_name(name)
                .ok_or_else(|| BuildError::malformed(path, format!("table lacks column {name}")))?;
            columns.push(Column::bind(array, path, name)?);
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let insert = format!(
            "INSERT INTO {TABLE_NAME} ({}) VALUES ({placeholders})",
            names.join(", ")
        );

        let mut tx = pool.begin().await.map_err(db)?;
        sqlx::query(&RANKINGS_SCHEMA.table_ddl())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        for ddl in RANKINGS_SCHEMA.index_ddl() {
            sqlx::query(&ddl).execute(&mut *tx).await.map_err(db)?;
        }
        sqlx::query(&format!(
            "CREATE TABLE {METADATA_TABLE} (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
        ))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let metadata_insert = format!("INSERT INTO {METADATA_TABLE} (key, value) VALUES (?, ?)");
        for (key, value) in [
            (SCHEMA_VERSION_KEY, RANKINGS_SCHEMA.version().to_string()),
            (BUILD_TIMESTAMP_KEY, Utc::now().to_rfc3339()),
        ] {
            sqlx::query(&metadata_insert)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        for row in 0..table.num_rows() {
            let mut query = sqlx::query(&insert);
            for column in &columns {
                query = match column {
                    Column::Date(a) => query.bind(
                        (!a.is_null(row))
                            .then(|| days_to_date(a.value(row)))
                            .flatten()
                            .map(|d| d.format("%Y-%m-%d").to_string()),
                    ),
                    Column::Int(a) => query.bind((!a.is_null(row)).then(|| a.value(row))),
                    Column::Text(a) => {
                        query.bind((!a.is_null(row)).then(|| a.value(row).to_string()))
                    }
                    Column::Float(a) => query.bind((!a.is_null(row)).then(|| a.value(row))),
                };
            }
            query.execute(&mut *tx).await.map_err(db)?;
        }
        tx.commit().await.map_err(db)?;
        pool.close().await;

        debug!("database artifact written");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read(&self, path: &Path) -> Result<ArtifactContents, BuildError> {
        let db = |e: sqlx::Error| BuildError::database(path, e);
        if !path.is_file() {
            return Err(BuildError::malformed(path, "not a database file"));
        }
        let pool = open(path, false).await?;

        let declared: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, type FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(TABLE_NAME)
        .fetch_all(&pool)
        .await
        .map_err(db)?;
        if declared.is_empty() {
            pool.close().await;
            return Err(BuildError::malformed(path, format!("no {TABLE_NAME} table")));
        }

        let has_metadata: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(METADATA_TABLE)
        .fetch_one(&pool)
        .await
        .map_err(db)?;
        let schema_version: Option<String> = if has_metadata > 0 {
            sqlx::query_scalar(&format!("SELECT value FROM {METADATA_TABLE} WHERE key = ?"))
                .bind(SCHEMA_VERSION_KEY)
                .fetch_optional(&pool)
                .await
                .map_err(db)?
        } else {
            None
        };

        // Unknown declared types read as text; the validator reports them.
        let types: Vec<SemanticType> = declared
            .iter()
            .map(|(_, ty)| SemanticType::from_sql_type(ty).unwrap_or(SemanticType::Utf8))
            .collect();
        let select = format!(
            "SELECT {} FROM {TABLE_NAME} ORDER BY rowid",
            declared
                .iter()
                .map(|(name, _)| format!("\"{name}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&select).fetch_all(&pool).await.map_err(db)?;
        pool.close().await;

        let mut fields = Vec::with_capacity(declared.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(declared.len());
        for (idx, ((name, _), ty)) in declared.iter().zip(&types).enumerate() {
            let array: ArrayRef = match ty {
                SemanticType::Date => {
                    let mut days = Vec::with_capacity(rows.len());
                    for row in &rows {
                        let text: Option<String> = row.try_get_unchecked(idx).map_err(db)?;
                        days.push(match text {
                            Some(t) => Some(parse_date(&t).ok_or_else(|| {
                                BuildError::malformed(path, format!("invalid date {t:?} in {name}"))
                            })?),
                            None => None,
                        });
                    }
                    Arc::new(Date32Array::from(days))
                }
                SemanticType::Int64 => Arc::new(Int64Array::from(
                    rows.iter()
                        .map(|r| r.try_get_unchecked::<Option<i64>, _>(idx))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(db)?,
                )),
                SemanticType::Utf8 => Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| r.try_get_unchecked::<Option<String>, _>(idx))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(db)?,
                )),
                SemanticType::Float64 => Arc::new(Float64Array::from(
                    rows.iter()
                        .map(|r| r.try_get_unchecked::<Option<f64>, _>(idx))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(db)?,
                )),
            };
            fields.push(Field::new(name, ty.arrow_type(), true));
            arrays.push(array);
        }

        let table = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(|e| BuildError::arrow("database read-back", e))?;
        Ok(ArtifactContents {
            table,
            schema_version,
        })
    }
}

fn parse_date(text: &str) -> Option<i32> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(date_to_days)
}
