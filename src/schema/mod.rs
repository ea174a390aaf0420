//! Canonical rankings schema.
//!
//! [`RANKINGS_SCHEMA`] is the one definition of field names, types and
//! nullability. The transform, the validator and all three encodings read it
//! from here; nothing keeps a hand-copied column list.
//!
//! Adding a nullable field is non-breaking. Changing a type or the nullability
//! of an existing field requires bumping [`SCHEMA_VERSION`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use chrono::NaiveDate;
use serde_json::{Map, Value, json};

/// Current schema version, stamped into every artifact.
pub const SCHEMA_VERSION: &str = "2.0.0";

/// Table name used by the embedded database encoding.
pub const TABLE_NAME: &str = "rankings";

/// Metadata key carrying the schema version in artifacts.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Columns a partitioned reader may add from directory names.
pub const PARTITION_COLUMNS: [&str; 3] = ["year", "month", "day"];

const EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(1970, 1, 1) {
    Some(date) => date,
    None => panic!("unix epoch is a valid date"),
};

/// Semantic column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    /// Calendar date, stored as days since the unix epoch.
    Date,
    /// Signed 64-bit integer.
    Int64,
    /// UTF-8 string.
    Utf8,
    /// IEEE 754 double.
    Float64,
}

impl SemanticType {
    /// Arrow physical type for this semantic type.
    #[must_use]
    pub fn arrow_type(self) -> DataType {
        match self {
            Self::Date => DataType::Date32,
            Self::Int64 => DataType::Int64,
            Self::Utf8 => DataType::Utf8,
            Self::Float64 => DataType::Float64,
        }
    }

    /// SQL column type used in DDL.
    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Date => "DATE",
            Self::Int64 => "BIGINT",
            Self::Utf8 => "VARCHAR",
            Self::Float64 => "DOUBLE",
        }
    }

    /// Inverse of [`sql_type`](Self::sql_type), case-insensitive.
    #[must_use]
    pub fn from_sql_type(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "DATE" => Some(Self::Date),
            "BIGINT" => Some(Self::Int64),
            "VARCHAR" => Some(Self::Utf8),
            "DOUBLE" => Some(Self::Float64),
            _ => None,
        }
    }

    fn json_type(self) -> &'static str {
        match self {
            Self::Date | Self::Utf8 => "string",
            Self::Int64 => "integer",
            Self::Float64 => "number",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_type())
    }
}

/// One column of the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub description: &'static str,
    /// Populated values must be `>= 0`.
    pub non_negative: bool,
    pub example: &'static str,
}

/// Ordered, versioned field list.
#[derive(Debug, PartialEq)]
pub struct SchemaDefinition {
    version: &'static str,
    fields: &'static [FieldSpec],
}

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "date",
        semantic_type: SemanticType::Date,
        nullable: false,
        description: "Collection date",
        non_negative: false,
        example: "2025-11-23",
    },
    FieldSpec {
        name: "rank",
        semantic_type: SemanticType::Int64,
        nullable: false,
        description: "Global market cap rank (1=highest)",
        non_negative: false,
        example: "1",
    },
    FieldSpec {
        name: "coin_id",
        semantic_type: SemanticType::Utf8,
        nullable: false,
        description: "Upstream coin identifier (unique per coin)",
        non_negative: false,
        example: "bitcoin",
    },
    FieldSpec {
        name: "symbol",
        semantic_type: SemanticType::Utf8,
        nullable: true,
        description: "Ticker symbol",
        non_negative: false,
        example: "btc",
    },
    FieldSpec {
        name: "name",
        semantic_type: SemanticType::Utf8,
        nullable: true,
        description: "Human-readable coin name",
        non_negative: false,
        example: "Bitcoin",
    },
    FieldSpec {
        name: "market_cap",
        semantic_type: SemanticType::Float64,
        nullable: true,
        description: "Total market capitalization in USD",
        non_negative: true,
        example: "1693396618542.0",
    },
    FieldSpec {
        name: "price",
        semantic_type: SemanticType::Float64,
        nullable: true,
        description: "Current price per coin in USD",
        non_negative: false,
        example: "84921.0",
    },
    FieldSpec {
        name: "volume_24h",
        semantic_type: SemanticType::Float64,
        nullable: true,
        description: "24-hour trading volume in USD",
        non_negative: false,
        example: "132655185022.0",
    },
    FieldSpec {
        name: "price_change_24h_pct",
        semantic_type: SemanticType::Float64,
        nullable: true,
        description: "24-hour price change percentage",
        non_negative: false,
        example: "-2.38937",
    },
];

/// The current rankings schema.
pub static RANKINGS_SCHEMA: SchemaDefinition = SchemaDefinition {
    version: SCHEMA_VERSION,
    fields: FIELDS,
};

static STRICT_ARROW: LazyLock<SchemaRef> = LazyLock::new(|| RANKINGS_SCHEMA.build_arrow(false));
static RELAXED_ARROW: LazyLock<SchemaRef> = LazyLock::new(|| RANKINGS_SCHEMA.build_arrow(true));

impl SchemaDefinition {
    #[must_use]
    pub fn version(&self) -> &'static str {
        self.version
    }

    #[must_use]
    pub fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Fields declared non-nullable, in schema order.
    pub fn required_fields(&self) -> impl Iterator<Item = &'static FieldSpec> + '_ {
        self.fields.iter().filter(|f| !f.nullable)
    }

    /// Arrow schema with the declared nullability and the version in metadata.
    #[must_use]
    pub fn arrow_schema(&self) -> SchemaRef {
        if std::ptr::eq(self, &RANKINGS_SCHEMA) {
            Arc::clone(&STRICT_ARROW)
        } else {
            self.build_arrow(false)
        }
    }

    /// Same names and types as [`arrow_schema`](Self::arrow_schema) with every
    /// field nullable, so rows violating a NOT NULL rule can still be held in
    /// a batch and reported by the validator.
    #[must_use]
    pub fn relaxed_arrow_schema(&self) -> SchemaRef {
        if std::ptr::eq(self, &RANKINGS_SCHEMA) {
            Arc::clone(&RELAXED_ARROW)
        } else {
            self.build_arrow(true)
        }
    }

    fn build_arrow(&self, all_nullable: bool) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .iter()
            .map(|f| {
                Field::new(f.name, f.semantic_type.arrow_type(), all_nullable || f.nullable)
                    .with_metadata(HashMap::from([(
                        "description".to_string(),
                        f.description.to_string(),
                    )]))
            })
            .collect();
        let metadata = HashMap::from([(SCHEMA_VERSION_KEY.to_string(), self.version.to_string())]);
        Arc::new(Schema::new_with_metadata(fields, metadata))
    }

    /// `CREATE TABLE` statement for the embedded database encoding.
    #[must_use]
    pub fn table_ddl(&self) -> String {
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let null_clause = if f.nullable { "" } else { " NOT NULL" };
                format!("    {} {}{null_clause}", f.name, f.semantic_type.sql_type())
            })
            .collect();
        format!("CREATE TABLE {TABLE_NAME} (\n{}\n)", columns.join(",\n"))
    }

    /// Secondary index statements (date, rank, coin_id).
    #[must_use]
    pub fn index_ddl(&self) -> Vec<String> {
        ["date", "rank", "coin_id"]
            .iter()
            .map(|col| format!("CREATE INDEX idx_{col} ON {TABLE_NAME}({col})"))
            .collect()
    }

    /// JSON-Schema (draft-07) document describing one row.
    #[must_use]
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for f in self.fields {
            let mut prop = Map::new();
            let json_type = f.semantic_type.json_type();
            prop.insert(
                "type".into(),
                if f.nullable {
                    json!([json_type, "null"])
                } else {
                    json!(json_type)
                },
            );
            if f.semantic_type == SemanticType::Date {
                prop.insert("format".into(), json!("date"));
            }
            if f.name == "rank" {
                prop.insert("minimum".into(), json!(1));
            } else if f.non_negative {
                prop.insert("minimum".into(), json!(0));
            }
            prop.insert("description".into(), json!(f.description));
            prop.insert("example".into(), json!(f.example));
            properties.insert(f.name.into(), Value::Object(prop));
        }

        let required: Vec<&str> = self.required_fields().map(|f| f.name).collect();
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Cryptocurrency Market Cap Rankings",
            "description": "Daily market capitalization rankings for all ranked coins",
            "version": self.version,
            "type": "object",
            "required": required,
            "properties": properties,
        })
    }
}

/// Days since the unix epoch, the Date32 representation.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn date_to_days(date: NaiveDate) -> i32 {
    (date - EPOCH).num_days() as i32
}

/// Inverse of [`date_to_days`].
#[must_use]
pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    EPOCH.checked_add_signed(chrono::Duration::days(i64::from(days)))
}
