//! Integration tests for the build pipeline across all three encodings.

use std::path::{Path, PathBuf};

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{Date32Type, Float64Type, Int64Type};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use marketcap_core::validate::ValidationRule;
use marketcap_core::{
    BuildError, Builder, DatasetFormat, RawSnapshot, SCHEMA_VERSION, SnapshotMetadata,
};

fn write_raw(dir: &Path, coins: Vec<Value>) -> PathBuf {
    let mut metadata = SnapshotMetadata::new(
        "2025-11-23",
        Utc.with_ymd_and_hms(2025, 11, 24, 0, 5, 0).unwrap(),
    );
    metadata.total_coins = coins.len();
    RawSnapshot { metadata, coins }.save(dir).unwrap()
}

fn coin(id: &str, rank: i64, market_cap: f64) -> Value {
    json!({
        "id": id,
        "symbol": id,
        "name": id.to_uppercase(),
        "market_cap_rank": rank,
        "market_cap": market_cap,
        "current_price": 10.0,
        "total_volume": 5.0,
        "price_change_percentage_24h": 1.0
    })
}

fn sample_coins() -> Vec<Value> {
    vec![
        coin("bitcoin", 1, 1.7e12),
        // String-typed numbers come back from the upstream API at times.
        json!({"id": "ethereum", "symbol": "eth", "name": "Ethereum",
               "market_cap_rank": "2", "market_cap": "3.4e11", "current_price": null}),
        json!({"id": "mystery", "market_cap_rank": null, "market_cap": null}),
        coin("tether", 4, 1.2e11),
    ]
}

type Tuple = (i32, i64, String, Option<f64>);

fn tuples(table: &RecordBatch) -> Vec<Tuple> {
    let dates = table.column_by_name("date").unwrap().as_primitive::<Date32Type>();
    let ranks = table.column_by_name("rank").unwrap().as_primitive::<Int64Type>();
    let ids = table.column_by_name("coin_id").unwrap().as_string::<i32>();
    let caps = table.column_by_name("market_cap").unwrap().as_primitive::<Float64Type>();
    (0..table.num_rows())
        .map(|i| {
            (
                dates.value(i),
                ranks.value(i),
                ids.value(i).to_string(),
                (!caps.is_null(i)).then(|| caps.value(i)),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_all_encodings_read_back_identical_rows() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(&dir.path().join("raw"), sample_coins());
    let out = dir.path().join("processed");

    let mut reads = Vec::new();
    for format in DatasetFormat::ALL {
        let artifact = Builder::new(format, &out).build(&raw).await.unwrap();
        let contents = format.encoding().read(&artifact).await.unwrap();
        assert_eq!(contents.schema_version.as_deref(), Some(SCHEMA_VERSION));
        reads.push(tuples(&contents.table));
    }

    assert_eq!(reads[0].len(), 4);
    assert_eq!(reads[0][1], (20415, 2, "ethereum".to_string(), Some(3.4e11)));
    assert_eq!(reads[0][2].1, 3, "missing rank falls back to position");
    assert_eq!(reads[0][2].3, None);
    assert_eq!(reads[0], reads[1], "sqlite vs parquet");
    assert_eq!(reads[0], reads[2], "sqlite vs csv");
}

#[tokio::test]
async fn test_validate_of_build_is_clean_for_every_format() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(&dir.path().join("raw"), sample_coins());
    let out = dir.path().join("processed");

    for format in DatasetFormat::ALL {
        let builder = Builder::new(format, &out);
        let artifact = builder.build(&raw).await.unwrap();
        assert_eq!(DatasetFormat::from_path(&artifact), Some(format));
        let errors = builder.validate(&artifact).await.unwrap();
        assert!(errors.is_empty(), "{format}: {errors:?}");
    }
}

#[tokio::test]
async fn test_negative_market_cap_fails_then_fixed_build_succeeds() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("processed");
    let bad = write_raw(
        &dir.path().join("bad"),
        vec![coin("a", 1, 100.0), coin("b", 2, 50.0), coin("c", 3, -5.0)],
    );

    for format in DatasetFormat::ALL {
        let err = Builder::new(format, &out).build(&bad).await.unwrap_err();
        let failure = err.validation_failure().expect("validation failure");
        assert!(failure.has_rule(ValidationRule::ValueSanity));
        let message = err.to_string();
        assert!(message.contains("negative"), "{message}");
        assert!(message.contains("c=-5"), "{message}");
    }
    // Failed builds publish nothing and leave no staging directories behind.
    assert_eq!(std::fs::read_dir(&out).map_or(0, |entries| entries.count()), 0);

    let good = write_raw(
        &dir.path().join("good"),
        vec![coin("a", 1, 100.0), coin("b", 2, 50.0), coin("c", 3, 5.0)],
    );
    for format in DatasetFormat::ALL {
        let builder = Builder::new(format, &out);
        let artifact = builder.build(&good).await.unwrap();
        assert!(builder.validate(&artifact).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_artifact_names_use_date_and_avoid_collisions() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(&dir.path().join("raw"), sample_coins());
    let out = dir.path().join("processed");
    let builder = Builder::new(DatasetFormat::Csv, &out);

    let first = builder.build(&raw).await.unwrap();
    let name = first.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("crypto_rankings_2025-11-23_"), "{name}");
    assert!(name.ends_with(".csv.gz"), "{name}");

    // Same-second rebuilds get a numeric suffix instead of overwriting.
    let mut paths = vec![first];
    for _ in 0..2 {
        paths.push(builder.build(&raw).await.unwrap());
    }
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|p| p.exists()));
}

#[tokio::test]
async fn test_duplicate_ids_in_raw_snapshot_fail_validation() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(
        &dir.path().join("raw"),
        vec![coin("a", 1, 1.0), coin("a", 2, 1.0)],
    );

    let err = Builder::new(DatasetFormat::Sqlite, dir.path().join("out"))
        .build(&raw)
        .await
        .unwrap_err();

    assert!(
        err.validation_failure()
            .is_some_and(|f| f.has_rule(ValidationRule::DuplicateKeys))
    );
}

#[tokio::test]
async fn test_empty_snapshot_is_rejected() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(&dir.path().join("raw"), Vec::new());

    let err = Builder::new(DatasetFormat::Parquet, dir.path().join("out"))
        .build(&raw)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::EmptySnapshot { .. }));
}

#[tokio::test]
async fn test_builds_from_snapshot_with_string_timestamp_and_null_duration() {
    let dir = TempDir::new().unwrap();
    let raw = dir.path().join("coingecko_rankings_2025-11-23_20251123_120000.json");
    let body = json!({
        "metadata": {
            "collection_date": "2025-11-23",
            "collection_timestamp": "20251123_120000",
            "total_coins": 2,
            "api_calls": 1,
            "duration_seconds": null
        },
        "coins": [coin("bitcoin", 1, 1.7e12), coin("ethereum", 2, 3.4e11)]
    });
    std::fs::write(&raw, serde_json::to_vec(&body).unwrap()).unwrap();

    let snapshot = RawSnapshot::load(&raw).unwrap();
    assert_eq!(snapshot.metadata.collection_timestamp, "20251123_120000");
    assert_eq!(snapshot.metadata.duration_seconds, None);

    let out = dir.path().join("processed");
    for format in DatasetFormat::ALL {
        let builder = Builder::new(format, &out);
        let artifact = builder.build(&raw).await.unwrap();
        assert!(builder.validate(&artifact).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_negative_price_and_volume_build_cleanly() {
    let dir = TempDir::new().unwrap();
    let mut odd = coin("b", 2, 50.0);
    odd["current_price"] = json!(-1.0);
    odd["total_volume"] = json!(-3.0);
    let raw = write_raw(&dir.path().join("raw"), vec![coin("a", 1, 100.0), odd]);

    let artifact = Builder::new(DatasetFormat::Sqlite, dir.path().join("out"))
        .build(&raw)
        .await
        .unwrap();
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_successful_build_leaves_only_the_artifact() {
    let dir = TempDir::new().unwrap();
    let raw = write_raw(&dir.path().join("raw"), sample_coins());
    let out = dir.path().join("processed");

    for format in DatasetFormat::ALL {
        let before = std::fs::read_dir(&out).map_or(0, |entries| entries.count());
        let artifact = Builder::new(format, &out).build(&raw).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), before + 1, "{names:?}");
        assert!(names.iter().all(|n| !n.starts_with(".staging-")), "{names:?}");
        assert!(marketcap_core::fsutil::disk_usage(&artifact).unwrap() > 0);
    }
}
