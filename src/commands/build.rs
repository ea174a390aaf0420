//! Build and validate handlers.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use marketcap_core::{Builder, DatasetFormat, Validator, ValidatorConfig};

use crate::app_config::Settings;

fn builder(settings: &Settings, format: DatasetFormat) -> Builder {
    Builder::new(format, &settings.processed_dir).with_validator(Validator::new(ValidatorConfig {
        max_rank_factor: settings.max_rank_factor,
        ..ValidatorConfig::default()
    }))
}

pub async fn run_build_command(settings: &Settings, raw: &Path, format: DatasetFormat) -> Result<()> {
    let artifact = builder(settings, format)
        .build(raw)
        .await
        .with_context(|| format!("Failed to build {format} artifact from {}", raw.display()))?;
    println!("{}", artifact.display());
    Ok(())
}

pub async fn run_validate_command(
    settings: &Settings,
    artifact: &Path,
    format: Option<DatasetFormat>,
) -> Result<()> {
    let format = format
        .or_else(|| DatasetFormat::from_path(artifact))
        .ok_or_else(|| {
            anyhow!(
                "Cannot infer format of '{}'; pass --format",
                artifact.display()
            )
        })?;

    let errors = builder(settings, format)
        .validate(artifact)
        .await
        .with_context(|| format!("Failed to read '{}'", artifact.display()))?;
    if errors.is_empty() {
        info!(artifact = %artifact.display(), %format, "artifact is valid");
        println!("ok");
        return Ok(());
    }

    for error in &errors {
        println!("[{}] {error}", error.rule());
    }
    Err(anyhow!(
        "'{}' has {} validation error(s)",
        artifact.display(),
        errors.len()
    ))
}
