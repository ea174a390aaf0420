//! Collection handlers: `collect` alone, or `run` (collect then build all).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use marketcap_core::{
    Builder, CheckpointManager, ClientConfig, CollectError, Collector, CollectorConfig,
    DatasetFormat, MarketsClient, RateLimitConfig, RateLimiter, RetryPolicy, Validator,
    ValidatorConfig,
};

use crate::app_config::Settings;
use crate::cli::CollectArgs;

pub async fn run_collect_command(settings: &Settings, args: &CollectArgs) -> Result<PathBuf> {
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        calls_per_minute: settings.calls_per_minute,
        calls_per_month: settings.calls_per_month,
        warn_threshold: settings.warn_threshold,
    }));
    let collector = build_collector(settings, !args.no_resume, Arc::clone(&limiter))?;

    let result = collector.collect(date).await;
    let usage = limiter.usage().await;
    info!(
        month_calls = usage.month_calls,
        month_remaining = usage.month_remaining(),
        "quota usage"
    );

    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(path)
        }
        Err(err) => {
            if let CollectError::Aborted { partial, .. } = &err {
                warn!(
                    records = partial.records.len(),
                    pages = partial.metrics.pages_fetched,
                    checkpoint = ?partial.checkpoint,
                    "collection incomplete; rerun the same date to resume"
                );
            }
            Err(err).with_context(|| format!("Collection for {date} failed"))
        }
    }
}

pub async fn run_pipeline_command(settings: &Settings, args: &CollectArgs) -> Result<()> {
    let raw = run_collect_command(settings, args).await?;
    let validator = Validator::new(ValidatorConfig {
        max_rank_factor: settings.max_rank_factor,
        ..ValidatorConfig::default()
    });

    for format in DatasetFormat::ALL {
        let artifact = Builder::new(format, &settings.processed_dir)
            .with_validator(validator.clone())
            .build(&raw)
            .await
            .with_context(|| format!("Failed to build {format} artifact from {}", raw.display()))?;
        println!("{}", artifact.display());
    }
    Ok(())
}

fn build_collector(settings: &Settings, resume: bool, limiter: Arc<RateLimiter>) -> Result<Collector> {
    let client = MarketsClient::new(ClientConfig {
        base_url: settings.base_url.clone(),
        api_key: settings.api_key.clone(),
        per_page: settings.per_page,
        timeout: settings.request_timeout,
    })
    .context("Failed to create markets client")?;
    if !client.has_api_key() {
        info!("no API key configured; using anonymous page delay");
    }

    let mut config = CollectorConfig::new(&settings.raw_dir, client.has_api_key());
    if let Some(delay) = settings.page_delay {
        config.page_delay = delay;
    }
    config.max_pages = settings.max_pages;
    config.rate_limit_cooldown = settings.rate_limit_cooldown;
    config.resume = resume;

    Ok(Collector::new(Box::new(client), limiter, config)
        .with_retry_policy(RetryPolicy::with_max_attempts(settings.max_retries))
        .with_checkpoints(CheckpointManager::new(&settings.checkpoint_dir))
        .with_interrupt(install_interrupt_handler()))
}

/// Sets the returned flag on Ctrl-C. The collector stops at the next page
/// boundary.
fn install_interrupt_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            handler_flag.store(true, Ordering::SeqCst);
        }
    });
    flag
}
