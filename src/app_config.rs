//! File configuration and effective settings for the CLI.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use marketcap_core::{
    DEFAULT_BASE_URL, DEFAULT_CALLS_PER_MINUTE, DEFAULT_CALLS_PER_MONTH, DEFAULT_CHECKPOINT_DIR,
    DEFAULT_MAX_PAGES, DEFAULT_MAX_RANK_FACTOR, DEFAULT_MAX_RETRIES, DEFAULT_PER_PAGE,
    DEFAULT_PROCESSED_DIR, DEFAULT_RAW_DIR, DEFAULT_WARN_THRESHOLD, RATE_LIMIT_COOLDOWN,
    REQUEST_TIMEOUT_SECS,
};

use crate::cli::Overrides;

/// Environment variable consulted for the API key.
pub const API_KEY_ENV: &str = "COINGECKO_API_KEY";

const APP_DIR: &str = "marketcap-rank";

/// TOML-backed configuration. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Records per page (1..=250).
    pub per_page: Option<u32>,
    pub max_pages: Option<u32>,
    /// Overrides the key-dependent inter-page delay.
    pub page_delay_secs: Option<u64>,
    /// Attempts per page including the first (1..=10).
    pub max_retries: Option<u32>,
    pub rate_limit_cooldown_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub calls_per_minute: Option<u32>,
    pub calls_per_month: Option<u32>,
    /// Fraction of the monthly quota that triggers a warning (0.0..=1.0).
    pub warn_threshold: Option<f64>,
    pub raw_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub max_rank_factor: Option<f64>,
}

impl FileConfig {
    /// Validates values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("per_page", self.per_page, 1, 250)?;
        validate_range("max_pages", self.max_pages, 1, 10_000)?;
        validate_range("max_retries", self.max_retries, 1, 10)?;
        validate_range("page_delay_secs", self.page_delay_secs, 0, 600)?;
        validate_range("rate_limit_cooldown_secs", self.rate_limit_cooldown_secs, 1, 3600)?;
        validate_range("request_timeout_secs", self.request_timeout_secs, 1, 3600)?;
        validate_range("calls_per_minute", self.calls_per_minute, 1, 10_000)?;
        validate_range("calls_per_month", self.calls_per_month, 1, u32::MAX)?;

        if let Some(threshold) = self.warn_threshold
            && !(0.0..=1.0).contains(&threshold)
        {
            bail!("Invalid config value for `warn_threshold`: {threshold}. Expected range: 0.0..=1.0");
        }
        if let Some(factor) = self.max_rank_factor
            && !(factor.is_finite() && factor >= 1.0)
        {
            bail!("Invalid config value for `max_rank_factor`: {factor}. Expected a number >= 1.0");
        }
        if let Some(url) = &self.base_url
            && url::Url::parse(url).is_err()
        {
            bail!("Invalid config value for `base_url`: {url:?} is not a URL");
        }
        Ok(())
    }
}

fn validate_range<T>(field: &str, value: Option<T>, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    let Some(value) = value else {
        return Ok(());
    };
    if value < min || value > max {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// Path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Parsed config when the file existed and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/marketcap-rank/config.toml`
/// 2. `$HOME/.config/marketcap-rank/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

fn env_var_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Loads `explicit` (which must exist) or the default path (which may not).
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(p) if p.exists() => Some(load_file_config(p)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Effective settings after applying CLI, environment, file and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub per_page: u32,
    pub max_pages: u32,
    /// `None` selects the default for the access tier.
    pub page_delay: Option<Duration>,
    pub max_retries: u32,
    pub rate_limit_cooldown: Duration,
    pub request_timeout: Duration,
    pub calls_per_minute: u32,
    pub calls_per_month: u32,
    pub warn_threshold: f64,
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub max_rank_factor: f64,
}

impl Settings {
    /// Precedence: CLI flag > environment > file > default.
    #[must_use]
    pub fn resolve(overrides: &Overrides, env_api_key: Option<String>, file: Option<&FileConfig>) -> Self {
        let file = file.cloned().unwrap_or_default();
        Self {
            api_key: overrides
                .api_key
                .clone()
                .or(env_api_key)
                .or(file.api_key)
                .filter(|k| !k.trim().is_empty()),
            base_url: file.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            per_page: file.per_page.unwrap_or(DEFAULT_PER_PAGE),
            max_pages: overrides
                .max_pages
                .or(file.max_pages)
                .unwrap_or(DEFAULT_MAX_PAGES),
            page_delay: file.page_delay_secs.map(Duration::from_secs),
            max_retries: file.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            rate_limit_cooldown: file
                .rate_limit_cooldown_secs
                .map_or(RATE_LIMIT_COOLDOWN, Duration::from_secs),
            request_timeout: Duration::from_secs(
                file.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS),
            ),
            calls_per_minute: file.calls_per_minute.unwrap_or(DEFAULT_CALLS_PER_MINUTE),
            calls_per_month: file.calls_per_month.unwrap_or(DEFAULT_CALLS_PER_MONTH),
            warn_threshold: file.warn_threshold.unwrap_or(DEFAULT_WARN_THRESHOLD),
            raw_dir: overrides
                .raw_dir
                .clone()
                .or(file.raw_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RAW_DIR)),
            processed_dir: overrides
                .processed_dir
                .clone()
                .or(file.processed_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROCESSED_DIR)),
            checkpoint_dir: overrides
                .checkpoint_dir
                .clone()
                .or(file.checkpoint_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_DIR)),
            max_rank_factor: file.max_rank_factor.unwrap_or(DEFAULT_MAX_RANK_FACTOR),
        }
    }

    /// Reads the API key from the environment.
    #[must_use]
    pub fn env_api_key() -> Option<String> {
        env_var_non_empty(API_KEY_ENV)
    }
}
