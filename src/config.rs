//! Configuration loader: merges env vars, .env file, and config.toml.

use std::path::{Path, PathBuf};

use common::config::{AppConfig, SearchPolicy};
use common::{Cadence, Error};

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::Config(format!("{env_name} must be an integer > 0"))),
    }
}

fn parse_positive_u32(raw: &str, env_name: &str) -> Result<u32, Error> {
    match raw.trim().parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::Config(format!("{env_name} must be an integer > 0"))),
    }
}

pub fn validate_config(config: &AppConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.server.bind.trim().is_empty() {
        issues.push("server.bind must not be empty".into());
    }
    if config.storage.data_dir.as_os_str().is_empty() {
        issues.push("storage.data_dir must not be empty".into());
    }
    if config.storage.raw_dir.as_os_str().is_empty() {
        issues.push("storage.raw_dir must not be empty".into());
    }
    if config.storage.raw_dir == config.storage.data_dir {
        issues.push("storage.raw_dir must differ from storage.data_dir".into());
    }

    if config.upstream.base_url.trim().is_empty() {
        issues.push("upstream.base_url must not be empty".into());
    }
    if config.upstream.timeout_secs == 0 {
        issues.push("upstream.timeout_secs must be > 0".into());
    }
    let bbox = &config.upstream.bbox;
    if bbox.left_lon >= bbox.right_lon {
        issues.push("upstream.bbox.left_lon must be < right_lon".into());
    }
    if bbox.bottom_lat >= bbox.top_lat {
        issues.push("upstream.bbox.bottom_lat must be < top_lat".into());
    }

    if config.converter.command.as_os_str().is_empty() {
        issues.push("converter.command must not be empty".into());
    }
    if config.converter.timeout_secs == 0 {
        issues.push("converter.timeout_secs must be > 0".into());
    }

    if config.timing.poll_interval_secs == 0 {
        issues.push("timing.poll_interval_secs must be > 0".into());
    }
    if let Err(e) = Cadence::from_hours(config.timing.cadence_hours) {
        issues.push(format!("timing.cadence_hours: {e}"));
    }
    if config.timing.harvest_horizon_days == 0 {
        issues.push("timing.harvest_horizon_days must be > 0".into());
    }
    if config.timing.latest_lookback_days == 0 {
        issues.push("timing.latest_lookback_days must be > 0".into());
    }

    if config.resolver.default_search_limit_days == 0 {
        issues.push("resolver.default_search_limit_days must be > 0".into());
    }
    if config.resolver.max_search_limit_days < config.resolver.default_search_limit_days {
        issues.push(
            "resolver.max_search_limit_days must be >= resolver.default_search_limit_days".into(),
        );
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Apply environment overrides on top of file/default values.
fn apply_env(config: &mut AppConfig, var: impl Fn(&str) -> Option<String>) -> Result<(), Error> {
    if let Some(port) = var("PORT") {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Config("PORT must be a valid port number".into()))?;
        let host = config
            .server
            .bind
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".into());
        config.server.bind = format!("{host}:{port}");
    }
    if let Some(bind) = var("WIND_BIND") {
        config.server.bind = bind.trim().to_string();
    }
    if let Some(origins) = var("WIND_CORS_ORIGINS") {
        config.server.cors_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(dir) = var("WIND_DATA_DIR") {
        config.storage.data_dir = PathBuf::from(dir.trim());
    }
    if let Some(dir) = var("WIND_RAW_DIR") {
        config.storage.raw_dir = PathBuf::from(dir.trim());
    }
    if let Some(command) = var("WIND_CONVERTER") {
        config.converter.command = PathBuf::from(command.trim());
    }
    if let Some(raw) = var("WIND_POLL_INTERVAL_SECS") {
        config.timing.poll_interval_secs = parse_positive_u64(&raw, "WIND_POLL_INTERVAL_SECS")?;
    }
    if let Some(raw) = var("WIND_HARVEST_HORIZON_DAYS") {
        config.timing.harvest_horizon_days =
            parse_positive_u32(&raw, "WIND_HARVEST_HORIZON_DAYS")?;
    }
    if let Some(raw) = var("WIND_SEARCH_POLICY") {
        config.resolver.policy = raw.parse::<SearchPolicy>()?;
    }
    Ok(())
}

/// Load configuration from environment and optional config file.
pub fn load_config(path: &Path) -> Result<AppConfig, Error> {
    // 1. Load .env file from the working directory or its parents.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Defaults, overlaid by the config file if present.
    let mut config = read_config_file(path)?;

    // 3. Environment variables win.
    apply_env(&mut config, |name| std::env::var(name).ok())?;

    validate_config(&config)?;

    Ok(config)
}

/// Defaults overlaid with `path`; a missing file means all defaults.
fn read_config_file(path: &Path) -> Result<AppConfig, Error> {
    if !path.exists() {
        tracing::debug!("{} not found, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}
