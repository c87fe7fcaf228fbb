//! Service configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP query server.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where snapshots and raw downloads live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// NOMADS GRIB filter parameters.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// `grib2json` invocation.
    #[serde(default)]
    pub converter: ConverterConfig,

    /// Polling and harvest bounds.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Nearest-snapshot lookup.
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Browser origins allowed by CORS. `"*"` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Converted snapshots, one `<key>.json` per interval.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Staging area for raw GRIB downloads.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// GRIB filter CGI endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Grid resolution token used in the file name, e.g. `1p00`.
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// Level flags sent as `<level>=on`.
    #[serde(default = "default_levels")]
    pub levels: Vec<String>,

    /// Variable flags sent as `<var>=on`.
    #[serde(default = "default_variables")]
    pub variables: Vec<String>,

    #[serde(default)]
    pub bbox: BoundingBox,

    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Sub-region requested from the filter, in degrees (longitude 0..360).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left_lon: f64,
    pub right_lon: f64,
    pub top_lat: f64,
    pub bottom_lat: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Path to the `grib2json` launcher.
    #[serde(default = "default_converter_command")]
    pub command: PathBuf,

    #[serde(default = "default_converter_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds between scheduled harvests.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Hours between published model cycles.
    #[serde(default = "default_cadence_hours")]
    pub cadence_hours: u32,

    /// Harvests never look further back than this.
    #[serde(default = "default_horizon_days")]
    pub harvest_horizon_days: u32,

    /// `latest` gives up after walking back this far.
    #[serde(default = "default_horizon_days")]
    pub latest_lookback_days: u32,
}

/// Order in which the resolver visits candidate intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPolicy {
    /// Closest interval first, ties to the older one.
    #[default]
    Nearest,
    /// Older candidates only, newest first. The forward phase restarts at
    /// `target + limit`, which is already out of range.
    BackwardFirst,
}

impl FromStr for SearchPolicy {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(SearchPolicy::Nearest),
            "backward_first" | "backward-first" => Ok(SearchPolicy::BackwardFirst),
            other => Err(Error::Config(format!(
                "search policy must be one of: nearest, backward_first (got {other:?})"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub policy: SearchPolicy,

    /// Used when a query omits `searchLimit` or sends garbage.
    #[serde(default = "default_search_limit")]
    pub default_search_limit_days: u32,

    /// Larger requested limits are clamped to this.
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit_days: u32,
}

fn default_bind() -> String {
    "0.0.0.0:3708".into()
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:63342".into(),
        "http://localhost:3000".into(),
        "http://localhost:4000".into(),
        "http://localhost:3707".into(),
        "http://danwild.github.io".into(),
    ]
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("json-data")
}
fn default_raw_dir() -> PathBuf {
    PathBuf::from("grib-data")
}
fn default_base_url() -> String {
    "https://nomads.ncep.noaa.gov/cgi-bin/filter_gfs_1p00.pl".into()
}
fn default_resolution() -> String {
    "1p00".into()
}
fn default_levels() -> Vec<String> {
    vec!["lev_10_m_above_ground".into(), "lev_surface".into()]
}
fn default_variables() -> Vec<String> {
    vec!["var_TMP".into(), "var_UGRD".into(), "var_VGRD".into()]
}
fn default_upstream_timeout() -> u64 {
    120
}
fn default_user_agent() -> String {
    "wind-harvest/0.1 (gfs snapshot cache)".into()
}
fn default_converter_command() -> PathBuf {
    PathBuf::from("converter/bin/grib2json")
}
fn default_converter_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    900
}
fn default_cadence_hours() -> u32 {
    6
}
fn default_horizon_days() -> u32 {
    30
}
fn default_search_limit() -> u32 {
    1
}
fn default_max_search_limit() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raw_dir: default_raw_dir(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            resolution: default_resolution(),
            levels: default_levels(),
            variables: default_variables(),
            bbox: BoundingBox::default(),
            timeout_secs: default_upstream_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            left_lon: 0.0,
            right_lon: 360.0,
            top_lat: 90.0,
            bottom_lat: -90.0,
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            command: default_converter_command(),
            timeout_secs: default_converter_timeout(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cadence_hours: default_cadence_hours(),
            harvest_horizon_days: default_horizon_days(),
            latest_lookback_days: default_horizon_days(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            policy: SearchPolicy::default(),
            default_search_limit_days: default_search_limit(),
            max_search_limit_days: default_max_search_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [timing]
            poll_interval_secs = 60

            [resolver]
            policy = "backward_first"
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(cfg.timing.poll_interval_secs, 60);
        assert_eq!(cfg.timing.cadence_hours, 6);
        assert_eq!(cfg.timing.harvest_horizon_days, 30);
        assert_eq!(cfg.resolver.policy, SearchPolicy::BackwardFirst);
        assert_eq!(cfg.resolver.default_search_limit_days, 1);
        assert_eq!(cfg.server.bind, "0.0.0.0:3708");
        assert_eq!(cfg.upstream.variables.len(), 3);
    }

    #[test]
    fn test_search_policy_from_str() {
        assert_eq!("Nearest".parse::<SearchPolicy>().unwrap(), SearchPolicy::Nearest);
        assert_eq!(
            "backward-first".parse::<SearchPolicy>().unwrap(),
            SearchPolicy::BackwardFirst
        );
        assert!("sideways".parse::<SearchPolicy>().is_err());
    }
}
