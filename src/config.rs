//! Runtime configuration, read once from the environment.
//! Defaults match the production Calculus deployment.

use chrono_tz::Tz;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::normalize::ShortWindowPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.calculus.group/v3";
pub const DEFAULT_API_KEY: &str = "***";
pub const DEFAULT_READINGS_ENDPOINT: &str = "readings";
pub const DEFAULT_TIMEOUT_SECS: u64 = 100;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Amsterdam;
pub const DEFAULT_LOOKBACK_STEPS: usize = 144;
pub const DEFAULT_FORECAST_STEPS: usize = 18;
pub const DEFAULT_HISTORY_HOURS: i64 = 26;
pub const DEFAULT_ASSETS_FILE: &str = "assets.json";

/// Connection settings for the telemetry API. Handed to the client at construction.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Sent as the `CalculusApiKey` header.
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    /// Endpoint segment queried for each asset's readings.
    pub readings_endpoint: String,
    /// Zone the feature index is localised to (drives the cyclical encodings).
    pub timezone: Tz,
    pub lookback_steps: usize,
    pub forecast_steps: usize,
    /// How much history to request ahead of "now".
    pub history_hours: i64,
    pub short_window_policy: ShortWindowPolicy,
    pub assets_file: PathBuf,
    /// Directory with `<asset id>.json` weight blobs. Missing blobs fall back to random weights.
    pub model_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = var("CALCULUS_API_KEY").unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        let base_url = var("CALCULUS_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let readings_endpoint = var("CALCULUS_READINGS_ENDPOINT")
            .map(|s| s.trim_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_READINGS_ENDPOINT.to_string());

        let timeout_secs = parse_positive(&var, "REQUEST_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let lookback_steps = parse_positive(&var, "LOOKBACK_STEPS", DEFAULT_LOOKBACK_STEPS as u64)? as usize;
        let forecast_steps = parse_positive(&var, "FORECAST_STEPS", DEFAULT_FORECAST_STEPS as u64)? as usize;
        let history_hours = parse_positive(&var, "HISTORY_HOURS", DEFAULT_HISTORY_HOURS as u64)? as i64;

        let timezone = match var("FORECAST_TIMEZONE") {
            Some(s) => s
                .parse::<Tz>()
                .map_err(|_| format!("FORECAST_TIMEZONE is not a known IANA zone: {}", s))?,
            None => DEFAULT_TIMEZONE,
        };

        let short_window_policy = match var("SHORT_WINDOW_POLICY") {
            Some(s) => ShortWindowPolicy::parse(&s)
                .ok_or_else(|| "SHORT_WINDOW_POLICY must be one of: reject, edge-pad, zero-pad".to_string())?,
            None => ShortWindowPolicy::default(),
        };

        let assets_file = var("ASSETS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSETS_FILE));
        let model_dir = var("MODEL_DIR").map(PathBuf::from);

        Ok(Config {
            api: ApiConfig {
                base_url,
                api_key,
                timeout: Duration::from_secs(timeout_secs),
            },
            readings_endpoint,
            timezone,
            lookback_steps,
            forecast_steps,
            history_hours,
            short_window_policy,
            assets_file,
            model_dir,
        })
    }

    /// Weight blob location for an asset, if a model directory is configured.
    pub fn model_path(&self, asset_id: &str) -> Option<PathBuf> {
        self.model_dir.as_ref().map(|dir| dir.join(format!("{}.json", asset_id)))
    }
}

fn parse_positive<F>(var: &F, name: &str, default: u64) -> Result<u64, String>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(s) => match s.parse::<u64>() {
            Ok(v) if v > 0 => Ok(v),
            _ => Err(format!("{} must be a positive integer", name)),
        },
        None => Ok(default),
    }
}
