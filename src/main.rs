pub mod models {
    pub mod calculus;
}

pub mod client;
pub mod config;
pub mod error;
pub mod utils;
pub mod services {
    pub mod extract;
    pub mod features;
    pub mod forecaster;
    pub mod normalize;
    pub mod synthetic;
}

use crate::client::{CalculusClient, parse_query_time};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::calculus::{AssetDescriptor, AssetId};
use crate::services::forecaster::{ForecastResult, Forecaster, ForecasterSpec, ModelState};
use crate::services::synthetic::{SyntheticOptions, generate_payload};
use crate::services::{extract, features, normalize};
use crate::utils::load_assets_from_json;
use chrono::{Duration, Utc};
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct CliOptions {
    env_file: Option<PathBuf>,
    dry_run: bool,
    synthetic: bool,
    /// Persist freshly initialised weights to the model directory.
    save_weights: bool,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug)]
struct AssetReport {
    asset: AssetId,
    model: ModelState,
    outcome: String,
}

/// One asset end to end: extract, build, normalize, init model, predict.
fn forecast_asset(
    cfg: &Config,
    asset_id: &AssetId,
    payload: &Value,
    rng: &mut SmallRng,
    save_weights: bool,
    model: &mut ModelState,
) -> Result<ForecastResult, PipelineError> {
    let readings = extract::extract(payload, asset_id)?;
    let table = features::build_feature_table(&readings, cfg.timezone)?;
    info!(
        "Asset {}: {} bin(s), {} feature(s), rooms={:?}",
        asset_id,
        table.len(),
        table.width(),
        table.target_rooms()
    );
    let tensor = normalize::normalize(&table, cfg.lookback_steps, cfg.short_window_policy)?;
    let spec = ForecasterSpec::for_tensor(&tensor, cfg.forecast_steps)?;
    let model_path = cfg.model_path(&asset_id.0);
    let forecaster = Forecaster::load_or_random(spec, model_path.as_deref(), rng)?;
    *model = forecaster.state();
    if save_weights && !forecaster.weights_loaded() {
        if let Some(path) = model_path.as_deref() {
            forecaster.save_weights(path)?;
            info!("Asset {}: saved initial weights to {}", asset_id, path.display());
        }
    }
    forecaster.predict_tensor(&tensor)
}

fn run(cli: &CliOptions) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (base_url={}, endpoint={}, timezone={}, lookback={}, forecast_steps={}, history={}h, short_window={:?}, model_dir={})",
        cfg.api.base_url,
        cfg.readings_endpoint,
        cfg.timezone,
        cfg.lookback_steps,
        cfg.forecast_steps,
        cfg.history_hours,
        cfg.short_window_policy,
        cfg.model_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
    );

    // 2) Assets
    let assets: Vec<AssetDescriptor> = if cli.synthetic {
        vec![AssetDescriptor {
            id: AssetId("synthetic".into()),
            name: Some("Synthetic building".into()),
            extra: BTreeMap::new(),
        }]
    } else {
        load_assets_from_json(&cfg.assets_file)
            .map_err(|e| format!("loading {} failed: {}", cfg.assets_file.display(), e))?
    };
    if assets.is_empty() {
        return Err(format!("no assets listed in {}", cfg.assets_file.display()));
    }
    info!("Loaded {} asset(s)", assets.len());

    // 3) Query window
    let client = CalculusClient::new(cfg.api.clone());
    let (start, end) = match (&cli.start, &cli.end) {
        (Some(s), Some(e)) => {
            let start = parse_query_time(s).map_err(|e| format!("--start: {}", e))?;
            let end = parse_query_time(e).map_err(|e| format!("--end: {}", e))?;
            (start.with_timezone(&cfg.timezone), end.with_timezone(&cfg.timezone))
        }
        (None, None) => {
            let end = Utc::now().with_timezone(&cfg.timezone);
            (end - Duration::hours(cfg.history_hours), end)
        }
        _ => return Err("`--start` and `--end` must be given together".to_string()),
    };
    if start >= end {
        return Err(format!("query window is empty: {} .. {}", start, end));
    }

    let mut rng = SmallRng::from_os_rng();
    let mut forecasts: BTreeMap<String, ForecastResult> = BTreeMap::new();
    let mut reports = Vec::with_capacity(assets.len());

    // 4) Per-asset pipeline
    for asset in &assets {
        let label = asset.name.as_deref().unwrap_or("-");
        if cli.dry_run {
            let url = client.dry_run(&cfg.readings_endpoint, Some(&asset.id), Some(&start), Some(&end));
            info!("Dry run: asset {} ({}) -> GET {}", asset.id, label, url);
            continue;
        }

        let payload = if cli.synthetic {
            generate_payload(&SyntheticOptions::default(), &mut rng)
        } else {
            match client.query(&cfg.readings_endpoint, Some(&asset.id), Some(&start), Some(&end)) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Asset {} ({}): fetch failed, skipping: {}", asset.id, label, e);
                    reports.push(AssetReport {
                        asset: asset.id.clone(),
                        model: ModelState::Uninitialized,
                        outcome: format!("skipped ({})", e),
                    });
                    continue;
                }
            }
        };

        let mut model = ModelState::default();
        match forecast_asset(&cfg, &asset.id, &payload, &mut rng, cli.save_weights, &mut model) {
            Ok(result) => {
                reports.push(AssetReport {
                    asset: asset.id.clone(),
                    model,
                    outcome: format!("forecast for {} room(s)", result.rooms.len()),
                });
                forecasts.insert(asset.id.0.clone(), result);
            }
            Err(e) => {
                error!("Asset {} ({}): pipeline failed: {}", asset.id, label, e);
                reports.push(AssetReport {
                    asset: asset.id.clone(),
                    model,
                    outcome: format!("failed ({})", e),
                });
            }
        }
    }

    if cli.dry_run {
        return Ok(());
    }

    for report in &reports {
        info!("Asset {}: model={:?}, {}", report.asset, report.model, report.outcome);
    }

    // 5) Emit
    let json = serde_json::to_string_pretty(&forecasts).map_err(|e| format!("serializing forecasts failed: {}", e))?;
    println!("{}", json);

    if forecasts.is_empty() {
        return Err("no asset produced a forecast".to_string());
    }
    Ok(())
}

fn parse_cli() -> Result<CliOptions, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut cli = CliOptions::default();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                set_env_file(&mut cli, PathBuf::from(value))?;
            }
            Some(s) if s.starts_with("--env-file=") => {
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                set_env_file(&mut cli, PathBuf::from(path_str))?;
            }
            Some(flag @ ("--start" | "--end")) => {
                let value = args
                    .next()
                    .and_then(|v| v.into_string().ok())
                    .ok_or_else(|| format!("`{}` requires a datetime argument", flag))?;
                if flag == "--start" {
                    cli.start = Some(value);
                } else {
                    cli.end = Some(value);
                }
            }
            Some("--dry-run") => cli.dry_run = true,
            Some("--synthetic") => cli.synthetic = true,
            Some("--save-weights") => cli.save_weights = true,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    Ok(cli)
}

fn set_env_file(cli: &mut CliOptions, path: PathBuf) -> Result<(), String> {
    if cli.env_file.is_some() {
        return Err("`--env-file` provided more than once".to_string());
    }
    cli.env_file = Some(path);
    Ok(())
}

/// Load the explicit env file, or `./.env` when present. Returns the file used.
fn load_environment(cli: &CliOptions) -> Result<Option<PathBuf>, String> {
    let path = match &cli.env_file {
        Some(p) if !p.is_file() => return Err(format!("env file not found: {}", p.display())),
        Some(p) => p.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            default_path
        }
    };
    load_env_file(&path)?;
    Ok(Some(path))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) =
            parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // Values already present in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `KEY=value`, `export KEY=value`, optionally quoted; `#` starts a comment outside quotes.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid environment variable name: {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let rest = &raw[1..];
            let close = rest
                .find(quote)
                .ok_or_else(|| format!("unterminated {} quote", quote))?;
            let tail = rest[close + 1..].trim();
            if !(tail.is_empty() || tail.starts_with('#')) {
                return Err("unexpected characters after closing quote".to_string());
            }
            rest[..close].to_string()
        }
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

fn main() {
    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match load_environment(&cli) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = loaded_env.as_ref() {
        info!("Environment loaded from {}", path.display());
    }

    info!(
        "room-forecast {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&cli) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
