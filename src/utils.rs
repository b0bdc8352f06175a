use crate::error::PipelineError;
use crate::models::calculus::AssetDescriptor;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Load the asset descriptor list. Any well-formed JSON array of objects with an `id` works.
pub fn load_assets_from_json(path: &Path) -> Result<Vec<AssetDescriptor>, PipelineError> {
    let file = File::open(path)?;
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(file));
    serde_path_to_error::deserialize(&mut de).map_err(|e| {
        PipelineError::InvalidInput(format!("{} at `{}`: {}", path.display(), e.path(), e.inner()))
    })
}

/// Round to `decimals` places. Exact halves go to the even neighbour (banker's rounding),
/// so `round_to(20.125, 2)` is `20.12`.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Floor a timestamp onto a `step_secs` grid anchored at the epoch.
pub fn align_to_step(ts: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let aligned = ts.timestamp().div_euclid(step_secs) * step_secs;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(ts)
}
