//! Map a [`FeatureTable`] onto a `[lookback_steps, input_dim]` tensor in `[0, 1]`.

use log::{debug, warn};
use ndarray::{Array2, ArrayView2, s};

use crate::error::PipelineError;
use crate::services::features::{FeatureTable, is_pir_column, is_temperature_column, is_time_column};

/// Operating range 10..45 °C maps onto 0..1.
pub const TEMP_OFFSET: f64 = 10.0;
pub const TEMP_SCALE: f64 = 35.0;

pub fn normalize_temperature(celsius: f64) -> f64 {
    (celsius - TEMP_OFFSET) / TEMP_SCALE
}

pub fn denormalize_temperature(normalized: f64) -> f64 {
    normalized * TEMP_SCALE + TEMP_OFFSET
}

/// What to do when the table holds fewer rows than the lookback window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ShortWindowPolicy {
    /// Fail with `InsufficientData`.
    #[default]
    Reject,
    /// Repeat the oldest row in front of the window.
    EdgePad,
    /// Prepend rows of zeros.
    ZeroPad,
}

impl ShortWindowPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Some(ShortWindowPolicy::Reject),
            "edge-pad" | "edge_pad" | "edge" => Some(ShortWindowPolicy::EdgePad),
            "zero-pad" | "zero_pad" | "zero" => Some(ShortWindowPolicy::ZeroPad),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedTensor {
    data: Array2<f32>,
    columns: Vec<String>,
    target_rooms: Vec<String>,
    padded_rows: usize,
}

impl NormalizedTensor {
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array2<f32> {
        self.data
    }

    pub fn lookback_steps(&self) -> usize {
        self.data.nrows()
    }

    /// Number of feature columns; the network's expected input width.
    pub fn input_dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Forecast targets carried over unchanged from the feature table.
    pub fn target_rooms(&self) -> &[String] {
        &self.target_rooms
    }

    /// Rows prepended by the short-window policy.
    pub fn padded_rows(&self) -> usize {
        self.padded_rows
    }
}

fn normalize_value(column: &str, value: f64) -> f64 {
    let mut v = value;
    if is_temperature_column(column) {
        v = normalize_temperature(v);
    }
    if is_pir_column(column) {
        v = v.clamp(0.0, 1.0);
    }
    if is_time_column(column) {
        v = (v + 1.0) / 2.0;
    }
    // the [0, 1] contract holds whatever the constants above are
    v.clamp(0.0, 1.0)
}

pub fn normalize(
    table: &FeatureTable,
    lookback_steps: usize,
    policy: ShortWindowPolicy,
) -> Result<NormalizedTensor, PipelineError> {
    if lookback_steps == 0 {
        return Err(PipelineError::InvalidInput("lookback_steps must be positive".into()));
    }
    let rows = table.len();
    let width = table.width();
    let mut full = Array2::<f32>::zeros((rows, width));
    for (j, column) in table.columns().iter().enumerate() {
        for (i, value) in column.values.iter().enumerate() {
            full[[i, j]] = normalize_value(&column.name, *value) as f32;
        }
    }

    let (data, padded_rows) = if rows >= lookback_steps {
        (full.slice(s![rows - lookback_steps.., ..]).to_owned(), 0)
    } else {
        let missing = lookback_steps - rows;
        match policy {
            ShortWindowPolicy::Reject => {
                return Err(PipelineError::InsufficientData(format!(
                    "{} row(s) available, lookback window needs {}",
                    rows, lookback_steps
                )));
            }
            ShortWindowPolicy::ZeroPad | ShortWindowPolicy::EdgePad if rows == 0 => {
                return Err(PipelineError::InsufficientData("feature table has no rows".into()));
            }
            ShortWindowPolicy::ZeroPad => {
                let mut padded = Array2::<f32>::zeros((lookback_steps, width));
                padded.slice_mut(s![missing.., ..]).assign(&full);
                (padded, missing)
            }
            ShortWindowPolicy::EdgePad => {
                let mut padded = Array2::<f32>::zeros((lookback_steps, width));
                let oldest = full.row(0);
                for mut row in padded.rows_mut().into_iter().take(missing) {
                    row.assign(&oldest);
                }
                padded.slice_mut(s![missing.., ..]).assign(&full);
                (padded, missing)
            }
        }
    };
    if padded_rows > 0 {
        warn!(
            "Normalize: padded {} of {} row(s) ({:?})",
            padded_rows, lookback_steps, policy
        );
    }
    debug!("Normalize: tensor shape [{}, {}]", data.nrows(), data.ncols());

    Ok(NormalizedTensor {
        data,
        columns: table.column_names().into_iter().map(str::to_string).collect(),
        target_rooms: table.target_rooms().to_vec(),
        padded_rows,
    })
}
