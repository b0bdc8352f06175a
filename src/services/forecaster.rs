//! Feedforward multi-room temperature forecaster (inference only).
//!
//! Architecture: flatten `[lookback_steps, input_dim]`, then
//! `lookback_steps * input_dim -> 1024 -> 512 -> rooms * forecast_steps`
//! with ReLU after both hidden layers. The 0.2 dropout after the first hidden layer only
//! exists in training; it is recorded in the weight blob and is the identity here.

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView3, ArrayViewD, Axis, Ix3};
use rand::Rng;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::path::Path;

use crate::error::PipelineError;
use crate::services::features::BIN_MINUTES;
use crate::services::normalize::{NormalizedTensor, denormalize_temperature};
use crate::utils::round_to;

pub const HIDDEN_SIZES: [usize; 2] = [1024, 512];
pub const DROPOUT_RATE: f64 = 0.2;

/// Shape contract shared by the tensor, the network and the decoder.
///
/// `target_rooms` is fixed here once and never recomputed: its order defines how the
/// flat output is split into rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecasterSpec {
    pub lookback_steps: usize,
    pub input_dim: usize,
    pub forecast_steps: usize,
    pub target_rooms: Vec<String>,
}

impl ForecasterSpec {
    pub fn new(
        lookback_steps: usize,
        input_dim: usize,
        forecast_steps: usize,
        target_rooms: Vec<String>,
    ) -> Result<Self, PipelineError> {
        if lookback_steps == 0 || input_dim == 0 || forecast_steps == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "forecaster dimensions must be positive (lookback={}, input_dim={}, forecast_steps={})",
                lookback_steps, input_dim, forecast_steps
            )));
        }
        if target_rooms.is_empty() {
            return Err(PipelineError::InsufficientData("no target rooms to forecast".into()));
        }
        Ok(ForecasterSpec {
            lookback_steps,
            input_dim,
            forecast_steps,
            target_rooms,
        })
    }

    /// Take the window shape and target rooms from a normalized tensor.
    pub fn for_tensor(tensor: &NormalizedTensor, forecast_steps: usize) -> Result<Self, PipelineError> {
        Self::new(
            tensor.lookback_steps(),
            tensor.input_dim(),
            forecast_steps,
            tensor.target_rooms().to_vec(),
        )
    }

    pub fn flat_input_dim(&self) -> usize {
        self.lookback_steps * self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.target_rooms.len() * self.forecast_steps
    }

    /// `(inputs, outputs)` of each dense layer, in order.
    fn layer_shapes(&self) -> [(usize, usize); 3] {
        [
            (self.flat_input_dim(), HIDDEN_SIZES[0]),
            (HIDDEN_SIZES[0], HIDDEN_SIZES[1]),
            (HIDDEN_SIZES[1], self.output_dim()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `[outputs, inputs]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseLayer {
    /// Uniform in `±1/sqrt(inputs)` for both weights and bias.
    fn random<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs as f32).sqrt();
        DenseLayer {
            weight: Array2::from_shape_simple_fn((outputs, inputs), || rng.random_range(-bound..bound)),
            bias: Array1::from_shape_simple_fn(outputs, || rng.random_range(-bound..bound)),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weight.t());
        out += &self.bias;
        out
    }
}

/// Serialized parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsBlob {
    pub architecture: ForecasterSpec,
    pub hidden_sizes: Vec<usize>,
    pub dropout: f64,
    pub layers: Vec<DenseLayer>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ModelState {
    /// No parameters yet.
    #[default]
    Uninitialized,
    RandomInit,
    WeightsLoaded,
}

pub struct Forecaster {
    spec: ForecasterSpec,
    layers: Vec<DenseLayer>,
    state: ModelState,
}

impl Forecaster {
    pub fn random<R: Rng>(spec: ForecasterSpec, rng: &mut R) -> Self {
        let layers = spec
            .layer_shapes()
            .iter()
            .map(|&(inputs, outputs)| DenseLayer::random(inputs, outputs, &mut *rng))
            .collect();
        Forecaster {
            spec,
            layers,
            state: ModelState::RandomInit,
        }
    }

    /// Validate a blob against `spec` and adopt its parameters.
    pub fn from_blob(spec: ForecasterSpec, blob: WeightsBlob) -> Result<Self, PipelineError> {
        let arch = &blob.architecture;
        for (what, expected, actual) in [
            ("lookback steps", spec.lookback_steps, arch.lookback_steps),
            ("input width", spec.input_dim, arch.input_dim),
            ("forecast steps", spec.forecast_steps, arch.forecast_steps),
            ("target rooms", spec.target_rooms.len(), arch.target_rooms.len()),
        ] {
            if expected != actual {
                return Err(PipelineError::mismatch(what, expected, actual));
            }
        }
        if arch.target_rooms != spec.target_rooms {
            return Err(PipelineError::Weights(format!(
                "weights were trained for rooms {:?}, table has {:?}",
                arch.target_rooms, spec.target_rooms
            )));
        }
        if blob.hidden_sizes != HIDDEN_SIZES {
            return Err(PipelineError::Weights(format!(
                "unsupported hidden sizes {:?}",
                blob.hidden_sizes
            )));
        }
        let shapes = spec.layer_shapes();
        if blob.layers.len() != shapes.len() {
            return Err(PipelineError::mismatch("layer count", shapes.len(), blob.layers.len()));
        }
        for (i, (layer, &(inputs, outputs))) in blob.layers.iter().zip(shapes.iter()).enumerate() {
            if layer.weight.dim() != (outputs, inputs) {
                return Err(PipelineError::mismatch(
                    format!("layer {} weight size", i),
                    outputs * inputs,
                    layer.weight.len(),
                ));
            }
            if layer.bias.len() != outputs {
                return Err(PipelineError::mismatch(format!("layer {} bias", i), outputs, layer.bias.len()));
            }
        }
        Ok(Forecaster {
            spec,
            layers: blob.layers,
            state: ModelState::WeightsLoaded,
        })
    }

    /// Load weights when `path` points at an existing file, otherwise initialise randomly.
    /// An existing but unreadable or mismatching blob is an error.
    pub fn load_or_random<R: Rng>(
        spec: ForecasterSpec,
        path: Option<&Path>,
        rng: &mut R,
    ) -> Result<Self, PipelineError> {
        let rooms = spec.target_rooms.len();
        match path.filter(|p| p.is_file()) {
            Some(p) => {
                let bytes = std::fs::read(p)?;
                let blob: WeightsBlob = serde_json::from_slice(&bytes)
                    .map_err(|e| PipelineError::Weights(format!("{}: {}", p.display(), e)))?;
                let model = Self::from_blob(spec, blob)?;
                info!("Weights loaded for {} room(s) from {}", rooms, p.display());
                Ok(model)
            }
            None => {
                if let Some(p) = path {
                    debug!("No weights at {}", p.display());
                }
                warn!("Random weights initialized for {} room(s)", rooms);
                Ok(Self::random(spec, rng))
            }
        }
    }

    pub fn save_weights(&self, path: &Path) -> Result<(), PipelineError> {
        let blob = WeightsBlob {
            architecture: self.spec.clone(),
            hidden_sizes: HIDDEN_SIZES.to_vec(),
            dropout: DROPOUT_RATE,
            layers: self.layers.clone(),
        };
        let json = serde_json::to_vec(&blob).map_err(|e| PipelineError::Weights(e.to_string()))?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn spec(&self) -> &ForecasterSpec {
        &self.spec
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn weights_loaded(&self) -> bool {
        self.state == ModelState::WeightsLoaded
    }

    /// `[batch, lookback * input_dim] -> [batch, rooms * forecast_steps]`
    fn forward(&self, x: Array2<f32>) -> Array2<f32> {
        let last = self.layers.len() - 1;
        self.layers.iter().enumerate().fold(x, |acc, (i, layer)| {
            let mut out = layer.forward(&acc);
            if i < last {
                out.mapv_inplace(|v| v.max(0.0));
            }
            out
        })
    }

    /// Forecast a single window shaped `[lookback, input_dim]` or `[1, lookback, input_dim]`.
    pub fn predict_future(&self, input: ArrayViewD<'_, f32>) -> Result<ForecastResult, PipelineError> {
        let batch = match input.ndim() {
            2 => input.insert_axis(Axis(0)),
            3 => input,
            n => return Err(PipelineError::mismatch("input rank", 3, n)),
        };
        let batch = batch
            .into_dimensionality::<Ix3>()
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        if batch.len_of(Axis(0)) != 1 {
            return Err(PipelineError::mismatch("batch size", 1, batch.len_of(Axis(0))));
        }
        let mut results = self.predict_batch(batch)?;
        results
            .pop()
            .ok_or_else(|| PipelineError::InsufficientData("empty forecast batch".into()))
    }

    pub fn predict_tensor(&self, tensor: &NormalizedTensor) -> Result<ForecastResult, PipelineError> {
        if tensor.target_rooms() != self.spec.target_rooms.as_slice() {
            return Err(PipelineError::mismatch(
                "target rooms",
                self.spec.target_rooms.len(),
                tensor.target_rooms().len(),
            ));
        }
        self.predict_future(tensor.view().into_dyn())
    }

    /// One result per window in `[batch, lookback, input_dim]`.
    pub fn predict_batch(&self, input: ArrayView3<'_, f32>) -> Result<Vec<ForecastResult>, PipelineError> {
        let (batch, lookback, width) = input.dim();
        if lookback != self.spec.lookback_steps {
            return Err(PipelineError::mismatch("lookback steps", self.spec.lookback_steps, lookback));
        }
        if width != self.spec.input_dim {
            return Err(PipelineError::mismatch("input width", self.spec.input_dim, width));
        }
        let flat = Array2::from_shape_vec((batch, lookback * width), input.iter().copied().collect())
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        let output = self.forward(flat);
        Ok(output.rows().into_iter().map(|row| self.decode(&row.to_vec())).collect())
    }

    /// Split a flat output row into rooms and denormalize it.
    fn decode(&self, row: &[f32]) -> ForecastResult {
        let steps = self.spec.forecast_steps;
        let rooms = self
            .spec
            .target_rooms
            .iter()
            .zip(row.chunks(steps))
            .map(|(room, values)| {
                let points = values
                    .iter()
                    .enumerate()
                    .map(|(j, v)| ForecastPoint {
                        offset_min: (j as u32 + 1) * BIN_MINUTES as u32,
                        temp: round_to(denormalize_temperature(*v as f64), 2),
                    })
                    .collect();
                (room.clone(), points)
            })
            .collect();
        ForecastResult {
            meta: ForecastMeta::for_steps(steps),
            rooms: RoomForecasts(rooms),
        }
    }
}

// =====================
// Result
// =====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub meta: ForecastMeta,
    pub rooms: RoomForecasts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub horizon: String,
    pub resolution: String,
}

impl ForecastMeta {
    fn for_steps(steps: usize) -> Self {
        let minutes = steps as i64 * BIN_MINUTES;
        let horizon = match minutes {
            60 => "1 Hour".to_string(),
            m if m % 60 == 0 => format!("{} Hours", m / 60),
            m => format!("{} min", m),
        };
        ForecastMeta {
            kind: "Multi-Room Prediction (No Watermeter)".to_string(),
            horizon,
            resolution: format!("{} min", BIN_MINUTES),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub offset_min: u32,
    pub temp: f64,
}

/// Per-room forecasts in target-room order; serializes as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomForecasts(pub Vec<(String, Vec<ForecastPoint>)>);

impl RoomForecasts {
    pub fn get(&self, room: &str) -> Option<&[ForecastPoint]> {
        self.0.iter().find(|(name, _)| name == room).map(|(_, p)| p.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }
}

impl Serialize for RoomForecasts {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (room, points) in &self.0 {
            map.serialize_entry(room, points)?;
        }
        map.end()
    }
}
