//! Deterministic synthetic readings payload, shaped like the live API response.
//!
//! Each room gets a temperature swinging 18..22 °C once per hour, a setpoint and a
//! PIR channel alternating between 0 and 1. A building watermeter series rides along
//! so the exclusion path is exercised.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::Value;
use std::f64::consts::PI;

use crate::models::calculus::{DataSeries, DataSource, RawTimestamp, ReadingsPayload, SeriesValue};
use crate::utils::{align_to_step, round_to};

const STEP_SECS: i64 = 300;
const DEFAULT_HOURS: i64 = 26;

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    pub rooms: Vec<String>,
    pub start: DateTime<Utc>,
    pub samples: usize,
    pub interval_secs: i64,
    pub include_watermeter: bool,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        let samples = (DEFAULT_HOURS * 3600 / STEP_SECS) as usize;
        let end = align_to_step(Utc::now(), STEP_SECS);
        SyntheticOptions {
            rooms: vec!["Living room".into(), "Kitchen".into(), "Bedroom".into()],
            start: end - Duration::seconds(STEP_SECS * samples as i64),
            samples,
            interval_secs: STEP_SECS,
            include_watermeter: true,
        }
    }
}

pub fn generate_payload<R: Rng>(options: &SyntheticOptions, rng: &mut R) -> Value {
    let timestamps: Vec<i64> = (0..options.samples)
        .map(|i| options.start.timestamp() + i as i64 * options.interval_secs)
        .collect();

    let mut sources = Vec::with_capacity(options.rooms.len() + 1);
    for (index, room) in options.rooms.iter().enumerate() {
        let phase = index as f64 * 0.4;
        let setpoint = 20.5 + index as f64 * 0.5;

        let temperature = series(index, "temperature", &timestamps, |_, ts| {
            let hour_fraction = ts.rem_euclid(3600) as f64 / 3600.0;
            let jitter = rng.random_range(-0.05..=0.05);
            round_to(20.0 + 2.0 * (2.0 * PI * hour_fraction + phase).sin() + jitter, 2)
        });
        let set = series(index, "set", &timestamps, |_, _| setpoint);
        let pir = series(index, "pir", &timestamps, |i, _| ((i + index) % 2) as f64);

        sources.push(DataSource {
            name: room.clone(),
            data_series: vec![temperature, set, pir],
        });
    }

    if options.include_watermeter {
        let mut total = 1_000.0;
        let meter = series(options.rooms.len(), "watermeter", &timestamps, |_, _| {
            total += rng.random_range(0.0..0.8);
            round_to(total, 3)
        });
        sources.push(DataSource {
            name: "Utility".into(),
            data_series: vec![meter],
        });
    }

    let payload = ReadingsPayload { data_sources: sources };
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

fn series(index: usize, key: &str, timestamps: &[i64], mut value: impl FnMut(usize, i64) -> f64) -> DataSeries {
    DataSeries {
        key: format!("{}|{}#0", index, key),
        value: timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| SeriesValue {
                key: RawTimestamp::Unix(*ts),
                value: Some(value(i, *ts)),
            })
            .collect(),
    }
}
