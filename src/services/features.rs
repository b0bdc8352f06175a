//! Assemble flattened readings into a fixed-cadence feature table.
//!
//! Steps, in order:
//! 1. Parse timestamps and pivot readings into one column per `"<type>.<key>"`.
//! 2. Drop every watermeter column.
//! 3. Record target rooms (columns ending in `temperature`).
//! 4. Keep only temperature / setpoint / PIR columns.
//! 5. Resample to 10-minute bins (max for PIR, mean otherwise).
//! 6. Fill gaps: linear interpolation, then forward fill, then backward fill.
//! 7. Append cyclical hour-of-day and day-of-week encodings.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use log::debug;
use std::collections::HashMap;
use std::f64::consts::PI;

use crate::error::PipelineError;
use crate::models::calculus::RawReading;

pub const BIN_MINUTES: i64 = 10;
const BIN_SECONDS: i64 = BIN_MINUTES * 60;
/// One year of 10-minute bins.
const MAX_BINS: usize = 366 * 24 * 6;

pub const TIME_COLUMNS: [&str; 4] = ["hour_sin", "hour_cos", "day_sin", "day_cos"];

const EXCLUDED_KEYWORD: &str = "watermeter";
const TARGET_SUFFIX: &str = "temperature";
const FEATURE_KEYWORDS: [&str; 3] = ["temperature", "set", "pir"];

pub fn is_temperature_column(name: &str) -> bool {
    name.to_lowercase().contains("temperature")
}

pub fn is_pir_column(name: &str) -> bool {
    name.to_lowercase().contains("pir")
}

pub fn is_time_column(name: &str) -> bool {
    TIME_COLUMNS.contains(&name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Time-indexed table at a fixed 10-minute cadence. Every value is populated.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    index: Vec<DateTime<Tz>>,
    columns: Vec<FeatureColumn>,
    target_rooms: Vec<String>,
}

impl FeatureTable {
    pub fn index(&self) -> &[DateTime<Tz>] {
        &self.index
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&FeatureColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Temperature channels to forecast, in column order.
    pub fn target_rooms(&self) -> &[String] {
        &self.target_rooms
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

/// Samples of one channel before resampling.
struct Channel {
    name: String,
    samples: Vec<(i64, f64)>,
}

pub fn build_feature_table(readings: &[RawReading], tz: Tz) -> Result<FeatureTable, PipelineError> {
    if readings.is_empty() {
        return Err(PipelineError::InsufficientData("no readings to build features from".into()));
    }

    // 1) pivot, preserving first-seen column order; the index spans every reading
    let mut channels: Vec<Channel> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut first_ts = i64::MAX;
    let mut last_ts = i64::MIN;
    for reading in readings {
        let ts = reading.timestamp.to_utc()?.timestamp();
        first_ts = first_ts.min(ts);
        last_ts = last_ts.max(ts);

        let name = reading.column_name();
        let pos = *positions.entry(name.clone()).or_insert_with(|| {
            channels.push(Channel {
                name,
                samples: Vec::new(),
            });
            channels.len() - 1
        });
        if let Some(v) = reading.value.filter(|v| v.is_finite()) {
            channels[pos].samples.push((ts, v));
        }
    }

    // 2) hard exclusion
    channels.retain(|c| !c.name.to_lowercase().contains(EXCLUDED_KEYWORD));

    // 3) targets
    let target_rooms: Vec<String> = channels
        .iter()
        .filter(|c| c.name.to_lowercase().ends_with(TARGET_SUFFIX))
        .map(|c| c.name.clone())
        .collect();
    if target_rooms.is_empty() {
        return Err(PipelineError::InsufficientData(
            "no temperature channel to forecast".into(),
        ));
    }

    // 4) feature selection
    channels.retain(|c| {
        let lower = c.name.to_lowercase();
        FEATURE_KEYWORDS.iter().any(|k| lower.contains(k))
    });

    // 5) resample on a grid anchored at local midnight of the first reading's day
    let origin = local_midnight(first_ts, tz)?;
    let start = origin + (first_ts - origin).div_euclid(BIN_SECONDS) * BIN_SECONDS;
    let end = origin + (last_ts - origin).div_euclid(BIN_SECONDS) * BIN_SECONDS;
    let bins = ((end - start) / BIN_SECONDS + 1) as usize;
    if bins > MAX_BINS {
        return Err(PipelineError::InvalidInput(format!(
            "readings span {} bins, more than the {} allowed; narrow the query window",
            bins, MAX_BINS
        )));
    }

    let mut columns = Vec::with_capacity(channels.len() + TIME_COLUMNS.len());
    for channel in channels {
        let binned = resample(&channel.samples, start, bins, is_pir_column(&channel.name));
        // 6) gap filling
        let values = fill_gaps(&binned).ok_or_else(|| {
            PipelineError::InsufficientData(format!("channel {} has no valid samples", channel.name))
        })?;
        columns.push(FeatureColumn {
            name: channel.name,
            values,
        });
    }

    let index: Vec<DateTime<Tz>> = (0..bins as i64)
        .map(|i| {
            DateTime::<Utc>::from_timestamp(start + i * BIN_SECONDS, 0)
                .map(|utc| utc.with_timezone(&tz))
                .ok_or_else(|| PipelineError::InvalidInput(format!("bin {} out of range", i)))
        })
        .collect::<Result<_, _>>()?;

    // 7) cyclical time encodings
    let hours: Vec<f64> = index.iter().map(|t| t.hour() as f64).collect();
    let days: Vec<f64> = index.iter().map(|t| t.weekday().num_days_from_monday() as f64).collect();
    let cyclical: [(&str, &Vec<f64>, f64, fn(f64) -> f64); 4] = [
        (TIME_COLUMNS[0], &hours, 24.0, f64::sin),
        (TIME_COLUMNS[1], &hours, 24.0, f64::cos),
        (TIME_COLUMNS[2], &days, 7.0, f64::sin),
        (TIME_COLUMNS[3], &days, 7.0, f64::cos),
    ];
    for (name, source, period, f) in cyclical {
        columns.push(FeatureColumn {
            name: name.to_string(),
            values: source.iter().map(|v| f(2.0 * PI * v / period)).collect(),
        });
    }

    debug!(
        "Features: {} bin(s), {} column(s), {} target room(s)",
        bins,
        columns.len(),
        target_rooms.len()
    );

    Ok(FeatureTable {
        index,
        columns,
        target_rooms,
    })
}

/// Unix seconds of local midnight on the day containing `ts`. When midnight is skipped
/// by a DST change, the current offset is used instead.
fn local_midnight(ts: i64, tz: Tz) -> Result<i64, PipelineError> {
    let local = DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| PipelineError::InvalidInput(format!("timestamp {} out of range", ts)))?
        .with_timezone(&tz);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|dt| dt.timestamp());
    Ok(midnight.unwrap_or(ts - local.num_seconds_from_midnight() as i64))
}

/// Aggregate samples into `bins` consecutive bins starting at `start` (max or mean).
fn resample(samples: &[(i64, f64)], start: i64, bins: usize, use_max: bool) -> Vec<Option<f64>> {
    let mut acc: Vec<Option<(f64, usize)>> = vec![None; bins];
    for &(ts, v) in samples {
        let bin = ((ts - start).div_euclid(BIN_SECONDS)) as usize;
        let slot = &mut acc[bin];
        *slot = Some(match *slot {
            None => (v, 1),
            Some((a, n)) if use_max => (a.max(v), n + 1),
            Some((a, n)) => (a + v, n + 1),
        });
    }
    acc.into_iter()
        .map(|slot| slot.map(|(a, n)| if use_max { a } else { a / n as f64 }))
        .collect()
}

/// Interpolate interior gaps linearly, extend the edges with the nearest valid value.
/// `None` when the series has no valid value at all.
fn fill_gaps(series: &[Option<f64>]) -> Option<Vec<f64>> {
    let valid: Vec<(usize, f64)> = series
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    let &(first_idx, first_val) = valid.first()?;
    let &(last_idx, last_val) = valid.last()?;

    let mut out = vec![0.0; series.len()];
    out[..first_idx].fill(first_val);
    out[last_idx..].fill(last_val);
    for pair in valid.windows(2) {
        let (i0, v0) = pair[0];
        let (i1, v1) = pair[1];
        let span = (i1 - i0) as f64;
        for (step, slot) in out[i0..i1].iter_mut().enumerate() {
            *slot = v0 + (v1 - v0) * step as f64 / span;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calculus::{AssetId, RawTimestamp};
    use crate::services::extract::extract;
    use chrono::TimeZone;

    const AMS: Tz = chrono_tz::Europe::Amsterdam;

    fn reading(sensor_type: &str, key: &str, ts: i64, value: Option<f64>) -> RawReading {
        RawReading {
            asset_id: AssetId("1".into()),
            sensor_type: sensor_type.into(),
            timestamp: RawTimestamp::Unix(ts),
            sensor_key: key.into(),
            value,
        }
    }

    fn fixture_table() -> FeatureTable {
        let json = std::fs::read_to_string("tests/data/asset-readings.json").expect("fixture present");
        let payload: serde_json::Value = serde_json::from_str(&json).expect("parse readings payload");
        let readings = extract(&payload, &AssetId("1001".into())).unwrap();
        build_feature_table(&readings, AMS).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn fixture_builds_expected_columns() {
        let table = fixture_table();
        assert_eq!(
            table.column_names(),
            vec![
                "Living room.temperature",
                "Living room.set",
                "Kitchen.pir",
                "hour_sin",
                "hour_cos",
                "day_sin",
                "day_cos"
            ]
        );
        assert_eq!(table.target_rooms(), ["Living room.temperature".to_string()]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.index()[0], Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap());
    }

    #[test]
    fn fixture_values_are_resampled_and_filled() {
        let table = fixture_table();
        let temp = &table.column("Living room.temperature").unwrap().values;
        assert!(approx(temp[0], 19.7));
        assert!(approx(temp[1], 20.05));
        assert!(approx(temp[2], 20.4));

        let set = &table.column("Living room.set").unwrap().values;
        assert_eq!(set, &vec![21.0, 21.0, 21.0]);

        // max within the first bin, then interpolated
        let pir = &table.column("Kitchen.pir").unwrap().values;
        assert_eq!(pir, &vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn cyclical_columns_use_local_time() {
        let table = fixture_table();
        // 08:00Z on Monday 2024-03-04 is 09:00 in Amsterdam
        let hour = 9.0;
        assert!(approx(table.column("hour_sin").unwrap().values[0], (2.0 * PI * hour / 24.0).sin()));
        assert!(approx(table.column("hour_cos").unwrap().values[0], (2.0 * PI * hour / 24.0).cos()));
        assert!(approx(table.column("day_sin").unwrap().values[0], 0.0));
        assert!(approx(table.column("day_cos").unwrap().values[0], 1.0));
    }

    #[test]
    fn watermeter_columns_never_survive() {
        let base = 1_709_539_200;
        let readings = vec![
            reading("Room", "temperature", base, Some(20.0)),
            reading("Room", "WaterMeter_temperature", base, Some(12.0)),
            reading("Utility", "watermeter", base + 600, Some(3.0)),
        ];
        let table = build_feature_table(&readings, AMS).unwrap();
        assert!(table.columns().iter().all(|c| !c.name.to_lowercase().contains("watermeter")));
        assert_eq!(table.target_rooms(), ["Room.temperature".to_string()]);
        // watermeter timestamps still define the span
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn irregular_sampling_yields_uniform_complete_index() {
        let base = 1_709_539_200;
        let offsets = [0, 37, 140, 1320, 1330, 2999, 5400, 5401];
        let mut readings: Vec<RawReading> = offsets
            .iter()
            .enumerate()
            .map(|(i, off)| reading("Office", "temperature", base + off, Some(18.0 + i as f64)))
            .collect();
        readings.push(reading("Office", "pir", base + 4000, Some(1.0)));
        readings.push(reading("Office", "humidity", base + 100, Some(40.0)));

        let table = build_feature_table(&readings, AMS).unwrap();
        assert_eq!(table.len(), 10);
        for pair in table.index().windows(2) {
            assert_eq!(pair[1].clone() - pair[0].clone(), chrono::Duration::minutes(BIN_MINUTES));
        }
        assert!(table.column("Office.humidity").is_none());
        for column in table.columns() {
            assert_eq!(column.values.len(), table.len());
            assert!(column.values.iter().all(|v| v.is_finite()), "{}", column.name);
        }
    }

    #[test]
    fn empty_channel_is_insufficient_data() {
        let base = 1_709_539_200;
        let readings = vec![
            reading("Room", "temperature", base, Some(20.0)),
            reading("Room", "set", base, None),
            reading("Room", "set", base + 600, Some(f64::NAN)),
        ];
        match build_feature_table(&readings, AMS) {
            Err(PipelineError::InsufficientData(msg)) => assert!(msg.contains("Room.set"), "{}", msg),
            other => panic!("expected InsufficientData, got {:?}", other),
        }
        assert!(matches!(
            build_feature_table(&[], AMS),
            Err(PipelineError::InsufficientData(_))
        ));
    }

    #[test]
    fn bins_follow_local_ten_minute_grid() {
        // UTC+05:45, so epoch-aligned bins would sit 5 minutes off the local grid
        let tz = chrono_tz::Asia::Kathmandu;
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap().timestamp();
        let readings = vec![
            reading("Room", "temperature", base, Some(20.0)),
            reading("Room", "temperature", base + 1800, Some(21.5)),
        ];
        let table = build_feature_table(&readings, tz).unwrap();
        let minutes: Vec<u32> = table.index().iter().map(|t| t.minute()).collect();
        assert_eq!(minutes, vec![40, 50, 0, 10]);
        assert_eq!(table.index()[0].hour(), 5);

        let temp = &table.column("Room.temperature").unwrap().values;
        assert!(approx(temp[0], 20.0));
        assert!(approx(temp[3], 21.5));
        let hour_sin = &table.column("hour_sin").unwrap().values;
        assert!(approx(hour_sin[2], (2.0 * PI * 6.0 / 24.0).sin()));
    }

    #[test]
    fn span_longer_than_a_year_is_refused() {
        let base = 1_709_539_200;
        let readings = vec![
            reading("Room", "temperature", base, Some(20.0)),
            reading("Room", "temperature", base + 400 * 86_400, Some(20.0)),
        ];
        match build_feature_table(&readings, AMS) {
            Err(PipelineError::InvalidInput(msg)) => assert!(msg.contains("query window"), "{}", msg),
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn gap_filling_extends_edges() {
        let filled = fill_gaps(&[None, Some(1.0), None, None, Some(4.0), None]).unwrap();
        assert_eq!(filled, vec![1.0, 1.0, 2.0, 3.0, 4.0, 4.0]);
        assert!(fill_gaps(&[None, None]).is_none());
    }
}
