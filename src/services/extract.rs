//! Flatten a per-asset readings payload into [`RawReading`]s.
//!
//! Layout: `dataSources[].dataSeries[].value[]`, one reading per leaf value.

use log::debug;
use serde_json::Value;

use crate::error::PipelineError;
use crate::models::calculus::{AssetId, RawReading, ReadingsPayload};

/// Decode the raw JSON body, reporting the failing path on a structural mismatch.
pub fn decode_payload(payload: &Value) -> Result<ReadingsPayload, PipelineError> {
    serde_path_to_error::deserialize(payload).map_err(|e| {
        PipelineError::MalformedPayload(format!("at `{}`: {}", e.path(), e.inner()))
    })
}

/// Sensor key from a compound series key: the second `|` segment, up to the first `#`.
///
/// `"a|battery#1"` yields `"battery"`.
pub fn sensor_key(compound: &str) -> Result<&str, PipelineError> {
    let segment = compound
        .split('|')
        .nth(1)
        .ok_or_else(|| PipelineError::MalformedPayload(format!("series key {:?} has no '|' segment", compound)))?;
    let key = segment.split('#').next().unwrap_or_default().trim();
    if key.is_empty() {
        return Err(PipelineError::MalformedPayload(format!(
            "series key {:?} has an empty sensor key",
            compound
        )));
    }
    Ok(key)
}

pub fn extract(payload: &Value, asset_id: &AssetId) -> Result<Vec<RawReading>, PipelineError> {
    let decoded = decode_payload(payload)?;
    let mut readings = Vec::new();
    for source in &decoded.data_sources {
        for series in &source.data_series {
            let key = sensor_key(&series.key)?;
            readings.extend(series.value.iter().map(|entry| RawReading {
                asset_id: asset_id.clone(),
                sensor_type: source.name.clone(),
                timestamp: entry.key.clone(),
                sensor_key: key.to_string(),
                value: entry.value,
            }));
        }
    }
    debug!(
        "Extract: asset {} yielded {} reading(s) from {} data source(s)",
        asset_id,
        readings.len(),
        decoded.data_sources.len()
    );
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::calculus::RawTimestamp;
    use serde_json::json;

    fn load_fixture() -> Value {
        let json = std::fs::read_to_string("tests/data/asset-readings.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse readings payload")
    }

    #[test]
    fn sensor_key_is_taken_before_hash() {
        assert_eq!(sensor_key("a|battery#1").unwrap(), "battery");
        assert_eq!(sensor_key("x|temperature").unwrap(), "temperature");
        assert_eq!(sensor_key("x|pir#2|tail").unwrap(), "pir");
    }

    #[test]
    fn malformed_series_keys_fail() {
        assert!(matches!(sensor_key("battery"), Err(PipelineError::MalformedPayload(_))));
        assert!(matches!(sensor_key("a|#1"), Err(PipelineError::MalformedPayload(_))));
    }

    #[test]
    fn battery_scenario_tags_sensor_key() {
        let payload = json!({
            "dataSources": [{
                "name": "Hall",
                "dataSeries": [{"key": "a|battery#1", "value": [{"key": 1700000000, "value": 87.0}]}]
            }]
        });
        let readings = extract(&payload, &AssetId("9".into())).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].sensor_key, "battery");
        assert_eq!(readings[0].sensor_type, "Hall");
        assert_eq!(readings[0].timestamp, RawTimestamp::Unix(1_700_000_000));
        assert_eq!(readings[0].value, Some(87.0));
        assert_eq!(readings[0].column_name(), "Hall.battery");
    }

    #[test]
    fn fixture_flattens_every_leaf() {
        let readings = extract(&load_fixture(), &AssetId("1001".into())).unwrap();
        assert_eq!(readings.len(), 9);
        assert!(readings.iter().all(|r| r.asset_id.0 == "1001"));
        let columns: std::collections::BTreeSet<String> = readings.iter().map(|r| r.column_name()).collect();
        assert!(columns.contains("Living room.temperature"));
        assert!(columns.contains("Living room.set"));
        assert!(columns.contains("Kitchen.pir"));
        assert!(columns.contains("Building.watermeter"));
    }

    #[test]
    fn structural_errors_name_the_path() {
        let payload = json!({"dataSources": [{"name": "Hall", "dataSeries": [{"key": 5}]}]});
        match extract(&payload, &AssetId("9".into())) {
            Err(PipelineError::MalformedPayload(msg)) => assert!(msg.contains("dataSources[0].dataSeries[0].key"), "{}", msg),
            other => panic!("expected MalformedPayload, got {:?}", other),
        }
    }
}
