//! Models for the Calculus asset-telemetry API.
//!
//! Scope: types only. Request construction lives in `crate::client`, flattening in
//! `crate::services::extract`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::client::unix_to_datetime;
use crate::error::PipelineError;

// =====================
// Identifiers
// =====================

/// Asset identifier. The API and the asset file use both numbers and strings for it,
/// so it is normalised to its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AssetId(pub String);

/// Ids become a URL path segment, so text ids are limited to unreserved characters.
fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

impl core::fmt::Display for AssetId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AssetId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl<'de> serde::de::Visitor<'de> for V {
            type Value = AssetId;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                write!(f, "an integer or a URL-safe string asset id")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.trim().is_empty() || !value.chars().all(is_path_safe) {
                    return Err(E::invalid_value(serde::de::Unexpected::Str(value), &self));
                }
                Ok(AssetId(value.to_string()))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(AssetId(value.to_string()))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(AssetId(value.to_string()))
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// One entry of the local asset descriptor file. Only `id` is interpreted; everything
/// else is carried along untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: AssetId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// =====================
// Readings payload
// =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingsPayload {
    pub data_sources: Vec<DataSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Sensor type / data source name, e.g. a room.
    pub name: String,
    #[serde(default)]
    pub data_series: Vec<DataSeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSeries {
    /// Compound key `"<prefix>|<sensor key>#<suffix>"`.
    pub key: String,
    #[serde(default)]
    pub value: Vec<SeriesValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesValue {
    pub key: RawTimestamp,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Timestamp as delivered by the API: Unix seconds (integer or float) or RFC 3339 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Unix(i64),
    UnixFloat(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn to_utc(&self) -> Result<DateTime<Utc>, PipelineError> {
        let parsed = match self {
            RawTimestamp::Unix(secs) => unix_to_datetime(*secs).ok(),
            RawTimestamp::UnixFloat(secs) if secs.is_finite() => {
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9).round() as u32;
                DateTime::<Utc>::from_timestamp(whole as i64, nanos.min(999_999_999))
            }
            RawTimestamp::UnixFloat(_) => None,
            RawTimestamp::Text(s) => match s.trim().parse::<i64>() {
                Ok(secs) => DateTime::<Utc>::from_timestamp(secs, 0),
                Err(_) => parse_text_timestamp(s.trim()),
            },
        };
        parsed.ok_or_else(|| PipelineError::MalformedPayload(format!("unparseable timestamp {:?}", self)))
    }
}

/// RFC 3339 first; offset-less ISO forms are read as UTC.
fn parse_text_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// One flattened leaf value of a readings payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub asset_id: AssetId,
    pub sensor_type: String,
    pub timestamp: RawTimestamp,
    pub sensor_key: String,
    pub value: Option<f64>,
}

impl RawReading {
    /// Feature column this reading belongs to, e.g. `"Kitchen.temperature"`.
    pub fn column_name(&self) -> String {
        format!("{}.{}", self.sensor_type, self.sensor_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn asset_id_accepts_numbers_and_strings() {
        let ids: Vec<AssetId> = serde_json::from_str(r#"[17, "abc-9"]"#).unwrap();
        assert_eq!(ids, vec![AssetId("17".into()), AssetId("abc-9".into())]);
        assert!(serde_json::from_str::<AssetId>(r#""  ""#).is_err());
    }

    #[test]
    fn asset_id_rejects_path_breaking_text() {
        for bad in [r#""a/b""#, r#""block 7""#, r#""x?y=1""#, r#""50%""#] {
            assert!(serde_json::from_str::<AssetId>(bad).is_err(), "{}", bad);
        }
        let ok: AssetId = serde_json::from_str(r#""site_2.north~b""#).unwrap();
        assert_eq!(ok.0, "site_2.north~b");
    }

    #[test]
    fn descriptor_keeps_unknown_fields() {
        let d: AssetDescriptor = serde_json::from_str(r#"{"id": 5, "name": "B1", "floor": 2}"#).unwrap();
        assert_eq!(d.id, AssetId("5".into()));
        assert_eq!(d.name.as_deref(), Some("B1"));
        assert_eq!(d.extra.get("floor"), Some(&Value::from(2)));
    }

    #[test]
    fn timestamps_parse_from_all_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let forms: Vec<RawTimestamp> =
            serde_json::from_str(r#"[1709294400, 1709294400.0, "1709294400", "2024-03-01T13:00:00+01:00",
                "2024-03-01T12:00:00", "2024-03-01 12:00:00", "2024-03-01T12:00:00.000"]"#).unwrap();
        for form in forms {
            assert_eq!(form.to_utc().unwrap(), expected, "{:?}", form);
        }
        assert!(RawTimestamp::Text("yesterday".into()).to_utc().is_err());
    }
}
