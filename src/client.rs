//! Blocking HTTP client for the Calculus asset-telemetry API.
//!
//! - Single attempt per request, no retries and no backoff.
//! - Failures are classified into [`FetchError`] and returned as values; the caller
//!   decides whether to skip, log, or abort.
//! - Query bounds travel as whole Unix seconds (`unixTimestampStart`/`unixTimestampEnd`).

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use http::StatusCode;
use log::debug;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::models::calculus::AssetId;

const API_KEY_HEADER: &str = "CalculusApiKey";

/// Classified outcome of a failed request.
#[derive(Debug)]
pub enum FetchError {
    Timeout,
    /// Non-2xx response.
    Http { status: StatusCode },
    /// Any other transport or decoding failure.
    Other(String),
}

impl core::fmt::Display for FetchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Http { status } => write!(f, "http error {}", status),
            FetchError::Other(s) => write!(f, "request failed: {}", s),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<ureq::Error> for FetchError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(_) => FetchError::Timeout,
            ureq::Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => FetchError::Timeout,
            ureq::Error::StatusCode(code) => match StatusCode::from_u16(code) {
                Ok(status) => FetchError::Http { status },
                Err(_) => FetchError::Other(format!("invalid status code {}", code)),
            },
            other => FetchError::Other(other.to_string()),
        }
    }
}

/// Convert an offset-aware instant to whole seconds since the Unix epoch,
/// truncating sub-second precision toward zero.
pub fn time_to_unix<Tz: TimeZone>(dt: &DateTime<Tz>) -> i64 {
    let utc = dt.with_timezone(&Utc);
    let secs = utc.timestamp();
    if secs < 0 && utc.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub fn unix_to_datetime(secs: i64) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| PipelineError::InvalidInput(format!("unix timestamp {} out of range", secs)))
}

/// Parse a user-supplied query bound. Datetimes without an offset are rejected.
pub fn parse_query_time(s: &str) -> Result<DateTime<FixedOffset>, PipelineError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt);
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(s, fmt).is_ok());
    if naive {
        Err(PipelineError::InvalidInput(format!(
            "datetime {:?} has no timezone offset",
            s
        )))
    } else {
        Err(PipelineError::InvalidInput(format!("unparseable datetime {:?}", s)))
    }
}

pub struct CalculusClient {
    agent: ureq::Agent,
    config: ApiConfig,
}

impl CalculusClient {
    pub fn new(config: ApiConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .build();
        CalculusClient {
            agent: ureq::Agent::new_with_config(agent_config),
            config,
        }
    }

    /// `{base}/assets[/{asset}]/{endpoint}[?unixTimestampStart=..&unixTimestampEnd=..]`.
    /// The range is only appended when both bounds are given.
    pub fn build_url<Tz: TimeZone>(
        &self,
        endpoint: &str,
        asset_id: Option<&AssetId>,
        start: Option<&DateTime<Tz>>,
        end: Option<&DateTime<Tz>>,
    ) -> String {
        let mut url = format!("{}/assets", self.config.base_url);
        if let Some(id) = asset_id {
            url.push('/');
            url.push_str(&id.0);
        }
        url.push('/');
        url.push_str(endpoint);
        if let (Some(start), Some(end)) = (start, end) {
            url.push_str(&format!(
                "?unixTimestampStart={}&unixTimestampEnd={}",
                time_to_unix(start),
                time_to_unix(end)
            ));
        }
        url
    }

    /// Build the URL without performing any network I/O.
    pub fn dry_run<Tz: TimeZone>(
        &self,
        endpoint: &str,
        asset_id: Option<&AssetId>,
        start: Option<&DateTime<Tz>>,
        end: Option<&DateTime<Tz>>,
    ) -> String {
        let url = self.build_url(endpoint, asset_id, start, end);
        debug!("Dry run: GET {}", url);
        url
    }

    pub fn query<Tz: TimeZone>(
        &self,
        endpoint: &str,
        asset_id: Option<&AssetId>,
        start: Option<&DateTime<Tz>>,
        end: Option<&DateTime<Tz>>,
    ) -> Result<Value, FetchError> {
        let url = self.build_url(endpoint, asset_id, start, end);
        debug!("GET {}", url);
        let mut res = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header(API_KEY_HEADER, self.config.api_key.as_str())
            .call()?;
        let body = res.body_mut().read_json::<Value>()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    fn client_for(base_url: String, timeout: std::time::Duration) -> CalculusClient {
        CalculusClient::new(ApiConfig {
            base_url,
            api_key: "secret-token".into(),
            timeout,
        })
    }

    /// Serve exactly one connection: capture the request head, optionally stall, then reply.
    fn serve_once(response: &'static str, stall: std::time::Duration) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else { return };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&head).to_string());
            thread::sleep(stall);
            let _ = stream.write_all(response.as_bytes());
        });
        (format!("http://{}", addr), rx)
    }

    #[test]
    fn unix_conversion_is_offset_aware() {
        let utc = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let cet = FixedOffset::east_opt(3600).unwrap().with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        assert_eq!(time_to_unix(&utc), 1_709_294_400);
        assert_eq!(time_to_unix(&cet), 1_709_294_400);

        let with_millis = utc + Duration::milliseconds(999);
        assert_eq!(time_to_unix(&with_millis), 1_709_294_400);
        let before_epoch = Utc.timestamp_opt(-2, 500_000_000).unwrap();
        assert_eq!(time_to_unix(&before_epoch), -1);
    }

    #[test]
    fn unix_round_trip_recovers_instant() {
        let offsets = [-8 * 3600, 0, 3600, 5 * 3600 + 1800];
        for (i, off) in offsets.iter().enumerate() {
            let tz = FixedOffset::east_opt(*off).unwrap();
            let dt = tz.with_ymd_and_hms(2023 + i as i32, 10, 29, 2, 30, 15).unwrap();
            let back = unix_to_datetime(time_to_unix(&dt)).unwrap();
            assert_eq!(back, dt.with_timezone(&Utc));
        }
    }

    #[test]
    fn naive_datetimes_are_rejected() {
        for s in ["2024-03-01T12:00:00", "2024-03-01 12:00:00", "2024-03-01T12:00"] {
            match parse_query_time(s) {
                Err(PipelineError::InvalidInput(msg)) => assert!(msg.contains("no timezone"), "{}", msg),
                other => panic!("expected InvalidInput for {}, got {:?}", s, other),
            }
        }
        let ok = parse_query_time("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(time_to_unix(&ok), 1_709_287_200);
    }

    #[test]
    fn url_includes_range_only_with_both_bounds() {
        let client = client_for("https://api.example/v3".into(), std::time::Duration::from_secs(1));
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = start + Duration::hours(1);
        let asset = AssetId("42".into());

        assert_eq!(
            client.build_url("readings", Some(&asset), Some(&start), Some(&end)),
            "https://api.example/v3/assets/42/readings?unixTimestampStart=1709251200&unixTimestampEnd=1709254800"
        );
        assert_eq!(
            client.build_url("readings", Some(&asset), Some(&start), None),
            "https://api.example/v3/assets/42/readings"
        );
        assert_eq!(
            client.dry_run::<Utc>("list", None, None, None),
            "https://api.example/v3/assets/list"
        );
    }

    #[test]
    fn status_codes_classify_as_http_errors() {
        match FetchError::from(ureq::Error::StatusCode(503)) {
            FetchError::Http { status } => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            FetchError::from(ureq::Error::Timeout(ureq::Timeout::Global)),
            FetchError::Timeout
        ));
    }

    #[test]
    fn query_returns_json_and_sends_api_key() {
        let body = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 18\r\nConnection: close\r\n\r\n{\"dataSources\":[]}";
        let (base, rx) = serve_once(body, std::time::Duration::ZERO);
        let client = client_for(base, std::time::Duration::from_secs(5));
        let json = client.query::<Utc>("readings", Some(&AssetId("7".into())), None, None).unwrap();
        assert_eq!(json, serde_json::json!({"dataSources": []}));

        let head = rx.recv().unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /assets/7/readings "), "{}", head);
        assert!(head.contains("calculusapikey: secret-token"), "{}", head);
    }

    #[test]
    fn query_classifies_failures() {
        let (base, _rx) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            std::time::Duration::ZERO,
        );
        let client = client_for(base, std::time::Duration::from_secs(5));
        match client.query::<Utc>("readings", None, None, None) {
            Err(FetchError::Http { status }) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected http error, got {:?}", other),
        }

        let (base, _rx) = serve_once("", std::time::Duration::from_secs(3));
        let client = client_for(base, std::time::Duration::from_millis(200));
        assert!(matches!(
            client.query::<Utc>("readings", None, None, None),
            Err(FetchError::Timeout)
        ));

        let closed = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = client_for(format!("http://{}", closed), std::time::Duration::from_secs(5));
        assert!(matches!(
            client.query::<Utc>("readings", None, None, None),
            Err(FetchError::Other(_))
        ));
    }
}
