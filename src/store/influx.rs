use std::io::Write;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::debug;

use crate::config::StoreConfig;

use super::{line_protocol, Point, QueryRow, StoreError, TimeSeriesStore};

/// InfluxDB v2 HTTP store.
///
/// Writes go to `/api/v2/write` as line protocol, queries go to
/// `/api/v2/query` as Flux and come back as CSV. The per-request timeout is
/// set on the underlying client, so a hung server cannot stall the caller
/// longer than `timeout`.
pub struct InfluxStore {
    name: String,
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
    compression: String,
}

impl InfluxStore {
    /// Creates a store client. `default_timeout` applies when the config
    /// leaves `timeout` unset.
    pub fn new(name: &str, cfg: &StoreConfig, default_timeout: Duration) -> Result<Self> {
        let timeout = cfg.timeout.unwrap_or(default_timeout);

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            name: name.to_string(),
            http,
            url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            org: cfg.org.clone(),
            bucket: cfg.bucket.clone(),
            compression: cfg.compression.clone(),
        })
    }

    /// Checks the server's `/health` endpoint.
    pub async fn ping(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.url))
            .send()
            .await
            .with_context(|| format!("requesting {}/health", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("unexpected status {status} from {}/health", self.url);
        }

        Ok(())
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header(AUTHORIZATION, format!("Token {}", self.token))
        }
    }
}

impl TimeSeriesStore for InfluxStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, point: &Point) -> Result<(), StoreError> {
        let line = line_protocol::encode(point)?;
        let body = compress(line.as_bytes(), &self.compression)
            .map_err(|e| StoreError::Encode(format!("{e:#}")))?;

        let mut req = self
            .http
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);

        if let Some(encoding) = content_encoding(&self.compression) {
            req = req.header(CONTENT_ENCODING, encoding);
        }

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    async fn query(&self, window: Duration) -> Result<Vec<QueryRow>, StoreError> {
        let body = serde_json::json!({
            "query": flux_window_query(&self.bucket, window),
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        });

        let req = self
            .http
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header(ACCEPT, "application/csv")
            .json(&body);

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let rows = decode_csv(&text)?;
        debug!(store = %self.name, rows = rows.len(), "query decoded");

        Ok(rows)
    }
}

/// Flux program returning every point of `bucket` within the trailing window.
fn flux_window_query(bucket: &str, window: Duration) -> String {
    let bucket = bucket.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "from(bucket: \"{bucket}\")\n  |> range(start: -{}s)",
        window.as_secs().max(1)
    )
}

/// Column positions of one CSV table header.
#[derive(Debug, Clone, Copy)]
struct Columns {
    measurement: usize,
    time: usize,
    field: usize,
    value: usize,
}

impl Columns {
    fn from_header(record: &csv::StringRecord) -> Option<Self> {
        let position = |name: &str| record.iter().position(|c| c == name);
        Some(Self {
            measurement: position("_measurement")?,
            time: position("_time")?,
            field: position("_field")?,
            value: position("_value")?,
        })
    }
}

/// Decodes an un-annotated Flux CSV response.
///
/// Each table starts with its own header row. Rows whose `_value` is not a
/// number are skipped.
pub fn decode_csv(text: &str) -> Result<Vec<QueryRow>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut columns: Option<Columns> = None;
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| StoreError::Decode(e.to_string()))?;

        if record.iter().all(str::is_empty) {
            columns = None;
            continue;
        }

        if let Some(header) = Columns::from_header(&record) {
            columns = Some(header);
            continue;
        }

        let Some(cols) = columns else {
            return Err(StoreError::Decode("data row before header".to_string()));
        };

        let (Some(measurement), Some(time), Some(field), Some(value)) = (
            record.get(cols.measurement),
            record.get(cols.time),
            record.get(cols.field),
            record.get(cols.value),
        ) else {
            return Err(StoreError::Decode(format!(
                "short row with {} columns",
                record.len()
            )));
        };

        let Ok(value) = value.parse::<f64>() else {
            continue;
        };

        let timestamp = chrono::DateTime::parse_from_rfc3339(time)
            .map(SystemTime::from)
            .map_err(|e| StoreError::Decode(format!("parsing _time {time:?}: {e}")))?;

        rows.push(QueryRow {
            measurement: measurement.to_string(),
            timestamp,
            field: field.to_string(),
            value,
        });
    }

    Ok(rows)
}

// --- Compression ---

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;

    use super::*;

    const SAMPLE_CSV: &str = "\
,result,table,_start,_stop,_time,_value,_field,_measurement\r
,_result,0,2024-01-01T00:00:00Z,2024-01-01T06:00:00Z,2024-01-01T01:00:00Z,23.5,temp,inverter\r
,_result,0,2024-01-01T00:00:00Z,2024-01-01T06:00:00Z,2024-01-01T01:00:05.5Z,24,temp,inverter\r
\r
,result,table,_start,_stop,_time,_value,_field,_measurement\r
,_result,1,2024-01-01T00:00:00Z,2024-01-01T06:00:00Z,2024-01-01T01:00:00Z,online,status,inverter\r
,_result,1,2024-01-01T00:00:00Z,2024-01-01T06:00:00Z,2024-01-01T02:00:00Z,80,soc,battery\r
";

    fn store_config(url: &str) -> StoreConfig {
        StoreConfig {
            url: url.to_string(),
            token: "secret".to_string(),
            org: "home".to_string(),
            bucket: "telemetry".to_string(),
            timeout: Some(Duration::from_secs(2)),
            compression: "none".to_string(),
        }
    }

    #[test]
    fn test_decode_csv_multiple_tables() {
        let rows = decode_csv(SAMPLE_CSV).expect("decode");
        assert_eq!(rows.len(), 3, "non-numeric row should be skipped");

        assert_eq!(rows[0].measurement, "inverter");
        assert_eq!(rows[0].field, "temp");
        assert_eq!(rows[0].value, 23.5);
        assert_eq!(
            rows[0].timestamp,
            UNIX_EPOCH + Duration::from_secs(1_704_070_800)
        );
        assert_eq!(
            rows[1].timestamp,
            UNIX_EPOCH + Duration::from_millis(1_704_070_805_500)
        );
        assert_eq!(rows[2].measurement, "battery");
        assert_eq!(rows[2].value, 80.0);
    }

    #[test]
    fn test_decode_csv_empty_body() {
        assert!(decode_csv("").expect("decode").is_empty());
        assert!(decode_csv("\r\n").expect("decode").is_empty());
    }

    #[test]
    fn test_decode_csv_row_before_header() {
        let err = decode_csv(",_result,0,x,y,z,1,f,m\n").expect_err("should fail");
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[test]
    fn test_decode_csv_bad_time() {
        let text = ",result,table,_time,_value,_field,_measurement\n,_result,0,yesterday,1,f,m\n";
        let err = decode_csv(text).expect_err("should fail");
        assert!(err.to_string().contains("_time"));
    }

    #[test]
    fn test_flux_window_query() {
        let q = flux_window_query("tele\"metry", Duration::from_secs(6 * 3600));
        assert!(q.contains("from(bucket: \"tele\\\"metry\")"));
        assert!(q.contains("range(start: -21600s)"));
    }

    #[test]
    fn test_compress_gzip_roundtrip() {
        let data = b"inverter temp=23.5 1000000000";
        let compressed = compress(data, "gzip").expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_compress_unsupported() {
        assert!(compress(b"x", "snappy").is_err());
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("none"), None);
    }

    #[derive(Default)]
    struct Captured {
        body: Option<String>,
        auth: Option<String>,
        org: Option<String>,
        accept: Option<String>,
        content_type: Option<String>,
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn spawn_server(status: StatusCode) -> (String, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));

        let app = Router::new()
            .route(
                "/api/v2/write",
                post(
                    move |State(c): State<Arc<Mutex<Captured>>>,
                          headers: HeaderMap,
                          body: String| async move {
                        let mut c = c.lock();
                        c.body = Some(body);
                        c.auth = header(&headers, "authorization");
                        status
                    },
                ),
            )
            .route(
                "/api/v2/query",
                post(
                    move |State(c): State<Arc<Mutex<Captured>>>,
                          Query(params): Query<HashMap<String, String>>,
                          headers: HeaderMap,
                          body: String| async move {
                        let mut c = c.lock();
                        c.body = Some(body);
                        c.auth = header(&headers, "authorization");
                        c.org = params.get("org").cloned();
                        c.accept = header(&headers, "accept");
                        c.content_type = header(&headers, "content-type");
                        let text = if status.is_success() {
                            SAMPLE_CSV
                        } else {
                            "service unavailable"
                        };
                        (status, text)
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{addr}"), captured)
    }

    #[tokio::test]
    async fn test_write_posts_line_protocol() {
        let (url, captured) = spawn_server(StatusCode::NO_CONTENT).await;
        let store = InfluxStore::new("primary", &store_config(&url), Duration::from_secs(15))
            .expect("store");

        let point = Point::new("inverter", "temp", 23.5, UNIX_EPOCH + Duration::from_secs(1));
        store.write(&point).await.expect("write should succeed");

        let c = captured.lock();
        assert_eq!(c.body.as_deref(), Some("inverter temp=23.5 1000000000"));
        assert_eq!(c.auth.as_deref(), Some("Token secret"));
    }

    #[tokio::test]
    async fn test_write_rejected_status() {
        let (url, _captured) = spawn_server(StatusCode::BAD_REQUEST).await;
        let store = InfluxStore::new("primary", &store_config(&url), Duration::from_secs(15))
            .expect("store");

        let point = Point::new("m", "f", 1.0, UNIX_EPOCH + Duration::from_secs(1));
        let err = store.write(&point).await.expect_err("should be rejected");
        assert!(matches!(err, StoreError::Rejected { status: 400, .. }));
        assert_eq!(err.kind(), "rejected");
    }

    #[tokio::test]
    async fn test_write_unreachable_is_connection_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let store = InfluxStore::new(
            "secondary",
            &store_config(&format!("http://{addr}")),
            Duration::from_secs(30),
        )
        .expect("store");

        let point = Point::new("m", "f", 1.0, UNIX_EPOCH + Duration::from_secs(1));
        let err = store.write(&point).await.expect_err("should fail");
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[tokio::test]
    async fn test_query_posts_flux_and_decodes_rows() {
        let (url, captured) = spawn_server(StatusCode::OK).await;
        let store = InfluxStore::new("secondary", &store_config(&url), Duration::from_secs(30))
            .expect("store");

        let rows = store
            .query(Duration::from_secs(6 * 3600))
            .await
            .expect("query should succeed");
        assert_eq!(rows, decode_csv(SAMPLE_CSV).expect("decode"));

        let c = captured.lock();
        assert_eq!(c.org.as_deref(), Some("home"));
        assert_eq!(c.accept.as_deref(), Some("application/csv"));
        assert_eq!(c.content_type.as_deref(), Some("application/json"));
        assert_eq!(c.auth.as_deref(), Some("Token secret"));

        let body: serde_json::Value =
            serde_json::from_str(c.body.as_deref().expect("body captured")).expect("json body");
        assert_eq!(body["type"], "flux");
        assert_eq!(
            body["query"],
            "from(bucket: \"telemetry\")\n  |> range(start: -21600s)"
        );
        assert_eq!(body["dialect"]["header"], true);
    }

    #[tokio::test]
    async fn test_query_rejected_status() {
        let (url, _captured) = spawn_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let store = InfluxStore::new("secondary", &store_config(&url), Duration::from_secs(30))
            .expect("store");

        let err = store
            .query(Duration::from_secs(60))
            .await
            .expect_err("should be rejected");
        match err {
            StoreError::Rejected { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "service unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_query_unreachable_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let store = InfluxStore::new(
            "secondary",
            &store_config(&format!("http://{addr}")),
            Duration::from_secs(30),
        )
        .expect("store");

        let err = store
            .query(Duration::from_secs(60))
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::Connection(_)));
        assert_eq!(err.kind(), "connection");
    }
}
