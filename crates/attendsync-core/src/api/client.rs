//! PostgREST client for the hosted attendance database.
//!
//! This module provides the `SupabaseClient` struct, the production
//! implementation of [`RemoteStore`]. Rows are exchanged in the remote
//! snake_case shape and converted to the local models here.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, warn};

use super::{RemoteError, RemoteStore, TimeWindow};
use crate::config::Config;
use crate::models::{
    attendance_from_value, student_from_value, AttendanceEntry, AttendanceKey, AttendanceRow,
    RowError, Student, StudentRow,
};

// ============================================================================
// Constants
// ============================================================================

/// Path of the REST interface below the project URL
const REST_PATH: &str = "rest/v1";

const STUDENTS_TABLE: &str = "students";
const ATTENDANCE_TABLE: &str = "attendance_records";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Rows requested per page; the hosted API caps responses at 1000 rows.
const PAGE_SIZE: usize = 1000;

/// Remote store client. Clone is cheap - reqwest::Client uses Arc internally.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    library: Option<String>,
}

impl SupabaseClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            library: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RemoteError> {
        let (url, key) = config.remote_credentials().ok_or_else(|| {
            RemoteError::NotConfigured("SUPABASE_URL and SUPABASE_ANON_KEY must be set".to_string())
        })?;
        Ok(Self::new(url, key)?.with_library(config.library.clone()))
    }

    /// Restrict reads to one library and tag inserts with it.
    pub fn with_library(mut self, library: Option<String>) -> Self {
        self.library = library;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, REST_PATH, table)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let invalid = |_| RemoteError::NotConfigured("API key is not a valid header value".to_string());
        let mut headers = header::HeaderMap::new();
        headers.insert("apikey", header::HeaderValue::from_str(&self.api_key).map_err(invalid)?);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(invalid)?,
        );
        Ok(headers)
    }

    fn tenant_filter(&self) -> Vec<(&'static str, String)> {
        match &self.library {
            Some(library) => vec![("library", format!("eq.{}", library))],
            None => Vec::new(),
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, RemoteError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    /// Send the request built by `build`, backing off while rate limited.
    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().headers(self.auth_headers()?).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(RemoteError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn decode_rows(response: Response, url: &str) -> Result<Vec<Value>, RemoteError> {
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse rows from {}: {}", url, e)))
    }

    /// Fetch every row matching `query`, one page at a time.
    async fn fetch_all(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table);
        let mut rows = Vec::new();
        let mut offset = 0;

        loop {
            let range = format!("{}-{}", offset, offset + PAGE_SIZE - 1);
            let response = self
                .send_with_retry(&url, || {
                    self.client
                        .get(&url)
                        .query(query)
                        .header("Range-Unit", "items")
                        .header(header::RANGE, range.as_str())
                })
                .await?;
            let page = Self::decode_rows(response, &url).await?;
            let received = page.len();
            rows.extend(page);
            debug!(table = table, offset = offset, received = received, "Fetched page");

            if received < PAGE_SIZE {
                return Ok(rows);
            }
            offset += PAGE_SIZE;
        }
    }

    async fn insert_row<T: serde::Serialize>(&self, table: &str, row: &T) -> Result<Value, RemoteError> {
        let url = self.table_url(table);
        let response = self
            .send_with_retry(&url, || {
                self.client
                    .post(&url)
                    .header("Prefer", "return=representation")
                    .json(row)
            })
            .await?;
        Self::decode_rows(response, &url)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse(format!("Insert into {} returned no rows", table)))
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn fetch_students(&self) -> Result<Vec<Student>, RemoteError> {
        let mut query = vec![("select", "*".to_string()), ("order", "id.asc".to_string())];
        query.extend(self.tenant_filter());
        let rows = self.fetch_all(STUDENTS_TABLE, &query).await?;
        Ok(convert_rows(rows, STUDENTS_TABLE, student_from_value))
    }

    async fn fetch_attendance(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AttendanceEntry>, RemoteError> {
        let mut query = vec![("select", "*".to_string()), ("order", "timestamp.desc".to_string())];
        query.extend(self.tenant_filter());
        if let Some(since) = since {
            query.push(("timestamp", format!("gte.{}", format_timestamp(since))));
        }
        let rows = self.fetch_all(ATTENDANCE_TABLE, &query).await?;
        Ok(convert_rows(rows, ATTENDANCE_TABLE, attendance_from_value))
    }

    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, RemoteError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("student_id", format!("eq.{}", student_id)),
            ("limit", "1".to_string()),
        ];
        query.extend(self.tenant_filter());
        let url = self.table_url(STUDENTS_TABLE);
        let response = self
            .send_with_retry(&url, || self.client.get(&url).query(&query))
            .await?;
        match Self::decode_rows(response, &url).await?.into_iter().next() {
            Some(row) => student_from_value(row)
                .map(Some)
                .map_err(|e| RemoteError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }

    async fn find_attendance(
        &self,
        key: &AttendanceKey,
    ) -> Result<Option<AttendanceEntry>, RemoteError> {
        let mut query = attendance_key_filters(key)?;
        query.push(("select", "*".to_string()));
        query.push(("limit", "1".to_string()));
        query.extend(self.tenant_filter());
        let url = self.table_url(ATTENDANCE_TABLE);
        let response = self
            .send_with_retry(&url, || self.client.get(&url).query(&query))
            .await?;
        match Self::decode_rows(response, &url).await?.into_iter().next() {
            Some(row) => attendance_from_value(row)
                .map(Some)
                .map_err(|e| RemoteError::InvalidResponse(e.to_string())),
            None => Ok(None),
        }
    }

    async fn insert_student(&self, student: &Student) -> Result<Student, RemoteError> {
        let mut row = StudentRow::for_insert(student);
        if row.library.is_none() {
            row.library = self.library.clone();
        }
        let stored = self.insert_row(STUDENTS_TABLE, &row).await?;
        student_from_value(stored).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn insert_attendance(
        &self,
        entry: &AttendanceEntry,
    ) -> Result<AttendanceEntry, RemoteError> {
        let mut row = AttendanceRow::for_insert(entry);
        if row.library.is_none() {
            row.library = self.library.clone();
        }
        let stored = self.insert_row(ATTENDANCE_TABLE, &row).await?;
        attendance_from_value(stored).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn count_attendance(&self, window: Option<TimeWindow>) -> Result<u64, RemoteError> {
        let mut query = vec![("select", "id".to_string()), ("limit", "1".to_string())];
        query.extend(self.tenant_filter());
        if let Some((start, end)) = window {
            query.push(("timestamp", format!("gte.{}", format_timestamp(start))));
            query.push(("timestamp", format!("lt.{}", format_timestamp(end))));
        }
        let url = self.table_url(ATTENDANCE_TABLE);
        let response = self
            .send_with_retry(&url, || {
                self.client.get(&url).query(&query).header("Prefer", "count=exact")
            })
            .await?;
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::InvalidResponse("Count response missing Content-Range".to_string()))?;
        parse_content_range_total(content_range).ok_or_else(|| {
            RemoteError::InvalidResponse(format!("Unparseable Content-Range: {}", content_range))
        })
    }
}

/// Convert rows, skipping (and logging) the ones that do not map.
fn convert_rows<T>(
    rows: Vec<Value>,
    table: &str,
    convert: impl Fn(Value) -> Result<T, RowError>,
) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match convert(row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(table = table, error = %e, "Skipping malformed remote row");
                None
            }
        })
        .collect()
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Filters matching an attendance row by natural key. The timestamp is
/// matched over its whole millisecond.
fn attendance_key_filters(key: &AttendanceKey) -> Result<Vec<(&'static str, String)>, RemoteError> {
    let start = DateTime::<Utc>::from_timestamp_millis(key.timestamp_millis).ok_or_else(|| {
        RemoteError::InvalidResponse(format!("Timestamp out of range: {}", key.timestamp_millis))
    })?;
    let end = start + chrono::Duration::milliseconds(1);
    Ok(vec![
        ("student_id", format!("eq.{}", key.student_id)),
        ("type", format!("eq.{}", key.kind.as_str())),
        ("timestamp", format!("gte.{}", format_timestamp(start))),
        ("timestamp", format!("lt.{}", format_timestamp(end))),
    ])
}

/// Total from a `Content-Range` header such as `0-0/42` or `*/0`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceType;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_attendance_key_filters_cover_one_millisecond() {
        let key = AttendanceKey {
            student_id: "S100".to_string(),
            timestamp_millis: 1_704_096_000_000,
            kind: AttendanceType::CheckIn,
        };
        let filters = attendance_key_filters(&key).unwrap();
        assert_eq!(filters[0], ("student_id", "eq.S100".to_string()));
        assert_eq!(filters[1], ("type", "eq.check-in".to_string()));
        assert_eq!(filters[2], ("timestamp", "gte.2024-01-01T08:00:00.000000Z".to_string()));
        assert_eq!(filters[3], ("timestamp", "lt.2024-01-01T08:00:00.001000Z".to_string()));
    }

    #[test]
    fn test_convert_rows_skips_malformed() {
        let rows = vec![
            json!({"id": "s1", "student_id": "S1", "name": "Jane"}),
            json!({"id": "s2", "name": "No code"}),
            json!("not an object"),
        ];
        let students = convert_rows(rows, STUDENTS_TABLE, student_from_value);
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].id, "s1");
    }

    #[test]
    fn test_client_urls_and_tenant_filter() {
        let client = SupabaseClient::new("https://demo.supabase.co/", "anon")
            .unwrap()
            .with_library(Some("annex".to_string()));
        assert_eq!(client.table_url(ATTENDANCE_TABLE), "https://demo.supabase.co/rest/v1/attendance_records");
        assert_eq!(client.tenant_filter(), vec![("library", "eq.annex".to_string())]);
        let headers = client.auth_headers().unwrap();
        assert_eq!(headers.get("apikey").unwrap().to_str().unwrap(), "anon");
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap().to_str().unwrap(), "Bearer anon");
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = Config::default();
        assert!(matches!(
            SupabaseClient::from_config(&config),
            Err(RemoteError::NotConfigured(_))
        ));
    }

    /// One canned HTTP response.
    struct Reply {
        status: &'static str,
        headers: Vec<(&'static str, String)>,
        body: String,
    }

    impl Reply {
        fn json(status: &'static str, body: Value) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }
        }

        fn header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.push((name, value.to_string()));
            self
        }
    }

    /// Answer one connection per reply, in order, and hand back the raw
    /// requests that were received.
    async fn serve(replies: Vec<Reply>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let mut response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
                    reply.status,
                    reply.body.len()
                );
                for (name, value) in &reply.headers {
                    response.push_str(&format!("{}: {}\r\n", name, value));
                }
                response.push_str("\r\n");
                response.push_str(&reply.body);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (format!("http://{}", addr), handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + length {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    fn has_header(request: &str, line: &str) -> bool {
        request.to_ascii_lowercase().contains(&format!("\r\n{}\r\n", line.to_ascii_lowercase()))
    }

    fn student_rows(range: std::ops::Range<usize>) -> Value {
        Value::Array(
            range
                .map(|i| json!({"id": format!("s{}", i), "student_id": format!("S{}", i), "name": "N"}))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_rate_limited_request_is_retried() {
        let (base, server) = serve(vec![
            Reply::json("429 Too Many Requests", json!({"message": "slow down"})),
            Reply::json("200 OK", student_rows(0..1)),
        ])
        .await;
        let client = SupabaseClient::new(&base, "anon").unwrap();

        let started = Instant::now();
        let students = client.fetch_students().await.unwrap();
        assert_eq!(students.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(INITIAL_BACKOFF_MS));

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].lines().next(), requests[1].lines().next());
        assert!(has_header(&requests[1], "apikey: anon"));
        assert!(has_header(&requests[1], "authorization: Bearer anon"));
    }

    #[tokio::test]
    async fn test_reads_follow_pages_until_a_short_one() {
        let (base, server) = serve(vec![
            Reply::json("200 OK", student_rows(0..PAGE_SIZE)),
            Reply::json("200 OK", student_rows(PAGE_SIZE..PAGE_SIZE + 1)),
        ])
        .await;
        let client = SupabaseClient::new(&base, "anon")
            .unwrap()
            .with_library(Some("annex".to_string()));

        let students = client.fetch_students().await.unwrap();
        assert_eq!(students.len(), PAGE_SIZE + 1);
        assert_eq!(students[PAGE_SIZE].student_id, format!("S{}", PAGE_SIZE));

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        let request_line = requests[0].lines().next().unwrap();
        assert!(request_line.starts_with("GET /rest/v1/students?"));
        assert!(request_line.contains("order=id.asc"));
        assert!(request_line.contains("library=eq.annex"));
        assert!(has_header(&requests[0], "range-unit: items"));
        assert!(has_header(&requests[0], "range: 0-999"));
        assert!(has_header(&requests[1], "range: 1000-1999"));
    }

    #[tokio::test]
    async fn test_count_reads_content_range_total() {
        let (base, server) = serve(vec![
            Reply::json("206 Partial Content", json!([{"id": "r1"}])).header("content-range", "0-0/42"),
        ])
        .await;
        let client = SupabaseClient::new(&base, "anon").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();

        let count = client
            .count_attendance(Some((start, start + chrono::Duration::days(1))))
            .await
            .unwrap();
        assert_eq!(count, 42);

        let requests = server.await.unwrap();
        let request_line = requests[0].lines().next().unwrap();
        assert!(request_line.starts_with("GET /rest/v1/attendance_records?"));
        assert!(request_line.contains("select=id"));
        assert!(request_line.contains("limit=1"));
        assert!(request_line.contains("timestamp=gte.2024-05-06T00"));
        assert!(request_line.contains("timestamp=lt.2024-05-07T00"));
        assert!(has_header(&requests[0], "prefer: count=exact"));
    }

    #[tokio::test]
    async fn test_count_without_content_range_is_invalid() {
        let (base, _server) = serve(vec![Reply::json("200 OK", json!([]))]).await;
        let client = SupabaseClient::new(&base, "anon").unwrap();
        assert!(matches!(
            client.count_attendance(None).await,
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_returns_stored_row() {
        let (base, server) = serve(vec![Reply::json(
            "201 Created",
            json!([{"id": "srv-9", "student_id": "S1", "name": "Jane", "library": "annex"}]),
        )])
        .await;
        let client = SupabaseClient::new(&base, "anon")
            .unwrap()
            .with_library(Some("annex".to_string()));

        let stored = client.insert_student(&Student::new("", "S1", "Jane")).await.unwrap();
        assert_eq!(stored.id, "srv-9");
        assert_eq!(stored.library.as_deref(), Some("annex"));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /rest/v1/students "));
        assert!(has_header(&requests[0], "prefer: return=representation"));
        let body: Value = serde_json::from_str(requests[0].split("\r\n\r\n").nth(1).unwrap()).unwrap();
        assert_eq!(body["student_id"], "S1");
        assert_eq!(body["library"], "annex");
    }

    #[tokio::test]
    async fn test_unauthorized_is_a_rejection_not_offline() {
        let (base, _server) = serve(vec![Reply::json("401 Unauthorized", json!({"message": "bad key"}))]).await;
        let client = SupabaseClient::new(&base, "wrong").unwrap();
        let err = client.fetch_attendance(None).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
        assert!(!err.is_offline());
    }

    #[tokio::test]
    async fn test_closed_port_is_offline() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = SupabaseClient::new(&format!("http://{}", addr), "anon").unwrap();
        let err = client.fetch_students().await.unwrap_err();
        assert!(err.is_offline(), "expected offline, got {:?}", err);
    }
}
