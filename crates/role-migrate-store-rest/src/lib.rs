use std::fmt::{Debug, Formatter};
use std::time::Duration;

use anyhow::{bail, Result};
use role_migrate_core::{MigrateError, UpsertRows, UpsertStore};

pub const SUPABASE_URL_ENV: &str = "SUPABASE_URL";
pub const SUPABASE_KEY_ENV: &str = "SUPABASE_KEY";
pub const SUPABASE_TIMEOUT_SECS_ENV: &str = "SUPABASE_TIMEOUT_SECS";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Merge on the conflict key and skip echoing rows back.
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";
const ERROR_BODY_LIMIT: usize = 500;

/// Endpoint and credential for the remote table API.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub url: String,
    pub key: String,
    pub timeout: Duration,
}

impl Debug for StoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StoreConfig {
    /// Read the store configuration from the process environment.
    ///
    /// # Errors
    /// Returns an error when the URL or key is missing or the URL is not http(s).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the store configuration through `lookup`, one call per variable.
    ///
    /// # Errors
    /// Returns an error when the URL or key is missing or the URL is not http(s).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup(SUPABASE_URL_ENV)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());
        let key = lookup(SUPABASE_KEY_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let (Some(url), Some(key)) = (url, key) else {
            bail!("{SUPABASE_URL_ENV} and {SUPABASE_KEY_ENV} must be set in environment variables");
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("{SUPABASE_URL_ENV} must be an http(s) URL, got {url}");
        }

        let timeout_secs = lookup(SUPABASE_TIMEOUT_SECS_ENV)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(DEFAULT_TIMEOUT_SECS, |value| value.clamp(1, 300));

        Ok(Self { url, key, timeout: Duration::from_secs(timeout_secs) })
    }
}

/// Check that `table` is safe to place in a URL path segment.
///
/// # Errors
/// Returns an error for empty names or names with characters outside `[A-Za-z0-9_]`.
pub fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty() {
        bail!("table name must not be empty");
    }
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("table name contains unsupported characters: {table}");
    }
    Ok(())
}

fn truncate_for_error(body: &str) -> String {
    let compact = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match compact.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &compact[..cut]),
        None => compact,
    }
}

/// Blocking client for a PostgREST-style table API.
///
/// One agent is held for the whole run; requests run strictly one at a time.
pub struct RestStore {
    agent: ureq::Agent,
    base_url: String,
    key: String,
}

impl RestStore {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { agent, base_url: config.url, key: config.key }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }
}

impl UpsertStore for RestStore {
    fn upsert(
        &mut self,
        table: &str,
        rows: UpsertRows<'_>,
        conflict_key: &str,
    ) -> Result<(), MigrateError> {
        validate_table_name(table).map_err(|err| MigrateError::WriteFailure(err.to_string()))?;

        let result = self
            .agent
            .post(&self.table_url(table))
            .query("on_conflict", conflict_key)
            .set("apikey", &self.key)
            .set("Authorization", &format!("Bearer {}", self.key))
            .set("Prefer", UPSERT_PREFER)
            .send_json(rows);

        match result {
            Ok(response) => {
                tracing::debug!(
                    "Upserted {} rows into {} (HTTP {})",
                    rows.len(),
                    table,
                    response.status()
                );
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(MigrateError::WriteFailure(format!(
                    "store returned HTTP {code}: {}",
                    truncate_for_error(&body)
                )))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(MigrateError::WriteFailure(format!("store request failed: {transport}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    use role_migrate_core::{normalize, NormalizedRecord, CONFLICT_KEY};
    use serde_json::{json, Value};

    use super::*;

    #[derive(Debug)]
    struct CapturedRequest {
        request_line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
        }

        fn json_body(&self) -> Value {
            serde_json::from_str(&self.body)
                .unwrap_or_else(|err| panic!("request body is not JSON: {err}\n{}", self.body))
        }
    }

    fn serve_one(stream: TcpStream, status: u16, body: &str) -> CapturedRequest {
        let mut reader = BufReader::new(
            stream.try_clone().unwrap_or_else(|err| panic!("failed to clone stream: {err}")),
        );

        let mut request_line = String::new();
        let _ = reader.read_line(&mut request_line);
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some((key, value)) = trimmed.split_once(':') {
                headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        let length = headers
            .iter()
            .find(|(key, _)| key == "content-length")
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut payload = vec![0_u8; length];
        let _ = reader.read_exact(&mut payload);

        let response = format!(
            "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = stream;
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();

        CapturedRequest {
            request_line: request_line.trim_end().to_string(),
            headers,
            body: String::from_utf8_lossy(&payload).into_owned(),
        }
    }

    /// Serve one scripted response per connection, then hand back what was received.
    fn spawn_mock_store(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, JoinHandle<Vec<CapturedRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind mock store: {err}"));
        let addr =
            listener.local_addr().unwrap_or_else(|err| panic!("mock store has no address: {err}"));

        let handle = thread::spawn(move || {
            let mut captured = Vec::new();
            for (status, body) in responses {
                let Ok((stream, _)) = listener.accept() else {
                    break;
                };
                captured.push(serve_one(stream, status, body));
            }
            captured
        });

        (format!("http://{addr}"), handle)
    }

    fn join(handle: JoinHandle<Vec<CapturedRequest>>) -> Vec<CapturedRequest> {
        handle.join().unwrap_or_else(|_| panic!("mock store thread panicked"))
    }

    fn test_store(url: String) -> RestStore {
        RestStore::new(StoreConfig {
            url,
            key: "test-key".to_string(),
            timeout: Duration::from_secs(5),
        })
    }

    fn record(role_id: &str) -> NormalizedRecord {
        normalize(&json!({ "data": { "name": "Fixture", "extensions": { "role_id": role_id } } }))
            .unwrap_or_else(|err| panic!("fixture should normalize: {err}"))
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let owned = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<Vec<_>>();
        move |name: &str| owned.iter().find(|(key, _)| key == name).map(|(_, value)| value.clone())
    }

    // Test IDs: TREST-001
    #[test]
    fn batch_upsert_posts_array_with_merge_headers() {
        let (url, handle) = spawn_mock_store(vec![(201, "")]);
        let mut store = test_store(url);
        let rows = vec![record("a"), record("b")];

        let result = store.upsert("role_data", UpsertRows::Many(&rows), CONFLICT_KEY);
        assert_eq!(result, Ok(()));

        let captured = join(handle);
        assert_eq!(captured.len(), 1);
        let request = &captured[0];
        assert_eq!(request.request_line, "POST /rest/v1/role_data?on_conflict=role_id HTTP/1.1");
        assert_eq!(request.header("apikey"), Some("test-key"));
        assert_eq!(request.header("authorization"), Some("Bearer test-key"));
        assert_eq!(request.header("prefer"), Some(UPSERT_PREFER));
        assert!(request.header("content-type").is_some_and(|value| value.contains("json")));

        let body = request.json_body();
        let ids = body
            .as_array()
            .map(|rows| rows.iter().map(|row| row["role_id"].clone()).collect::<Vec<_>>());
        assert_eq!(ids, Some(vec![json!("a"), json!("b")]));
    }

    // Test IDs: TREST-002
    #[test]
    fn single_upsert_posts_one_object() {
        let (url, handle) = spawn_mock_store(vec![(201, "")]);
        let mut store = test_store(url);
        let row = record("solo");

        assert_eq!(store.upsert("role_data", UpsertRows::One(&row), CONFLICT_KEY), Ok(()));

        let captured = join(handle);
        let body = captured[0].json_body();
        assert_eq!(body["role_id"], json!("solo"));
        assert_eq!(body["name"], json!("Fixture"));
        assert_eq!(body["tags"], Value::Null);
    }

    // Test IDs: TREST-003
    #[test]
    fn http_errors_become_write_failures_with_status_and_body() {
        let (url, handle) = spawn_mock_store(vec![(
            400,
            "{\"code\":\"22P02\",\"message\":\"invalid input syntax\"}",
        )]);
        let mut store = test_store(url);
        let row = record("bad");

        let err = match store.upsert("role_data", UpsertRows::One(&row), CONFLICT_KEY) {
            Err(MigrateError::WriteFailure(message)) => message,
            other => panic!("expected write failure, got {other:?}"),
        };
        assert!(err.contains("HTTP 400"), "unexpected message: {err}");
        assert!(err.contains("invalid input syntax"), "unexpected message: {err}");
        join(handle);
    }

    // Test IDs: TREST-004
    #[test]
    fn unreachable_store_becomes_write_failure() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .unwrap_or_else(|err| panic!("failed to bind probe listener: {err}"));
        let addr =
            listener.local_addr().unwrap_or_else(|err| panic!("probe has no address: {err}"));
        drop(listener);

        let mut store = test_store(format!("http://{addr}"));
        let row = record("offline");
        let result = store.upsert("role_data", UpsertRows::One(&row), CONFLICT_KEY);
        assert!(
            matches!(
                &result,
                Err(MigrateError::WriteFailure(message)) if message.starts_with("store request failed")
            ),
            "unexpected result: {result:?}"
        );
    }

    // Test IDs: TREST-005
    #[test]
    fn invalid_table_names_are_rejected_without_a_request() {
        let mut store = test_store("http://127.0.0.1:9".to_string());
        let row = record("x");
        let result = store.upsert("role_data; drop", UpsertRows::One(&row), CONFLICT_KEY);
        assert!(matches!(
            result,
            Err(MigrateError::WriteFailure(message)) if message.contains("unsupported characters")
        ));

        assert!(validate_table_name("role_data_v2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("role-data").is_err());
    }

    // Test IDs: TCFG-001
    #[test]
    fn config_requires_url_and_key() {
        let missing_key = lookup_from(&[(SUPABASE_URL_ENV, "https://x.supabase.co")]);
        let err = match StoreConfig::from_lookup(missing_key) {
            Ok(config) => panic!("config without key should fail: {config:?}"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains(SUPABASE_KEY_ENV));

        let blank = StoreConfig::from_lookup(lookup_from(&[
            (SUPABASE_URL_ENV, "https://x.supabase.co"),
            (SUPABASE_KEY_ENV, "   "),
        ]));
        assert!(blank.is_err());

        let not_http = StoreConfig::from_lookup(lookup_from(&[
            (SUPABASE_URL_ENV, "x.supabase.co"),
            (SUPABASE_KEY_ENV, "secret"),
        ]));
        assert!(not_http.is_err());
    }

    // Test IDs: TCFG-002
    #[test]
    fn config_normalizes_values_and_clamps_timeout() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (SUPABASE_URL_ENV, " https://x.supabase.co/ "),
            (SUPABASE_KEY_ENV, " secret "),
            (SUPABASE_TIMEOUT_SECS_ENV, "9000"),
        ]))
        .unwrap_or_else(|err| panic!("config should load: {err}"));
        assert_eq!(config.url, "https://x.supabase.co");
        assert_eq!(config.key, "secret");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(!format!("{config:?}").contains("secret"));

        let defaulted = StoreConfig::from_lookup(lookup_from(&[
            (SUPABASE_URL_ENV, "http://localhost:54321"),
            (SUPABASE_KEY_ENV, "anon"),
            (SUPABASE_TIMEOUT_SECS_ENV, "soon"),
        ]))
        .unwrap_or_else(|err| panic!("config should load: {err}"));
        assert_eq!(defaulted.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    // Test IDs: TREST-006
    #[test]
    fn long_error_bodies_are_compacted_and_truncated() {
        let body = format!("line one\n\n  line two {}", "x".repeat(800));
        let message = truncate_for_error(&body);
        assert!(message.starts_with("line one line two "));
        assert!(message.ends_with("..."));
        assert_eq!(message.chars().count(), ERROR_BODY_LIMIT + 3);
    }
}
