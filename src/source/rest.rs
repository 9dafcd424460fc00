use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Snapshot, SourceError, StatSource};
use crate::config::DatabaseConfig;
use crate::stats::decode::{self, ColumnIndex};
use crate::stats::{Granularity, StatKind};

/// Reads statistics views through the database REST API.
///
/// Each fetch runs one single-use read-only query at a fixed staleness on a
/// shared session. Concurrent fetches wait for a single session create; a
/// session that expired is dropped and recreated on the next fetch.
pub struct RestSource {
    http: reqwest::Client,
    endpoint: String,
    database: String,
    token: Option<String>,
    staleness: Duration,
    session: tokio::sync::Mutex<Option<String>>,
}

impl RestSource {
    /// Create a source for the configured database.
    pub fn new(cfg: &DatabaseConfig) -> Result<Self> {
        let token = match &cfg.credential_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading credential file {}", path.display()))?;
                let token = raw.trim().to_string();
                if token.is_empty() {
                    anyhow::bail!("credential file {} is empty", path.display());
                }
                Some(token)
            }
            None => None,
        };

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            database: cfg.database_path(),
            token,
            staleness: cfg.staleness,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// POST a JSON body and deserialize the JSON response.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        url: &str,
        body: &Value,
    ) -> Result<T, SourceError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|source| SourceError::Transport { operation, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|source| SourceError::Transport { operation, source })
    }

    /// Returns the shared session, creating one if needed. The lock is held
    /// across the create so one round of concurrent fetches makes one session.
    async fn session(&self) -> Result<String, SourceError> {
        let mut cached = self.session.lock().await;
        if let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }

        let url = format!("{}/v1/{}/sessions", self.endpoint, self.database);
        let created: SessionResponse =
            self.post_json("create session", &url, &json!({})).await?;
        debug!(session = %created.name, "created database session");

        *cached = Some(created.name.clone());
        Ok(created.name)
    }

    /// Forgets `name` if it is still the shared session.
    async fn invalidate(&self, name: &str) {
        let mut cached = self.session.lock().await;
        if cached.as_deref() == Some(name) {
            cached.take();
        }
    }

    /// Deletes the shared session, if one was created.
    pub async fn close(&self) -> Result<(), SourceError> {
        let Some(name) = self.session.lock().await.take() else {
            return Ok(());
        };

        let url = format!("{}/v1/{}", self.endpoint, name);
        let mut request = self.http.delete(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let operation = "delete session";
        let response = request
            .send()
            .await
            .map_err(|source| SourceError::Transport { operation, source })?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        debug!(session = %name, "deleted database session");
        Ok(())
    }

    fn request_body(
        &self,
        kind: StatKind,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> Value {
        let staleness = format!("{}s", self.staleness.as_secs_f64());
        json!({
            "sql": statement(kind, granularity),
            "params": { "since": since.to_rfc3339_opts(SecondsFormat::Micros, true) },
            "paramTypes": { "since": { "code": "TIMESTAMP" } },
            "transaction": {
                "singleUse": {
                    "readOnly": { "exactStaleness": staleness }
                }
            }
        })
    }
}

/// SQL selecting one kind's rows newer than `@since`, newest first.
pub fn statement(kind: StatKind, granularity: Granularity) -> String {
    format!(
        "SELECT {} FROM spanner_sys.{} WHERE interval_end > @since ORDER BY interval_end DESC",
        decode::columns(kind).join(", "),
        granularity.table(kind),
    )
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct SessionResponse {
    name: String,
}

#[derive(Deserialize)]
struct ResultSet {
    #[serde(default)]
    metadata: ResultSetMetadata,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetadata {
    #[serde(default)]
    row_type: RowType,
}

#[derive(Deserialize, Default)]
struct RowType {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct Field {
    #[serde(default)]
    name: String,
}

/// Decode a result set, skipping rows that do not decode.
fn decode_result_set(kind: StatKind, result: ResultSet) -> Result<Snapshot, SourceError> {
    let index = ColumnIndex::new(result.metadata.row_type.fields.iter().map(|f| &f.name));
    index.require(kind)?;

    let mut snapshot = Snapshot {
        rows: Vec::with_capacity(result.rows.len()),
        malformed: 0,
    };

    for row in &result.rows {
        match decode::decode_row(kind, &index, row) {
            Ok(stat) => snapshot.rows.push(stat),
            Err(e) => {
                warn!(%kind, error = %e, "skipping malformed row");
                snapshot.malformed += 1;
            }
        }
    }

    Ok(snapshot)
}

impl StatSource for RestSource {
    fn name(&self) -> &str {
        "rest"
    }

    async fn fetch(
        &self,
        kind: StatKind,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> Result<Snapshot, SourceError> {
        let session = self.session().await?;
        let url = format!("{}/v1/{}:executeSql", self.endpoint, session);
        let body = self.request_body(kind, granularity, since);

        let result: ResultSet = match self.post_json("execute sql", &url, &body).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, SourceError::Status { status: 404, .. }) {
                    self.invalidate(&session).await;
                }
                return Err(e);
            }
        };

        let snapshot = decode_result_set(kind, result)?;
        debug!(
            %kind,
            rows = snapshot.rows.len(),
            malformed = snapshot.malformed,
            "fetched statistics snapshot",
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use tokio::net::TcpListener;

    use super::*;
    use crate::stats::StatRow;

    #[derive(Default)]
    struct FakeApi {
        sessions_created: parking_lot::Mutex<u32>,
        queries: parking_lot::Mutex<Vec<Value>>,
        execute_status: parking_lot::Mutex<u16>,
        deleted: parking_lot::Mutex<Vec<String>>,
    }

    async fn handle(
        State(api): State<Arc<FakeApi>>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> axum::response::Response {
        let path = uri.path();
        if method == Method::DELETE {
            api.deleted.lock().push(path.to_string());
            return Json(json!({})).into_response();
        }

        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        if path.ends_with("/sessions") {
            *api.sessions_created.lock() += 1;
            // Slow enough that concurrent fetches overlap the create.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Json(json!({
                "name": "projects/p/instances/i/databases/d/sessions/s1"
            }))
            .into_response();
        }

        if path.ends_with(":executeSql") {
            api.queries.lock().push(body);
            let status = *api.execute_status.lock();
            if status != 200 {
                let code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return (code, "backend unavailable").into_response();
            }
            return Json(json!({
                "metadata": { "rowType": { "fields": [
                    { "name": "INTERVAL_END" },
                    { "name": "ROW_RANGE_START_KEY" },
                    { "name": "LOCK_WAIT_SECONDS" },
                    { "name": "SAMPLE_LOCK_REQUESTS" }
                ]}},
                "rows": [
                    ["2024-05-01T12:02:00Z", "YQ==", 1.5, [["Exclusive", "T.c"]]],
                    ["2024-05-01T12:02:00Z", "not base64!", 0.5, []],
                    ["2024-05-01T12:01:00Z", "Yg==", 0.25, []]
                ]
            }))
            .into_response();
        }

        StatusCode::NOT_FOUND.into_response()
    }

    async fn serve(api: Arc<FakeApi>) -> String {
        let app = Router::new().fallback(handle).with_state(api);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn source_for(endpoint: String) -> RestSource {
        let cfg = DatabaseConfig {
            project_id: "p".to_string(),
            instance_id: "i".to_string(),
            database_id: "d".to_string(),
            endpoint,
            ..Default::default()
        };
        RestSource::new(&cfg).expect("source builds")
    }

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_statement_text() {
        assert_eq!(
            statement(StatKind::Lock, Granularity::Hour),
            "SELECT interval_end, row_range_start_key, lock_wait_seconds, sample_lock_requests \
             FROM spanner_sys.lock_stats_top_hour WHERE interval_end > @since \
             ORDER BY interval_end DESC"
        );
    }

    #[test]
    fn test_missing_column_is_unusable() {
        let result = ResultSet {
            metadata: ResultSetMetadata {
                row_type: RowType {
                    fields: vec![Field {
                        name: "INTERVAL_END".to_string(),
                    }],
                },
            },
            rows: vec![vec![json!("2024-05-01T12:00:00Z")]],
        };
        let err = decode_result_set(StatKind::Query, result).expect_err("missing columns");
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn test_credential_file_is_read() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("token");
        std::fs::write(&path, "  secret-token\n").expect("write token");

        let cfg = DatabaseConfig {
            credential_file: Some(path),
            ..Default::default()
        };
        let source = RestSource::new(&cfg).expect("source builds");
        assert_eq!(source.token.as_deref(), Some("secret-token"));
    }

    #[test]
    fn test_missing_credential_file_fails() {
        let cfg = DatabaseConfig {
            credential_file: Some("/nonexistent/token".into()),
            ..Default::default()
        };
        assert!(RestSource::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_fetch_decodes_and_skips_malformed_rows() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 200;
        let source = source_for(serve(Arc::clone(&api)).await);

        let snapshot = source
            .fetch(StatKind::Lock, Granularity::Minute, since())
            .await
            .expect("fetch succeeds");

        assert_eq!(snapshot.rows.len(), 2);
        assert_eq!(snapshot.malformed, 1);
        let StatRow::Lock(first) = &snapshot.rows[0] else {
            panic!("expected lock row");
        };
        assert_eq!(first.row_range_start_key, b"a");
        assert_eq!(first.sample_lock_requests[0].lock_mode, "Exclusive");

        let queries = api.queries.lock();
        assert_eq!(queries.len(), 1);
        let sql = queries[0]["sql"].as_str().expect("sql is a string");
        assert!(sql.contains("spanner_sys.lock_stats_top_minute"));
        assert_eq!(queries[0]["params"]["since"], "2024-05-01T12:00:00.000000Z");
        assert_eq!(
            queries[0]["transaction"]["singleUse"]["readOnly"]["exactStaleness"],
            "60s"
        );
    }

    #[tokio::test]
    async fn test_session_is_reused() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 200;
        let source = source_for(serve(Arc::clone(&api)).await);

        for _ in 0..3 {
            source
                .fetch(StatKind::Lock, Granularity::Minute, since())
                .await
                .expect("fetch succeeds");
        }
        assert_eq!(*api.sessions_created.lock(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 503;
        let source = source_for(serve(Arc::clone(&api)).await);

        let err = source
            .fetch(StatKind::Lock, Granularity::Minute, since())
            .await
            .expect_err("fetch fails");
        assert!(matches!(err, SourceError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_expired_session_is_recreated() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 404;
        let source = source_for(serve(Arc::clone(&api)).await);

        assert!(source
            .fetch(StatKind::Lock, Granularity::Minute, since())
            .await
            .is_err());

        *api.execute_status.lock() = 200;
        source
            .fetch(StatKind::Lock, Granularity::Minute, since())
            .await
            .expect("fetch succeeds with a new session");
        assert_eq!(*api.sessions_created.lock(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_session() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 200;
        let source = source_for(serve(Arc::clone(&api)).await);

        let (a, b, c) = tokio::join!(
            source.fetch(StatKind::Query, Granularity::Minute, since()),
            source.fetch(StatKind::Transaction, Granularity::Minute, since()),
            source.fetch(StatKind::Lock, Granularity::Minute, since()),
        );
        // The fake only serves lock columns; the other kinds fail to decode.
        assert!(matches!(a, Err(SourceError::Decode(_))));
        assert!(matches!(b, Err(SourceError::Decode(_))));
        assert!(c.is_ok());
        assert_eq!(*api.sessions_created.lock(), 1);
        assert_eq!(api.queries.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_close_deletes_session_once() {
        let api = Arc::new(FakeApi::default());
        *api.execute_status.lock() = 200;
        let source = source_for(serve(Arc::clone(&api)).await);

        source.close().await.expect("close without session");
        assert!(api.deleted.lock().is_empty());

        source
            .fetch(StatKind::Lock, Granularity::Minute, since())
            .await
            .expect("fetch succeeds");
        source.close().await.expect("close succeeds");
        source.close().await.expect("second close is a no-op");

        assert_eq!(
            *api.deleted.lock(),
            vec!["/v1/projects/p/instances/i/databases/d/sessions/s1".to_string()]
        );
    }
}
