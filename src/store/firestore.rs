//! Google Cloud Firestore backend over the REST v1 API.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::{ServiceAccountKey, TokenSource};
use super::{DocumentPath, DocumentStore, StoreError};
use crate::config::FirestoreConfig;
use crate::report::Report;

/// Token accepted by the Firestore emulator for privileged access.
const EMULATOR_TOKEN: &str = "owner";

enum Auth {
    ServiceAccount(TokenSource),
    Emulator,
}

/// Firestore document store.
///
/// `set` issues a PATCH without an update mask, which replaces the whole
/// document and creates it when missing.
pub struct FirestoreStore {
    client: reqwest::Client,
    documents_url: Url,
    project_id: String,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl FirestoreStore {
    /// Build the client from configuration. Credentials are read here, so a
    /// missing or malformed key file fails startup.
    pub fn from_config(cfg: &FirestoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("building HTTP client")?;

        let (endpoint, project_id, auth) = if cfg.emulator_host.is_empty() {
            let key = ServiceAccountKey::load(&cfg.credentials_path)?;
            let project_id = if cfg.project_id.is_empty() {
                key.project_id.clone()
            } else {
                cfg.project_id.clone()
            };
            let source = TokenSource::new(key, client.clone())?;
            tracing::info!(account = %source.client_email(), "loaded service account credentials");
            (
                cfg.endpoint.trim_end_matches('/').to_string(),
                project_id,
                Auth::ServiceAccount(source),
            )
        } else {
            (
                format!("http://{}", cfg.emulator_host),
                cfg.project_id.clone(),
                Auth::Emulator,
            )
        };

        if project_id.is_empty() {
            bail!("no Firestore project id configured or present in the credentials");
        }

        let documents_url = documents_url(&endpoint, &project_id, &cfg.database)?;

        tracing::info!(
            project = %project_id,
            database = %cfg.database,
            emulator = matches!(auth, Auth::Emulator),
            "Firestore store configured",
        );

        Ok(Self {
            client,
            documents_url,
            project_id,
            auth,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn document_url(&self, path: &DocumentPath) -> Result<Url, StoreError> {
        let mut url = self.documents_url.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::Unavailable("endpoint cannot hold a path".to_string()))?
            .extend(path.as_str().split('/'));
        Ok(url)
    }

    async fn bearer_token(&self) -> Result<String, StoreError> {
        match &self.auth {
            Auth::ServiceAccount(source) => source.access_token().await,
            Auth::Emulator => Ok(EMULATOR_TOKEN.to_string()),
        }
    }
}

fn documents_url(endpoint: &str, project_id: &str, database: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).with_context(|| format!("parsing endpoint {endpoint}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("endpoint {endpoint} cannot hold a path"))?
        .pop_if_empty()
        .extend(["v1", "projects", project_id, "databases", database, "documents"]);
    Ok(url)
}

/// Firestore typed-value encoding of a report. Integers travel as strings.
pub fn encode_document(report: &Report) -> Value {
    json!({
        "fields": {
            "SystemId": { "stringValue": report.system_id },
            "Pid": { "integerValue": report.pid.to_string() },
            "Process": { "stringValue": report.process },
            "AllocKB": { "integerValue": report.alloc_kb.to_string() },
            "FreeKB": { "integerValue": report.free_kb.to_string() },
            "Ratio": { "doubleValue": report.ratio },
            "LeakSuspect": { "booleanValue": report.leak_suspect },
            "TimeStamp": { "integerValue": report.time_stamp.to_string() },
        }
    })
}

impl DocumentStore for FirestoreStore {
    fn name(&self) -> &str {
        "firestore"
    }

    async fn set(&self, path: &DocumentPath, report: &Report) -> Result<(), StoreError> {
        let url = self.document_url(path)?;
        let token = self.bearer_token().await?;
        let start = Instant::now();

        let resp = self
            .client
            .patch(url)
            .bearer_auth(token)
            .json(&encode_document(report))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            tracing::trace!(
                path = %path,
                elapsed = ?start.elapsed(),
                "document written",
            );
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(env) if !env.error.status.is_empty() => {
                format!("{}: {}", env.error.status, env.error.message)
            }
            Ok(env) => env.error.message,
            Err(_) => body,
        };

        Err(StoreError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;
    use crate::store::path::report_path;

    fn emulator_config() -> FirestoreConfig {
        FirestoreConfig {
            emulator_host: "localhost:8081".to_string(),
            project_id: "leak-demo".to_string(),
            request_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_document_types() {
        let report = Report {
            system_id: "host-a".to_string(),
            pid: 12,
            process: "java".to_string(),
            alloc_kb: 2048,
            free_kb: 0,
            ratio: -1.0,
            leak_suspect: true,
            time_stamp: 1_700_000_000,
        };

        let doc = encode_document(&report);
        let fields = &doc["fields"];
        assert_eq!(fields["SystemId"]["stringValue"], "host-a");
        assert_eq!(fields["Pid"]["integerValue"], "12");
        assert_eq!(fields["AllocKB"]["integerValue"], "2048");
        assert_eq!(fields["Ratio"]["doubleValue"], -1.0);
        assert_eq!(fields["LeakSuspect"]["booleanValue"], true);
        assert_eq!(fields["TimeStamp"]["integerValue"], "1700000000");
        assert_eq!(fields.as_object().map(|o| o.len()), Some(8));
    }

    #[test]
    fn test_document_url_layout() {
        let store = FirestoreStore::from_config(&emulator_config()).expect("store");
        assert_eq!(store.project_id(), "leak-demo");

        let report = Report::heartbeat("host-a", 7);
        let url = store
            .document_url(&report_path(&report).expect("path"))
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:8081/v1/projects/leak-demo/databases/(default)/documents/systems/host-a/reports/7-host-a-0"
        );
    }

    #[derive(Debug, Clone)]
    struct Captured {
        method: String,
        path: String,
        authorization: String,
        body: Value,
    }

    #[derive(Clone)]
    struct FakeEmulator {
        requests: Arc<Mutex<Vec<Captured>>>,
        status: StatusCode,
        reply: Value,
    }

    async fn record_request(
        State(emulator): State<FakeEmulator>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, Json<Value>) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        emulator.requests.lock().push(Captured {
            method: method.to_string(),
            path: uri.path().to_string(),
            authorization,
            body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        });
        (emulator.status, Json(emulator.reply.clone()))
    }

    /// Serve a fake emulator on loopback and return a store pointed at it.
    async fn store_against(status: StatusCode, reply: Value) -> (FirestoreStore, FakeEmulator) {
        let emulator = FakeEmulator {
            requests: Arc::new(Mutex::new(Vec::new())),
            status,
            reply,
        };
        let app = Router::new()
            .fallback(record_request)
            .with_state(emulator.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let cfg = FirestoreConfig {
            emulator_host: addr.to_string(),
            ..emulator_config()
        };
        (FirestoreStore::from_config(&cfg).expect("store"), emulator)
    }

    fn sample() -> Report {
        Report {
            system_id: "host-a".to_string(),
            pid: 77,
            process: "leaky".to_string(),
            alloc_kb: 600,
            free_kb: 0,
            ratio: -1.0,
            leak_suspect: true,
            time_stamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_set_patches_document_with_emulator_token() {
        let (store, emulator) = store_against(StatusCode::OK, json!({})).await;
        let report = sample();
        let path = report_path(&report).expect("path");

        store.set(&path, &report).await.expect("set");

        let requests = emulator.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.method, "PATCH");
        assert_eq!(
            req.path,
            "/v1/projects/leak-demo/databases/(default)/documents/systems/host-a/reports/1700000000-host-a-77"
        );
        assert_eq!(req.authorization, "Bearer owner");
        assert_eq!(req.body, encode_document(&report));
    }

    #[tokio::test]
    async fn test_set_maps_error_envelope_to_status() {
        let reply = json!({
            "error": {
                "code": 403,
                "message": "Missing or insufficient permissions.",
                "status": "PERMISSION_DENIED",
            }
        });
        let (store, _) = store_against(StatusCode::FORBIDDEN, reply).await;
        let report = sample();
        let path = report_path(&report).expect("path");

        match store.set(&path, &report).await {
            Err(StoreError::Status { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(
                    message,
                    "PERMISSION_DENIED: Missing or insufficient permissions."
                );
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_credentials_fail_startup() {
        let cfg = FirestoreConfig {
            credentials_path: "/nonexistent/serviceAccountKey.json".into(),
            ..Default::default()
        };
        assert!(FirestoreStore::from_config(&cfg).is_err());
    }
}
