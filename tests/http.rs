//! Vendor clients against local mock APIs, and the crate's own HTTP API.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use clinical_parse::config::{AdobeConfig, Config, ReductoConfig};
use clinical_parse::error::VendorError;
use clinical_parse::facts::FactExtractor;
use clinical_parse::models::{Document, JobStatus};
use clinical_parse::orchestrator::{OrchestratorOptions, ParseOrchestrator};
use clinical_parse::{commands, migrate, server};
use clinical_parse::store::memory::InMemoryStore;
use clinical_parse::store::Store;
use clinical_parse::vendor::adobe::{AdobeClient, AdobeCredentials};
use clinical_parse::vendor::reducto::ReductoClient;
use clinical_parse::vendor::{
    ExtractVendor, JobResult, PollingVendor, ProviderAdapter, SubmitOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const API_KEY: &str = "test-key";

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", API_KEY))
        .unwrap_or(false)
}

// ─── Mock polling vendor ────────────────────────────────────────────

#[derive(Default)]
struct ReductoMock {
    base: Mutex<String>,
    uploads: AtomicUsize,
    parse_payloads: Mutex<Vec<Value>>,
    polls: AtomicUsize,
    large_fetched_with_auth: AtomicBool,
}

async fn mock_upload(State(mock): State<Arc<ReductoMock>>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    let multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);
    if !multipart || body.is_empty() {
        return (StatusCode::BAD_REQUEST, "expected multipart file").into_response();
    }
    mock.uploads.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "file_id": "reducto://mock-file.pdf" })).into_response()
}

async fn mock_parse(
    State(mock): State<Arc<ReductoMock>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    mock.parse_payloads.lock().unwrap().push(payload);
    Json(json!({ "job_id": "job-42" })).into_response()
}

async fn mock_job(
    State(mock): State<Arc<ReductoMock>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    if id != "job-42" {
        return (StatusCode::NOT_FOUND, "no such job").into_response();
    }
    let n = mock.polls.fetch_add(1, Ordering::SeqCst);
    let body = match n {
        0 => json!({ "status": "PENDING", "progress": 0.0 }),
        1 => json!({ "status": "IDLE", "progress": 60.0 }),
        _ => {
            let base = mock.base.lock().unwrap().clone();
            json!({
                "status": "SUCCESS",
                "result": { "type": "url", "url": format!("{}/large/result.json", base) },
                "usage": { "num_pages": 2, "credits": 1.0 },
                "duration": 1.5,
                "studio_link": "https://studio.example/job-42"
            })
        }
    };
    Json(body).into_response()
}

async fn mock_large(State(mock): State<Arc<ReductoMock>>, headers: HeaderMap) -> Json<Value> {
    if headers.contains_key(header::AUTHORIZATION) {
        mock.large_fetched_with_auth.store(true, Ordering::SeqCst);
    }
    Json(json!({ "chunks": [
        { "content": "BP: 118/76\nPulse: 64", "blocks": [
            { "type": "Text", "content": "BP: 118/76", "bbox": { "page": 1, "left": 0.1, "top": 0.1, "width": 0.4, "height": 0.03 }, "confidence": 0.93 }
        ] },
        { "content": "Allergies: Sulfa\nPlan: recheck in 2 weeks" }
    ] }))
}

async fn start_reducto_mock() -> (Arc<ReductoMock>, String) {
    let mock = Arc::new(ReductoMock::default());
    let app = Router::new()
        .route("/upload", post(mock_upload))
        .route("/parse", post(mock_parse))
        .route("/job/{id}", get(mock_job))
        .route("/large/result.json", get(mock_large))
        .with_state(mock.clone());
    let base = serve(app).await;
    *mock.base.lock().unwrap() = base.clone();
    (mock, base)
}

fn reducto_client(base: &str, key: Option<&str>) -> ReductoClient {
    let config = ReductoConfig {
        base_url: base.to_string(),
        ..ReductoConfig::default()
    };
    ReductoClient::new(&config, key.map(str::to_string)).unwrap()
}

#[tokio::test]
async fn test_reducto_client_protocol() {
    let (mock, base) = start_reducto_mock().await;
    let client = reducto_client(&base, Some(API_KEY));

    let file_ref = client
        .upload(b"%PDF-1.4".to_vec(), "note.pdf", "application/pdf")
        .await
        .unwrap();
    assert_eq!(file_ref, "reducto://mock-file.pdf");

    let options = SubmitOptions {
        table_output_format: "html".to_string(),
        enhance_text: true,
        enhance_table: false,
    };
    let job_ref = client.submit(&file_ref, &options).await.unwrap();
    assert_eq!(job_ref, "job-42");
    let payload = mock.parse_payloads.lock().unwrap()[0].clone();
    assert_eq!(payload["file_id"], "reducto://mock-file.pdf");
    assert_eq!(payload["table_output_format"], "html");
    assert_eq!(payload["enhance_text"], true);

    let first = client.poll(&job_ref).await.unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    let second = client.poll(&job_ref).await.unwrap();
    assert_eq!(second.status, JobStatus::Running);
    assert_eq!(second.progress, Some(60.0));

    let done = client.poll(&job_ref).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.metadata.num_pages, Some(2));
    assert_eq!(done.metadata.studio_link.as_deref(), Some("https://studio.example/job-42"));
    let url = match done.result {
        Some(JobResult::Url(url)) => url,
        other => panic!("expected url result, got {:?}", other),
    };

    let large = client.fetch_large(&url).await.unwrap();
    assert_eq!(large["chunks"].as_array().unwrap().len(), 2);
    assert!(!mock.large_fetched_with_auth.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_reducto_rejected_key_is_transport_error() {
    let (_mock, base) = start_reducto_mock().await;
    let client = reducto_client(&base, Some("wrong"));

    let err = client.submit("reducto://x.pdf", &SubmitOptions::default()).await.unwrap_err();
    match &err {
        VendorError::Api { status, message } => {
            assert_eq!(*status, 401);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected api error, got {:?}", other),
    }
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_reducto_without_key_fails_before_request() {
    let (mock, base) = start_reducto_mock().await;
    let client = reducto_client(&base, None);

    let err = client.upload(vec![1], "a.pdf", "application/pdf").await.unwrap_err();
    assert!(matches!(err, VendorError::MissingCredentials(_)));
    assert_eq!(mock.uploads.load(Ordering::SeqCst), 0);
}

// ─── Mock extract vendor ────────────────────────────────────────────

#[derive(Default)]
struct AdobeMock {
    base: Mutex<String>,
    uploaded: Mutex<Vec<u8>>,
    status_checks: AtomicUsize,
}

async fn adobe_token() -> Json<Value> {
    Json(json!({ "access_token": "adobe-token", "token_type": "bearer", "expires_in": 86399 }))
}

async fn adobe_assets(State(mock): State<Arc<AdobeMock>>, headers: HeaderMap) -> Response {
    if headers.get("x-api-key").is_none() {
        return (StatusCode::FORBIDDEN, "missing api key").into_response();
    }
    let base = mock.base.lock().unwrap().clone();
    Json(json!({ "uploadUri": format!("{}/upload-target", base), "assetID": "asset-1" })).into_response()
}

async fn adobe_put(State(mock): State<Arc<AdobeMock>>, body: Bytes) -> StatusCode {
    *mock.uploaded.lock().unwrap() = body.to_vec();
    StatusCode::OK
}

async fn adobe_extract(State(mock): State<Arc<AdobeMock>>, Json(body): Json<Value>) -> Response {
    if body["assetID"] != "asset-1" {
        return (StatusCode::BAD_REQUEST, "unknown asset").into_response();
    }
    let base = mock.base.lock().unwrap().clone();
    (
        StatusCode::CREATED,
        [(header::LOCATION, format!("{}/status/1", base))],
    )
        .into_response()
}

async fn adobe_status(State(mock): State<Arc<AdobeMock>>) -> Json<Value> {
    let n = mock.status_checks.fetch_add(1, Ordering::SeqCst);
    if n == 0 {
        return Json(json!({ "status": "in progress" }));
    }
    let base = mock.base.lock().unwrap().clone();
    Json(json!({
        "status": "done",
        "content": { "downloadUri": format!("{}/download/structured.json", base) }
    }))
}

async fn adobe_download() -> Json<Value> {
    Json(json!({ "elements": [
        { "Text": "Weight: 72 kg ", "Path": "//Document/P", "Page": 0, "Bounds": [50.0, 680.0, 250.0, 700.0] },
        { "Path": "//Document/Figure" },
        { "Text": "Medications: Atorvastatin", "Path": "//Document/P[2]", "Page": 1, "Bounds": [50.0, 640.0, 300.0, 660.0] }
    ] }))
}

async fn start_adobe_mock() -> (Arc<AdobeMock>, String) {
    let mock = Arc::new(AdobeMock::default());
    let app = Router::new()
        .route("/token", post(adobe_token))
        .route("/assets", post(adobe_assets))
        .route("/upload-target", put(adobe_put))
        .route("/operation/extractpdf", post(adobe_extract))
        .route("/status/1", get(adobe_status))
        .route("/download/structured.json", get(adobe_download))
        .with_state(mock.clone());
    let base = serve(app).await;
    *mock.base.lock().unwrap() = base.clone();
    (mock, base)
}

fn adobe_client(base: &str) -> AdobeClient {
    let config = AdobeConfig {
        base_url: base.to_string(),
        ..AdobeConfig::default()
    };
    let credentials = AdobeCredentials {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
    };
    AdobeClient::new(&config, Some(credentials))
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_adobe_client_extract_flow() {
    let (mock, base) = start_adobe_mock().await;
    let client = adobe_client(&base);

    let result = client
        .extract(b"%PDF-1.7 body".to_vec(), "application/pdf")
        .await
        .unwrap();

    assert_eq!(result["elements"].as_array().unwrap().len(), 3);
    assert_eq!(*mock.uploaded.lock().unwrap(), b"%PDF-1.7 body".to_vec());
    assert_eq!(mock.status_checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_adobe_pipeline_normalizes_elements() {
    let (_mock, base) = start_adobe_mock().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let doc = seed_document(store.as_ref(), &dir).await;

    let orchestrator = ParseOrchestrator::new(
        store.clone(),
        ProviderAdapter::Extract(Arc::new(adobe_client(&base))),
        OrchestratorOptions::default(),
    );
    let outcome = orchestrator.request_parse(&doc.id).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);

    let view = orchestrator.get_normalized_result(&doc.id).await.unwrap();
    assert_eq!(view.chunks.len(), 1);
    assert_eq!(view.chunks[0].content, "Weight: 72 kg\nMedications: Atorvastatin\n");
    let indices: Vec<i64> = view.blocks.iter().map(|b| b.block_index).collect();
    assert_eq!(indices, vec![0, 2]);
    assert_eq!(view.blocks[1].bbox.page, 2);
    assert_eq!(view.blocks[1].bbox.top, 660.0);
    assert_eq!(view.blocks[1].bbox.height, 20.0);

    let facts = orchestrator.list_facts(&doc.id).await.unwrap();
    let values: Vec<&str> = facts.iter().map(|f| f.value.as_str()).collect();
    assert_eq!(values, vec!["72 kg", "Atorvastatin"]);
}

// ─── Crate HTTP API ─────────────────────────────────────────────────

async fn seed_document(store: &dyn Store, dir: &TempDir) -> Document {
    let path = dir.path().join("visit.pdf");
    std::fs::write(&path, b"%PDF-1.4 visit").unwrap();
    let doc = Document::new_upload("patient-9", path.to_str().unwrap(), "application/pdf");
    store.insert_document(&doc).await.unwrap();
    doc
}

#[tokio::test]
async fn test_api_drives_parse_to_completion() {
    let (mock, reducto_base) = start_reducto_mock().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let doc = seed_document(store.as_ref(), &dir).await;

    let orchestrator = ParseOrchestrator::new(
        store.clone(),
        ProviderAdapter::Polling {
            vendor: Arc::new(reducto_client(&reducto_base, Some(API_KEY))),
            options: SubmitOptions::default(),
        },
        OrchestratorOptions {
            poll_interval: Duration::from_millis(10),
            max_poll_attempts: 50,
            extractor: FactExtractor::new(),
        },
    );
    let api = serve(server::router(orchestrator)).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", api))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["vendor"], "reducto");

    let resp = client
        .post(format!("{}/documents/{}/parse", api, doc.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let started: Value = resp.json().await.unwrap();
    assert_eq!(started["already_running"], false);
    let job_id = started["job_id"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..300 {
        status = client
            .get(format!("{}/documents/{}/parse-status", api, doc.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["document_status"] == "PARSED" || status["document_status"] == "ERROR" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status["document_status"], "PARSED", "status: {}", status);
    assert_eq!(status["job"]["id"], job_id.as_str());
    assert_eq!(status["job"]["status"], "COMPLETED");
    assert_eq!(status["job"]["chunk_count"], 2);
    assert_eq!(status["job"]["block_count"], 1);
    assert_eq!(mock.uploads.load(Ordering::SeqCst), 1);

    let parsed: Value = client
        .get(format!("{}/documents/{}/parsed", api, doc.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(parsed["chunks"][1]["chunk_index"], 1);
    assert_eq!(parsed["blocks"][0]["type"], "Text");
    assert_eq!(parsed["blocks"][0]["bbox"]["page"], 1);

    // Facts are written just after the job completes.
    let mut facts = Value::Null;
    for _ in 0..100 {
        facts = client
            .get(format!("{}/documents/{}/facts", api, doc.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if facts["facts"].as_array().map(|f| f.len()) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let values: Vec<&str> = facts["facts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["value"].as_str().unwrap())
        .collect();
    assert_eq!(values, vec!["118/76", "64 bpm", "Sulfa"]);

    let mut active = Value::Null;
    for _ in 0..100 {
        active = client
            .get(format!("{}/parse-jobs/active", api))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if active["polls"].as_array().map(|p| p.is_empty()) == Some(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(active["polls"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_api_error_contract() {
    let store = Arc::new(InMemoryStore::new());
    let dir = TempDir::new().unwrap();
    let doc = seed_document(store.as_ref(), &dir).await;

    let orchestrator = ParseOrchestrator::new(
        store.clone(),
        ProviderAdapter::Polling {
            vendor: Arc::new(reducto_client("http://127.0.0.1:9", None)),
            options: SubmitOptions::default(),
        },
        OrchestratorOptions::default(),
    );
    let api = serve(server::router(orchestrator)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/documents/nope/parse", api))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"].as_str().unwrap().contains("nope"));

    let resp = client
        .get(format!("{}/documents/{}/parsed", api, doc.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/parse-jobs/unknown/cancel", api))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cancelled"], false);

    let docs: Value = client
        .get(format!("{}/documents", api))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(docs["documents"][0]["id"], doc.id.as_str());
    assert_eq!(docs["documents"][0]["status"], "UPLOADED");
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

#[tokio::test]
async fn test_run_server_over_sqlite() {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let mut config = Config::with_db_path(tmp.path().join("data/cparse.sqlite"));
    config.server.bind = format!("127.0.0.1:{}", port);
    migrate::run_migrations(&config).await.unwrap();

    let upload = tmp.path().join("referral.pdf");
    std::fs::write(&upload, b"%PDF-1.4 referral").unwrap();
    let orchestrator = commands::build_orchestrator(&config).await.unwrap();
    let doc = commands::register_document(orchestrator.store().as_ref(), &upload, "patient-3", None)
        .await
        .unwrap();
    assert_eq!(doc.mime_type, "application/pdf");

    let server_config = config.clone();
    let handle = tokio::spawn(async move {
        server::run_server(&server_config, orchestrator).await.ok();
    });
    wait_for_server(port).await;

    let client = reqwest::Client::new();
    let status: Value = client
        .get(format!("http://127.0.0.1:{}/documents/{}/parse-status", port, doc.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["document_status"], "UPLOADED");
    assert!(status["job"].is_null());

    let resp = client
        .get(format!("http://127.0.0.1:{}/documents/{}/facts", port, doc.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let facts: Value = resp.json().await.unwrap();
    assert!(facts["facts"].as_array().unwrap().is_empty());

    handle.abort();
}
