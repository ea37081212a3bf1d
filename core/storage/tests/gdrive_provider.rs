//! Google Drive provider against an in-process fake of the Drive API and
//! the OAuth proxy.

mod common;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use siberian_common::settings::{provider_key, token_key};
use siberian_common::{Error, MemoryStore, SettingsStore, UploadMetadata};
use siberian_storage::gdrive::{ProxyPayload, TokenBundle};
use siberian_storage::{GDriveConfig, GDriveProvider, StorageProvider, SystemClock, TokenCache};

use common::{bearer, parse_content_range, query_map, serve, write_file, MIB};

const NAME: &str = "siberian-backup-full-2024-06-01-08-30-00.zip";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PROXY_KEY: [u8; 32] = [7; 32];
const PROXY_IV: [u8; 16] = [3; 16];

#[derive(Clone)]
struct FakeFile {
    id: String,
    name: String,
    mime_type: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct FakeDrive {
    base: Mutex<String>,
    valid_token: Mutex<String>,
    /// When set, the API refuses every token.
    reject_all: bool,
    /// Finish resumable uploads with an empty body.
    omit_final_id: bool,
    /// Answer 500 to this resumable chunk (1-based).
    fail_chunk: Option<usize>,
    chunks_received: Mutex<usize>,
    sessions_cancelled: Mutex<usize>,
    refresh_requests: Mutex<Vec<String>>,
    folders_created: Mutex<usize>,
    files: Mutex<Vec<FakeFile>>,
    session: Mutex<Option<(String, Vec<u8>)>>,
}

impl FakeDrive {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        !self.reject_all && bearer(headers).as_deref() == Some(self.valid_token.lock().unwrap().as_str())
    }

    fn add_file(&self, name: &str, mime_type: &str, data: Vec<u8>) -> String {
        let mut files = self.files.lock().unwrap();
        let id = format!("file-{}", files.len() + 1);
        files.push(FakeFile {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            data,
        });
        id
    }
}

fn resource(file: &FakeFile) -> Value {
    let mut value = json!({
        "id": file.id,
        "name": file.name,
        "mimeType": file.mime_type,
        "modifiedTime": "2024-06-01T08:31:00Z",
    });
    if file.mime_type != FOLDER_MIME {
        value["size"] = json!(file.data.len().to_string());
    }
    value
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"code": 401, "message": "Invalid Credentials"}})),
    )
        .into_response()
}

/// Text between `start` and the next `'`.
fn quoted_after<'a>(query: &'a str, start: &str) -> Option<&'a str> {
    let rest = &query[query.find(start)? + start.len()..];
    rest.split('\'').next()
}

async fn refresh(State(drive): State<Arc<FakeDrive>>, Json(body): Json<Value>) -> Response {
    let refresh_token = body["refresh_token"].as_str().unwrap().to_string();
    drive.refresh_requests.lock().unwrap().push(refresh_token);
    *drive.valid_token.lock().unwrap() = "fresh-token".to_string();

    let bundle = TokenBundle {
        access_token: "fresh-token".to_string(),
        refresh_token: Some("rotated-refresh".to_string()),
        email: None,
        expires_in: Some(3600),
    };
    Json(ProxyPayload::seal(&bundle, &PROXY_KEY, &PROXY_IV).unwrap()).into_response()
}

async fn list_files(State(drive): State<Arc<FakeDrive>>, uri: Uri, headers: HeaderMap) -> Response {
    if !drive.authorized(&headers) {
        return unauthorized();
    }
    let query = query_map(uri.query());
    let q = query["q"].as_str();
    let files = drive.files.lock().unwrap();

    let matching: Vec<Value> = files
        .iter()
        .filter(|f| {
            if q.contains(FOLDER_MIME) {
                f.mime_type == FOLDER_MIME && Some(f.name.as_str()) == quoted_after(q, "name = '")
            } else if let Some(name) = quoted_after(q, "name = '") {
                f.name == name && f.mime_type != FOLDER_MIME
            } else {
                f.mime_type != FOLDER_MIME
            }
        })
        .map(resource)
        .collect();
    Json(json!({ "files": matching })).into_response()
}

async fn create_folder(
    State(drive): State<Arc<FakeDrive>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !drive.authorized(&headers) {
        return unauthorized();
    }
    assert_eq!(body["mimeType"], FOLDER_MIME);
    *drive.folders_created.lock().unwrap() += 1;
    let id = drive.add_file(body["name"].as_str().unwrap(), FOLDER_MIME, Vec::new());
    let files = drive.files.lock().unwrap();
    let folder = files.iter().find(|f| f.id == id).unwrap();
    Json(resource(folder)).into_response()
}

async fn upload(
    State(drive): State<Arc<FakeDrive>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !drive.authorized(&headers) {
        return unauthorized();
    }
    let query = query_map(uri.query());
    match query["uploadType"].as_str() {
        "multipart" => {
            // --boundary / json part / --boundary / media part / --boundary--
            let text = body.to_vec();
            let sep = b"\r\n\r\n";
            let json_start = find(&text, sep, 0) + sep.len();
            let json_end = find(&text, b"\r\n--", json_start);
            let metadata: Value = serde_json::from_slice(&text[json_start..json_end]).unwrap();
            let media_start = find(&text, sep, json_end) + sep.len();
            let media_end = text.len() - b"\r\n--siberian_backup_boundary--".len();

            let name = metadata["name"].as_str().unwrap();
            let id = drive.add_file(name, "application/zip", text[media_start..media_end].to_vec());
            let files = drive.files.lock().unwrap();
            Json(resource(files.iter().find(|f| f.id == id).unwrap())).into_response()
        }
        "resumable" => {
            let metadata: Value = serde_json::from_slice(&body).unwrap();
            assert!(metadata["parents"][0].as_str().is_some());
            *drive.session.lock().unwrap() =
                Some((metadata["name"].as_str().unwrap().to_string(), Vec::new()));
            let location = format!("{}/upload-session/1", drive.base.lock().unwrap());
            ([(header::LOCATION, location)], StatusCode::OK).into_response()
        }
        other => panic!("unexpected uploadType {}", other),
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> usize {
    from + haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap()
}

async fn put_chunk(State(drive): State<Arc<FakeDrive>>, headers: HeaderMap, body: Bytes) -> Response {
    let chunk = {
        let mut received = drive.chunks_received.lock().unwrap();
        *received += 1;
        *received
    };
    if drive.fail_chunk == Some(chunk) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"code": 500, "message": "Backend Error"}})),
        )
            .into_response();
    }

    let range = headers[header::CONTENT_RANGE].to_str().unwrap();
    let (start, _, total) = parse_content_range(range);

    let mut session = drive.session.lock().unwrap();
    let (name, data) = session.as_mut().unwrap();
    assert_eq!(start, data.len() as u64);
    data.extend_from_slice(&body);
    if (data.len() as u64) < total {
        let ack = format!("bytes=0-{}", data.len() - 1);
        return ([(header::RANGE, ack)], StatusCode::PERMANENT_REDIRECT).into_response();
    }

    let id = drive.add_file(name, "application/zip", data.clone());
    if drive.omit_final_id {
        return StatusCode::OK.into_response();
    }
    let files = drive.files.lock().unwrap();
    Json(resource(files.iter().find(|f| f.id == id).unwrap())).into_response()
}

async fn cancel_session(State(drive): State<Arc<FakeDrive>>) -> StatusCode {
    *drive.sessions_cancelled.lock().unwrap() += 1;
    drive.session.lock().unwrap().take();
    StatusCode::from_u16(499).unwrap()
}

async fn file(
    State(drive): State<Arc<FakeDrive>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !drive.authorized(&headers) {
        return unauthorized();
    }
    let files = drive.files.lock().unwrap();
    match files.iter().find(|f| f.id == id) {
        Some(f) => f.data.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_file(
    State(drive): State<Arc<FakeDrive>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !drive.authorized(&headers) {
        return unauthorized();
    }
    let mut files = drive.files.lock().unwrap();
    let before = files.len();
    files.retain(|f| f.id != id);
    if files.len() < before {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn fake(fake: FakeDrive) -> (Arc<FakeDrive>, String) {
    let state = Arc::new(fake);
    let router = Router::new()
        .route("/proxy/refresh", post(refresh))
        .route("/drive/v3/files", get(list_files).post(create_folder))
        .route("/drive/v3/files/{id}", get(file).delete(delete_file))
        .route("/upload/drive/v3/files", post(upload))
        .route("/upload-session/1", put(put_chunk).delete(cancel_session))
        .with_state(state.clone());
    let base = serve(router).await;
    *state.base.lock().unwrap() = base.clone();
    (state, base)
}

fn config(base: &str) -> GDriveConfig {
    GDriveConfig {
        proxy_url: format!("{}/proxy", base),
        folder_name: "Siberian Backups".to_string(),
        refresh_token: Some("initial-refresh".to_string()),
        access_token: Some("stale-token".to_string()),
        token_expires_at: Some(Utc::now() + Duration::hours(1)),
        email: Some("owner@example.com".to_string()),
        api_base: base.to_string(),
    }
}

fn provider_with_store(config: GDriveConfig, store: Arc<MemoryStore>) -> GDriveProvider {
    store
        .set(&provider_key("gdrive"), serde_json::to_value(&config).unwrap())
        .unwrap();
    let cache = TokenCache::new(Arc::new(SystemClock)).persisted(store.clone(), token_key("gdrive"));
    GDriveProvider::with_token_cache(Some(config), cache, Some(store)).unwrap()
}

#[tokio::test]
async fn test_rejected_token_triggers_single_refresh() {
    let (drive, base) = fake(FakeDrive::default()).await;
    drive.add_file("Siberian Backups", FOLDER_MIME, Vec::new());
    drive.add_file(NAME, "application/zip", vec![1; 128]);
    let store = Arc::new(MemoryStore::new());
    let provider = provider_with_store(config(&base), store.clone());

    let files = provider.list("").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size, 128);
    assert_eq!(
        *drive.refresh_requests.lock().unwrap(),
        vec!["initial-refresh".to_string()]
    );

    // The refreshed token is cached and reused.
    provider.list("").await.unwrap();
    assert_eq!(drive.refresh_requests.lock().unwrap().len(), 1);

    let cached = store.get(&token_key("gdrive")).unwrap().unwrap();
    assert_eq!(cached["token"], "fresh-token");
    let stored = store.get(&provider_key("gdrive")).unwrap().unwrap();
    assert_eq!(stored["refresh_token"], "rotated-refresh");
}

#[tokio::test]
async fn test_second_rejection_is_auth_error() {
    let (drive, base) = fake(FakeDrive {
        reject_all: true,
        ..Default::default()
    })
    .await;
    let provider = GDriveProvider::new(Some(config(&base))).unwrap();

    let err = provider.list("").await.unwrap_err();
    assert!(err.is_auth(), "unexpected error: {}", err);
    assert_eq!(drive.refresh_requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_folder_created_once_and_listing_filtered() {
    let (drive, base) = fake(FakeDrive::default()).await;
    *drive.valid_token.lock().unwrap() = "stale-token".to_string();
    let provider = GDriveProvider::new(Some(config(&base))).unwrap();

    let temp = TempDir::new().unwrap();
    let (first, data) = write_file(temp.path(), NAME, 2048);
    let second_name = "siberian-backup-db-2024-06-02-08-30-00.zip";
    let (second, _) = write_file(temp.path(), second_name, 512);

    let result = provider
        .upload(&first, NAME, &UploadMetadata::default())
        .await
        .unwrap();
    assert!(result.remote_id.is_some());
    provider
        .upload(&second, second_name, &UploadMetadata::default())
        .await
        .unwrap();
    drive.add_file("notes.txt", "text/plain", vec![0; 3]);

    assert_eq!(*drive.folders_created.lock().unwrap(), 1);
    let names: Vec<String> = provider
        .list("")
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec![second_name.to_string(), NAME.to_string()]);

    let dest = temp.path().join("restored.zip");
    provider.download(NAME, &dest).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    provider.delete(NAME).await.unwrap();
    assert!(!provider.exists(NAME).await.unwrap());
    // Deleting again only warns.
    provider.delete(NAME).await.unwrap();
    assert!(drive.refresh_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resumable_upload_falls_back_to_name_lookup() {
    let (drive, base) = fake(FakeDrive {
        omit_final_id: true,
        ..Default::default()
    })
    .await;
    *drive.valid_token.lock().unwrap() = "stale-token".to_string();
    let provider = GDriveProvider::new(Some(config(&base)))
        .unwrap()
        .with_chunk_size(5 * MIB)
        .with_simple_limit(MIB as u64);

    let temp = TempDir::new().unwrap();
    let (src, data) = write_file(temp.path(), NAME, 6 * MIB);
    let result = provider
        .upload(&src, NAME, &UploadMetadata::default())
        .await
        .unwrap();

    let files = drive.files.lock().unwrap();
    let stored = files.iter().find(|f| f.name == NAME).unwrap();
    assert_eq!(result.remote_id.as_deref(), Some(stored.id.as_str()));
    assert_eq!(stored.data, data);
}

#[tokio::test]
async fn test_failed_chunk_cancels_session() {
    let (drive, base) = fake(FakeDrive {
        fail_chunk: Some(2),
        ..Default::default()
    })
    .await;
    *drive.valid_token.lock().unwrap() = "stale-token".to_string();
    drive.add_file("Siberian Backups", FOLDER_MIME, Vec::new());
    let provider = GDriveProvider::new(Some(config(&base)))
        .unwrap()
        .with_chunk_size(5 * MIB)
        .with_simple_limit(MIB as u64);

    let temp = TempDir::new().unwrap();
    let (src, _) = write_file(temp.path(), NAME, 12 * MIB);
    let err = provider
        .upload(&src, NAME, &UploadMetadata::default())
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Remote { status: 500, .. }),
        "unexpected error: {}",
        err
    );
    assert_eq!(*drive.chunks_received.lock().unwrap(), 2);
    assert_eq!(*drive.sessions_cancelled.lock().unwrap(), 1);
    assert!(drive.session.lock().unwrap().is_none());
    assert!(!drive.files.lock().unwrap().iter().any(|f| f.name == NAME));
}

#[tokio::test]
async fn test_configured_token_replaces_cached_one() {
    let (drive, base) = fake(FakeDrive::default()).await;
    *drive.valid_token.lock().unwrap() = "new-account-token".to_string();
    drive.add_file("Siberian Backups", FOLDER_MIME, Vec::new());
    drive.add_file(NAME, "application/zip", vec![1; 16]);

    let store = Arc::new(MemoryStore::new());
    store
        .set(
            &token_key("gdrive"),
            json!({
                "token": "old-account-token",
                "expires_at": Utc::now() + Duration::hours(1),
            }),
        )
        .unwrap();
    let mut config = config(&base);
    config.access_token = Some("new-account-token".to_string());

    let provider = provider_with_store(config, store.clone());
    assert_eq!(provider.list("").await.unwrap().len(), 1);

    assert!(drive.refresh_requests.lock().unwrap().is_empty());
    let cached = store.get(&token_key("gdrive")).unwrap().unwrap();
    assert_eq!(cached["token"], "new-account-token");
}
