#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use rooper_cloud::publisher::ResultPublisher;
use rooper_cloud::storage::{ObjectStore, StorageError};
use rooper_comfyui::api::ComfyUIApi;
use rooper_worker::config::WorkerConfig;
use rooper_worker::handler::JobHandler;

pub const PUBLIC_BASE: &str = "https://cdn.example.com";

/// Minimal PNG-typed data URI; decodes to three zero bytes.
pub const PNG_DATA_URI: &str = "data:image/png;base64,AAAA";

// ---------------------------------------------------------------------------
// Mock ComfyUI
// ---------------------------------------------------------------------------

/// Counters and captured payloads, shared with the running mock.
#[derive(Default)]
pub struct Calls {
    pub probes: AtomicU32,
    pub uploads: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<Value>>,
    pub history: AtomicU32,
    pub frees: AtomicU32,
}

impl Calls {
    pub fn total(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
            + self.uploads.lock().unwrap().len() as u32
            + self.prompts.lock().unwrap().len() as u32
            + self.history.load(Ordering::SeqCst)
            + self.frees.load(Ordering::SeqCst)
    }

    /// The workflow graph of the most recent submission.
    pub fn last_prompt(&self) -> Value {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .map(|body| body["prompt"].clone())
            .unwrap_or(Value::Null)
    }
}

#[derive(Clone)]
struct MockState {
    prompt_id: String,
    /// History entry served for `prompt_id` once `pending_polls` have passed.
    entry: Value,
    pending_polls: u32,
    calls: Arc<Calls>,
}

async fn root(State(state): State<MockState>) -> &'static str {
    state.calls.probes.fetch_add(1, Ordering::SeqCst);
    "ComfyUI"
}

async fn upload(State(state): State<MockState>, mut multipart: Multipart) -> Json<Value> {
    let mut name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            name = field.file_name().unwrap_or_default().to_string();
        }
    }
    state.calls.uploads.lock().unwrap().push(name.clone());
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

async fn prompt(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
    state.calls.prompts.lock().unwrap().push(body);
    Json(json!({"prompt_id": state.prompt_id, "number": 0, "node_errors": {}}))
}

async fn history(
    State(state): State<MockState>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    let call = state.calls.history.fetch_add(1, Ordering::SeqCst) + 1;
    if prompt_id == state.prompt_id && call > state.pending_polls {
        Json(json!({ prompt_id: state.entry }))
    } else {
        Json(json!({}))
    }
}

async fn free(State(state): State<MockState>) -> StatusCode {
    state.calls.frees.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// A running mock rendering service.
pub struct MockComfy {
    pub url: String,
    pub calls: Arc<Calls>,
}

impl MockComfy {
    /// Serve `entry` as the history of prompt `p1` after one empty poll.
    pub async fn finishing_with(entry: Value) -> Self {
        let calls = Arc::new(Calls::default());
        let state = MockState {
            prompt_id: "p1".to_string(),
            entry,
            pending_polls: 1,
            calls: Arc::clone(&calls),
        };

        let router = Router::new()
            .route("/", get(root))
            .route("/upload/image", post(upload))
            .route("/prompt", post(prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/free", post(free))
            .route("/queue", post(|| async { StatusCode::OK }))
            .route("/interrupt", post(|| async { StatusCode::OK }))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            calls,
        }
    }
}

pub fn video_entry() -> Value {
    json!({"outputs": {"551": {"videos": [{"filename": "out.mp4"}]}}})
}

/// Address nothing listens on.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// In-memory object store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    /// `(key, content_type)` of every accepted upload.
    pub objects: Mutex<Vec<(String, String)>>,
    /// When set, every upload is rejected with this message.
    pub reject_with: Option<String>,
}

impl MemoryStore {
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject_with: Some(message.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_file(
        &self,
        _local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if let Some(message) = &self.reject_with {
            return Err(StorageError::Rejected(message.clone()));
        }
        self.objects
            .lock()
            .unwrap()
            .push((key.to_string(), content_type.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker wiring
// ---------------------------------------------------------------------------

pub fn template_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/../../workflows/wan_i2v_api.json").to_string()
}

/// Worker configuration pointed at `comfyui_url` with fast timings.
pub fn test_config(comfyui_url: &str, overrides: &[(&str, &str)]) -> WorkerConfig {
    let mut env: HashMap<String, String> = HashMap::from([
        ("COMFYUI_URL".to_string(), comfyui_url.to_string()),
        ("COMFYUI_OUTPUT_DIR".to_string(), "/comfyui/output".to_string()),
        ("WORKFLOW_TEMPLATE".to_string(), template_path()),
        ("READINESS_INTERVAL_MS".to_string(), "1".to_string()),
        ("POLL_INTERVAL_MS".to_string(), "5".to_string()),
        ("POLL_TIMEOUT_SECS".to_string(), "10".to_string()),
        ("BUCKET_PUBLIC_URL".to_string(), PUBLIC_BASE.to_string()),
        ("UPLOAD_MAX_ATTEMPTS".to_string(), "1".to_string()),
    ]);
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    WorkerConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
}

pub fn build_handler(config: WorkerConfig, store: Arc<MemoryStore>) -> JobHandler {
    let publisher = ResultPublisher::new(
        store,
        config.addressing.clone(),
        config.upload_retry.clone(),
    );
    let api = ComfyUIApi::new(config.comfyui_url.clone());
    JobHandler::new(Arc::new(config), api, publisher)
}
