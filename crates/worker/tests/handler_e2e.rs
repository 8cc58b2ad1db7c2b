//! End-to-end job runs against a mock rendering service and an
//! in-memory object store.

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use rooper_core::job::{JobInput, JobRequest, JobResponse};

use common::{
    build_handler, test_config, unreachable_url, video_entry, MemoryStore, MockComfy,
    PNG_DATA_URI, PUBLIC_BASE,
};

fn request(image: Option<&str>, duration: f64) -> JobRequest {
    JobRequest {
        id: Some("job-1".to_string()),
        input: JobInput {
            image: image.map(String::from),
            duration,
        },
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_publishes_video_and_returns_url() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let store = Arc::new(MemoryStore::default());
    let handler = build_handler(test_config(&mock.url, &[]), Arc::clone(&store));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert!(result.is_success(), "job failed: {:?}", result.error_detail);
    assert_eq!(
        result.artifact_local_path,
        Some(PathBuf::from("/comfyui/output/out.mp4"))
    );
    assert_eq!(
        result.into_response(),
        JobResponse::Success {
            status: "success",
            video_url: format!("{PUBLIC_BASE}/rooper_p1.mp4"),
        }
    );
    assert_eq!(
        *store.objects.lock().unwrap(),
        vec![("rooper_p1.mp4".to_string(), "video/mp4".to_string())]
    );
    // Reclamation runs once, after success.
    assert_eq!(mock.calls.frees.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn submitted_workflow_carries_bound_parameters() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(test_config(&mock.url, &[]), Arc::new(MemoryStore::default()));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 2.5), &CancellationToken::new())
        .await;
    assert!(result.is_success(), "job failed: {:?}", result.error_detail);

    let uploaded = mock.calls.uploads.lock().unwrap().clone();
    assert_eq!(uploaded.len(), 1);
    assert!(uploaded[0].starts_with("rooper_input_"));
    assert!(uploaded[0].ends_with(".png"));

    let prompt = mock.calls.last_prompt();
    assert_eq!(prompt["52"]["inputs"]["image"], json!(uploaded[0]));
    assert_eq!(prompt["548"]["inputs"]["start"], json!(2.5));
    assert_eq!(prompt["548"]["inputs"]["end"], json!(2.5));
    assert_eq!(prompt["57"]["inputs"]["steps"], json!(6));
    assert_eq!(prompt["58"]["inputs"]["cfg"], json!(1.0));
    assert_eq!(prompt["551"]["inputs"]["frame_rate"], json!(16));
    assert_eq!(prompt["50"]["inputs"]["height"], json!(640));
}

#[tokio::test]
async fn animated_image_output_keeps_its_extension() {
    let entry = json!({"outputs": {"551": {"gifs": [{"filename": "clip.webp", "subfolder": "runs"}]}}});
    let mock = MockComfy::finishing_with(entry).await;
    let store = Arc::new(MemoryStore::default());
    let handler = build_handler(test_config(&mock.url, &[]), Arc::clone(&store));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert_eq!(
        result.artifact_local_path,
        Some(PathBuf::from("/comfyui/output/runs/clip.webp"))
    );
    assert_eq!(
        result.artifact_remote_url.as_deref(),
        Some("https://cdn.example.com/rooper_p1.webp")
    );
    assert_eq!(store.objects.lock().unwrap()[0].1, "image/webp");
}

// ---------------------------------------------------------------------------
// Input errors: nothing touches the network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_image_fails_before_any_network_call() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(test_config(&mock.url, &[]), Arc::new(MemoryStore::default()));

    let result = handler
        .handle(request(None, 4.0), &CancellationToken::new())
        .await;

    assert_eq!(
        result.into_response(),
        JobResponse::Failure {
            error: "No image provided".to_string()
        }
    );
    assert_eq!(mock.calls.total(), 0);
}

#[tokio::test]
async fn undecodable_image_fails_before_any_network_call() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(test_config(&mock.url, &[]), Arc::new(MemoryStore::default()));

    let result = handler
        .handle(request(Some("data:image/png;base64,@@@"), 4.0), &CancellationToken::new())
        .await;

    assert!(!result.is_success());
    let detail = result.error_detail.unwrap_or_default();
    assert!(detail.starts_with("Image is not valid base64"), "got: {detail}");
    assert_eq!(mock.calls.total(), 0);
}

// ---------------------------------------------------------------------------
// Engine and storage failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_engine_reports_not_started() {
    let url = unreachable_url().await;
    let handler = build_handler(test_config(&url, &[]), Arc::new(MemoryStore::default()));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert_eq!(
        result.into_response(),
        JobResponse::Failure {
            error: "ComfyUI server did not start".to_string()
        }
    );
}

#[tokio::test]
async fn completion_without_media_reports_no_output() {
    let mock = MockComfy::finishing_with(json!({"outputs": {"9": {"images": [{"filename": "a.png"}]}}})).await;
    let store = Arc::new(MemoryStore::default());
    let handler = build_handler(test_config(&mock.url, &[]), Arc::clone(&store));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert_eq!(
        result.into_response(),
        JobResponse::Failure {
            error: "No output video found".to_string()
        }
    );
    assert!(store.objects.lock().unwrap().is_empty());
    assert_eq!(mock.calls.frees.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_upload_is_reported_without_reclamation() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(
        test_config(&mock.url, &[]),
        Arc::new(MemoryStore::rejecting("AccessDenied")),
    );

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert_eq!(
        result.error_detail.as_deref(),
        Some("Upload failed: Storage rejected upload: AccessDenied")
    );
    assert_eq!(mock.calls.frees.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_template_is_a_template_error() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let config = test_config(&mock.url, &[("WORKFLOW_TEMPLATE", "/nonexistent/workflow.json")]);
    let handler = build_handler(config, Arc::new(MemoryStore::default()));

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    let detail = result.error_detail.unwrap_or_default();
    assert!(detail.starts_with("Failed to prepare workflow"), "got: {detail}");
    assert!(mock.calls.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_job_returns_error_envelope() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(test_config(&mock.url, &[]), Arc::new(MemoryStore::default()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &cancel)
        .await;

    assert!(!result.is_success());
    let detail = result.error_detail.unwrap_or_default();
    assert!(detail.starts_with("Cancelled while waiting for prompt p1"), "got: {detail}");
}

#[tokio::test]
async fn handler_survives_failures_and_serves_next_job() {
    let mock = MockComfy::finishing_with(video_entry()).await;
    let handler = build_handler(test_config(&mock.url, &[]), Arc::new(MemoryStore::default()));

    let first = handler
        .handle(request(None, 4.0), &CancellationToken::new())
        .await;
    let second = handler
        .handle(request(Some(PNG_DATA_URI), 4.0), &CancellationToken::new())
        .await;

    assert!(!first.is_success());
    assert!(second.is_success(), "job failed: {:?}", second.error_detail);
}
