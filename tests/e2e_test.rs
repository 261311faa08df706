//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL, Redis, and MinIO running (with migrations applied)
//! 2. API server running on the configured port
//! 3. At least one worker process running with a reachable inference backend
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use uuid::Uuid;

/// Smallest valid transparent PNG (1x1, RGBA).
const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_BUDGET: u32 = 90;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

#[derive(Debug, Deserialize)]
struct UploadAccepted {
    id: Uuid,
    status: String,
}

#[derive(Debug, Deserialize)]
struct TaskView {
    status: String,
    alt1: Option<String>,
    alt2: Option<String>,
    selected_index: Option<i32>,
    final_alt: Option<String>,
    last_error: Option<String>,
}

async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    context: &str,
) -> Result<UploadAccepted, Box<dyn std::error::Error>> {
    let form = reqwest::multipart::Form::new()
        .part(
            "image",
            reqwest::multipart::Part::bytes(PNG_1X1.to_vec())
                .file_name("pixel.png")
                .mime_str("image/png")?,
        )
        .text("context", context.to_string());

    let response = client
        .post(format!("{base_url}/tasks/upload"))
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;

    Ok(response.json().await?)
}

async fn wait_for_settlement(
    client: &reqwest::Client,
    base_url: &str,
    id: Uuid,
) -> Result<TaskView, Box<dyn std::error::Error>> {
    for _ in 0..POLL_BUDGET {
        let task: TaskView = client
            .get(format!("{base_url}/tasks/{id}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if task.status == "DONE" || task.status == "FAILED" {
            return Ok(task);
        }
        sleep(POLL_INTERVAL).await;
    }
    Err("task did not settle within the poll budget".into())
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base_url}/health"))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore]
async fn test_e2e_upload_generate_approve() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let accepted = upload_image(&client, &base_url, "a single pixel test image")
        .await
        .expect("upload failed");
    assert_eq!(accepted.status, "PENDING");
    println!("  uploaded, task id: {}", accepted.id);

    let task = wait_for_settlement(&client, &base_url, accepted.id)
        .await
        .expect("task never settled");

    if task.status == "FAILED" {
        // A degenerate backend is an environment problem, not a pipeline one.
        println!("  task failed: {:?}", task.last_error);
        return;
    }

    assert_eq!(task.status, "DONE");
    let alt1 = task.alt1.expect("alt1 missing on DONE task");
    let alt2 = task.alt2.expect("alt2 missing on DONE task");
    assert!(!alt1.is_empty());
    assert!(!alt2.is_empty());
    println!("  candidates: {alt1:?} / {alt2:?}");

    let approved: TaskView = client
        .patch(format!("{}/tasks/{}/approve", base_url, accepted.id))
        .json(&serde_json::json!({
            "final_alt": "",
            "selected_alt_index": 2,
            "is_approved": true,
        }))
        .send()
        .await
        .expect("approve request failed")
        .error_for_status()
        .expect("approve rejected")
        .json()
        .await
        .expect("approve response unreadable");

    assert_eq!(approved.selected_index, Some(2));
    assert_eq!(approved.final_alt.as_deref(), Some(alt2.as_str()));
}

#[tokio::test]
#[ignore]
async fn test_e2e_bulk_upload_reports_per_item_outcomes() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "images",
            reqwest::multipart::Part::bytes(PNG_1X1.to_vec())
                .file_name("a.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .part(
            "images",
            reqwest::multipart::Part::bytes(PNG_1X1.to_vec())
                .file_name("b.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .text("contexts", "first context")
        .text("contexts", "");

    let response = client
        .post(format!("{base_url}/tasks/bulk-upload"))
        .multipart(form)
        .send()
        .await
        .expect("bulk upload failed");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let body: serde_json::Value = response.json().await.expect("unreadable body");
    let tasks = body["tasks"].as_array().expect("tasks array missing");
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0]["id"].is_string());
    assert!(tasks[1]["error"].is_string());
}

#[tokio::test]
#[ignore]
async fn test_e2e_invalid_image_rejected() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new()
        .part(
            "image",
            reqwest::multipart::Part::bytes(vec![0u8; 100])
                .file_name("fake.png")
                .mime_str("image/png")
                .unwrap(),
        )
        .text("context", "junk bytes");

    let response = client
        .post(format!("{base_url}/tasks/upload"))
        .multipart(form)
        .send()
        .await
        .expect("Request failed");

    assert!(
        response.status().is_client_error(),
        "Should reject invalid image format, got status: {}",
        response.status()
    );
}
