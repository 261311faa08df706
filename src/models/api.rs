use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::{Task, TaskStatus};

/// Full task view returned by `GET /tasks/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub image_key: String,
    pub context_text: String,
    pub status: TaskStatus,
    pub alt1: Option<String>,
    pub alt2: Option<String>,
    pub selected_index: Option<i32>,
    pub final_alt: Option<String>,
    pub is_approved: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            image_key: task.image_key,
            context_text: task.context_text,
            status: task.status,
            alt1: task.alt1,
            alt2: task.alt2,
            selected_index: task.selected_index,
            final_alt: task.final_alt,
            is_approved: task.is_approved,
            attempts: task.attempts,
            last_error: task.last_error,
            created_at: task.created_at,
            finished_at: task.finished_at,
        }
    }
}

/// Response after accepting a single upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub id: Uuid,
    pub status: TaskStatus,
}

/// Canonical bulk-upload response shape: `{"tasks": [...]}` with one
/// outcome per submitted item, index-aligned with the request.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkUploadResponse {
    pub tasks: Vec<BulkItemOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkItemOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `PATCH /tasks/{id}/approve`.
#[derive(Debug, Deserialize, Validate)]
pub struct ApproveRequest {
    /// Final alt text; blank falls back to the selected candidate.
    #[garde(length(max = 1024))]
    pub final_alt: String,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub is_approved: bool,

    /// 1 or 2; defaults to 1 when omitted.
    #[garde(inner(range(min = 1, max = 2)))]
    pub selected_alt_index: Option<i32>,
}

fn default_true() -> bool {
    true
}

/// One item of `POST /tasks/finalize`.
#[derive(Debug, Deserialize, Validate)]
pub struct FinalizeItem {
    #[garde(skip)]
    pub task_id: Uuid,

    #[garde(range(min = 1, max = 2))]
    pub selected_alt_index: i32,

    #[garde(length(max = 1024))]
    pub final_alt: String,
}
