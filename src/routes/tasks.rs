use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::ingest::{self, UploadItem};
use crate::models::api::{
    ApproveRequest, BulkUploadResponse, FinalizeItem, TaskResponse, UploadAccepted,
};
use crate::models::task::{Task, TaskStatus};

/// POST /tasks/upload — accept one image plus its surrounding context.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut context: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadInput(format!("multipart error: {e}")))?
    {
        match field.name() {
            Some("image") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadInput(format!("failed to read image: {e}")))?;
                image = Some(data.to_vec());
            }
            Some("context") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadInput(format!("failed to read context: {e}")))?;
                context = Some(text);
            }
            _ => {}
        }
    }

    let item = UploadItem {
        image: image.ok_or_else(|| ApiError::BadInput("missing 'image' field".to_string()))?,
        context: context
            .ok_or_else(|| ApiError::BadInput("missing 'context' field".to_string()))?,
    };

    let task = ingest::stage_task(
        state.store.as_ref(),
        state.blobs.as_ref(),
        state.broker.as_ref(),
        &item,
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            id: task.id,
            status: task.status,
        }),
    ))
}

/// POST /tasks/bulk-upload — repeated `images` / `contexts` fields, index-aligned.
pub async fn bulk_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BulkUploadResponse>), ApiError> {
    let mut images: Vec<Vec<u8>> = Vec::new();
    let mut contexts: Vec<String> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadInput(format!("multipart error: {e}")))?
    {
        match field.name() {
            Some("images") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadInput(format!("failed to read image: {e}")))?;
                images.push(data.to_vec());
            }
            Some("contexts") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadInput(format!("failed to read context: {e}")))?;
                contexts.push(text);
            }
            _ => {}
        }
    }

    if images.is_empty() {
        return Err(ApiError::BadInput("at least one image is required".to_string()));
    }
    if images.len() != contexts.len() {
        return Err(ApiError::BadInput(format!(
            "got {} images but {} contexts",
            images.len(),
            contexts.len()
        )));
    }

    let items: Vec<UploadItem> = images
        .into_iter()
        .zip(contexts)
        .map(|(image, context)| UploadItem { image, context })
        .collect();

    let response = ingest::stage_bulk(
        state.store.as_ref(),
        state.blobs.as_ref(),
        state.broker.as_ref(),
        &items,
    )
    .await;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(Json(task.into()))
}

/// PATCH /tasks/{id}/approve — record the human selection; requires DONE.
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    request.validate()?;

    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    let index = request.selected_alt_index.unwrap_or(1);
    let final_alt = resolve_final_alt(&task, index, &request.final_alt)?;

    let updated = state
        .store
        .approve(id, index, &final_alt, request.is_approved)
        .await?
        .ok_or_else(|| {
            ApiError::PreconditionFailed(format!(
                "task {id} is {} and cannot be approved",
                task.status
            ))
        })?;

    Ok(Json(updated.into()))
}

/// POST /tasks/finalize — batched approval. All items are validated before
/// any of them is applied.
pub async fn finalize(
    State(state): State<AppState>,
    Json(items): Json<Vec<FinalizeItem>>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    if items.is_empty() {
        return Err(ApiError::BadInput("at least one item is required".to_string()));
    }

    let mut resolved: Vec<(Uuid, i32, String)> = Vec::with_capacity(items.len());
    for item in &items {
        item.validate()?;

        let task = state.store.get(item.task_id).await?.ok_or_else(|| {
            ApiError::NotFound(format!("task {} not found", item.task_id))
        })?;

        let final_alt = resolve_final_alt(&task, item.selected_alt_index, &item.final_alt)?;
        resolved.push((item.task_id, item.selected_alt_index, final_alt));
    }

    let mut responses = Vec::with_capacity(resolved.len());
    for (task_id, index, final_alt) in resolved {
        let updated = state
            .store
            .approve(task_id, index, &final_alt, true)
            .await?
            .ok_or_else(|| {
                ApiError::PreconditionFailed(format!(
                    "task {task_id} left DONE before it could be finalized"
                ))
            })?;
        responses.push(updated.into());
    }

    Ok(Json(responses))
}

/// The selected candidate backs a blank `final_alt`; both require DONE.
fn resolve_final_alt(task: &Task, index: i32, final_alt: &str) -> Result<String, ApiError> {
    if task.status != TaskStatus::Done {
        return Err(ApiError::PreconditionFailed(format!(
            "task {} is {} and cannot be approved",
            task.id, task.status
        )));
    }

    let candidate = match index {
        1 => task.alt1.as_deref(),
        2 => task.alt2.as_deref(),
        _ => return Err(ApiError::BadInput("selected index must be 1 or 2".to_string())),
    };
    let candidate = candidate.ok_or_else(|| {
        ApiError::PreconditionFailed(format!("task {} has no candidate {index}", task.id))
    })?;

    let trimmed = final_alt.trim();
    Ok(if trimmed.is_empty() {
        candidate.to_string()
    } else {
        trimmed.to_string()
    })
}
